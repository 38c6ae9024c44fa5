//! Single-attempt request execution with a timeout guard.

use super::transport::{HttpRequest, HttpResponse, Method, Transport};
use crate::error::ChatError;
use std::sync::Arc;
use std::time::Duration;

/// Per-call options: method, extra headers and optional JSON body.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl RequestOptions {
    pub fn get() -> Self {
        Self {
            method: Method::Get,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post_json(body: serde_json::Value) -> Self {
        Self {
            method: Method::Post,
            headers: Vec::new(),
            body: Some(body),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Parsed success: HTTP status and JSON body.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

/// Issues exactly one call per invocation; no retries, no state.
#[derive(Clone)]
pub struct RequestExecutor {
    transport: Arc<dyn Transport>,
    base_url: String,
    default_headers: Vec<(String, String)>,
    timeout: Duration,
}

impl RequestExecutor {
    pub fn new(transport: Arc<dyn Transport>, base_url: impl Into<String>, timeout: Duration) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            transport,
            base_url,
            default_headers: Vec::new(),
            timeout,
        }
    }

    /// Headers added to every request, before per-call headers.
    pub fn with_headers(mut self, headers: impl IntoIterator<Item = (String, String)>) -> Self {
        self.default_headers.extend(headers);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Absolute URLs pass through; paths are joined onto the base URL.
    pub fn url(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_string()
        } else if endpoint.starts_with('/') {
            format!("{}{}", self.base_url, endpoint)
        } else {
            format!("{}/{}", self.base_url, endpoint)
        }
    }

    async fn send_once(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<HttpResponse, ChatError> {
        let mut headers = self.default_headers.clone();
        headers.extend(options.headers);
        let request = HttpRequest {
            method: options.method,
            url: self.url(endpoint),
            headers,
            body: options.body,
        };
        let res = match tokio::time::timeout(self.timeout, self.transport.send(request)).await {
            Ok(res) => res?,
            Err(_) => {
                log::debug!("request to {} exceeded {:?}", endpoint, self.timeout);
                return Err(ChatError::Timeout);
            }
        };
        if !(200..300).contains(&res.status) {
            return Err(ChatError::Http {
                status: res.status,
                body: res.body,
            });
        }
        Ok(res)
    }

    /// One call; the body must be JSON.
    pub async fn execute(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<ApiResponse, ChatError> {
        let res = self.send_once(endpoint, options).await?;
        let body = serde_json::from_str(&res.body)
            .map_err(|e| ChatError::MalformedResponse(e.to_string()))?;
        Ok(ApiResponse {
            status: res.status,
            body,
        })
    }

    /// GET with health semantics: any 2xx succeeds, whatever the body.
    pub async fn probe(&self, endpoint: &str) -> Result<u16, ChatError> {
        let res = self.send_once(endpoint, RequestOptions::get()).await?;
        Ok(res.status)
    }
}
