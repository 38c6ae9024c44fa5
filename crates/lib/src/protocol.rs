//! Chat backend wire types: request body construction and reply parsing.

use crate::config::ProductConfig;
use crate::conversation::{ContextInfo, Message, Sender};
use crate::error::ChatError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One `conversation_history` item: `{ role, content, timestamp }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&Message> for HistoryEntry {
    fn from(m: &Message) -> Self {
        Self {
            role: match m.sender {
                Sender::User => Role::User,
                Sender::Bot => Role::Assistant,
            },
            content: m.text.clone(),
            timestamp: m.timestamp,
        }
    }
}

pub fn history_from(messages: &[Message]) -> Vec<HistoryEntry> {
    messages.iter().map(HistoryEntry::from).collect()
}

/// Builds the JSON body of a chat request. Specializations add product fields on top of the base.
pub trait BodyBuilder: Send + Sync {
    fn build(&self, message: &str, history: &[HistoryEntry]) -> Value;
}

/// `{ message, conversation_history }`.
#[derive(Debug, Clone, Default)]
pub struct DefaultBodyBuilder;

impl BodyBuilder for DefaultBodyBuilder {
    fn build(&self, message: &str, history: &[HistoryEntry]) -> Value {
        json!({
            "message": message,
            "conversation_history": history,
        })
    }
}

/// Default body plus `product`, `version` and `context`.
#[derive(Debug, Clone)]
pub struct ProductBodyBuilder {
    product: ProductConfig,
}

impl ProductBodyBuilder {
    pub fn new(product: ProductConfig) -> Self {
        Self { product }
    }
}

impl BodyBuilder for ProductBodyBuilder {
    fn build(&self, message: &str, history: &[HistoryEntry]) -> Value {
        let mut body = DefaultBodyBuilder.build(message, history);
        body["product"] = Value::String(self.product.name.clone());
        if let Some(ref version) = self.product.version {
            body["version"] = Value::String(version.clone());
        }
        if let Some(ref context) = self.product.context {
            body["context"] = context.clone();
        }
        body
    }
}

/// Body builder for a config: product-specific when `product` is set.
pub fn body_builder_for(product: Option<&ProductConfig>) -> Box<dyn BodyBuilder> {
    match product {
        Some(p) => Box::new(ProductBodyBuilder::new(p.clone())),
        None => Box::new(DefaultBodyBuilder),
    }
}

/// Parsed chat reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatReply {
    pub text: String,
    pub sources: Vec<Value>,
    pub confidence: Option<f64>,
    pub response_time_ms: Option<f64>,
}

fn first_of<'a>(body: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| body.get(*k))
        .find(|v| !v.is_null())
}

impl ChatReply {
    /// Accepts text under `message|response|text`. `success: false` or `status: "error"` is an
    /// application failure; a body without reply text is malformed.
    pub fn from_json(body: &Value) -> Result<Self, ChatError> {
        let flagged = body.get("success").and_then(Value::as_bool) == Some(false)
            || body.get("status").and_then(Value::as_str) == Some("error");
        if flagged {
            let reason = first_of(body, &["error", "detail", "message"])
                .and_then(Value::as_str)
                .unwrap_or("request failed")
                .to_string();
            return Err(ChatError::Application(reason));
        }

        let text = first_of(body, &["message", "response", "text"])
            .and_then(Value::as_str)
            .ok_or_else(|| ChatError::MalformedResponse("no reply text in response".to_string()))?
            .to_string();

        let sources = match first_of(body, &["sources", "context_used"]) {
            Some(Value::Array(items)) => items.clone(),
            Some(other) => vec![other.clone()],
            None => Vec::new(),
        };

        Ok(Self {
            text,
            sources,
            confidence: body.get("confidence").and_then(Value::as_f64),
            response_time_ms: first_of(body, &["response_time_ms", "processing_time"])
                .and_then(Value::as_f64),
        })
    }

    /// Metadata stored on the bot message, including the context window used for the request.
    pub fn metadata(&self, context: &ContextInfo) -> Value {
        let mut meta = json!({
            "sources": self.sources,
            "contextWindow": context,
        });
        if let Some(c) = self.confidence {
            meta["confidence"] = json!(c);
        }
        if let Some(t) = self.response_time_ms {
            meta["responseTimeMs"] = json!(t);
        }
        meta
    }
}
