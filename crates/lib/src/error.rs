//! Error taxonomy shared by every layer of the chat client.
//!
//! Transport-level kinds (`Timeout`, `Http`, `MalformedResponse`, `Transport`) come out of the
//! executor and pass through retry unchanged. Readiness wraps wake failures in
//! `ServerStartupFailed`. Only the orchestrator turns errors into user-visible text, via
//! [`ChatError::fallback_category`].

/// Errors produced by the request, readiness and conversation layers.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChatError {
    #[error("request timed out")]
    Timeout,
    #[error("http error {status}: {body}")]
    Http { status: u16, body: String },
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("network error: {0}")]
    Transport(String),
    #[error("server startup failed: {source}")]
    ServerStartupFailed {
        #[source]
        source: Box<ChatError>,
    },
    #[error("server wake-up already in progress")]
    AlreadyWaking,
    #[error("backend reported failure: {0}")]
    Application(String),
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("a message is already being sent")]
    Busy,
}

/// User-facing fallback buckets. Every failed turn is rendered with exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackCategory {
    /// Timeouts and network failures.
    Connectivity,
    /// The backend is cold or still starting.
    Starting,
    /// Anything else.
    Generic,
}

impl ChatError {
    pub fn startup_failed(cause: ChatError) -> Self {
        ChatError::ServerStartupFailed {
            source: Box::new(cause),
        }
    }

    pub fn fallback_category(&self) -> FallbackCategory {
        match self {
            ChatError::Timeout | ChatError::Transport(_) => FallbackCategory::Connectivity,
            ChatError::ServerStartupFailed { .. } | ChatError::AlreadyWaking => {
                FallbackCategory::Starting
            }
            // Gateways in front of a scaled-to-zero service answer with these while it boots.
            ChatError::Http { status, .. } if matches!(status, 502..=504) => {
                FallbackCategory::Starting
            }
            _ => FallbackCategory::Generic,
        }
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ChatError::Timeout
        } else if e.is_decode() {
            ChatError::MalformedResponse(e.to_string())
        } else {
            ChatError::Transport(e.to_string())
        }
    }
}
