// src/error.rs
// Typed errors shared across the chat execution core

use thiserror::Error;

/// Error raised by a provider while streaming a response.
///
/// Retryable variants feed the engine's backoff loop; `Fatal` aborts the
/// turn immediately.
#[derive(Debug, Clone, Error)]
pub enum ProviderStreamError {
    #[error("provider stream interrupted: {0}")]
    Interrupted(String),
    #[error("provider returned HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("provider stream failed: {0}")]
    Fatal(String),
}

impl ProviderStreamError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderStreamError::Interrupted(_) => true,
            // 429 and 5xx are transient; everything else is a request problem
            ProviderStreamError::Http { status, .. } => *status == 429 || *status >= 500,
            ProviderStreamError::Fatal(_) => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limit timeout for {scope}: waited {waited_secs:.1}s without admission")]
    Timeout { scope: String, waited_secs: f64 },
    #[error("rate limit denied for {scope}: {field} is set to 0")]
    Denied { scope: String, field: &'static str },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("illegal chat state transition {from} -> {to} for chat {chat_id}")]
    IllegalTransition {
        chat_id: String,
        from: String,
        to: String,
    },
    #[error("chat {0} not found")]
    ChatNotFound(String),
    #[error("message {0} not found")]
    MessageNotFound(String),
    #[error("malformed message id: {0}")]
    MalformedMessageId(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("no worker became available within {0:.0}s")]
    AcquireTimeout(f64),
    #[error("worker {0} crashed: {1}")]
    Crashed(u32, String),
    #[error("worker protocol violation: {0}")]
    Protocol(String),
    #[error("worker io error: {0}")]
    Io(#[from] std::io::Error),
}
