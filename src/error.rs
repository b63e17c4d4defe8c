//! Error types for turnwise
//!
//! Every fallible operation in the crate returns [`Result<T>`]. The variants map
//! onto the failure kinds the orchestration core distinguishes: transport and
//! upstream failures from the wire adapter, decode failures for malformed
//! payloads, contained tool failures (validation, policy, confirmation,
//! execution) and the router's quota/exhaustion escalations.

use thiserror::Error;

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for all turnwise operations
#[derive(Error, Debug)]
pub enum Error {
    /// Network-level failure (connection refused, reset, DNS, body read)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Request exceeded the configured timeout
    #[error("Request timeout")]
    Timeout,

    /// Backend answered with a non-success status
    #[error("Upstream error ({status} {status_text}): {message}")]
    Upstream {
        status: u16,
        status_text: String,
        message: String,
    },

    /// Payload was not valid JSON in the expected shape
    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Tool arguments failed schema validation
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Denied by policy: {0}")]
    PolicyDenied(String),

    #[error("Confirmation denied: {0}")]
    ConfirmationDenied(String),

    #[error("Tool execution error: {0}")]
    ToolExecution(String),

    /// The active backend does not provide this capability
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Quota pressure persisted after the fallback model was tried
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Retryable failures exhausted the attempt ceiling
    #[error("Retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// The owning turn was aborted
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Error: {0}")]
    Other(String),
}

impl Error {
    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }

    pub fn upstream(status: u16, status_text: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Upstream {
            status,
            status_text: status_text.into(),
            message: message.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn policy_denied(msg: impl Into<String>) -> Self {
        Error::PolicyDenied(msg.into())
    }

    pub fn confirmation_denied(msg: impl Into<String>) -> Self {
        Error::ConfirmationDenied(msg.into())
    }

    pub fn tool(msg: impl Into<String>) -> Self {
        Error::ToolExecution(msg.into())
    }

    pub fn unsupported(operation: impl Into<String>) -> Self {
        Error::UnsupportedOperation(operation.into())
    }

    pub fn quota_exceeded(msg: impl Into<String>) -> Self {
        Error::QuotaExceeded(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    pub fn timeout() -> Self {
        Error::Timeout
    }

    /// HTTP status carried by an upstream failure, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Upstream { status, .. } => Some(*status),
            Error::RetriesExhausted { source, .. } => source.status(),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout
        } else {
            Error::Transport(err.to_string())
        }
    }
}
