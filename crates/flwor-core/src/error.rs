use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Canonical result for core.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum Error {
    /// Detected while compiling/optimizing (type mismatch, constant failure, ...).
    #[error("static error [{code}]: {message}")]
    Static { code: String, message: String },

    /// Detected while evaluating.
    #[error("dynamic error [{code}]: {message}")]
    Dynamic { code: String, message: String },

    /// The stop check aborted evaluation between two items.
    #[error("evaluation interrupted: {0}")]
    Interrupted(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Hashing error: {0}")]
    Hash(String),

    #[error("Internal invariant failed: {0}")]
    Invariant(String),
}

impl Error {
    pub fn static_err(code: &str, message: impl Into<String>) -> Self {
        Error::Static {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn dynamic(code: &str, message: impl Into<String>) -> Self {
        Error::Dynamic {
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// Query errors may be deferred by FLWOR error recovery; engine-level
    /// failures (interrupts, broken invariants) never are.
    pub fn is_checked(&self) -> bool {
        matches!(self, Error::Static { .. } | Error::Dynamic { .. })
    }

    /// Error code for query errors, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            Error::Static { code, .. } | Error::Dynamic { code, .. } => Some(code),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Hash(e.to_string())
    }
}
