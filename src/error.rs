//! Pipeline error taxonomy.
//!
//! Every fallible operation in the buffer, ingestion, and detection paths
//! returns [`Error`]. The variants map to how the caller is expected to react:
//! transient failures are retried or skipped for the cycle, validation and
//! not-found failures are reported to the caller, configuration failures stop
//! the process.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Network failure or timeout talking to the ingestion endpoint, the
    /// forecast service, or the notification webhook.
    #[error("transient I/O failure: {0}")]
    TransientIo(String),

    /// Malformed batch or missing required field.
    #[error("validation failed: {message}")]
    Validation {
        message: String,
        details: Vec<String>,
    },

    /// Missing or contradictory configuration.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("alert not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl Error {
    pub fn validation(message: impl Into<String>, details: Vec<String>) -> Self {
        Self::Validation {
            message: message.into(),
            details,
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientIo(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::TransientIo(err.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.into())
    }
}

impl From<r2d2::Error> for Error {
    fn from(err: r2d2::Error) -> Self {
        Self::Storage(err.into())
    }
}
