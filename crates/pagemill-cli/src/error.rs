//! Error types for the pagemill CLI
//!
//! Messages are shown to the operator as-is, so each one says what to check
//! or run next.

use pagemill_queue::QueueError;
use thiserror::Error;

/// Result type alias for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

#[derive(Error, Debug)]
pub enum CliError {
    /// Manifest or queue operation failed
    #[error("{0}")]
    Queue(QueueError),

    /// Another process is holding the manifest lock for too long
    #[error("{0}. Another pagemill process may be stuck; check for running workers.")]
    Busy(QueueError),

    /// Malformed manifest line
    #[error("{0}. Fix or remove the offending line; the manifest is not rewritten while it is unreadable.")]
    Corrupt(QueueError),

    /// Required file is missing
    #[error("File not found: '{0}'. Verify the path exists and you have read permissions.")]
    FileNotFound(String),

    /// Processor selection or template is unusable
    #[error("Invalid processor: {0}. Use '--processor copy' or '--processor command --exec \"prog {{input}} {{output}}\"'.")]
    InvalidProcessor(String),

    /// Configuration is missing or invalid
    #[error("Configuration error: {0}. Check pagemill.toml and your environment variables.")]
    Config(String),

    /// Stopped on operator request after flushing progress
    #[error("Interrupted. Progress was saved; run the same command again to resume.")]
    Interrupted,

    /// Some worker processes exited with a failure
    #[error("{failed} of {total} workers failed. Their unfinished items stay pending; run again to finish them.")]
    WorkersFailed { failed: usize, total: usize },

    /// File system operation failed
    #[error("File operation failed: {0}. Check file permissions and disk space.")]
    Io(#[from] std::io::Error),

    /// JSON encoding failed
    #[error("Failed to encode JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("Failed to parse pagemill.toml: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Logging could not be set up
    #[error("Logging setup failed: {0}")]
    Logging(#[from] pagemill_common::CommonError),

    /// Generic anyhow error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<QueueError> for CliError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Interrupted => Self::Interrupted,
            QueueError::LockTimeout { .. } => Self::Busy(err),
            QueueError::MalformedRecord { .. } => Self::Corrupt(err),
            QueueError::NotFound(what) => Self::FileNotFound(what),
            other => Self::Queue(other),
        }
    }
}

impl CliError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn invalid_processor(msg: impl Into<String>) -> Self {
        Self::InvalidProcessor(msg.into())
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::InvalidProcessor(_) | CliError::Config(_) => 2,
            _ => 1,
        }
    }
}
