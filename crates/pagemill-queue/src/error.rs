//! Error types for the manifest queue
//!
//! Errors fall into three groups that callers treat differently:
//!
//! - **Retryable contention** ([`QueueError::LockTimeout`]): back off and try again.
//! - **Structural** (malformed manifest lines, I/O and serialization failures):
//!   stop the process after a best-effort flush.
//! - **Interruption** ([`QueueError::Interrupted`]): the operator asked us to stop.
//!
//! Per-item processor failures are not errors at this level; they are recorded
//! on the item and counted.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for queue operations
pub type Result<T> = std::result::Result<T, QueueError>;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Timed out after {waited:?} waiting for lock '{}'", path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("Malformed record in '{}' at line {line}: {message}", path.display())]
    MalformedRecord {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("Manifest I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Could not persist '{}': {source}", path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Failed to launch worker {worker}: {message}")]
    Spawn { worker: usize, message: String },

    #[error("Interrupted by operator")]
    Interrupted,
}

impl QueueError {
    /// Whether the caller may back off and retry the same operation
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueueError::LockTimeout { .. })
    }

    pub(crate) fn malformed(path: impl Into<PathBuf>, line: usize, message: impl ToString) -> Self {
        Self::MalformedRecord {
            path: path.into(),
            line,
            message: message.to_string(),
        }
    }
}
