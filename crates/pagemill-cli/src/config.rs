//! Configuration management for the pagemill CLI
//!
//! Sources, lowest precedence first: built-in defaults, `pagemill.toml` (in
//! the working directory or given with `--config`), then environment
//! variables. `.env` files are loaded into the environment before any of this
//! runs.
//!
//! ```toml
//! batch_size = 50
//! workers = 4
//!
//! [queue]
//! processing_timeout = 900   # seconds
//! base_delay = 250           # milliseconds
//! ```

use crate::error::{CliError, Result};
use pagemill_queue::QueueConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ============================================================================
// CLI Configuration Constants
// ============================================================================

/// Configuration file looked up in the working directory
pub const CONFIG_FILE: &str = "pagemill.toml";

/// Default number of items between batch checkpoints
pub const DEFAULT_BATCH_SIZE: usize = pagemill_queue::batch::DEFAULT_BATCH_SIZE;

/// Disables progress bars when set to a non-empty value
pub const NO_PROGRESS_ENV: &str = "PAGEMILL_NO_PROGRESS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub batch_size: usize,

    /// Worker processes for `pagemill run`
    pub workers: usize,

    /// Render progress bars
    pub progress: bool,

    pub queue: QueueConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            workers: default_workers(),
            progress: true,
            queue: QueueConfig::default(),
        }
    }
}

/// One fewer than the available CPUs, at least one
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1).max(1))
        .unwrap_or(1)
}

impl Config {
    /// Load from `explicit`, or `pagemill.toml` if present, then apply the environment
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let config = match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(CliError::FileNotFound(path.display().to_string()));
                }
                Self::from_file(path)?
            },
            None if Path::new(CONFIG_FILE).exists() => Self::from_file(Path::new(CONFIG_FILE))?,
            None => Self::default(),
        };
        Ok(config.merge_env())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&raw)?;
        tracing::debug!(path = %path.display(), "configuration file loaded");
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        if config.batch_size == 0 {
            return Err(CliError::config("batch_size must be at least 1"));
        }
        if config.workers == 0 {
            return Err(CliError::config("workers must be at least 1"));
        }
        Ok(config)
    }

    /// Override from `PAGEMILL_BATCH_SIZE`, `PAGEMILL_WORKERS`,
    /// `PAGEMILL_NO_PROGRESS` and the queue's own variables
    pub fn merge_env(mut self) -> Self {
        if let Some(size) = env_usize("PAGEMILL_BATCH_SIZE").filter(|n| *n > 0) {
            self.batch_size = size;
        }
        if let Some(workers) = env_usize("PAGEMILL_WORKERS").filter(|n| *n > 0) {
            self.workers = workers;
        }
        if std::env::var(NO_PROGRESS_ENV).is_ok_and(|v| !v.is_empty() && v != "0") {
            self.progress = false;
        }
        self.queue = self.queue.merge_env();
        self
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok()?.trim().parse().ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::time::Duration;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.batch_size, 100);
        assert!(config.workers >= 1);
        assert!(config.progress);
    }

    #[test]
    fn test_partial_toml() {
        let config = Config::from_toml_str(
            r#"
            workers = 3

            [queue]
            processing_timeout = 900
            base_delay = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.workers, 3);
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.queue.processing_timeout, Duration::from_secs(900));
        assert_eq!(config.queue.base_delay, Duration::from_millis(250));
    }

    #[test]
    fn test_rejects_zero_batch_size() {
        let err = Config::from_toml_str("batch_size = 0").unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(Config::from_toml_str("batch_size = \"many\"").is_err());
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        std::env::set_var("PAGEMILL_WORKERS", "6");
        std::env::set_var(NO_PROGRESS_ENV, "1");
        std::env::set_var("PAGEMILL_PROCESSING_TIMEOUT", "42");

        let config = Config::from_toml_str("workers = 2").unwrap().merge_env();

        std::env::remove_var("PAGEMILL_WORKERS");
        std::env::remove_var(NO_PROGRESS_ENV);
        std::env::remove_var("PAGEMILL_PROCESSING_TIMEOUT");

        assert_eq!(config.workers, 6);
        assert!(!config.progress);
        assert_eq!(config.queue.processing_timeout, Duration::from_secs(42));
    }

    #[test]
    fn test_missing_explicit_file() {
        let err = Config::load(Some(Path::new("/no/such/pagemill.toml"))).unwrap_err();
        assert!(matches!(err, CliError::FileNotFound(_)));
    }
}
