//! Queue tunables
//!
//! Defaults suit a slow per-item operation such as a model inference call.
//! Every value can be overridden from the environment so that all worker
//! processes of one run agree on them without extra plumbing.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default age after which a `processing` claim is considered abandoned.
pub const DEFAULT_PROCESSING_TIMEOUT: Duration = Duration::from_secs(300);

/// Default window in which `get_next_pending` keeps retrying.
pub const DEFAULT_CLAIM_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of claim attempts before reporting "no work right now".
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default first backoff step; doubled on every retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);

/// Default upper bound of the random jitter added to each backoff step.
pub const DEFAULT_MAX_JITTER: Duration = Duration::from_millis(100);

/// Default bound on waiting for the manifest lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Default pause between non-blocking lock attempts.
pub const DEFAULT_LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Timing knobs for the claim state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    #[serde(with = "secs")]
    pub processing_timeout: Duration,
    #[serde(with = "secs")]
    pub claim_timeout: Duration,
    pub max_retries: u32,
    #[serde(with = "millis")]
    pub base_delay: Duration,
    #[serde(with = "millis")]
    pub max_jitter: Duration,
    #[serde(with = "secs")]
    pub lock_timeout: Duration,
    #[serde(with = "millis")]
    pub lock_poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            processing_timeout: DEFAULT_PROCESSING_TIMEOUT,
            claim_timeout: DEFAULT_CLAIM_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_jitter: DEFAULT_MAX_JITTER,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            lock_poll_interval: DEFAULT_LOCK_POLL_INTERVAL,
        }
    }
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by environment variables
    pub fn from_env() -> Self {
        Self::default().merge_env()
    }

    /// Override fields from the environment
    ///
    /// - `PAGEMILL_PROCESSING_TIMEOUT` (seconds)
    /// - `PAGEMILL_CLAIM_TIMEOUT` (seconds)
    /// - `PAGEMILL_MAX_RETRIES`
    /// - `PAGEMILL_BASE_DELAY_MS`
    /// - `PAGEMILL_LOCK_TIMEOUT` (seconds)
    ///
    /// Unparseable values are ignored with a warning.
    pub fn merge_env(mut self) -> Self {
        if let Some(secs) = env_number("PAGEMILL_PROCESSING_TIMEOUT") {
            self.processing_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_number("PAGEMILL_CLAIM_TIMEOUT") {
            self.claim_timeout = Duration::from_secs(secs);
        }
        if let Some(retries) = env_number("PAGEMILL_MAX_RETRIES") {
            self.max_retries = u32::try_from(retries).unwrap_or(u32::MAX);
        }
        if let Some(ms) = env_number("PAGEMILL_BASE_DELAY_MS") {
            self.base_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = env_number("PAGEMILL_LOCK_TIMEOUT") {
            self.lock_timeout = Duration::from_secs(secs);
        }
        self
    }

    pub fn with_processing_timeout(mut self, timeout: Duration) -> Self {
        self.processing_timeout = timeout;
        self
    }

    pub fn with_claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_jitter(mut self, jitter: Duration) -> Self {
        self.max_jitter = jitter;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Backoff before retry number `attempt` (0-based): `base_delay * 2^attempt + jitter`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << attempt.min(16));
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::random::<u64>() % (jitter_ms + 1))
        };
        exp + jitter
    }
}

fn env_number(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring non-numeric queue setting");
            None
        },
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn defaults_match_documented_values() {
        let config = QueueConfig::default();
        assert_eq!(config.processing_timeout, Duration::from_secs(300));
        assert_eq!(config.claim_timeout, Duration::from_secs(30));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_delay, Duration::from_millis(100));
    }

    #[test]
    fn backoff_doubles_and_stays_within_jitter() {
        let config = QueueConfig::default()
            .with_base_delay(Duration::from_millis(10))
            .with_max_jitter(Duration::from_millis(5));

        for attempt in 0..4 {
            let base = Duration::from_millis(10 * (1 << attempt));
            let delay = config.backoff(attempt);
            assert!(delay >= base, "attempt {attempt}: {delay:?} < {base:?}");
            assert!(delay <= base + Duration::from_millis(5));
        }
    }

    #[test]
    fn backoff_without_jitter_is_exact() {
        let config = QueueConfig::default()
            .with_base_delay(Duration::from_millis(7))
            .with_max_jitter(Duration::ZERO);
        assert_eq!(config.backoff(2), Duration::from_millis(28));
    }

    #[test]
    #[serial]
    fn env_overrides_are_applied() {
        std::env::set_var("PAGEMILL_PROCESSING_TIMEOUT", "12");
        std::env::set_var("PAGEMILL_MAX_RETRIES", "9");
        std::env::set_var("PAGEMILL_BASE_DELAY_MS", "oops");

        let config = QueueConfig::from_env();

        std::env::remove_var("PAGEMILL_PROCESSING_TIMEOUT");
        std::env::remove_var("PAGEMILL_MAX_RETRIES");
        std::env::remove_var("PAGEMILL_BASE_DELAY_MS");

        assert_eq!(config.processing_timeout, Duration::from_secs(12));
        assert_eq!(config.max_retries, 9);
        assert_eq!(config.base_delay, DEFAULT_BASE_DELAY);
    }

    #[test]
    fn deserializes_partial_toml_style_values() {
        let config: QueueConfig =
            serde_json::from_str(r#"{"processing_timeout": 900, "base_delay": 250}"#).unwrap();
        assert_eq!(config.processing_timeout, Duration::from_secs(900));
        assert_eq!(config.base_delay, Duration::from_millis(250));
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
    }
}
