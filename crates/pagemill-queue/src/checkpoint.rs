//! Append-only progress log
//!
//! One [`Checkpoint`] per line, written after every batch. The log is only
//! used to tell the operator where a previous run stopped; resuming relies on
//! the output manifest alone, so a torn last line is skipped rather than
//! reported.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub timestamp: DateTime<Utc>,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub total: usize,
}

impl Checkpoint {
    pub fn now(processed: usize, skipped: usize, failed: usize, total: usize) -> Self {
        Self {
            timestamp: Utc::now(),
            processed,
            skipped,
            failed,
            total,
        }
    }

    /// Items accounted for, whatever their outcome
    pub fn handled(&self) -> usize {
        self.processed + self.skipped + self.failed
    }

    pub fn percent_complete(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.handled() as f64 * 100.0 / self.total as f64
    }
}

#[derive(Debug, Clone)]
pub struct ProgressLog {
    path: PathBuf,
}

impl ProgressLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, checkpoint: &Checkpoint) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        serde_jsonlines::append_json_lines(&self.path, [checkpoint])?;
        debug!(log = %self.path.display(), handled = checkpoint.handled(), total = checkpoint.total, "checkpoint written");
        Ok(())
    }

    /// Most recent readable checkpoint, if any
    pub fn last(&self) -> std::io::Result<Option<Checkpoint>> {
        if !self.path.exists() {
            return Ok(None);
        }
        Ok(serde_jsonlines::json_lines::<Checkpoint, _>(&self.path)?
            .filter_map(|line| line.ok())
            .last())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn last_returns_latest_checkpoint() {
        let dir = TempDir::new().unwrap();
        let log = ProgressLog::new(dir.path().join("crop_progress.jsonl"));
        assert_eq!(log.last().unwrap(), None);

        log.append(&Checkpoint::now(2, 0, 0, 10)).unwrap();
        log.append(&Checkpoint::now(4, 1, 1, 10)).unwrap();

        let last = log.last().unwrap().unwrap();
        assert_eq!(last.handled(), 6);
        assert_eq!(std::fs::read_to_string(log.path()).unwrap().lines().count(), 2);
    }

    #[test]
    fn torn_trailing_line_is_ignored() {
        let dir = TempDir::new().unwrap();
        let log = ProgressLog::new(dir.path().join("p.jsonl"));
        log.append(&Checkpoint::now(3, 0, 0, 5)).unwrap();

        let mut file = std::fs::OpenOptions::new().append(true).open(log.path()).unwrap();
        write!(file, "{{\"timestamp\":\"2024-").unwrap();

        assert_eq!(log.last().unwrap().unwrap().processed, 3);
    }

    #[test]
    fn percent_of_empty_run_is_complete() {
        assert_eq!(Checkpoint::now(0, 0, 0, 0).percent_complete(), 100.0);
        assert_eq!(Checkpoint::now(1, 0, 1, 4).percent_complete(), 50.0);
    }
}
