//! Worker identity, progress events and the pull loop
//!
//! A worker repeatedly claims an item, runs the processor on it and records
//! the result, until the manifest has nothing left to hand out. Cancellation is
//! only checked between items; an item in flight always runs to completion.

use crate::error::Result;
use crate::processor::{invoke, ItemOutcome, Processor};
use crate::step::StepManifest;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};

/// Small-integer worker id assigned by the launcher
pub const WORKER_ID_ENV: &str = "PAGEMILL_WORKER_ID";

/// Set to `1` in processes started by the launcher
pub const WORKER_FLAG_ENV: &str = "PAGEMILL_WORKER";

/// Who this process is within a worker pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub id: String,
    /// Started by a launcher; progress is reported as events, not rendered
    pub is_worker: bool,
}

impl WorkerIdentity {
    /// Identity of a process that was not started by a launcher
    pub fn standalone() -> Self {
        Self {
            id: "0".to_string(),
            is_worker: false,
        }
    }

    pub fn from_env() -> Self {
        let id = std::env::var(WORKER_ID_ENV)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "0".to_string());
        let is_worker = std::env::var(WORKER_FLAG_ENV)
            .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
            .unwrap_or(false);
        Self { id, is_worker }
    }
}

/// One line of worker progress on stdout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkerEvent {
    Claimed {
        worker: String,
        input_path: String,
    },
    Completed {
        worker: String,
        input_path: String,
    },
    Failed {
        worker: String,
        input_path: String,
        error: String,
    },
    Finished {
        worker: String,
        processed: usize,
        failed: usize,
    },
}

impl WorkerEvent {
    pub fn worker(&self) -> &str {
        match self {
            WorkerEvent::Claimed { worker, .. }
            | WorkerEvent::Completed { worker, .. }
            | WorkerEvent::Failed { worker, .. }
            | WorkerEvent::Finished { worker, .. } => worker,
        }
    }

    /// Single-line JSON encoding
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Decode a line; anything that is not an event yields `None`
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if !line.starts_with('{') {
            return None;
        }
        serde_json::from_str(line).ok()
    }
}

/// Counts for one pull loop
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PullStats {
    pub processed: usize,
    pub failed: usize,
    /// Stopped because cancellation was requested, not because work ran out
    pub interrupted: bool,
}

/// Claim, process and record items until none are claimable or `cancel` is set
///
/// Inputs are resolved as `project_root/<input_path>`. Per-item failures are
/// recorded and counted; only manifest errors end the loop early.
pub fn run_pull_loop(
    manifest: &StepManifest,
    processor: &dyn Processor,
    project_root: &Path,
    output_folder: &Path,
    cancel: &AtomicBool,
    on_event: &mut dyn FnMut(&WorkerEvent),
) -> Result<PullStats> {
    let worker = manifest.worker_id().to_string();
    let mut stats = PullStats::default();

    info!(
        worker = %worker,
        step = manifest.step(),
        processor = processor.name(),
        manifest = %manifest.path().display(),
        "worker started"
    );

    loop {
        if cancel.load(Ordering::SeqCst) {
            info!(worker = %worker, "cancellation requested, not claiming more work");
            stats.interrupted = true;
            break;
        }

        let Some(input_path) = manifest.get_next_pending()? else {
            break;
        };
        on_event(&WorkerEvent::Claimed {
            worker: worker.clone(),
            input_path: input_path.clone(),
        });

        let input = project_root.join(&input_path);
        match invoke(processor, &input, output_folder) {
            ItemOutcome::Done { outputs, details } => {
                manifest.mark_done(&input_path, outputs, details)?;
                stats.processed += 1;
                on_event(&WorkerEvent::Completed {
                    worker: worker.clone(),
                    input_path,
                });
            },
            ItemOutcome::Failed {
                error: message,
                outputs,
                details,
            } => {
                error!(worker = %worker, input_path = %input_path, error = %message, "processing failed");
                manifest.mark_error_with(&input_path, message.clone(), outputs, details)?;
                stats.failed += 1;
                on_event(&WorkerEvent::Failed {
                    worker: worker.clone(),
                    input_path,
                    error: message,
                });
            },
        }
    }

    on_event(&WorkerEvent::Finished {
        worker: worker.clone(),
        processed: stats.processed,
        failed: stats.failed,
    });
    info!(worker = %worker, processed = stats.processed, failed = stats.failed, "worker finished");
    Ok(stats)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::processor::ProcessOutput;
    use crate::record::{Record, StepStatus};
    use serde_json::json;
    use serial_test::serial;
    use std::time::Duration;
    use tempfile::TempDir;

    fn seeded(dir: &TempDir, keys: &[&str]) -> StepManifest {
        let config = QueueConfig::default()
            .with_base_delay(Duration::from_millis(1))
            .with_lock_timeout(Duration::from_secs(5));
        let m = StepManifest::open(dir.path().join("m.jsonl"), "rotate", "7", config).unwrap();
        m.store()
            .upsert_many(keys.iter().map(|k| Record::file(*k)))
            .unwrap();
        m.initialize().unwrap();
        m
    }

    fn pick(input: &Path, _out: &Path) -> anyhow::Result<ProcessOutput> {
        let name = input.file_name().unwrap().to_string_lossy().into_owned();
        if name.starts_with("bad") {
            anyhow::bail!("cannot read {name}");
        }
        Ok(ProcessOutput::new(vec![format!("rotated/{name}")], json!({"angle": 90})))
    }

    #[test]
    fn drains_manifest_and_records_failures() {
        let dir = TempDir::new().unwrap();
        let m = seeded(&dir, &["a.jpg", "bad.jpg", "c.jpg"]);
        let cancel = AtomicBool::new(false);
        let mut events = Vec::new();

        let stats = run_pull_loop(&m, &pick, dir.path(), dir.path(), &cancel, &mut |e: &WorkerEvent| {
            events.push(e.clone())
        })
        .unwrap();

        assert_eq!(stats.processed, 2);
        assert_eq!(stats.failed, 1);
        assert!(!stats.interrupted);

        let bad = m.store().get("bad.jpg").unwrap().unwrap();
        assert_eq!(bad.status("rotate"), Some(StepStatus::Error));
        assert!(bad.steps["rotate"].error.as_deref().unwrap().contains("cannot read bad.jpg"));

        assert_eq!(events.len(), 7);
        assert_eq!(
            events.last(),
            Some(&WorkerEvent::Finished {
                worker: "7".into(),
                processed: 2,
                failed: 1
            })
        );
    }

    #[test]
    fn cancellation_stops_before_next_claim() {
        let dir = TempDir::new().unwrap();
        let m = seeded(&dir, &["a.jpg", "b.jpg", "c.jpg"]);
        let cancel = AtomicBool::new(false);

        let stop_after_first = |input: &Path, out: &Path| -> anyhow::Result<ProcessOutput> {
            cancel.store(true, Ordering::SeqCst);
            pick(input, out)
        };
        let stats =
            run_pull_loop(&m, &stop_after_first, dir.path(), dir.path(), &cancel, &mut |_: &WorkerEvent| {})
                .unwrap();

        assert_eq!(stats.processed, 1);
        assert!(stats.interrupted);
        assert_eq!(m.summary().unwrap().pending, 2);
    }

    #[test]
    fn events_round_trip_as_single_lines() {
        let event = WorkerEvent::Failed {
            worker: "2".into(),
            input_path: "documents/a.jpg".into(),
            error: "line one\nline two".into(),
        };
        let line = event.to_line();
        assert!(!line.contains('\n'));
        assert!(line.contains(r#""event":"failed""#));
        assert_eq!(WorkerEvent::parse(&line), Some(event));
        assert_eq!(WorkerEvent::parse("INFO something happened"), None);
        assert_eq!(WorkerEvent::parse(r#"{"event":"unknown"}"#), None);
    }

    #[test]
    #[serial]
    fn identity_comes_from_environment() {
        std::env::set_var(WORKER_ID_ENV, "3");
        std::env::set_var(WORKER_FLAG_ENV, "1");
        let identity = WorkerIdentity::from_env();
        std::env::remove_var(WORKER_ID_ENV);
        std::env::remove_var(WORKER_FLAG_ENV);

        assert_eq!(identity.id, "3");
        assert!(identity.is_worker);
        assert_eq!(WorkerIdentity::from_env(), WorkerIdentity::standalone());
    }
}
