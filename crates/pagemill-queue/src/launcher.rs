//! Worker pool launcher
//!
//! Starts N copies of a worker command against the same manifest. The
//! launcher holds no queue state: it numbers the children, scrapes their
//! stdout for [`WorkerEvent`] lines to drive a progress display, and re-logs
//! everything else. A child that fails is reported, never restarted; its
//! unfinished items stay in the manifest for the other workers or a later run.

use crate::error::{QueueError, Result};
use crate::worker::{WorkerEvent, WORKER_FLAG_ENV, WORKER_ID_ENV};
use serde::Serialize;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub workers: usize,
    /// Items expected across all workers, for sizing progress
    pub total_files: usize,
    /// Extra environment for every child
    pub envs: Vec<(String, String)>,
}

impl LaunchOptions {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, workers: usize) -> Self {
        Self {
            program: program.into(),
            args,
            workers: workers.max(1),
            total_files: 0,
            envs: Vec::new(),
        }
    }

    pub fn with_total_files(mut self, total: usize) -> Self {
        self.total_files = total;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Items worker `index` is expected to handle; shares differ by at most one
    pub fn expected_share(&self, index: usize) -> usize {
        expected_share(self.total_files, self.workers, index)
    }
}

pub fn expected_share(total: usize, workers: usize, index: usize) -> usize {
    let workers = workers.max(1);
    total / workers + usize::from(index < total % workers)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerExit {
    pub worker: usize,
    pub success: bool,
    pub code: Option<i32>,
    pub processed: usize,
    pub failed: usize,
    /// Set when the child could not be started at all
    pub spawn_error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LaunchSummary {
    pub workers: Vec<WorkerExit>,
}

impl LaunchSummary {
    pub fn processed(&self) -> usize {
        self.workers.iter().map(|w| w.processed).sum()
    }

    pub fn failed(&self) -> usize {
        self.workers.iter().map(|w| w.failed).sum()
    }

    pub fn failed_workers(&self) -> impl Iterator<Item = &WorkerExit> {
        self.workers.iter().filter(|w| !w.success)
    }

    pub fn all_succeeded(&self) -> bool {
        self.workers.iter().all(|w| w.success)
    }
}

/// Run the pool to completion, calling `on_event` for every scraped event
///
/// Fails only if no worker could be started.
pub async fn launch(
    options: &LaunchOptions,
    mut on_event: impl FnMut(usize, &WorkerEvent),
) -> Result<LaunchSummary> {
    let (tx, mut rx) = mpsc::unbounded_channel::<(usize, WorkerEvent)>();
    let mut exits: Vec<WorkerExit> = (0..options.workers)
        .map(|worker| WorkerExit {
            worker,
            ..Default::default()
        })
        .collect();
    let mut running = Vec::new();

    for index in 0..options.workers {
        let mut command = Command::new(&options.program);
        command
            .args(&options.args)
            .env(WORKER_ID_ENV, index.to_string())
            .env(WORKER_FLAG_ENV, "1")
            .envs(options.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                error!(worker = index, error = %err, program = %options.program.display(), "failed to start worker");
                exits[index].spawn_error = Some(err.to_string());
                continue;
            },
        };
        info!(worker = index, pid = child.id(), expected = options.expected_share(index), "worker started");

        if let Some(stdout) = child.stdout.take() {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    match WorkerEvent::parse(&line) {
                        Some(event) => {
                            let _ = tx.send((index, event));
                        },
                        None if !line.trim().is_empty() => info!(worker = index, "{line}"),
                        None => {},
                    }
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        info!(worker = index, "{line}");
                    }
                }
            });
        }

        running.push(tokio::spawn(async move { (index, child.wait().await) }));
    }
    drop(tx);

    if running.is_empty() {
        return Err(QueueError::Spawn {
            worker: 0,
            message: format!("none of {} workers could be started", options.workers),
        });
    }

    while let Some((index, event)) = rx.recv().await {
        let exit = &mut exits[index];
        match &event {
            WorkerEvent::Completed { .. } => exit.processed += 1,
            WorkerEvent::Failed { .. } => exit.failed += 1,
            WorkerEvent::Finished {
                processed, failed, ..
            } => {
                exit.processed = *processed;
                exit.failed = *failed;
            },
            WorkerEvent::Claimed { .. } => {},
        }
        on_event(index, &event);
    }

    for handle in running {
        let (index, status) = handle.await.map_err(|e| QueueError::Spawn {
            worker: 0,
            message: e.to_string(),
        })?;
        let exit = &mut exits[index];
        match status {
            Ok(status) => {
                exit.success = status.success();
                exit.code = status.code();
                if !exit.success {
                    warn!(worker = index, code = ?status.code(), "worker exited with failure");
                }
            },
            Err(err) => {
                warn!(worker = index, error = %err, "could not wait for worker");
            },
        }
    }

    let summary = LaunchSummary { workers: exits };
    info!(
        workers = options.workers,
        processed = summary.processed(),
        failed = summary.failed(),
        "worker pool finished"
    );
    Ok(summary)
}
