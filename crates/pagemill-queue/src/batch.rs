//! Stage-level batch driver
//!
//! A batch run diffs what a stage could process against what its own output
//! manifest already holds, processes the remainder in fixed-size batches, and
//! after every batch rewrites the output manifest and appends a checkpoint.
//! Stopping at any point and running again picks up exactly the items that
//! never reached the output manifest.
//!
//! Files written next to the stage outputs:
//!
//! - `<output>/<stage>_manifest.jsonl`: one record per handled target
//! - `<output>/<stage>_progress.jsonl`: append-only [`Checkpoint`] log

use crate::checkpoint::{Checkpoint, ProgressLog};
use crate::config::QueueConfig;
use crate::discovery::discover;
use crate::error::{QueueError, Result};
use crate::processor::{invoke, ItemOutcome, Processor};
use crate::record::{now_epoch, Record, StepState};
use crate::store::RecordStore;
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};

pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Which paths of an upstream record become targets of this stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSelector {
    /// The upstream record's own `input_path`
    Source,
    /// Outputs of an upstream step; records without outputs fall back to `input_path`
    Outputs { step: String },
}

impl TargetSelector {
    fn targets(&self, record: &Record) -> Vec<String> {
        match self {
            TargetSelector::Source => vec![record.input_path.clone()],
            TargetSelector::Outputs { step } => match record.step(step) {
                Some(state) if !state.outputs.is_empty() => state.outputs.clone(),
                _ => vec![record.input_path.clone()],
            },
        }
    }
}

/// Where the candidate set comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateSource {
    Manifest(PathBuf),
    Directory(PathBuf),
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub stage: String,
    pub source: CandidateSource,
    pub output_folder: PathBuf,
    /// Folder targets are resolved against; defaults to the scanned directory
    pub base_folder: Option<PathBuf>,
    pub batch_size: usize,
    pub selector: TargetSelector,
    /// Recorded as the worker on every output record
    pub worker_id: String,
}

impl BatchOptions {
    pub fn new(stage: impl Into<String>, source: CandidateSource, output_folder: impl Into<PathBuf>) -> Self {
        Self {
            stage: stage.into(),
            source,
            output_folder: output_folder.into(),
            base_folder: None,
            batch_size: DEFAULT_BATCH_SIZE,
            selector: TargetSelector::Source,
            worker_id: "0".to_string(),
        }
    }

    pub fn with_base_folder(mut self, base: impl Into<PathBuf>) -> Self {
        self.base_folder = Some(base.into());
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_selector(mut self, selector: TargetSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.output_folder
            .join(format!("{}_manifest.jsonl", self.stage))
    }

    pub fn progress_path(&self) -> PathBuf {
        self.output_folder
            .join(format!("{}_progress.jsonl", self.stage))
    }

    fn resolve(&self, target: &str) -> PathBuf {
        let base = self.base_folder.as_deref().or(match &self.source {
            CandidateSource::Directory(dir) => Some(dir.as_path()),
            CandidateSource::Manifest(_) => None,
        });
        match base {
            Some(base) => base.join(target),
            None => PathBuf::from(target),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedItem {
    pub input_path: String,
    pub error: String,
}

/// Running counts of a batch run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub processed: usize,
    /// Already present in the output manifest when the run started
    pub skipped: usize,
    pub failed: usize,
    pub total: usize,
    pub failures: Vec<FailedItem>,
    /// Stopped on operator request before all items were handled
    pub interrupted: bool,
}

impl BatchStats {
    pub fn handled(&self) -> usize {
        self.processed + self.skipped + self.failed
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint::now(self.processed, self.skipped, self.failed, self.total)
    }
}

type ProgressFn<'a> = Box<dyn FnMut(&BatchStats) + 'a>;

pub struct BatchOrchestrator<'a> {
    options: BatchOptions,
    config: QueueConfig,
    processor: &'a dyn Processor,
    cancel: Option<&'a AtomicBool>,
    on_progress: Option<ProgressFn<'a>>,
}

/// Records and stats not yet written out
struct RunState {
    stats: BatchStats,
    unflushed: Vec<Record>,
}

impl<'a> BatchOrchestrator<'a> {
    pub fn new(options: BatchOptions, config: QueueConfig, processor: &'a dyn Processor) -> Self {
        Self {
            options,
            config,
            processor,
            cancel: None,
            on_progress: None,
        }
    }

    /// Stop at the next item boundary once `cancel` is set
    pub fn with_cancel(mut self, cancel: &'a AtomicBool) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Called once the work set is known and after every item
    pub fn with_progress(mut self, f: impl FnMut(&BatchStats) + 'a) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    pub fn options(&self) -> &BatchOptions {
        &self.options
    }

    /// Last checkpoint left by a previous run, if any
    pub fn previous_checkpoint(&self) -> Option<Checkpoint> {
        ProgressLog::new(self.options.progress_path())
            .last()
            .unwrap_or_else(|err| {
                warn!(error = %err, "progress log unreadable");
                None
            })
    }

    /// Targets in first-seen order, without duplicates
    pub fn candidates(&self) -> Result<Vec<String>> {
        let records = match &self.options.source {
            CandidateSource::Manifest(path) => {
                if !path.exists() {
                    return Err(QueueError::NotFound(format!(
                        "input manifest '{}'",
                        path.display()
                    )));
                }
                RecordStore::open(path, &self.config)?.read_all()?
            },
            CandidateSource::Directory(dir) => {
                if !dir.is_dir() {
                    return Err(QueueError::NotFound(format!("input directory '{}'", dir.display())));
                }
                discover(dir, "")?
            },
        };

        let mut seen = HashSet::new();
        Ok(records
            .iter()
            .filter(|r| r.is_file())
            .flat_map(|r| self.options.selector.targets(r))
            .filter(|t| seen.insert(t.clone()))
            .collect())
    }

    /// Split candidates into `(already_done, to_process)` against the output manifest
    pub fn partition(&self, candidates: Vec<String>, output: &RecordStore) -> Result<(Vec<String>, Vec<String>)> {
        let done: HashSet<String> = output
            .read_all()?
            .into_iter()
            .map(|r| r.input_path)
            .collect();
        Ok(candidates.into_iter().partition(|c| done.contains(c)))
    }

    /// Run the stage to completion or interruption
    ///
    /// Per-item failures are counted and listed in the returned stats. An
    /// `Err` means a structural failure; pending results were flushed on a
    /// best-effort basis first.
    pub fn run(mut self) -> Result<BatchStats> {
        std::fs::create_dir_all(&self.options.output_folder)?;
        let output = RecordStore::open(self.options.manifest_path(), &self.config)?;
        let progress = ProgressLog::new(self.options.progress_path());

        if let Some(last) = self.previous_checkpoint() {
            info!(
                stage = %self.options.stage,
                handled = last.handled(),
                total = last.total,
                percent = last.percent_complete(),
                "resuming after previous run"
            );
        }

        let candidates = self.candidates()?;
        let (already_done, to_process) = self.partition(candidates, &output)?;

        let mut state = RunState {
            stats: BatchStats {
                skipped: already_done.len(),
                total: already_done.len() + to_process.len(),
                ..Default::default()
            },
            unflushed: Vec::new(),
        };
        info!(
            stage = %self.options.stage,
            total = state.stats.total,
            skipped = state.stats.skipped,
            remaining = to_process.len(),
            batch_size = self.options.batch_size,
            "batch run starting"
        );
        self.report(&state.stats);

        match self.process(&to_process, &output, &progress, &mut state) {
            Ok(()) => {
                info!(
                    stage = %self.options.stage,
                    processed = state.stats.processed,
                    skipped = state.stats.skipped,
                    failed = state.stats.failed,
                    interrupted = state.stats.interrupted,
                    "batch run finished"
                );
                Ok(state.stats)
            },
            Err(err) => {
                error!(stage = %self.options.stage, error = %err, "batch run aborted, flushing");
                if let Err(flush_err) = flush(&output, &progress, &mut state) {
                    error!(error = %flush_err, "final flush failed");
                }
                Err(err)
            },
        }
    }

    fn process(
        &mut self,
        to_process: &[String],
        output: &RecordStore,
        progress: &ProgressLog,
        state: &mut RunState,
    ) -> Result<()> {
        for batch in to_process.chunks(self.options.batch_size) {
            for target in batch {
                if self.cancelled() {
                    warn!(stage = %self.options.stage, "interrupted, flushing progress");
                    state.stats.interrupted = true;
                    return flush(output, progress, state);
                }
                let record = self.process_one(target, &mut state.stats);
                state.unflushed.push(record);
                self.report(&state.stats);
            }
            flush(output, progress, state)?;
        }
        Ok(())
    }

    fn process_one(&self, target: &str, stats: &mut BatchStats) -> Record {
        let input = self.options.resolve(target);
        let mut step = StepState::pending();
        step.claim(&self.options.worker_id, now_epoch());

        match invoke(self.processor, &input, &self.options.output_folder) {
            ItemOutcome::Done { outputs, details } => {
                step.complete(outputs, details, now_epoch());
                stats.processed += 1;
            },
            ItemOutcome::Failed {
                error: message,
                outputs,
                details,
            } => {
                error!(stage = %self.options.stage, input_path = target, error = %message, "item failed");
                stats.failed += 1;
                stats.failures.push(FailedItem {
                    input_path: target.to_string(),
                    error: message.clone(),
                });
                step.fail(message, outputs, details, now_epoch());
            },
        }

        let mut record = Record::file(target);
        record.steps.insert(self.options.stage.clone(), step);
        record
    }

    fn cancelled(&self) -> bool {
        self.cancel.is_some_and(|c| c.load(Ordering::SeqCst))
    }

    fn report(&mut self, stats: &BatchStats) {
        if let Some(f) = self.on_progress.as_mut() {
            f(stats);
        }
    }
}

fn flush(output: &RecordStore, progress: &ProgressLog, state: &mut RunState) -> Result<()> {
    if !state.unflushed.is_empty() {
        output.upsert_many(state.unflushed.iter().cloned())?;
        state.unflushed.clear();
    }
    progress.append(&state.stats.checkpoint())?;
    Ok(())
}
