//! `pagemill run` command implementation
//!
//! The same executable plays two roles. Started by an operator it enables the
//! step and either drains it in-process (one worker) or launches a pool of
//! copies of itself. Started by the launcher (`PAGEMILL_WORKER=1`) it runs one
//! pull loop and reports progress as event lines on stdout.

use crate::commands::{print_failures, progress_visible};
use crate::config::Config;
use crate::error::{CliError, Result};
use crate::processors::{self, ProcessorKind};
use crate::progress::{create_stage_bar, create_worker_bars, stats_message};
use colored::Colorize;
use pagemill_queue::{
    launch, run_pull_loop, LaunchOptions, PullStats, StepManifest, StepSummary, WorkerEvent,
    WorkerIdentity,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Arguments of one `pagemill run` invocation
#[derive(Debug, Clone)]
pub struct RunArgs {
    pub step: String,
    pub manifest: PathBuf,
    pub project: PathBuf,
    pub output: Option<PathBuf>,
    pub workers: Option<usize>,
    pub processor: ProcessorKind,
    pub exec: Option<String>,
}

impl RunArgs {
    fn output_folder(&self) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| self.project.join(&self.step))
    }
}

pub async fn run(args: RunArgs, config: &Config, cancel: Arc<AtomicBool>) -> Result<()> {
    if !args.manifest.exists() {
        return Err(CliError::FileNotFound(args.manifest.display().to_string()));
    }
    // Fail on a bad processor before any worker is started
    processors::build(args.processor, args.exec.as_deref(), &args.project)?;

    let identity = WorkerIdentity::from_env();
    if identity.is_worker {
        return run_worker(args, config, identity, cancel).await;
    }

    let workers = args.workers.unwrap_or(config.workers);
    if workers == 0 {
        return Err(CliError::config("--workers must be at least 1"));
    }

    let before = step_summary(&args, config, &identity, true).await?;
    let claimable = before.pending + before.processing;
    if claimable == 0 {
        println!("Nothing to do for '{}': {} done, {} failed.", args.step, before.done, before.error);
        return Ok(());
    }

    let stats = if workers == 1 {
        run_in_process(&args, config, identity.clone(), claimable, cancel.clone()).await?
    } else {
        run_pool(&args, config, workers.min(claimable), claimable, &cancel).await?
    };

    let after = step_summary(&args, config, &identity, false).await?;
    print_summary(&before, &stats, &after);
    if stats.interrupted {
        return Err(CliError::Interrupted);
    }
    Ok(())
}

/// Child role: drain the step, one event line per item on stdout
async fn run_worker(
    args: RunArgs,
    config: &Config,
    identity: WorkerIdentity,
    cancel: Arc<AtomicBool>,
) -> Result<()> {
    let queue = config.queue;
    let stats = tokio::task::spawn_blocking(move || -> Result<PullStats> {
        let processor = processors::build(args.processor, args.exec.as_deref(), &args.project)?;
        let output = args.output_folder();
        let manifest = StepManifest::open(&args.manifest, &args.step, identity.id, queue)?;
        let mut emit = |event: &WorkerEvent| println!("{}", event.to_line());
        Ok(run_pull_loop(
            &manifest,
            processor.as_ref(),
            &args.project,
            &output,
            &cancel,
            &mut emit,
        )?)
    })
    .await
    .map_err(anyhow::Error::from)??;

    if stats.interrupted {
        return Err(CliError::Interrupted);
    }
    Ok(())
}

/// Single worker: the pull loop runs in this process behind a stage bar
async fn run_in_process(
    args: &RunArgs,
    config: &Config,
    identity: WorkerIdentity,
    total: usize,
    cancel: Arc<AtomicBool>,
) -> Result<PullStats> {
    let bar = create_stage_bar(total as u64, &args.step, progress_visible(config, &identity));
    let queue = config.queue;
    let args = args.clone();
    let worker_bar = bar.clone();

    let stats = tokio::task::spawn_blocking(move || -> Result<PullStats> {
        let processor = processors::build(args.processor, args.exec.as_deref(), &args.project)?;
        let output = args.output_folder();
        let manifest = StepManifest::open(&args.manifest, &args.step, identity.id, queue)?;
        let (mut done, mut failed) = (0, 0);
        let mut on_event = |event: &WorkerEvent| {
            match event {
                WorkerEvent::Completed { .. } => done += 1,
                WorkerEvent::Failed { .. } => failed += 1,
                _ => return,
            }
            worker_bar.inc(1);
            worker_bar.set_message(stats_message(done, 0, failed));
        };
        Ok(run_pull_loop(
            &manifest,
            processor.as_ref(),
            &args.project,
            &output,
            &cancel,
            &mut on_event,
        )?)
    })
    .await
    .map_err(anyhow::Error::from)??;

    bar.finish_with_message(stats_message(stats.processed, 0, stats.failed));
    Ok(stats)
}

/// Several workers: re-invoke this executable with the worker environment
async fn run_pool(
    args: &RunArgs,
    config: &Config,
    workers: usize,
    total: usize,
    cancel: &AtomicBool,
) -> Result<PullStats> {
    let program = std::env::current_exe()?;
    let options = LaunchOptions::new(program, std::env::args().skip(1).collect(), workers)
        .with_total_files(total);
    let shares: Vec<usize> = (0..workers).map(|i| options.expected_share(i)).collect();
    let visible = progress_visible(config, &WorkerIdentity::standalone());
    let (_multi, bars) = create_worker_bars(&shares, visible);
    let mut counts = vec![(0usize, 0usize); workers];

    info!(step = %args.step, workers, total, "launching worker pool");
    let summary = launch(&options, |index, event| {
        let (Some(bar), Some(count)) = (bars.get(index), counts.get_mut(index)) else {
            return;
        };
        match event {
            WorkerEvent::Completed { .. } => count.0 += 1,
            WorkerEvent::Failed { .. } => count.1 += 1,
            _ => return,
        }
        // Work is pulled, not assigned, so a fast worker may outrun its share
        if bar.position() >= bar.length().unwrap_or(0) {
            bar.inc_length(1);
        }
        bar.inc(1);
        bar.set_message(stats_message(count.0, 0, count.1));
    })
    .await?;

    for (bar, exit) in bars.iter().zip(&summary.workers) {
        bar.finish_with_message(stats_message(exit.processed, 0, exit.failed));
    }

    let interrupted = cancel.load(Ordering::SeqCst);
    if !summary.all_succeeded() && !interrupted {
        for exit in summary.failed_workers() {
            match &exit.spawn_error {
                Some(message) => warn!(worker = exit.worker, error = %message, "worker never started"),
                None => warn!(worker = exit.worker, code = ?exit.code, "worker failed"),
            }
        }
        return Err(CliError::WorkersFailed {
            failed: summary.failed_workers().count(),
            total: workers,
        });
    }
    Ok(PullStats {
        processed: summary.processed(),
        failed: summary.failed(),
        interrupted,
    })
}

/// Current counts for the step; `enable` first marks it pending where absent
async fn step_summary(
    args: &RunArgs,
    config: &Config,
    identity: &WorkerIdentity,
    enable: bool,
) -> Result<StepSummary> {
    let queue = config.queue;
    let (manifest, step, worker) = (args.manifest.clone(), args.step.clone(), identity.id.clone());
    tokio::task::spawn_blocking(move || -> Result<StepSummary> {
        let m = StepManifest::open(&manifest, &step, worker, queue)?;
        if enable {
            m.initialize()?;
        }
        Ok(m.summary()?)
    })
    .await
    .map_err(anyhow::Error::from)?
}

/// This run's counts, the step's totals, then every failed item
fn print_summary(before: &StepSummary, stats: &PullStats, after: &StepSummary) {
    let skipped = before.done + before.error;
    println!();
    println!("{}", format!("Step '{}':", after.step).cyan().bold());
    println!("  Processed: {}", stats.processed.to_string().green());
    println!("  Skipped:   {skipped}");
    if stats.failed > 0 {
        println!("  Failed:    {}", stats.failed.to_string().red());
    } else {
        println!("  Failed:    0");
    }
    println!("  Total:     {}", skipped + before.pending + before.processing);
    println!(
        "  Step:      {} done, {} failed, {} remaining",
        after.done,
        after.error,
        after.pending + after.processing
    );

    if !after.failures.is_empty() {
        println!("  {}", "Failed items:".red().bold());
        print_failures(after.failures.iter().map(|(path, error)| (path.as_str(), error.as_str())));
        println!("Run 'pagemill reset {}' to retry them.", after.step);
    }
}
