//! `pagemill batch` command implementation
//!
//! Runs one stage through the batch orchestrator with a stage bar, then
//! prints the final counts. Item failures do not fail the command.

use crate::commands::{print_failures, progress_visible};
use crate::config::Config;
use crate::error::{CliError, Result};
use crate::processors::{self, ProcessorKind};
use crate::progress::{create_stage_bar, stats_message};
use colored::Colorize;
use pagemill_queue::{
    BatchOptions, BatchOrchestrator, BatchStats, CandidateSource, TargetSelector, WorkerIdentity,
};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Arguments of one `pagemill batch` invocation
#[derive(Debug, Clone)]
pub struct BatchArgs {
    pub stage: String,
    pub input_manifest: Option<PathBuf>,
    pub input_dir: Option<PathBuf>,
    pub output: PathBuf,
    pub base: Option<PathBuf>,
    pub batch_size: Option<usize>,
    pub use_source: bool,
    pub from_step: Option<String>,
    pub processor: ProcessorKind,
    pub exec: Option<String>,
}

impl BatchArgs {
    fn options(&self, config: &Config, worker_id: &str) -> Result<BatchOptions> {
        let source = match (&self.input_manifest, &self.input_dir) {
            (Some(manifest), None) => CandidateSource::Manifest(manifest.clone()),
            (None, Some(dir)) => CandidateSource::Directory(dir.clone()),
            _ => {
                return Err(CliError::config(
                    "exactly one of --input-manifest and --input-dir is required",
                ))
            },
        };
        let selector = match (&self.from_step, self.use_source) {
            (Some(step), false) => TargetSelector::Outputs { step: step.clone() },
            _ => TargetSelector::Source,
        };
        let batch_size = self.batch_size.unwrap_or(config.batch_size);
        if batch_size == 0 {
            return Err(CliError::config("--batch-size must be at least 1"));
        }

        let mut options = BatchOptions::new(&self.stage, source, &self.output)
            .with_batch_size(batch_size)
            .with_selector(selector)
            .with_worker_id(worker_id);
        if let Some(base) = &self.base {
            options = options.with_base_folder(base);
        }
        Ok(options)
    }

    /// Folder the processor sees targets relative to
    fn processor_root(&self) -> PathBuf {
        self.base
            .clone()
            .or_else(|| self.input_dir.clone())
            .unwrap_or_default()
    }
}

pub async fn run(args: BatchArgs, config: &Config, cancel: Arc<AtomicBool>) -> Result<()> {
    let identity = WorkerIdentity::from_env();
    let options = args.options(config, &identity.id)?;
    let processor = processors::build(args.processor, args.exec.as_deref(), &args.processor_root())?;
    let visible = progress_visible(config, &identity);
    let queue = config.queue;
    let stage = args.stage.clone();

    let stats = tokio::task::spawn_blocking(move || -> Result<BatchStats> {
        let orchestrator =
            BatchOrchestrator::new(options, queue, processor.as_ref()).with_cancel(&cancel);
        if let Some(last) = orchestrator.previous_checkpoint() {
            println!(
                "Resuming '{}': {}/{} handled last run ({:.1}%)",
                stage,
                last.handled(),
                last.total,
                last.percent_complete()
            );
        }

        let bar = create_stage_bar(0, &stage, visible);
        let progress_bar = bar.clone();
        let orchestrator = orchestrator.with_progress(move |stats: &BatchStats| {
            progress_bar.set_length(stats.total as u64);
            progress_bar.set_position(stats.handled() as u64);
            progress_bar.set_message(stats_message(stats.processed, stats.skipped, stats.failed));
        });

        let stats = orchestrator.run();
        bar.finish_and_clear();
        Ok(stats?)
    })
    .await
    .map_err(anyhow::Error::from)??;

    print_stats(&args.stage, &stats);
    if stats.interrupted {
        return Err(CliError::Interrupted);
    }
    Ok(())
}

fn print_stats(stage: &str, stats: &BatchStats) {
    println!("{}", format!("Stage '{stage}':").cyan().bold());
    println!("  Processed: {}", stats.processed.to_string().green());
    println!("  Skipped:   {}", stats.skipped);
    if stats.failed > 0 {
        println!("  Failed:    {}", stats.failed.to_string().red());
    } else {
        println!("  Failed:    0");
    }
    println!("  Total:     {}", stats.total);

    if !stats.failures.is_empty() {
        println!("  {}", "Failed items:".red().bold());
        print_failures(
            stats
                .failures
                .iter()
                .map(|item| (item.input_path.as_str(), item.error.as_str())),
        );
    }
}
