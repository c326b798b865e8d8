//! `pagemill status` command implementation
//!
//! Shows per-status counts and failed items for one or every step.

use crate::commands::print_failures;
use crate::config::Config;
use crate::error::{CliError, Result};
use colored::Colorize;
use pagemill_queue::step::summarize;
use pagemill_queue::{RecordStore, StepSummary};
use std::collections::BTreeSet;
use std::path::PathBuf;

pub async fn run(manifest: PathBuf, step: Option<String>, json: bool, config: &Config) -> Result<()> {
    if !manifest.exists() {
        return Err(CliError::FileNotFound(manifest.display().to_string()));
    }
    let queue = config.queue;
    let (files, summaries) = tokio::task::spawn_blocking(move || -> Result<_> {
        let records = RecordStore::open(&manifest, &queue)?.read_all()?;
        let steps: Vec<String> = match step {
            Some(step) => vec![step],
            None => records
                .iter()
                .flat_map(|r| r.steps.keys().cloned())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
        };
        let files = records.iter().filter(|r| r.is_file()).count();
        let summaries: Vec<StepSummary> = steps.iter().map(|s| summarize(s, &records)).collect();
        Ok((files, summaries))
    })
    .await
    .map_err(anyhow::Error::from)??;

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }

    if summaries.is_empty() {
        println!("{files} files, no steps enabled yet.");
        println!("Run 'pagemill enqueue <step>' to enable one.");
        return Ok(());
    }

    for summary in &summaries {
        print_summary(summary);
    }
    Ok(())
}

fn print_summary(summary: &StepSummary) {
    let state = if summary.is_complete() {
        "complete".green()
    } else {
        "in progress".yellow()
    };
    println!("{} ({})", summary.step.cyan().bold(), state);
    println!("  Pending:     {}", summary.pending);
    println!("  Processing:  {}", summary.processing);
    println!("  Done:        {}", summary.done.to_string().green());
    if summary.error > 0 {
        println!("  Error:       {}", summary.error.to_string().red());
    } else {
        println!("  Error:       0");
    }
    if summary.not_enabled > 0 {
        println!("  Not enabled: {}", summary.not_enabled);
    }

    if !summary.failures.is_empty() {
        println!("  {}", "Failed items:".red().bold());
        print_failures(
            summary
                .failures
                .iter()
                .map(|(path, error)| (path.as_str(), error.as_str())),
        );
        println!("  Run 'pagemill reset {}' to retry them.", summary.step);
    }
    println!();
}
