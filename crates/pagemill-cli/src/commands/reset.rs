//! `pagemill reset` command implementation
//!
//! The only way errored items go back to `pending`; they are never retried
//! automatically.

use crate::config::Config;
use crate::error::{CliError, Result};
use colored::Colorize;
use pagemill_queue::{ResetFilter, StepManifest, WorkerIdentity};
use std::path::PathBuf;

pub async fn run(step: String, manifest: PathBuf, processing: bool, config: &Config) -> Result<()> {
    if !manifest.exists() {
        return Err(CliError::FileNotFound(manifest.display().to_string()));
    }
    let filter = if processing {
        ResetFilter::errors().with_processing()
    } else {
        ResetFilter::errors()
    };
    let identity = WorkerIdentity::from_env();
    let queue = config.queue;
    let step_name = step.clone();

    let count = tokio::task::spawn_blocking(move || -> Result<usize> {
        let m = StepManifest::open(&manifest, &step, identity.id, queue)?;
        Ok(m.reset(filter)?)
    })
    .await
    .map_err(anyhow::Error::from)??;

    if count == 0 {
        println!("Nothing to reset for '{step_name}'.");
    } else {
        println!("{} {} items of '{}' are pending again", "✓".green(), count, step_name);
    }
    Ok(())
}
