//! `pagemill enqueue` command implementation

use crate::config::Config;
use crate::error::{CliError, Result};
use colored::Colorize;
use pagemill_queue::{StepManifest, WorkerIdentity};
use std::path::PathBuf;

/// Mark `step` pending on every file record that has no state for it yet
pub async fn run(step: String, manifest: PathBuf, config: &Config) -> Result<()> {
    if !manifest.exists() {
        return Err(CliError::FileNotFound(manifest.display().to_string()));
    }
    let identity = WorkerIdentity::from_env();
    let queue = config.queue;

    let (changed, summary) = tokio::task::spawn_blocking(move || -> Result<_> {
        let m = StepManifest::open(&manifest, &step, identity.id, queue)?;
        let changed = m.initialize()?;
        Ok((changed, m.summary()?))
    })
    .await
    .map_err(anyhow::Error::from)??;

    println!(
        "{} {} files enabled for '{}' ({} pending in total)",
        "✓".green(),
        changed,
        summary.step,
        summary.pending
    );
    Ok(())
}
