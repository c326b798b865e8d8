//! `pagemill scan` command implementation
//!
//! Builds or refreshes a manifest from a documents folder.

use crate::config::Config;
use crate::error::{CliError, Result};
use colored::Colorize;
use pagemill_queue::discovery::{discover, merge_discovered};
use pagemill_queue::RecordStore;
use std::path::PathBuf;

pub async fn run(
    documents_dir: PathBuf,
    manifest: PathBuf,
    prefix: String,
    steps: Vec<String>,
    config: &Config,
) -> Result<()> {
    if !documents_dir.is_dir() {
        return Err(CliError::FileNotFound(documents_dir.display().to_string()));
    }
    let queue = config.queue;
    let manifest_path = manifest.clone();
    let step_count = steps.len();

    let (found, report) = tokio::task::spawn_blocking(move || -> Result<_> {
        let records = discover(&documents_dir, &prefix)?;
        let found = records.iter().filter(|r| r.is_file()).count();
        let store = RecordStore::open(&manifest, &queue)?;
        Ok((found, merge_discovered(&store, records, &steps)?))
    })
    .await
    .map_err(anyhow::Error::from)??;

    println!("{}", "Scan complete:".cyan().bold());
    println!("  Files found:   {found}");
    println!("  New records:   {}", report.added.to_string().green());
    if step_count > 0 {
        println!("  Steps enabled: {}", report.enabled);
    }
    println!("  Manifest:      {}", manifest_path.display());
    Ok(())
}
