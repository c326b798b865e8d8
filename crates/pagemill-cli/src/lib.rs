//! Pagemill CLI Library
//!
//! Command-line driver for manifest-backed document pipeline stages.
//!
//! # Overview
//!
//! - **Discovery**: Scan a documents folder into a manifest (`pagemill scan`)
//! - **Step Enablement**: Mark a step pending on every file (`pagemill enqueue`)
//! - **Parallel Runs**: Drain a step with N worker processes (`pagemill run`)
//! - **Batch Stages**: Diff, process and checkpoint a stage (`pagemill batch`)
//! - **Status Checking**: Per-status counts and failures (`pagemill status`)
//! - **Retrying**: Return failed or stuck items to pending (`pagemill reset`)

pub mod commands;
pub mod config;
pub mod error;
pub mod processors;
pub mod progress;

// Re-export commonly used types
pub use config::Config;
pub use error::{CliError, Result};

use clap::{Parser, Subcommand};
use processors::ProcessorKind;
use std::path::PathBuf;

/// Default manifest path for commands that take `--manifest`
pub const DEFAULT_MANIFEST: &str = "manifest.jsonl";

/// Pagemill - parallel, resumable document pipeline stages
#[derive(Parser, Debug)]
#[command(name = "pagemill")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file (defaults to ./pagemill.toml when present)
    #[arg(long, global = true, env = "PAGEMILL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Print the full command reference as Markdown
    #[arg(long, hide = true)]
    pub markdown_help: bool,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Scan a documents folder into a manifest
    Scan {
        /// Folder containing the documents
        documents_dir: PathBuf,

        /// Manifest to create or update
        #[arg(short, long, default_value = DEFAULT_MANIFEST)]
        manifest: PathBuf,

        /// Key prefix for discovered files
        #[arg(long, default_value = "documents")]
        prefix: String,

        /// Steps to mark pending on every discovered file
        #[arg(short, long = "step")]
        steps: Vec<String>,
    },

    /// Mark a step pending on every file that has not seen it yet
    Enqueue {
        /// Step name
        step: String,

        #[arg(short, long, default_value = DEFAULT_MANIFEST)]
        manifest: PathBuf,
    },

    /// Process every pending item of a step
    Run {
        /// Step name
        step: String,

        #[arg(short, long, default_value = DEFAULT_MANIFEST)]
        manifest: PathBuf,

        /// Folder that manifest keys are relative to
        #[arg(short, long, default_value = ".")]
        project: PathBuf,

        /// Output folder (defaults to `<project>/<step>`)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Worker processes (defaults to one fewer than the CPU count)
        #[arg(short, long)]
        workers: Option<usize>,

        #[arg(long, value_enum, default_value = "copy")]
        processor: ProcessorKind,

        /// Command template for `--processor command`, e.g. "convert {input} -rotate 90 {output}"
        #[arg(long)]
        exec: Option<String>,
    },

    /// Run a stage in checkpointed batches against its own output manifest
    Batch {
        /// Stage name; names the output manifest and progress log
        stage: String,

        /// Upstream manifest to read candidates from
        #[arg(long, conflicts_with = "input_dir", required_unless_present = "input_dir")]
        input_manifest: Option<PathBuf>,

        /// Folder to scan for candidates instead of a manifest
        #[arg(long)]
        input_dir: Option<PathBuf>,

        /// Output folder
        #[arg(short, long)]
        output: PathBuf,

        /// Folder candidate paths are resolved against
        #[arg(long)]
        base: Option<PathBuf>,

        /// Items between checkpoints
        #[arg(long)]
        batch_size: Option<usize>,

        /// Use upstream input paths rather than upstream outputs
        #[arg(long)]
        use_source: bool,

        /// Upstream step whose outputs become candidates
        #[arg(long, conflicts_with = "use_source")]
        from_step: Option<String>,

        #[arg(long, value_enum, default_value = "copy")]
        processor: ProcessorKind,

        /// Command template for `--processor command`
        #[arg(long)]
        exec: Option<String>,
    },

    /// Show per-status counts and failed items
    Status {
        #[arg(short, long, default_value = DEFAULT_MANIFEST)]
        manifest: PathBuf,

        /// Limit to one step (defaults to every step in the manifest)
        #[arg(short, long)]
        step: Option<String>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Return errored items of a step to pending
    Reset {
        /// Step name
        step: String,

        #[arg(short, long, default_value = DEFAULT_MANIFEST)]
        manifest: PathBuf,

        /// Also release items currently marked processing
        #[arg(long)]
        processing: bool,
    },
}
