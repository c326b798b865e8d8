//! Manifest-backed work queue for document pipeline stages
//!
//! Every stage of a pipeline reads the same list of inputs, possibly from many
//! processes at once. The list lives in a plain JSON Lines manifest; this
//! crate coordinates access to it with nothing but the filesystem:
//!
//! - [`store::RecordStore`] reads the manifest and rewrites it atomically
//!   (temp file, fsync, rename) under an [`lock::AdvisoryLock`].
//! - [`step::StepManifest`] implements the per-step claim state machine,
//!   including reclaiming claims whose holder died.
//! - [`worker::run_pull_loop`] is the loop each worker process runs.
//! - [`launcher::launch`] starts a pool of worker processes.
//! - [`batch::BatchOrchestrator`] drives a stage that diffs its inputs against
//!   its own output manifest and processes the rest in checkpointed batches.
//!
//! Delivery is at-least-once: an item whose worker crashes is handed out
//! again once its claim is older than the processing timeout.
//!
//! # Example
//!
//! ```no_run
//! use pagemill_queue::{QueueConfig, StepManifest};
//! use serde_json::json;
//!
//! fn main() -> pagemill_queue::Result<()> {
//!     let manifest = StepManifest::open("manifest.jsonl", "crop", "0", QueueConfig::from_env())?;
//!     manifest.initialize()?;
//!
//!     while let Some(path) = manifest.get_next_pending()? {
//!         // ... process `path` ...
//!         manifest.mark_done(&path, vec![format!("crops/{path}")], json!({"method": "manual"}))?;
//!     }
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod discovery;
pub mod error;
pub mod launcher;
pub mod lock;
pub mod processor;
pub mod record;
pub mod step;
pub mod store;
pub mod worker;

pub use batch::{BatchOptions, BatchOrchestrator, BatchStats, CandidateSource, FailedItem, TargetSelector};
pub use checkpoint::{Checkpoint, ProgressLog};
pub use config::QueueConfig;
pub use error::{QueueError, Result};
pub use launcher::{launch, LaunchOptions, LaunchSummary, WorkerExit};
pub use processor::{ItemOutcome, ProcessOutput, Processor};
pub use record::{EntryKind, Record, StepState, StepStatus};
pub use step::{ResetFilter, StepManifest, StepSummary};
pub use store::RecordStore;
pub use worker::{run_pull_loop, PullStats, WorkerEvent, WorkerIdentity};
