//! CLI command implementations
//!
//! Each subcommand has its own module with a `run` function.

pub mod batch;
pub mod enqueue;
pub mod reset;
pub mod run;
pub mod scan;
pub mod status;

use crate::config::Config;
use pagemill_queue::WorkerIdentity;

/// Progress bars are drawn only by the operator's own process
pub(crate) fn progress_visible(config: &Config, identity: &WorkerIdentity) -> bool {
    config.progress && !identity.is_worker
}

/// Failed items printed before the list is cut short
pub(crate) const MAX_LISTED_FAILURES: usize = 20;

/// `path: error` lines, indented, capped at [`MAX_LISTED_FAILURES`]
pub(crate) fn print_failures<'a>(failures: impl ExactSizeIterator<Item = (&'a str, &'a str)>) {
    let hidden = failures.len().saturating_sub(MAX_LISTED_FAILURES);
    for (path, error) in failures.take(MAX_LISTED_FAILURES) {
        println!("    {path}: {error}");
    }
    if hidden > 0 {
        println!("    ... and {hidden} more");
    }
}
