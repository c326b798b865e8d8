//! Per-item processing boundary
//!
//! A [`Processor`] turns one input file into zero or more outputs under an
//! output folder. It may be called more than once for the same input (delivery
//! is at-least-once) and must only write below paths derived from its input,
//! so that concurrent workers never touch the same output file.
//!
//! Whatever state a processor needs (a loaded model, a client, a command
//! template) lives in the implementing value, constructed once per process.

use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;

/// What a processor reports for one item
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutput {
    /// Output paths, relative to the output folder where possible
    pub outputs: Vec<String>,
    /// Free-form description of how the item was processed
    pub details: Value,
    /// Set when the item failed after producing partial results
    pub error: Option<String>,
}

impl ProcessOutput {
    pub fn new(outputs: Vec<String>, details: Value) -> Self {
        Self {
            outputs,
            details,
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

pub trait Processor: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str {
        "processor"
    }

    fn process(&self, input: &Path, output_folder: &Path) -> anyhow::Result<ProcessOutput>;
}

impl<F> Processor for F
where
    F: Fn(&Path, &Path) -> anyhow::Result<ProcessOutput> + Send + Sync,
{
    fn process(&self, input: &Path, output_folder: &Path) -> anyhow::Result<ProcessOutput> {
        self(input, output_folder)
    }
}

/// Result of one processor call, with every failure mode folded into `Failed`
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Done {
        outputs: Vec<String>,
        details: Value,
    },
    Failed {
        error: String,
        outputs: Vec<String>,
        details: Option<Value>,
    },
}

impl ItemOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, ItemOutcome::Done { .. })
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            ItemOutcome::Done { .. } => None,
            ItemOutcome::Failed { error, .. } => Some(error),
        }
    }
}

/// Run `processor` on one item; errors and panics become [`ItemOutcome::Failed`]
pub fn invoke(processor: &dyn Processor, input: &Path, output_folder: &Path) -> ItemOutcome {
    let result = catch_unwind(AssertUnwindSafe(|| processor.process(input, output_folder)))
        .unwrap_or_else(|payload| Err(anyhow::anyhow!(panic_to_string(payload))));

    match result {
        Ok(ProcessOutput {
            outputs,
            details,
            error: None,
        }) => ItemOutcome::Done { outputs, details },
        Ok(ProcessOutput {
            outputs,
            details,
            error: Some(error),
        }) => ItemOutcome::Failed {
            error,
            outputs,
            details: Some(details),
        },
        Err(err) => ItemOutcome::Failed {
            error: format!("{err:#}"),
            outputs: Vec::new(),
            details: None,
        },
    }
}

fn panic_to_string(payload: Box<dyn std::any::Any + Send>) -> String {
    let message = if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    };
    format!("processor panicked: {message}")
}
