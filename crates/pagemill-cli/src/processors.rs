//! Built-in processors
//!
//! Both write to `<output_folder>/<input relative to root>`, so two workers
//! handling different inputs never share an output file.

use anyhow::{bail, Context};
use clap::ValueEnum;
use pagemill_queue::{ProcessOutput, Processor};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;

/// Lines of a failing command's stderr kept in the item error
const STDERR_TAIL_LINES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProcessorKind {
    /// Copy each input into the output folder
    Copy,
    /// Run an external program per input (`--exec`)
    Command,
}

/// Build the processor selected on the command line
pub fn build(kind: ProcessorKind, exec: Option<&str>, root: &Path) -> crate::Result<Box<dyn Processor>> {
    match kind {
        ProcessorKind::Copy => Ok(Box::new(CopyProcessor::new(root))),
        ProcessorKind::Command => {
            let template = exec.ok_or_else(|| crate::CliError::invalid_processor("'command' needs --exec"))?;
            Ok(Box::new(CommandProcessor::new(template, root)?))
        },
    }
}

/// Output location for `input`, relative to the output folder
fn relative_output(input: &Path, root: &Path) -> PathBuf {
    match input.strip_prefix(root) {
        Ok(rel) if !rel.as_os_str().is_empty() => rel.to_path_buf(),
        _ => input
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("output")),
    }
}

fn to_key(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[derive(Debug, Clone)]
pub struct CopyProcessor {
    root: PathBuf,
}

impl CopyProcessor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Processor for CopyProcessor {
    fn name(&self) -> &str {
        "copy"
    }

    fn process(&self, input: &Path, output_folder: &Path) -> anyhow::Result<ProcessOutput> {
        let rel = relative_output(input, &self.root);
        let target = output_folder.join(&rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("cannot create '{}'", parent.display()))?;
        }
        let bytes = std::fs::copy(input, &target)
            .with_context(|| format!("cannot copy '{}'", input.display()))?;

        Ok(ProcessOutput::new(vec![to_key(&rel)], json!({"method": "copy", "bytes": bytes})))
    }
}

/// Runs `program arg...` with `{input}` and `{output}` substituted per item
///
/// The template is split on whitespace; no shell is involved.
#[derive(Debug, Clone)]
pub struct CommandProcessor {
    program: String,
    args: Vec<String>,
    root: PathBuf,
}

impl CommandProcessor {
    pub fn new(template: &str, root: impl Into<PathBuf>) -> crate::Result<Self> {
        let mut parts = template.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| crate::CliError::invalid_processor("empty --exec template"))?;
        Ok(Self {
            program,
            args: parts.collect(),
            root: root.into(),
        })
    }

    fn render(&self, input: &Path, output: &Path) -> Vec<String> {
        let input = input.to_string_lossy();
        let output = output.to_string_lossy();
        self.args
            .iter()
            .map(|arg| arg.replace("{input}", &input).replace("{output}", &output))
            .collect()
    }
}

impl Processor for CommandProcessor {
    fn name(&self) -> &str {
        &self.program
    }

    fn process(&self, input: &Path, output_folder: &Path) -> anyhow::Result<ProcessOutput> {
        if !input.exists() {
            bail!("input '{}' does not exist", input.display());
        }
        let rel = relative_output(input, &self.root);
        let target = output_folder.join(&rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let started = Instant::now();
        let output = Command::new(&self.program)
            .args(self.render(input, &target))
            .output()
            .with_context(|| format!("cannot run '{}'", self.program))?;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let details = json!({
            "method": "command",
            "program": self.program,
            "exit_code": output.status.code(),
            "elapsed_ms": elapsed_ms,
        });

        let outputs = if target.exists() {
            vec![to_key(&rel)]
        } else {
            Vec::new()
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
            let tail = lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n");
            let code = output
                .status
                .code()
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            return Ok(ProcessOutput::new(outputs, details)
                .with_error(format!("'{}' exited with {code}: {tail}", self.program)));
        }

        Ok(ProcessOutput::new(outputs, details))
    }
}
