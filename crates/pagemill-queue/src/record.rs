//! Manifest records
//!
//! One [`Record`] per line of a manifest, keyed by `input_path`. Each pipeline
//! step that touches the item owns one [`StepState`] under `steps.<name>`;
//! fields the queue does not interpret (discovery metadata such as `folder`,
//! `mtime`, `size`) are preserved verbatim in [`Record::meta`].
//!
//! ```json
//! {"input_path":"documents/a/p1.jpg","type":"file","steps":{"crop":{"status":"done","worker":"0","start_time":1718000000.1,"end_time":1718000004.7,"outputs":["crops/a/p1.jpg"],"details":{"method":"yolo"}}},"folder":"a"}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;

/// Kind of manifest entry; directories are placeholders and never claimed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    #[default]
    File,
    Directory,
}

/// Per-step lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Processing,
    Done,
    Error,
}

impl StepStatus {
    /// `done` and `error` are final for the current run
    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Done | StepStatus::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Processing => "processing",
            StepStatus::Done => "done",
            StepStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of one item for one step
///
/// `outputs`, `details` and `error` are only populated once the status is
/// terminal; every transition back to `pending` or `processing` clears them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub status: StepStatus,

    /// Worker currently or most recently holding the claim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,

    /// Seconds since the Unix epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<f64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepState {
    pub fn pending() -> Self {
        Self {
            status: StepStatus::Pending,
            worker: None,
            start_time: None,
            end_time: None,
            outputs: Vec::new(),
            details: None,
            error: None,
        }
    }

    /// `pending -> processing`
    pub fn claim(&mut self, worker: &str, now: f64) {
        *self = Self {
            status: StepStatus::Processing,
            worker: Some(worker.to_string()),
            start_time: Some(now),
            ..Self::pending()
        };
    }

    /// `processing -> done`
    pub fn complete(&mut self, outputs: Vec<String>, details: Value, now: f64) {
        self.status = StepStatus::Done;
        self.end_time = Some(now);
        self.outputs = outputs;
        self.details = Some(details);
        self.error = None;
    }

    /// `processing -> error`; partial outputs are kept when the processor produced any
    pub fn fail(&mut self, error: String, outputs: Vec<String>, details: Option<Value>, now: f64) {
        self.status = StepStatus::Error;
        self.end_time = Some(now);
        self.outputs = outputs;
        self.details = details;
        self.error = Some(error);
    }

    /// Back to `pending` with every claim and result field cleared
    pub fn reset(&mut self) {
        *self = Self::pending();
    }

    /// Age of the current claim in seconds, if it is being processed
    pub fn claim_age(&self, now: f64) -> Option<f64> {
        if self.status != StepStatus::Processing {
            return None;
        }
        // A claim without a start time cannot be aged and counts as abandoned.
        Some(now - self.start_time.unwrap_or(0.0))
    }

    /// A `processing` claim strictly older than `timeout`
    pub fn is_stale(&self, now: f64, timeout: Duration) -> bool {
        self.claim_age(now)
            .is_some_and(|age| age > timeout.as_secs_f64())
    }
}

/// One line of a manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub input_path: String,

    #[serde(rename = "type", default)]
    pub kind: EntryKind,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub steps: BTreeMap<String, StepState>,

    /// Fields not interpreted by the queue
    #[serde(flatten)]
    pub meta: Map<String, Value>,
}

impl Record {
    pub fn file(input_path: impl Into<String>) -> Self {
        Self::new(input_path, EntryKind::File)
    }

    pub fn directory(input_path: impl Into<String>) -> Self {
        Self::new(input_path, EntryKind::Directory)
    }

    fn new(input_path: impl Into<String>, kind: EntryKind) -> Self {
        Self {
            input_path: input_path.into(),
            kind,
            steps: BTreeMap::new(),
            meta: Map::new(),
        }
    }

    /// Attach an uninterpreted metadata field
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn step(&self, step: &str) -> Option<&StepState> {
        self.steps.get(step)
    }

    pub fn step_mut(&mut self, step: &str) -> Option<&mut StepState> {
        self.steps.get_mut(step)
    }

    /// Status for `step`; `None` means the step is not enabled for this item
    pub fn status(&self, step: &str) -> Option<StepStatus> {
        self.steps.get(step).map(|s| s.status)
    }

    /// Merge another record's data into this one; `other` wins on conflicts
    pub fn merge(&mut self, other: Record) {
        self.kind = other.kind;
        self.steps.extend(other.steps);
        self.meta.extend(other.meta);
    }
}

/// Current wall-clock time as seconds since the Unix epoch
pub fn now_epoch() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_fields_survive_a_round_trip() {
        let line = r#"{"input_path":"documents/a/1.jpg","type":"file","folder":"a","size":2048}"#;
        let record: Record = serde_json::from_str(line).unwrap();

        assert!(record.is_file());
        assert_eq!(record.meta.get("folder"), Some(&json!("a")));
        assert!(record.steps.is_empty());

        let back = serde_json::to_value(&record).unwrap();
        assert_eq!(back["size"], json!(2048));
        assert!(back.get("steps").is_none());
    }

    #[test]
    fn missing_type_defaults_to_file() {
        let record: Record = serde_json::from_str(r#"{"input_path":"x.png"}"#).unwrap();
        assert_eq!(record.kind, EntryKind::File);
    }

    #[test]
    fn results_only_appear_on_terminal_states() {
        let mut state = StepState::pending();
        state.claim("3", 100.0);
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["status"], "processing");
        assert!(value.get("outputs").is_none());
        assert!(value.get("details").is_none());

        state.complete(vec!["out/x.jpg".into()], json!({"method": "hough"}), 104.5);
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["status"], "done");
        assert_eq!(value["outputs"], json!(["out/x.jpg"]));
        assert_eq!(value["end_time"], json!(104.5));
    }

    #[test]
    fn claiming_again_clears_previous_results() {
        let mut state = StepState::pending();
        state.claim("0", 1.0);
        state.fail("boom".into(), vec!["partial.jpg".into()], None, 2.0);
        assert_eq!(state.outputs, vec!["partial.jpg".to_string()]);

        state.reset();
        state.claim("1", 3.0);
        assert_eq!(state.worker.as_deref(), Some("1"));
        assert!(state.error.is_none());
        assert!(state.outputs.is_empty());
        assert!(state.end_time.is_none());
    }

    #[test]
    fn staleness_is_strictly_after_timeout() {
        let mut state = StepState::pending();
        state.claim("0", 1_000.0);
        let timeout = Duration::from_secs(300);

        assert!(!state.is_stale(1_299.0, timeout));
        assert!(!state.is_stale(1_300.0, timeout));
        assert!(state.is_stale(1_300.5, timeout));
    }

    #[test]
    fn pending_items_are_never_stale() {
        let state = StepState::pending();
        assert!(!state.is_stale(f64::MAX, Duration::ZERO));
        assert_eq!(state.claim_age(10.0), None);
    }

    #[test]
    fn merge_keeps_existing_steps() {
        let mut existing = Record::file("a.jpg");
        existing.steps.insert("crop".into(), StepState::pending());

        let mut incoming = Record::file("a.jpg").with_meta("size", 10);
        incoming.steps.insert("rotate".into(), StepState::pending());

        existing.merge(incoming);
        assert!(existing.step("crop").is_some());
        assert!(existing.step("rotate").is_some());
        assert_eq!(existing.meta["size"], json!(10));
    }
}
