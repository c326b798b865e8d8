//! Per-step claim state machine over a shared manifest
//!
//! ```text
//!   (absent) --initialize--> pending --claim--> processing --+--> done
//!                               ^                    |       |
//!                               +---- stale reclaim -+       +--> error
//!                               +---------------- reset ------------+
//! ```
//!
//! Every transition runs inside one [`RecordStore::transaction`], so the
//! scan for work, the stale reclaim and the claim itself happen under a single
//! lock acquisition. Two workers can never both move the same item to
//! `processing`.

use crate::config::QueueConfig;
use crate::error::{QueueError, Result};
use crate::record::{now_epoch, Record, StepState, StepStatus};
use crate::store::{RecordSet, RecordStore};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Claim lifecycle for one step of one manifest, as seen by one worker
#[derive(Debug, Clone)]
pub struct StepManifest {
    store: RecordStore,
    step: String,
    worker_id: String,
    config: QueueConfig,
}

/// Which records [`StepManifest::reset`] returns to `pending`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetFilter {
    pub errors: bool,
    pub processing: bool,
}

impl ResetFilter {
    /// Errored items only
    pub fn errors() -> Self {
        Self {
            errors: true,
            processing: false,
        }
    }

    /// Also release every `processing` claim, however recent
    pub fn with_processing(mut self) -> Self {
        self.processing = true;
        self
    }

    fn matches(&self, status: StepStatus) -> bool {
        match status {
            StepStatus::Error => self.errors,
            StepStatus::Processing => self.processing,
            StepStatus::Pending | StepStatus::Done => false,
        }
    }
}

/// Per-status counts for one step
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StepSummary {
    pub step: String,
    pub pending: usize,
    pub processing: usize,
    pub done: usize,
    pub error: usize,
    /// File records on which the step was never initialized
    pub not_enabled: usize,
    /// `(input_path, error)` for every errored item, in manifest order
    pub failures: Vec<(String, String)>,
}

impl StepSummary {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.done + self.error + self.not_enabled
    }

    /// Nothing left to hand out or wait for
    pub fn is_complete(&self) -> bool {
        self.pending == 0 && self.processing == 0
    }
}

impl StepManifest {
    pub fn open(
        path: impl Into<PathBuf>,
        step: impl Into<String>,
        worker_id: impl Into<String>,
        config: QueueConfig,
    ) -> Result<Self> {
        Ok(Self {
            store: RecordStore::open(path, &config)?,
            step: step.into(),
            worker_id: worker_id.into(),
            config,
        })
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    pub fn step(&self) -> &str {
        &self.step
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Enable the step: `(absent) -> pending` on every file record
    ///
    /// Returns how many records changed. Existing step state is left alone, so
    /// this is safe to call on every run.
    pub fn initialize(&self) -> Result<usize> {
        let step = self.step.as_str();
        let changed = self.store.transaction(|set| {
            let keys: Vec<String> = set
                .iter()
                .filter(|r| r.is_file() && r.step(step).is_none())
                .map(|r| r.input_path.clone())
                .collect();
            for key in &keys {
                if let Some(record) = set.get_mut(key) {
                    record.steps.insert(step.to_string(), StepState::pending());
                }
            }
            Ok(keys.len())
        })?;

        info!(step, changed, manifest = %self.path().display(), "step initialized");
        Ok(changed)
    }

    /// Hand out the next item to work on, or `None` when nothing is claimable
    ///
    /// Stale claims are reclaimed and the first pending item is claimed in one
    /// critical section. Lock contention is retried up to `max_retries` times
    /// with exponential backoff and jitter, never beyond `claim_timeout`.
    ///
    /// Finding nothing pending returns `None` at once without backing off;
    /// only lock contention is retried. Scan and claim share one lock hold,
    /// so there is no lost race to re-scan after.
    pub fn get_next_pending(&self) -> Result<Option<String>> {
        let deadline = Instant::now() + self.config.claim_timeout;
        let attempts = self.config.max_retries.max(1);

        for attempt in 0..attempts {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let lock_wait = self.config.lock_timeout.min(remaining.max(Duration::from_millis(1)));

            match self.store.transaction_within(lock_wait, |set| Ok(self.claim_first(set))) {
                Ok(claimed) => return Ok(claimed),
                Err(err) if err.is_retryable() => {
                    let delay = self.config.backoff(attempt);
                    warn!(
                        worker = %self.worker_id,
                        step = %self.step,
                        attempt = attempt + 1,
                        error = %err,
                        "claim attempt failed, backing off"
                    );
                    if attempt + 1 == attempts || Instant::now() + delay >= deadline {
                        break;
                    }
                    std::thread::sleep(delay);
                },
                Err(err) => return Err(err),
            }
        }

        debug!(worker = %self.worker_id, step = %self.step, "no claimable work right now");
        Ok(None)
    }

    /// Reclaim stale items, then claim the first pending one
    fn claim_first(&self, set: &mut RecordSet) -> Option<String> {
        let now = now_epoch();
        let timeout = self.config.processing_timeout;
        let step = self.step.as_str();

        let stale: Vec<(String, Option<String>, f64)> = set
            .iter()
            .filter(|r| r.is_file())
            .filter_map(|r| {
                let state = r.step(step)?;
                state.is_stale(now, timeout).then(|| {
                    let age = state.claim_age(now).unwrap_or_default();
                    (r.input_path.clone(), state.worker.clone(), age)
                })
            })
            .collect();

        for (key, holder, age) in stale {
            warn!(
                step,
                input_path = %key,
                holder = holder.as_deref().unwrap_or("unknown"),
                age_secs = age as u64,
                "reclaiming stale claim"
            );
            if let Some(state) = set.get_mut(&key).and_then(|r| r.step_mut(step)) {
                state.reset();
            }
        }

        let key = set
            .iter()
            .find(|r| r.is_file() && r.status(step) == Some(StepStatus::Pending))
            .map(|r| r.input_path.clone())?;

        self.claim_in(set, &key, now).then_some(key)
    }

    fn claim_in(&self, set: &mut RecordSet, key: &str, now: f64) -> bool {
        let eligible = set
            .get(key)
            .is_some_and(|r| r.is_file() && r.status(&self.step) == Some(StepStatus::Pending));
        if !eligible {
            return false;
        }

        if let Some(state) = set.get_mut(key).and_then(|r| r.step_mut(&self.step)) {
            state.claim(&self.worker_id, now);
        }
        debug!(worker = %self.worker_id, step = %self.step, input_path = key, "claimed");
        true
    }

    /// Claim a specific item; `false` if it is no longer `pending`
    pub fn claim(&self, input_path: &str) -> Result<bool> {
        self.store
            .transaction(|set| Ok(self.claim_in(set, input_path, now_epoch())))
    }

    /// `processing -> done`
    pub fn mark_done(&self, input_path: &str, outputs: Vec<String>, details: Value) -> Result<()> {
        self.finish(input_path, |state, now| state.complete(outputs, details, now))?;
        debug!(worker = %self.worker_id, step = %self.step, input_path, "done");
        Ok(())
    }

    /// `processing -> error`; the item is not retried until reset
    pub fn mark_error(&self, input_path: &str, error: impl Into<String>) -> Result<()> {
        self.mark_error_with(input_path, error, Vec::new(), None)
    }

    /// `processing -> error`, keeping whatever the processor produced before failing
    pub fn mark_error_with(
        &self,
        input_path: &str,
        error: impl Into<String>,
        outputs: Vec<String>,
        details: Option<Value>,
    ) -> Result<()> {
        let error = error.into();
        warn!(worker = %self.worker_id, step = %self.step, input_path, error = %error, "item failed");
        self.finish(input_path, |state, now| state.fail(error, outputs, details, now))
    }

    fn finish(&self, input_path: &str, apply: impl FnOnce(&mut StepState, f64)) -> Result<()> {
        let step = self.step.as_str();
        let worker = self.worker_id.as_str();

        self.store.transaction(|set| {
            let record = set
                .get_mut(input_path)
                .ok_or_else(|| QueueError::NotFound(input_path.to_string()))?;
            let state = record
                .steps
                .entry(step.to_string())
                .or_insert_with(StepState::pending);

            if state.status == StepStatus::Done {
                // A reclaimed item may finish twice; the first result stands.
                warn!(step, input_path, worker, "item already done, keeping first result");
                return Ok(());
            }
            if state.worker.as_deref().is_some_and(|holder| holder != worker) {
                debug!(step, input_path, worker, holder = ?state.worker, "finishing an item claimed by another worker");
            }

            apply(state, now_epoch());
            state.worker = Some(worker.to_string());
            Ok(())
        })
    }

    /// Return matching items to `pending`; returns how many changed
    pub fn reset(&self, filter: ResetFilter) -> Result<usize> {
        let step = self.step.as_str();
        let changed = self.store.transaction(|set| {
            let keys: Vec<String> = set
                .iter()
                .filter(|r| r.status(step).is_some_and(|s| filter.matches(s)))
                .map(|r| r.input_path.clone())
                .collect();
            for key in &keys {
                if let Some(state) = set.get_mut(key).and_then(|r| r.step_mut(step)) {
                    state.reset();
                }
            }
            Ok(keys.len())
        })?;

        info!(step, changed, "step reset");
        Ok(changed)
    }

    /// Point-in-time counts for this step
    pub fn summary(&self) -> Result<StepSummary> {
        let records = self.store.read_all_locked()?;
        Ok(summarize(&self.step, &records))
    }

    /// Keys of every file record, in manifest order
    pub fn all_files(&self) -> Result<Vec<String>> {
        Ok(self
            .store
            .read_all()?
            .into_iter()
            .filter(Record::is_file)
            .map(|r| r.input_path)
            .collect())
    }

    pub fn is_pending(&self, input_path: &str) -> Result<bool> {
        Ok(self
            .store
            .get(input_path)?
            .is_some_and(|r| r.status(&self.step) == Some(StepStatus::Pending)))
    }
}

/// Count statuses of `step` across `records`
pub fn summarize(step: &str, records: &[Record]) -> StepSummary {
    let mut summary = StepSummary {
        step: step.to_string(),
        ..Default::default()
    };

    for record in records.iter().filter(|r| r.is_file()) {
        match record.step(step) {
            None => summary.not_enabled += 1,
            Some(state) => match state.status {
                StepStatus::Pending => summary.pending += 1,
                StepStatus::Processing => summary.processing += 1,
                StepStatus::Done => summary.done += 1,
                StepStatus::Error => {
                    summary.error += 1;
                    summary.failures.push((
                        record.input_path.clone(),
                        state.error.clone().unwrap_or_default(),
                    ));
                },
            },
        }
    }
    summary
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::{Arc, Barrier};
    use tempfile::TempDir;

    fn config() -> QueueConfig {
        QueueConfig::default()
            .with_processing_timeout(Duration::from_secs(60))
            .with_claim_timeout(Duration::from_secs(10))
            .with_base_delay(Duration::from_millis(1))
            .with_max_jitter(Duration::from_millis(1))
            .with_lock_timeout(Duration::from_secs(10))
    }

    fn manifest(dir: &TempDir, worker: &str) -> StepManifest {
        StepManifest::open(dir.path().join("manifest.jsonl"), "crop", worker, config()).unwrap()
    }

    fn seed(manifest: &StepManifest, keys: &[&str]) {
        manifest
            .store()
            .upsert_many(keys.iter().map(|k| Record::file(*k)))
            .unwrap();
        manifest.initialize().unwrap();
    }

    #[test]
    fn initialize_only_touches_files_without_state() {
        let dir = TempDir::new().unwrap();
        let m = manifest(&dir, "0");
        let mut done = Record::file("b.jpg");
        let mut state = StepState::pending();
        state.complete(vec![], json!({}), 1.0);
        done.steps.insert("crop".into(), state);
        m.store()
            .upsert_many([Record::file("a.jpg"), done, Record::directory("box")])
            .unwrap();

        assert_eq!(m.initialize().unwrap(), 1);
        assert_eq!(m.initialize().unwrap(), 0);

        let records = m.store().read_all().unwrap();
        assert_eq!(records[0].status("crop"), Some(StepStatus::Pending));
        assert_eq!(records[1].status("crop"), Some(StepStatus::Done));
        assert_eq!(records[2].status("crop"), None);
    }

    #[test]
    fn single_worker_drains_in_manifest_order() {
        let dir = TempDir::new().unwrap();
        let m = manifest(&dir, "0");
        seed(&m, &["p1.jpg", "p2.jpg", "p3.jpg"]);

        let mut seen = Vec::new();
        while let Some(path) = m.get_next_pending().unwrap() {
            m.mark_done(&path, vec![format!("out/{path}")], json!({"n": 1})).unwrap();
            seen.push(path);
        }

        assert_eq!(seen, vec!["p1.jpg", "p2.jpg", "p3.jpg"]);
        let summary = m.summary().unwrap();
        assert_eq!(summary.done, 3);
        assert!(summary.is_complete());
    }

    #[test]
    fn stale_claim_is_reclaimed_by_next_worker() {
        let dir = TempDir::new().unwrap();
        let m = manifest(&dir, "new");
        let mut record = Record::file("slow.jpg");
        let mut state = StepState::pending();
        state.claim("crashed", now_epoch() - 2.0 * 60.0);
        record.steps.insert("crop".into(), state);
        m.store().upsert(record).unwrap();

        assert_eq!(m.get_next_pending().unwrap().as_deref(), Some("slow.jpg"));
        let record = m.store().get("slow.jpg").unwrap().unwrap();
        let state = record.step("crop").unwrap();
        assert_eq!(state.status, StepStatus::Processing);
        assert_eq!(state.worker.as_deref(), Some("new"));
    }

    #[test]
    fn fresh_claim_is_left_alone() {
        let dir = TempDir::new().unwrap();
        let m = manifest(&dir, "second");
        let mut record = Record::file("busy.jpg");
        let mut state = StepState::pending();
        state.claim("first", now_epoch() - 30.0);
        record.steps.insert("crop".into(), state);
        m.store().upsert(record).unwrap();

        assert_eq!(m.get_next_pending().unwrap(), None);
        let record = m.store().get("busy.jpg").unwrap().unwrap();
        assert_eq!(record.step("crop").unwrap().worker.as_deref(), Some("first"));
    }

    #[test]
    fn reclaim_waits_for_the_full_processing_timeout() {
        let dir = TempDir::new().unwrap();
        let m = manifest(&dir, "next");
        let timeout = config().processing_timeout.as_secs_f64();
        let claimed_at = |path: &str, start: f64| {
            let mut record = Record::file(path);
            let mut state = StepState::pending();
            state.claim("gone", start);
            record.steps.insert("crop".into(), state);
            record
        };
        // One second short of the timeout, then one second past it
        m.store()
            .upsert_many([
                claimed_at("inside.jpg", now_epoch() - timeout + 1.0),
                claimed_at("outside.jpg", now_epoch() - timeout - 1.0),
            ])
            .unwrap();

        assert_eq!(m.get_next_pending().unwrap().as_deref(), Some("outside.jpg"));
        assert_eq!(m.get_next_pending().unwrap(), None);
        let inside = m.store().get("inside.jpg").unwrap().unwrap();
        assert_eq!(inside.step("crop").unwrap().worker.as_deref(), Some("gone"));
    }

    #[test]
    fn claim_without_start_time_counts_as_stale() {
        let dir = TempDir::new().unwrap();
        let m = manifest(&dir, "0");
        let line = r#"{"input_path":"odd.jpg","type":"file","steps":{"crop":{"status":"processing","worker":"9"}}}"#;
        std::fs::write(m.path(), format!("{line}\n")).unwrap();

        assert_eq!(m.get_next_pending().unwrap().as_deref(), Some("odd.jpg"));
    }

    #[test]
    fn exactly_one_of_two_racing_workers_wins() {
        let dir = TempDir::new().unwrap();
        seed(&manifest(&dir, "setup"), &["only.jpg"]);

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|worker| {
                let m = manifest(&dir, worker);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    m.get_next_pending().unwrap()
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_some()).count(), 1);
    }

    #[test]
    fn explicit_claim_fails_once_taken() {
        let dir = TempDir::new().unwrap();
        let a = manifest(&dir, "a");
        let b = manifest(&dir, "b");
        seed(&a, &["x.jpg"]);

        assert!(a.claim("x.jpg").unwrap());
        assert!(!b.claim("x.jpg").unwrap());
        assert!(!b.claim("missing.jpg").unwrap());
        assert!(!a.is_pending("x.jpg").unwrap());
    }

    #[test]
    fn concurrent_workers_claim_every_item_exactly_once() {
        let dir = TempDir::new().unwrap();
        let keys: Vec<String> = (0..40).map(|i| format!("p{i:02}.jpg")).collect();
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        seed(&manifest(&dir, "setup"), &refs);

        let handles: Vec<_> = (0..4)
            .map(|w| {
                let m = manifest(&dir, &w.to_string());
                std::thread::spawn(move || {
                    let mut mine = Vec::new();
                    while let Some(path) = m.get_next_pending().unwrap() {
                        m.mark_done(&path, vec![], json!({})).unwrap();
                        mine.push(path);
                    }
                    mine
                })
            })
            .collect();

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.join().unwrap());
        }
        let unique: HashSet<_> = all.iter().cloned().collect();
        assert_eq!(all.len(), 40);
        assert_eq!(unique.len(), 40);
        assert_eq!(manifest(&dir, "check").summary().unwrap().done, 40);
    }

    #[test]
    fn errored_items_stay_terminal_until_reset() {
        let dir = TempDir::new().unwrap();
        let m = manifest(&dir, "0");
        seed(&m, &["bad.jpg"]);

        let path = m.get_next_pending().unwrap().unwrap();
        m.mark_error_with(&path, "decode failed", vec!["partial.jpg".into()], None)
            .unwrap();
        assert_eq!(m.get_next_pending().unwrap(), None);

        let summary = m.summary().unwrap();
        assert_eq!(summary.error, 1);
        assert_eq!(
            summary.failures,
            vec![("bad.jpg".to_string(), "decode failed".to_string())]
        );
        let record = m.store().get("bad.jpg").unwrap().unwrap();
        assert_eq!(record.step("crop").unwrap().outputs, vec!["partial.jpg".to_string()]);

        assert_eq!(m.reset(ResetFilter::errors()).unwrap(), 1);
        assert_eq!(m.get_next_pending().unwrap().as_deref(), Some("bad.jpg"));
    }

    #[test]
    fn reset_with_processing_releases_live_claims() {
        let dir = TempDir::new().unwrap();
        let m = manifest(&dir, "0");
        seed(&m, &["a.jpg", "b.jpg"]);
        m.get_next_pending().unwrap();

        assert_eq!(m.reset(ResetFilter::errors()).unwrap(), 0);
        assert_eq!(m.reset(ResetFilter::errors().with_processing()).unwrap(), 1);
        assert_eq!(m.summary().unwrap().pending, 2);
    }

    #[test]
    fn done_items_are_not_overwritten() {
        let dir = TempDir::new().unwrap();
        let m = manifest(&dir, "0");
        seed(&m, &["a.jpg"]);
        let path = m.get_next_pending().unwrap().unwrap();
        m.mark_done(&path, vec!["first.jpg".into()], json!({})).unwrap();

        m.mark_error(&path, "late failure").unwrap();
        m.mark_done(&path, vec!["second.jpg".into()], json!({})).unwrap();

        let state = m.store().get("a.jpg").unwrap().unwrap().steps["crop"].clone();
        assert_eq!(state.status, StepStatus::Done);
        assert_eq!(state.outputs, vec!["first.jpg".to_string()]);
    }

    #[test]
    fn finishing_an_unknown_item_is_an_error() {
        let dir = TempDir::new().unwrap();
        let m = manifest(&dir, "0");
        assert!(matches!(
            m.mark_done("ghost.jpg", vec![], json!({})),
            Err(QueueError::NotFound(_))
        ));
    }

    #[test]
    fn lock_contention_returns_none_after_retries() {
        let dir = TempDir::new().unwrap();
        let cfg = config()
            .with_max_retries(2)
            .with_claim_timeout(Duration::from_millis(200))
            .with_lock_timeout(Duration::from_millis(20));
        let m = StepManifest::open(dir.path().join("manifest.jsonl"), "crop", "0", cfg).unwrap();
        seed(&m, &["a.jpg"]);

        let _held = m.store().acquire().unwrap();
        assert_eq!(m.get_next_pending().unwrap(), None);
    }

    #[test]
    fn all_files_skips_directories() {
        let dir = TempDir::new().unwrap();
        let m = manifest(&dir, "0");
        m.store()
            .upsert_many([Record::directory("box"), Record::file("box/1.jpg")])
            .unwrap();
        assert_eq!(m.all_files().unwrap(), vec!["box/1.jpg".to_string()]);
        assert_eq!(m.summary().unwrap().not_enabled, 1);
    }
}
