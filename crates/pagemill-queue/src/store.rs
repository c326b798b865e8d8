//! JSON Lines record store with lock-guarded atomic rewrites
//!
//! The whole manifest is rewritten on every mutation: records are serialized
//! to a temporary file in the manifest's own directory, flushed and synced, and
//! renamed over the target. A reader therefore sees either the previous file or
//! the next one, never a mix. Mutations always run under the [`AdvisoryLock`];
//! plain reads may skip it because the rename is atomic.

use crate::config::QueueConfig;
use crate::error::{QueueError, Result};
use crate::lock::{AdvisoryLock, LockGuard};
use crate::record::Record;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::debug;

/// Keyed record collection persisted as one JSON object per line
#[derive(Debug, Clone)]
pub struct RecordStore {
    path: PathBuf,
    lock: AdvisoryLock,
    lock_timeout: Duration,
}

impl RecordStore {
    /// Open (creating if needed) the manifest at `path`
    pub fn open(path: impl Into<PathBuf>, config: &QueueConfig) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = parent_dir(&path) {
            std::fs::create_dir_all(parent)?;
        }
        // Never truncates: another process may have written the manifest since
        OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            lock: AdvisoryLock::for_manifest(&path, config.lock_poll_interval),
            lock_timeout: config.lock_timeout,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock(&self) -> &AdvisoryLock {
        &self.lock
    }

    /// Acquire the manifest lock with the configured timeout
    pub fn acquire(&self) -> Result<LockGuard> {
        self.lock.acquire(self.lock_timeout)
    }

    /// Load every record without taking the lock
    ///
    /// A line that does not parse aborts the read: rewriting a manifest with
    /// that line dropped would silently lose an item.
    pub fn read_all(&self) -> Result<Vec<Record>> {
        read_records(&self.path)
    }

    /// Load every record while holding the lock, for a point-in-time view
    pub fn read_all_locked(&self) -> Result<Vec<Record>> {
        let _guard = self.acquire()?;
        read_records(&self.path)
    }

    pub fn get(&self, key: &str) -> Result<Option<Record>> {
        Ok(self.read_all()?.into_iter().find(|r| r.input_path == key))
    }

    /// Merge `record` into the stored record with the same key, or append it
    pub fn upsert(&self, record: Record) -> Result<()> {
        self.upsert_many(std::iter::once(record))
    }

    /// Merge several records in a single rewrite
    pub fn upsert_many(&self, records: impl IntoIterator<Item = Record>) -> Result<()> {
        self.transaction(|set| {
            for record in records {
                set.upsert(record);
            }
            Ok(())
        })
    }

    /// Replace the whole manifest with `records`
    pub fn atomic_rewrite(&self, records: &[Record]) -> Result<()> {
        let _guard = self.acquire()?;
        write_records(&self.path, records)
    }

    /// Lock, read, let `f` inspect or modify the records, rewrite if anything changed, unlock
    ///
    /// If `f` fails nothing is written.
    pub fn transaction<R>(&self, f: impl FnOnce(&mut RecordSet) -> Result<R>) -> Result<R> {
        self.transaction_within(self.lock_timeout, f)
    }

    /// [`transaction`](Self::transaction) with an explicit bound on the lock wait
    pub fn transaction_within<R>(
        &self,
        lock_timeout: Duration,
        f: impl FnOnce(&mut RecordSet) -> Result<R>,
    ) -> Result<R> {
        let _guard = self.lock.acquire(lock_timeout)?;
        let mut set = RecordSet::from_records(read_records(&self.path)?);
        let out = f(&mut set)?;
        if set.dirty {
            write_records(&self.path, &set.records)?;
        }
        Ok(out)
    }
}

/// In-memory view of a manifest inside a [`RecordStore::transaction`]
#[derive(Debug, Default)]
pub struct RecordSet {
    records: Vec<Record>,
    index: HashMap<String, usize>,
    dirty: bool,
}

impl RecordSet {
    /// Build a set; a key repeated further down the file is merged into its first occurrence
    pub fn from_records(records: Vec<Record>) -> Self {
        let mut set = Self::default();
        for record in records {
            match set.index.get(&record.input_path) {
                Some(&pos) => set.records[pos].merge(record),
                None => {
                    set.index.insert(record.input_path.clone(), set.records.len());
                    set.records.push(record);
                },
            }
        }
        set
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }

    pub fn get(&self, key: &str) -> Option<&Record> {
        self.index.get(key).map(|&pos| &self.records[pos])
    }

    /// Mutable access; the set is written back when the transaction ends
    pub fn get_mut(&mut self, key: &str) -> Option<&mut Record> {
        let pos = *self.index.get(key)?;
        self.dirty = true;
        Some(&mut self.records[pos])
    }

    /// Mutable access to every record
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Record> {
        self.dirty = true;
        self.records.iter_mut()
    }

    pub fn upsert(&mut self, record: Record) {
        self.dirty = true;
        match self.index.get(&record.input_path) {
            Some(&pos) => self.records[pos].merge(record),
            None => {
                self.index.insert(record.input_path.clone(), self.records.len());
                self.records.push(record);
            },
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }
}

fn parent_dir(path: &Path) -> Option<&Path> {
    path.parent().filter(|p| !p.as_os_str().is_empty())
}

fn read_records(path: &Path) -> Result<Vec<Record>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut records = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let record = serde_json::from_str::<Record>(trimmed)
            .map_err(|e| QueueError::malformed(path, idx + 1, e))?;
        records.push(record);
    }
    Ok(records)
}

fn write_records(path: &Path, records: &[Record]) -> Result<()> {
    let dir = parent_dir(path).unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;

    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        for record in records {
            serde_json::to_writer(&mut writer, record)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
    }
    tmp.as_file().sync_all()?;

    tmp.persist(path).map_err(|e| QueueError::Persist {
        path: path.to_path_buf(),
        source: e.error,
    })?;

    debug!(manifest = %path.display(), records = records.len(), "manifest rewritten");
    Ok(())
}
