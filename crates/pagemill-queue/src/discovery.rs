//! Source discovery
//!
//! Walks a documents folder and turns it into manifest records: one
//! `directory` record per sub-folder, one `file` record per supported
//! document. Keys are `<prefix>/<relative path>` with `/` separators so a
//! manifest stays valid when the project moves between machines.

use crate::error::Result;
use crate::record::{Record, StepState};
use crate::store::RecordStore;
use std::cmp::Ordering;
use std::path::{Component, Path};
use std::time::UNIX_EPOCH;
use tracing::{debug, info};
use walkdir::{DirEntry, WalkDir};

/// Extensions (lowercase) treated as documents
pub const SUPPORTED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "tif", "tiff", "jxl", "pdf"];

pub fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0 && entry.file_name().to_string_lossy().starts_with('.')
}

/// Records for everything under `root`, in natural order of their keys
pub fn discover(root: &Path, prefix: &str) -> Result<Vec<Record>> {
    let mut records = Vec::new();

    for entry in WalkDir::new(root)
        .min_depth(1)
        .follow_links(true)
        .into_iter()
        .filter_entry(|e| !is_hidden(e))
    {
        let entry = entry.map_err(std::io::Error::from)?;
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        let key = join_key(prefix, rel);
        let folder = top_folder(rel);

        if entry.file_type().is_dir() {
            records.push(Record::directory(key).with_meta("folder", folder));
        } else if entry.file_type().is_file() && is_supported(entry.path()) {
            let metadata = entry.metadata().map_err(std::io::Error::from)?;
            let mtime = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs_f64())
                .unwrap_or_default();
            records.push(
                Record::file(key)
                    .with_meta("folder", folder)
                    .with_meta("mtime", mtime)
                    .with_meta("size", metadata.len()),
            );
        }
    }

    records.sort_by(|a, b| natural_cmp(&a.input_path, &b.input_path));
    debug!(root = %root.display(), records = records.len(), "discovery finished");
    Ok(records)
}

/// What [`merge_discovered`] changed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeReport {
    pub added: usize,
    pub enabled: usize,
}

/// Merge discovered records into `store` and enable `steps` on every file
///
/// Step state already present in the manifest is kept as is; only steps a
/// file has never seen are set to `pending`.
pub fn merge_discovered(store: &RecordStore, records: Vec<Record>, steps: &[String]) -> Result<MergeReport> {
    let report = store.transaction(|set| {
        let mut report = MergeReport::default();
        for record in records {
            if set.get(&record.input_path).is_none() {
                report.added += 1;
            }
            set.upsert(record);
        }

        for record in set.iter_mut().filter(|r| r.is_file()) {
            for step in steps {
                if !record.steps.contains_key(step) {
                    record.steps.insert(step.clone(), StepState::pending());
                    report.enabled += 1;
                }
            }
        }
        Ok(report)
    })?;

    info!(
        manifest = %store.path().display(),
        added = report.added,
        enabled = report.enabled,
        "discovered records merged"
    );
    Ok(report)
}

fn join_key(prefix: &str, rel: &Path) -> String {
    let rel = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/");
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        rel
    } else {
        format!("{prefix}/{rel}")
    }
}

fn top_folder(rel: &Path) -> String {
    let mut components = rel.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(first)), Some(_)) => first.to_string_lossy().into_owned(),
        _ => String::new(),
    }
}

/// Finder-style ordering: digit runs compare by value, so `p2` sorts before `p10`
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    natural_cmp_folded(a, b).then_with(|| a.cmp(b))
}

fn natural_cmp_folded(a: &str, b: &str) -> Ordering {
    let mut a = a.chars().peekable();
    let mut b = b.chars().peekable();

    loop {
        match (a.peek().copied(), b.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let left = take_digits(&mut a);
                let right = take_digits(&mut b);
                let ord = compare_digit_runs(&left, &right);
                if ord != Ordering::Equal {
                    return ord;
                }
            },
            (Some(x), Some(y)) => {
                let ord = x.to_lowercase().cmp(y.to_lowercase());
                if ord != Ordering::Equal {
                    return ord;
                }
                a.next();
                b.next();
            },
        }
    }
}

fn take_digits(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut run = String::new();
    while let Some(c) = chars.peek().copied().filter(char::is_ascii_digit) {
        run.push(c);
        chars.next();
    }
    run
}

fn compare_digit_runs(a: &str, b: &str) -> Ordering {
    let a_trim = a.trim_start_matches('0');
    let b_trim = b.trim_start_matches('0');
    a_trim
        .len()
        .cmp(&b_trim.len())
        .then_with(|| a_trim.cmp(b_trim))
        .then_with(|| a.len().cmp(&b.len()))
}
