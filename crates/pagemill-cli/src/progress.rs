//! Progress bar utilities for stage runs
//!
//! Bars are only drawn by the process the operator started. Workers report
//! progress as event lines instead, and `PAGEMILL_NO_PROGRESS` turns rendering
//! off entirely; in both cases hidden bars are handed out so callers never
//! branch on it.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

const STAGE_TEMPLATE: &str =
    "{prefix:.bold} {spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({eta}) {msg}";
const WORKER_TEMPLATE: &str = "{prefix:>10.bold} [{bar:30.cyan/blue}] {pos}/{len} {msg}";

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
}

/// Bar for a whole stage
pub fn create_stage_bar(total: u64, stage: &str, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    pb.set_style(style(STAGE_TEMPLATE));
    pb.set_prefix(stage.to_string());
    pb
}

/// One bar per worker, each sized to that worker's expected share
pub fn create_worker_bars(shares: &[usize], visible: bool) -> (MultiProgress, Vec<ProgressBar>) {
    let multi = MultiProgress::new();
    let bars = shares
        .iter()
        .enumerate()
        .map(|(index, share)| {
            if !visible {
                return ProgressBar::hidden();
            }
            let pb = multi.add(ProgressBar::new(*share as u64));
            pb.set_style(style(WORKER_TEMPLATE));
            pb.set_prefix(format!("worker {index}"));
            pb
        })
        .collect();
    (multi, bars)
}

/// `processed/skipped/failed` suffix shown next to a bar
pub fn stats_message(processed: usize, skipped: usize, failed: usize) -> String {
    let mut parts = vec![format!("{processed} done")];
    if skipped > 0 {
        parts.push(format!("{skipped} skipped"));
    }
    if failed > 0 {
        parts.push(format!("{failed} failed"));
    }
    parts.join(", ")
}
