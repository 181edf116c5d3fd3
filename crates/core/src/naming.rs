//! Bootstrap snapshot labels.
//!
//! Labels are `<prefix>-<UTC timestamp>-<pid>-<counter>`: the timestamp and
//! process id separate runs, the counter separates labels within one run.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};

/// Generates unique bootstrap snapshot labels for one run.
#[derive(Debug)]
pub struct SnapshotLabelGenerator {
    prefix: String,
    pid: u32,
    counter: AtomicU64,
}

impl SnapshotLabelGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self::with_pid(prefix, std::process::id())
    }

    pub fn with_pid(prefix: impl Into<String>, pid: u32) -> Self {
        Self {
            prefix: prefix.into(),
            pid,
            counter: AtomicU64::new(0),
        }
    }

    pub fn next_label(&self) -> String {
        self.label_at(Utc::now())
    }

    /// Label for the given instant; the counter still advances.
    pub fn label_at(&self, now: DateTime<Utc>) -> String {
        let seq = self.counter.fetch_add(1, Ordering::SeqCst);
        format!(
            "{}-{}-{}-{}",
            self.prefix,
            now.format("%Y%m%dT%H%M%SZ"),
            self.pid,
            seq
        )
    }
}
