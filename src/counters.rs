use std::sync::atomic::{AtomicU64, Ordering};

/// Application counters, injected through the apply context so callers and
/// tests can observe them instead of reading process-wide statics.
#[derive(Debug, Default)]
pub struct ApplyCounters {
    ops_applied: AtomicU64,
    write_conflict_retries: AtomicU64,
    grouped_inserts: AtomicU64,
}

impl ApplyCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_applied(&self, n: u64) {
        self.ops_applied.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_conflict_retry(&self) {
        self.write_conflict_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_grouped(&self, n: u64) {
        self.grouped_inserts.fetch_add(n, Ordering::Relaxed);
    }

    pub fn ops_applied(&self) -> u64 {
        self.ops_applied.load(Ordering::Relaxed)
    }

    pub fn write_conflict_retries(&self) -> u64 {
        self.write_conflict_retries.load(Ordering::Relaxed)
    }

    pub fn grouped_inserts(&self) -> u64 {
        self.grouped_inserts.load(Ordering::Relaxed)
    }
}
