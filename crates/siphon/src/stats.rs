//! Lock-free ingest counters.
//!
//! Counters are best-effort and per-streamer; `snapshot()` reads are not
//! mutually consistent.

use std::sync::atomic::{AtomicU64, Ordering};

/// Tracks what one streamer has pushed through the cluster.
#[derive(Debug, Default)]
pub struct StreamerStats {
    entries_received: AtomicU64,
    batches_submitted: AtomicU64,
    batches_acked: AtomicU64,
    batches_failed: AtomicU64,
    remaps: AtomicU64,
    responses_ignored: AtomicU64,
}

/// Point-in-time view of [`StreamerStats`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub entries_received: u64,
    pub batches_submitted: u64,
    pub batches_acked: u64,
    pub batches_failed: u64,
    pub remaps: u64,
    pub responses_ignored: u64,
}

impl StreamerStats {
    pub fn record_entries(&self, count: u64) {
        if count > 0 {
            self.entries_received.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn record_batch_submitted(&self) {
        self.batches_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_acked(&self) {
        self.batches_acked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_failed(&self) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_remap(&self) {
        self.remaps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_response_ignored(&self) {
        self.responses_ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            entries_received: self.entries_received.load(Ordering::Relaxed),
            batches_submitted: self.batches_submitted.load(Ordering::Relaxed),
            batches_acked: self.batches_acked.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            remaps: self.remaps.load(Ordering::Relaxed),
            responses_ignored: self.responses_ignored.load(Ordering::Relaxed),
        }
    }
}
