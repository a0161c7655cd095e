//! Egress client counters, exposed via `EgressClient::stats()`.

use std::sync::atomic::{AtomicU64, Ordering};

/// Cumulative send counters (spec §7: `stats.sent`, `stats.failed`).
#[derive(Debug, Default)]
pub struct Stats {
    sent: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time snapshot of [`Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Items successfully delivered (HTTP 202).
    pub sent: u64,
    /// Items permanently dropped after exhausting retries or failing to
    /// serialize.
    pub failed: u64,
    /// Items that entered the retry queue at least once.
    pub retried: u64,
    /// Retry-queue entries evicted by overflow.
    pub dropped: u64,
}

impl Stats {
    pub(crate) fn record_sent(&self, n: u64) {
        self.sent.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_failed(&self, n: u64) {
        self.failed.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_retried(&self, n: u64) {
        self.retried.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
    }

    /// Read a consistent-enough snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}
