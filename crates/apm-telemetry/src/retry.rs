//! Bounded, backed-off retry queue for failed sends (spec §4.2).
//!
//! Grounded on the exponential-backoff-with-jitter idiom referenced in
//! `other_examples/.../jwilger-caxton`: delay doubles each attempt, capped,
//! plus a uniform jitter fraction of the base delay so that many batches
//! failing at once don't retry in lockstep and thunder the ingest
//! endpoint.

use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;

/// Retry queue capacity per kind (spec §5's memory caps).
pub const MAX_RETRY_QUEUE: usize = 100;
/// Backoff cap (spec §4.2: `min(2^attempt · 1s, 30s)`).
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// Jitter fraction of the base delay (spec §4.2: `uniform(0, 0.2·base)`).
const JITTER_FRACTION: f64 = 0.2;

/// One batch awaiting retry.
#[derive(Debug, Clone)]
pub struct RetryEntry {
    /// The batch's items, to be resent verbatim.
    pub items: Vec<Value>,
    /// Attempt number this entry will be sent as (1-indexed on first retry).
    pub attempt: u32,
}

/// Compute the retry delay for a given attempt number, including jitter.
///
/// `rng` is injected so tests can assert exact bounds rather than a
/// statistical sample; production call sites pass `fastrand::f64`.
#[must_use]
pub fn backoff_delay(attempt: u32, jitter_sample: f64) -> Duration {
    let base_secs = 2u64.saturating_pow(attempt).min(MAX_BACKOFF.as_secs());
    let base = Duration::from_secs(base_secs).min(MAX_BACKOFF);
    let jitter = base.mul_f64(JITTER_FRACTION * jitter_sample.clamp(0.0, 1.0));
    base + jitter
}

/// A bounded FIFO of batches pending retry for a single telemetry kind.
#[derive(Debug, Default)]
pub struct RetryQueue {
    entries: VecDeque<RetryEntry>,
}

impl RetryQueue {
    /// Current number of entries queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Push a failed batch onto the queue. If full, the oldest entry is
    /// dropped to make room (spec §8: "the dropped batch is the oldest
    /// entry present at drop time").
    ///
    /// Returns the dropped entry, if eviction occurred.
    pub fn push(&mut self, entry: RetryEntry) -> Option<RetryEntry> {
        let dropped = if self.entries.len() >= MAX_RETRY_QUEUE {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(entry);
        dropped
    }

    /// Pop the oldest entry ready to be retried.
    pub fn pop(&mut self) -> Option<RetryEntry> {
        self.entries.pop_front()
    }

    /// Drop all entries, e.g. on `stop()` cancelling pending retries.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_and_caps_at_thirty_seconds() {
        assert_eq!(backoff_delay(0, 0.0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1, 0.0), Duration::from_secs(2));
        assert_eq!(backoff_delay(2, 0.0), Duration::from_secs(4));
        // 2^6 = 64s, capped to 30s base.
        assert_eq!(backoff_delay(6, 0.0), Duration::from_secs(30));
    }

    #[test]
    fn jitter_adds_up_to_twenty_percent_of_base() {
        let base = backoff_delay(1, 0.0);
        let jittered_max = backoff_delay(1, 1.0);
        let extra = jittered_max - base;
        assert!(extra <= base.mul_f64(0.2) + Duration::from_millis(1));
        assert!(extra > Duration::ZERO);
    }

    #[test]
    fn overflow_drops_oldest_entry() {
        let mut q = RetryQueue::default();
        for i in 0..MAX_RETRY_QUEUE {
            let dropped = q.push(RetryEntry { items: vec![serde_json::json!(i)], attempt: 1 });
            assert!(dropped.is_none());
        }
        let dropped = q.push(RetryEntry { items: vec![serde_json::json!("overflow")], attempt: 1 });
        let dropped = dropped.expect("oldest entry evicted");
        assert_eq!(dropped.items[0], serde_json::json!(0));
        assert_eq!(q.len(), MAX_RETRY_QUEUE);
    }

    #[test]
    fn pop_returns_fifo_order() {
        let mut q = RetryQueue::default();
        q.push(RetryEntry { items: vec![serde_json::json!(1)], attempt: 1 });
        q.push(RetryEntry { items: vec![serde_json::json!(2)], attempt: 1 });
        assert_eq!(q.pop().unwrap().items[0], serde_json::json!(1));
        assert_eq!(q.pop().unwrap().items[0], serde_json::json!(2));
        assert!(q.pop().is_none());
    }
}
