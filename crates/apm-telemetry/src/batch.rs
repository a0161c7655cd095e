//! Per-kind `(queue, bytes)` batching (spec §4.2).
//!
//! Each [`TelemetryKind`](crate::kinds::TelemetryKind) owns an independent
//! batch. `add` flushes the batch first if the incoming item would
//! overflow the byte budget, then appends; a flush is also forced once
//! the queue reaches the count limit. The byte counter is always the sum
//! of `estimate()` over the queued items (spec §8's invariant) — enforced
//! here by only ever mutating `bytes` in lock-step with `items`.

use apm_core::size::estimate;
use serde_json::Value;

/// A single kind's in-memory batch.
#[derive(Debug, Default)]
pub struct Batch {
    items: Vec<Value>,
    bytes: usize,
}

/// Outcome of an [`Batch::add`] call: whether the caller must flush the
/// batch before or after appending the new item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Item was appended; no flush required yet.
    Appended,
    /// The byte budget would have overflowed, so the batch was flushed
    /// before the item was appended into a fresh batch.
    FlushedBeforeAppend,
    /// The item was appended and then the count limit was reached, so
    /// the batch (including this item) must now be flushed.
    AppendedThenAtCountLimit,
}

impl Batch {
    /// Number of items currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Total estimated bytes of the items currently queued.
    #[must_use]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Add an item, flushing first if needed to stay within
    /// `byte_budget`, per spec §4.2's four-step `add` algorithm. Returns
    /// the drained items if a flush-before-append was required, and an
    /// [`AddOutcome`] describing what the caller should do next.
    pub fn add(
        &mut self,
        item: Value,
        byte_budget: usize,
        count_limit: usize,
    ) -> (Option<Vec<Value>>, AddOutcome) {
        let item_bytes = estimate(&item);

        if self.bytes + item_bytes > byte_budget && !self.items.is_empty() {
            let drained = self.drain();
            self.items.push(item);
            self.bytes = item_bytes;
            return (Some(drained), AddOutcome::FlushedBeforeAppend);
        }

        self.items.push(item);
        self.bytes += item_bytes;

        if self.items.len() >= count_limit {
            (None, AddOutcome::AppendedThenAtCountLimit)
        } else {
            (None, AddOutcome::Appended)
        }
    }

    /// Atomically remove and return all queued items, zeroing the byte
    /// counter (spec §8: `bytes[kind] = 0` immediately after a flush).
    pub fn drain(&mut self) -> Vec<Value> {
        self.bytes = 0;
        std::mem::take(&mut self.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bytes_tracks_sum_of_estimates_between_flushes() {
        let mut batch = Batch::default();
        let (_, outcome) = batch.add(json!("hi"), 1_000_000, 1_000_000);
        assert_eq!(outcome, AddOutcome::Appended);
        assert_eq!(batch.bytes(), estimate(&json!("hi")));
    }

    #[test]
    fn flush_zeroes_bytes_and_empties_queue() {
        let mut batch = Batch::default();
        batch.add(json!("a"), 1_000_000, 1_000_000);
        batch.add(json!("b"), 1_000_000, 1_000_000);
        let drained = batch.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(batch.bytes(), 0);
        assert!(batch.is_empty());
    }

    #[test]
    fn count_limit_signals_flush_after_append() {
        let mut batch = Batch::default();
        batch.add(json!(1), 1_000_000, 3);
        batch.add(json!(2), 1_000_000, 3);
        let (_, outcome) = batch.add(json!(3), 1_000_000, 3);
        assert_eq!(outcome, AddOutcome::AppendedThenAtCountLimit);
    }

    #[test]
    fn byte_budget_overflow_flushes_before_append() {
        // Spec §8 boundary: a 1-byte item added when bytes = budget - 1
        // flushes before enqueue if it would overflow; does not if it
        // fits exactly.
        let mut batch = Batch::default();
        // "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaa" (30 chars) costs 60 bytes.
        let thirty_chars = "a".repeat(30);
        batch.add(json!(thirty_chars), 120, 1_000_000);
        assert_eq!(batch.bytes(), 60);

        // Adding another exactly-fitting 60-byte item keeps it in this batch.
        let (drained, outcome) = batch.add(json!(thirty_chars.clone()), 120, 1_000_000);
        assert!(drained.is_none());
        assert_eq!(outcome, AddOutcome::Appended);
        assert_eq!(batch.bytes(), 120);

        // A third item of the same size would overflow 120 -> flush first.
        let (drained, outcome) = batch.add(json!(thirty_chars), 120, 1_000_000);
        assert!(drained.is_some());
        assert_eq!(drained.unwrap().len(), 2);
        assert_eq!(outcome, AddOutcome::FlushedBeforeAppend);
        assert_eq!(batch.bytes(), 60);
    }

    #[test]
    fn five_five_five_item_batch_size_eviction_scenario() {
        // End-to-end scenario 5: batchSize=3, batchSizeBytes=200, four
        // items of estimated size 60 each; flush fires after the third
        // add, fourth starts a fresh batch.
        let mut batch = Batch::default();
        let item = || json!("a".repeat(30));
        let (d1, o1) = batch.add(item(), 200, 3);
        assert!(d1.is_none());
        assert_eq!(o1, AddOutcome::Appended);
        let (d2, o2) = batch.add(item(), 200, 3);
        assert!(d2.is_none());
        assert_eq!(o2, AddOutcome::Appended);
        let (d3, o3) = batch.add(item(), 200, 3);
        assert!(d3.is_none());
        assert_eq!(o3, AddOutcome::AppendedThenAtCountLimit);
        // Caller flushes here in response to o3.
        batch.drain();
        let (d4, o4) = batch.add(item(), 200, 3);
        assert!(d4.is_none());
        assert_eq!(o4, AddOutcome::Appended);
        assert_eq!(batch.len(), 1);
    }
}
