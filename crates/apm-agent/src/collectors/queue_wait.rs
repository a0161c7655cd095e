//! Queue Wait Collector (spec §4.7).
//!
//! Before a request's handler runs, there is no `Context` yet, so the
//! handler can't record its own queue-wait. This collector intercepts
//! inbound message arrival and handler entry at a lower layer, writes a
//! single pending sample per session into a process-wide table, and the
//! Request Tracer drains it at handler entry (spec §4.7's "Handoff").
//!
//! Grounded on `turbomcp-server/src/task_storage.rs`'s
//! `Arc<RwLock<HashMap<TaskId, TaskEntry>>>` pattern, narrowed here to one
//! live entry per session (spec §8: "at most one live entry keyed by S at
//! any moment" — safe because a session's messages execute sequentially,
//! spec §5).

use crate::collector::{Collector, CollectorStats, LifecycleGuard};
use crate::wrap::UnblockGuard;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Message cache bound (spec §5).
const MAX_CACHED_MESSAGES: usize = 5000;
/// TTL past which a cached message is considered stale (spec §4.7).
const MESSAGE_TTL: Duration = Duration::from_secs(5 * 60);
/// Fraction dropped, oldest-first, when still above bound after a sweep.
const EVICTION_FRACTION: f64 = 0.2;

#[derive(Debug, Clone)]
struct PendingMessage {
    queue_enter_time: Instant,
    cached_at: Instant,
}

/// A consumed queue-wait/blocking sample, ready for the Request Tracer to
/// attach to its new `Context` (spec §4.7's `(duration, waitList,
/// messageInfo, sessionId)` tuple).
#[derive(Debug, Clone)]
pub struct WaitSample {
    /// Time this handler's message spent queued before it started.
    pub queue_wait: Duration,
    /// Ids of sibling messages this handler's startup waited behind.
    pub wait_list: Vec<String>,
}

/// Process-wide table of in-flight per-session messages and, once a
/// handler starts, the resolved wait sample awaiting pickup by the
/// Request Tracer.
#[derive(Debug, Default)]
struct WaitState {
    /// Messages currently queued per session, keyed by message id.
    queued: HashMap<String, HashMap<String, PendingMessage>>,
    /// Resolved samples awaiting handoff, single-slot per session.
    resolved: HashMap<String, WaitSample>,
}

/// The Queue Wait Collector (spec §4.7).
#[derive(Debug, Clone)]
pub struct QueueWaitCollector {
    state: Arc<RwLock<WaitState>>,
    emitted: Arc<AtomicU64>,
    guard: Arc<LifecycleGuard>,
}

impl Default for QueueWaitCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueWaitCollector {
    /// Build a new, unstarted collector.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(WaitState::default())),
            emitted: Arc::new(AtomicU64::new(0)),
            guard: Arc::new(LifecycleGuard::default()),
        }
    }

    /// Stamp an inbound message's queue-enter time (spec §4.7: every
    /// inbound `method`/`sub` message is stamped on arrival).
    pub fn on_message_enqueued(&self, session_id: &str, message_id: &str) {
        let mut state = self.state.write();
        let session_queue = state.queued.entry(session_id.to_string()).or_default();
        if session_queue.len() >= MAX_CACHED_MESSAGES {
            evict_oldest(session_queue, (MAX_CACHED_MESSAGES as f64 * EVICTION_FRACTION) as usize);
        }
        session_queue.insert(
            message_id.to_string(),
            PendingMessage { queue_enter_time: Instant::now(), cached_at: Instant::now() },
        );
    }

    /// Called at the per-kind handler entry point, before the Request
    /// Tracer's own `Context` exists. Computes this message's own queue
    /// wait and the waited-on contribution it is imposing on siblings
    /// still queued, then writes the resolved sample for this session
    /// (spec §4.7's "Waited-on computation").
    pub fn on_handler_entry(&self, session_id: &str, message_id: &str, handler_start: Instant) {
        let mut state = self.state.write();
        let Some(session_queue) = state.queued.get_mut(session_id) else {
            return;
        };
        let entered_at = session_queue.remove(message_id).map(|m| m.queue_enter_time);
        let wait_list: Vec<String> = session_queue.keys().cloned().collect();

        let queue_wait = entered_at.map_or(Duration::ZERO, |enter| handler_start.saturating_duration_since(enter));

        state.resolved.insert(session_id.to_string(), WaitSample { queue_wait, wait_list });
    }

    /// Drain this session's resolved wait sample, if any (spec §4.7's
    /// "Handoff" — consumed exactly once by the Request Tracer).
    pub fn take_sample(&self, session_id: &str) -> Option<WaitSample> {
        self.state.write().resolved.remove(session_id)
    }

    /// Compute the cumulative time this handler's occupancy is forcing
    /// sibling messages in the same session to wait (spec §4.7).
    #[must_use]
    pub fn waited_on(&self, session_id: &str, handler_start: Instant) -> Duration {
        let state = self.state.read();
        let Some(session_queue) = state.queued.get(session_id) else {
            return Duration::ZERO;
        };
        let now = Instant::now();
        session_queue
            .values()
            .map(|m| now.saturating_duration_since(m.queue_enter_time.max(handler_start)))
            .fold(Duration::ZERO, |acc, d| acc + d)
    }

    /// Wrap a session's `unblock` callable to record blocking-time and
    /// waited-on at invocation (spec §4.3, §4.7).
    #[must_use]
    pub fn wrap_unblock(&self, original: impl Fn() + Send + Sync + 'static) -> UnblockGuard {
        UnblockGuard::new(original)
    }

    /// Evict all entries for a closed session (spec §4.7's "Session
    /// bookkeeping").
    pub fn on_session_closed(&self, session_id: &str) {
        let mut state = self.state.write();
        state.queued.remove(session_id);
        state.resolved.remove(session_id);
    }

    /// Sweep stale cached messages across all sessions (spec §4.7: "TTL
    /// ... swept every 60s").
    pub fn sweep(&self) {
        let mut state = self.state.write();
        let now = Instant::now();
        for session_queue in state.queued.values_mut() {
            session_queue.retain(|_, m| now.duration_since(m.cached_at) < MESSAGE_TTL);
        }
        state.queued.retain(|_, q| !q.is_empty());
    }
}

fn evict_oldest(queue: &mut HashMap<String, PendingMessage>, n: usize) {
    let mut by_age: Vec<(String, Instant)> = queue.iter().map(|(k, v)| (k.clone(), v.cached_at)).collect();
    by_age.sort_by_key(|(_, cached_at)| *cached_at);
    for (key, _) in by_age.into_iter().take(n.max(1)) {
        queue.remove(&key);
    }
}

/// Stats reported by [`QueueWaitCollector::stats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueWaitStats {
    /// Resolved samples handed off to the Request Tracer.
    pub emitted: u64,
}

impl CollectorStats for QueueWaitStats {
    fn emitted_count(&self) -> u64 {
        self.emitted
    }
}

impl Collector for QueueWaitCollector {
    type Stats = QueueWaitStats;

    fn name(&self) -> &'static str {
        "queue_wait"
    }

    fn start(&self) {
        if !self.guard.begin_start() {
            tracing::debug!("queue wait collector already started");
        }
    }

    fn stop(&self) {
        if !self.guard.begin_stop() {
            tracing::debug!("queue wait collector already stopped");
        }
    }

    fn stats(&self) -> Self::Stats {
        QueueWaitStats { emitted: self.emitted.load(Ordering::Relaxed) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn resolves_queue_wait_and_wait_list_at_handler_entry() {
        let c = QueueWaitCollector::new();
        c.on_message_enqueued("s1", "m1");
        c.on_message_enqueued("s1", "m2");
        sleep(Duration::from_millis(5));
        c.on_handler_entry("s1", "m1", Instant::now());
        let sample = c.take_sample("s1").expect("sample present");
        assert!(sample.queue_wait >= Duration::from_millis(5));
        assert_eq!(sample.wait_list, vec!["m2".to_string()]);
    }

    #[test]
    fn take_sample_is_single_slot_per_session() {
        let c = QueueWaitCollector::new();
        c.on_message_enqueued("s1", "m1");
        c.on_handler_entry("s1", "m1", Instant::now());
        assert!(c.take_sample("s1").is_some());
        assert!(c.take_sample("s1").is_none());
    }

    #[test]
    fn session_close_evicts_all_session_state() {
        let c = QueueWaitCollector::new();
        c.on_message_enqueued("s1", "m1");
        c.on_handler_entry("s1", "m1", Instant::now());
        c.on_session_closed("s1");
        assert!(c.take_sample("s1").is_none());
    }
}
