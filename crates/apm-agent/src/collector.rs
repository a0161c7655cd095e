//! The Collector Lifecycle contract (spec §4.4).
//!
//! Grounded on the idempotent `start`/`stop` pair of the teacher's
//! `ObservabilityGuard::init` and the single-repeating-timer-field
//! discipline of its bounded background-sweep tasks: a collector with
//! periodic work owns at most one `JoinHandle` at a time, stored behind
//! a lock so `stop()` can cancel it deterministically.

use std::fmt;

/// Point-in-time counters a collector can report (spec §4.4's
/// `getStats()`). Kept intentionally loose — each collector's concrete
/// stats type documents its own fields; this is the shared display/debug
/// surface `Agent::stats()` aggregates over.
pub trait CollectorStats: fmt::Debug + Send + Sync {
    /// Number of items this collector has emitted to the Egress Client
    /// since `start()`.
    fn emitted_count(&self) -> u64;
}

/// Lifecycle every collector implements (spec §4.4).
///
/// `start`/`stop` must be idempotent: a second call while already in that
/// state is a no-op logged at debug level, never an error.
pub trait Collector: Send + Sync {
    /// This collector's stats snapshot type.
    type Stats: CollectorStats;

    /// Human-readable name, used in logs and the single-shot guard keys
    /// collectors register under when wrapping shared host functions.
    fn name(&self) -> &'static str;

    /// Start the collector: install wrappers/subscriptions and, if it has
    /// periodic work, spawn its one repeating timer. Idempotent.
    fn start(&self);

    /// Stop the collector: cancel its timer and best-effort restore any
    /// wrapped host state per the wrapping discipline's restore-or-leave
    /// rule (spec §4.3). Idempotent.
    fn stop(&self);

    /// Snapshot this collector's counters.
    fn stats(&self) -> Self::Stats;
}

/// Helper a [`Collector`] impl can embed to get idempotent start/stop
/// bookkeeping for free, matching spec §4.4's "second call is a no-op
/// logged at debug level" requirement without each collector hand-rolling
/// an `AtomicBool` check.
#[derive(Debug, Default)]
pub struct LifecycleGuard {
    running: std::sync::atomic::AtomicBool,
}

impl LifecycleGuard {
    /// Attempt to transition from stopped to running. Returns `true` if
    /// this call performed the transition (caller should proceed with
    /// `start()` work); `false` if already running (caller should log at
    /// debug and return).
    pub fn begin_start(&self) -> bool {
        !self.running.swap(true, std::sync::atomic::Ordering::SeqCst)
    }

    /// Attempt to transition from running to stopped. Returns `true` if
    /// this call performed the transition.
    pub fn begin_stop(&self) -> bool {
        self.running.swap(false, std::sync::atomic::Ordering::SeqCst)
    }

    /// Whether the collector is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_start_is_idempotent() {
        let guard = LifecycleGuard::default();
        assert!(guard.begin_start());
        assert!(!guard.begin_start());
        assert!(guard.is_running());
    }

    #[test]
    fn stop_stop_is_idempotent() {
        let guard = LifecycleGuard::default();
        guard.begin_start();
        assert!(guard.begin_stop());
        assert!(!guard.begin_stop());
        assert!(!guard.is_running());
    }
}
