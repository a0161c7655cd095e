//! Job Monitor (spec §4.9).
//!
//! A factory + adapter pattern: [`JobQueueAdapter`] is implemented once per
//! supported job queue package, exposing package-name, availability-check,
//! queue-stats, and setup/cleanup hooks. [`JobMonitor`] is the shared base
//! that does lifecycle tracking, queue-delay measurement, bounded history,
//! type inference, argument sanitization, and periodic emission, the way
//! `other_examples/.../RushObservability-query-api` factors a family of
//! near-identical backends behind one thin adapter trait.

use apm_core::sanitize::sanitize_args;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::support::BoundedBuffer;
use crate::collector::{Collector, CollectorStats, LifecycleGuard};
use apm_telemetry::{EgressClient, TelemetryKind};

/// Bounded job-history size (spec §4.9's "history with bounded size").
const HISTORY_SIZE: usize = 200;
/// Error stack traces are truncated to this many lines (spec §4.9's
/// "bounded stack lines").
const MAX_STACK_LINES: usize = 10;

/// Terminal outcome of a job (spec §4.9's lifecycle states).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Job ran to completion successfully.
    Completed,
    /// Job's handler raised an error.
    Failed,
    /// Job was cancelled before completion.
    Cancelled,
}

/// One entry in the bounded job history (spec §4.9).
#[derive(Debug, Clone)]
pub struct JobHistoryEntry {
    /// Job name as reported by the queue (used for substring-based type
    /// inference, spec §4.9).
    pub name: String,
    /// Inferred job type, e.g. `"email"`, `"cleanup"`, `"report"`.
    pub inferred_type: String,
    /// Time spent queued before a worker picked it up.
    pub queue_delay: Duration,
    /// Time spent executing.
    pub run_duration: Duration,
    /// Terminal outcome.
    pub outcome: JobOutcome,
    /// Sanitized job arguments.
    pub args: Value,
    /// Error message, truncated stack, if the job failed.
    pub error: Option<String>,
}

/// Adapter a job-queue package implements to plug into [`JobMonitor`] (spec
/// §4.9's "factory + adapter pattern").
pub trait JobQueueAdapter: Send + Sync {
    /// Package name this adapter integrates, used in logs and the
    /// `jobsPackage` configuration match.
    fn package_name(&self) -> &'static str;

    /// Whether the underlying package is actually loaded/available in this
    /// process (spec §7's "Host API unavailable" guard).
    fn is_available(&self) -> bool;

    /// Current queue depth, if the package exposes one.
    fn queue_stats(&self) -> Option<QueueStats>;

    /// Install hooks on the package's job lifecycle events. Returns `true`
    /// if hooks were installed (idempotent — a second call is a no-op).
    fn setup_hooks(&self) -> bool;

    /// Remove any installed hooks, restoring the package's original
    /// behavior (spec §4.3's wrapping discipline, applied to job hooks).
    fn cleanup_hooks(&self);
}

/// Point-in-time queue depth, as reported by a [`JobQueueAdapter`].
#[derive(Debug, Clone, Copy)]
pub struct QueueStats {
    /// Jobs waiting to be picked up.
    pub pending: u64,
    /// Jobs currently executing.
    pub in_progress: u64,
}

/// A no-op adapter used when no job queue package is configured (spec
/// §7's "collector logs at info and remains inert").
#[derive(Debug, Default)]
pub struct NullJobAdapter;

impl JobQueueAdapter for NullJobAdapter {
    fn package_name(&self) -> &'static str {
        "none"
    }

    fn is_available(&self) -> bool {
        false
    }

    fn queue_stats(&self) -> Option<QueueStats> {
        None
    }

    fn setup_hooks(&self) -> bool {
        false
    }

    fn cleanup_hooks(&self) {}
}

fn infer_job_type(name: &str) -> String {
    let lower = name.to_lowercase();
    const KNOWN_TYPES: &[&str] = &["email", "report", "cleanup", "export", "import", "notification", "sync", "webhook"];
    KNOWN_TYPES
        .iter()
        .find(|t| lower.contains(*t))
        .map(|t| (*t).to_string())
        .unwrap_or_else(|| "other".to_string())
}

fn truncate_stack(stack: &str) -> String {
    stack.lines().take(MAX_STACK_LINES).collect::<Vec<_>>().join("\n")
}

struct InFlightJob {
    name: String,
    enqueued_at: Instant,
    started_at: Option<Instant>,
}

/// The shared job-lifecycle tracking base (spec §4.9). Generic over a
/// [`JobQueueAdapter`] so the same lifecycle/history/inference logic works
/// across job-queue packages.
pub struct JobMonitor<A: JobQueueAdapter> {
    adapter: Arc<A>,
    in_flight: parking_lot::Mutex<std::collections::HashMap<String, InFlightJob>>,
    history: parking_lot::Mutex<BoundedBuffer<JobHistoryEntry>>,
    emitted: Arc<AtomicU64>,
    guard: Arc<LifecycleGuard>,
}

impl<A: JobQueueAdapter> std::fmt::Debug for JobMonitor<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobMonitor").field("package", &self.adapter.package_name()).finish()
    }
}

impl<A: JobQueueAdapter> JobMonitor<A> {
    /// Build a monitor over the given adapter.
    #[must_use]
    pub fn new(adapter: A) -> Self {
        Self {
            adapter: Arc::new(adapter),
            in_flight: parking_lot::Mutex::new(std::collections::HashMap::new()),
            history: parking_lot::Mutex::new(BoundedBuffer::new(HISTORY_SIZE)),
            emitted: Arc::new(AtomicU64::new(0)),
            guard: Arc::new(LifecycleGuard::default()),
        }
    }

    /// Record a job being enqueued.
    pub fn on_enqueue(&self, job_id: &str, name: &str) {
        self.in_flight.lock().insert(job_id.to_string(), InFlightJob { name: name.to_string(), enqueued_at: Instant::now(), started_at: None });
    }

    /// Record a job being picked up by a worker (spec §4.9's
    /// "queue-delay").
    pub fn on_start(&self, job_id: &str) {
        if let Some(job) = self.in_flight.lock().get_mut(job_id) {
            job.started_at = Some(Instant::now());
        }
    }

    /// Record a job's terminal outcome.
    pub fn on_finish(&self, job_id: &str, outcome: JobOutcome, args: &Value, error: Option<String>) {
        let Some(job) = self.in_flight.lock().remove(job_id) else {
            return;
        };
        let now = Instant::now();
        let started_at = job.started_at.unwrap_or(now);
        let entry = JobHistoryEntry {
            inferred_type: infer_job_type(&job.name),
            name: job.name,
            queue_delay: started_at.saturating_duration_since(job.enqueued_at),
            run_duration: now.saturating_duration_since(started_at),
            outcome,
            args: sanitize_args(args),
            error: error.as_deref().map(truncate_stack),
        };
        self.history.lock().push(entry);
    }

    /// Emit a periodic summary: queue stats (if the adapter provides them)
    /// plus counts by outcome and type over the buffered history.
    pub fn emit(&self, egress: &EgressClient) {
        let history = self.history.lock().drain();
        if history.is_empty() && self.adapter.queue_stats().is_none() {
            return;
        }

        let completed = history.iter().filter(|j| j.outcome == JobOutcome::Completed).count();
        let failed = history.iter().filter(|j| j.outcome == JobOutcome::Failed).count();
        let cancelled = history.iter().filter(|j| j.outcome == JobOutcome::Cancelled).count();
        let queue_stats = self.adapter.queue_stats();

        let payload = json!({
            "package": self.adapter.package_name(),
            "completed": completed,
            "failed": failed,
            "cancelled": cancelled,
            "pending": queue_stats.map(|q| q.pending),
            "inProgress": queue_stats.map(|q| q.in_progress),
        });
        egress.add(TelemetryKind::Jobs, payload);
        self.emitted.fetch_add(1, Ordering::Relaxed);
    }
}

/// Stats reported by [`JobMonitor::stats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct JobMonitorStats {
    /// Summaries emitted since start.
    pub emitted: u64,
}

impl CollectorStats for JobMonitorStats {
    fn emitted_count(&self) -> u64 {
        self.emitted
    }
}

impl<A: JobQueueAdapter> Collector for JobMonitor<A> {
    type Stats = JobMonitorStats;

    fn name(&self) -> &'static str {
        "jobs"
    }

    fn start(&self) {
        if !self.guard.begin_start() {
            tracing::debug!("job monitor already started");
            return;
        }
        if self.adapter.is_available() {
            self.adapter.setup_hooks();
        } else {
            tracing::info!(package = self.adapter.package_name(), "job queue package unavailable, monitor inert");
        }
    }

    fn stop(&self) {
        if !self.guard.begin_stop() {
            tracing::debug!("job monitor already stopped");
            return;
        }
        self.adapter.cleanup_hooks();
    }

    fn stats(&self) -> Self::Stats {
        JobMonitorStats { emitted: self.emitted.load(Ordering::Relaxed) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FakeAdapter;

    impl JobQueueAdapter for FakeAdapter {
        fn package_name(&self) -> &'static str {
            "fake-queue"
        }

        fn is_available(&self) -> bool {
            true
        }

        fn queue_stats(&self) -> Option<QueueStats> {
            Some(QueueStats { pending: 2, in_progress: 1 })
        }

        fn setup_hooks(&self) -> bool {
            true
        }

        fn cleanup_hooks(&self) {}
    }

    #[test]
    fn infers_type_from_name_substring() {
        assert_eq!(infer_job_type("send-welcome-email"), "email");
        assert_eq!(infer_job_type("nightly-cleanup-job"), "cleanup");
        assert_eq!(infer_job_type("totally-custom-task"), "other");
    }

    #[test]
    fn lifecycle_records_queue_delay_and_history() {
        let monitor = JobMonitor::new(FakeAdapter);
        monitor.on_enqueue("j1", "send-welcome-email");
        monitor.on_start("j1");
        monitor.on_finish("j1", JobOutcome::Completed, &json!({"userId": 1}), None);
        let config = apm_telemetry::AgentConfig::builder().api_key("k").endpoint("http://127.0.0.1:1").build().unwrap();
        let egress = EgressClient::new(config).unwrap();
        monitor.emit(&egress);
        assert_eq!(egress.queued_len(TelemetryKind::Jobs), 1);
    }

    #[test]
    fn unavailable_package_is_inert_on_start() {
        struct UnavailableAdapter;
        impl JobQueueAdapter for UnavailableAdapter {
            fn package_name(&self) -> &'static str {
                "missing"
            }
            fn is_available(&self) -> bool {
                false
            }
            fn queue_stats(&self) -> Option<QueueStats> {
                None
            }
            fn setup_hooks(&self) -> bool {
                true
            }
            fn cleanup_hooks(&self) {}
        }
        let monitor = JobMonitor::new(UnavailableAdapter);
        monitor.start();
        assert!(monitor.guard.is_running());
    }
}
