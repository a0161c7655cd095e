//! System Metrics Collector.
//!
//! Process-level resource metrics (CPU, memory, event-loop lag) are kept
//! regardless of collector configuration, the same way spec §4.2 keeps
//! errors and operational counters un-sampled: there is no
//! `CollectorToggles` field for this one and [`crate::agent::Agent::start`]
//! always starts it, polling on `CollectorIntervals::system_metrics`.
//!
//! Grounded on `apm-telemetry`'s `stats.rs` counters idiom for the
//! always-on, never-sampled accounting style, generalized from byte/item
//! counts to process resource samples.

use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::support::{percentile, BoundedBuffer};
use crate::collector::{Collector, CollectorStats, LifecycleGuard};
use apm_telemetry::{EgressClient, TelemetryKind};

const SAMPLES_PER_WINDOW: usize = 500;

/// One point-in-time resource reading, supplied by the host integration's
/// polling hook (actual OS-level sampling is a host concern; this
/// collector only aggregates and reports).
#[derive(Debug, Clone, Copy)]
pub struct ResourceSample {
    /// Fraction of a single core consumed since the last sample (0..=1+).
    pub cpu_fraction: f64,
    /// Resident set size in bytes.
    pub rss_bytes: u64,
    /// Event-loop lag in milliseconds, if the host runtime exposes one.
    pub event_loop_lag_ms: Option<f64>,
}

#[derive(Debug)]
struct MetricsWindow {
    cpu: BoundedBuffer<f64>,
    rss: BoundedBuffer<f64>,
    lag: BoundedBuffer<f64>,
    started_at: Instant,
}

impl Default for MetricsWindow {
    fn default() -> Self {
        Self {
            cpu: BoundedBuffer::new(SAMPLES_PER_WINDOW),
            rss: BoundedBuffer::new(SAMPLES_PER_WINDOW),
            lag: BoundedBuffer::new(SAMPLES_PER_WINDOW),
            started_at: Instant::now(),
        }
    }
}

/// Aggregates [`ResourceSample`]s into a periodic summary (CPU/RSS
/// percentiles, event-loop lag percentile when available).
#[derive(Debug, Clone)]
pub struct SystemMetricsCollector {
    window: Arc<parking_lot::Mutex<MetricsWindow>>,
    emitted: Arc<AtomicU64>,
    guard: Arc<LifecycleGuard>,
}

impl Default for SystemMetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemMetricsCollector {
    /// Build a new collector.
    #[must_use]
    pub fn new() -> Self {
        Self {
            window: Arc::new(parking_lot::Mutex::new(MetricsWindow::default())),
            emitted: Arc::new(AtomicU64::new(0)),
            guard: Arc::new(LifecycleGuard::default()),
        }
    }

    /// Record one poll's resource reading.
    pub fn record(&self, sample: ResourceSample) {
        let mut window = self.window.lock();
        window.cpu.push(sample.cpu_fraction);
        window.rss.push(sample.rss_bytes as f64);
        if let Some(lag) = sample.event_loop_lag_ms {
            window.lag.push(lag);
        }
    }

    /// Drain the current window and emit one summary.
    pub fn emit(&self, egress: &EgressClient) {
        let mut window = self.window.lock();
        let cpu = window.cpu.drain();
        let rss = window.rss.drain();
        let lag = window.lag.drain();
        let elapsed = window.started_at.elapsed();
        window.started_at = Instant::now();
        drop(window);

        if cpu.is_empty() && rss.is_empty() {
            return;
        }

        let payload = json!({
            "windowSeconds": elapsed.as_secs_f64(),
            "cpu": {
                "p50": percentile(&cpu, 50.0),
                "p95": percentile(&cpu, 95.0),
            },
            "rssBytes": {
                "p50": percentile(&rss, 50.0),
                "p95": percentile(&rss, 95.0),
            },
            "eventLoopLagMs": {
                "p50": percentile(&lag, 50.0),
                "p95": percentile(&lag, 95.0),
            },
        });
        egress.add(TelemetryKind::SystemMetrics, payload);
        self.emitted.fetch_add(1, Ordering::Relaxed);
    }
}

/// Stats reported by [`SystemMetricsCollector::stats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMetricsCollectorStats {
    /// Summaries emitted since start.
    pub emitted: u64,
}

impl CollectorStats for SystemMetricsCollectorStats {
    fn emitted_count(&self) -> u64 {
        self.emitted
    }
}

impl Collector for SystemMetricsCollector {
    type Stats = SystemMetricsCollectorStats;

    fn name(&self) -> &'static str {
        "system_metrics"
    }

    fn start(&self) {
        if !self.guard.begin_start() {
            tracing::debug!("system metrics collector already started");
        }
    }

    fn stop(&self) {
        if !self.guard.begin_stop() {
            tracing::debug!("system metrics collector already stopped");
        }
    }

    fn stats(&self) -> Self::Stats {
        SystemMetricsCollectorStats { emitted: self.emitted.load(Ordering::Relaxed) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn egress() -> EgressClient {
        let config = apm_telemetry::AgentConfig::builder().api_key("k").endpoint("http://127.0.0.1:1").build().unwrap();
        EgressClient::new(config).unwrap()
    }

    #[test]
    fn emits_percentiles_once_samples_are_recorded() {
        let c = SystemMetricsCollector::new();
        c.record(ResourceSample { cpu_fraction: 0.3, rss_bytes: 1_000_000, event_loop_lag_ms: Some(2.0) });
        c.record(ResourceSample { cpu_fraction: 0.5, rss_bytes: 1_200_000, event_loop_lag_ms: None });
        let e = egress();
        c.emit(&e);
        assert_eq!(e.queued_len(TelemetryKind::SystemMetrics), 1);
    }

    #[test]
    fn empty_window_emits_nothing() {
        let c = SystemMetricsCollector::new();
        let e = egress();
        c.emit(&e);
        assert_eq!(e.queued_len(TelemetryKind::SystemMetrics), 0);
    }
}
