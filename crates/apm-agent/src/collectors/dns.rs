//! DNS Timing Collector (spec §4.9).
//!
//! Wraps the host resolver's lookup entry point, buffers per-lookup
//! latencies, and periodically emits p50/p95/p99 summaries per hostname.

use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::support::{percentile, BoundedBuffer};
use crate::collector::{Collector, CollectorStats, LifecycleGuard};
use apm_telemetry::{EgressClient, TelemetryKind};

const SAMPLES_PER_HOST: usize = 500;

#[derive(Debug, Default)]
struct DnsState {
    by_host: HashMap<String, BoundedBuffer<f64>>,
}

/// Tracks DNS resolution latency per hostname (spec §4.9).
#[derive(Debug, Clone)]
pub struct DnsCollector {
    state: Arc<Mutex<DnsState>>,
    emitted: Arc<AtomicU64>,
    guard: Arc<LifecycleGuard>,
}

impl Default for DnsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl DnsCollector {
    /// Build a new collector.
    #[must_use]
    pub fn new() -> Self {
        Self { state: Arc::new(Mutex::new(DnsState::default())), emitted: Arc::new(AtomicU64::new(0)), guard: Arc::new(LifecycleGuard::default()) }
    }

    /// Record a completed lookup for `hostname`.
    pub fn record_lookup(&self, hostname: &str, duration: Duration) {
        let mut state = self.state.lock();
        state.by_host.entry(hostname.to_string()).or_insert_with(|| BoundedBuffer::new(SAMPLES_PER_HOST)).push(duration.as_secs_f64() * 1000.0);
    }

    /// Aggregate and emit a `DnsMetrics` summary for every hostname with
    /// buffered samples, clearing the buffers afterward.
    pub fn emit(&self, egress: &EgressClient) {
        let drained: Vec<(String, Vec<f64>)> = {
            let mut state = self.state.lock();
            state
                .by_host
                .iter_mut()
                .filter(|(_, buf)| !buf.is_empty())
                .map(|(host, buf)| (host.clone(), buf.drain()))
                .collect()
        };
        for (hostname, samples) in drained {
            let payload = json!({
                "hostname": hostname,
                "count": samples.len(),
                "p50Ms": percentile(&samples, 50.0),
                "p95Ms": percentile(&samples, 95.0),
                "p99Ms": percentile(&samples, 99.0),
            });
            egress.add(TelemetryKind::DnsMetrics, payload);
            self.emitted.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Stats reported by [`DnsCollector::stats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DnsCollectorStats {
    /// Summaries emitted since start.
    pub emitted: u64,
}

impl CollectorStats for DnsCollectorStats {
    fn emitted_count(&self) -> u64 {
        self.emitted
    }
}

impl Collector for DnsCollector {
    type Stats = DnsCollectorStats;

    fn name(&self) -> &'static str {
        "dns"
    }

    fn start(&self) {
        if !self.guard.begin_start() {
            tracing::debug!("dns collector already started");
        }
    }

    fn stop(&self) {
        if !self.guard.begin_stop() {
            tracing::debug!("dns collector already stopped");
        }
    }

    fn stats(&self) -> Self::Stats {
        DnsCollectorStats { emitted: self.emitted.load(Ordering::Relaxed) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apm_telemetry::AgentConfig;

    fn egress() -> EgressClient {
        let config = AgentConfig::builder().api_key("k").endpoint("http://127.0.0.1:1").build().unwrap();
        EgressClient::new(config).unwrap()
    }

    #[test]
    fn emits_one_summary_per_host_with_samples() {
        let c = DnsCollector::new();
        c.record_lookup("db.internal", Duration::from_millis(5));
        c.record_lookup("db.internal", Duration::from_millis(15));
        c.record_lookup("cache.internal", Duration::from_millis(2));
        let e = egress();
        c.emit(&e);
        assert_eq!(e.queued_len(TelemetryKind::DnsMetrics), 2);
        // Buffers are cleared after emission, so a second call with no new
        // samples emits nothing.
        c.emit(&e);
        assert_eq!(e.queued_len(TelemetryKind::DnsMetrics), 2);
    }
}
