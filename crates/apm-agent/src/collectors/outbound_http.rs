//! Outbound HTTP Collector (spec §4.9).
//!
//! Subscribes to a diagnostics-channel-style event stream from the HTTP
//! client rather than wrapping a method directly (spec: "subscribes to a
//! host channel"), buffering per-host latency/status samples and emitting
//! periodic summaries.

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

/// One observed outbound call (spec §4.9's diagnostics-channel event).
#[derive(Debug, Clone)]
pub struct OutboundCallEvent {
    /// Target host (authority component of the request URL).
    pub host: String,
    /// Response status code, if a response was received.
    pub status: Option<u16>,
    /// Call duration.
    pub duration: Duration,
}

#[derive(Debug, Default)]
struct OutboundState {
    by_host: HashMap<String, BoundedBuffer<(f64, Option<u16>)>>,
}

/// Tracks outbound HTTP call latency and status per target host (spec
/// §4.9).
#[derive(Debug, Clone)]
pub struct OutboundHttpCollector {
    state: Arc<Mutex<OutboundState>>,
    emitted: Arc<AtomicU64>,
    guard: Arc<LifecycleGuard>,
}

impl Default for OutboundHttpCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboundHttpCollector {
    /// Build a new collector.
    #[must_use]
    pub fn new() -> Self {
        Self { state: Arc::new(Mutex::new(OutboundState::default())), emitted: Arc::new(AtomicU64::new(0)), guard: Arc::new(LifecycleGuard::default()) }
    }

    /// Record one observed outbound call (fed by a diagnostics-channel
    /// subscription in the host integration).
    pub fn on_event(&self, event: OutboundCallEvent) {
        let mut state = self.state.lock();
        state
            .by_host
            .entry(event.host)
            .or_insert_with(|| BoundedBuffer::new(SAMPLES_PER_HOST))
            .push((event.duration.as_secs_f64() * 1000.0, event.status));
    }

    /// Aggregate and emit per-host summaries, clearing buffers afterward.
    pub fn emit(&self, egress: &EgressClient) {
        let drained: Vec<(String, Vec<(f64, Option<u16>)>)> = {
            let mut state = self.state.lock();
            state
                .by_host
                .iter_mut()
                .filter(|(_, buf)| !buf.is_empty())
                .map(|(host, buf)| (host.clone(), buf.drain()))
                .collect()
        };
        for (host, samples) in drained {
            let durations: Vec<f64> = samples.iter().map(|(d, _)| *d).collect();
            let error_count = samples.iter().filter(|(_, s)| s.is_none_or(|s| s >= 400)).count();
            let payload = json!({
                "host": host,
                "count": samples.len(),
                "errorCount": error_count,
                "p50Ms": percentile(&durations, 50.0),
                "p95Ms": percentile(&durations, 95.0),
            });
            egress.add(TelemetryKind::OutboundHttp, payload);
            self.emitted.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Stats reported by [`OutboundHttpCollector::stats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct OutboundHttpCollectorStats {
    /// Summaries emitted since start.
    pub emitted: u64,
}

impl CollectorStats for OutboundHttpCollectorStats {
    fn emitted_count(&self) -> u64 {
        self.emitted
    }
}

impl Collector for OutboundHttpCollector {
    type Stats = OutboundHttpCollectorStats;

    fn name(&self) -> &'static str {
        "outbound_http"
    }

    fn start(&self) {
        if !self.guard.begin_start() {
            tracing::debug!("outbound http collector already started");
        }
    }

    fn stop(&self) {
        if !self.guard.begin_stop() {
            tracing::debug!("outbound http collector already stopped");
        }
    }

    fn stats(&self) -> Self::Stats {
        OutboundHttpCollectorStats { emitted: self.emitted.load(Ordering::Relaxed) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apm_telemetry::AgentConfig;

    #[test]
    fn emits_error_count_alongside_latency_percentiles() {
        let config = AgentConfig::builder().api_key("k").endpoint("http://127.0.0.1:1").build().unwrap();
        let egress = EgressClient::new(config).unwrap();
        let c = OutboundHttpCollector::new();
        c.on_event(OutboundCallEvent { host: "api.stripe.com".to_string(), status: Some(200), duration: Duration::from_millis(50) });
        c.on_event(OutboundCallEvent { host: "api.stripe.com".to_string(), status: Some(500), duration: Duration::from_millis(80) });
        c.emit(&egress);
        assert_eq!(egress.queued_len(TelemetryKind::OutboundHttp), 1);
    }
}
