//! Environment Snapshot Collector (spec §4.9).
//!
//! Emits a single host/runtime snapshot on an interval — no buffering is
//! needed since each tick produces exactly one item.

use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::collector::{Collector, CollectorStats, LifecycleGuard};
use apm_telemetry::{EgressClient, TelemetryKind};

/// Emits periodic host environment snapshots (spec §4.9).
#[derive(Debug, Clone)]
pub struct EnvCollector {
    host: String,
    app_version: Option<String>,
    emitted: Arc<AtomicU64>,
    guard: Arc<LifecycleGuard>,
}

impl EnvCollector {
    /// Build a collector reporting the given host identity and app
    /// version, as configured on [`apm_telemetry::AgentConfig`].
    #[must_use]
    pub fn new(host: String, app_version: Option<String>) -> Self {
        Self { host, app_version, emitted: Arc::new(AtomicU64::new(0)), guard: Arc::new(LifecycleGuard::default()) }
    }

    /// Emit one environment snapshot.
    pub fn emit(&self, egress: &EgressClient) {
        let payload = json!({
            "host": self.host,
            "appVersion": self.app_version,
            "rustVersion": env!("CARGO_PKG_RUST_VERSION").to_string(),
            "pid": std::process::id(),
            "numCpus": std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
        });
        egress.add(TelemetryKind::Environment, payload);
        self.emitted.fetch_add(1, Ordering::Relaxed);
    }
}

/// Stats reported by [`EnvCollector::stats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvCollectorStats {
    /// Snapshots emitted since start.
    pub emitted: u64,
}

impl CollectorStats for EnvCollectorStats {
    fn emitted_count(&self) -> u64 {
        self.emitted
    }
}

impl Collector for EnvCollector {
    type Stats = EnvCollectorStats;

    fn name(&self) -> &'static str {
        "env"
    }

    fn start(&self) {
        if !self.guard.begin_start() {
            tracing::debug!("env collector already started");
        }
    }

    fn stop(&self) {
        if !self.guard.begin_stop() {
            tracing::debug!("env collector already stopped");
        }
    }

    fn stats(&self) -> Self::Stats {
        EnvCollectorStats { emitted: self.emitted.load(Ordering::Relaxed) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apm_telemetry::AgentConfig;

    #[test]
    fn emits_exactly_one_snapshot_per_call() {
        let config = AgentConfig::builder().api_key("k").endpoint("http://127.0.0.1:1").build().unwrap();
        let egress = EgressClient::new(config).unwrap();
        let c = EnvCollector::new("host-1".to_string(), Some("1.2.3".to_string()));
        c.emit(&egress);
        assert_eq!(egress.queued_len(TelemetryKind::Environment), 1);
    }
}
