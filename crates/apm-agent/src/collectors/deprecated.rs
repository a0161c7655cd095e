//! Deprecated-API Usage Collector (spec §4.9).
//!
//! Wraps known deprecated host entry points; each call increments a
//! per-API counter, periodically flushed and reset so counts reflect one
//! interval rather than accumulating forever.

use dashmap::DashMap;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::collector::{Collector, CollectorStats, LifecycleGuard};
use apm_telemetry::{EgressClient, TelemetryKind};

/// Counts calls into deprecated host APIs, by name (spec §4.9).
#[derive(Debug, Clone, Default)]
pub struct DeprecatedApiCollector {
    counts: Arc<DashMap<String, u64>>,
    emitted: Arc<AtomicU64>,
    guard: Arc<LifecycleGuard>,
}

impl DeprecatedApiCollector {
    /// Build a new collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one call into `api_name`.
    pub fn record_call(&self, api_name: &str) {
        *self.counts.entry(api_name.to_string()).or_insert(0) += 1;
    }

    /// Emit and reset this interval's per-API call counts.
    pub fn emit(&self, egress: &EgressClient) {
        if self.counts.is_empty() {
            return;
        }
        let snapshot: Vec<(String, u64)> = self.counts.iter().map(|e| (e.key().clone(), *e.value())).collect();
        self.counts.clear();
        let payload = json!({
            "calls": snapshot.into_iter().map(|(api, count)| json!({"api": api, "count": count})).collect::<Vec<_>>(),
        });
        egress.add(TelemetryKind::DeprecatedApis, payload);
        self.emitted.fetch_add(1, Ordering::Relaxed);
    }
}

/// Stats reported by [`DeprecatedApiCollector::stats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DeprecatedApiCollectorStats {
    /// Summaries emitted since start.
    pub emitted: u64,
}

impl CollectorStats for DeprecatedApiCollectorStats {
    fn emitted_count(&self) -> u64 {
        self.emitted
    }
}

impl Collector for DeprecatedApiCollector {
    type Stats = DeprecatedApiCollectorStats;

    fn name(&self) -> &'static str {
        "deprecated_apis"
    }

    fn start(&self) {
        if !self.guard.begin_start() {
            tracing::debug!("deprecated api collector already started");
        }
    }

    fn stop(&self) {
        if !self.guard.begin_stop() {
            tracing::debug!("deprecated api collector already stopped");
        }
    }

    fn stats(&self) -> Self::Stats {
        DeprecatedApiCollectorStats { emitted: self.emitted.load(Ordering::Relaxed) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apm_telemetry::AgentConfig;

    #[test]
    fn emit_resets_counts_for_the_next_interval() {
        let config = AgentConfig::builder().api_key("k").endpoint("http://127.0.0.1:1").build().unwrap();
        let egress = EgressClient::new(config).unwrap();
        let c = DeprecatedApiCollector::new();
        c.record_call("Collection.find.sync");
        c.record_call("Collection.find.sync");
        c.emit(&egress);
        assert_eq!(egress.queued_len(TelemetryKind::DeprecatedApis), 1);
        c.emit(&egress);
        assert_eq!(egress.queued_len(TelemetryKind::DeprecatedApis), 1);
    }
}
