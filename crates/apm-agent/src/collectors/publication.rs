//! Publication Efficiency Collector (spec §4.9).
//!
//! Tracks, per publication name, how many documents are sent to
//! subscribers versus how many were actually fetched from the database to
//! compute the result — a low send/fetch ratio indicates an
//! over-broad publication query.

use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::collector::{Collector, CollectorStats, LifecycleGuard};
use apm_telemetry::{EgressClient, TelemetryKind};

#[derive(Debug, Clone, Copy, Default)]
struct PublicationTally {
    docs_fetched: u64,
    docs_sent: u64,
    subscriber_count: u64,
}

#[derive(Debug, Default)]
struct PublicationState {
    by_name: HashMap<String, PublicationTally>,
}

/// Tracks publication fetch/send efficiency (spec §4.9).
#[derive(Debug, Clone)]
pub struct PublicationCollector {
    state: Arc<Mutex<PublicationState>>,
    emitted: Arc<AtomicU64>,
    guard: Arc<LifecycleGuard>,
}

impl Default for PublicationCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl PublicationCollector {
    /// Build a new collector.
    #[must_use]
    pub fn new() -> Self {
        Self { state: Arc::new(Mutex::new(PublicationState::default())), emitted: Arc::new(AtomicU64::new(0)), guard: Arc::new(LifecycleGuard::default()) }
    }

    /// Record one publication run: how many documents were fetched to
    /// compute the result, and how many were actually sent to the
    /// subscriber.
    pub fn record_run(&self, name: &str, docs_fetched: u64, docs_sent: u64) {
        let mut state = self.state.lock();
        let tally = state.by_name.entry(name.to_string()).or_default();
        tally.docs_fetched += docs_fetched;
        tally.docs_sent += docs_sent;
        tally.subscriber_count += 1;
    }

    /// Aggregate and emit per-publication efficiency summaries, resetting
    /// tallies for the next interval.
    pub fn emit(&self, egress: &EgressClient) {
        let drained: Vec<(String, PublicationTally)> = {
            let mut state = self.state.lock();
            let out = state.by_name.iter().map(|(k, v)| (k.clone(), *v)).collect();
            state.by_name.clear();
            out
        };
        for (name, tally) in drained {
            let efficiency = if tally.docs_fetched == 0 {
                None
            } else {
                Some(tally.docs_sent as f64 / tally.docs_fetched as f64)
            };
            let payload = json!({
                "name": name,
                "docsFetched": tally.docs_fetched,
                "docsSent": tally.docs_sent,
                "subscriberCount": tally.subscriber_count,
                "efficiency": efficiency,
            });
            egress.add(TelemetryKind::Publications, payload);
            self.emitted.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Stats reported by [`PublicationCollector::stats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PublicationCollectorStats {
    /// Summaries emitted since start.
    pub emitted: u64,
}

impl CollectorStats for PublicationCollectorStats {
    fn emitted_count(&self) -> u64 {
        self.emitted
    }
}

impl Collector for PublicationCollector {
    type Stats = PublicationCollectorStats;

    fn name(&self) -> &'static str {
        "publications"
    }

    fn start(&self) {
        if !self.guard.begin_start() {
            tracing::debug!("publication collector already started");
        }
    }

    fn stop(&self) {
        if !self.guard.begin_stop() {
            tracing::debug!("publication collector already stopped");
        }
    }

    fn stats(&self) -> Self::Stats {
        PublicationCollectorStats { emitted: self.emitted.load(Ordering::Relaxed) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apm_telemetry::AgentConfig;

    #[test]
    fn efficiency_avoids_div_by_zero_with_no_fetches() {
        let config = AgentConfig::builder().api_key("k").endpoint("http://127.0.0.1:1").build().unwrap();
        let egress = EgressClient::new(config).unwrap();
        let c = PublicationCollector::new();
        c.record_run("rooms.all", 0, 0);
        c.emit(&egress);
        assert_eq!(egress.queued_len(TelemetryKind::Publications), 1);
    }

    #[test]
    fn overbroad_publication_shows_low_efficiency() {
        let config = AgentConfig::builder().api_key("k").endpoint("http://127.0.0.1:1").build().unwrap();
        let egress = EgressClient::new(config).unwrap();
        let c = PublicationCollector::new();
        c.record_run("messages.recent", 1000, 20);
        c.emit(&egress);
        assert_eq!(egress.queued_len(TelemetryKind::Publications), 1);
    }
}
