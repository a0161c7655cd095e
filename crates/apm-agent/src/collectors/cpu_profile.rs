//! CPU Profile Trigger (spec §4.9).
//!
//! Polls process CPU usage; when it crosses a threshold and the collector
//! is outside its cooldown window, starts a short in-process sampling
//! profile. On stop, reduces the raw samples to a top-functions-by-self-time
//! summary and emits that — never the raw profile (spec: "emits a summary
//! (never the raw profile)").

use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::support::top_n;
use crate::collector::{Collector, CollectorStats, LifecycleGuard};
use apm_telemetry::{EgressClient, TelemetryKind};

/// CPU usage fraction (0..1) above which a profile is triggered.
const DEFAULT_CPU_THRESHOLD: f64 = 0.8;
/// Minimum time between two triggered profiles.
const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);
/// How long a triggered profile samples for.
const PROFILE_DURATION: Duration = Duration::from_secs(5);

/// One stack sample taken during an active profile. Supplied by the host
/// integration's sampling hook; this collector only aggregates.
#[derive(Debug, Clone)]
pub struct StackSample {
    /// Innermost function name on the sampled stack.
    pub function: String,
}

#[derive(Debug, Default)]
struct ProfileState {
    active_since: Option<Instant>,
    last_triggered_at: Option<Instant>,
    samples: Vec<StackSample>,
}

/// Triggers and summarizes short CPU sampling profiles (spec §4.9).
#[derive(Debug, Clone)]
pub struct CpuProfileCollector {
    state: Arc<parking_lot::Mutex<ProfileState>>,
    cpu_threshold: f64,
    cooldown: Duration,
    emitted: Arc<AtomicU64>,
    guard: Arc<LifecycleGuard>,
}

impl Default for CpuProfileCollector {
    fn default() -> Self {
        Self::new(DEFAULT_CPU_THRESHOLD, DEFAULT_COOLDOWN)
    }
}

impl CpuProfileCollector {
    /// Build a collector with an explicit threshold and cooldown.
    #[must_use]
    pub fn new(cpu_threshold: f64, cooldown: Duration) -> Self {
        Self {
            state: Arc::new(parking_lot::Mutex::new(ProfileState::default())),
            cpu_threshold,
            cooldown,
            emitted: Arc::new(AtomicU64::new(0)),
            guard: Arc::new(LifecycleGuard::default()),
        }
    }

    /// Called on each CPU poll tick. Starts a profile if `cpu_fraction`
    /// crosses the threshold and the cooldown has elapsed. Returns `true`
    /// if a profile was (newly) started.
    pub fn on_cpu_poll(&self, cpu_fraction: f64) -> bool {
        let mut state = self.state.lock();
        if state.active_since.is_some() {
            return false;
        }
        if cpu_fraction < self.cpu_threshold {
            return false;
        }
        if state.last_triggered_at.is_some_and(|t| t.elapsed() < self.cooldown) {
            return false;
        }
        state.active_since = Some(Instant::now());
        state.last_triggered_at = Some(Instant::now());
        state.samples.clear();
        true
    }

    /// Whether a profile is currently active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.lock().active_since.is_some()
    }

    /// Whether an active profile has run past [`PROFILE_DURATION`] and
    /// should be stopped.
    #[must_use]
    pub fn should_stop(&self) -> bool {
        self.state.lock().active_since.is_some_and(|t| t.elapsed() >= PROFILE_DURATION)
    }

    /// Feed one stack sample into the active profile. A no-op if no
    /// profile is active.
    pub fn record_sample(&self, sample: StackSample) {
        let mut state = self.state.lock();
        if state.active_since.is_some() {
            state.samples.push(sample);
        }
    }

    /// Stop the active profile, reduce its samples to a top-functions
    /// summary by self-time (approximated here as sample count, since each
    /// sample already represents one fixed-interval tick), and emit it.
    pub fn stop_and_emit(&self, egress: &EgressClient) {
        let samples = {
            let mut state = self.state.lock();
            state.active_since = None;
            std::mem::take(&mut state.samples)
        };
        if samples.is_empty() {
            return;
        }

        let mut counts: std::collections::HashMap<String, f64> = std::collections::HashMap::new();
        for sample in &samples {
            *counts.entry(sample.function.clone()).or_insert(0.0) += 1.0;
        }
        let total = samples.len() as f64;
        let entries: Vec<(String, f64)> = counts.into_iter().collect();
        let top = top_n(&entries, 10, |(_, count)| *count);

        let payload = json!({
            "sampleCount": samples.len(),
            "topFunctions": top.into_iter().map(|(name, count)| json!({
                "function": name,
                "selfTimePct": (count / total) * 100.0,
            })).collect::<Vec<_>>(),
        });
        egress.add(TelemetryKind::CpuProfiles, payload);
        self.emitted.fetch_add(1, Ordering::Relaxed);
    }
}

/// Stats reported by [`CpuProfileCollector::stats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuProfileCollectorStats {
    /// Profile summaries emitted since start.
    pub emitted: u64,
}

impl CollectorStats for CpuProfileCollectorStats {
    fn emitted_count(&self) -> u64 {
        self.emitted
    }
}

impl Collector for CpuProfileCollector {
    type Stats = CpuProfileCollectorStats;

    fn name(&self) -> &'static str {
        "cpu_profile"
    }

    fn start(&self) {
        if !self.guard.begin_start() {
            tracing::debug!("cpu profile collector already started");
        }
    }

    fn stop(&self) {
        if !self.guard.begin_stop() {
            tracing::debug!("cpu profile collector already stopped");
        }
    }

    fn stats(&self) -> Self::Stats {
        CpuProfileCollectorStats { emitted: self.emitted.load(Ordering::Relaxed) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_fires_only_above_threshold_and_outside_cooldown() {
        let c = CpuProfileCollector::new(0.8, Duration::from_secs(60));
        assert!(!c.on_cpu_poll(0.5));
        assert!(c.on_cpu_poll(0.9));
        // Already active, re-polling does not start a second profile.
        assert!(!c.on_cpu_poll(0.95));
    }

    #[test]
    fn summary_reports_top_functions_by_sample_count() {
        let c = CpuProfileCollector::new(0.8, Duration::from_secs(60));
        c.on_cpu_poll(0.9);
        for _ in 0..5 {
            c.record_sample(StackSample { function: "hot_path".to_string() });
        }
        c.record_sample(StackSample { function: "cold_path".to_string() });
        let config = apm_telemetry::AgentConfig::builder().api_key("k").endpoint("http://127.0.0.1:1").build().unwrap();
        let egress = EgressClient::new(config).unwrap();
        c.stop_and_emit(&egress);
        assert_eq!(egress.queued_len(TelemetryKind::CpuProfiles), 1);
        assert!(!c.is_active());
    }
}
