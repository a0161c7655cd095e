//! Log Collector (spec §4.9).
//!
//! Wraps console-level logging and the host log package's level methods
//! with three-layer recursion defence: the original function is captured
//! once (the [`HostSlot`](crate::wrap::HostSlot) wrapping discipline), a
//! re-entrancy guard flag prevents a log line emitted while handling a log
//! line from recursing forever, and a prefix filter drops the agent's own
//! log lines so they never get captured and re-emitted.

use serde_json::json;
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::support::BoundedBuffer;
use crate::collector::{Collector, CollectorStats, LifecycleGuard};
use apm_telemetry::{EgressClient, TelemetryKind};

/// Prefix the agent applies to its own internal log lines, filtered out so
/// the Log Collector never captures and re-emits its own output (layer 3
/// of the recursion defence).
pub const AGENT_LOG_PREFIX: &str = "[apm-agent]";

/// Log severity levels the collector buffers (spec §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug-level diagnostic output.
    Debug,
    /// Informational.
    Info,
    /// Warning.
    Warn,
    /// Error.
    Error,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
struct LogEntry {
    level: LogLevel,
    message: String,
}

thread_local! {
    // Layer 2: a re-entrancy guard flag. If recording a log line itself
    // produces a log line (e.g. a buffer-full warning), the nested call is
    // dropped rather than recursing.
    static RECORDING: Cell<bool> = const { Cell::new(false) };
}

const BUFFER_CAPACITY: usize = 1000;

/// Buffers captured host log lines and periodically emits them (spec
/// §4.9).
#[derive(Debug, Clone)]
pub struct LogCollector {
    buffer: Arc<parking_lot::Mutex<BoundedBuffer<LogEntry>>>,
    emitted: Arc<AtomicU64>,
    guard: Arc<LifecycleGuard>,
}

impl Default for LogCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl LogCollector {
    /// Build a new collector.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Arc::new(parking_lot::Mutex::new(BoundedBuffer::new(BUFFER_CAPACITY))),
            emitted: Arc::new(AtomicU64::new(0)),
            guard: Arc::new(LifecycleGuard::default()),
        }
    }

    /// Called from the captured host log hook (layer 1: the original is
    /// captured exactly once via [`crate::wrap::HostSlot`] at install
    /// time; this method is what the wrapper calls before calling through).
    /// Drops the line instead of recording it if this thread is already
    /// inside a recording call (layer 2), or if the message carries the
    /// agent's own prefix (layer 3).
    pub fn on_log_line(&self, level: LogLevel, message: &str) {
        if message.starts_with(AGENT_LOG_PREFIX) {
            return;
        }
        let already_recording = RECORDING.with(|r| r.replace(true));
        if already_recording {
            return;
        }
        self.buffer.lock().push(LogEntry { level, message: message.to_string() });
        RECORDING.with(|r| r.set(false));
    }

    /// Drain and emit buffered log lines as one `Logs` batch item per
    /// line.
    pub fn emit(&self, egress: &EgressClient) {
        let entries = self.buffer.lock().drain();
        for entry in entries {
            egress.add(TelemetryKind::Logs, json!({"level": entry.level.as_str(), "message": entry.message}));
            self.emitted.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Stats reported by [`LogCollector::stats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct LogCollectorStats {
    /// Log lines emitted since start.
    pub emitted: u64,
}

impl CollectorStats for LogCollectorStats {
    fn emitted_count(&self) -> u64 {
        self.emitted
    }
}

impl Collector for LogCollector {
    type Stats = LogCollectorStats;

    fn name(&self) -> &'static str {
        "log"
    }

    fn start(&self) {
        if !self.guard.begin_start() {
            tracing::debug!("log collector already started");
        }
    }

    fn stop(&self) {
        if !self.guard.begin_stop() {
            tracing::debug!("log collector already stopped");
        }
    }

    fn stats(&self) -> Self::Stats {
        LogCollectorStats { emitted: self.emitted.load(Ordering::Relaxed) }
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
    fn captures_and_emits_host_log_lines() {
        let c = LogCollector::new();
        c.on_log_line(LogLevel::Warn, "slow request detected");
        let e = egress();
        c.emit(&e);
        assert_eq!(e.queued_len(TelemetryKind::Logs), 1);
    }

    #[test]
    fn filters_out_the_agents_own_log_lines() {
        let c = LogCollector::new();
        c.on_log_line(LogLevel::Info, "[apm-agent] flushed batch");
        let e = egress();
        c.emit(&e);
        assert_eq!(e.queued_len(TelemetryKind::Logs), 0);
    }

    #[test]
    fn reentrant_log_call_on_the_same_thread_is_dropped() {
        let c = LogCollector::new();
        // Simulate a log call nested inside another by manually setting
        // the guard, then confirm a nested on_log_line call no-ops.
        RECORDING.with(|r| r.set(true));
        c.on_log_line(LogLevel::Error, "nested during recording");
        RECORDING.with(|r| r.set(false));
        let e = egress();
        c.emit(&e);
        assert_eq!(e.queued_len(TelemetryKind::Logs), 0);
    }
}
