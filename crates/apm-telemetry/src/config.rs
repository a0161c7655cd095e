//! Agent configuration (spec §6's enumerated surface).
//!
//! Follows the teacher's `TelemetryConfig`/`TelemetryConfigBuilder` split:
//! a plain data struct with a `Default` impl holding every production
//! default, and a builder that only overrides what the caller sets,
//! falling back to `TelemetryConfig::default()` field-by-field in
//! `build()`.

use crate::error::{TelemetryError, TelemetryResult};
use std::time::Duration;

/// Verbosity requested from the database driver's `explain()` call
/// (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExplainVerbosity {
    /// Planner output only, no execution.
    #[default]
    QueryPlanner,
    /// Planner output plus execution statistics.
    ExecutionStats,
    /// Execution statistics for every candidate plan considered.
    AllPlansExecution,
}

impl ExplainVerbosity {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "queryPlanner" => Some(Self::QueryPlanner),
            "executionStats" => Some(Self::ExecutionStats),
            "allPlansExecution" => Some(Self::AllPlansExecution),
            _ => None,
        }
    }
}

/// Per-collector toggles (spec §6's "per-collector enable flags").
#[derive(Debug, Clone, Copy)]
pub struct CollectorToggles {
    /// Request Tracer.
    pub tracer: bool,
    /// Database Instrumentation.
    pub database: bool,
    /// Queue Wait Collector.
    pub queue_wait: bool,
    /// Observer Collector.
    pub observer: bool,
    /// DNS Timing.
    pub dns: bool,
    /// Env Snapshot.
    pub env: bool,
    /// Deprecated-API usage.
    pub deprecated_apis: bool,
    /// Outbound-HTTP diagnostics.
    pub outbound_http: bool,
    /// Publication Efficiency.
    pub publications: bool,
    /// Job Monitor.
    pub jobs: bool,
    /// CPU Profile Trigger.
    pub cpu_profile: bool,
    /// Log Collector.
    pub log: bool,
}

impl Default for CollectorToggles {
    fn default() -> Self {
        Self {
            tracer: true,
            database: true,
            queue_wait: true,
            observer: true,
            dns: true,
            env: true,
            deprecated_apis: true,
            outbound_http: true,
            publications: true,
            jobs: true,
            cpu_profile: false,
            log: true,
        }
    }
}

/// Per-collector periodic-flush intervals (spec §6's "per-collector
/// intervals").
#[derive(Debug, Clone, Copy)]
pub struct CollectorIntervals {
    /// System metrics sampling interval.
    pub system_metrics: Duration,
    /// Observer health-snapshot interval.
    pub observer: Duration,
    /// CPU profile polling interval.
    pub cpu_profile: Duration,
    /// Stale call-stack sweep interval (spec §4.5: fixed at 60s).
    pub call_stack_sweep: Duration,
    /// Message-cache TTL sweep interval (spec §4.7: fixed at 60s).
    pub message_cache_sweep: Duration,
}

impl Default for CollectorIntervals {
    fn default() -> Self {
        Self {
            system_metrics: Duration::from_secs(15),
            observer: Duration::from_secs(10),
            cpu_profile: Duration::from_secs(30),
            call_stack_sweep: Duration::from_secs(60),
            message_cache_sweep: Duration::from_secs(60),
        }
    }
}

/// The agent's full configuration surface (spec §6).
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// API key used for the egress authentication header. Required.
    pub api_key: String,
    /// Base URL telemetry is POSTed to.
    pub endpoint: String,
    /// Master enable switch; when false, all collectors stay inert.
    pub enabled: bool,
    /// Verbose internal logging (suppressed transients become visible).
    pub debug: bool,
    /// Reported host identifier; defaults to the OS hostname.
    pub host: String,
    /// Reported application version.
    pub app_version: String,
    /// Per-kind batch count limit before a flush is forced.
    pub batch_size: usize,
    /// Per-kind batch byte-budget before a flush is forced.
    pub batch_size_bytes: usize,
    /// Periodic flush interval; must be ≥ 1000 ms.
    pub flush_interval: Duration,
    /// Fraction of traces kept, in `[0, 1]`.
    pub trace_sample_rate: f64,
    /// Fraction of RUM measurements kept, in `[0, 1]`.
    pub rum_sample_rate: f64,
    /// Per-request egress HTTP timeout.
    pub request_timeout: Duration,
    /// Maximum retry attempts per batch before it is dropped.
    pub max_retries: u32,
    /// Per-collector enable flags.
    pub collectors: CollectorToggles,
    /// Per-collector periodic intervals.
    pub intervals: CollectorIntervals,
    /// Whether the index-usage `explain()` side-channel is enabled.
    pub capture_index_usage: bool,
    /// Fraction of db operations selected for the explain side-channel.
    pub index_usage_sample_rate: f64,
    /// Verbosity passed to the driver's `explain()` call.
    pub explain_verbosity: ExplainVerbosity,
    /// Restrict the explain side-channel to operations already flagged
    /// slow, rather than sampling among all operations.
    pub explain_slow_queries_only: bool,
    /// Duration past which a db operation is flagged slow.
    pub slow_query_threshold: Duration,
    /// Maximum characters kept per sanitized string argument.
    pub max_arg_length: usize,
    /// Offload CPU-bound sanitization/size-estimation work to a worker
    /// thread once argument size crosses `worker_threshold`.
    pub use_worker_thread: bool,
    /// Size (bytes) past which sanitization offloads to a worker thread.
    pub worker_threshold: usize,
    /// Name of the host's background-job package, if the Job Monitor
    /// should attach to one.
    pub jobs_package: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            endpoint: "https://ingest.apm.example.com".to_string(),
            enabled: true,
            debug: false,
            host: hostname(),
            app_version: "0.0.0".to_string(),
            batch_size: 50,
            batch_size_bytes: 262_144,
            flush_interval: Duration::from_secs(10),
            trace_sample_rate: 1.0,
            rum_sample_rate: 0.5,
            request_timeout: Duration::from_secs(3),
            max_retries: 3,
            collectors: CollectorToggles::default(),
            intervals: CollectorIntervals::default(),
            capture_index_usage: false,
            index_usage_sample_rate: 0.05,
            explain_verbosity: ExplainVerbosity::default(),
            explain_slow_queries_only: true,
            slow_query_threshold: Duration::from_secs(1),
            max_arg_length: 1000,
            use_worker_thread: false,
            worker_threshold: 50,
            jobs_package: None,
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown-host".to_string())
}

impl AgentConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub fn builder() -> AgentConfigBuilder {
        AgentConfigBuilder::default()
    }

    /// Validate the configuration, rejecting out-of-range sample rates,
    /// unrecognized verbosity strings (caught earlier, at builder time),
    /// and a flush interval below 1000 ms (spec §6).
    pub fn validate(&self) -> TelemetryResult<()> {
        if self.api_key.trim().is_empty() {
            return Err(TelemetryError::InvalidConfiguration("apiKey is required".to_string()));
        }
        if !(0.0..=1.0).contains(&self.trace_sample_rate) {
            return Err(TelemetryError::InvalidConfiguration(format!(
                "traceSampleRate must be in [0,1], got {}",
                self.trace_sample_rate
            )));
        }
        if !(0.0..=1.0).contains(&self.rum_sample_rate) {
            return Err(TelemetryError::InvalidConfiguration(format!(
                "rumSampleRate must be in [0,1], got {}",
                self.rum_sample_rate
            )));
        }
        if !(0.0..=1.0).contains(&self.index_usage_sample_rate) {
            return Err(TelemetryError::InvalidConfiguration(format!(
                "indexUsageSampleRate must be in [0,1], got {}",
                self.index_usage_sample_rate
            )));
        }
        if self.flush_interval < Duration::from_millis(1000) {
            return Err(TelemetryError::InvalidConfiguration(
                "flushInterval must be >= 1000ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`AgentConfig`].
#[derive(Debug, Clone, Default)]
pub struct AgentConfigBuilder {
    api_key: Option<String>,
    endpoint: Option<String>,
    enabled: Option<bool>,
    debug: Option<bool>,
    host: Option<String>,
    app_version: Option<String>,
    batch_size: Option<usize>,
    batch_size_bytes: Option<usize>,
    flush_interval: Option<Duration>,
    trace_sample_rate: Option<f64>,
    rum_sample_rate: Option<f64>,
    request_timeout: Option<Duration>,
    max_retries: Option<u32>,
    collectors: Option<CollectorToggles>,
    intervals: Option<CollectorIntervals>,
    capture_index_usage: Option<bool>,
    index_usage_sample_rate: Option<f64>,
    explain_verbosity: Option<ExplainVerbosity>,
    explain_slow_queries_only: Option<bool>,
    slow_query_threshold: Option<Duration>,
    max_arg_length: Option<usize>,
    use_worker_thread: Option<bool>,
    worker_threshold: Option<usize>,
    jobs_package: Option<String>,
}

impl AgentConfigBuilder {
    /// Set the required API key.
    #[must_use]
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Override the ingest endpoint.
    #[must_use]
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Enable or disable the agent entirely.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    /// Enable or disable verbose internal logging.
    #[must_use]
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = Some(debug);
        self
    }

    /// Override the reported host identifier.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set the reported application version.
    #[must_use]
    pub fn app_version(mut self, version: impl Into<String>) -> Self {
        self.app_version = Some(version.into());
        self
    }

    /// Set the per-kind batch count limit.
    #[must_use]
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size);
        self
    }

    /// Set the per-kind batch byte budget.
    #[must_use]
    pub fn batch_size_bytes(mut self, bytes: usize) -> Self {
        self.batch_size_bytes = Some(bytes);
        self
    }

    /// Set the periodic flush interval.
    #[must_use]
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = Some(interval);
        self
    }

    /// Set the trace sampling rate, clamped to `[0, 1]`.
    #[must_use]
    pub fn trace_sample_rate(mut self, rate: f64) -> Self {
        self.trace_sample_rate = Some(rate.clamp(0.0, 1.0));
        self
    }

    /// Set the RUM sampling rate, clamped to `[0, 1]`.
    #[must_use]
    pub fn rum_sample_rate(mut self, rate: f64) -> Self {
        self.rum_sample_rate = Some(rate.clamp(0.0, 1.0));
        self
    }

    /// Set the per-request egress HTTP timeout.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Set the maximum retry attempts per batch.
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Override all per-collector enable flags at once.
    #[must_use]
    pub fn collectors(mut self, toggles: CollectorToggles) -> Self {
        self.collectors = Some(toggles);
        self
    }

    /// Override all per-collector intervals at once.
    #[must_use]
    pub fn intervals(mut self, intervals: CollectorIntervals) -> Self {
        self.intervals = Some(intervals);
        self
    }

    /// Enable or disable the index-usage `explain()` side-channel.
    #[must_use]
    pub fn capture_index_usage(mut self, enabled: bool) -> Self {
        self.capture_index_usage = Some(enabled);
        self
    }

    /// Set the index-usage sampling rate, clamped to `[0, 1]`.
    #[must_use]
    pub fn index_usage_sample_rate(mut self, rate: f64) -> Self {
        self.index_usage_sample_rate = Some(rate.clamp(0.0, 1.0));
        self
    }

    /// Set the explain() verbosity from its wire string. Returns an error
    /// immediately for an unrecognized value (spec §6 fail-fast rule).
    pub fn explain_verbosity(mut self, verbosity: &str) -> TelemetryResult<Self> {
        let parsed = ExplainVerbosity::parse(verbosity).ok_or_else(|| {
            TelemetryError::InvalidConfiguration(format!("unknown explainVerbosity '{verbosity}'"))
        })?;
        self.explain_verbosity = Some(parsed);
        Ok(self)
    }

    /// Restrict the explain side-channel to already-slow operations.
    #[must_use]
    pub fn explain_slow_queries_only(mut self, only: bool) -> Self {
        self.explain_slow_queries_only = Some(only);
        self
    }

    /// Set the slow-query duration threshold.
    #[must_use]
    pub fn slow_query_threshold(mut self, threshold: Duration) -> Self {
        self.slow_query_threshold = Some(threshold);
        self
    }

    /// Set the maximum sanitized string argument length.
    #[must_use]
    pub fn max_arg_length(mut self, len: usize) -> Self {
        self.max_arg_length = Some(len);
        self
    }

    /// Enable or disable worker-thread offload for sanitization/sizing.
    #[must_use]
    pub fn use_worker_thread(mut self, enabled: bool) -> Self {
        self.use_worker_thread = Some(enabled);
        self
    }

    /// Set the byte-size threshold past which offload kicks in.
    #[must_use]
    pub fn worker_threshold(mut self, threshold: usize) -> Self {
        self.worker_threshold = Some(threshold);
        self
    }

    /// Name the host's background-job package for the Job Monitor.
    #[must_use]
    pub fn jobs_package(mut self, package: impl Into<String>) -> Self {
        self.jobs_package = Some(package.into());
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> TelemetryResult<AgentConfig> {
        let defaults = AgentConfig::default();

        let config = AgentConfig {
            api_key: self.api_key.unwrap_or(defaults.api_key),
            endpoint: self.endpoint.unwrap_or(defaults.endpoint),
            enabled: self.enabled.unwrap_or(defaults.enabled),
            debug: self.debug.unwrap_or(defaults.debug),
            host: self.host.unwrap_or(defaults.host),
            app_version: self.app_version.unwrap_or(defaults.app_version),
            batch_size: self.batch_size.unwrap_or(defaults.batch_size),
            batch_size_bytes: self.batch_size_bytes.unwrap_or(defaults.batch_size_bytes),
            flush_interval: self.flush_interval.unwrap_or(defaults.flush_interval),
            trace_sample_rate: self.trace_sample_rate.unwrap_or(defaults.trace_sample_rate),
            rum_sample_rate: self.rum_sample_rate.unwrap_or(defaults.rum_sample_rate),
            request_timeout: self.request_timeout.unwrap_or(defaults.request_timeout),
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            collectors: self.collectors.unwrap_or(defaults.collectors),
            intervals: self.intervals.unwrap_or(defaults.intervals),
            capture_index_usage: self.capture_index_usage.unwrap_or(defaults.capture_index_usage),
            index_usage_sample_rate: self
                .index_usage_sample_rate
                .unwrap_or(defaults.index_usage_sample_rate),
            explain_verbosity: self.explain_verbosity.unwrap_or(defaults.explain_verbosity),
            explain_slow_queries_only: self
                .explain_slow_queries_only
                .unwrap_or(defaults.explain_slow_queries_only),
            slow_query_threshold: self.slow_query_threshold.unwrap_or(defaults.slow_query_threshold),
            max_arg_length: self.max_arg_length.unwrap_or(defaults.max_arg_length),
            use_worker_thread: self.use_worker_thread.unwrap_or(defaults.use_worker_thread),
            worker_threshold: self.worker_threshold.unwrap_or(defaults.worker_threshold),
            jobs_package: self.jobs_package.or(defaults.jobs_package),
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_requires_an_api_key() {
        let err = AgentConfig::builder().build().unwrap_err();
        assert!(matches!(err, TelemetryError::InvalidConfiguration(_)));
    }

    #[test]
    fn builder_applies_overrides_over_defaults() {
        let config = AgentConfig::builder()
            .api_key("secret")
            .batch_size(10)
            .trace_sample_rate(2.0)
            .build()
            .unwrap();
        assert_eq!(config.api_key, "secret");
        assert_eq!(config.batch_size, 10);
        assert!((config.trace_sample_rate - 1.0).abs() < f64::EPSILON);
        assert_eq!(config.rum_sample_rate, AgentConfig::default().rum_sample_rate);
    }

    #[test]
    fn rejects_flush_interval_below_one_second() {
        let err = AgentConfig::builder()
            .api_key("secret")
            .flush_interval(Duration::from_millis(500))
            .build()
            .unwrap_err();
        assert!(matches!(err, TelemetryError::InvalidConfiguration(_)));
    }

    #[test]
    fn rejects_unknown_explain_verbosity() {
        let err = AgentConfig::builder().explain_verbosity("bogus").unwrap_err();
        assert!(matches!(err, TelemetryError::InvalidConfiguration(_)));
    }
}
