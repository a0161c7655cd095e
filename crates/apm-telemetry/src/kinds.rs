//! The enumerated telemetry kinds the egress client batches independently
//! (spec §4.2, §6). Each kind owns its own `(queue, bytes)` pair and maps
//! to a payload key and an endpoint path segment.

use serde::{Deserialize, Serialize};

/// One of the ~25 typed telemetry streams the agent emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TelemetryKind {
    /// Request traces from the Request Tracer.
    Traces,
    /// Process-level resource metrics (CPU, memory, event-loop lag).
    SystemMetrics,
    /// Outbound/inbound HTTP request diagnostics.
    HttpRequests,
    /// Uncaught errors and instrumentation failures.
    Errors,
    /// Captured application log lines.
    Logs,
    /// Real-user-monitoring (client-side) measurements.
    Rum,
    /// Database connection-pool metrics.
    MongoPoolMetrics,
    /// Per-collection storage statistics.
    CollectionStats,
    /// Active session/connection counts.
    DdpConnections,
    /// Active subscription counts and timings.
    Subscriptions,
    /// Live-query (reactive observer) snapshots.
    LiveQueries,
    /// DNS resolution timing samples.
    DnsMetrics,
    /// Outbound HTTP call latency/throughput summaries.
    OutboundHttp,
    /// CPU profile summaries from the CPU Profile Trigger.
    CpuProfiles,
    /// Deprecated-API usage counters.
    DeprecatedApis,
    /// Publication efficiency summaries.
    Publications,
    /// Host environment/runtime snapshot.
    Environment,
    /// Dependency vulnerability findings.
    Vulnerabilities,
    /// Background job lifecycle events.
    Jobs,
    /// User-defined custom metrics.
    CustomMetrics,
}

impl TelemetryKind {
    /// All kinds, for iterating batch maps at startup/shutdown.
    pub const ALL: &'static [TelemetryKind] = &[
        TelemetryKind::Traces,
        TelemetryKind::SystemMetrics,
        TelemetryKind::HttpRequests,
        TelemetryKind::Errors,
        TelemetryKind::Logs,
        TelemetryKind::Rum,
        TelemetryKind::MongoPoolMetrics,
        TelemetryKind::CollectionStats,
        TelemetryKind::DdpConnections,
        TelemetryKind::Subscriptions,
        TelemetryKind::LiveQueries,
        TelemetryKind::DnsMetrics,
        TelemetryKind::OutboundHttp,
        TelemetryKind::CpuProfiles,
        TelemetryKind::DeprecatedApis,
        TelemetryKind::Publications,
        TelemetryKind::Environment,
        TelemetryKind::Vulnerabilities,
        TelemetryKind::Jobs,
        TelemetryKind::CustomMetrics,
    ];

    /// The JSON key the batch's item array is nested under in the POST
    /// body (spec §6): `{ <payloadKey>: [ items… ] }`.
    #[must_use]
    pub fn payload_key(&self) -> &'static str {
        match self {
            TelemetryKind::Traces => "traces",
            TelemetryKind::SystemMetrics => "metrics",
            TelemetryKind::HttpRequests => "requests",
            TelemetryKind::Errors => "errors",
            TelemetryKind::Logs => "logs",
            TelemetryKind::Rum => "measurements",
            TelemetryKind::MongoPoolMetrics => "metrics",
            TelemetryKind::CollectionStats => "stats",
            TelemetryKind::DdpConnections => "connections",
            TelemetryKind::Subscriptions => "subscriptions",
            TelemetryKind::LiveQueries => "liveQueries",
            TelemetryKind::DnsMetrics => "metrics",
            TelemetryKind::OutboundHttp => "metrics",
            TelemetryKind::CpuProfiles => "profiles",
            TelemetryKind::DeprecatedApis => "metrics",
            TelemetryKind::Publications => "metrics",
            TelemetryKind::Environment => "metrics",
            TelemetryKind::Vulnerabilities => "metrics",
            TelemetryKind::Jobs => "jobs",
            TelemetryKind::CustomMetrics => "metrics",
        }
    }

    /// The endpoint path this kind's batches are POSTed to. All paths
    /// begin with `/api/v1/` per spec §6.
    #[must_use]
    pub fn endpoint_path(&self) -> &'static str {
        match self {
            TelemetryKind::Traces => "/api/v1/traces",
            TelemetryKind::SystemMetrics => "/api/v1/metrics/system",
            TelemetryKind::HttpRequests => "/api/v1/requests",
            TelemetryKind::Errors => "/api/v1/errors",
            TelemetryKind::Logs => "/api/v1/logs",
            TelemetryKind::Rum => "/api/v1/rum",
            TelemetryKind::MongoPoolMetrics => "/api/v1/metrics/mongopool",
            TelemetryKind::CollectionStats => "/api/v1/stats/collections",
            TelemetryKind::DdpConnections => "/api/v1/connections",
            TelemetryKind::Subscriptions => "/api/v1/subscriptions",
            TelemetryKind::LiveQueries => "/api/v1/live-queries",
            TelemetryKind::DnsMetrics => "/api/v1/metrics/dns",
            TelemetryKind::OutboundHttp => "/api/v1/metrics/outbound-http",
            TelemetryKind::CpuProfiles => "/api/v1/profiles/cpu",
            TelemetryKind::DeprecatedApis => "/api/v1/metrics/deprecated-apis",
            TelemetryKind::Publications => "/api/v1/metrics/publications",
            TelemetryKind::Environment => "/api/v1/metrics/environment",
            TelemetryKind::Vulnerabilities => "/api/v1/metrics/vulnerabilities",
            TelemetryKind::Jobs => "/api/v1/jobs",
            TelemetryKind::CustomMetrics => "/api/v1/metrics/custom",
        }
    }

    /// Whether this kind is subject to probabilistic sampling before
    /// enqueue (spec §4.2: only traces and RUM are sampled; errors,
    /// system metrics, and operational counters are always kept).
    #[must_use]
    pub fn is_sampled(&self) -> bool {
        matches!(self, TelemetryKind::Traces | TelemetryKind::Rum)
    }

    /// Stable string form, used as a `HashMap`/`DashMap` key and in log
    /// fields.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TelemetryKind::Traces => "traces",
            TelemetryKind::SystemMetrics => "systemMetrics",
            TelemetryKind::HttpRequests => "httpRequests",
            TelemetryKind::Errors => "errors",
            TelemetryKind::Logs => "logs",
            TelemetryKind::Rum => "rum",
            TelemetryKind::MongoPoolMetrics => "mongoPoolMetrics",
            TelemetryKind::CollectionStats => "collectionStats",
            TelemetryKind::DdpConnections => "ddpConnections",
            TelemetryKind::Subscriptions => "subscriptions",
            TelemetryKind::LiveQueries => "liveQueries",
            TelemetryKind::DnsMetrics => "dnsMetrics",
            TelemetryKind::OutboundHttp => "outboundHttp",
            TelemetryKind::CpuProfiles => "cpuProfiles",
            TelemetryKind::DeprecatedApis => "deprecatedApis",
            TelemetryKind::Publications => "publications",
            TelemetryKind::Environment => "environment",
            TelemetryKind::Vulnerabilities => "vulnerabilities",
            TelemetryKind::Jobs => "jobs",
            TelemetryKind::CustomMetrics => "customMetrics",
        }
    }
}

impl std::fmt::Display for TelemetryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_has_a_versioned_endpoint() {
        for kind in TelemetryKind::ALL {
            assert!(kind.endpoint_path().starts_with("/api/v1/"));
        }
    }

    #[test]
    fn only_traces_and_rum_are_sampled() {
        for kind in TelemetryKind::ALL {
            let expected = matches!(kind, TelemetryKind::Traces | TelemetryKind::Rum);
            assert_eq!(kind.is_sampled(), expected, "{kind}");
        }
    }
}
