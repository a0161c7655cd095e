//! The `Trace`/`Operation` data model (spec §3).
//!
//! Once emitted, a `Trace` is immutable (spec §3 invariant): any in-flight
//! side effect (e.g. an explain() result) that arrives after emission is
//! discarded silently — enforced by [`crate::context::Context::emit`]
//! taking the in-progress state by value and handing back a frozen
//! `Trace`, rather than leaving a live handle any collector could keep
//! mutating.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime};

/// Severity bucket for a slow query (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    /// ≥ 1000 ms
    Critical,
    /// ≥ 500 ms
    High,
    /// ≥ 200 ms
    Medium,
    /// below the Medium threshold but still flagged as slow
    Low,
}

impl Severity {
    /// Classify a duration per spec §4.5's severity bands.
    #[must_use]
    pub fn from_duration(duration: Duration) -> Self {
        let ms = duration.as_millis();
        if ms >= 1000 {
            Severity::Critical
        } else if ms >= 500 {
            Severity::High
        } else if ms >= 200 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

/// Likely root cause tag attached to a slow query (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LikelyIssue {
    /// No matching index could explain the scan cost.
    MissingIndex,
    /// An index exists but isn't a good fit for the selector shape.
    SuboptimalIndex,
    /// Selector is empty — a full collection scan.
    CollectionScan,
    /// Selector has more than two top-level fields.
    ComplexQuery,
    /// Selector contains a regex match.
    RegexQuery,
    /// Selector uses `$where`/`$expr`.
    ComplexOperator,
}

/// Heuristic analysis of a single slow db operation (spec §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlowQueryAnalysis {
    /// Severity bucket derived from duration.
    pub severity: Severity,
    /// Suspected causes, may be empty.
    pub likely_issues: Vec<LikelyIssue>,
    /// Human-readable recommendations derived from `likely_issues`.
    pub recommendations: Vec<String>,
}

/// Result of an asynchronous `explain()` side-channel (spec §4.5, §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexUsage {
    /// Index name chosen by the planner, if any.
    pub index_name: Option<String>,
    /// Documents examined to produce the result.
    pub docs_examined: u64,
    /// Index keys examined.
    pub keys_examined: u64,
    /// Rows actually returned.
    pub rows_returned: u64,
    /// `rows_returned / docs_examined`, as a percentage; `None` if
    /// `docs_examined` is zero (avoids a division by zero).
    pub efficiency_pct: Option<f64>,
}

impl IndexUsage {
    /// Compute efficiency percentage from the raw counters.
    #[must_use]
    pub fn new(index_name: Option<String>, docs_examined: u64, keys_examined: u64, rows_returned: u64) -> Self {
        let efficiency_pct = if docs_examined == 0 {
            None
        } else {
            Some((rows_returned as f64 / docs_examined as f64) * 100.0)
        };
        Self {
            index_name,
            docs_examined,
            keys_examined,
            rows_returned,
            efficiency_pct,
        }
    }
}

/// A database operation's kind (spec §4.6's terminal query methods,
/// collapsed to the logical operation they perform).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DbOperationKind {
    FindOne,
    Find,
    Insert,
    Update,
    Remove,
    Upsert,
    CursorFetch,
    CursorCount,
    AggregateToArray,
}

impl DbOperationKind {
    /// Short name used in fingerprints and N+1 suggestion text.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DbOperationKind::FindOne => "findOne",
            DbOperationKind::Find => "find",
            DbOperationKind::Insert => "insert",
            DbOperationKind::Update => "update",
            DbOperationKind::Remove => "remove",
            DbOperationKind::Upsert => "upsert",
            DbOperationKind::CursorFetch => "cursor.fetch",
            DbOperationKind::CursorCount => "cursor.count",
            DbOperationKind::AggregateToArray => "aggregate.toArray",
        }
    }
}

/// Detail payload for a `db` Operation variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbOperationDetail {
    /// Collection name.
    pub collection: String,
    /// Operation kind.
    pub operation: DbOperationKind,
    /// Sanitized selector/query document.
    pub selector: Value,
    /// Sanitized aggregation pipeline, if this was an aggregate call.
    pub pipeline: Option<Value>,
    /// Operation duration.
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    /// Populated when `duration` crosses the slow-query threshold.
    pub slow_query: Option<SlowQueryAnalysis>,
    /// Filled in asynchronously by the explain() side-channel, if any.
    pub index_usage: Option<IndexUsage>,
    /// Error message, if the underlying call failed. The Operation is
    /// still appended even on error (spec §4.6).
    pub error: Option<String>,
}

/// A single entry in a `Trace`'s operation timeline (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Operation {
    /// First entry in every emitted trace.
    Start {
        /// Offset from the trace's start — always zero.
        #[serde(with = "duration_millis")]
        offset: Duration,
    },
    /// Last entry in every emitted trace.
    Complete {
        /// Offset from the trace's start.
        #[serde(with = "duration_millis")]
        offset: Duration,
    },
    /// A database operation.
    Db {
        /// Offset from the trace's start.
        #[serde(with = "duration_millis")]
        offset: Duration,
        /// Operation detail.
        detail: DbOperationDetail,
    },
    /// An outbound HTTP call made while handling the request.
    Http {
        /// Offset from the trace's start.
        #[serde(with = "duration_millis")]
        offset: Duration,
        /// Request method.
        method: String,
        /// Sanitized target URL (query string stripped of sensitive keys).
        url: String,
        /// Response status, if one was received.
        status: Option<u16>,
        /// Call duration.
        #[serde(with = "duration_millis")]
        duration: Duration,
    },
    /// Time spent waiting (queue wait, pool wait, etc).
    Wait {
        /// Offset from the trace's start.
        #[serde(with = "duration_millis")]
        offset: Duration,
        /// What was waited on.
        kind: String,
        /// Wait duration.
        #[serde(with = "duration_millis")]
        duration: Duration,
    },
    /// CPU-bound computation, recorded by a collector that brackets it.
    Compute {
        /// Offset from the trace's start.
        #[serde(with = "duration_millis")]
        offset: Duration,
        /// Label for the computation.
        label: String,
        /// Duration of the computation.
        #[serde(with = "duration_millis")]
        duration: Duration,
    },
    /// A generic async operation (timers, deferred work).
    Async {
        /// Offset from the trace's start.
        #[serde(with = "duration_millis")]
        offset: Duration,
        /// Label for the async unit of work.
        label: String,
        /// Duration, if it has resolved by emit time.
        duration: Option<Duration>,
    },
    /// Outbound email/notification send.
    Email {
        /// Offset from the trace's start.
        #[serde(with = "duration_millis")]
        offset: Duration,
        /// Recipient count (never the addresses themselves — PII).
        recipient_count: usize,
        /// Send duration.
        #[serde(with = "duration_millis")]
        duration: Duration,
    },
    /// A nested request handler invocation (spec §4.5 parent linkage).
    Method {
        /// Offset from the trace's start.
        #[serde(with = "duration_millis")]
        offset: Duration,
        /// Nested handler's method/endpoint name.
        name: String,
        /// Nested handler's trace id, for client-side linking.
        child_trace_id: String,
        /// Nested handler's duration.
        #[serde(with = "duration_millis")]
        duration: Duration,
    },
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u128(d.as_millis())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

/// An aggregated N+1 query pattern (derived at emit time, spec §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct N1Pattern {
    /// The fingerprint string this pattern was grouped under.
    pub fingerprint: String,
    /// Collection the pattern operated on.
    pub collection: String,
    /// Operation kind.
    pub operation: DbOperationKind,
    /// Number of times this fingerprint recurred.
    pub count: usize,
    /// Sum of durations across all occurrences.
    #[serde(with = "duration_millis")]
    pub total_duration: Duration,
    /// `total_duration / count`.
    #[serde(with = "duration_millis")]
    pub avg_duration: Duration,
    /// Up to the first three sanitized selector samples.
    pub samples: Vec<Value>,
    /// Human-readable suggestion (e.g. batch with `$in`).
    pub suggestion: String,
}

/// Recommendation tier for the unblock analysis (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UnblockRecommendation {
    None,
    Low,
    Medium,
    High,
}

/// Emit-time derivation of whether/how well this handler released its
/// session's queue for sibling work (spec §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnblockAnalysis {
    /// Whether the handler's `unblock` callable was invoked.
    pub called: bool,
    /// Time from handler start to `unblock` invocation, if called.
    #[serde(with = "opt_duration_millis")]
    pub time_to_unblock: Option<Duration>,
    /// Score in `[0, 10]` combining blocking time, waited-on, and duration.
    pub impact_score: f64,
    /// Tiered recommendation derived from `impact_score`.
    pub recommendation: UnblockRecommendation,
    /// For traces where unblock was never called: the latency that could
    /// plausibly have been saved by calling it promptly.
    #[serde(with = "opt_duration_millis")]
    pub potential_saving: Option<Duration>,
}

mod opt_duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&d.as_millis()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let millis: Option<u64> = Option::deserialize(d)?;
        Ok(millis.map(Duration::from_millis))
    }
}

/// Inbound queue wait and connection-pool wait recorded before the
/// handler started executing (spec §3, §4.7).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WaitTimes {
    /// Time the request message sat in its session's inbound queue.
    #[serde(with = "opt_duration_millis")]
    pub queue_wait: Option<Duration>,
    /// Time spent waiting for a connection-pool resource, if measured.
    #[serde(with = "opt_duration_millis")]
    pub pool_wait: Option<Duration>,
    /// Identifiers of other messages/requests this handler's startup had
    /// to wait behind.
    pub wait_list: Vec<String>,
}

/// A fully emitted, immutable unit of telemetry for a completed request
/// (spec §3). Construct via [`crate::context::Context::emit`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    /// Unique, monotonic-within-process trace id.
    pub trace_id: String,
    /// Parent trace id, if this request was nested inside another.
    pub parent_trace_id: Option<String>,
    /// Handler/endpoint name.
    pub method_name: String,
    /// Wall-clock start time.
    pub started_at: SystemTime,
    /// Total handler duration.
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    /// Handler name of the caller, if nested.
    pub caller_handler: Option<String>,
    /// Call depth (0 for a top-level request).
    pub call_depth: u32,
    /// Authenticated user id, if any.
    pub user_id: Option<String>,
    /// Session id.
    pub session_id: Option<String>,
    /// Client address, if known.
    pub client_address: Option<String>,
    /// Sanitized argument map.
    pub args: Value,
    /// Ordered operation timeline.
    pub operations: Vec<Operation>,
    /// Inbound/pool wait bookkeeping.
    pub wait_times: WaitTimes,
    /// Time this handler held its session's queue blocked.
    #[serde(with = "duration_millis")]
    pub blocking_time: Duration,
    /// Cumulative time this handler imposed on sibling requests.
    #[serde(with = "duration_millis")]
    pub waited_on: Duration,
    /// Lazily populated per-fingerprint query counts (absent when there
    /// are no db operations, per spec §8's lazy-init contract).
    pub query_fingerprints: Option<HashMap<String, FingerprintStats>>,
    /// Lazily populated slow-query list.
    pub slow_queries: Option<Vec<SlowQueryEntry>>,
    /// Unblock impact analysis, omitted per spec §4.5's suppression rule.
    pub unblock_analysis: Option<UnblockAnalysis>,
    /// Derived N+1 patterns, sorted descending by total duration.
    pub n1_patterns: Vec<N1Pattern>,
    /// Error message, if the handler failed.
    pub error: Option<String>,
}

/// Per-fingerprint bookkeeping accumulated while the trace is in
/// progress (spec §3, "per-fingerprint query-pattern map (lazy)").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FingerprintStats {
    /// Collection this fingerprint belongs to.
    pub collection: String,
    /// Operation kind.
    pub operation: Option<DbOperationKind>,
    /// Number of occurrences so far.
    pub count: usize,
    /// Sum of durations so far.
    #[serde(with = "duration_millis")]
    pub total_duration: Duration,
    /// Up to the first three sanitized selector samples.
    pub samples: Vec<Value>,
}

impl Default for DbOperationKind {
    fn default() -> Self {
        DbOperationKind::Find
    }
}

/// One slow-query timeline entry retained on the in-progress trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlowQueryEntry {
    /// Index into `operations` this entry refers to.
    pub operation_index: usize,
    /// Copy of the analysis attached to that operation.
    pub analysis: SlowQueryAnalysis,
}

/// Monotonic clock handle used to compute relative offsets. Wraps
/// [`Instant`] so tests can swap in a fake clock without poisoning the
/// public `Trace`/`Operation` API with a generic parameter.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    start: Instant,
}

impl Clock {
    /// Start a new clock "now".
    #[must_use]
    pub fn start() -> Self {
        Self { start: Instant::now() }
    }

    /// Elapsed time since this clock started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_bands() {
        assert_eq!(Severity::from_duration(Duration::from_millis(1500)), Severity::Critical);
        assert_eq!(Severity::from_duration(Duration::from_millis(600)), Severity::High);
        assert_eq!(Severity::from_duration(Duration::from_millis(250)), Severity::Medium);
        assert_eq!(Severity::from_duration(Duration::from_millis(50)), Severity::Low);
    }

    #[test]
    fn index_usage_efficiency_avoids_div_by_zero() {
        let u = IndexUsage::new(None, 0, 0, 0);
        assert_eq!(u.efficiency_pct, None);
        let u2 = IndexUsage::new(Some("idx".into()), 100, 100, 50);
        assert_eq!(u2.efficiency_pct, Some(50.0));
    }

    #[test]
    fn trace_roundtrips_through_json() {
        let t = Trace {
            trace_id: "users.get-123-1".into(),
            parent_trace_id: None,
            method_name: "users.get".into(),
            started_at: SystemTime::now(),
            duration: Duration::from_millis(120),
            caller_handler: None,
            call_depth: 0,
            user_id: None,
            session_id: Some("s1".into()),
            client_address: None,
            args: serde_json::json!({}),
            operations: vec![
                Operation::Start { offset: Duration::ZERO },
                Operation::Complete { offset: Duration::from_millis(120) },
            ],
            wait_times: WaitTimes::default(),
            blocking_time: Duration::ZERO,
            waited_on: Duration::ZERO,
            query_fingerprints: None,
            slow_queries: None,
            unblock_analysis: None,
            n1_patterns: vec![],
            error: None,
        };
        let json = serde_json::to_string(&t).unwrap();
        let back: Trace = serde_json::from_str(&json).unwrap();
        assert_eq!(back.trace_id, t.trace_id);
        assert_eq!(back.operations.len(), 2);
    }
}
