//! Request-scoped [`Context`] propagation and the bounded [`CallStack`]
//! (spec §3, §4.3, §9).
//!
//! Grounded on two teacher patterns:
//! - `turbomcp-core/src/context.rs`'s `RequestContext`, whose shape (an
//!   `Arc`-wrapped handle carrying ids, depth, and a parent link) this
//!   module's [`Context`] follows directly.
//! - `turbomcp-server/src/task_storage.rs`'s bounded, periodically-swept
//!   `Arc<RwLock<HashMap<...>>>` table, which [`CallStack`] generalizes
//!   from task ids to session ids.
//!
//! Propagation across `tokio::spawn` boundaries uses `tokio::task_local!`,
//! the same mechanism `other_examples/.../paradigm-sdk-src-telemetry.rs.rs`
//! uses to thread a telemetry context through spawned continuations
//! without an explicit parameter on every function in the call chain.

use crate::sanitize::{fingerprint, sanitize_args, sanitize_db_args};
use crate::size::estimate;
use crate::trace::{
    Clock, DbOperationDetail, DbOperationKind, FingerprintStats, N1Pattern, Operation,
    Severity, SlowQueryAnalysis, SlowQueryEntry, Trace, UnblockAnalysis, UnblockRecommendation,
    WaitTimes,
};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// Maximum number of concurrently open contexts tracked per session
/// before the oldest is evicted (spec §4.3/§9).
pub const MAX_CALL_STACK_DEPTH: usize = 100;
/// A context left open longer than this is considered abandoned and is
/// swept away (spec §9).
pub const STALE_CONTEXT_TTL: Duration = Duration::from_secs(5 * 60);
/// Duration threshold past which a db operation is flagged slow (spec
/// §4.5's default; configurable per deployment via `apm-telemetry`'s
/// `AgentConfig::slow_query_threshold`).
pub const SLOW_QUERY_THRESHOLD: Duration = Duration::from_millis(1000);
/// Minimum total duration across a fingerprint's occurrences before it is
/// reported as an N+1 pattern (resolves spec §9's open question; see
/// `DESIGN.md`).
pub const N1_MIN_TOTAL_DURATION: Duration = Duration::from_millis(2);
/// Minimum repeat count before a fingerprint is reported as an N+1 pattern.
pub const N1_MIN_COUNT: usize = 5;
/// Hard cap on concurrently in-flight `explain()` side-channel calls per
/// request (spec §5). A request sampling many slow queries at a high
/// `indexUsageSampleRate` must not be able to spawn unbounded concurrent
/// explain tasks against one `Context`.
pub const MAX_PENDING_EXPLAINS: usize = 50;

static NEXT_TRACE_SEQ: AtomicU64 = AtomicU64::new(1);

fn next_trace_id(method_name: &str) -> String {
    let seq = NEXT_TRACE_SEQ.fetch_add(1, Ordering::Relaxed);
    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    format!("{method_name}-{now}-{seq}")
}

tokio::task_local! {
    /// The `Context` for the request currently executing on this task (or
    /// a child task spawned from it). Collectors read this to attach
    /// operations to the right in-progress trace without threading a
    /// parameter through every instrumented call site.
    static CURRENT: Context;
}

#[derive(Debug)]
struct InProgress {
    trace_id: String,
    parent_trace_id: Option<String>,
    method_name: String,
    started_at: SystemTime,
    clock: Clock,
    caller_handler: Option<String>,
    call_depth: u32,
    user_id: Option<String>,
    session_id: Option<String>,
    client_address: Option<String>,
    args: Value,
    operations: Vec<Operation>,
    wait_times: WaitTimes,
    blocking_time: Duration,
    waited_on: Duration,
    query_fingerprints: Option<HashMap<String, FingerprintStats>>,
    slow_queries: Option<Vec<SlowQueryEntry>>,
    unblock_called: bool,
    unblock_called_at: Option<Duration>,
    error: Option<String>,
    emitted: bool,
    pending_explains: usize,
}

/// A handle to a request's in-progress trace (spec §3's "Context" — the
/// mutable counterpart of the immutable, emitted [`Trace`]).
///
/// Cheaply cloneable: clones share the same underlying state, which is
/// what lets a spawned continuation (carrying its own `Context` clone via
/// `CURRENT`) keep recording operations against the same trace.
#[derive(Debug, Clone)]
pub struct Context {
    inner: Arc<Mutex<InProgress>>,
    opened_at: Instant,
}

/// Options used to start a new top-level or nested [`Context`] (spec §3).
#[derive(Debug, Clone, Default)]
pub struct ContextOptions {
    /// Name of the handler/endpoint this context is tracing.
    pub method_name: String,
    /// Parent context, if this is a nested handler invocation.
    pub parent: Option<Context>,
    /// Authenticated user id.
    pub user_id: Option<String>,
    /// Session id.
    pub session_id: Option<String>,
    /// Client address.
    pub client_address: Option<String>,
    /// Raw (unsanitized) arguments; sanitized on entry.
    pub args: Value,
}

impl Context {
    /// Start a new context. If `options.parent` is set, trace id lineage
    /// and call depth are derived from it (spec §3, §4.5 nested linkage).
    #[must_use]
    pub fn start(options: ContextOptions) -> Self {
        let (parent_trace_id, call_depth, caller_handler, session_id) = match &options.parent {
            Some(parent) => {
                let p = parent.inner.lock();
                (
                    Some(p.trace_id.clone()),
                    p.call_depth + 1,
                    Some(p.method_name.clone()),
                    options.session_id.clone().or_else(|| p.session_id.clone()),
                )
            }
            None => (None, 0, None, options.session_id.clone()),
        };

        let trace_id = next_trace_id(&options.method_name);
        let inner = InProgress {
            trace_id,
            parent_trace_id,
            method_name: options.method_name,
            started_at: SystemTime::now(),
            clock: Clock::start(),
            caller_handler,
            call_depth,
            user_id: options.user_id,
            session_id,
            client_address: options.client_address,
            args: sanitize_args(&options.args),
            operations: vec![Operation::Start { offset: Duration::ZERO }],
            wait_times: WaitTimes::default(),
            blocking_time: Duration::ZERO,
            waited_on: Duration::ZERO,
            query_fingerprints: None,
            slow_queries: None,
            unblock_called: false,
            unblock_called_at: None,
            error: None,
            emitted: false,
            pending_explains: 0,
        };

        Self {
            inner: Arc::new(Mutex::new(inner)),
            opened_at: Instant::now(),
        }
    }

    /// The trace id this context will emit under.
    #[must_use]
    pub fn trace_id(&self) -> String {
        self.inner.lock().trace_id.clone()
    }

    /// How long ago this context was opened — used by [`CallStack`] to
    /// identify abandoned entries.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    /// Run `f` with this context set as [`Context::current`] for the
    /// duration of the call, including across any `tokio::spawn`ed
    /// continuation started from inside `f` that itself uses
    /// [`Context::propagate`].
    pub async fn scope<F, T>(&self, f: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        CURRENT.scope(self.clone(), f).await
    }

    /// Fetch the context for the currently executing task, if one was
    /// installed via [`Context::scope`].
    #[must_use]
    pub fn current() -> Option<Context> {
        CURRENT.try_with(Clone::clone).ok()
    }

    /// Wrap a future so that, when polled/spawned elsewhere, it resumes
    /// inside this context's scope. Mirrors the task-local propagation
    /// idiom used for continuations spawned off the request's main task.
    pub fn propagate<F>(&self, f: F) -> impl std::future::Future<Output = F::Output>
    where
        F: std::future::Future,
    {
        let ctx = self.clone();
        async move { ctx.scope(f).await }
    }

    /// Record a database operation using the default slow-query threshold
    /// (spec §4.5's 1000 ms default). See [`Context::record_db_operation_with_threshold`]
    /// for the configurable form used by `apm-agent`'s database collector.
    pub fn record_db_operation(
        &self,
        collection: &str,
        operation: DbOperationKind,
        selector: &Value,
        pipeline: Option<&Value>,
        duration: Duration,
        error: Option<String>,
    ) {
        self.record_db_operation_with_threshold(
            collection,
            operation,
            selector,
            pipeline,
            duration,
            error,
            SLOW_QUERY_THRESHOLD,
        );
    }

    /// Record a database operation on the timeline, updating the lazy
    /// fingerprint map and slow-query list as needed (spec §4.5, §4.6),
    /// flagging it slow against a caller-supplied threshold rather than
    /// the built-in default.
    #[allow(clippy::too_many_arguments)]
    pub fn record_db_operation_with_threshold(
        &self,
        collection: &str,
        operation: DbOperationKind,
        selector: &Value,
        pipeline: Option<&Value>,
        duration: Duration,
        error: Option<String>,
        slow_threshold: Duration,
    ) {
        let mut inner = self.inner.lock();
        if inner.emitted {
            return;
        }
        let offset = inner.clock.elapsed();
        let sanitized_selector = sanitize_db_args(selector);
        let sanitized_pipeline = pipeline.map(sanitize_db_args);

        let slow_query = if duration >= slow_threshold {
            Some(analyze_slow_query(duration, &sanitized_selector))
        } else {
            None
        };

        let fp = fingerprint(collection, operation.as_str(), &sanitized_selector);
        let stats = inner
            .query_fingerprints
            .get_or_insert_with(HashMap::new)
            .entry(fp)
            .or_insert_with(|| FingerprintStats {
                collection: collection.to_string(),
                operation: Some(operation),
                count: 0,
                total_duration: Duration::ZERO,
                samples: Vec::new(),
            });
        stats.count += 1;
        stats.total_duration += duration;
        if stats.samples.len() < 3 {
            stats.samples.push(sanitized_selector.clone());
        }

        let op_index = inner.operations.len();
        inner.operations.push(Operation::Db {
            offset,
            detail: DbOperationDetail {
                collection: collection.to_string(),
                operation,
                selector: sanitized_selector,
                pipeline: sanitized_pipeline,
                duration,
                slow_query: slow_query.clone(),
                index_usage: None,
                error,
            },
        });

        if let Some(analysis) = slow_query {
            inner
                .slow_queries
                .get_or_insert_with(Vec::new)
                .push(SlowQueryEntry { operation_index: op_index, analysis });
        }
    }

    /// Reserve one of this context's bounded `explain()` side-channel
    /// slots (spec §5's "Pending-explains per request: 50"). Returns
    /// `false` if the cap is already reached (or the trace has already
    /// been emitted), in which case the caller must not spawn the
    /// explain task. Every successful reservation must be paired with a
    /// [`Context::finish_explain`] once the side-channel call settles.
    pub fn try_begin_explain(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.emitted || inner.pending_explains >= MAX_PENDING_EXPLAINS {
            return false;
        }
        inner.pending_explains += 1;
        true
    }

    /// Release a slot reserved by [`Context::try_begin_explain`], whether
    /// or not the explain call produced a result.
    pub fn finish_explain(&self) {
        let mut inner = self.inner.lock();
        inner.pending_explains = inner.pending_explains.saturating_sub(1);
    }

    /// Attach an asynchronously-arrived `explain()` result to the most
    /// recent matching db operation. Discarded silently if the trace has
    /// already been emitted (spec §3 immutability invariant, §9 open
    /// question resolution — see `DESIGN.md`).
    pub fn attach_index_usage(&self, collection: &str, usage: crate::trace::IndexUsage) {
        let mut inner = self.inner.lock();
        if inner.emitted {
            return;
        }
        if let Some(Operation::Db { detail, .. }) = inner
            .operations
            .iter_mut()
            .rev()
            .find(|op| matches!(op, Operation::Db { detail, .. } if detail.collection == collection))
        {
            detail.index_usage = Some(usage);
        }
    }

    /// Record a generic (non-db) operation on the timeline.
    pub fn record_operation(&self, operation: Operation) {
        let mut inner = self.inner.lock();
        if inner.emitted {
            return;
        }
        inner.operations.push(operation);
    }

    /// Record time spent waiting before the handler began executing.
    pub fn record_queue_wait(&self, wait: Duration, wait_list: Vec<String>) {
        let mut inner = self.inner.lock();
        if inner.emitted {
            return;
        }
        inner.wait_times.queue_wait = Some(wait);
        inner.wait_times.wait_list = wait_list;
    }

    /// Record time spent waiting for a pooled resource (e.g. a db
    /// connection) before the handler began executing.
    pub fn record_pool_wait(&self, wait: Duration) {
        let mut inner = self.inner.lock();
        if inner.emitted {
            return;
        }
        inner.wait_times.pool_wait = Some(wait);
    }

    /// Record that this handler called its session's `unblock` callable,
    /// releasing the queue for sibling requests (spec §4.3).
    pub fn record_unblock_called(&self) {
        let mut inner = self.inner.lock();
        if inner.emitted || inner.unblock_called {
            return;
        }
        inner.unblock_called = true;
        inner.unblock_called_at = Some(inner.clock.elapsed());
    }

    /// Add to the cumulative time this handler blocked its session's queue.
    pub fn add_blocking_time(&self, d: Duration) {
        let mut inner = self.inner.lock();
        inner.blocking_time += d;
    }

    /// Add to the cumulative time this handler imposed on sibling requests.
    pub fn add_waited_on(&self, d: Duration) {
        let mut inner = self.inner.lock();
        inner.waited_on += d;
    }

    /// Record the handler's terminal error, if it failed.
    pub fn record_error(&self, message: impl Into<String>) {
        let mut inner = self.inner.lock();
        if inner.emitted {
            return;
        }
        inner.error = Some(message.into());
    }

    /// Freeze this context into an immutable [`Trace`] and mark it
    /// emitted. Any further mutation attempt becomes a no-op (spec §3
    /// invariant). Safe to call more than once; only the first call
    /// produces a `Trace`.
    pub fn emit(&self) -> Option<Trace> {
        let mut inner = self.inner.lock();
        if inner.emitted {
            return None;
        }
        let duration = inner.clock.elapsed();
        inner.operations.push(Operation::Complete { offset: duration });
        inner.emitted = true;

        let n1_patterns = derive_n1_patterns(inner.query_fingerprints.as_ref());
        let unblock_analysis = derive_unblock_analysis(
            inner.unblock_called,
            inner.unblock_called_at,
            inner.blocking_time,
            inner.waited_on,
            duration,
        );

        Some(Trace {
            trace_id: inner.trace_id.clone(),
            parent_trace_id: inner.parent_trace_id.clone(),
            method_name: inner.method_name.clone(),
            started_at: inner.started_at,
            duration,
            caller_handler: inner.caller_handler.clone(),
            call_depth: inner.call_depth,
            user_id: inner.user_id.clone(),
            session_id: inner.session_id.clone(),
            client_address: inner.client_address.clone(),
            args: inner.args.clone(),
            operations: inner.operations.clone(),
            wait_times: inner.wait_times.clone(),
            blocking_time: inner.blocking_time,
            waited_on: inner.waited_on,
            query_fingerprints: inner.query_fingerprints.clone(),
            slow_queries: inner.slow_queries.clone(),
            unblock_analysis,
            n1_patterns,
            error: inner.error.clone(),
        })
    }
}

fn analyze_slow_query(duration: Duration, selector: &Value) -> SlowQueryAnalysis {
    let severity = Severity::from_duration(duration);
    let mut likely_issues = Vec::new();

    let is_empty_selector = selector.as_object().map(Map::is_empty).unwrap_or(false);
    if is_empty_selector {
        likely_issues.push(crate::trace::LikelyIssue::CollectionScan);
    }
    if let Some(obj) = selector.as_object() {
        if obj.len() > 2 {
            likely_issues.push(crate::trace::LikelyIssue::ComplexQuery);
        }
        if obj.contains_key("$where") || obj.contains_key("$expr") {
            likely_issues.push(crate::trace::LikelyIssue::ComplexOperator);
        }
        if contains_regex_operator(obj) {
            likely_issues.push(crate::trace::LikelyIssue::RegexQuery);
        }
    }
    if likely_issues.is_empty() {
        likely_issues.push(crate::trace::LikelyIssue::MissingIndex);
    }

    let recommendations = likely_issues
        .iter()
        .map(|issue| match issue {
            crate::trace::LikelyIssue::MissingIndex => {
                "Add an index covering the query's selector fields".to_string()
            }
            crate::trace::LikelyIssue::SuboptimalIndex => {
                "Review the chosen index; it may not match the selector's field order".to_string()
            }
            crate::trace::LikelyIssue::CollectionScan => {
                "Query has an empty selector; consider narrowing it or paginating".to_string()
            }
            crate::trace::LikelyIssue::ComplexQuery => {
                "Selector has many top-level fields; consider a compound index".to_string()
            }
            crate::trace::LikelyIssue::RegexQuery => {
                "Regex selectors rarely use indexes efficiently; anchor the pattern or precompute a field"
                    .to_string()
            }
            crate::trace::LikelyIssue::ComplexOperator => {
                "$where/$expr bypass most index optimizations; rewrite with plain selector fields"
                    .to_string()
            }
        })
        .collect();

    SlowQueryAnalysis { severity, likely_issues, recommendations }
}

fn contains_regex_operator(obj: &Map<String, Value>) -> bool {
    obj.values().any(|v| match v {
        Value::Object(inner) => inner.contains_key("$regex"),
        _ => false,
    })
}

fn derive_n1_patterns(fingerprints: Option<&HashMap<String, FingerprintStats>>) -> Vec<N1Pattern> {
    let Some(map) = fingerprints else {
        return Vec::new();
    };
    let mut patterns: Vec<N1Pattern> = map
        .iter()
        .filter(|(_, stats)| stats.count >= N1_MIN_COUNT && stats.total_duration >= N1_MIN_TOTAL_DURATION)
        .map(|(fp, stats)| {
            let avg = stats.total_duration / stats.count as u32;
            N1Pattern {
                fingerprint: fp.clone(),
                collection: stats.collection.clone(),
                operation: stats.operation.unwrap_or_default(),
                count: stats.count,
                total_duration: stats.total_duration,
                avg_duration: avg,
                samples: stats.samples.clone(),
                suggestion: format!(
                    "{} calls to {}.{} with similar selectors; consider batching with a single `$in` query",
                    stats.count,
                    stats.collection,
                    stats.operation.map(|o| o.as_str()).unwrap_or("find"),
                ),
            }
        })
        .collect();
    patterns.sort_by(|a, b| b.total_duration.cmp(&a.total_duration));
    patterns
}

fn derive_unblock_analysis(
    called: bool,
    called_at: Option<Duration>,
    blocking_time: Duration,
    waited_on: Duration,
    total_duration: Duration,
) -> Option<UnblockAnalysis> {
    let blocking_ms = blocking_time.as_millis() as f64;
    let waited_on_ms = waited_on.as_millis() as f64;
    let duration_ms = total_duration.as_millis() as f64;

    // Three components scaled to the point budget spec §4.5 assigns them:
    // blocking time and waited-on each contribute up to 4 points, duration
    // up to 2, for a maximum impactScore of 10. Each component saturates
    // at a reference scale of 1 second — past that the handler is already
    // unambiguously worth fixing.
    let impact_score = if called {
        0.0
    } else {
        let blocking_pts = (blocking_ms / 1000.0 * 4.0).min(4.0);
        let waited_on_pts = (waited_on_ms / 1000.0 * 4.0).min(4.0);
        let duration_pts = (duration_ms / 1000.0 * 2.0).min(2.0);
        (blocking_pts + waited_on_pts + duration_pts).clamp(0.0, 10.0)
    };

    let recommendation = if called {
        UnblockRecommendation::None
    } else if impact_score >= 7.0 {
        UnblockRecommendation::High
    } else if impact_score >= 4.0 {
        UnblockRecommendation::Medium
    } else if impact_score > 0.0 {
        UnblockRecommendation::Low
    } else {
        UnblockRecommendation::None
    };

    let potential_saving = if called {
        None
    } else {
        let saved_ms = total_duration.saturating_sub(Duration::from_millis(20));
        let capped = saved_ms.min(waited_on);
        Some(capped)
    };

    // Spec §4.5: when unblock was never called and there is nothing to
    // recommend, the analysis is omitted entirely rather than emitted as
    // a zero-impact no-op.
    if !called && recommendation == UnblockRecommendation::None {
        return None;
    }

    Some(UnblockAnalysis {
        called,
        time_to_unblock: called_at,
        impact_score,
        recommendation,
        potential_saving,
    })
}

/// A bounded, per-session stack of open [`Context`]s (spec §4.3/§9).
///
/// Generalizes `turbomcp-server/src/task_storage.rs`'s
/// `Arc<RwLock<HashMap<TaskId, TaskEntry>>>` table from task ids to
/// session ids, with the same two safety properties: a hard depth bound
/// per key (oldest entry evicted on overflow, never an unbounded stack),
/// and a background sweep that drops entries that have sat open past
/// [`STALE_CONTEXT_TTL`] (a handler that never completed, e.g. after a
/// panic swallowed by a supervisor).
#[derive(Debug, Clone)]
pub struct CallStack {
    sessions: Arc<parking_lot::RwLock<HashMap<String, VecDeque<Context>>>>,
}

impl Default for CallStack {
    fn default() -> Self {
        Self::new()
    }
}

impl CallStack {
    /// Build an empty call stack.
    #[must_use]
    pub fn new() -> Self {
        Self { sessions: Arc::new(parking_lot::RwLock::new(HashMap::new())) }
    }

    /// Push a context onto its session's stack. Returns `true` if an
    /// older entry was evicted to make room (spec §4.3's "drop oldest").
    pub fn push(&self, session_id: &str, ctx: Context) -> bool {
        let mut sessions = self.sessions.write();
        let stack = sessions.entry(session_id.to_string()).or_default();
        stack.push_back(ctx);
        if stack.len() > MAX_CALL_STACK_DEPTH {
            stack.pop_front();
            true
        } else {
            false
        }
    }

    /// Return the most recently pushed context for a session without
    /// removing it — used by the Request Tracer to find the caller for
    /// parent linkage before pushing the child (spec §4.5).
    #[must_use]
    pub fn peek(&self, session_id: &str) -> Option<Context> {
        self.sessions.read().get(session_id).and_then(|stack| stack.back().cloned())
    }

    /// Pop the most recently pushed context for a session, if any.
    pub fn pop(&self, session_id: &str) -> Option<Context> {
        let mut sessions = self.sessions.write();
        let popped = sessions.get_mut(session_id).and_then(VecDeque::pop_back);
        if sessions.get(session_id).is_some_and(VecDeque::is_empty) {
            sessions.remove(session_id);
        }
        popped
    }

    /// Current depth of a session's stack.
    #[must_use]
    pub fn depth(&self, session_id: &str) -> usize {
        self.sessions.read().get(session_id).map_or(0, VecDeque::len)
    }

    /// Sweep all sessions, dropping contexts open longer than
    /// [`STALE_CONTEXT_TTL`]. Returns the number of contexts dropped.
    pub fn sweep_stale(&self) -> usize {
        let mut sessions = self.sessions.write();
        let mut dropped = 0usize;
        sessions.retain(|_, stack| {
            let before = stack.len();
            stack.retain(|ctx| ctx.age() < STALE_CONTEXT_TTL);
            dropped += before - stack.len();
            !stack.is_empty()
        });
        dropped
    }

    /// Total number of open contexts across all sessions.
    #[must_use]
    pub fn total_open(&self) -> usize {
        self.sessions.read().values().map(VecDeque::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(method: &str) -> Context {
        Context::start(ContextOptions {
            method_name: method.to_string(),
            session_id: Some("s1".to_string()),
            args: json!({}),
            ..Default::default()
        })
    }

    #[test]
    fn emit_is_idempotent_and_freezes_state() {
        let c = ctx("users.get");
        let first = c.emit().expect("first emit produces a trace");
        c.record_error("late write");
        let second = c.emit();
        assert!(second.is_none());
        assert!(first.error.is_none());
    }

    #[test]
    fn nested_context_inherits_trace_lineage() {
        let parent = ctx("orders.process");
        let child = Context::start(ContextOptions {
            method_name: "payments.charge".to_string(),
            parent: Some(parent.clone()),
            args: json!({}),
            ..Default::default()
        });
        let parent_trace = parent.emit().unwrap();
        let child_trace = child.emit().unwrap();
        assert_eq!(child_trace.parent_trace_id, Some(parent_trace.trace_id));
        assert_eq!(child_trace.call_depth, 1);
    }

    #[test]
    fn repeated_similar_selectors_become_n1_pattern() {
        let c = ctx("orders.list");
        for i in 0..5 {
            c.record_db_operation(
                "Users",
                DbOperationKind::FindOne,
                &json!({"userId": i}),
                None,
                Duration::from_millis(3),
                None,
            );
        }
        let trace = c.emit().unwrap();
        assert_eq!(trace.n1_patterns.len(), 1);
        assert_eq!(trace.n1_patterns[0].count, 5);
    }

    #[test]
    fn slow_query_gets_flagged_with_analysis() {
        let c = ctx("reports.generate");
        c.record_db_operation(
            "Events",
            DbOperationKind::Find,
            &json!({}),
            None,
            Duration::from_millis(1200),
            None,
        );
        let trace = c.emit().unwrap();
        let slow = trace.slow_queries.expect("slow query recorded");
        assert_eq!(slow.len(), 1);
        assert_eq!(slow[0].analysis.severity, Severity::Critical);
        assert!(slow[0]
            .analysis
            .likely_issues
            .contains(&crate::trace::LikelyIssue::CollectionScan));
    }

    #[test]
    fn custom_threshold_flags_queries_below_the_default() {
        let c = ctx("reports.summary");
        c.record_db_operation_with_threshold(
            "Events",
            DbOperationKind::Find,
            &json!({"a": 1}),
            None,
            Duration::from_millis(250),
            None,
            Duration::from_millis(100),
        );
        let trace = c.emit().unwrap();
        let slow = trace.slow_queries.expect("slow query recorded at custom threshold");
        assert_eq!(slow[0].analysis.severity, Severity::Medium);
    }

    #[test]
    fn unblock_called_zeroes_out_recommendation() {
        let c = ctx("jobs.run");
        c.add_blocking_time(Duration::from_millis(500));
        c.record_unblock_called();
        let trace = c.emit().unwrap();
        let ua = trace.unblock_analysis.expect("analysis present due to blocking time");
        assert_eq!(ua.recommendation, UnblockRecommendation::None);
        assert!(ua.potential_saving.is_none());
    }

    #[test]
    fn call_stack_evicts_oldest_past_bound() {
        let stack = CallStack::new();
        for i in 0..(MAX_CALL_STACK_DEPTH + 3) {
            stack.push("s1", ctx(&format!("h{i}")));
        }
        assert_eq!(stack.depth("s1"), MAX_CALL_STACK_DEPTH);
    }

    #[tokio::test]
    async fn context_propagates_across_spawned_continuation() {
        let c = ctx("webhooks.deliver");
        let c2 = c.clone();
        c.scope(async move {
            let handle = tokio::spawn(c2.propagate(async {
                assert!(Context::current().is_some());
            }));
            handle.await.unwrap();
        })
        .await;
    }

    #[test]
    fn pending_explains_is_capped_and_released() {
        let c = ctx("orders.list");
        for _ in 0..MAX_PENDING_EXPLAINS {
            assert!(c.try_begin_explain());
        }
        assert!(!c.try_begin_explain());
        c.finish_explain();
        assert!(c.try_begin_explain());
    }

    #[test]
    fn emitted_context_refuses_new_explain_reservations() {
        let c = ctx("orders.list");
        c.emit();
        assert!(!c.try_begin_explain());
    }
}
