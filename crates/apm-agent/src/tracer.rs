//! The Request Tracer (spec §4.5).
//!
//! Wraps each registered request handler, threading an `apm_core::Context`
//! through its execution and emitting a `Trace` to the Egress Client on
//! completion. Parent linkage for nested handler invocations is resolved
//! through `CallStack::peek`, the way a supervisor tree tracks the
//! currently-executing ancestor without requiring every layer to pass an
//! explicit parameter.

use apm_core::{CallStack, Context, ContextOptions, Operation};
use apm_telemetry::{AgentConfig, EgressClient, TelemetryKind};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use crate::collectors::queue_wait::QueueWaitCollector;

/// Caller-supplied metadata for a single handler invocation (spec §4.5).
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    /// Handler/endpoint name.
    pub method_name: String,
    /// Session id, used for parent linkage and queue-wait lookup.
    pub session_id: Option<String>,
    /// Authenticated user id.
    pub user_id: Option<String>,
    /// Client address.
    pub client_address: Option<String>,
    /// Raw (unsanitized) handler arguments.
    pub args: Value,
}

/// Wraps request handlers with tracing (spec §4.5): opens a `Context`,
/// resolves parent linkage via the session's `CallStack`, consumes any
/// pending queue-wait sample, runs the handler, and emits the resulting
/// `Trace` to the Egress Client.
#[derive(Debug, Clone)]
pub struct RequestTracer {
    call_stack: CallStack,
    egress: EgressClient,
    config: Arc<AgentConfig>,
    queue_wait: Arc<QueueWaitCollector>,
}

impl RequestTracer {
    /// Build a tracer over the given call stack, egress client, and
    /// (already-validated) agent configuration.
    #[must_use]
    pub fn new(call_stack: CallStack, egress: EgressClient, config: Arc<AgentConfig>, queue_wait: Arc<QueueWaitCollector>) -> Self {
        Self { call_stack, egress, config, queue_wait }
    }

    /// Run `handler` inside a freshly opened `Context`, recording and
    /// emitting its trace. `handler` receives the live `Context` so it (or
    /// collectors it calls into) can record operations against it.
    pub async fn trace<F, Fut, T, E>(&self, meta: RequestMeta, handler: F) -> Result<T, E>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let session_id = meta.session_id.clone();
        let parent = session_id.as_deref().and_then(|s| self.call_stack.peek(s));

        let ctx = Context::start(ContextOptions {
            method_name: meta.method_name.clone(),
            parent: parent.clone(),
            user_id: meta.user_id,
            session_id: session_id.clone(),
            client_address: meta.client_address,
            args: meta.args,
        });

        if let Some(session) = session_id.as_deref() {
            if let Some(sample) = self.queue_wait.take_sample(session) {
                ctx.record_queue_wait(sample.queue_wait, sample.wait_list);
            }
            self.call_stack.push(session, ctx.clone());
        }

        let start = Instant::now();
        let result = ctx.scope(handler(ctx.clone())).await;

        if let Err(ref e) = result {
            ctx.record_error(e.to_string());
        }

        if let Some(session) = session_id.as_deref() {
            self.call_stack.pop(session);
        }

        if let Some(trace) = ctx.emit() {
            if let Some(parent_ctx) = parent {
                parent_ctx.record_operation(Operation::Method {
                    offset: start.elapsed(),
                    name: meta.method_name,
                    child_trace_id: trace.trace_id.clone(),
                    duration: trace.duration,
                });
            }
            self.maybe_emit(trace);
        }

        result
    }

    fn maybe_emit(&self, trace: apm_core::Trace) {
        if !TelemetryKind::Traces.is_sampled() || fastrand::f64() < self.config.trace_sample_rate {
            match serde_json::to_value(&trace) {
                Ok(value) => self.egress.add(TelemetryKind::Traces, value),
                Err(e) => tracing::warn!(error = %e, "failed to serialize trace, dropping"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apm_telemetry::AgentConfig;
    use serde_json::json;

    fn tracer() -> RequestTracer {
        let config = AgentConfig::builder()
            .api_key("test-key")
            .endpoint("http://127.0.0.1:1")
            .trace_sample_rate(1.0)
            .build()
            .unwrap();
        let egress = EgressClient::new(config.clone()).unwrap();
        RequestTracer::new(CallStack::new(), egress, Arc::new(config), Arc::new(QueueWaitCollector::new()))
    }

    #[tokio::test]
    async fn traces_a_simple_successful_handler() {
        let t = tracer();
        let meta = RequestMeta {
            method_name: "users.get".to_string(),
            session_id: Some("s1".to_string()),
            args: json!({"id": 1}),
            ..Default::default()
        };
        let result: Result<u32, String> = t.trace(meta, |_ctx| async { Ok(42) }).await;
        assert_eq!(result, Ok(42));
        assert_eq!(t.egress.queued_len(TelemetryKind::Traces), 1);
    }

    #[tokio::test]
    async fn nested_handler_links_to_parent_via_call_stack() {
        let t = tracer();
        let session = Some("s2".to_string());
        let outer = RequestMeta {
            method_name: "orders.process".to_string(),
            session_id: session.clone(),
            args: json!({}),
            ..Default::default()
        };
        let t2 = t.clone();
        let session2 = session.clone();
        let result: Result<(), String> = t
            .trace(outer, move |_outer_ctx| async move {
                let inner = RequestMeta {
                    method_name: "payments.charge".to_string(),
                    session_id: session2,
                    args: json!({}),
                    ..Default::default()
                };
                t2.trace(inner, |_ctx| async { Ok::<_, String>(()) }).await
            })
            .await;
        assert!(result.is_ok());
        // Both the nested trace and its parent (carrying a Method op) were
        // emitted.
        assert_eq!(t.egress.queued_len(TelemetryKind::Traces), 2);
    }

    #[tokio::test]
    async fn failed_handler_records_error_on_its_trace() {
        let t = tracer();
        let meta = RequestMeta { method_name: "jobs.run".to_string(), args: json!({}), ..Default::default() };
        let result: Result<(), String> = t.trace(meta, |_ctx| async { Err("boom".to_string()) }).await;
        assert!(result.is_err());
        assert_eq!(t.egress.queued_len(TelemetryKind::Traces), 1);
    }
}
