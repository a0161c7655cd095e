//! Data model, context propagation, and sanitization primitives shared by
//! the APM agent's collectors and egress client.
//!
//! This crate has no knowledge of HTTP, batching, or any collector — it
//! defines the `Trace`/`Operation` shape a request's telemetry takes, the
//! task-local `Context` used to build one up while a request is in
//! flight, and the sanitization/size-estimation helpers every collector
//! shares.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![allow(clippy::module_name_repetitions)]

pub mod context;
pub mod error;
pub mod sanitize;
pub mod size;
pub mod trace;

pub use context::{CallStack, Context, ContextOptions};
pub use error::{CoreError, CoreResult};
pub use trace::{
    Clock, DbOperationDetail, DbOperationKind, FingerprintStats, IndexUsage, LikelyIssue,
    N1Pattern, Operation, Severity, SlowQueryAnalysis, SlowQueryEntry, Trace, UnblockAnalysis,
    UnblockRecommendation, WaitTimes,
};
