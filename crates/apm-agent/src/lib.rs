//! Request tracing, database instrumentation, and the thin collectors that
//! make up the in-process APM agent.
//!
//! This crate sits on top of `apm-core` (the `Trace`/`Context` data model)
//! and `apm-telemetry` (batching and egress), and supplies the actual
//! instrumentation surface a host application wraps its handlers, database
//! collections, and job queue with. [`agent::Agent`] is the single
//! `configure`/`start`/`stop` entry point; everything else in this crate
//! is a piece it wires together.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use apm_agent::{Agent, AgentConfig};
//!
//! let config = AgentConfig::builder().api_key("key").build()?;
//! let agent = Agent::configure(config)?;
//! agent.start();
//!
//! let tracer = agent.tracer().clone();
//! // tracer.trace(meta, |ctx| async move { ... }).await
//!
//! agent.stop();
//! # Ok::<(), apm_agent::AgentError>(())
//! ```

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![allow(clippy::module_name_repetitions)]

pub mod agent;
pub mod collector;
pub mod collectors;
pub mod error;
pub mod tracer;
pub mod wrap;

pub use agent::Agent;
pub use apm_telemetry::AgentConfig;
pub use collector::{Collector, CollectorStats, LifecycleGuard};
pub use error::{AgentError, AgentResult};
pub use tracer::{RequestMeta, RequestTracer};
pub use wrap::{HostSlot, UnblockGuard};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::agent::Agent;
    pub use crate::collector::{Collector, CollectorStats};
    pub use crate::error::{AgentError, AgentResult};
    pub use crate::tracer::{RequestMeta, RequestTracer};
    pub use apm_telemetry::AgentConfig;
    pub use tracing::{debug, error, info, warn};
}
