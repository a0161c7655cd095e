//! Batching, retry, and egress-HTTP client for the APM agent.
//!
//! Producers call [`EgressClient::add`] with a telemetry kind and an
//! already-sanitized `serde_json::Value`; the client handles per-kind
//! batching, size-budget enforcement, periodic flush, gzip compression,
//! and retry-with-backoff. Nothing in this crate knows how a `Trace` or
//! collector works — that's `apm-core` and `apm-agent`'s job.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use apm_telemetry::{AgentConfig, EgressClient, TelemetryKind};
//!
//! let config = AgentConfig::builder().api_key("key").build()?;
//! let client = EgressClient::new(config)?;
//! client.start();
//! client.add(TelemetryKind::Logs, serde_json::json!({"line": "hello"}));
//! client.stop();
//! # Ok::<(), apm_telemetry::TelemetryError>(())
//! ```

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]
#![allow(clippy::module_name_repetitions)]

pub mod batch;
pub mod client;
pub mod config;
pub mod error;
pub mod kinds;
pub mod retry;
pub mod stats;

pub use client::EgressClient;
pub use config::{AgentConfig, AgentConfigBuilder, CollectorIntervals, CollectorToggles, ExplainVerbosity};
pub use error::{TelemetryError, TelemetryResult};
pub use kinds::TelemetryKind;
pub use stats::{Stats, StatsSnapshot};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use super::client::EgressClient;
    pub use super::config::{AgentConfig, AgentConfigBuilder};
    pub use super::error::{TelemetryError, TelemetryResult};
    pub use super::kinds::TelemetryKind;
    pub use tracing::{debug, error, info, warn};
}
