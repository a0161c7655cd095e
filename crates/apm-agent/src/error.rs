//! Agent-level error types (spec §7).
//!
//! Configuration errors are the only variant that can surface to a host
//! caller — everything else is logged and swallowed inside the
//! collectors that produce it (instrumentation bookkeeping must never
//! affect the wrapped host function's own return value).

use thiserror::Error;

/// Errors surfaced by [`crate::agent::Agent::configure`] and friends.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Configuration failed validation; propagated from `apm-telemetry`.
    #[error(transparent)]
    Telemetry(#[from] apm_telemetry::TelemetryError),

    /// A required host package/adapter was unavailable. Collectors guard
    /// on this and remain inert rather than failing `configure`.
    #[error("host package '{0}' is not available")]
    HostPackageUnavailable(String),
}

/// Crate-local result alias.
pub type AgentResult<T> = Result<T, AgentError>;
