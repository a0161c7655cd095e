//! Telemetry error types (spec §7: configuration errors fail fast and
//! surface to the caller; everything past `configure()` is swallowed and
//! logged so telemetry never degrades host correctness).

use thiserror::Error;

/// Errors that can occur while configuring or operating the egress client.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// A configuration value was out of its valid range or unrecognized.
    /// Surfaced to the caller of `configure()`; never produced afterward.
    #[error("invalid telemetry configuration: {0}")]
    InvalidConfiguration(String),

    /// The batch payload could not be serialized to JSON (a cycle past
    /// the guard, or a value outside what `serde_json` can represent).
    #[error("failed to serialize batch for kind {kind}: {source}")]
    Serialization {
        /// Telemetry kind whose batch failed to serialize.
        kind: String,
        /// Underlying serde error.
        #[source]
        source: serde_json::Error,
    },

    /// The egress HTTP send failed (network error, timeout, or non-202
    /// response) after exhausting retries.
    #[error("send failed for kind {kind} after {attempts} attempt(s): {reason}")]
    SendFailed {
        /// Telemetry kind whose batch failed to send.
        kind: String,
        /// Attempts made before giving up.
        attempts: u32,
        /// Human-readable failure reason.
        reason: String,
    },
}

/// Result type for telemetry operations.
pub type TelemetryResult<T> = Result<T, TelemetryError>;
