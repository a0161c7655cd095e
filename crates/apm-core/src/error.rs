//! Error types shared by the data model, context propagation, and
//! sanitization layers.
//!
//! Errors here never represent a failure that should interrupt the host
//! request path (see spec §7, "errors in telemetry never degrade host
//! correctness"). They exist so callers inside `apm-agent` can log and
//! discard rather than `unwrap`.

use thiserror::Error;

/// Errors produced by `apm-core` primitives.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A value could not be serialized while building a `Trace`/`Operation`
    /// payload (e.g. a non-finite float, or a cycle past the cycle guard).
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The call stack's maximum depth was exceeded; the oldest entry was
    /// dropped rather than this being fatal, but callers may want to know.
    #[error("call stack depth {depth} exceeded bound {bound}, dropped oldest entry")]
    CallStackOverflow {
        /// Depth after the push that triggered eviction.
        depth: usize,
        /// Configured maximum depth.
        bound: usize,
    },

    /// Attempted to read or mutate a `Trace` that has already been emitted
    /// and is therefore immutable (spec §3 invariant).
    #[error("trace {trace_id} has already been emitted and is immutable")]
    TraceAlreadyEmitted {
        /// The trace id that was touched after emission.
        trace_id: String,
    },
}

/// Crate-local result alias.
pub type CoreResult<T> = Result<T, CoreError>;
