//! Error types for the migration engine and receiver.

use thiserror::Error;
use tracing::error;

/// Failure modes for the sender and receiver, per the propagation policy:
/// any nonzero result terminates the migration session.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The transport reported an I/O error (propagated verbatim).
    #[error("transport I/O error: {0}")]
    Transport(String),

    /// A read from the local block device failed.
    #[error("block read failed on device {device}: {source}")]
    BlockRead {
        device: String,
        #[source]
        source: anyhow::Error,
    },

    /// A write to a local block device failed (receiver side).
    #[error("block write failed on device {device}: {source}")]
    BlockWrite {
        device: String,
        #[source]
        source: anyhow::Error,
    },

    /// The receiver saw a device-block frame naming a device it cannot find.
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    /// The receiver saw a header with no recognized flag set, or a frame
    /// whose shape otherwise violates the wire format.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A lifecycle hook was called while the engine had no registered
    /// devices (or before `setup`).
    #[error("migration engine is not active")]
    NotActive,

    /// An internal invariant (spec.md §3 EngineState invariants) was
    /// violated; this indicates a bug in the caller's use of the lifecycle
    /// hooks (e.g. calling `complete` with reads still in flight).
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}

impl MigrationError {
    /// Build a `Transport` error, logging it at `error` level before it is
    /// returned (spec.md §7: "propagated collaborator errors at `error`
    /// before the error is returned").
    pub(crate) fn transport(e: anyhow::Error) -> Self {
        error!("transport I/O error: {e}");
        Self::Transport(e.to_string())
    }

    /// Build a `BlockRead` error, logging it first.
    pub(crate) fn block_read(device: impl Into<String>, source: anyhow::Error) -> Self {
        let device = device.into();
        error!(device = device.as_str(), "block read failed: {source}");
        Self::BlockRead { device, source }
    }

    /// Build a `BlockWrite` error, logging it first.
    pub(crate) fn block_write(device: impl Into<String>, source: anyhow::Error) -> Self {
        let device = device.into();
        error!(device = device.as_str(), "block write failed: {source}");
        Self::BlockWrite { device, source }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MigrationError>;
