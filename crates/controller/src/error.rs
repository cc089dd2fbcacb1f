//! Error taxonomy for the controller core
//!
//! Codec and per-frame faults are recovered locally (drop + counter);
//! AR faults surface as registry events; operator-facing operations
//! return these kinds directly so the API layer can map them.

use thiserror::Error;

/// Closed set of error kinds the core can produce. Callers match
/// exhaustively; there are no stringly-typed escape hatches.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Caller contract violation. Never surfaced to operators.
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("capacity exhausted ({0})")]
    Full(usize),

    #[error("allocation failed: {0}")]
    NoMemory(String),

    /// Write past builder capacity or read past the remaining bytes.
    #[error("short buffer: needed {needed} bytes, had {available}")]
    ShortBuffer { needed: usize, available: usize },

    /// A parsed field is implausible under the declared encoding.
    #[error("invalid {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connect timed out after {0} ms")]
    ConnectTimeout(u64),

    #[error("connect rejected: {0}")]
    ConnectRejected(String),

    #[error("parameterization failed: {0}")]
    ParameterizationFailed(String),

    /// Cyclic watchdog expired with no input frame.
    #[error("no input frame for {0} ms")]
    FrameTimeout(u64),

    /// Command submitted while the device AR is not in RUNNING.
    #[error("device {0} is not running")]
    NotRunning(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("not initialized: {0}")]
    NotInitialized(String),

    #[error("interface unavailable: {0}")]
    InterfaceUnavailable(String),

    /// Loss of the bound interface or another unrecoverable fault.
    /// Propagated to the process supervisor, which restarts the core.
    #[error("fatal: {0}")]
    Fatal(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
