//! Error taxonomy for the test orchestrator (spec §7).
//!
//! `EngineError` consolidates every failure category the core can observe:
//! configuration problems, transport/framing faults, instrument-domain
//! rejections, evaluation failures, and repository faults. The dispatcher
//! converts these into `TestResult`s; only a repository failure that escapes
//! the per-item block (e.g. during finalization) turns the session itself
//! into `Errored`.

use thiserror::Error;

/// Convenience alias for results using the crate's error type.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    // --- Configuration ---
    #[error("configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("instrument '{0}' not found in configuration")]
    InstrumentNotFound(String),

    #[error("bad parameter: {0}")]
    BadParameter(String),

    #[error("schema violation for command '{command}': missing {missing:?}")]
    SchemaViolation {
        command: String,
        missing: Vec<String>,
    },

    // --- Transport ---
    #[error("failed to open transport: {0}")]
    TransportOpenError(String),

    #[error("transport timed out after {0:?}")]
    TransportTimeout(std::time::Duration),

    #[error("frame sync word not found")]
    FrameSyncLost,

    #[error("frame CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    FrameCrcError { expected: u64, actual: u64 },

    #[error("frame truncated: expected {expected} bytes, got {actual}")]
    FrameTruncated { expected: usize, actual: usize },

    #[error("transport closed")]
    TransportClosed,

    #[error("connection handshake failed after {0} attempts")]
    ConnectFailed(u32),

    // --- Instrument domain ---
    #[error("set/read-back mismatch: set {set}, measured {measured}")]
    SetMismatchError { set: f64, measured: f64 },

    #[error("domain error: {0}")]
    DomainError(String),

    // --- Evaluation ---
    #[error("could not parse '{raw}' as {value_type}")]
    ParseError { raw: String, value_type: String },

    // --- Repository ---
    #[error("transient repository error: {0}")]
    RepositoryRetryable(String),

    #[error("fatal repository error: {0}")]
    RepositoryFatal(String),

    // --- Control ---
    #[error("session canceled")]
    Canceled,

    // --- Registry / control surface (spec §6.4) ---
    #[error("session not found")]
    NotFound,

    #[error("session already running")]
    AlreadyRunning,

    #[error("session not running")]
    NotRunning,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether this failure is a transient transport fault eligible for the
    /// dispatcher's single allowed retry (spec §4.D step 5 / §7), and only
    /// when the driver itself is declared retry-safe.
    pub fn is_transient_transport(&self) -> bool {
        matches!(
            self,
            EngineError::FrameCrcError { .. }
                | EngineError::TransportTimeout(_)
                | EngineError::ConnectFailed(_)
        )
    }
}
