//! Error taxonomy for the replication engine.
//!
//! Every error surfaced anywhere in the pipeline collapses into one of the
//! categories below. The category, not the Rust type, is what downstream
//! code (retry, DLQ routing, quarantine, health reporting) dispatches on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

/// The outcome categories a sink call, a parse attempt, or a schema-change
/// application can produce.
#[derive(Error, Debug, Clone)]
pub enum CdcError {
    /// A commit-log frame could not be decoded. Not fatal: the reader skips
    /// past it and keeps going.
    #[error("parse skip at {file}:{position}: {reason}")]
    ParseSkip { file: String, position: u64, reason: String },

    /// A sink call failed in a way that is expected to succeed on retry
    /// (timeout, broken connection, lock contention, too-many-connections,
    /// write conflict). Retried with backoff up to `retry.maxAttempts`.
    #[error("transient error: {0}")]
    Transient(String),

    /// A sink call or validation failed in a way retrying cannot fix.
    /// Routed to the DLQ without retry.
    #[error("terminal error: {0}")]
    Terminal(String),

    /// Subclass of `Terminal`: the event's schema is incompatible with a
    /// destination, naming the offending column and reason.
    #[error("schema incompatible: column {column}: {reason}")]
    SchemaIncompatible { column: String, reason: String },

    /// DDL application failed for a (destination, table) pair. Latches
    /// that pair until an operator clears it; surfaces as `degraded` on
    /// the health endpoint rather than halting the pipeline.
    #[error("quarantined: destination={destination} table={table}: {reason}")]
    Quarantine { destination: String, table: String, reason: String },

    /// The DLQ write failed, or the offset store became unreachable. The
    /// pipeline halts rather than risk violating the DLQ-or-committed
    /// invariant.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("configuration invalid: {0}")]
    Configuration(String),

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for CdcError {
    fn from(e: std::io::Error) -> Self {
        CdcError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for CdcError {
    fn from(e: serde_json::Error) -> Self {
        CdcError::Terminal(format!("serialization error: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, CdcError>;

/// Maps a category onto the error-class family used by the retry loop
/// (§7: Transient-unknown errors default to Transient up to the cap, then
/// convert to Terminal).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Terminal,
}

impl CdcError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CdcError::Transient(_) => ErrorClass::Transient,
            CdcError::Terminal(_)
            | CdcError::SchemaIncompatible { .. }
            | CdcError::Quarantine { .. }
            | CdcError::Fatal(_)
            | CdcError::Configuration(_)
            | CdcError::ParseSkip { .. }
            | CdcError::Io(_) => ErrorClass::Terminal,
        }
    }

    /// A short machine-stable name used as the `error_category` label on
    /// metrics and the DLQ record.
    pub fn category(&self) -> &'static str {
        match self {
            CdcError::ParseSkip { .. } => "ParseSkip",
            CdcError::Transient(_) => "Transient",
            CdcError::Terminal(_) => "Terminal",
            CdcError::SchemaIncompatible { .. } => "SchemaIncompatible",
            CdcError::Quarantine { .. } => "Quarantine",
            CdcError::Fatal(_) => "Fatal",
            CdcError::Configuration(_) => "Configuration",
            CdcError::Io(_) => "Io",
        }
    }
}

/// A process-wide latch tripped when a `Fatal` condition occurs (the DLQ
/// write failed, or the offset store became unreachable). `main.rs` polls
/// this to map the halt onto the non-zero exit code §6 reserves for it,
/// rather than threading a `Result` back out of every worker task.
#[derive(Clone, Default)]
pub struct FatalSignal(Arc<AtomicBool>);

impl FatalSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trip(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn tripped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
