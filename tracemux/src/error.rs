//! Error types for scheduler operations

use thiserror::Error;
use trace_model::ReaderError;

/// Scheduler error types
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Invalid configuration or option combination
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A live scheduling invariant was violated (e.g. time went backward)
    #[error("invalid scheduler state: {0}")]
    Invalid(String),

    /// Rebalancing could not place an input under any active output
    #[error("impossible binding: input {input} fits no active output")]
    ImpossibleBinding { input: usize },

    /// A recorded schedule did not match the inputs being replayed
    #[error("recorded schedule mismatch: {0}")]
    ReplayMismatch(String),

    /// Reader fault, propagated unchanged
    #[error(transparent)]
    Reader(#[from] ReaderError),

    /// IO error on a schedule archive
    #[error("schedule archive I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for scheduler operations
pub type Result<T> = std::result::Result<T, SchedulerError>;

impl SchedulerError {
    /// Shorthand for an `InvalidParameter` with a formatted message.
    pub fn param(msg: impl Into<String>) -> Self {
        Self::InvalidParameter(msg.into())
    }
}
