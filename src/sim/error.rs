//! Errors raised while executing low-level IR.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SimError {
    #[error("thread {thread} read %{inst} before it was defined")]
    UseBeforeDef { inst: u32, thread: u32 },

    #[error("access of {len} bytes at {address:#x} is outside every allocation")]
    OutOfBounds { address: u64, len: usize },

    /// No thread can make progress.
    #[error("deadlock: {reason}")]
    Deadlock { reason: String },

    #[error("phi in block '{block}' has no incoming value from '{from}'")]
    MissingIncoming { block: String, from: String },

    #[error("undefined behavior: {reason}")]
    UndefinedBehavior { reason: String },

    #[error("thread {thread} exceeded {limit} steps")]
    StepLimit { thread: u32, limit: u64 },

    #[error("cannot simulate {what}")]
    Unsupported { what: String },
}

impl SimError {
    pub fn ub(reason: impl Into<String>) -> Self {
        SimError::UndefinedBehavior {
            reason: reason.into(),
        }
    }

    pub fn unsupported(what: impl Into<String>) -> Self {
        SimError::Unsupported { what: what.into() }
    }
}

pub type SimResult<T> = Result<T, SimError>;
