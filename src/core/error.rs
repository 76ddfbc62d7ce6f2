// This module defines error types for the tilegen code generator using the thiserror crate
// for idiomatic Rust error handling. CompileError is the main error enum covering the
// failure classes of lowering: constructs the generator cannot express on the chosen
// target or layout, broken internal invariants (value table misses, double definitions,
// phase ordering mistakes, malformed analysis results), tile IR text that fails to parse,
// and lookups of functions or targets that do not exist. Each variant carries the context
// needed to diagnose the failure. The module also provides CompileResult<T> as a
// convenience alias for Result<T, CompileError>.

//! Error types for the tilegen code generator.
//!
//! Using thiserror for more idiomatic error handling.

use thiserror::Error;

/// Main error type for code generation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// The input uses a construct that has no lowering on this target or layout.
    #[error("Unsupported construct: {construct}")]
    Unsupported { construct: String },

    /// A consistency check inside the generator failed.
    #[error("Internal consistency failure: {reason}")]
    Internal { reason: String },

    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("Function not found: {name}")]
    FunctionNotFound { name: String },

    #[error("Unknown target: {name}")]
    UnknownTarget { name: String },
}

impl CompileError {
    pub fn unsupported(construct: impl Into<String>) -> Self {
        CompileError::Unsupported {
            construct: construct.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        CompileError::Internal {
            reason: reason.into(),
        }
    }

    /// Whether this error reports a missing lowering rather than a bug.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, CompileError::Unsupported { .. })
    }
}

/// Result type alias for compile operations.
pub type CompileResult<T> = Result<T, CompileError>;
