// This module gathers the infrastructure shared by every stage of tilegen: the arena-backed
// compilation session (coordinate storage and statistics), the error type
// used across parsing, analysis and lowering, and the code generation configuration read
// from the environment or the command line.

//! Core tilegen infrastructure.
//!
//! # Key Components
//!
//! ## Session Management (`session`)
//! - Arena-based allocation of coordinate tuples using `bumpalo`
//! - Compilation statistics
//!
//! ## Errors (`error`)
//! - `CompileError` with unsupported, internal and parse variants
//!
//! ## Configuration (`config`)
//! - Warps per block, async copy and verification toggles

pub mod config;
pub mod error;
pub mod session;
pub mod test_utils;

pub use config::CodegenConfig;
pub use error::{CompileError, CompileResult};
pub use session::{CompilationSession, SessionStats};
