//! tilegen - layout-aware lowering of tile IR to GPU low-level IR.
//!
//! A tile IR function computes on whole multi-dimensional tiles. Each tile
//! value carries a layout saying which thread owns which element: scanline
//! and tensor-core (`mma`) layouts distribute elements over registers, shared
//! layouts place them in swizzled shared memory. tilegen scalarizes every
//! tile into per-thread values and emits the index arithmetic, predicated
//! memory transactions, barriers and warp shuffles needed to execute it.
//!
//! # Primary Usage
//!
//! ```ignore
//! use tilegen::{compile, parse_module, target_from_name, CodegenConfig};
//!
//! let parsed = parse_module(&text)?;
//! let target = target_from_name("sm80")?;
//! let out = compile(&parsed, target.as_ref(), &CodegenConfig::from_env())?;
//! println!("{}", out.module);
//! ```
//!
//! # Architecture
//!
//! - [`tile_ir`] - input IR, its text parser and the FileCheck test runner
//! - [`analysis`] - layout descriptors and the shared memory allocation plan
//! - [`target`] - NVIDIA, AMD and host target hooks
//! - [`lir`] - produced low-level IR with builder, printer and verifier
//! - [`codegen`] - the generator itself
//! - [`sim`] - reference interpreter for generated kernels
//! - [`core`] - session, errors and configuration

pub mod analysis;
pub mod codegen;
pub mod core;
pub mod lir;
pub mod sim;
pub mod target;
pub mod tile_ir;

pub use codegen::{compile, compile_module, Compilation};
pub use core::{CodegenConfig, CompilationSession, CompileError, CompileResult, SessionStats};
pub use sim::Simulator;
pub use target::{target_from_name, Target};
pub use tile_ir::{parse_module, ParsedModule};
