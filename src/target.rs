// Hardware targets. The generator never emits thread or block indexing, barriers or fences
// directly; it asks a Target, which knows how its hardware family spells them. NVIDIA
// targets are parameterized by SM version, which also gates async copies (>= 80), the
// rounding bf16 conversion (>= 80) and tensor-core layouts (>= 70). AMD targets share the
// GPU primitives without those features. The host target runs one thread per program:
// block ids arrive as three trailing i32 parameters added to every function signature and
// barriers disappear.

//! Target descriptions.

use crate::core::{CompileError, CompileResult};
use crate::lir::{Builder, Intrinsic, InstId, Ty, Val};

/// Number of implicit block-id parameters appended to host functions.
pub const HOST_GRID_PARAMS: u32 = 3;

pub trait Target {
    fn name(&self) -> String;

    fn is_gpu(&self) -> bool;

    /// SM-style compute capability (e.g. 80); zero when not applicable.
    fn compute_capability(&self) -> u32 {
        0
    }

    /// Linear thread index within the block along `axis`.
    fn thread_id(&self, b: &mut Builder, axis: u8) -> Val;

    /// Block (program) index along `axis`.
    fn block_id(&self, b: &mut Builder, axis: u8) -> CompileResult<Val>;

    /// Number of blocks along `axis`.
    fn num_blocks(&self, b: &mut Builder, axis: u8) -> CompileResult<Val>;

    /// Block-wide barrier; `None` when the target needs none.
    fn barrier(&self, b: &mut Builder) -> Option<InstId>;

    fn memory_fence(&self, b: &mut Builder);

    fn supports_async_copy(&self) -> bool {
        self.compute_capability() >= 80
    }

    fn supports_bf16_rounding(&self) -> bool {
        self.compute_capability() >= 80
    }

    fn supports_mma(&self) -> bool {
        self.compute_capability() >= 70
    }
}

fn check_axis(axis: u8) -> CompileResult<()> {
    if axis < 3 {
        Ok(())
    } else {
        Err(CompileError::unsupported(format!("grid axis {axis}")))
    }
}

fn gpu_barrier(b: &mut Builder) -> Option<InstId> {
    b.call(Intrinsic::Barrier, vec![], Ty::Void).as_inst()
}

/// NVIDIA GPU of a given SM version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NvidiaTarget {
    pub sm: u32,
}

impl NvidiaTarget {
    pub fn new(sm: u32) -> Self {
        Self { sm }
    }
}

impl Target for NvidiaTarget {
    fn name(&self) -> String {
        format!("sm_{}", self.sm)
    }

    fn is_gpu(&self) -> bool {
        true
    }

    fn compute_capability(&self) -> u32 {
        self.sm
    }

    fn thread_id(&self, b: &mut Builder, axis: u8) -> Val {
        b.call(Intrinsic::ThreadIdx(axis), vec![], Ty::I32)
    }

    fn block_id(&self, b: &mut Builder, axis: u8) -> CompileResult<Val> {
        check_axis(axis)?;
        Ok(b.call(Intrinsic::BlockIdx(axis), vec![], Ty::I32))
    }

    fn num_blocks(&self, b: &mut Builder, axis: u8) -> CompileResult<Val> {
        check_axis(axis)?;
        Ok(b.call(Intrinsic::NumBlocks(axis), vec![], Ty::I32))
    }

    fn barrier(&self, b: &mut Builder) -> Option<InstId> {
        gpu_barrier(b)
    }

    fn memory_fence(&self, b: &mut Builder) {
        b.call(Intrinsic::MemFence, vec![], Ty::Void);
    }
}

/// AMD GPU; no async copies or tensor-core layouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmdTarget {
    pub arch: String,
}

impl AmdTarget {
    pub fn new(arch: impl Into<String>) -> Self {
        Self { arch: arch.into() }
    }
}

impl Target for AmdTarget {
    fn name(&self) -> String {
        self.arch.clone()
    }

    fn is_gpu(&self) -> bool {
        true
    }

    fn thread_id(&self, b: &mut Builder, axis: u8) -> Val {
        b.call(Intrinsic::ThreadIdx(axis), vec![], Ty::I32)
    }

    fn block_id(&self, b: &mut Builder, axis: u8) -> CompileResult<Val> {
        check_axis(axis)?;
        Ok(b.call(Intrinsic::BlockIdx(axis), vec![], Ty::I32))
    }

    fn num_blocks(&self, b: &mut Builder, axis: u8) -> CompileResult<Val> {
        check_axis(axis)?;
        Ok(b.call(Intrinsic::NumBlocks(axis), vec![], Ty::I32))
    }

    fn barrier(&self, b: &mut Builder) -> Option<InstId> {
        gpu_barrier(b)
    }

    fn memory_fence(&self, b: &mut Builder) {
        b.call(Intrinsic::MemFence, vec![], Ty::Void);
    }
}

/// Host CPU: one thread per program, grid position passed as parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HostTarget;

impl Target for HostTarget {
    fn name(&self) -> String {
        "host".to_string()
    }

    fn is_gpu(&self) -> bool {
        false
    }

    fn thread_id(&self, b: &mut Builder, _axis: u8) -> Val {
        b.i32(0)
    }

    fn block_id(&self, b: &mut Builder, axis: u8) -> CompileResult<Val> {
        check_axis(axis)?;
        let params = b.func().params.len() as u32;
        if params < HOST_GRID_PARAMS {
            return Err(CompileError::internal(
                "host function lacks its block id parameters",
            ));
        }
        Ok(Val::Param(params - HOST_GRID_PARAMS + axis as u32))
    }

    fn num_blocks(&self, _b: &mut Builder, axis: u8) -> CompileResult<Val> {
        Err(CompileError::unsupported(format!(
            "num_programs({axis}) on the host target"
        )))
    }

    fn barrier(&self, _b: &mut Builder) -> Option<InstId> {
        None
    }

    fn memory_fence(&self, _b: &mut Builder) {}
}

/// Resolve a target by name: `sm70`, `sm_80`, `gfx90a`, `host`.
pub fn target_from_name(name: &str) -> CompileResult<Box<dyn Target>> {
    let lower = name.trim().to_ascii_lowercase();
    if lower == "host" || lower == "cpu" {
        return Ok(Box::new(HostTarget));
    }
    if let Some(version) = lower.strip_prefix("sm_").or_else(|| lower.strip_prefix("sm")) {
        if let Ok(sm) = version.parse::<u32>() {
            return Ok(Box::new(NvidiaTarget::new(sm)));
        }
    }
    if lower.starts_with("gfx") {
        return Ok(Box::new(AmdTarget::new(lower)));
    }
    Err(CompileError::UnknownTarget {
        name: name.to_string(),
    })
}
