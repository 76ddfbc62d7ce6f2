// Layout descriptors. A layout tells the generator how the elements of a tile are spread
// over the threads of a block (distributed layouts) or how they sit in shared memory
// (shared layouts). Scanline layouts give every thread `nts` contiguous elements per
// dimension and tile `mts` threads per dimension; tensor-core (mma) layouts follow the
// fragment shapes of the matrix instructions; shared layouts describe the swizzle
// parameters and the multi-buffering state of a pipelined loop.

//! Layout descriptors consumed by the code generator.

use crate::core::{CompileError, CompileResult};
use crate::tile_ir::{ElemType, ValueId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayoutId(pub u32);

/// Blocked layout: each thread owns `nts[k]` contiguous elements along dimension
/// `k`, and `mts[k]` threads tile that dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanlineLayout {
    pub shape: Vec<u32>,
    /// Dimensions from fastest to slowest varying.
    pub order: Vec<usize>,
    /// Contiguous elements per thread.
    pub nts: Vec<u32>,
    /// Threads per block along each dimension.
    pub mts: Vec<u32>,
}

impl ScanlineLayout {
    /// Elements covered by one pass of all threads along `k`.
    pub fn shape_per_cta(&self, k: usize) -> u32 {
        self.nts[k] * self.mts[k]
    }

    /// Number of elements each thread holds along `k`.
    pub fn per_thread(&self, k: usize) -> u32 {
        let per_cta = self.shape_per_cta(k);
        if self.shape[k] >= per_cta {
            self.nts[k] * (self.shape[k] / per_cta)
        } else {
            self.nts[k]
        }
    }

    /// Distinct thread positions along `k`; fewer than `mts[k]` when the
    /// dimension is replicated.
    pub fn threads_along(&self, k: usize) -> u32 {
        self.mts[k].min((self.shape[k] / self.nts[k]).max(1))
    }

    /// Whether some thread positions hold copies of the same elements.
    pub fn is_replicated(&self) -> bool {
        (0..self.shape.len()).any(|k| self.shape_per_cta(k) > self.shape[k])
    }

    pub fn num_threads(&self) -> u32 {
        self.mts.iter().product()
    }
}

/// Tensor-core fragment layout for rank-2 accumulators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MmaLayout {
    pub shape: [u32; 2],
    /// Warps per tile along each dimension.
    pub wpt: [u32; 2],
    /// Fragments per warp (compute capability < 80 only).
    pub fpw: [u32; 2],
    /// Repetitions per fragment (compute capability < 80 only).
    pub rep: [u32; 2],
}

impl MmaLayout {
    /// Elements covered by one warp along `k`.
    pub fn shape_per_warp(&self, k: usize, compute_capability: u32) -> u32 {
        if compute_capability >= 80 {
            [16, 8][k]
        } else {
            self.fpw[k] * 4 * self.rep[k]
        }
    }

    pub fn shape_per_cta(&self, k: usize, compute_capability: u32) -> u32 {
        self.shape_per_warp(k, compute_capability) * self.wpt[k]
    }

    pub fn num_warps(&self) -> u32 {
        self.wpt[0] * self.wpt[1]
    }
}

/// Multi-buffering state of a shared layout inside a pipelined loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Buffering {
    None,
    /// Two copies toggled by a loop-carried offset.
    Double {
        phi: ValueId,
        first: ValueId,
        latch: ValueId,
    },
    /// `stages` copies addressed through rotating read and write indices.
    Staged {
        phi: ValueId,
        latch: ValueId,
        /// Prologue fills, in stage order.
        firsts: Vec<ValueId>,
        stages: u32,
    },
}

impl Buffering {
    /// Number of copies of the tile held in shared memory.
    pub fn copies(&self) -> u32 {
        match self {
            Buffering::None => 1,
            Buffering::Double { .. } => 2,
            Buffering::Staged { stages, .. } => *stages,
        }
    }

    pub fn phi(&self) -> Option<ValueId> {
        match self {
            Buffering::None => None,
            Buffering::Double { phi, .. } | Buffering::Staged { phi, .. } => Some(*phi),
        }
    }
}

/// Shared-memory layout with XOR swizzling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedLayout {
    pub shape: Vec<u32>,
    pub order: Vec<usize>,
    pub elem: ElemType,
    /// Elements per swizzle chunk.
    pub vec: u32,
    pub per_phase: u32,
    pub max_phase: u32,
    pub buffering: Buffering,
}

impl SharedLayout {
    pub fn elements_per_stage(&self) -> u32 {
        self.shape.iter().product()
    }

    /// Bytes of one copy.
    pub fn stage_bytes(&self) -> u32 {
        self.elements_per_stage() * self.elem.bytes()
    }

    /// Total bytes including every buffer copy.
    pub fn size_bytes(&self) -> u32 {
        self.stage_bytes() * self.buffering.copies()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layout {
    Scanline(ScanlineLayout),
    Mma(MmaLayout),
    Shared(SharedLayout),
}

impl Layout {
    pub fn shape(&self) -> &[u32] {
        match self {
            Layout::Scanline(l) => &l.shape,
            Layout::Mma(l) => &l.shape,
            Layout::Shared(l) => &l.shape,
        }
    }

    pub fn rank(&self) -> usize {
        self.shape().len()
    }

    /// Dimensions from fastest to slowest varying. Mma fragments are row-major.
    pub fn order(&self) -> Vec<usize> {
        match self {
            Layout::Scanline(l) => l.order.clone(),
            Layout::Mma(_) => vec![1, 0],
            Layout::Shared(l) => l.order.clone(),
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, Layout::Shared(_))
    }

    pub fn is_distributed(&self) -> bool {
        !self.is_shared()
    }

    pub fn as_scanline(&self) -> Option<&ScanlineLayout> {
        match self {
            Layout::Scanline(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_shared(&self) -> Option<&SharedLayout> {
        match self {
            Layout::Shared(l) => Some(l),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Layout::Scanline(_) => "scanline",
            Layout::Mma(_) => "mma",
            Layout::Shared(_) => "shared",
        }
    }

    /// Check internal consistency of the descriptor.
    pub fn validate(&self) -> CompileResult<()> {
        let rank = self.rank();
        if rank == 0 {
            return Err(CompileError::internal("layout with empty shape"));
        }
        let mut order = self.order();
        order.sort_unstable();
        if order != (0..rank).collect::<Vec<_>>() {
            return Err(CompileError::internal(format!(
                "layout order {:?} is not a permutation of 0..{rank}",
                self.order()
            )));
        }
        match self {
            Layout::Scanline(l) => {
                if l.nts.len() != rank || l.mts.len() != rank {
                    return Err(CompileError::internal(
                        "scanline nts/mts rank differs from shape",
                    ));
                }
                for k in 0..rank {
                    if l.nts[k] == 0 || l.mts[k] == 0 {
                        return Err(CompileError::internal(format!(
                            "scanline dimension {k} has zero threads or elements"
                        )));
                    }
                    let per_cta = l.shape_per_cta(k);
                    let divisible = if l.shape[k] >= per_cta {
                        l.shape[k] % per_cta == 0
                    } else {
                        l.shape[k] % l.nts[k] == 0
                    };
                    if !divisible {
                        return Err(CompileError::internal(format!(
                            "scanline dimension {k}: shape {} does not tile by nts {} x mts {}",
                            l.shape[k], l.nts[k], l.mts[k]
                        )));
                    }
                }
            }
            Layout::Mma(l) => {
                if l.wpt.contains(&0) || l.fpw.contains(&0) || l.rep.contains(&0) {
                    return Err(CompileError::internal("mma layout with zero factor"));
                }
            }
            Layout::Shared(l) => {
                if l.vec == 0 || !l.vec.is_power_of_two() {
                    return Err(CompileError::internal(format!(
                        "shared vector width {} is not a power of two",
                        l.vec
                    )));
                }
                if l.per_phase == 0 || l.max_phase == 0 {
                    return Err(CompileError::internal("shared swizzle phase of zero"));
                }
                if let Buffering::Staged { firsts, stages, .. } = &l.buffering {
                    if *stages < 3 || firsts.len() + 1 != *stages as usize {
                        return Err(CompileError::internal(format!(
                            "{stages}-stage buffer needs {} prologue values, found {}",
                            stages.saturating_sub(1),
                            firsts.len()
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Scratch tile shape for an N-D reduction along `axis`: the input shape with the
/// reduced dimension replaced by the number of threads along it.
pub fn reduce_scratch_shape(layout: &ScanlineLayout, axis: usize) -> Vec<u32> {
    let mut shape = layout.shape.clone();
    shape[axis] = layout.threads_along(axis);
    shape
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scanline(shape: &[u32], order: &[usize], nts: &[u32], mts: &[u32]) -> ScanlineLayout {
        ScanlineLayout {
            shape: shape.to_vec(),
            order: order.to_vec(),
            nts: nts.to_vec(),
            mts: mts.to_vec(),
        }
    }

    #[test]
    fn test_scanline_elements_per_thread() {
        let l = scanline(&[32, 32], &[1, 0], &[1, 4], &[16, 8]);
        assert_eq!(l.per_thread(0), 2);
        assert_eq!(l.per_thread(1), 4);
        assert_eq!(l.num_threads(), 128);
        assert!(!l.is_replicated());
        assert!(Layout::Scanline(l).validate().is_ok());
    }

    #[test]
    fn test_scanline_replication() {
        let l = scanline(&[16], &[0], &[4], &[128]);
        assert!(l.is_replicated());
        assert_eq!(l.threads_along(0), 4);
        assert_eq!(l.per_thread(0), 4);
        assert_eq!(reduce_scratch_shape(&l, 0), vec![4]);
    }

    #[test]
    fn test_invalid_order_rejected() {
        let l = scanline(&[32, 32], &[1, 1], &[1, 4], &[16, 8]);
        let err = Layout::Scanline(l).validate().unwrap_err();
        assert!(matches!(err, CompileError::Internal { .. }));
    }

    #[test]
    fn test_shared_sizes() {
        let l = SharedLayout {
            shape: vec![32, 32],
            order: vec![1, 0],
            elem: ElemType::F16,
            vec: 8,
            per_phase: 1,
            max_phase: 8,
            buffering: Buffering::Staged {
                phi: ValueId(0),
                latch: ValueId(1),
                firsts: vec![ValueId(2), ValueId(3)],
                stages: 3,
            },
        };
        assert_eq!(l.stage_bytes(), 2048);
        assert_eq!(l.size_bytes(), 6144);
        assert!(Layout::Shared(l).validate().is_ok());
    }

    #[test]
    fn test_mma_shapes() {
        let l = MmaLayout {
            shape: [64, 64],
            wpt: [2, 2],
            fpw: [2, 2],
            rep: [2, 2],
        };
        assert_eq!(l.shape_per_cta(0, 80), 32);
        assert_eq!(l.shape_per_cta(1, 80), 16);
        assert_eq!(l.shape_per_warp(0, 70), 16);
        assert_eq!(Layout::Mma(l).order(), vec![1, 0]);
    }
}
