// Shared memory allocation. The generator addresses every shared buffer as a byte offset
// into one arena; AllocationQuery exposes those offsets and the total arena size. The bump
// planner below gives each shared layout (all of its buffer copies) and each value that
// needs scratch space (reductions, register-to-register layout conversions, scalar atomics)
// its own 16-byte aligned region. It does not reuse memory between values whose lifetimes
// do not overlap.

use super::layout::{reduce_scratch_shape, Layout, LayoutId};
use super::LayoutQuery;
use crate::core::{CompileError, CompileResult};
use crate::tile_ir::{Inst, Module, ScalarType, ValueId, ValueKind};
use hashbrown::HashMap;

const REGION_ALIGN: u32 = 16;

/// Owner of a shared memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocKey {
    Layout(LayoutId),
    Scratch(ValueId),
}

pub trait AllocationQuery {
    /// Byte offset of the region owned by `key`.
    fn offset(&self, key: AllocKey) -> Option<u32>;

    /// Total size of the shared memory arena in bytes.
    fn allocated_size(&self) -> u32;
}

#[derive(Debug, Clone, Default)]
pub struct Allocation {
    offsets: HashMap<AllocKey, u32>,
    size: u32,
}

impl Allocation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `bytes` at the end of the arena for `key`.
    pub fn reserve(&mut self, key: AllocKey, bytes: u32) -> u32 {
        if let Some(&offset) = self.offsets.get(&key) {
            return offset;
        }
        let offset = self.size.next_multiple_of(REGION_ALIGN);
        self.offsets.insert(key, offset);
        self.size = offset + bytes;
        offset
    }

    /// Plan regions for every shared layout and scratch user of `module`.
    pub fn plan(module: &Module, layouts: &dyn LayoutQuery) -> CompileResult<Self> {
        let mut alloc = Allocation::new();

        for id in layouts.layout_ids() {
            if let Layout::Shared(shared) = layouts.layout(id) {
                alloc.reserve(AllocKey::Layout(id), shared.size_bytes());
            }
        }

        for (_, func) in module.functions() {
            for &block in &func.blocks {
                for &v in &module.block(block).insts {
                    if let Some(bytes) = scratch_bytes(module, layouts, v)? {
                        alloc.reserve(AllocKey::Scratch(v), bytes);
                    }
                }
            }
        }

        log::debug!(
            "planned {} shared regions, {} bytes",
            alloc.offsets.len(),
            alloc.size
        );
        Ok(alloc)
    }
}

impl AllocationQuery for Allocation {
    fn offset(&self, key: AllocKey) -> Option<u32> {
        self.offsets.get(&key).copied()
    }

    fn allocated_size(&self) -> u32 {
        self.size
    }
}

fn scalar_bytes(scalar: ScalarType) -> u32 {
    match scalar {
        ScalarType::Void => 0,
        ScalarType::Elem(e) => e.bytes(),
        ScalarType::Ptr(..) => 8,
    }
}

/// Scratch bytes needed to lower `v`, if any.
fn scratch_bytes(
    module: &Module,
    layouts: &dyn LayoutQuery,
    v: ValueId,
) -> CompileResult<Option<u32>> {
    let value = module.value(v);
    let ValueKind::Inst(inst) = &value.kind else {
        return Ok(None);
    };
    let bytes = scalar_bytes(value.ty.scalar);
    match inst {
        Inst::Reduce { arg, axis, .. } => {
            let arg_ty = &module.value(*arg).ty;
            if arg_ty.rank() == 1 {
                return Ok(Some(32 * bytes));
            }
            let layout = layouts.layout_of(*arg).map(|id| layouts.layout(id));
            match layout {
                Some(Layout::Scanline(l)) => {
                    let axis = *axis as usize;
                    if axis >= l.shape.len() {
                        return Err(CompileError::internal(format!(
                            "reduction axis {axis} out of range for rank {}",
                            l.shape.len()
                        )));
                    }
                    let elems: u32 = reduce_scratch_shape(l, axis).iter().product();
                    Ok(Some(elems * bytes))
                }
                _ => Ok(None),
            }
        }
        Inst::ConvertLayout { arg } => {
            let src = layouts.layout_of(*arg).map(|id| layouts.layout(id));
            let dst = layouts.layout_of(v).map(|id| layouts.layout(id));
            match (src, dst) {
                (Some(s), Some(d)) if s.is_distributed() && d.is_distributed() => {
                    Ok(Some(value.ty.num_elements() as u32 * bytes))
                }
                _ => Ok(None),
            }
        }
        Inst::AtomicCas { .. } | Inst::AtomicRmw { .. } if !value.ty.is_block() => {
            Ok(Some(bytes))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_aligns_regions() {
        let mut alloc = Allocation::new();
        let a = alloc.reserve(AllocKey::Scratch(ValueId(0)), 4);
        let b = alloc.reserve(AllocKey::Scratch(ValueId(1)), 128);
        let again = alloc.reserve(AllocKey::Scratch(ValueId(0)), 4);
        assert_eq!(a, 0);
        assert_eq!(b, 16);
        assert_eq!(again, 0);
        assert_eq!(alloc.allocated_size(), 144);
        assert_eq!(alloc.offset(AllocKey::Scratch(ValueId(1))), Some(16));
        assert_eq!(alloc.offset(AllocKey::Layout(LayoutId(0))), None);
    }
}
