//! Moves between layouts: register redistribution through scratch memory,
//! copies into and out of swizzled shared tiles, asynchronous global to
//! shared copies, and the shared-operand dot product.

use super::values::{lir_scalar, scalar_of};
use super::{Coord, FunctionCodegen};
use crate::analysis::{LayoutId, SharedLayout};
use crate::core::{CompileError, CompileResult};
use crate::lir::{BinOp, CacheHint, CastOp, Intrinsic, Scalar, Ty, Val};
use crate::tile_ir::ValueId;

impl<'a, 'arena> FunctionCodegen<'a, 'arena> {
    pub(super) fn emit_convert_layout(&mut self, v: ValueId, arg: ValueId) -> CompileResult<()> {
        let layouts = self.layouts;
        let out_shared = layouts.layout(self.require_layout(v)?).is_shared();
        let in_shared = layouts.layout(self.require_layout(arg)?).is_shared();
        match (in_shared, out_shared) {
            (false, true) => self.copy_to_shared(v, arg),
            (true, false) => self.copy_from_shared(v, arg),
            (true, true) => Err(CompileError::unsupported(
                "layout conversion between shared layouts",
            )),
            (false, false) if self.target.is_gpu() => self.convert_distributed(v, arg),
            (false, false) => {
                // a single thread owns every element under both layouts
                for &c in self.coords(v)? {
                    let x = self.get(arg, c)?;
                    self.define(v, c, x)?;
                }
                Ok(())
            }
        }
    }

    /// Redistribute registers through a dense scratch tile laid out in the
    /// destination's order.
    fn convert_distributed(&mut self, v: ValueId, arg: ValueId) -> CompileResult<()> {
        let layouts = self.layouts;
        let out = layouts.layout(self.require_layout(v)?);
        let rank = out.rank();
        if rank > 2 {
            return Err(CompileError::unsupported(format!(
                "rank-{rank} register layout conversion"
            )));
        }
        let order = out.order();
        let leading = out.shape()[order[0]] as i32;
        let scalar = scalar_of(self.module.value(v).ty.scalar)?;
        let base = self.scratch_base(v)?;
        let offset = |cg: &mut Self, c: Coord<'arena>| -> Val {
            if rank == 1 {
                c[0]
            } else {
                let slow = cg.b.mul_i32(c[order[1]], leading);
                cg.b.add(c[order[0]], slow)
            }
        };

        for &c in self.coords(arg)? {
            let x = self.get(arg, c)?;
            let off = offset(self, c);
            let ptr = self.b.gep(scalar, base, off);
            self.b.store(ptr, x);
        }
        self.barrier();
        for &c in self.coords(v)? {
            let off = offset(self, c);
            let ptr = self.b.gep(scalar, base, off);
            let x = self.b.load(Ty::Scalar(scalar), ptr);
            self.define(v, c, x)?;
        }
        self.barrier();
        Ok(())
    }

    /// Pointer to the current copy of the shared tile `v`.
    fn shared_ptr(&self, v: ValueId) -> CompileResult<Val> {
        self.shmems.get(&v).copied().ok_or_else(|| {
            CompileError::internal(format!(
                "%{} has no shared memory pointer",
                self.module.value(v).name
            ))
        })
    }

    fn shared_layout(&self, v: ValueId) -> CompileResult<(LayoutId, &'a SharedLayout)> {
        let layouts = self.layouts;
        let id = self.require_layout(v)?;
        let l = layouts.layout(id).as_shared().ok_or_else(|| {
            CompileError::internal(format!(
                "%{} is not in shared memory",
                self.module.value(v).name
            ))
        })?;
        Ok((id, l))
    }

    /// Elements moved per shared memory access when `src` is written into a
    /// tile with layout `dst`.
    fn shared_group_width(&self, src: ValueId, dst: &SharedLayout) -> usize {
        let layouts = self.layouts;
        let in_vec = match self.layout_id(src).and_then(|id| layouts.layout(id).as_scanline()) {
            Some(l) if l.order == dst.order => l.nts[l.order[0]],
            _ => 1,
        };
        in_vec.min(dst.vec).max(1) as usize
    }

    /// Element offset of `c` within one copy of the swizzled tile `id`.
    /// Computed once per coordinate, in the entry block.
    pub(super) fn swizzle(&mut self, id: LayoutId, c: Coord<'arena>) -> CompileResult<Val> {
        if let Some(&off) = self.swizzled.get(&(id, c)) {
            return Ok(off);
        }
        let layouts = self.layouts;
        let l = layouts.layout(id).as_shared().ok_or_else(|| {
            CompileError::internal(format!("layout {} is not shared", id.0))
        })?;
        let rank = l.shape.len();
        if rank > 3 {
            return Err(CompileError::unsupported(format!("rank-{rank} shared tile")));
        }
        let cursor = self.entry_cursor()?;
        self.b.push_cursor(cursor);
        let off = if rank == 1 {
            c[0]
        } else {
            let (fast, slow) = (l.order[0], l.order[1]);
            let vec = l.vec.max(1) as i32;
            let per_phase = self.b.i32(l.per_phase.max(1) as i32);
            let phases = self.b.i32(swizzle_phases(l) as i32);
            let phase = self.b.udiv(c[slow], per_phase);
            let phase = self.b.urem(phase, phases);
            let width = self.b.i32(vec);
            let chunk = self.b.udiv(c[fast], width);
            let within = self.b.urem(c[fast], width);
            let chunk = self.b.xor(chunk, phase);
            let chunk = self.b.mul_i32(chunk, vec);
            let fast_off = self.b.add(chunk, within);
            let slow_off = self.b.mul_i32(c[slow], l.shape[fast] as i32);
            let mut off = self.b.add(fast_off, slow_off);
            if rank == 3 {
                let plane = (l.shape[fast] * l.shape[slow]) as i32;
                let outer = self.b.mul_i32(c[l.order[2]], plane);
                off = self.b.add(off, outer);
            }
            off
        };
        self.b.pop_cursor()?;
        self.swizzled.insert((id, c), off);
        Ok(off)
    }

    /// Store `values` (one per coordinate of `coords`) into the shared tile
    /// `dst`, `vec` consecutive elements per store.
    fn store_shared(
        &mut self,
        dst: ValueId,
        coords: &[Coord<'arena>],
        values: &[Val],
        vec: usize,
    ) -> CompileResult<()> {
        let (id, l) = self.shared_layout(dst)?;
        let scalar = lir_scalar(l.elem);
        let base = self.shared_ptr(dst)?;
        for (group, lanes) in coords.chunks(vec).zip(values.chunks(vec)) {
            let off = self.swizzle(id, group[0])?;
            let ptr = self.b.gep(scalar, base, off);
            let packed = self.b.pack(lanes);
            self.b.store(ptr, packed);
        }
        Ok(())
    }

    pub(super) fn copy_to_shared(&mut self, v: ValueId, arg: ValueId) -> CompileResult<()> {
        let (_, l) = self.shared_layout(v)?;
        let vec = self.shared_group_width(arg, l);
        let coords = self.coords(arg)?;
        let mut values = Vec::with_capacity(coords.len());
        for &c in coords {
            values.push(self.get(arg, c)?);
        }
        self.store_shared(v, coords, &values, vec)
    }

    pub(super) fn copy_from_shared(&mut self, v: ValueId, arg: ValueId) -> CompileResult<()> {
        let (id, l) = self.shared_layout(arg)?;
        let ty = Ty::Scalar(lir_scalar(l.elem));
        let base = self.shared_ptr(arg)?;
        for &c in self.coords(v)? {
            let off = self.swizzle(id, c)?;
            let ptr = self.b.gep(lir_scalar(l.elem), base, off);
            let x = self.b.load(ty, ptr);
            self.define(v, c, x)?;
        }
        Ok(())
    }

    pub(super) fn emit_load_async(
        &mut self,
        v: ValueId,
        ptr: ValueId,
        mask: Option<ValueId>,
        other: Option<ValueId>,
    ) -> CompileResult<()> {
        let (id, l) = self.shared_layout(v)?;
        let scalar = lir_scalar(l.elem);
        let vec = self.shared_group_width(ptr, l).min(self.vector_width(ptr));
        let bytes = vec as u32 * l.elem.bytes();
        let zero_fill = other.map_or(true, |o| self.is_zero_fill(o) || self.is_undef(o));
        let coords = self.coords(ptr)?;

        let async_copy = self.target.supports_async_copy() && self.config.async_copy;
        if !(async_copy && matches!(bytes, 4 | 8 | 16) && zero_fill) {
            let values =
                self.lower_global_load(ptr, coords, scalar, mask, other, CacheHint::None, vec)?;
            return self.store_shared(v, coords, &values, vec);
        }

        let base = self.shared_ptr(v)?;
        let cache = if bytes == 16 {
            CacheHint::Cg
        } else {
            CacheHint::Ca
        };
        for group in coords.chunks(vec) {
            let c0 = group[0];
            let src = self.get(ptr, c0)?;
            let (src, src_offset) = self.b.split_const_offset(src);
            let off = self.swizzle(id, c0)?;
            let dst = self.b.gep(scalar, base, off);
            let (dst, dst_offset) = self.b.split_const_offset(dst);
            let full = self.b.i32(bytes as i32);
            let src_size = match mask {
                Some(m) => {
                    let pred = self.get(m, c0)?;
                    let none = self.b.i32(0);
                    self.b.select(pred, full, none)
                }
                None => full,
            };
            self.b.call(
                Intrinsic::CpAsync {
                    bytes,
                    dst_offset,
                    src_offset,
                    cache,
                },
                vec![dst, src, src_size],
                Ty::Void,
            );
        }
        self.b.call(Intrinsic::CpAsyncCommitGroup, Vec::new(), Ty::Void);
        Ok(())
    }

    /// `acc + a x b` with both operands read from shared memory, unrolled over
    /// the inner dimension.
    pub(super) fn emit_dot(&mut self, v: ValueId, a: ValueId, b: ValueId, acc: ValueId) -> CompileResult<()> {
        let (a_id, a_l) = self.shared_layout(a).map_err(|_| {
            CompileError::unsupported("dot operand outside shared memory")
        })?;
        let (b_id, b_l) = self.shared_layout(b).map_err(|_| {
            CompileError::unsupported("dot operand outside shared memory")
        })?;
        let inner = a_l.shape[1];
        if a_l.shape.len() != 2 || b_l.shape.len() != 2 || b_l.shape[0] != inner {
            return Err(CompileError::internal(format!(
                "dot shapes {:?} x {:?} do not agree",
                a_l.shape, b_l.shape
            )));
        }
        let out = lir_scalar(self.elem_of(v)?);
        let (a_elem, b_elem) = (lir_scalar(a_l.elem), lir_scalar(b_l.elem));
        let a_ptr = self.shared_ptr(a)?;
        let b_ptr = self.shared_ptr(b)?;

        let mut ks = Vec::with_capacity(inner as usize);
        for k in 0..inner {
            ks.push(self.b.i32(k as i32));
        }
        for &c in self.coords(v)? {
            let (m, n) = (c[0], c[1]);
            let mut sum = self.get(acc, c)?;
            for &k in &ks {
                let a_coord = self.coord(&[m, k]);
                let b_coord = self.coord(&[k, n]);
                let a_off = self.swizzle(a_id, a_coord)?;
                let b_off = self.swizzle(b_id, b_coord)?;
                let pa = self.b.gep(a_elem, a_ptr, a_off);
                let pb = self.b.gep(b_elem, b_ptr, b_off);
                let x = self.b.load(Ty::Scalar(a_elem), pa);
                let y = self.b.load(Ty::Scalar(b_elem), pb);
                let x = self.promote(x, a_elem, out);
                let y = self.promote(y, b_elem, out);
                sum = if out.is_float() {
                    let prod = self.b.binary(BinOp::FMul, x, y);
                    self.b.binary(BinOp::FAdd, sum, prod)
                } else {
                    let prod = self.b.mul(x, y);
                    self.b.add(sum, prod)
                };
            }
            self.define(v, c, sum)?;
        }
        Ok(())
    }

    fn promote(&mut self, x: Val, from: Scalar, to: Scalar) -> Val {
        if from == to {
            return x;
        }
        let op = if to.is_float() {
            CastOp::FpExt
        } else {
            CastOp::SExt
        };
        self.b.cast(op, x, Ty::Scalar(to))
    }
}

/// Distinct XOR phases of a swizzled tile. The phase never moves a chunk
/// out of its row.
pub(super) fn swizzle_phases(l: &SharedLayout) -> u32 {
    let chunks = l.shape[l.order[0]] / l.vec.max(1);
    let phases = l.max_phase.min(chunks).max(1);
    if chunks.is_power_of_two() && phases.is_power_of_two() {
        phases
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::swizzle_phases;
    use crate::analysis::{Buffering, SharedLayout};
    use crate::codegen::compile;
    use crate::core::CodegenConfig;
    use crate::lir::{BinOp, CacheHint, Function, Intrinsic, Op};
    use crate::target::NvidiaTarget;
    use crate::tile_ir::{parse_module, ElemType};

    fn shared(shape: [u32; 2], vec: u32, max_phase: u32) -> SharedLayout {
        SharedLayout {
            shape: shape.to_vec(),
            order: vec![1, 0],
            elem: ElemType::F16,
            vec,
            per_phase: 1,
            max_phase,
            buffering: Buffering::None,
        }
    }

    fn async_calls(func: &Function) -> Vec<Intrinsic> {
        func.insts()
            .filter_map(|(_, i)| match func.inst(i).op {
                Op::Call {
                    intrinsic: x @ Intrinsic::CpAsync { .. },
                    ..
                } => Some(x),
                _ => None,
            })
            .collect()
    }

    const ASYNC: &str = r#"
#blk = scanline<shape=[32, 64], order=[1, 0], nts=[1, 8], mts=[16, 8]>
#smem = shared<shape=[32, 64], order=[1, 0], elem=f16, vec=8, per_phase=1, max_phase=8>
func @stage(%src: ptr<f16>) {
entry:
  %p = splat %src : ptr<f16>[32, 64] #blk !align 8
  %t = load_async %p : f16[32, 64] #smem
  async_wait 0
  ret
}
"#;

    #[test]
    fn test_swizzle_phases_stay_within_row() {
        assert_eq!(swizzle_phases(&shared([32, 64], 8, 8)), 8);
        assert_eq!(swizzle_phases(&shared([32, 16], 8, 8)), 2);
        assert_eq!(swizzle_phases(&shared([32, 24], 8, 8)), 1);
    }

    #[test]
    fn test_load_async_issues_cp_async() {
        let parsed = parse_module(ASYNC).unwrap();
        let out = compile(&parsed, &NvidiaTarget::new(80), &CodegenConfig::default()).unwrap();
        let func = &out.module.functions[0];
        let calls = async_calls(func);
        // 32 * 64 halves over 128 threads, 8 per copy
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|c| matches!(
            c,
            Intrinsic::CpAsync {
                bytes: 16,
                cache: CacheHint::Cg,
                ..
            }
        )));
        let printed = func.to_string();
        assert!(printed.contains("cp.async.commit_group"), "{printed}");
        assert!(printed.contains("cp.async.wait_group.0"), "{printed}");
    }

    #[test]
    fn test_load_async_falls_back_without_async_copy() {
        let parsed = parse_module(ASYNC).unwrap();
        let config = CodegenConfig::default().with_async_copy(false);
        let out = compile(&parsed, &NvidiaTarget::new(80), &config).unwrap();
        let func = &out.module.functions[0];
        assert!(async_calls(func).is_empty());
        assert!(!func.to_string().contains("cp.async"));

        let out = compile(&parsed, &NvidiaTarget::new(70), &CodegenConfig::default()).unwrap();
        assert!(async_calls(&out.module.functions[0]).is_empty());
    }

    #[test]
    fn test_swizzle_is_hoisted_to_entry() {
        let text = r#"
#blk = scanline<shape=[32, 32], order=[1, 0], nts=[1, 4], mts=[16, 8]>
#smem = shared<shape=[32, 32], order=[1, 0], elem=f32, vec=4, per_phase=1, max_phase=8>
func @k(%x: f32, %n: i32) {
entry:
  %zero = const 0 : i32
  br ^loop
loop:
  %i = phi [%zero, ^entry], [%next, ^loop] : i32
  %t = splat %x : f32[32, 32] #blk
  %s = copy_to_shared %t : f32[32, 32] #smem
  barrier
  %u = copy_from_shared %s : f32[32, 32] #blk
  barrier
  %one = const 1 : i32
  %next = add %i, %one : i32
  %c = icmp slt %next, %n : i1
  condbr %c, ^loop, ^exit
exit:
  ret
}
"#;
        let parsed = parse_module(text).unwrap();
        let out = compile(&parsed, &NvidiaTarget::new(80), &CodegenConfig::default()).unwrap();
        let func = &out.module.functions[0];
        let entry = func.entry().unwrap();
        let xors: Vec<_> = func
            .insts()
            .filter(|&(_, i)| matches!(func.inst(i).op, Op::Binary { op: BinOp::Xor, .. }))
            .collect();
        assert!(!xors.is_empty());
        assert!(xors.iter().all(|&(b, _)| b == entry));
    }

    #[test]
    fn test_register_conversion_synchronizes() {
        let text = r#"
#a = scanline<shape=[32, 32], order=[1, 0], nts=[1, 4], mts=[16, 8]>
#b = scanline<shape=[32, 32], order=[0, 1], nts=[4, 1], mts=[8, 16]>
func @k(%x: f32) {
entry:
  %t = splat %x : f32[32, 32] #a
  %u = convert_layout %t : f32[32, 32] #b
  ret
}
"#;
        let parsed = parse_module(text).unwrap();
        let out = compile(&parsed, &NvidiaTarget::new(80), &CodegenConfig::default()).unwrap();
        let func = &out.module.functions[0];
        let ops: Vec<&Op> = func.insts().map(|(_, i)| &func.inst(i).op).collect();
        let barrier = |op: &&Op| {
            matches!(
                op,
                Op::Call {
                    intrinsic: Intrinsic::Barrier,
                    ..
                }
            )
        };
        let last_store = ops.iter().rposition(|op| matches!(op, Op::Store { .. })).unwrap();
        let first_load = ops.iter().position(|op| matches!(op, Op::Load { .. })).unwrap();
        assert!(last_store < first_load);
        assert!(ops[last_store..first_load].iter().any(barrier));
        assert!(ops[first_load..].iter().any(barrier));
    }
}
