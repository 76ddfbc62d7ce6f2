//! Reductions.
//!
//! Rank-1 inputs reduce in registers, then across the lanes of a warp with
//! butterfly shuffles, then across warps through one scratch slot per warp.
//! Higher ranks reduce per thread, then with a shared-memory tree along the
//! reduced axis. On the host every element lives in the one thread.

use super::emit::is_narrow_float;
use super::values::lir_scalar;
use super::{Coord, FunctionCodegen};
use crate::analysis::reduce_scratch_shape;
use crate::core::{CompileError, CompileResult};
use crate::lir::{BinOp, IntPredicate, Intrinsic, Scalar, Ty, Val};
use crate::tile_ir::{ReduceOp, ValueId};
use hashbrown::HashMap;

const WARP_SIZE: i32 = 32;

impl<'a, 'arena> FunctionCodegen<'a, 'arena> {
    pub(super) fn emit_reduce(
        &mut self,
        v: ValueId,
        op: ReduceOp,
        arg: ValueId,
        axis: u32,
    ) -> CompileResult<()> {
        let elem = self.elem_of(arg)?;
        if is_narrow_float(elem) || op.is_float() != elem.is_float() {
            return Err(CompileError::unsupported(format!(
                "{op:?} reduction of {}",
                elem.name()
            )));
        }
        let scalar = lir_scalar(elem);
        let rank = self.module.value(arg).ty.rank();
        let axis = axis as usize;
        if axis >= rank {
            return Err(CompileError::internal(format!(
                "reduction axis {axis} out of range for rank {rank}"
            )));
        }

        if !self.target.is_gpu() {
            return self.reduce_in_thread(v, op, arg, axis);
        }
        if rank == 1 {
            self.reduce_1d(v, op, arg, scalar)
        } else {
            self.reduce_nd(v, op, arg, axis, scalar)
        }
    }

    fn accumulate(&mut self, op: ReduceOp, acc: Val, x: Val) -> Val {
        let b = &mut self.b;
        match op {
            ReduceOp::Add => b.add(acc, x),
            ReduceOp::Sub => b.sub(acc, x),
            ReduceOp::Max => {
                let ge = b.icmp(IntPredicate::Sge, acc, x);
                b.select(ge, acc, x)
            }
            ReduceOp::Min => {
                let le = b.icmp(IntPredicate::Sle, acc, x);
                b.select(le, acc, x)
            }
            ReduceOp::FAdd => b.binary(BinOp::FAdd, acc, x),
            ReduceOp::FSub => b.binary(BinOp::FSub, acc, x),
            ReduceOp::FMax => b.binary(BinOp::FMax, acc, x),
            ReduceOp::FMin => b.binary(BinOp::FMin, acc, x),
        }
    }

    fn neutral(&mut self, op: ReduceOp, scalar: Scalar) -> Val {
        let bits = scalar.bits();
        let b = &mut self.b;
        match op {
            ReduceOp::Add | ReduceOp::Sub => b.int(scalar, 0),
            ReduceOp::Max => b.int(scalar, i64::MIN >> (64 - bits)),
            ReduceOp::Min => b.int(scalar, i64::MAX >> (64 - bits)),
            ReduceOp::FAdd | ReduceOp::FSub => b.float(scalar, 0.0),
            ReduceOp::FMax => b.float(scalar, f64::NEG_INFINITY),
            ReduceOp::FMin => b.float(scalar, f64::INFINITY),
        }
    }

    /// Read `value` from lane `lane ^ mask`. Values wider than 32 bits are
    /// exchanged as two halves.
    fn shuffle_xor(&mut self, value: Val, mask: i32) -> Val {
        let ty = self.b.ty_of(value);
        let lanes = self.b.i32(mask);
        if ty.bits() <= 32 {
            return self.b.call(Intrinsic::ShflBfly, vec![value, lanes], ty);
        }
        let halves = self.b.bitcast(value, Ty::Vector(Scalar::F32, 2));
        let lo = self.b.extract(halves, 0);
        let hi = self.b.extract(halves, 1);
        let lo = self.b.call(Intrinsic::ShflBfly, vec![lo, lanes], Ty::F32);
        let hi = self.b.call(Intrinsic::ShflBfly, vec![hi, lanes], Ty::F32);
        let packed = self.b.pack(&[lo, hi]);
        self.b.bitcast(packed, ty)
    }

    /// Combine the values `v`'s argument holds at `coords`, in order.
    fn reduce_registers(
        &mut self,
        op: ReduceOp,
        arg: ValueId,
        coords: &[Coord<'arena>],
    ) -> CompileResult<Option<Val>> {
        let mut acc = None;
        for &c in coords {
            let x = self.get(arg, c)?;
            acc = Some(match acc {
                Some(a) => self.accumulate(op, a, x),
                None => x,
            });
        }
        Ok(acc)
    }

    /// Per-thread partial results keyed by the coordinate with the reduced
    /// axis set to zero, in first-seen order.
    fn partial_reduce(
        &mut self,
        op: ReduceOp,
        arg: ValueId,
        axis: usize,
    ) -> CompileResult<Vec<(Coord<'arena>, Val)>> {
        let zero = self.b.i32(0);
        let mut accs: Vec<(Coord<'arena>, Val)> = Vec::new();
        let mut slots: HashMap<Coord<'arena>, usize> = HashMap::new();
        for &c in self.coords(arg)? {
            let mut key = c.to_vec();
            key[axis] = zero;
            let key = self.coord(&key);
            let x = self.get(arg, c)?;
            match slots.get(key) {
                Some(&i) => {
                    let acc = accs[i].1;
                    accs[i].1 = self.accumulate(op, acc, x);
                }
                None => {
                    slots.insert(key, accs.len());
                    accs.push((key, x));
                }
            }
        }
        Ok(accs)
    }

    fn reduce_in_thread(
        &mut self,
        v: ValueId,
        op: ReduceOp,
        arg: ValueId,
        axis: usize,
    ) -> CompileResult<()> {
        if !self.module.value(v).ty.is_block() {
            let coords = self.coords(arg)?;
            let acc = self
                .reduce_registers(op, arg, coords)?
                .ok_or_else(|| CompileError::internal("reduction of an empty tile"))?;
            return self.define(v, &[], acc);
        }
        let accs: HashMap<Coord<'arena>, Val> =
            self.partial_reduce(op, arg, axis)?.into_iter().collect();
        let zero = self.b.i32(0);
        for &c in self.coords(v)? {
            let mut key = c.to_vec();
            key.insert(axis, zero);
            let acc = accs.get(key.as_slice()).copied().ok_or_else(|| {
                CompileError::internal(format!(
                    "reduction result coordinate {c:?} has no partial result"
                ))
            })?;
            self.define(v, c, acc)?;
        }
        Ok(())
    }

    fn reduce_1d(&mut self, v: ValueId, op: ReduceOp, arg: ValueId, scalar: Scalar) -> CompileResult<()> {
        let id = self.require_layout(arg)?;
        match self.layouts.layout(id).as_scanline() {
            Some(l) if !l.is_replicated() => {}
            _ => {
                return Err(CompileError::unsupported(
                    "1-d reduction of a replicated or non-scanline tile",
                ))
            }
        }
        let ty = Ty::Scalar(scalar);
        let coords = self.coords(arg)?;
        let mut acc = self
            .reduce_registers(op, arg, coords)?
            .ok_or_else(|| CompileError::internal("reduction of an empty tile"))?;
        let mut mask = WARP_SIZE / 2;
        while mask > 0 {
            let other = self.shuffle_xor(acc, mask);
            acc = self.accumulate(op, acc, other);
            mask >>= 1;
        }

        let base = self.scratch_base(v)?;
        let tid = self.thread_id()?;
        let warp_size = self.b.i32(WARP_SIZE);
        let warp = self.b.udiv(tid, warp_size);
        let lane = self.b.urem(tid, warp_size);

        self.barrier();
        let neutral = self.neutral(op, scalar);
        let slot = self.b.gep(scalar, base, lane);
        self.b.store(slot, neutral);
        self.barrier();
        let slot = self.b.gep(scalar, base, warp);
        self.b.store(slot, acc);
        self.barrier();

        let num_warps = self.config.num_warps;
        let zero = self.b.i32(0);
        let first_warp = self.b.icmp(IntPredicate::Eq, warp, zero);
        self.emit_guarded(first_warp, "reduce.warp0", |cg| {
            let slot = cg.b.gep(scalar, base, tid);
            let mut partial = cg.b.load(ty, slot);
            let mut mask = (num_warps.next_power_of_two() / 2) as i32;
            while mask > 0 {
                let other = cg.shuffle_xor(partial, mask);
                partial = cg.accumulate(op, partial, other);
                mask >>= 1;
            }
            cg.b.store(slot, partial);
            Ok(())
        })?;
        self.barrier();
        let result = self.b.load(ty, base);
        self.define(v, &[], result)
    }

    fn reduce_nd(
        &mut self,
        v: ValueId,
        op: ReduceOp,
        arg: ValueId,
        axis: usize,
        scalar: Scalar,
    ) -> CompileResult<()> {
        let id = self.require_layout(arg)?;
        let Some(l) = self.layouts.layout(id).as_scanline() else {
            return Err(CompileError::unsupported(
                "n-d reduction of a non-scanline tile",
            ));
        };
        let shape = reduce_scratch_shape(l, axis);
        let order = l.order.clone();
        if !shape[axis].is_power_of_two() {
            return Err(CompileError::unsupported(format!(
                "reduction over {} threads along axis {axis}",
                shape[axis]
            )));
        }
        let strides = strides(&shape, &order);
        let ty = Ty::Scalar(scalar);

        let accs = self.partial_reduce(op, arg, axis)?;
        let base = self.scratch_base(v)?;
        let lane = self.axis_thread_id(id, axis)?;
        for (key, mut acc) in accs {
            let mut write_idx = key.to_vec();
            write_idx[axis] = lane;
            let offset = self.linear_offset(&write_idx, &strides);
            let write_ptr = self.b.gep(scalar, base, offset);
            self.barrier();
            self.b.store(write_ptr, acc);

            let mut active = shape[axis] / 2;
            while active > 0 {
                let bound = self.b.i32(active as i32);
                let reads = self.b.icmp(IntPredicate::Ult, lane, bound);
                let step = self.b.i32((active * strides[axis]) as i32);
                let zero = self.b.i32(0);
                let read_off = self.b.select(reads, step, zero);
                let read_ptr = self.b.gep(scalar, write_ptr, read_off);
                self.barrier();
                let x = self.b.load(ty, read_ptr);
                acc = self.accumulate(op, acc, x);
                self.barrier();
                self.b.store(write_ptr, acc);
                active /= 2;
            }
        }
        self.barrier();

        let zero = self.b.i32(0);
        for &c in self.coords(v)? {
            let mut read_idx = c.to_vec();
            read_idx.insert(axis, zero);
            let offset = self.linear_offset(&read_idx, &strides);
            let ptr = self.b.gep(scalar, base, offset);
            let x = self.b.load(ty, ptr);
            self.define(v, c, x)?;
        }
        Ok(())
    }

    /// `sum(idx[k] * strides[k])`.
    pub(super) fn linear_offset(&mut self, idx: &[Val], strides: &[u32]) -> Val {
        let mut offset = self.b.i32(0);
        for (&x, &stride) in idx.iter().zip(strides) {
            let term = self.b.mul_i32(x, stride as i32);
            offset = self.b.add(offset, term);
        }
        offset
    }
}

/// Row strides of a dense tile whose dimensions vary fastest in `order`.
pub(super) fn strides(shape: &[u32], order: &[usize]) -> Vec<u32> {
    let mut strides = vec![0; shape.len()];
    let mut stride = 1;
    for &k in order {
        strides[k] = stride;
        stride *= shape[k];
    }
    strides
}

#[cfg(test)]
mod tests {
    use super::strides;
    use crate::codegen::compile;
    use crate::core::CodegenConfig;
    use crate::lir::{Function, Intrinsic, Op};
    use crate::target::{HostTarget, NvidiaTarget};
    use crate::tile_ir::parse_module;

    fn count(func: &Function, intrinsic: Intrinsic) -> usize {
        func.insts()
            .filter(|&(_, i)| {
                matches!(&func.inst(i).op, Op::Call { intrinsic: x, .. } if *x == intrinsic)
            })
            .count()
    }

    const SUM_1D: &str = r#"
#blk = scanline<shape=[1024], order=[0], nts=[8], mts=[128]>
func @sum(%x: ptr<i32>, %out: ptr<i32>) {
entry:
  %r = make_range 0 : i32[1024] #blk
  %ps = splat %x : ptr<i32>[1024] #blk
  %p = gep %ps, %r : ptr<i32>[1024] #blk !align 4
  %v = load %p : i32[1024] #blk
  %s = reduce add %v, 0 : i32
  store %out, %s
  ret
}
"#;

    #[test]
    fn test_strides_follow_order() {
        assert_eq!(strides(&[4, 8], &[1, 0]), vec![8, 1]);
        assert_eq!(strides(&[4, 8], &[0, 1]), vec![1, 4]);
    }

    #[test]
    fn test_1d_reduction_uses_warp_shuffles() {
        let parsed = parse_module(SUM_1D).unwrap();
        let out = compile(&parsed, &NvidiaTarget::new(80), &CodegenConfig::default()).unwrap();
        let func = &out.module.functions[0];
        // five rounds within a warp, two across four warps
        assert_eq!(count(func, Intrinsic::ShflBfly), 7);
        assert_eq!(count(func, Intrinsic::Barrier), 4);
        assert!(func.to_string().contains("reduce.warp0.then"));
        assert!(out.module.shared_bytes >= 32 * 4);
    }

    #[test]
    fn test_host_reduction_stays_in_registers() {
        let text = r#"
#blk = scanline<shape=[8], order=[0], nts=[8], mts=[1]>
func @sum(%out: ptr<i32>) {
entry:
  %r = make_range 0 : i32[8] #blk
  %s = reduce add %r, 0 : i32
  store %out, %s
  ret
}
"#;
        let parsed = parse_module(text).unwrap();
        let out = compile(&parsed, &HostTarget, &CodegenConfig::default()).unwrap();
        let func = &out.module.functions[0];
        assert_eq!(count(func, Intrinsic::Barrier), 0);
        assert_eq!(count(func, Intrinsic::ShflBfly), 0);
        let stored: Vec<_> = func
            .insts()
            .filter_map(|(_, i)| match func.inst(i).op {
                Op::Store { value, .. } => func.as_const_int(value),
                _ => None,
            })
            .collect();
        // 0 + 1 + ... + 7 folds to a constant
        assert_eq!(stored, vec![28]);
    }

    #[test]
    fn test_nd_reduction_needs_power_of_two_threads() {
        let text = r#"
#blk = scanline<shape=[4, 24], order=[1, 0], nts=[1, 2], mts=[4, 32]>
#row = scanline<shape=[4], order=[0], nts=[1], mts=[128]>
func @k(%x: f32) {
entry:
  %t = splat %x : f32[4, 24] #blk
  %s = reduce fadd %t, 1 : f32[4] #row
  ret
}
"#;
        let parsed = parse_module(text).unwrap();
        let err = compile(&parsed, &NvidiaTarget::new(80), &CodegenConfig::default()).unwrap_err();
        assert!(err.is_unsupported(), "{err}");
    }

    #[test]
    fn test_float_op_on_integers_is_rejected() {
        let text = SUM_1D.replace("reduce add", "reduce fadd");
        let parsed = parse_module(&text).unwrap();
        let err = compile(&parsed, &NvidiaTarget::new(80), &CodegenConfig::default()).unwrap_err();
        assert!(err.is_unsupported());
    }
}
