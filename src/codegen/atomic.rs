//! Atomics.
//!
//! A scalar atomic is issued by thread 0 alone; the old value travels back to
//! every thread through a scratch slot, fenced and synchronized on both sides.
//! Tile atomics issue one transaction per group of coordinates.

use super::values::{lir_scalar, ty_of};
use super::FunctionCodegen;
use crate::core::{CompileError, CompileResult};
use crate::lir::{IntPredicate, Intrinsic, RmwOp, Scalar, Ty, Val};
use crate::tile_ir::{AtomicOp, ElemType, ValueId};

impl<'a, 'arena> FunctionCodegen<'a, 'arena> {
    pub(super) fn emit_atomic_cas(
        &mut self,
        v: ValueId,
        ptr: ValueId,
        cmp: ValueId,
        val: ValueId,
    ) -> CompileResult<()> {
        if self.module.value(v).ty.is_block() {
            return Err(CompileError::unsupported("atomic_cas on a tile"));
        }
        let ty = ty_of(self.module.value(v).ty.scalar)?;
        let address = self.get(ptr, &[])?;
        let cmp = self.get(cmp, &[])?;
        let val = self.get(val, &[])?;
        let (base, offset) = self.b.split_const_offset(address);
        self.single_thread_atomic(v, ty, None, |cg, pred| {
            cg.b.call(
                Intrinsic::AtomicCas { offset },
                vec![pred, base, cmp, val],
                ty,
            )
        })
    }

    pub(super) fn emit_atomic_rmw(
        &mut self,
        v: ValueId,
        op: AtomicOp,
        ptr: ValueId,
        val: ValueId,
        mask: Option<ValueId>,
    ) -> CompileResult<()> {
        let rmw = lower_rmw(op);
        if self.module.value(val).ty.is_block() {
            return self.tile_atomic_rmw(v, rmw, ptr, val, mask);
        }
        let ty = ty_of(self.module.value(v).ty.scalar)?;
        let address = self.get(ptr, &[])?;
        let value = self.get(val, &[])?;
        let mask = match mask {
            Some(m) => Some(self.get(m, &[])?),
            None => None,
        };
        let (base, offset) = self.b.split_const_offset(address);
        self.single_thread_atomic(v, ty, mask, |cg, pred| {
            cg.b.call(
                Intrinsic::AtomicRmw {
                    op: rmw,
                    offset,
                    vec: 1,
                },
                vec![pred, base, value],
                ty,
            )
        })
    }

    /// Run `issue` on thread 0 only (and only where `mask` holds), then
    /// broadcast its result.
    fn single_thread_atomic<F>(
        &mut self,
        v: ValueId,
        ty: Ty,
        mask: Option<Val>,
        issue: F,
    ) -> CompileResult<()>
    where
        F: FnOnce(&mut Self, Val) -> Val,
    {
        if !self.target.is_gpu() {
            let pred = match mask {
                Some(m) => m,
                None => self.b.i1(true),
            };
            let old = issue(self, pred);
            if ty != Ty::Void {
                self.define(v, &[], old)?;
            }
            return Ok(());
        }

        self.target.memory_fence(&mut self.b);
        self.barrier();
        let tid = self.thread_id()?;
        let zero = self.b.i32(0);
        let first = self.b.icmp(IntPredicate::Eq, tid, zero);
        let pred = match mask {
            Some(m) => self.b.and(first, m),
            None => first,
        };
        let old = issue(self, pred);
        if ty == Ty::Void {
            self.target.memory_fence(&mut self.b);
            self.barrier();
            return Ok(());
        }
        let slot = self.scratch_base(v)?;
        self.b
            .call(Intrinsic::StSharedPred, vec![pred, slot, old], Ty::Void);
        self.target.memory_fence(&mut self.b);
        self.barrier();
        let result = self.b.load(ty, slot);
        self.barrier();
        self.define(v, &[], result)
    }

    fn tile_atomic_rmw(
        &mut self,
        v: ValueId,
        op: RmwOp,
        ptr: ValueId,
        val: ValueId,
        mask: Option<ValueId>,
    ) -> CompileResult<()> {
        let elem = self.elem_of(val)?;
        let scalar = lir_scalar(elem);
        let vec = if elem == ElemType::F16 {
            self.vector_width(ptr).min(2)
        } else {
            1
        };
        let defines = self.module.value(v).ty.scalar.elem().is_some();
        let coords = self.coords(val)?;
        for group in coords.chunks(vec) {
            let c0 = group[0];
            let address = self.get(ptr, c0)?;
            let (base, offset) = self.b.split_const_offset(address);
            let pred = match mask {
                Some(m) => self.get(m, c0)?,
                None => self.b.i1(true),
            };
            let mut lanes = Vec::with_capacity(group.len());
            for &c in group {
                lanes.push(self.get(val, c)?);
            }
            let packed = self.b.pack(&lanes);
            let ret = atomic_ty(scalar, group.len());
            let old = self.b.call(
                Intrinsic::AtomicRmw {
                    op,
                    offset,
                    vec: group.len() as u32,
                },
                vec![pred, base, packed],
                ret,
            );
            if !defines {
                continue;
            }
            for (i, &c) in group.iter().enumerate() {
                let x = if group.len() > 1 {
                    self.b.extract(old, i as u32)
                } else {
                    old
                };
                self.define(v, c, x)?;
            }
        }
        Ok(())
    }
}

fn atomic_ty(scalar: Scalar, lanes: usize) -> Ty {
    if lanes > 1 {
        Ty::Vector(scalar, lanes as u32)
    } else {
        Ty::Scalar(scalar)
    }
}

fn lower_rmw(op: AtomicOp) -> RmwOp {
    match op {
        AtomicOp::Or => RmwOp::Or,
        AtomicOp::And => RmwOp::And,
        AtomicOp::Xor => RmwOp::Xor,
        AtomicOp::Add => RmwOp::Add,
        AtomicOp::Max => RmwOp::Max,
        AtomicOp::Min => RmwOp::Min,
        AtomicOp::UMax => RmwOp::UMax,
        AtomicOp::UMin => RmwOp::UMin,
        AtomicOp::FAdd => RmwOp::FAdd,
        AtomicOp::Xchg => RmwOp::Xchg,
    }
}

#[cfg(test)]
mod tests {
    use crate::codegen::compile;
    use crate::core::CodegenConfig;
    use crate::lir::{Function, Intrinsic, Op};
    use crate::target::NvidiaTarget;
    use crate::tile_ir::parse_module;

    fn calls(func: &Function) -> Vec<Intrinsic> {
        func.insts()
            .filter_map(|(_, i)| match func.inst(i).op {
                Op::Call { intrinsic, .. } => Some(intrinsic),
                _ => None,
            })
            .collect()
    }

    fn lower(text: &str) -> crate::core::CompileResult<Function> {
        let parsed = parse_module(text)?;
        let out = compile(&parsed, &NvidiaTarget::new(80), &CodegenConfig::default())?;
        Ok(out.module.functions[0].clone())
    }

    #[test]
    fn test_scalar_atomic_is_fenced_and_broadcast() {
        let func = lower(
            r#"
func @count(%p: ptr<i32>, %out: ptr<i32>) {
entry:
  %one = const 1 : i32
  %old = atomic_rmw add %p, %one : i32
  store %out, %old
  ret
}
"#,
        )
        .unwrap();
        let seq: Vec<&str> = calls(&func)
            .iter()
            .filter_map(|c| match c {
                Intrinsic::MemFence => Some("fence"),
                Intrinsic::Barrier => Some("barrier"),
                Intrinsic::AtomicRmw { .. } => Some("atom"),
                Intrinsic::StSharedPred => Some("st"),
                _ => None,
            })
            .collect();
        assert_eq!(
            seq,
            ["fence", "barrier", "atom", "st", "fence", "barrier", "barrier"]
        );
    }

    #[test]
    fn test_tile_cas_is_unsupported() {
        let err = lower(
            r#"
#blk = scanline<shape=[128], order=[0], nts=[1], mts=[128]>
func @k(%p: ptr<i32>) {
entry:
  %ps = splat %p : ptr<i32>[128] #blk
  %z = const 0 : i32[128] #blk
  %old = atomic_cas %ps, %z, %z : i32[128] #blk
  ret
}
"#,
        )
        .unwrap_err();
        assert!(err.is_unsupported());
    }

    #[test]
    fn test_f16_tile_atomics_pair_up() {
        let func = lower(
            r#"
#blk = scanline<shape=[256], order=[0], nts=[2], mts=[128]>
func @k(%p: ptr<f16>, %x: f16) {
entry:
  %r = make_range 0 : i32[256] #blk
  %ps = splat %p : ptr<f16>[256] #blk
  %q = gep %ps, %r : ptr<f16>[256] #blk !align 2
  %v = splat %x : f16[256] #blk
  %old = atomic_rmw fadd %q, %v : f16[256] #blk
  ret
}
"#,
        )
        .unwrap();
        let atoms: Vec<_> = calls(&func)
            .into_iter()
            .filter(|c| matches!(c, Intrinsic::AtomicRmw { .. }))
            .collect();
        assert_eq!(atoms.len(), 1);
        assert!(matches!(atoms[0], Intrinsic::AtomicRmw { vec: 2, .. }));
    }
}
