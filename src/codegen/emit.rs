//! Per-instruction lowering.
//!
//! `emit` matches every tile instruction. Elementwise operations are lowered
//! here; memory, reductions, layout conversions, casts and atomics live in
//! their own modules.

use super::memory::CONST_SPACE;
use super::pending::PendingEdge;
use super::values::{lir_scalar, ty_of};
use super::{Coord, FunctionCodegen};
use crate::core::{CompileError, CompileResult};
use crate::lir::{BinOp, CastOp, FloatPredicate, IntPredicate, Intrinsic, Scalar, Ty, Val};
use crate::tile_ir::{
    BinaryOp, BlockId, ElemType, FcmpPred, IcmpPred, Inst, ScalarType, UnaryOp, ValueId,
};

impl<'a, 'arena> FunctionCodegen<'a, 'arena> {
    pub(super) fn emit(&mut self, v: ValueId, inst: &'a Inst) -> CompileResult<()> {
        match inst {
            Inst::Phi { incoming } => self.emit_phi(v, incoming),
            Inst::Binary { op, lhs, rhs } => self.emit_binary(v, *op, *lhs, *rhs),
            Inst::ICmp { pred, lhs, rhs } => {
                let pred = lower_icmp(*pred);
                self.elementwise(v, |cg, c| {
                    let l = cg.get(*lhs, c)?;
                    let r = cg.get(*rhs, c)?;
                    Ok(cg.b.icmp(pred, l, r))
                })
            }
            Inst::FCmp { pred, lhs, rhs } => {
                let elem = self.elem_of(*lhs)?;
                if is_narrow_float(elem) {
                    return Err(CompileError::unsupported(format!(
                        "fcmp on {}",
                        elem.name()
                    )));
                }
                let pred = lower_fcmp(*pred);
                self.elementwise(v, |cg, c| {
                    let l = cg.get(*lhs, c)?;
                    let r = cg.get(*rhs, c)?;
                    Ok(cg.b.fcmp(pred, l, r))
                })
            }
            Inst::Cast { op, arg } => self.emit_cast(v, *op, *arg),
            Inst::Select {
                cond,
                on_true,
                on_false,
            } => self.elementwise(v, |cg, c| {
                let k = cg.get(*cond, c)?;
                let t = cg.get(*on_true, c)?;
                let f = cg.get(*on_false, c)?;
                Ok(cg.b.select(k, t, f))
            }),
            Inst::Gep { ptr, offset } => {
                let pointee = self.module.value(v).ty.scalar.pointee().ok_or_else(|| {
                    CompileError::internal("gep result is not a pointer")
                })?;
                let elem = lir_scalar(pointee);
                self.elementwise(v, |cg, c| {
                    let p = cg.get(*ptr, c)?;
                    let off = cg.get(*offset, c)?;
                    Ok(cg.b.gep(elem, p, off))
                })
            }
            Inst::Unary { op, arg } => self.emit_unary(v, *op, *arg),
            Inst::UMulHi { lhs, rhs } => {
                let elem = self.elem_of(v)?;
                if elem != ElemType::I32 {
                    return Err(CompileError::unsupported(format!(
                        "umulhi on {}",
                        elem.name()
                    )));
                }
                self.elementwise(v, |cg, c| {
                    let l = cg.get(*lhs, c)?;
                    let r = cg.get(*rhs, c)?;
                    Ok(cg.b.call(Intrinsic::MulHiU32, vec![l, r], Ty::I32))
                })
            }
            Inst::MakeRange { start } => self.emit_make_range(v, *start),
            Inst::Splat { arg } => {
                let arg = *arg;
                self.elementwise(v, |cg, _| cg.get(arg, &[]))
            }
            Inst::Broadcast { arg } => self.emit_broadcast(v, *arg),
            Inst::Reshape { arg } => {
                let src = self.coords(*arg)?;
                self.positional(v, "reshape", &[(*arg, src)])
            }
            Inst::Cat { lhs, rhs } => {
                let l = self.coords(*lhs)?;
                let r = self.coords(*rhs)?;
                self.positional(v, "cat", &[(*lhs, l), (*rhs, r)])
            }
            Inst::Downcast { arg } => self.emit_downcast(v, *arg),
            Inst::ProgramId { axis } => {
                let id = self.target.block_id(&mut self.b, *axis)?;
                self.define(v, &[], id)
            }
            Inst::NumPrograms { axis } => {
                let n = self.target.num_blocks(&mut self.b, *axis)?;
                self.define(v, &[], n)
            }
            Inst::Load {
                ptr,
                mask,
                other,
                cache,
            } => self.emit_load(v, *ptr, *mask, *other, *cache),
            Inst::Store { ptr, value, mask } => self.emit_store(*ptr, *value, *mask),
            Inst::Reduce { op, arg, axis } => self.emit_reduce(v, *op, *arg, *axis),
            Inst::ConvertLayout { arg } => self.emit_convert_layout(v, *arg),
            Inst::LoadAsync { ptr, mask, other } => self.emit_load_async(v, *ptr, *mask, *other),
            Inst::CopyToShared { arg } => self.copy_to_shared(v, *arg),
            Inst::CopyFromShared { arg } => self.copy_from_shared(v, *arg),
            Inst::Trans { .. } => Err(CompileError::unsupported("trans")),
            Inst::AsyncWait { pending } => {
                if self.target.supports_async_copy() && self.config.async_copy {
                    self.b
                        .call(Intrinsic::CpAsyncWaitGroup(*pending), Vec::new(), Ty::Void);
                }
                Ok(())
            }
            Inst::Barrier => {
                self.barrier();
                Ok(())
            }
            Inst::AllocConst { .. } => self.emit_alloc_const(v),
            Inst::Dot { a, b, acc } => self.emit_dot(v, *a, *b, *acc),
            Inst::AtomicCas { ptr, cmp, val } => self.emit_atomic_cas(v, *ptr, *cmp, *val),
            Inst::AtomicRmw {
                op,
                ptr,
                val,
                mask,
            } => self.emit_atomic_rmw(v, *op, *ptr, *val, *mask),
            Inst::Br { dest } => {
                let dest = self.entry_block(*dest)?;
                self.b.br(dest);
                Ok(())
            }
            Inst::CondBr {
                cond,
                on_true,
                on_false,
            } => {
                let k = self.get(*cond, &[])?;
                let t = self.entry_block(*on_true)?;
                let f = self.entry_block(*on_false)?;
                self.b.cond_br(k, t, f);
                Ok(())
            }
            Inst::Ret { value } => {
                let value = match value {
                    Some(r) => Some(self.get(*r, &[])?),
                    None => None,
                };
                self.b.ret(value);
                Ok(())
            }
        }
    }

    /// Define `v` at each of its coordinates with the value `f` computes there.
    pub(super) fn elementwise<F>(&mut self, v: ValueId, mut f: F) -> CompileResult<()>
    where
        F: FnMut(&mut Self, Coord<'arena>) -> CompileResult<Val>,
    {
        for &c in self.coords(v)? {
            let val = f(self, c)?;
            self.define(v, c, val)?;
        }
        Ok(())
    }

    pub(super) fn elem_of(&self, v: ValueId) -> CompileResult<ElemType> {
        let value = self.module.value(v);
        value.ty.scalar.elem().ok_or_else(|| {
            CompileError::internal(format!("%{} does not hold numbers", value.name))
        })
    }

    fn emit_phi(&mut self, v: ValueId, _incoming: &[(ValueId, BlockId)]) -> CompileResult<()> {
        if let Some(id) = self.layout_id(v) {
            if self.layouts.layout(id).is_shared() {
                return Ok(());
            }
        }
        let ty = ty_of(self.module.value(v).ty.scalar)?;
        self.elementwise(v, |cg, _| Ok(cg.b.phi(ty)))?;
        self.pending.push(PendingEdge::Phi { phi: v });
        Ok(())
    }

    fn emit_binary(&mut self, v: ValueId, op: BinaryOp, lhs: ValueId, rhs: ValueId) -> CompileResult<()> {
        let elem = self.elem_of(v)?;
        if is_narrow_float(elem) {
            return Err(CompileError::unsupported(format!(
                "{} on {}",
                crate::tile_ir::binary_op_name(op),
                elem.name()
            )));
        }
        let op = lower_binary(op);
        self.elementwise(v, |cg, c| {
            let l = cg.get(lhs, c)?;
            let r = cg.get(rhs, c)?;
            Ok(cg.b.binary(op, l, r))
        })
    }

    fn emit_unary(&mut self, v: ValueId, op: UnaryOp, arg: ValueId) -> CompileResult<()> {
        let elem = self.elem_of(v)?;
        let supported = match op {
            UnaryOp::Sqrt => matches!(elem, ElemType::F32 | ElemType::F64),
            UnaryOp::Exp | UnaryOp::Log | UnaryOp::Sin | UnaryOp::Cos => elem == ElemType::F32,
        };
        if !supported {
            return Err(CompileError::unsupported(format!(
                "{} on {}",
                self.module.value(v).inst().map_or("unary", Inst::opcode),
                elem.name()
            )));
        }
        let ty = Ty::Scalar(lir_scalar(elem));
        self.elementwise(v, |cg, c| {
            let x = cg.get(arg, c)?;
            let b = &mut cg.b;
            Ok(match op {
                UnaryOp::Exp => {
                    let k = b.f32(std::f32::consts::LOG2_E);
                    let scaled = b.binary(BinOp::FMul, x, k);
                    b.call(Intrinsic::Ex2, vec![scaled], ty)
                }
                UnaryOp::Log => {
                    let l2 = b.call(Intrinsic::Lg2, vec![x], ty);
                    let k = b.f32(std::f32::consts::LN_2);
                    b.binary(BinOp::FMul, l2, k)
                }
                UnaryOp::Sin => b.call(Intrinsic::Sin, vec![x], ty),
                UnaryOp::Cos => b.call(Intrinsic::Cos, vec![x], ty),
                UnaryOp::Sqrt => b.call(Intrinsic::Sqrt, vec![x], ty),
            })
        })
    }

    fn emit_make_range(&mut self, v: ValueId, start: i64) -> CompileResult<()> {
        let scalar = lir_scalar(self.elem_of(v)?);
        if !matches!(scalar, Scalar::I32 | Scalar::I64) {
            return Err(CompileError::unsupported(format!(
                "make_range of {scalar}"
            )));
        }
        self.elementwise(v, |cg, c| {
            let idx = c.first().copied().ok_or_else(|| {
                CompileError::internal("make_range result is not a tile")
            })?;
            let idx = if scalar == Scalar::I64 {
                cg.b.cast(CastOp::SExt, idx, Ty::I64)
            } else {
                idx
            };
            let start = cg.b.int(scalar, start);
            Ok(cg.b.add(idx, start))
        })
    }

    fn emit_broadcast(&mut self, v: ValueId, arg: ValueId) -> CompileResult<()> {
        let module = self.module;
        let src = &module.value(arg).ty;
        if !src.is_block() {
            return self.elementwise(v, |cg, _| cg.get(arg, &[]));
        }
        let dst = &module.value(v).ty;
        if src.rank() != dst.rank() {
            return Err(CompileError::unsupported(format!(
                "broadcast from rank {} to rank {}",
                src.rank(),
                dst.rank()
            )));
        }
        let zero = self.b.i32(0);
        let collapsed: Vec<bool> = src
            .shape
            .iter()
            .zip(&dst.shape)
            .map(|(&s, &d)| s == 1 && d != 1)
            .collect();
        self.elementwise(v, |cg, c| {
            let coord: Vec<Val> = c
                .iter()
                .zip(&collapsed)
                .map(|(&x, &one)| if one { zero } else { x })
                .collect();
            let coord = cg.coord(&coord);
            cg.get(arg, coord)
        })
    }

    /// Reinterpret the registers of `sources`, concatenated, as the registers of `v`.
    fn positional(
        &mut self,
        v: ValueId,
        what: &str,
        sources: &[(ValueId, &'arena [Coord<'arena>])],
    ) -> CompileResult<()> {
        let dst = self.coords(v)?;
        let available: usize = sources.iter().map(|(_, c)| c.len()).sum();
        if available != dst.len() {
            return Err(CompileError::unsupported(format!(
                "{what} that changes elements per thread ({available} -> {})",
                dst.len()
            )));
        }
        let pairs = sources
            .iter()
            .flat_map(|&(src, coords)| coords.iter().map(move |&c| (src, c)));
        for (&d, (src, c)) in dst.iter().zip(pairs) {
            let val = self.get(src, c)?;
            self.define(v, d, val)?;
        }
        Ok(())
    }

    fn emit_downcast(&mut self, v: ValueId, arg: ValueId) -> CompileResult<()> {
        let ty = &self.module.value(arg).ty;
        if ty.shape.iter().any(|&d| d != 1) {
            return Err(CompileError::unsupported(format!(
                "downcast of a {:?} tile",
                ty.shape
            )));
        }
        let first = self.coords(arg)?.first().copied().ok_or_else(|| {
            CompileError::internal("downcast source owns no elements")
        })?;
        let val = self.get(arg, first)?;
        self.define(v, &[], val)
    }

    fn emit_alloc_const(&mut self, v: ValueId) -> CompileResult<()> {
        let ty = &self.module.value(v).ty;
        if ty.is_block() || !matches!(ty.scalar, ScalarType::Ptr(_, CONST_SPACE)) {
            return Err(CompileError::unsupported(format!(
                "alloc_const producing {ty}"
            )));
        }
        let index = self
            .module
            .const_arrays()
            .iter()
            .position(|&id| id == v)
            .ok_or_else(|| CompileError::internal("alloc_const missing from the module"))?;
        self.define(v, &[], Val::Global(index as u32))
    }
}

pub(super) fn is_narrow_float(elem: ElemType) -> bool {
    matches!(elem, ElemType::Fp8 | ElemType::Bf16)
}

fn lower_binary(op: BinaryOp) -> BinOp {
    match op {
        BinaryOp::Add => BinOp::Add,
        BinaryOp::Sub => BinOp::Sub,
        BinaryOp::Mul => BinOp::Mul,
        BinaryOp::UDiv => BinOp::UDiv,
        BinaryOp::SDiv => BinOp::SDiv,
        BinaryOp::URem => BinOp::URem,
        BinaryOp::SRem => BinOp::SRem,
        BinaryOp::Shl => BinOp::Shl,
        BinaryOp::LShr => BinOp::LShr,
        BinaryOp::AShr => BinOp::AShr,
        BinaryOp::And => BinOp::And,
        BinaryOp::Or => BinOp::Or,
        BinaryOp::Xor => BinOp::Xor,
        BinaryOp::FAdd => BinOp::FAdd,
        BinaryOp::FSub => BinOp::FSub,
        BinaryOp::FMul => BinOp::FMul,
        BinaryOp::FDiv => BinOp::FDiv,
        BinaryOp::FRem => BinOp::FRem,
    }
}

fn lower_icmp(pred: IcmpPred) -> IntPredicate {
    match pred {
        IcmpPred::Eq => IntPredicate::Eq,
        IcmpPred::Ne => IntPredicate::Ne,
        IcmpPred::Ugt => IntPredicate::Ugt,
        IcmpPred::Uge => IntPredicate::Uge,
        IcmpPred::Ult => IntPredicate::Ult,
        IcmpPred::Ule => IntPredicate::Ule,
        IcmpPred::Sgt => IntPredicate::Sgt,
        IcmpPred::Sge => IntPredicate::Sge,
        IcmpPred::Slt => IntPredicate::Slt,
        IcmpPred::Sle => IntPredicate::Sle,
    }
}

fn lower_fcmp(pred: FcmpPred) -> FloatPredicate {
    match pred {
        FcmpPred::False => FloatPredicate::False,
        FcmpPred::Oeq => FloatPredicate::Oeq,
        FcmpPred::Ogt => FloatPredicate::Ogt,
        FcmpPred::Oge => FloatPredicate::Oge,
        FcmpPred::Olt => FloatPredicate::Olt,
        FcmpPred::Ole => FloatPredicate::Ole,
        FcmpPred::One => FloatPredicate::One,
        FcmpPred::Ord => FloatPredicate::Ord,
        FcmpPred::Uno => FloatPredicate::Uno,
        FcmpPred::Ueq => FloatPredicate::Ueq,
        FcmpPred::Ugt => FloatPredicate::Ugt,
        FcmpPred::Uge => FloatPredicate::Uge,
        FcmpPred::Ult => FloatPredicate::Ult,
        FcmpPred::Ule => FloatPredicate::Ule,
        FcmpPred::Une => FloatPredicate::Une,
        FcmpPred::True => FloatPredicate::True,
    }
}

#[cfg(test)]
mod tests {
    use crate::codegen::compile;
    use crate::core::{CodegenConfig, CompileError};
    use crate::lir::{Intrinsic, Op};
    use crate::target::{HostTarget, NvidiaTarget};
    use crate::tile_ir::parse_module;

    fn lower(text: &str) -> Result<crate::lir::Function, CompileError> {
        let parsed = parse_module(text)?;
        let out = compile(&parsed, &NvidiaTarget::new(80), &CodegenConfig::default())?;
        Ok(out.module.functions[0].clone())
    }

    #[test]
    fn test_trans_is_unsupported() {
        let text = r#"
#blk = scanline<shape=[32, 4], order=[1, 0], nts=[1, 4], mts=[32, 4]>
#t = scanline<shape=[4, 32], order=[1, 0], nts=[1, 1], mts=[4, 32]>
func @k(%p: ptr<f32>) {
entry:
  %x = splat %p : ptr<f32>[32, 4] #blk
  %y = trans %x : ptr<f32>[4, 32] #t
  ret
}
"#;
        let err = lower(text).unwrap_err();
        assert_eq!(err, CompileError::unsupported("trans"));
    }

    #[test]
    fn test_exp_scales_by_log2e() {
        let text = r#"
#blk = scanline<shape=[128], order=[0], nts=[1], mts=[128]>
func @k(%x: f32) {
entry:
  %s = splat %x : f32[128] #blk
  %e = exp %s : f32[128] #blk
  ret
}
"#;
        let func = lower(text).unwrap();
        let ex2 = func
            .insts()
            .filter(|&(_, i)| {
                matches!(
                    func.inst(i).op,
                    Op::Call {
                        intrinsic: Intrinsic::Ex2,
                        ..
                    }
                )
            })
            .count();
        assert_eq!(ex2, 1);
    }

    #[test]
    fn test_narrow_float_arithmetic_is_unsupported() {
        let text = r#"
#blk = scanline<shape=[128], order=[0], nts=[1], mts=[128]>
func @k(%x: bf16) {
entry:
  %s = splat %x : bf16[128] #blk
  %y = fadd %s, %s : bf16[128] #blk
  ret
}
"#;
        assert!(lower(text).unwrap_err().is_unsupported());
    }

    #[test]
    fn test_broadcast_reuses_collapsed_coordinates() {
        let text = r#"
#col = scanline<shape=[32, 1], order=[1, 0], nts=[1, 1], mts=[32, 4]>
#blk = scanline<shape=[32, 8], order=[1, 0], nts=[1, 2], mts=[32, 4]>
func @k(%x: f32) {
entry:
  %s = splat %x : f32[32, 1] #col
  %b = broadcast %s : f32[32, 8] #blk
  ret
}
"#;
        lower(text).unwrap();
    }

    #[test]
    fn test_cat_concatenates_registers() {
        let text = r#"
#half = scanline<shape=[128], order=[0], nts=[1], mts=[128]>
#full = scanline<shape=[256], order=[0], nts=[2], mts=[128]>
func @k() {
entry:
  %a = make_range 0 : i32[128] #half
  %b = make_range 128 : i32[128] #half
  %c = cat %a, %b : i32[256] #full
  ret
}
"#;
        lower(text).unwrap();
    }

    #[test]
    fn test_cat_must_keep_register_count() {
        let text = r#"
#half = scanline<shape=[64], order=[0], nts=[1], mts=[128]>
#full = scanline<shape=[128], order=[0], nts=[1], mts=[128]>
func @k() {
entry:
  %a = make_range 0 : i32[64] #half
  %b = make_range 64 : i32[64] #half
  %c = cat %a, %b : i32[128] #full
  ret
}
"#;
        assert!(lower(text).unwrap_err().is_unsupported());
    }

    #[test]
    fn test_host_program_id_reads_parameters() {
        let text = r#"
func @k(%out: ptr<i32>) {
entry:
  %pid = program_id 2 : i32
  store %out, %pid
  ret
}
"#;
        let parsed = parse_module(text).unwrap();
        let out = compile(&parsed, &HostTarget, &CodegenConfig::default()).unwrap();
        let printed = out.module.to_string();
        assert!(printed.contains("%block_id.z"), "{printed}");
    }
}
