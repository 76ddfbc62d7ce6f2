//! Casts and constant materialization.
//!
//! fp8 and bf16 have no register type of their own; they are carried as raw
//! `i8` / `i16` bits and converted with explicit bit sequences.

use super::values::{lir_scalar, ty_of};
use super::FunctionCodegen;
use crate::core::{CompileError, CompileResult};
use crate::lir::{self, Intrinsic, Scalar, Ty, Val};
use crate::tile_ir::{CastOp, Constant, ElemType, ScalarType, Type, ValueId};

const MAGNITUDE_MASK: i32 = 0x7fff_7fff;
const SIGN_MASK: i32 = 0x8000_8000_u32 as i32;
/// Bytes 0 and 1 of the second operand into the high byte of each half.
const PRMT_LOW_PAIR: u16 = 0x5040;
/// Bytes 2 and 3 of the second operand into the high byte of each half.
const PRMT_HIGH_PAIR: u16 = 0x7060;
/// High byte of every half of both operands.
const PRMT_HIGH_BYTES: u16 = 0x7531;

impl<'a, 'arena> FunctionCodegen<'a, 'arena> {
    pub(super) fn emit_cast(&mut self, v: ValueId, op: CastOp, arg: ValueId) -> CompileResult<()> {
        let src = self.module.value(arg).ty.scalar.elem();
        let dst = self.module.value(v).ty.scalar.elem();
        if op != CastOp::BitCast {
            match (src, dst) {
                (Some(s), Some(d)) if s == ElemType::Fp8 || d == ElemType::Fp8 => {
                    return self.emit_fp8_cast(v, arg, s, d)
                }
                (Some(s), Some(d)) if s == ElemType::Bf16 || d == ElemType::Bf16 => {
                    return self.emit_bf16_cast(v, arg, s, d)
                }
                _ => {}
            }
        }
        let ty = ty_of(self.module.value(v).ty.scalar)?;
        let op = lower_cast(op);
        self.elementwise(v, |cg, c| {
            let x = cg.get(arg, c)?;
            Ok(cg.b.cast(op, x, ty))
        })
    }

    fn emit_bf16_cast(
        &mut self,
        v: ValueId,
        arg: ValueId,
        src: ElemType,
        dst: ElemType,
    ) -> CompileResult<()> {
        match (src, dst) {
            (ElemType::Bf16, ElemType::F32) => self.elementwise(v, |cg, c| {
                let x = cg.get(arg, c)?;
                let zero = cg.b.int(Scalar::I16, 0);
                let words = cg.b.pack(&[zero, x]);
                Ok(cg.b.bitcast(words, Ty::F32))
            }),
            (ElemType::F32, ElemType::Bf16) => {
                let rounding = self.target.supports_bf16_rounding();
                self.elementwise(v, |cg, c| {
                    let x = cg.get(arg, c)?;
                    if rounding {
                        return Ok(cg.b.call(Intrinsic::CvtRnBf16F32, vec![x], Ty::I16));
                    }
                    let halves = cg.b.bitcast(x, Ty::Vector(Scalar::I16, 2));
                    Ok(cg.b.extract(halves, 1))
                })
            }
            _ => Err(CompileError::unsupported(format!(
                "conversion from {} to {}",
                src.name(),
                dst.name()
            ))),
        }
    }

    fn emit_fp8_cast(
        &mut self,
        v: ValueId,
        arg: ValueId,
        src: ElemType,
        dst: ElemType,
    ) -> CompileResult<()> {
        let contiguous = match self.layout_id(v).map(|id| self.layouts.layout(id).as_scanline()) {
            Some(Some(l)) => l.nts[l.order[0]],
            _ => {
                return Err(CompileError::unsupported(
                    "fp8 conversion outside a scanline layout",
                ))
            }
        };
        if contiguous % 4 != 0 {
            return Err(CompileError::unsupported(format!(
                "fp8 conversion with {contiguous} contiguous elements per thread"
            )));
        }

        let src_coords = self.coords(arg)?;
        let dst_coords = self.coords(v)?;
        if src_coords.len() != dst_coords.len() {
            return Err(CompileError::internal(
                "fp8 conversion changes the number of elements",
            ));
        }
        let mut inputs = Vec::with_capacity(src_coords.len());
        for &c in src_coords {
            inputs.push(self.get(arg, c)?);
        }

        let mut outputs = Vec::with_capacity(inputs.len());
        for group in inputs.chunks(4) {
            let &[x0, x1, x2, x3] = group else {
                return Err(CompileError::internal(
                    "fp8 elements do not form groups of four",
                ));
            };
            let ys = match (src, dst) {
                (ElemType::Fp8, ElemType::F16) => self.fp8x4_to_f16x4([x0, x1, x2, x3]),
                (ElemType::Fp8, ElemType::F32) => self
                    .fp8x4_to_f16x4([x0, x1, x2, x3])
                    .map(|h| self.b.cast(lir::CastOp::FpExt, h, Ty::F32)),
                (ElemType::F16, ElemType::Fp8) => self.f16x4_to_fp8x4([x0, x1, x2, x3]),
                (ElemType::F32, ElemType::Fp8) => {
                    let hs = [x0, x1, x2, x3].map(|x| self.b.cast(lir::CastOp::FpTrunc, x, Ty::F16));
                    self.f16x4_to_fp8x4(hs)
                }
                _ => {
                    return Err(CompileError::unsupported(format!(
                        "conversion from {} to {}",
                        src.name(),
                        dst.name()
                    )))
                }
            };
            outputs.extend(ys);
        }
        for (&c, val) in dst_coords.iter().zip(outputs) {
            self.define(v, c, val)?;
        }
        Ok(())
    }

    /// Pack four fp8 bytes into one word and permute them into the high
    /// halves of two f16 pairs; then strip the sign, shift the magnitude
    /// into f16 position and restore the sign.
    fn fp8x4_to_f16x4(&mut self, xs: [Val; 4]) -> [Val; 4] {
        let b = &mut self.b;
        let bytes = b.pack(&xs);
        let word = b.bitcast(bytes, Ty::I32);
        let zero = b.i32(0);
        let mut out = [word; 4];
        for (i, selector) in [PRMT_LOW_PAIR, PRMT_HIGH_PAIR].into_iter().enumerate() {
            let spread = b.call(Intrinsic::Prmt(selector), vec![zero, word], Ty::I32);
            let mask = b.i32(MAGNITUDE_MASK);
            let magnitude = b.and(spread, mask);
            let one = b.i32(1);
            let magnitude = b.lshr(magnitude, one);
            let mask = b.i32(SIGN_MASK);
            let sign = b.and(spread, mask);
            let bits = b.or(magnitude, sign);
            let halves = b.bitcast(bits, Ty::Vector(Scalar::F16, 2));
            out[2 * i] = b.extract(halves, 0);
            out[2 * i + 1] = b.extract(halves, 1);
        }
        out
    }

    /// Inverse of [`Self::fp8x4_to_f16x4`]; the lowest mantissa bit is dropped.
    fn f16x4_to_fp8x4(&mut self, hs: [Val; 4]) -> [Val; 4] {
        let b = &mut self.b;
        let mut words = [hs[0]; 2];
        for (i, pair) in hs.chunks(2).enumerate() {
            let packed = b.pack(pair);
            let word = b.bitcast(packed, Ty::I32);
            let one = b.i32(1);
            let shifted = b.shl(word, one);
            let mask = b.i32(MAGNITUDE_MASK);
            let magnitude = b.and(shifted, mask);
            let mask = b.i32(SIGN_MASK);
            let sign = b.and(word, mask);
            words[i] = b.or(magnitude, sign);
        }
        let word = b.call(Intrinsic::Prmt(PRMT_HIGH_BYTES), words.to_vec(), Ty::I32);
        let bytes = b.bitcast(word, Ty::Vector(Scalar::I8, 4));
        [0, 1, 2, 3].map(|i| b.extract(bytes, i))
    }

    /// Materialize a tile IR constant of type `ty`.
    pub(super) fn constant(&mut self, ty: &Type, k: Constant) -> CompileResult<Val> {
        let elem = match ty.scalar {
            ScalarType::Void => return Err(CompileError::internal("constant of void type")),
            ScalarType::Ptr(..) => {
                return match k {
                    Constant::Undef => {
                        let ty = ty_of(ty.scalar)?;
                        Ok(self.b.undef(ty))
                    }
                    _ => Err(CompileError::unsupported("non-undef pointer constant")),
                }
            }
            ScalarType::Elem(e) => e,
        };
        let scalar = lir_scalar(elem);
        let value = match k {
            Constant::Undef => return Ok(self.b.undef(Ty::Scalar(scalar))),
            Constant::Int(i) if elem.is_int() => return Ok(self.b.int(scalar, i)),
            Constant::Float(_) if elem.is_int() => {
                return Err(CompileError::internal(format!(
                    "floating-point constant of type {}",
                    elem.name()
                )))
            }
            Constant::Int(i) => i as f64,
            Constant::Float(f) => f,
        };
        Ok(match elem {
            ElemType::Bf16 => self.b.int(Scalar::I16, bf16_bits(value) as i64),
            ElemType::Fp8 => self.b.int(Scalar::I8, fp8_bits(value) as i64),
            _ => self.b.float(scalar, value),
        })
    }
}

fn bf16_bits(value: f64) -> u16 {
    half::bf16::from_f64(value).to_bits()
}

/// fp8 encoding of `value`: the f16 bits run through the register conversion.
fn fp8_bits(value: f64) -> u8 {
    let h = u32::from(half::f16::from_f64(value).to_bits());
    let bits = ((h << 1) & 0x7fff) | (h & 0x8000);
    (bits >> 8) as u8
}

fn lower_cast(op: CastOp) -> lir::CastOp {
    match op {
        CastOp::Trunc => lir::CastOp::Trunc,
        CastOp::ZExt => lir::CastOp::ZExt,
        CastOp::SExt => lir::CastOp::SExt,
        CastOp::FpTrunc => lir::CastOp::FpTrunc,
        CastOp::FpExt => lir::CastOp::FpExt,
        CastOp::UiToFp => lir::CastOp::UiToFp,
        CastOp::SiToFp => lir::CastOp::SiToFp,
        CastOp::FpToUi => lir::CastOp::FpToUi,
        CastOp::FpToSi => lir::CastOp::FpToSi,
        CastOp::PtrToInt => lir::CastOp::PtrToInt,
        CastOp::IntToPtr => lir::CastOp::IntToPtr,
        CastOp::BitCast => lir::CastOp::BitCast,
        CastOp::AddrSpaceCast => lir::CastOp::AddrSpaceCast,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::compile;
    use crate::core::CodegenConfig;
    use crate::lir::Op;
    use crate::target::NvidiaTarget;
    use crate::tile_ir::parse_module;

    fn cast_kernel(src: &str, dst: &str, nts: u32) -> String {
        let mts = 256 / nts;
        format!(
            r#"
#blk = scanline<shape=[256], order=[0], nts=[{nts}], mts=[{mts}]>
func @k(%x: ptr<{src}>) {{
entry:
  %r = make_range 0 : i32[256] #blk
  %ps = splat %x : ptr<{src}>[256] #blk
  %p = gep %ps, %r : ptr<{src}>[256] #blk
  %v = load %p : {src}[256] #blk
  %c = fpext %v : {dst}[256] #blk
  ret
}}
"#
        )
    }

    fn count_calls(func: &lir::Function, intrinsic: Intrinsic) -> usize {
        func.insts()
            .filter(|&(_, i)| matches!(&func.inst(i).op, Op::Call { intrinsic: x, .. } if *x == intrinsic))
            .count()
    }

    #[test]
    fn test_fp8_encoding_matches_register_conversion() {
        assert_eq!(fp8_bits(0.00390625), 0x38);
        assert_eq!(fp8_bits(-0.00390625), 0xb8);
        assert_eq!(fp8_bits(0.0), 0);
        assert_eq!(bf16_bits(1.0), 0x3f80);
    }

    #[test]
    fn test_fp8_conversion_needs_four_contiguous_elements() {
        let target = NvidiaTarget::new(80);
        let config = CodegenConfig::default().with_num_warps(1);

        let ok = parse_module(&cast_kernel("fp8", "f16", 8)).unwrap();
        compile(&ok, &target, &config).unwrap();

        let config = CodegenConfig::default().with_num_warps(4);
        let bad = parse_module(&cast_kernel("fp8", "f16", 2)).unwrap();
        let err = compile(&bad, &target, &config).unwrap_err();
        assert!(err.is_unsupported());
    }

    #[test]
    fn test_bf16_rounding_depends_on_target() {
        let text = r#"
#blk = scanline<shape=[128], order=[0], nts=[1], mts=[128]>
func @k(%x: f32) {
entry:
  %s = splat %x : f32[128] #blk
  %b = fptrunc %s : bf16[128] #blk
  ret
}
"#;
        let parsed = parse_module(text).unwrap();
        let config = CodegenConfig::default();

        let sm80 = compile(&parsed, &NvidiaTarget::new(80), &config).unwrap();
        assert_eq!(
            count_calls(&sm80.module.functions[0], Intrinsic::CvtRnBf16F32),
            1
        );
        let sm70 = compile(&parsed, &NvidiaTarget::new(70), &config).unwrap();
        assert_eq!(
            count_calls(&sm70.module.functions[0], Intrinsic::CvtRnBf16F32),
            0
        );
    }

    #[test]
    fn test_bf16_to_f16_is_unsupported() {
        let text = r#"
#blk = scanline<shape=[128], order=[0], nts=[1], mts=[128]>
func @k(%x: bf16) {
entry:
  %s = splat %x : bf16[128] #blk
  %h = fptrunc %s : f16[128] #blk
  ret
}
"#;
        let parsed = parse_module(text).unwrap();
        let err = compile(&parsed, &NvidiaTarget::new(80), &CodegenConfig::default()).unwrap_err();
        assert!(err.is_unsupported());
    }

    #[test]
    fn test_fp8_groups_share_one_packed_word() {
        let target = NvidiaTarget::new(80);
        let config = CodegenConfig::default().with_num_warps(1);
        let parsed = parse_module(&cast_kernel("fp8", "f16", 8)).unwrap();
        let out = compile(&parsed, &target, &config).unwrap();
        let func = &out.module.functions[0];

        // Eight elements per thread: two words, each spread into two f16 pairs.
        assert_eq!(count_calls(func, Intrinsic::Prmt(PRMT_LOW_PAIR)), 2);
        assert_eq!(count_calls(func, Intrinsic::Prmt(PRMT_HIGH_PAIR)), 2);
        let packed_words = func
            .insts()
            .filter(|&(_, i)| {
                let inst = func.inst(i);
                inst.ty == Ty::I32
                    && matches!(&inst.op, Op::Cast { op: lir::CastOp::BitCast, arg }
                        if func.ty_of(*arg) == Ty::Vector(Scalar::I8, 4))
            })
            .count();
        assert_eq!(packed_words, 2);
    }

    #[test]
    fn test_f16_to_fp8_gathers_four_bytes_per_word() {
        let text = r#"
#blk = scanline<shape=[128], order=[0], nts=[4], mts=[32]>
func @k(%x: f16) {
entry:
  %s = splat %x : f16[128] #blk
  %b = fptrunc %s : fp8[128] #blk
  ret
}
"#;
        let parsed = parse_module(text).unwrap();
        let config = CodegenConfig::default().with_num_warps(1);
        let out = compile(&parsed, &NvidiaTarget::new(80), &config).unwrap();
        let func = &out.module.functions[0];
        assert_eq!(count_calls(func, Intrinsic::Prmt(PRMT_HIGH_BYTES)), 1);
    }

    #[test]
    fn test_scalar_fp8_conversion_is_unsupported() {
        let text = r#"
func @k(%x: f16) {
entry:
  %b = fptrunc %x : fp8
  ret
}
"#;
        let parsed = parse_module(text).unwrap();
        let err = compile(&parsed, &NvidiaTarget::new(80), &CodegenConfig::default()).unwrap_err();
        assert!(err.is_unsupported(), "{err}");
    }
}
