//! Register contents and the arithmetic on them.
//!
//! A register holds raw bits per lane, truncated to the lane width. Floats
//! are kept in the IEEE encoding of their own type; `f16` goes through
//! `half`.

use super::error::{SimError, SimResult};
use crate::lir::{
    sign_extend, width_mask, BinOp, CastOp, Const, FloatPredicate, IntPredicate, RmwOp, Scalar, Ty,
};
use half::f16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Scalar(u64),
    Vector(Vec<u64>),
}

impl Value {
    pub fn i1(x: bool) -> Self {
        Value::Scalar(x as u64)
    }

    pub fn i32(x: i32) -> Self {
        Value::Scalar(x as u32 as u64)
    }

    pub fn i64(x: i64) -> Self {
        Value::Scalar(x as u64)
    }

    pub fn f16(x: f32) -> Self {
        Value::Scalar(f16::from_f32(x).to_bits() as u64)
    }

    pub fn f32(x: f32) -> Self {
        Value::Scalar(x.to_bits() as u64)
    }

    pub fn f64(x: f64) -> Self {
        Value::Scalar(x.to_bits())
    }

    pub fn ptr(address: u64) -> Self {
        Value::Scalar(address)
    }

    /// All-zero value of `ty`.
    pub fn zero(ty: Ty) -> Self {
        match ty {
            Ty::Vector(_, n) => Value::Vector(vec![0; n as usize]),
            _ => Value::Scalar(0),
        }
    }

    pub fn lanes(&self) -> &[u64] {
        match self {
            Value::Scalar(bits) => std::slice::from_ref(bits),
            Value::Vector(lanes) => lanes,
        }
    }

    fn from_lanes(ty: Ty, lanes: Vec<u64>) -> Self {
        match ty {
            Ty::Vector(..) => Value::Vector(lanes),
            _ => Value::Scalar(lanes.first().copied().unwrap_or(0)),
        }
    }

    /// Bits of a scalar, or of lane 0.
    pub fn bits(&self) -> u64 {
        self.lanes().first().copied().unwrap_or(0)
    }

    pub fn as_bool(&self) -> bool {
        self.bits() & 1 != 0
    }

    pub fn as_i32(&self) -> i32 {
        self.bits() as u32 as i32
    }

    pub fn as_f32(&self) -> f32 {
        f32::from_bits(self.bits() as u32)
    }

    pub fn as_f16(&self) -> f32 {
        f16::from_bits(self.bits() as u16).to_f32()
    }

    pub fn constant(c: &Const) -> Self {
        match *c {
            Const::Int { bits, .. } | Const::Float { bits, .. } => Value::Scalar(bits),
            Const::Undef(ty) => Value::zero(ty),
        }
    }
}

/// Little-endian storage of `v` as a `ty`.
pub fn to_bytes(v: &Value, ty: Ty) -> Vec<u8> {
    let Some(elem) = ty.elem() else {
        return Vec::new();
    };
    let size = elem.bytes() as usize;
    let mut out = Vec::with_capacity(size * ty.lanes() as usize);
    for &lane in v.lanes().iter().take(ty.lanes() as usize) {
        out.extend_from_slice(&lane.to_le_bytes()[..size]);
    }
    out.resize(size * ty.lanes() as usize, 0);
    out
}

pub fn from_bytes(bytes: &[u8], ty: Ty) -> Value {
    let Some(elem) = ty.elem() else {
        return Value::Scalar(0);
    };
    let size = elem.bytes() as usize;
    let lanes = (0..ty.lanes() as usize)
        .map(|i| {
            let mut word = [0u8; 8];
            if let Some(chunk) = bytes.get(i * size..(i + 1) * size) {
                word[..size].copy_from_slice(chunk);
            }
            u64::from_le_bytes(word) & width_mask(elem.bits())
        })
        .collect();
    Value::from_lanes(ty, lanes)
}

pub fn float_of(bits: u64, ty: Scalar) -> f64 {
    match ty {
        Scalar::F16 => f16::from_bits(bits as u16).to_f64(),
        Scalar::F32 => f32::from_bits(bits as u32) as f64,
        _ => f64::from_bits(bits),
    }
}

pub fn bits_of(x: f64, ty: Scalar) -> u64 {
    match ty {
        Scalar::F16 => f16::from_f64(x).to_bits() as u64,
        Scalar::F32 => (x as f32).to_bits() as u64,
        _ => x.to_bits(),
    }
}

fn signed(bits: u64, ty: Scalar) -> i64 {
    sign_extend(bits, ty.bits())
}

/// Apply `f` lane by lane.
pub fn map2(
    a: &Value,
    b: &Value,
    ty: Ty,
    mut f: impl FnMut(u64, u64) -> SimResult<u64>,
) -> SimResult<Value> {
    let lanes = a
        .lanes()
        .iter()
        .zip(b.lanes())
        .map(|(&x, &y)| f(x, y))
        .collect::<SimResult<Vec<u64>>>()?;
    Ok(Value::from_lanes(ty, lanes))
}

pub fn binary(op: BinOp, ty: Scalar, a: u64, b: u64) -> SimResult<u64> {
    let w = ty.bits();
    let mask = width_mask(w);
    if ty.is_float() {
        let (x, y) = (float_of(a, ty), float_of(b, ty));
        let r = match op {
            BinOp::FAdd => x + y,
            BinOp::FSub => x - y,
            BinOp::FMul => x * y,
            BinOp::FDiv => x / y,
            BinOp::FRem => x % y,
            BinOp::FMax => x.max(y),
            BinOp::FMin => x.min(y),
            _ => return Err(SimError::unsupported(format!("{op:?} on {ty:?}"))),
        };
        return Ok(bits_of(r, ty));
    }
    let (sa, sb) = (signed(a, ty), signed(b, ty));
    let zero_div = || SimError::ub(format!("{op:?} by zero"));
    let r = match op {
        BinOp::Add => a.wrapping_add(b),
        BinOp::Sub => a.wrapping_sub(b),
        BinOp::Mul => a.wrapping_mul(b),
        BinOp::UDiv => a.checked_div(b).ok_or_else(zero_div)?,
        BinOp::URem => a.checked_rem(b).ok_or_else(zero_div)?,
        BinOp::SDiv => {
            if sb == 0 {
                return Err(zero_div());
            }
            sa.wrapping_div(sb) as u64
        }
        BinOp::SRem => {
            if sb == 0 {
                return Err(zero_div());
            }
            sa.wrapping_rem(sb) as u64
        }
        BinOp::Shl if b >= w as u64 => 0,
        BinOp::Shl => a << b,
        BinOp::LShr if b >= w as u64 => 0,
        BinOp::LShr => a >> b,
        BinOp::AShr => (sa >> b.min(63)) as u64,
        BinOp::And => a & b,
        BinOp::Or => a | b,
        BinOp::Xor => a ^ b,
        _ => return Err(SimError::unsupported(format!("{op:?} on {ty:?}"))),
    };
    Ok(r & mask)
}

pub fn icmp(pred: IntPredicate, ty: Scalar, a: u64, b: u64) -> bool {
    let (sa, sb) = (signed(a, ty), signed(b, ty));
    match pred {
        IntPredicate::Eq => a == b,
        IntPredicate::Ne => a != b,
        IntPredicate::Ugt => a > b,
        IntPredicate::Uge => a >= b,
        IntPredicate::Ult => a < b,
        IntPredicate::Ule => a <= b,
        IntPredicate::Sgt => sa > sb,
        IntPredicate::Sge => sa >= sb,
        IntPredicate::Slt => sa < sb,
        IntPredicate::Sle => sa <= sb,
    }
}

pub fn fcmp(pred: FloatPredicate, ty: Scalar, a: u64, b: u64) -> bool {
    let (x, y) = (float_of(a, ty), float_of(b, ty));
    let unordered = x.is_nan() || y.is_nan();
    match pred {
        FloatPredicate::False => false,
        FloatPredicate::True => true,
        FloatPredicate::Ord => !unordered,
        FloatPredicate::Uno => unordered,
        FloatPredicate::Oeq => !unordered && x == y,
        FloatPredicate::Ogt => !unordered && x > y,
        FloatPredicate::Oge => !unordered && x >= y,
        FloatPredicate::Olt => !unordered && x < y,
        FloatPredicate::Ole => !unordered && x <= y,
        FloatPredicate::One => !unordered && x != y,
        FloatPredicate::Ueq => unordered || x == y,
        FloatPredicate::Ugt => unordered || x > y,
        FloatPredicate::Uge => unordered || x >= y,
        FloatPredicate::Ult => unordered || x < y,
        FloatPredicate::Ule => unordered || x <= y,
        FloatPredicate::Une => unordered || x != y,
    }
}

/// Convert `v` of type `from` to `to`.
pub fn cast(op: CastOp, v: &Value, from: Ty, to: Ty) -> SimResult<Value> {
    if op == CastOp::BitCast {
        return Ok(from_bytes(&to_bytes(v, from), to));
    }
    let (Some(src), Some(dst)) = (from.elem(), to.elem()) else {
        return Err(SimError::unsupported(format!("{op:?} from {from} to {to}")));
    };
    let mask = width_mask(dst.bits());
    let lanes = v
        .lanes()
        .iter()
        .map(|&x| {
            let r = match op {
                CastOp::Trunc
                | CastOp::ZExt
                | CastOp::PtrToInt
                | CastOp::IntToPtr
                | CastOp::AddrSpaceCast
                | CastOp::BitCast => x,
                CastOp::SExt => signed(x, src) as u64,
                CastOp::FpTrunc | CastOp::FpExt => bits_of(float_of(x, src), dst),
                CastOp::UiToFp => bits_of(x as f64, dst),
                CastOp::SiToFp => bits_of(signed(x, src) as f64, dst),
                CastOp::FpToUi => float_of(x, src) as u64,
                CastOp::FpToSi => float_of(x, src) as i64 as u64,
            };
            r & mask
        })
        .collect();
    Ok(Value::from_lanes(to, lanes))
}

/// New memory contents of an atomic read-modify-write.
pub fn rmw(op: RmwOp, ty: Scalar, old: u64, val: u64) -> u64 {
    let (so, sv) = (signed(old, ty), signed(val, ty));
    match op {
        RmwOp::Or => old | val,
        RmwOp::And => old & val,
        RmwOp::Xor => old ^ val,
        RmwOp::Add => old.wrapping_add(val) & width_mask(ty.bits()),
        RmwOp::Max => {
            if so >= sv {
                old
            } else {
                val
            }
        }
        RmwOp::Min => {
            if so <= sv {
                old
            } else {
                val
            }
        }
        RmwOp::UMax => old.max(val),
        RmwOp::UMin => old.min(val),
        RmwOp::FAdd => bits_of(float_of(old, ty) + float_of(val, ty), ty),
        RmwOp::Xchg => val,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_arithmetic_wraps_to_width() {
        assert_eq!(binary(BinOp::Add, Scalar::I8, 0xff, 1).unwrap(), 0);
        assert_eq!(binary(BinOp::Sub, Scalar::I32, 0, 1).unwrap(), 0xffff_ffff);
        let neg_one = Value::i32(-1).bits();
        assert_eq!(binary(BinOp::AShr, Scalar::I32, neg_one, 4).unwrap(), neg_one);
        assert!(matches!(
            binary(BinOp::UDiv, Scalar::I32, 1, 0),
            Err(SimError::UndefinedBehavior { .. })
        ));
    }

    #[test]
    fn test_signed_compares() {
        let neg = Value::i32(-3).bits();
        assert!(icmp(IntPredicate::Slt, Scalar::I32, neg, 2));
        assert!(!icmp(IntPredicate::Ult, Scalar::I32, neg, 2));
    }

    #[test]
    fn test_float_max_ignores_nan() {
        let nan = f32::NAN.to_bits() as u64;
        let two = 2.0f32.to_bits() as u64;
        assert_eq!(binary(BinOp::FMax, Scalar::F32, nan, two).unwrap(), two);
        assert!(fcmp(FloatPredicate::Uno, Scalar::F32, nan, two));
    }

    #[test]
    fn test_bitcast_between_vector_and_word() {
        let halves = Value::Vector(vec![0x3c00, 0x4000]);
        let word = cast(CastOp::BitCast, &halves, Ty::Vector(Scalar::F16, 2), Ty::I32).unwrap();
        assert_eq!(word, Value::Scalar(0x4000_3c00));
        let ext = cast(CastOp::FpExt, &Value::Scalar(0x3c00), Ty::F16, Ty::F32).unwrap();
        assert_eq!(ext.as_f32(), 1.0);
        let sext = cast(CastOp::SExt, &Value::Scalar(0x80), Ty::I8, Ty::I32).unwrap();
        assert_eq!(sext.as_i32(), -128);
    }
}
