//! Textual form of the low-level IR.
//!
//! Target operations print as calls to PTX-style mnemonics, e.g.
//! `call void @bar.sync()` or `call i32 @shfl.sync.bfly.b32(i32 %7, i32 16)`.

use super::*;
use std::fmt::{self, Write};

impl fmt::Display for AddrSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "addrspace({})", self.index())
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::I1 => write!(f, "i1"),
            Scalar::I8 => write!(f, "i8"),
            Scalar::I16 => write!(f, "i16"),
            Scalar::I32 => write!(f, "i32"),
            Scalar::I64 => write!(f, "i64"),
            Scalar::F16 => write!(f, "half"),
            Scalar::F32 => write!(f, "float"),
            Scalar::F64 => write!(f, "double"),
            Scalar::Ptr(AddrSpace::Generic) => write!(f, "ptr"),
            Scalar::Ptr(space) => write!(f, "ptr {space}"),
        }
    }
}

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ty::Void => write!(f, "void"),
            Ty::Scalar(s) => write!(f, "{s}"),
            Ty::Vector(s, n) => write!(f, "<{n} x {s}>"),
        }
    }
}

fn cache_suffix(cache: CacheHint) -> &'static str {
    match cache {
        CacheHint::None => "",
        CacheHint::Ca => ".ca",
        CacheHint::Cg => ".cg",
    }
}

fn rmw_name(op: RmwOp) -> &'static str {
    match op {
        RmwOp::Or => "or",
        RmwOp::And => "and",
        RmwOp::Xor => "xor",
        RmwOp::Add => "add",
        RmwOp::Max => "max",
        RmwOp::Min => "min",
        RmwOp::UMax => "umax",
        RmwOp::UMin => "umin",
        RmwOp::FAdd => "fadd",
        RmwOp::Xchg => "exch",
    }
}

impl Intrinsic {
    /// Mnemonic used in the textual form.
    pub fn mnemonic(&self) -> String {
        const AXES: [&str; 3] = ["x", "y", "z"];
        let axis = |a: u8| AXES.get(a as usize).copied().unwrap_or("?");
        match *self {
            Intrinsic::ThreadIdx(a) => format!("tid.{}", axis(a)),
            Intrinsic::BlockIdx(a) => format!("ctaid.{}", axis(a)),
            Intrinsic::NumBlocks(a) => format!("nctaid.{}", axis(a)),
            Intrinsic::Barrier => "bar.sync".to_string(),
            Intrinsic::MemFence => "membar.gl".to_string(),
            Intrinsic::ShflBfly => "shfl.sync.bfly.b32".to_string(),
            Intrinsic::Ex2 => "ex2.approx.f32".to_string(),
            Intrinsic::Lg2 => "lg2.approx.f32".to_string(),
            Intrinsic::Sin => "sin.approx.f32".to_string(),
            Intrinsic::Cos => "cos.approx.f32".to_string(),
            Intrinsic::Sqrt => "sqrt.rn".to_string(),
            Intrinsic::MulHiU32 => "mul.hi.u32".to_string(),
            Intrinsic::CvtRnBf16F32 => "cvt.rn.bf16.f32".to_string(),
            Intrinsic::Prmt(selector) => format!("prmt.b32.{selector:#06x}"),
            Intrinsic::LdGlobal {
                width,
                words,
                offset,
                cache,
                has_other,
            } => {
                let mut s = format!("ld.global{}", cache_suffix(cache));
                if words > 1 {
                    let _ = write!(s, ".v{words}");
                }
                let _ = write!(s, ".b{width}");
                if offset != 0 {
                    let _ = write!(s, "[{offset}]");
                }
                if has_other {
                    s.push_str(".other");
                }
                s
            }
            Intrinsic::AtomicCas { offset } => {
                if offset != 0 {
                    format!("atom.global.cas.b32[{offset}]")
                } else {
                    "atom.global.cas.b32".to_string()
                }
            }
            Intrinsic::AtomicRmw { op, offset, vec } => {
                let mut s = format!("atom.global.gpu.{}", rmw_name(op));
                if vec > 1 {
                    let _ = write!(s, ".v{vec}");
                }
                if offset != 0 {
                    let _ = write!(s, "[{offset}]");
                }
                s
            }
            Intrinsic::StSharedPred => "st.shared.pred".to_string(),
            Intrinsic::CpAsync {
                bytes,
                dst_offset,
                src_offset,
                cache,
            } => {
                let mut s = format!("cp.async{}.shared.global.{bytes}", cache_suffix(cache));
                if dst_offset != 0 || src_offset != 0 {
                    let _ = write!(s, "[{dst_offset},{src_offset}]");
                }
                s
            }
            Intrinsic::CpAsyncCommitGroup => "cp.async.commit_group".to_string(),
            Intrinsic::CpAsyncWaitGroup(n) => format!("cp.async.wait_group.{n}"),
        }
    }
}

fn bin_name(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "add",
        BinOp::Sub => "sub",
        BinOp::Mul => "mul",
        BinOp::UDiv => "udiv",
        BinOp::SDiv => "sdiv",
        BinOp::URem => "urem",
        BinOp::SRem => "srem",
        BinOp::Shl => "shl",
        BinOp::LShr => "lshr",
        BinOp::AShr => "ashr",
        BinOp::And => "and",
        BinOp::Or => "or",
        BinOp::Xor => "xor",
        BinOp::FAdd => "fadd",
        BinOp::FSub => "fsub",
        BinOp::FMul => "fmul",
        BinOp::FDiv => "fdiv",
        BinOp::FRem => "frem",
        BinOp::FMax => "fmax",
        BinOp::FMin => "fmin",
    }
}

fn icmp_name(pred: IntPredicate) -> &'static str {
    match pred {
        IntPredicate::Eq => "eq",
        IntPredicate::Ne => "ne",
        IntPredicate::Ugt => "ugt",
        IntPredicate::Uge => "uge",
        IntPredicate::Ult => "ult",
        IntPredicate::Ule => "ule",
        IntPredicate::Sgt => "sgt",
        IntPredicate::Sge => "sge",
        IntPredicate::Slt => "slt",
        IntPredicate::Sle => "sle",
    }
}

fn fcmp_name(pred: FloatPredicate) -> &'static str {
    match pred {
        FloatPredicate::False => "false",
        FloatPredicate::Oeq => "oeq",
        FloatPredicate::Ogt => "ogt",
        FloatPredicate::Oge => "oge",
        FloatPredicate::Olt => "olt",
        FloatPredicate::Ole => "ole",
        FloatPredicate::One => "one",
        FloatPredicate::Ord => "ord",
        FloatPredicate::Uno => "uno",
        FloatPredicate::Ueq => "ueq",
        FloatPredicate::Ugt => "ugt",
        FloatPredicate::Uge => "uge",
        FloatPredicate::Ult => "ult",
        FloatPredicate::Ule => "ule",
        FloatPredicate::Une => "une",
        FloatPredicate::True => "true",
    }
}

fn cast_name(op: CastOp) -> &'static str {
    match op {
        CastOp::Trunc => "trunc",
        CastOp::ZExt => "zext",
        CastOp::SExt => "sext",
        CastOp::FpTrunc => "fptrunc",
        CastOp::FpExt => "fpext",
        CastOp::UiToFp => "uitofp",
        CastOp::SiToFp => "sitofp",
        CastOp::FpToUi => "fptoui",
        CastOp::FpToSi => "fptosi",
        CastOp::PtrToInt => "ptrtoint",
        CastOp::IntToPtr => "inttoptr",
        CastOp::BitCast => "bitcast",
        CastOp::AddrSpaceCast => "addrspacecast",
    }
}

impl Function {
    /// Operand spelling of `v`.
    pub fn value_name(&self, v: Val) -> String {
        match v {
            Val::Inst(id) => match &self.inst(id).name {
                Some(name) => format!("%{name}.{}", id.0),
                None => format!("%{}", id.0),
            },
            Val::Param(i) => match self.params.get(i as usize) {
                Some(p) => format!("%{}", p.name),
                None => format!("%arg{i}"),
            },
            Val::Const(id) => match *self.const_value(id) {
                Const::Int { ty: Scalar::I1, bits } => {
                    let text = if bits != 0 { "true" } else { "false" };
                    text.to_string()
                }
                Const::Int { .. } => self
                    .const_value(id)
                    .as_int()
                    .map_or_else(String::new, |v| v.to_string()),
                Const::Float { ty: Scalar::F16, bits } => format!("0xH{bits:04X}"),
                Const::Float { .. } => self
                    .const_value(id)
                    .as_f64()
                    .map_or_else(String::new, |v| format!("{v:?}")),
                Const::Undef(_) => "undef".to_string(),
            },
            Val::SharedBase => "@shared".to_string(),
            Val::Global(index) => format!("@const{index}"),
        }
    }

    fn typed(&self, v: Val) -> String {
        format!("{} {}", self.ty_of(v), self.value_name(v))
    }

    fn block_label(&self, b: BlockId) -> String {
        format!("%{}", self.block(b).name)
    }

    fn fmt_op(&self, inst: &Inst) -> String {
        match &inst.op {
            Op::Phi { incoming } => {
                let edges: Vec<String> = incoming
                    .iter()
                    .map(|&(v, b)| format!("[ {}, {} ]", self.value_name(v), self.block_label(b)))
                    .collect();
                format!("phi {} {}", inst.ty, edges.join(", "))
            }
            Op::Binary { op, lhs, rhs } => format!(
                "{} {} {}, {}",
                bin_name(*op),
                inst.ty,
                self.value_name(*lhs),
                self.value_name(*rhs)
            ),
            Op::ICmp { pred, lhs, rhs } => format!(
                "icmp {} {}, {}",
                icmp_name(*pred),
                self.typed(*lhs),
                self.value_name(*rhs)
            ),
            Op::FCmp { pred, lhs, rhs } => format!(
                "fcmp {} {}, {}",
                fcmp_name(*pred),
                self.typed(*lhs),
                self.value_name(*rhs)
            ),
            Op::Cast { op, arg } => {
                format!("{} {} to {}", cast_name(*op), self.typed(*arg), inst.ty)
            }
            Op::Select {
                cond,
                on_true,
                on_false,
            } => format!(
                "select {}, {}, {}",
                self.typed(*cond),
                self.typed(*on_true),
                self.typed(*on_false)
            ),
            Op::Gep { elem, ptr, index } => format!(
                "getelementptr {}, {}, {}",
                elem,
                self.typed(*ptr),
                self.typed(*index)
            ),
            Op::Load { ptr } => format!("load {}, {}", inst.ty, self.typed(*ptr)),
            Op::Store { ptr, value } => {
                format!("store {}, {}", self.typed(*value), self.typed(*ptr))
            }
            Op::ExtractElement { vector, index } => {
                format!("extractelement {}, i32 {}", self.typed(*vector), index)
            }
            Op::InsertElement {
                vector,
                element,
                index,
            } => format!(
                "insertelement {}, {}, i32 {}",
                self.typed(*vector),
                self.typed(*element),
                index
            ),
            Op::Call { intrinsic, args } => {
                let args: Vec<String> = args.iter().map(|&a| self.typed(a)).collect();
                format!("call {} @{}({})", inst.ty, intrinsic.mnemonic(), args.join(", "))
            }
            Op::Br { dest } => format!("br label {}", self.block_label(*dest)),
            Op::CondBr {
                cond,
                on_true,
                on_false,
            } => format!(
                "br {}, label {}, label {}",
                self.typed(*cond),
                self.block_label(*on_true),
                self.block_label(*on_false)
            ),
            Op::Ret { value: None } => "ret void".to_string(),
            Op::Ret { value: Some(v) } => format!("ret {}", self.typed(*v)),
        }
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<String> = self
            .params
            .iter()
            .map(|p| {
                let mut s = p.ty.to_string();
                for attr in &p.attrs {
                    match attr {
                        ParamAttr::NoAlias => s.push_str(" noalias"),
                        ParamAttr::ReadOnly => s.push_str(" readonly"),
                        ParamAttr::WriteOnly => s.push_str(" writeonly"),
                        ParamAttr::Align(n) => {
                            let _ = write!(s, " align {n}");
                        }
                    }
                }
                let _ = write!(s, " %{}", p.name);
                s
            })
            .collect();
        let kind = if self.is_kernel { "kernel" } else { "define" };
        write!(f, "{kind} {} @{}({})", self.ret, self.name, params.join(", "))?;
        if let Some(n) = self.max_threads {
            write!(f, " maxntid({n})")?;
        }
        writeln!(f, " {{")?;
        for (i, &block) in self.blocks().iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            writeln!(f, "{}:", self.block(block).name)?;
            for &id in &self.block(block).insts {
                let inst = self.inst(id);
                if inst.ty == Ty::Void {
                    writeln!(f, "  {}", self.fmt_op(inst))?;
                } else {
                    writeln!(f, "  {} = {}", self.value_name(Val::Inst(id)), self.fmt_op(inst))?;
                }
            }
        }
        writeln!(f, "}}")
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; module {}", self.name)?;
        writeln!(f, "; target {}", self.target)?;
        if self.shared_bytes > 0 {
            writeln!(
                f,
                "@shared = external addrspace(3) global [{} x i8], align 16",
                self.shared_bytes
            )?;
        }
        for (index, global) in self.globals.iter().enumerate() {
            writeln!(
                f,
                "@const{index} = external addrspace(4) global [{} x {}]",
                global.count, global.elem
            )?;
        }
        for func in &self.functions {
            writeln!(f)?;
            write!(f, "{func}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::Builder;

    #[test]
    fn test_print_function() {
        let params = vec![Param {
            name: "out".to_string(),
            ty: Ty::ptr(AddrSpace::Global),
            attrs: vec![ParamAttr::NoAlias, ParamAttr::Align(16)],
        }];
        let mut func = Function::new("k", params, Ty::Void);
        func.is_kernel = true;
        func.max_threads = Some(128);
        let mut b = Builder::new(func, "entry");
        let tid = b.call(Intrinsic::ThreadIdx(0), vec![], Ty::I32);
        let x = b.add_i32(tid, 5);
        b.call(Intrinsic::Barrier, vec![], Ty::Void);
        let p = b.gep(Scalar::I32, Val::Param(0), tid);
        b.store(p, x);
        b.ret(None);
        let text = b.finish().to_string();

        assert!(text.contains("kernel void @k(ptr addrspace(1) noalias align 16 %out) maxntid(128)"));
        assert!(text.contains("%0 = call i32 @tid.x()"));
        assert!(text.contains("%1 = add i32 %0, 5"));
        assert!(text.contains("call void @bar.sync()"));
        assert!(text.contains("store i32 %1, ptr addrspace(1) %3"));
        assert!(text.contains("ret void"));
    }

    #[test]
    fn test_mnemonics() {
        let ld = Intrinsic::LdGlobal {
            width: 32,
            words: 4,
            offset: 16,
            cache: CacheHint::Cg,
            has_other: false,
        };
        assert_eq!(ld.mnemonic(), "ld.global.cg.v4.b32[16]");
        let cp = Intrinsic::CpAsync {
            bytes: 16,
            dst_offset: 0,
            src_offset: 0,
            cache: CacheHint::Cg,
        };
        assert_eq!(cp.mnemonic(), "cp.async.cg.shared.global.16");
        assert_eq!(Intrinsic::CpAsyncWaitGroup(1).mnemonic(), "cp.async.wait_group.1");
    }
}
