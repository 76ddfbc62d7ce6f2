// This module defines the tile IR consumed by the code generator. A module owns three
// arenas addressed by u32 ids: values (function arguments, constants and instructions),
// blocks and functions. Every value carries a type made of a scalar type (an element type,
// a pointer to an element type in an address space, or void) and an optional tile shape.
// Instructions are a closed enum so the emitter can match every kind exhaustively. The
// module also provides a small mutable API used by the text parser and by tests to build
// functions programmatically, and a Display implementation that prints the textual form
// accepted by the parser.

//! Tile IR data model.
//!
//! Values, blocks and functions are stored in flat tables inside [`Module`] and
//! referenced by [`ValueId`], [`BlockId`] and [`FuncId`].

pub mod check;
pub mod parser;

use std::fmt;

pub use parser::{parse_module, ParsedModule};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(pub u32);

/// Element types a tile can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElemType {
    I1,
    I8,
    I16,
    I32,
    I64,
    Fp8,
    F16,
    Bf16,
    F32,
    F64,
}

impl ElemType {
    pub fn bits(self) -> u32 {
        match self {
            ElemType::I1 => 1,
            ElemType::I8 | ElemType::Fp8 => 8,
            ElemType::I16 | ElemType::F16 | ElemType::Bf16 => 16,
            ElemType::I32 | ElemType::F32 => 32,
            ElemType::I64 | ElemType::F64 => 64,
        }
    }

    /// Storage size in bytes; booleans occupy one byte.
    pub fn bytes(self) -> u32 {
        (self.bits() / 8).max(1)
    }

    pub fn is_float(self) -> bool {
        matches!(
            self,
            ElemType::Fp8 | ElemType::F16 | ElemType::Bf16 | ElemType::F32 | ElemType::F64
        )
    }

    pub fn is_int(self) -> bool {
        !self.is_float()
    }

    pub fn name(self) -> &'static str {
        match self {
            ElemType::I1 => "i1",
            ElemType::I8 => "i8",
            ElemType::I16 => "i16",
            ElemType::I32 => "i32",
            ElemType::I64 => "i64",
            ElemType::Fp8 => "fp8",
            ElemType::F16 => "f16",
            ElemType::Bf16 => "bf16",
            ElemType::F32 => "f32",
            ElemType::F64 => "f64",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "i1" => ElemType::I1,
            "i8" => ElemType::I8,
            "i16" => ElemType::I16,
            "i32" => ElemType::I32,
            "i64" => ElemType::I64,
            "fp8" => ElemType::Fp8,
            "f16" => ElemType::F16,
            "bf16" => ElemType::Bf16,
            "f32" => ElemType::F32,
            "f64" => ElemType::F64,
            _ => return None,
        })
    }
}

/// Scalar part of a type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    Void,
    Elem(ElemType),
    /// Pointer to an element in the given address space.
    Ptr(ElemType, u32),
}

impl ScalarType {
    pub fn elem(self) -> Option<ElemType> {
        match self {
            ScalarType::Elem(e) => Some(e),
            _ => None,
        }
    }

    pub fn pointee(self) -> Option<ElemType> {
        match self {
            ScalarType::Ptr(e, _) => Some(e),
            _ => None,
        }
    }

    pub fn is_ptr(self) -> bool {
        matches!(self, ScalarType::Ptr(..))
    }
}

/// A scalar type with an optional tile shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Type {
    pub scalar: ScalarType,
    pub shape: Vec<u32>,
}

impl Type {
    pub fn scalar(scalar: ScalarType) -> Self {
        Self {
            scalar,
            shape: Vec::new(),
        }
    }

    pub fn elem(elem: ElemType) -> Self {
        Self::scalar(ScalarType::Elem(elem))
    }

    pub fn void() -> Self {
        Self::scalar(ScalarType::Void)
    }

    pub fn tile(scalar: ScalarType, shape: Vec<u32>) -> Self {
        Self { scalar, shape }
    }

    /// Whether this is a tile (block) type.
    pub fn is_block(&self) -> bool {
        !self.shape.is_empty()
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn num_elements(&self) -> u64 {
        self.shape.iter().map(|&d| d as u64).product()
    }
}

/// Function argument attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attribute {
    NoAlias,
    ReadOnly,
    WriteOnly,
    Aligned(u32),
    /// Autotuning hint; has no low-level counterpart.
    Retune,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Constant {
    Int(i64),
    Float(f64),
    Undef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    UDiv,
    SDiv,
    URem,
    SRem,
    Shl,
    LShr,
    AShr,
    And,
    Or,
    Xor,
    FAdd,
    FSub,
    FMul,
    FDiv,
    FRem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IcmpPred {
    Eq,
    Ne,
    Ugt,
    Uge,
    Ult,
    Ule,
    Sgt,
    Sge,
    Slt,
    Sle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FcmpPred {
    False,
    Oeq,
    Ogt,
    Oge,
    Olt,
    Ole,
    One,
    Ord,
    Uno,
    Ueq,
    Ugt,
    Uge,
    Ult,
    Ule,
    Une,
    True,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CastOp {
    Trunc,
    ZExt,
    SExt,
    FpTrunc,
    FpExt,
    UiToFp,
    SiToFp,
    FpToUi,
    FpToSi,
    PtrToInt,
    IntToPtr,
    BitCast,
    AddrSpaceCast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Exp,
    Log,
    Sin,
    Cos,
    Sqrt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Add,
    Sub,
    Max,
    Min,
    FAdd,
    FSub,
    FMax,
    FMin,
}

impl ReduceOp {
    pub fn is_float(self) -> bool {
        matches!(
            self,
            ReduceOp::FAdd | ReduceOp::FSub | ReduceOp::FMax | ReduceOp::FMin
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtomicOp {
    Or,
    And,
    Xor,
    Add,
    Max,
    Min,
    UMax,
    UMin,
    FAdd,
    Xchg,
}

/// Cache policy of a global load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CacheModifier {
    #[default]
    None,
    /// Cache at all levels.
    Ca,
    /// Cache at the L2 level only.
    Cg,
}

/// Tile instructions.
///
/// The set is closed; lowering matches every variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Inst {
    Phi {
        incoming: Vec<(ValueId, BlockId)>,
    },
    Binary {
        op: BinaryOp,
        lhs: ValueId,
        rhs: ValueId,
    },
    ICmp {
        pred: IcmpPred,
        lhs: ValueId,
        rhs: ValueId,
    },
    FCmp {
        pred: FcmpPred,
        lhs: ValueId,
        rhs: ValueId,
    },
    Cast {
        op: CastOp,
        arg: ValueId,
    },
    Select {
        cond: ValueId,
        on_true: ValueId,
        on_false: ValueId,
    },
    Gep {
        ptr: ValueId,
        offset: ValueId,
    },
    Unary {
        op: UnaryOp,
        arg: ValueId,
    },
    UMulHi {
        lhs: ValueId,
        rhs: ValueId,
    },
    MakeRange {
        start: i64,
    },
    Splat {
        arg: ValueId,
    },
    Broadcast {
        arg: ValueId,
    },
    Reshape {
        arg: ValueId,
    },
    Cat {
        lhs: ValueId,
        rhs: ValueId,
    },
    Downcast {
        arg: ValueId,
    },
    ProgramId {
        axis: u8,
    },
    NumPrograms {
        axis: u8,
    },
    Load {
        ptr: ValueId,
        mask: Option<ValueId>,
        other: Option<ValueId>,
        cache: CacheModifier,
    },
    Store {
        ptr: ValueId,
        value: ValueId,
        mask: Option<ValueId>,
    },
    Reduce {
        op: ReduceOp,
        arg: ValueId,
        axis: u32,
    },
    ConvertLayout {
        arg: ValueId,
    },
    LoadAsync {
        ptr: ValueId,
        mask: Option<ValueId>,
        other: Option<ValueId>,
    },
    CopyToShared {
        arg: ValueId,
    },
    CopyFromShared {
        arg: ValueId,
    },
    Trans {
        arg: ValueId,
    },
    AsyncWait {
        pending: u32,
    },
    Barrier,
    /// Module-level array of `size` elements in constant memory; the result
    /// is a pointer to its first element.
    AllocConst {
        size: u32,
    },
    Dot {
        a: ValueId,
        b: ValueId,
        acc: ValueId,
    },
    AtomicCas {
        ptr: ValueId,
        cmp: ValueId,
        val: ValueId,
    },
    AtomicRmw {
        op: AtomicOp,
        ptr: ValueId,
        val: ValueId,
        mask: Option<ValueId>,
    },
    Br {
        dest: BlockId,
    },
    CondBr {
        cond: ValueId,
        on_true: BlockId,
        on_false: BlockId,
    },
    Ret {
        value: Option<ValueId>,
    },
}

impl Inst {
    /// Value operands in evaluation order.
    pub fn operands(&self) -> Vec<ValueId> {
        match self {
            Inst::Phi { incoming } => incoming.iter().map(|&(v, _)| v).collect(),
            Inst::Binary { lhs, rhs, .. }
            | Inst::ICmp { lhs, rhs, .. }
            | Inst::FCmp { lhs, rhs, .. }
            | Inst::UMulHi { lhs, rhs }
            | Inst::Cat { lhs, rhs } => vec![*lhs, *rhs],
            Inst::Cast { arg, .. }
            | Inst::Unary { arg, .. }
            | Inst::Splat { arg }
            | Inst::Broadcast { arg }
            | Inst::Reshape { arg }
            | Inst::Downcast { arg }
            | Inst::Reduce { arg, .. }
            | Inst::ConvertLayout { arg }
            | Inst::CopyToShared { arg }
            | Inst::CopyFromShared { arg }
            | Inst::Trans { arg } => vec![*arg],
            Inst::Select {
                cond,
                on_true,
                on_false,
            } => vec![*cond, *on_true, *on_false],
            Inst::Gep { ptr, offset } => vec![*ptr, *offset],
            Inst::MakeRange { .. }
            | Inst::ProgramId { .. }
            | Inst::NumPrograms { .. }
            | Inst::AsyncWait { .. }
            | Inst::Barrier
            | Inst::AllocConst { .. }
            | Inst::Br { .. } => Vec::new(),
            Inst::Load {
                ptr, mask, other, ..
            }
            | Inst::LoadAsync { ptr, mask, other } => {
                let mut ops = vec![*ptr];
                ops.extend(mask.iter().copied());
                ops.extend(other.iter().copied());
                ops
            }
            Inst::Store { ptr, value, mask } => {
                let mut ops = vec![*ptr, *value];
                ops.extend(mask.iter().copied());
                ops
            }
            Inst::Dot { a, b, acc } => vec![*a, *b, *acc],
            Inst::AtomicCas { ptr, cmp, val } => vec![*ptr, *cmp, *val],
            Inst::AtomicRmw { ptr, val, mask, .. } => {
                let mut ops = vec![*ptr, *val];
                ops.extend(mask.iter().copied());
                ops
            }
            Inst::CondBr { cond, .. } => vec![*cond],
            Inst::Ret { value } => value.iter().copied().collect(),
        }
    }

    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Inst::Br { dest } => vec![*dest],
            Inst::CondBr {
                on_true, on_false, ..
            } => vec![*on_true, *on_false],
            _ => Vec::new(),
        }
    }

    pub fn is_terminator(&self) -> bool {
        matches!(self, Inst::Br { .. } | Inst::CondBr { .. } | Inst::Ret { .. })
    }

    pub fn is_phi(&self) -> bool {
        matches!(self, Inst::Phi { .. })
    }

    pub fn opcode(&self) -> &'static str {
        match self {
            Inst::Phi { .. } => "phi",
            Inst::Binary { op, .. } => binary_op_name(*op),
            Inst::ICmp { .. } => "icmp",
            Inst::FCmp { .. } => "fcmp",
            Inst::Cast { op, .. } => cast_op_name(*op),
            Inst::Select { .. } => "select",
            Inst::Gep { .. } => "gep",
            Inst::Unary { op, .. } => match op {
                UnaryOp::Exp => "exp",
                UnaryOp::Log => "log",
                UnaryOp::Sin => "sin",
                UnaryOp::Cos => "cos",
                UnaryOp::Sqrt => "sqrt",
            },
            Inst::UMulHi { .. } => "umulhi",
            Inst::MakeRange { .. } => "make_range",
            Inst::Splat { .. } => "splat",
            Inst::Broadcast { .. } => "broadcast",
            Inst::Reshape { .. } => "reshape",
            Inst::Cat { .. } => "cat",
            Inst::Downcast { .. } => "downcast",
            Inst::ProgramId { .. } => "program_id",
            Inst::NumPrograms { .. } => "num_programs",
            Inst::Load { .. } => "load",
            Inst::Store { .. } => "store",
            Inst::Reduce { .. } => "reduce",
            Inst::ConvertLayout { .. } => "convert_layout",
            Inst::LoadAsync { .. } => "load_async",
            Inst::CopyToShared { .. } => "copy_to_shared",
            Inst::CopyFromShared { .. } => "copy_from_shared",
            Inst::Trans { .. } => "trans",
            Inst::AsyncWait { .. } => "async_wait",
            Inst::Barrier => "barrier",
            Inst::AllocConst { .. } => "alloc_const",
            Inst::Dot { .. } => "dot",
            Inst::AtomicCas { .. } => "atomic_cas",
            Inst::AtomicRmw { .. } => "atomic_rmw",
            Inst::Br { .. } => "br",
            Inst::CondBr { .. } => "condbr",
            Inst::Ret { .. } => "ret",
        }
    }
}

pub fn binary_op_name(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "add",
        BinaryOp::Sub => "sub",
        BinaryOp::Mul => "mul",
        BinaryOp::UDiv => "udiv",
        BinaryOp::SDiv => "sdiv",
        BinaryOp::URem => "urem",
        BinaryOp::SRem => "srem",
        BinaryOp::Shl => "shl",
        BinaryOp::LShr => "lshr",
        BinaryOp::AShr => "ashr",
        BinaryOp::And => "and",
        BinaryOp::Or => "or",
        BinaryOp::Xor => "xor",
        BinaryOp::FAdd => "fadd",
        BinaryOp::FSub => "fsub",
        BinaryOp::FMul => "fmul",
        BinaryOp::FDiv => "fdiv",
        BinaryOp::FRem => "frem",
    }
}

pub fn cast_op_name(op: CastOp) -> &'static str {
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

#[derive(Debug, Clone, PartialEq)]
pub enum ValueKind {
    Argument { index: u32 },
    Constant(Constant),
    Inst(Inst),
}

#[derive(Debug, Clone)]
pub struct Value {
    pub name: String,
    pub ty: Type,
    pub kind: ValueKind,
    /// Owning function.
    pub func: FuncId,
    /// Owning block, for instructions.
    pub block: Option<BlockId>,
}

impl Value {
    pub fn inst(&self) -> Option<&Inst> {
        match &self.kind {
            ValueKind::Inst(inst) => Some(inst),
            _ => None,
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self.kind, ValueKind::Constant(_))
    }

    pub fn is_phi(&self) -> bool {
        self.inst().is_some_and(Inst::is_phi)
    }
}

#[derive(Debug, Clone)]
pub struct Block {
    pub name: String,
    pub func: FuncId,
    /// Instructions in program order, terminator last.
    pub insts: Vec<ValueId>,
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub args: Vec<ValueId>,
    pub arg_attrs: Vec<Vec<Attribute>>,
    pub ret: Type,
    /// Blocks in program order; the first is the entry.
    pub blocks: Vec<BlockId>,
    /// Constants owned by the function, in creation order.
    pub constants: Vec<ValueId>,
}

impl Function {
    pub fn entry(&self) -> Option<BlockId> {
        self.blocks.first().copied()
    }
}

/// A tile IR module.
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub name: String,
    values: Vec<Value>,
    blocks: Vec<Block>,
    functions: Vec<Function>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn value(&self, id: ValueId) -> &Value {
        &self.values[id.0 as usize]
    }

    pub fn value_mut(&mut self, id: ValueId) -> &mut Value {
        &mut self.values[id.0 as usize]
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0 as usize]
    }

    pub fn function(&self, id: FuncId) -> &Function {
        &self.functions[id.0 as usize]
    }

    pub fn functions(&self) -> impl Iterator<Item = (FuncId, &Function)> {
        self.functions
            .iter()
            .enumerate()
            .map(|(i, f)| (FuncId(i as u32), f))
    }

    pub fn function_by_name(&self, name: &str) -> Option<FuncId> {
        self.functions
            .iter()
            .position(|f| f.name == name)
            .map(|i| FuncId(i as u32))
    }

    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    /// Values defined by `alloc_const`, in definition order.
    pub fn const_arrays(&self) -> Vec<ValueId> {
        self.values
            .iter()
            .enumerate()
            .filter(|(_, v)| matches!(v.inst(), Some(Inst::AllocConst { .. })))
            .map(|(i, _)| ValueId(i as u32))
            .collect()
    }

    /// Add a function and its arguments.
    pub fn add_function(
        &mut self,
        name: impl Into<String>,
        args: Vec<(String, Type, Vec<Attribute>)>,
        ret: Type,
    ) -> FuncId {
        let func = FuncId(self.functions.len() as u32);
        let mut arg_ids = Vec::with_capacity(args.len());
        let mut arg_attrs = Vec::with_capacity(args.len());
        for (index, (arg_name, ty, attrs)) in args.into_iter().enumerate() {
            arg_ids.push(self.push_value(Value {
                name: arg_name,
                ty,
                kind: ValueKind::Argument {
                    index: index as u32,
                },
                func,
                block: None,
            }));
            arg_attrs.push(attrs);
        }
        self.functions.push(Function {
            name: name.into(),
            args: arg_ids,
            arg_attrs,
            ret,
            blocks: Vec::new(),
            constants: Vec::new(),
        });
        func
    }

    pub fn add_block(&mut self, func: FuncId, name: impl Into<String>) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block {
            name: name.into(),
            func,
            insts: Vec::new(),
        });
        self.functions[func.0 as usize].blocks.push(id);
        id
    }

    pub fn add_constant(
        &mut self,
        func: FuncId,
        name: impl Into<String>,
        ty: Type,
        value: Constant,
    ) -> ValueId {
        let id = self.push_value(Value {
            name: name.into(),
            ty,
            kind: ValueKind::Constant(value),
            func,
            block: None,
        });
        self.functions[func.0 as usize].constants.push(id);
        id
    }

    /// Append an instruction at the end of `block`.
    pub fn add_inst(
        &mut self,
        block: BlockId,
        name: impl Into<String>,
        ty: Type,
        inst: Inst,
    ) -> ValueId {
        let func = self.blocks[block.0 as usize].func;
        let id = self.push_value(Value {
            name: name.into(),
            ty,
            kind: ValueKind::Inst(inst),
            func,
            block: Some(block),
        });
        self.blocks[block.0 as usize].insts.push(id);
        id
    }

    /// Replace the instruction of an existing value; used to patch forward references.
    pub fn set_inst(&mut self, id: ValueId, inst: Inst) {
        self.values[id.0 as usize].kind = ValueKind::Inst(inst);
    }

    fn push_value(&mut self, value: Value) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(value);
        id
    }

    /// Opcode and operands of `inst` in the text syntax.
    fn inst_text(&self, inst: &Inst) -> String {
        let v = |id: &ValueId| format!("%{}", self.value(*id).name);
        let b = |id: &BlockId| format!("^{}", self.block(*id).name);
        let mut parts: Vec<String> = Vec::new();
        let head = match inst {
            Inst::Load { cache, .. } => match cache {
                CacheModifier::None => "load",
                CacheModifier::Ca => "load.ca",
                CacheModifier::Cg => "load.cg",
            },
            other => other.opcode(),
        };
        match inst {
            Inst::Phi { incoming } => {
                parts.extend(incoming.iter().map(|(val, from)| format!("[{}, {}]", v(val), b(from))));
            }
            Inst::ICmp { pred, lhs, rhs } => {
                parts.push(format!("{pred:?}").to_ascii_lowercase());
                parts.extend([v(lhs), v(rhs)]);
            }
            Inst::FCmp { pred, lhs, rhs } => {
                parts.push(format!("{pred:?}").to_ascii_lowercase());
                parts.extend([v(lhs), v(rhs)]);
            }
            Inst::Reduce { op, arg, axis } => {
                parts.push(format!("{op:?}").to_ascii_lowercase());
                parts.push(v(arg));
                parts.push(axis.to_string());
            }
            Inst::AtomicRmw { op, .. } => {
                parts.push(format!("{op:?}").to_ascii_lowercase());
                parts.extend(inst.operands().iter().map(v));
            }
            Inst::MakeRange { start } => parts.push(start.to_string()),
            Inst::ProgramId { axis } | Inst::NumPrograms { axis } => parts.push(axis.to_string()),
            Inst::AsyncWait { pending } => parts.push(pending.to_string()),
            Inst::AllocConst { size } => parts.push(size.to_string()),
            Inst::CondBr {
                cond,
                on_true,
                on_false,
            } => parts.extend([v(cond), b(on_true), b(on_false)]),
            Inst::Br { dest } => parts.push(b(dest)),
            _ => parts.extend(inst.operands().iter().map(v)),
        }
        if parts.is_empty() {
            head.to_string()
        } else {
            format!("{head} {}", parts.join(", "))
        }
    }

    /// Predecessors of `block` inside its function.
    pub fn predecessors(&self, block: BlockId) -> Vec<BlockId> {
        let func = self.function(self.block(block).func);
        func.blocks
            .iter()
            .copied()
            .filter(|&b| {
                self.block(b)
                    .insts
                    .last()
                    .and_then(|&t| self.value(t).inst())
                    .is_some_and(|t| t.successors().contains(&block))
            })
            .collect()
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scalar {
            ScalarType::Void => write!(f, "void")?,
            ScalarType::Elem(e) => write!(f, "{}", e.name())?,
            ScalarType::Ptr(e, 1) => write!(f, "ptr<{}>", e.name())?,
            ScalarType::Ptr(e, space) => write!(f, "ptr<{}, {}>", e.name(), space)?,
        }
        if self.is_block() {
            let dims: Vec<String> = self.shape.iter().map(|d| d.to_string()).collect();
            write!(f, "[{}]", dims.join(", "))?;
        }
        Ok(())
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (_, func) in self.functions() {
            write!(f, "func @{}(", func.name)?;
            for (i, &arg) in func.args.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                let value = self.value(arg);
                write!(f, "%{}: {}", value.name, value.ty)?;
                for attr in &func.arg_attrs[i] {
                    match attr {
                        Attribute::NoAlias => write!(f, " noalias")?,
                        Attribute::ReadOnly => write!(f, " readonly")?,
                        Attribute::WriteOnly => write!(f, " writeonly")?,
                        Attribute::Aligned(n) => write!(f, " align({n})")?,
                        Attribute::Retune => write!(f, " retune")?,
                    }
                }
            }
            write!(f, ")")?;
            if func.ret.scalar != ScalarType::Void {
                write!(f, " -> {}", func.ret)?;
            }
            writeln!(f, " {{")?;
            for (i, &block) in func.blocks.iter().enumerate() {
                writeln!(f, "{}:", self.block(block).name)?;
                if i == 0 {
                    for &c in &func.constants {
                        let value = self.value(c);
                        if let ValueKind::Constant(k) = value.kind {
                            let lit = match k {
                                Constant::Int(v) => v.to_string(),
                                Constant::Float(v) => format!("{v:?}"),
                                Constant::Undef => "undef".to_string(),
                            };
                            writeln!(f, "  %{} = const {} : {}", value.name, lit, value.ty)?;
                        }
                    }
                }
                for &v in &self.block(block).insts {
                    let value = self.value(v);
                    if let ValueKind::Inst(inst) = &value.kind {
                        write!(f, "  ")?;
                        if value.ty.scalar != ScalarType::Void {
                            write!(f, "%{} = ", value.name)?;
                        }
                        write!(f, "{}", self.inst_text(inst))?;
                        if value.ty.scalar != ScalarType::Void {
                            write!(f, " : {}", value.ty)?;
                        }
                        writeln!(f)?;
                    }
                }
            }
            writeln!(f, "}}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_function_programmatically() {
        let mut module = Module::new("m");
        let ptr = Type::scalar(ScalarType::Ptr(ElemType::F32, 1));
        let func = module.add_function(
            "k",
            vec![("x".to_string(), ptr.clone(), vec![Attribute::NoAlias])],
            Type::void(),
        );
        let entry = module.add_block(func, "entry");
        let x = module.function(func).args[0];
        let v = module.add_inst(
            entry,
            "v",
            Type::elem(ElemType::F32),
            Inst::Load {
                ptr: x,
                mask: None,
                other: None,
                cache: CacheModifier::None,
            },
        );
        module.add_inst(entry, "", Type::void(), Inst::Ret { value: None });

        assert_eq!(module.value(v).block, Some(entry));
        assert_eq!(module.value(v).inst().map(Inst::operands), Some(vec![x]));
        assert_eq!(module.function_by_name("k"), Some(func));
        let text = module.to_string();
        assert!(text.contains("func @k(%x: ptr<f32> noalias)"));
        assert!(text.contains("%v = load %x : f32"));
    }

    #[test]
    fn test_predecessors_follow_terminators() {
        let mut module = Module::new("m");
        let func = module.add_function("f", vec![], Type::void());
        let entry = module.add_block(func, "entry");
        let exit = module.add_block(func, "exit");
        module.add_inst(entry, "", Type::void(), Inst::Br { dest: exit });
        module.add_inst(exit, "", Type::void(), Inst::Ret { value: None });
        assert_eq!(module.predecessors(exit), vec![entry]);
        assert!(module.predecessors(entry).is_empty());
    }

    #[test]
    fn test_elem_sizes() {
        assert_eq!(ElemType::I1.bytes(), 1);
        assert_eq!(ElemType::Fp8.bits(), 8);
        assert_eq!(ElemType::Bf16.bytes(), 2);
        assert!(ElemType::Bf16.is_float());
        assert_eq!(
            Type::tile(ScalarType::Elem(ElemType::F32), vec![32, 4]).num_elements(),
            128
        );
    }
}
