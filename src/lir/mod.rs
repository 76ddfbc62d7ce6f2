// The low-level IR produced by the generator. It is a conventional SSA form close to what
// a GPU backend consumes: scalar and short-vector types, instruction results addressed by
// InstId inside one Function arena, constants interned in a per-function pool, and target
// operations expressed as intrinsic calls (thread and block ids, barriers, warp shuffles,
// predicated vector loads, atomics, async copies). Blocks keep an explicit layout order so
// blocks created while splitting land next to their origin. Instructions remember their
// owning block, which keeps block splitting and phi maintenance cheap.

//! Low-level IR.

pub mod builder;
pub mod printer;
pub mod verify;

use crate::core::{CompileError, CompileResult};
use hashbrown::HashMap;

pub use builder::{Builder, Cursor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddrSpace {
    Generic,
    Global,
    Shared,
    Const,
}

impl AddrSpace {
    pub fn index(self) -> u32 {
        match self {
            AddrSpace::Generic => 0,
            AddrSpace::Global => 1,
            AddrSpace::Shared => 3,
            AddrSpace::Const => 4,
        }
    }

    pub fn from_index(index: u32) -> CompileResult<Self> {
        match index {
            0 => Ok(AddrSpace::Generic),
            1 => Ok(AddrSpace::Global),
            3 => Ok(AddrSpace::Shared),
            4 => Ok(AddrSpace::Const),
            _ => Err(CompileError::unsupported(format!("address space {index}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scalar {
    I1,
    I8,
    I16,
    I32,
    I64,
    F16,
    F32,
    F64,
    Ptr(AddrSpace),
}

impl Scalar {
    pub fn bits(self) -> u32 {
        match self {
            Scalar::I1 => 1,
            Scalar::I8 => 8,
            Scalar::I16 | Scalar::F16 => 16,
            Scalar::I32 | Scalar::F32 => 32,
            Scalar::I64 | Scalar::F64 | Scalar::Ptr(_) => 64,
        }
    }

    /// Storage size in bytes.
    pub fn bytes(self) -> u32 {
        (self.bits() / 8).max(1)
    }

    pub fn is_float(self) -> bool {
        matches!(self, Scalar::F16 | Scalar::F32 | Scalar::F64)
    }

    pub fn is_int(self) -> bool {
        matches!(
            self,
            Scalar::I1 | Scalar::I8 | Scalar::I16 | Scalar::I32 | Scalar::I64
        )
    }

    /// Integer type of the given width.
    pub fn int(bits: u32) -> Option<Scalar> {
        match bits {
            1 => Some(Scalar::I1),
            8 => Some(Scalar::I8),
            16 => Some(Scalar::I16),
            32 => Some(Scalar::I32),
            64 => Some(Scalar::I64),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ty {
    Void,
    Scalar(Scalar),
    Vector(Scalar, u32),
}

impl Ty {
    pub const I1: Ty = Ty::Scalar(Scalar::I1);
    pub const I8: Ty = Ty::Scalar(Scalar::I8);
    pub const I16: Ty = Ty::Scalar(Scalar::I16);
    pub const I32: Ty = Ty::Scalar(Scalar::I32);
    pub const I64: Ty = Ty::Scalar(Scalar::I64);
    pub const F16: Ty = Ty::Scalar(Scalar::F16);
    pub const F32: Ty = Ty::Scalar(Scalar::F32);
    pub const F64: Ty = Ty::Scalar(Scalar::F64);

    pub fn ptr(space: AddrSpace) -> Ty {
        Ty::Scalar(Scalar::Ptr(space))
    }

    pub fn bits(self) -> u32 {
        match self {
            Ty::Void => 0,
            Ty::Scalar(s) => s.bits(),
            Ty::Vector(s, n) => s.bits() * n,
        }
    }

    /// Element type of a scalar or vector.
    pub fn elem(self) -> Option<Scalar> {
        match self {
            Ty::Void => None,
            Ty::Scalar(s) | Ty::Vector(s, _) => Some(s),
        }
    }

    pub fn lanes(self) -> u32 {
        match self {
            Ty::Vector(_, n) => n,
            _ => 1,
        }
    }

    pub fn is_float(self) -> bool {
        self.elem().is_some_and(Scalar::is_float)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConstId(pub u32);

/// An SSA value handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Val {
    Inst(InstId),
    Param(u32),
    Const(ConstId),
    /// Base address of the shared memory arena.
    SharedBase,
    /// Address of the module's constant-memory array with this index.
    Global(u32),
}

impl Val {
    pub fn as_inst(self) -> Option<InstId> {
        match self {
            Val::Inst(id) => Some(id),
            _ => None,
        }
    }
}

/// Interned constant. Integer bits are stored truncated to the type width and
/// float bits as the IEEE encoding of the type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Const {
    Int { ty: Scalar, bits: u64 },
    Float { ty: Scalar, bits: u64 },
    Undef(Ty),
}

impl Const {
    pub fn ty(&self) -> Ty {
        match *self {
            Const::Int { ty, .. } | Const::Float { ty, .. } => Ty::Scalar(ty),
            Const::Undef(ty) => ty,
        }
    }

    /// Sign-extended integer value.
    pub fn as_int(&self) -> Option<i64> {
        match *self {
            Const::Int { ty, bits } => Some(sign_extend(bits, ty.bits())),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Const::Float { ty, bits } => Some(match ty {
                Scalar::F16 => half::f16::from_bits(bits as u16).to_f64(),
                Scalar::F32 => f32::from_bits(bits as u32) as f64,
                _ => f64::from_bits(bits),
            }),
            _ => None,
        }
    }
}

pub fn width_mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

pub fn sign_extend(bits: u64, width: u32) -> i64 {
    if width == 0 || width >= 64 {
        return bits as i64;
    }
    let shift = 64 - width;
    ((bits << shift) as i64) >> shift
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
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
    /// IEEE maxNum.
    FMax,
    /// IEEE minNum.
    FMin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntPredicate {
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
pub enum FloatPredicate {
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
pub enum RmwOp {
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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheHint {
    None,
    Ca,
    Cg,
}

/// Target operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intrinsic {
    ThreadIdx(u8),
    BlockIdx(u8),
    NumBlocks(u8),
    Barrier,
    MemFence,
    /// `(value, lane_mask)`: read `value` from lane `lane ^ lane_mask`.
    ShflBfly,
    Ex2,
    Lg2,
    Sin,
    Cos,
    Sqrt,
    MulHiU32,
    CvtRnBf16F32,
    /// `(a, b)`: byte `i` of the result is byte `selector[4i..4i+3]` of the
    /// 8-byte value `b:a`; a set fourth selector bit replicates its sign.
    Prmt(u16),
    /// `(pred, ptr, other words...)`: `words` words of `width` bits at `ptr + offset`
    /// bytes when `pred` holds, else the `other` words (or zero).
    LdGlobal {
        width: u32,
        words: u32,
        offset: i64,
        cache: CacheHint,
        has_other: bool,
    },
    /// `(pred, ptr, cmp, val)`.
    AtomicCas { offset: i64 },
    /// `(pred, ptr, val)`; `vec` lanes updated element-wise.
    AtomicRmw { op: RmwOp, offset: i64, vec: u32 },
    /// `(pred, ptr, val)`.
    StSharedPred,
    /// `(dst, src, src_size)`: copy `bytes` bytes, zero-filling past `src_size`.
    CpAsync {
        bytes: u32,
        dst_offset: i64,
        src_offset: i64,
        cache: CacheHint,
    },
    CpAsyncCommitGroup,
    /// Wait until at most `n` committed groups are pending.
    CpAsyncWaitGroup(u32),
}

impl Intrinsic {
    /// Whether every thread of a group must reach the call together.
    pub fn is_collective(self) -> bool {
        matches!(self, Intrinsic::Barrier | Intrinsic::ShflBfly)
    }

    pub fn has_side_effects(self) -> bool {
        matches!(
            self,
            Intrinsic::Barrier
                | Intrinsic::MemFence
                | Intrinsic::AtomicCas { .. }
                | Intrinsic::AtomicRmw { .. }
                | Intrinsic::StSharedPred
                | Intrinsic::CpAsync { .. }
                | Intrinsic::CpAsyncCommitGroup
                | Intrinsic::CpAsyncWaitGroup(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Phi {
        incoming: Vec<(Val, BlockId)>,
    },
    Binary {
        op: BinOp,
        lhs: Val,
        rhs: Val,
    },
    ICmp {
        pred: IntPredicate,
        lhs: Val,
        rhs: Val,
    },
    FCmp {
        pred: FloatPredicate,
        lhs: Val,
        rhs: Val,
    },
    Cast {
        op: CastOp,
        arg: Val,
    },
    Select {
        cond: Val,
        on_true: Val,
        on_false: Val,
    },
    /// `ptr + index * size_of(elem)`.
    Gep {
        elem: Scalar,
        ptr: Val,
        index: Val,
    },
    Load {
        ptr: Val,
    },
    Store {
        ptr: Val,
        value: Val,
    },
    ExtractElement {
        vector: Val,
        index: u32,
    },
    InsertElement {
        vector: Val,
        element: Val,
        index: u32,
    },
    Call {
        intrinsic: Intrinsic,
        args: Vec<Val>,
    },
    Br {
        dest: BlockId,
    },
    CondBr {
        cond: Val,
        on_true: BlockId,
        on_false: BlockId,
    },
    Ret {
        value: Option<Val>,
    },
}

impl Op {
    pub fn operands(&self) -> Vec<Val> {
        match self {
            Op::Phi { incoming } => incoming.iter().map(|&(v, _)| v).collect(),
            Op::Binary { lhs, rhs, .. } | Op::ICmp { lhs, rhs, .. } | Op::FCmp { lhs, rhs, .. } => {
                vec![*lhs, *rhs]
            }
            Op::Cast { arg, .. } => vec![*arg],
            Op::Select {
                cond,
                on_true,
                on_false,
            } => vec![*cond, *on_true, *on_false],
            Op::Gep { ptr, index, .. } => vec![*ptr, *index],
            Op::Load { ptr } => vec![*ptr],
            Op::Store { ptr, value } => vec![*ptr, *value],
            Op::ExtractElement { vector, .. } => vec![*vector],
            Op::InsertElement {
                vector, element, ..
            } => vec![*vector, *element],
            Op::Call { args, .. } => args.clone(),
            Op::Br { .. } => Vec::new(),
            Op::CondBr { cond, .. } => vec![*cond],
            Op::Ret { value } => value.iter().copied().collect(),
        }
    }

    pub fn is_terminator(&self) -> bool {
        matches!(self, Op::Br { .. } | Op::CondBr { .. } | Op::Ret { .. })
    }

    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Op::Br { dest } => vec![*dest],
            Op::CondBr {
                on_true, on_false, ..
            } => vec![*on_true, *on_false],
            _ => Vec::new(),
        }
    }

    pub fn is_phi(&self) -> bool {
        matches!(self, Op::Phi { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Inst {
    pub op: Op,
    pub ty: Ty,
    pub block: BlockId,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamAttr {
    NoAlias,
    ReadOnly,
    WriteOnly,
    Align(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub ty: Ty,
    pub attrs: Vec<ParamAttr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub name: String,
    pub insts: Vec<InstId>,
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub params: Vec<Param>,
    pub ret: Ty,
    /// GPU entry point.
    pub is_kernel: bool,
    /// Threads per block the kernel is compiled for.
    pub max_threads: Option<u32>,
    blocks: Vec<Block>,
    /// Blocks in emission order.
    layout: Vec<BlockId>,
    insts: Vec<Inst>,
    consts: Vec<Const>,
    const_ids: HashMap<Const, ConstId>,
}

impl Function {
    pub fn new(name: impl Into<String>, params: Vec<Param>, ret: Ty) -> Self {
        Self {
            name: name.into(),
            params,
            ret,
            is_kernel: false,
            max_threads: None,
            blocks: Vec::new(),
            layout: Vec::new(),
            insts: Vec::new(),
            consts: Vec::new(),
            const_ids: HashMap::new(),
        }
    }

    pub fn entry(&self) -> Option<BlockId> {
        self.layout.first().copied()
    }

    pub fn inst(&self, id: InstId) -> &Inst {
        &self.insts[id.0 as usize]
    }

    pub(crate) fn inst_mut(&mut self, id: InstId) -> &mut Inst {
        &mut self.insts[id.0 as usize]
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0 as usize]
    }

    /// Blocks in emission order.
    pub fn blocks(&self) -> &[BlockId] {
        &self.layout
    }

    pub fn num_insts(&self) -> usize {
        self.layout.iter().map(|&b| self.block(b).insts.len()).sum()
    }

    /// Instructions in emission order.
    pub fn insts(&self) -> impl Iterator<Item = (BlockId, InstId)> + '_ {
        self.layout
            .iter()
            .flat_map(move |&b| self.block(b).insts.iter().map(move |&i| (b, i)))
    }

    pub fn add_block(&mut self, name: impl Into<String>) -> BlockId {
        let id = self.new_block(name);
        self.layout.push(id);
        id
    }

    /// Add a block placed directly after `after` in emission order.
    pub fn add_block_after(&mut self, after: BlockId, name: impl Into<String>) -> BlockId {
        let id = self.new_block(name);
        let pos = self
            .layout
            .iter()
            .position(|&b| b == after)
            .map_or(self.layout.len(), |p| p + 1);
        self.layout.insert(pos, id);
        id
    }

    fn new_block(&mut self, name: impl Into<String>) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        let base = name.into();
        let taken = self.blocks.iter().any(|b| b.name == base);
        let name = if taken {
            format!("{base}{}", id.0)
        } else {
            base
        };
        self.blocks.push(Block {
            name,
            insts: Vec::new(),
        });
        id
    }

    pub(crate) fn push_inst(&mut self, inst: Inst) -> InstId {
        let id = InstId(self.insts.len() as u32);
        self.insts.push(inst);
        id
    }

    pub(crate) fn block_insts_mut(&mut self, id: BlockId) -> &mut Vec<InstId> {
        &mut self.blocks[id.0 as usize].insts
    }

    /// Intern a constant.
    pub fn constant(&mut self, c: Const) -> Val {
        if let Some(&id) = self.const_ids.get(&c) {
            return Val::Const(id);
        }
        let id = ConstId(self.consts.len() as u32);
        self.consts.push(c);
        self.const_ids.insert(c, id);
        Val::Const(id)
    }

    pub fn const_value(&self, id: ConstId) -> &Const {
        &self.consts[id.0 as usize]
    }

    /// Constant behind `v`, if it is one.
    pub fn as_const(&self, v: Val) -> Option<&Const> {
        match v {
            Val::Const(id) => Some(self.const_value(id)),
            _ => None,
        }
    }

    pub fn as_const_int(&self, v: Val) -> Option<i64> {
        self.as_const(v).and_then(Const::as_int)
    }

    pub fn ty_of(&self, v: Val) -> Ty {
        match v {
            Val::Inst(id) => self.inst(id).ty,
            Val::Param(i) => self
                .params
                .get(i as usize)
                .map_or(Ty::Void, |p| p.ty),
            Val::Const(id) => self.const_value(id).ty(),
            Val::SharedBase => Ty::ptr(AddrSpace::Shared),
            Val::Global(_) => Ty::ptr(AddrSpace::Const),
        }
    }

    pub fn terminator(&self, block: BlockId) -> Option<InstId> {
        self.block(block)
            .insts
            .last()
            .copied()
            .filter(|&i| self.inst(i).op.is_terminator())
    }

    pub fn successors(&self, block: BlockId) -> Vec<BlockId> {
        self.terminator(block)
            .map(|t| self.inst(t).op.successors())
            .unwrap_or_default()
    }

    pub fn predecessors(&self, block: BlockId) -> Vec<BlockId> {
        self.layout
            .iter()
            .copied()
            .filter(|&b| self.successors(b).contains(&block))
            .collect()
    }

    /// Leading phi instructions of `block`.
    pub fn phis(&self, block: BlockId) -> Vec<InstId> {
        self.block(block)
            .insts
            .iter()
            .copied()
            .take_while(|&i| self.inst(i).op.is_phi())
            .collect()
    }

    /// Append an incoming edge to a phi.
    pub fn add_incoming(&mut self, phi: Val, value: Val, from: BlockId) -> CompileResult<()> {
        let Some(id) = phi.as_inst() else {
            return Err(CompileError::internal(format!(
                "incoming edge added to non-phi value {phi:?}"
            )));
        };
        match &mut self.inst_mut(id).op {
            Op::Phi { incoming } => {
                incoming.push((value, from));
                Ok(())
            }
            other => Err(CompileError::internal(format!(
                "incoming edge added to non-phi instruction {other:?}"
            ))),
        }
    }

    /// Move `at` and every following instruction of its block into a new block
    /// placed after it. Phis of the moved terminator's successors are rewired to
    /// the new block.
    pub fn split_block_before(&mut self, at: InstId, name: impl Into<String>) -> BlockId {
        let old = self.inst(at).block;
        let new = self.add_block_after(old, name);
        let pos = self
            .block(old)
            .insts
            .iter()
            .position(|&i| i == at)
            .unwrap_or(self.block(old).insts.len());
        let moved: Vec<InstId> = self.block_insts_mut(old).split_off(pos);
        for &i in &moved {
            self.inst_mut(i).block = new;
        }
        *self.block_insts_mut(new) = moved;

        for succ in self.successors(new) {
            for phi in self.phis(succ) {
                if let Op::Phi { incoming } = &mut self.inst_mut(phi).op {
                    for (_, from) in incoming.iter_mut() {
                        if *from == old {
                            *from = new;
                        }
                    }
                }
            }
        }
        new
    }
}

/// An array in constant memory that the host fills, addressed by `Val::Global`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Global {
    pub elem: Scalar,
    pub count: u32,
}

impl Global {
    pub fn size_bytes(&self) -> u64 {
        u64::from(self.elem.bytes()) * u64::from(self.count)
    }
}

/// A produced module.
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub name: String,
    pub target: String,
    /// Size of the shared memory arena in bytes (GPU targets).
    pub shared_bytes: u32,
    pub globals: Vec<Global>,
    pub functions: Vec<Function>,
}

impl Module {
    pub fn new(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            shared_bytes: 0,
            globals: Vec::new(),
            functions: Vec::new(),
        }
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants_are_interned() {
        let mut f = Function::new("f", vec![], Ty::Void);
        let a = f.constant(Const::Int {
            ty: Scalar::I32,
            bits: 7,
        });
        let b = f.constant(Const::Int {
            ty: Scalar::I32,
            bits: 7,
        });
        let c = f.constant(Const::Int {
            ty: Scalar::I64,
            bits: 7,
        });
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(f.as_const_int(a), Some(7));
    }

    #[test]
    fn test_sign_extension() {
        assert_eq!(sign_extend(0xffff_ffff, 32), -1);
        assert_eq!(sign_extend(0x7f, 8), 127);
        assert_eq!(sign_extend(0x80, 8), -128);
        assert_eq!(width_mask(16), 0xffff);
    }

    #[test]
    fn test_add_incoming_rejects_non_phi() {
        let mut f = Function::new("f", vec![], Ty::Void);
        let entry = f.add_block("entry");
        let id = f.push_inst(Inst {
            op: Op::Ret { value: None },
            ty: Ty::Void,
            block: entry,
            name: None,
        });
        f.block_insts_mut(entry).push(id);
        let err = f.add_incoming(Val::Inst(id), Val::Param(0), entry);
        assert!(matches!(err, Err(CompileError::Internal { .. })));
        let err = f.add_incoming(Val::Param(0), Val::Param(0), entry);
        assert!(matches!(err, Err(CompileError::Internal { .. })));
    }

    #[test]
    fn test_block_names_are_unique() {
        let mut f = Function::new("f", vec![], Ty::Void);
        let a = f.add_block("loop");
        let b = f.add_block("loop");
        assert_ne!(f.block(a).name, f.block(b).name);
        let c = f.add_block_after(a, "mid");
        assert_eq!(f.blocks(), &[a, c, b]);
    }
}
