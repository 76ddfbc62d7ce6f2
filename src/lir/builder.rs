// Instruction builder for the low-level IR. The builder owns the function under
// construction and an explicit insertion cursor, either the end of a block or the position
// just before an anchor instruction. Code that needs to emit somewhere else temporarily
// (hoisting address arithmetic to the entry block, patching a loop latch before its
// terminator) pushes a new cursor and pops it afterwards, so the caller's position survives.
// Integer arithmetic on constants is folded, additions are canonicalized with the constant
// on the right, and `gep(p, x + c)` is rewritten as `gep(gep(p, x), c)` so that per-element
// constant offsets end up as immediate offsets on memory instructions.

//! Low-level IR builder with a save/restore cursor stack.

use super::*;
use crate::core::{CompileError, CompileResult};

/// Insertion point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    /// Append at the end of the block.
    End(BlockId),
    /// Insert before the anchor; later insertions follow earlier ones.
    Before(InstId),
}

pub struct Builder {
    func: Function,
    cursor: Cursor,
    saved: Vec<Cursor>,
}

impl Builder {
    /// Start building `func`, creating its entry block if it has none.
    pub fn new(mut func: Function, entry_name: &str) -> Self {
        let entry = match func.entry() {
            Some(entry) => entry,
            None => func.add_block(entry_name),
        };
        Self {
            func,
            cursor: Cursor::End(entry),
            saved: Vec::new(),
        }
    }

    pub fn func(&self) -> &Function {
        &self.func
    }

    pub fn func_mut(&mut self) -> &mut Function {
        &mut self.func
    }

    pub fn finish(self) -> Function {
        self.func
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    pub fn set_cursor(&mut self, cursor: Cursor) {
        self.cursor = cursor;
    }

    pub fn position_at_end(&mut self, block: BlockId) {
        self.cursor = Cursor::End(block);
    }

    pub fn position_before(&mut self, inst: InstId) {
        self.cursor = Cursor::Before(inst);
    }

    /// Save the current cursor and move to `cursor`.
    pub fn push_cursor(&mut self, cursor: Cursor) {
        self.saved.push(self.cursor);
        self.cursor = cursor;
    }

    /// Restore the cursor saved by the matching [`Builder::push_cursor`].
    pub fn pop_cursor(&mut self) -> CompileResult<()> {
        match self.saved.pop() {
            Some(cursor) => {
                self.cursor = cursor;
                Ok(())
            }
            None => Err(CompileError::internal("builder cursor stack underflow")),
        }
    }

    pub fn cursor_depth(&self) -> usize {
        self.saved.len()
    }

    pub fn current_block(&self) -> BlockId {
        match self.cursor {
            Cursor::End(block) => block,
            Cursor::Before(anchor) => self.func.inst(anchor).block,
        }
    }

    pub fn add_block(&mut self, name: &str) -> BlockId {
        self.func.add_block(name)
    }

    /// Add a block placed after the current one.
    pub fn add_block_here(&mut self, name: &str) -> BlockId {
        let current = self.current_block();
        self.func.add_block_after(current, name)
    }

    fn insert(&mut self, op: Op, ty: Ty) -> InstId {
        let (block, pos) = match self.cursor {
            Cursor::End(block) => (block, self.func.block(block).insts.len()),
            Cursor::Before(anchor) => {
                let block = self.func.inst(anchor).block;
                let insts = &self.func.block(block).insts;
                let pos = insts.iter().position(|&i| i == anchor).unwrap_or(insts.len());
                (block, pos)
            }
        };
        let id = self.func.push_inst(Inst {
            op,
            ty,
            block,
            name: None,
        });
        self.func.block_insts_mut(block).insert(pos, id);
        id
    }

    /// Attach a debug name to an instruction result.
    pub fn set_name(&mut self, v: Val, name: &str) {
        if let Val::Inst(id) = v {
            self.func.inst_mut(id).name = Some(name.to_string());
        }
    }

    pub fn ty_of(&self, v: Val) -> Ty {
        self.func.ty_of(v)
    }

    // Constants.

    pub fn int(&mut self, ty: Scalar, value: i64) -> Val {
        self.func.constant(Const::Int {
            ty,
            bits: (value as u64) & width_mask(ty.bits()),
        })
    }

    pub fn i1(&mut self, value: bool) -> Val {
        self.int(Scalar::I1, value as i64)
    }

    pub fn i32(&mut self, value: i32) -> Val {
        self.int(Scalar::I32, value as i64)
    }

    pub fn i64(&mut self, value: i64) -> Val {
        self.int(Scalar::I64, value)
    }

    pub fn float(&mut self, ty: Scalar, value: f64) -> Val {
        let bits = match ty {
            Scalar::F16 => half::f16::from_f64(value).to_bits() as u64,
            Scalar::F32 => (value as f32).to_bits() as u64,
            _ => value.to_bits(),
        };
        self.func.constant(Const::Float { ty, bits })
    }

    pub fn f32(&mut self, value: f32) -> Val {
        self.float(Scalar::F32, value as f64)
    }

    pub fn undef(&mut self, ty: Ty) -> Val {
        self.func.constant(Const::Undef(ty))
    }

    /// Zero of a scalar type.
    pub fn zero(&mut self, ty: Scalar) -> Val {
        if ty.is_float() {
            self.float(ty, 0.0)
        } else {
            self.int(ty, 0)
        }
    }

    fn const_int(&self, v: Val) -> Option<i64> {
        self.func.as_const_int(v)
    }

    // Arithmetic.

    pub fn binary(&mut self, op: BinOp, lhs: Val, rhs: Val) -> Val {
        if let Some(folded) = self.fold_binary(op, lhs, rhs) {
            return folded;
        }
        let ty = self.func.ty_of(lhs);
        Val::Inst(self.insert(Op::Binary { op, lhs, rhs }, ty))
    }

    fn fold_binary(&mut self, op: BinOp, lhs: Val, rhs: Val) -> Option<Val> {
        let Ty::Scalar(ty) = self.func.ty_of(lhs) else {
            return None;
        };
        if !ty.is_int() {
            return None;
        }
        let width = ty.bits();
        let mask = width_mask(width);
        let (a, b) = (self.const_int(lhs), self.const_int(rhs));
        match (op, a, b) {
            (BinOp::Add, Some(a), Some(b)) => Some(self.int(ty, a.wrapping_add(b))),
            (BinOp::Add, _, Some(0)) => Some(lhs),
            (BinOp::Add, Some(0), _) => Some(rhs),
            (BinOp::Add, Some(_), None) => Some(self.binary(BinOp::Add, rhs, lhs)),
            (BinOp::Add, None, Some(c2)) => {
                // (x + c1) + c2 => x + (c1 + c2)
                let inner = lhs.as_inst().map(|id| self.func.inst(id).op.clone());
                if let Some(Op::Binary {
                    op: BinOp::Add,
                    lhs: x,
                    rhs: c1,
                }) = inner
                {
                    if let Some(c1) = self.const_int(c1) {
                        let c = self.int(ty, c1.wrapping_add(c2));
                        return Some(self.binary(BinOp::Add, x, c));
                    }
                }
                None
            }
            (BinOp::Sub, Some(a), Some(b)) => Some(self.int(ty, a.wrapping_sub(b))),
            (BinOp::Sub, _, Some(0)) => Some(lhs),
            (BinOp::Mul, Some(a), Some(b)) => Some(self.int(ty, a.wrapping_mul(b))),
            (BinOp::Mul, Some(0), _) | (BinOp::Mul, _, Some(0)) => Some(self.int(ty, 0)),
            (BinOp::Mul, _, Some(1)) => Some(lhs),
            (BinOp::Mul, Some(1), _) => Some(rhs),
            (BinOp::UDiv, Some(a), Some(b)) if b != 0 => {
                let (a, b) = ((a as u64) & mask, (b as u64) & mask);
                Some(self.int(ty, (a / b) as i64))
            }
            (BinOp::UDiv, _, Some(1)) => Some(lhs),
            (BinOp::URem, Some(a), Some(b)) if b != 0 => {
                let (a, b) = ((a as u64) & mask, (b as u64) & mask);
                Some(self.int(ty, (a % b) as i64))
            }
            (BinOp::And, Some(a), Some(b)) => Some(self.int(ty, a & b)),
            (BinOp::Or, Some(a), Some(b)) => Some(self.int(ty, a | b)),
            (BinOp::Xor, Some(a), Some(b)) => Some(self.int(ty, a ^ b)),
            (BinOp::Xor, _, Some(0)) => Some(lhs),
            (BinOp::Shl, Some(a), Some(b)) if (b as u64) < width as u64 => {
                Some(self.int(ty, a << b))
            }
            (BinOp::LShr, Some(a), Some(b)) if (b as u64) < width as u64 => {
                Some(self.int(ty, (((a as u64) & mask) >> b) as i64))
            }
            _ => None,
        }
    }

    pub fn add(&mut self, lhs: Val, rhs: Val) -> Val {
        self.binary(BinOp::Add, lhs, rhs)
    }

    pub fn sub(&mut self, lhs: Val, rhs: Val) -> Val {
        self.binary(BinOp::Sub, lhs, rhs)
    }

    pub fn mul(&mut self, lhs: Val, rhs: Val) -> Val {
        self.binary(BinOp::Mul, lhs, rhs)
    }

    pub fn udiv(&mut self, lhs: Val, rhs: Val) -> Val {
        self.binary(BinOp::UDiv, lhs, rhs)
    }

    pub fn urem(&mut self, lhs: Val, rhs: Val) -> Val {
        self.binary(BinOp::URem, lhs, rhs)
    }

    pub fn and(&mut self, lhs: Val, rhs: Val) -> Val {
        self.binary(BinOp::And, lhs, rhs)
    }

    pub fn or(&mut self, lhs: Val, rhs: Val) -> Val {
        self.binary(BinOp::Or, lhs, rhs)
    }

    pub fn xor(&mut self, lhs: Val, rhs: Val) -> Val {
        self.binary(BinOp::Xor, lhs, rhs)
    }

    pub fn shl(&mut self, lhs: Val, rhs: Val) -> Val {
        self.binary(BinOp::Shl, lhs, rhs)
    }

    pub fn lshr(&mut self, lhs: Val, rhs: Val) -> Val {
        self.binary(BinOp::LShr, lhs, rhs)
    }

    /// `0 - v`.
    pub fn neg(&mut self, v: Val) -> Val {
        let ty = self.ty_of(v).elem().unwrap_or(Scalar::I32);
        let zero = self.int(ty, 0);
        self.sub(zero, v)
    }

    /// `lhs + rhs` on i32 with a constant right-hand side.
    pub fn add_i32(&mut self, lhs: Val, rhs: i32) -> Val {
        let c = self.i32(rhs);
        self.add(lhs, c)
    }

    pub fn mul_i32(&mut self, lhs: Val, rhs: i32) -> Val {
        let c = self.i32(rhs);
        self.mul(lhs, c)
    }

    pub fn icmp(&mut self, pred: IntPredicate, lhs: Val, rhs: Val) -> Val {
        Val::Inst(self.insert(Op::ICmp { pred, lhs, rhs }, Ty::I1))
    }

    pub fn fcmp(&mut self, pred: FloatPredicate, lhs: Val, rhs: Val) -> Val {
        Val::Inst(self.insert(Op::FCmp { pred, lhs, rhs }, Ty::I1))
    }

    pub fn select(&mut self, cond: Val, on_true: Val, on_false: Val) -> Val {
        match self.const_int(cond) {
            Some(0) => return on_false,
            Some(_) => return on_true,
            None => {}
        }
        let ty = self.func.ty_of(on_true);
        Val::Inst(self.insert(
            Op::Select {
                cond,
                on_true,
                on_false,
            },
            ty,
        ))
    }

    pub fn cast(&mut self, op: CastOp, arg: Val, ty: Ty) -> Val {
        let from = self.func.ty_of(arg);
        if from == ty && matches!(op, CastOp::BitCast | CastOp::AddrSpaceCast) {
            return arg;
        }
        if let (Some(c), Ty::Scalar(to)) = (self.func.as_const(arg).copied(), ty) {
            if let Const::Int { ty: src, bits } = c {
                match op {
                    CastOp::Trunc | CastOp::ZExt => return self.int(to, bits as i64),
                    CastOp::SExt => return self.int(to, sign_extend(bits, src.bits())),
                    _ => {}
                }
            }
        }
        Val::Inst(self.insert(Op::Cast { op, arg }, ty))
    }

    pub fn bitcast(&mut self, arg: Val, ty: Ty) -> Val {
        self.cast(CastOp::BitCast, arg, ty)
    }

    // Memory.

    /// `ptr + index * size_of(elem)`.
    pub fn gep(&mut self, elem: Scalar, ptr: Val, index: Val) -> Val {
        if let Some(c2) = self.const_int(index) {
            if c2 == 0 {
                return ptr;
            }
            let inner = ptr.as_inst().map(|id| self.func.inst(id).op.clone());
            if let Some(Op::Gep {
                elem: e,
                ptr: base,
                index: i1,
            }) = inner
            {
                if let (true, Some(c1)) = (e == elem, self.const_int(i1)) {
                    let ity = self.ty_of(index).elem().unwrap_or(Scalar::I32);
                    let c = self.int(ity, c1.wrapping_add(c2));
                    return self.gep(elem, base, c);
                }
            }
        } else if let Some(Op::Binary {
            op: BinOp::Add,
            lhs: x,
            rhs: c,
        }) = index.as_inst().map(|id| self.func.inst(id).op.clone())
        {
            if self.const_int(c).is_some() {
                let inner = self.gep(elem, ptr, x);
                return self.gep(elem, inner, c);
            }
        }
        let ty = self.func.ty_of(ptr);
        Val::Inst(self.insert(Op::Gep { elem, ptr, index }, ty))
    }

    /// Split `ptr` into a base pointer and a constant byte offset.
    pub fn split_const_offset(&self, ptr: Val) -> (Val, i64) {
        if let Some(id) = ptr.as_inst() {
            if let Op::Gep { elem, ptr: base, index } = self.func.inst(id).op {
                if let Some(c) = self.const_int(index) {
                    return (base, c * elem.bytes() as i64);
                }
            }
        }
        (ptr, 0)
    }

    pub fn load(&mut self, ty: Ty, ptr: Val) -> Val {
        Val::Inst(self.insert(Op::Load { ptr }, ty))
    }

    pub fn store(&mut self, ptr: Val, value: Val) -> InstId {
        self.insert(Op::Store { ptr, value }, Ty::Void)
    }

    pub fn extract(&mut self, vector: Val, index: u32) -> Val {
        let ty = match self.func.ty_of(vector) {
            Ty::Vector(s, _) => Ty::Scalar(s),
            other => other,
        };
        Val::Inst(self.insert(Op::ExtractElement { vector, index }, ty))
    }

    pub fn insert_element(&mut self, vector: Val, element: Val, index: u32) -> Val {
        let ty = self.func.ty_of(vector);
        Val::Inst(self.insert(
            Op::InsertElement {
                vector,
                element,
                index,
            },
            ty,
        ))
    }

    /// Pack scalars into a vector; a single element stays scalar.
    pub fn pack(&mut self, elems: &[Val]) -> Val {
        if elems.len() == 1 {
            return elems[0];
        }
        let elem = self.ty_of(elems[0]).elem().unwrap_or(Scalar::I32);
        let mut vector = self.undef(Ty::Vector(elem, elems.len() as u32));
        for (i, &e) in elems.iter().enumerate() {
            vector = self.insert_element(vector, e, i as u32);
        }
        vector
    }

    pub fn call(&mut self, intrinsic: Intrinsic, args: Vec<Val>, ty: Ty) -> Val {
        Val::Inst(self.insert(Op::Call { intrinsic, args }, ty))
    }

    // Control flow.

    /// New phi at the head of the current block.
    pub fn phi(&mut self, ty: Ty) -> Val {
        let block = self.current_block();
        self.phi_in(block, ty)
    }

    /// New phi at the head of `block`, after existing phis.
    pub fn phi_in(&mut self, block: BlockId, ty: Ty) -> Val {
        let pos = self.func.phis(block).len();
        let id = self.func.push_inst(Inst {
            op: Op::Phi {
                incoming: Vec::new(),
            },
            ty,
            block,
            name: None,
        });
        self.func.block_insts_mut(block).insert(pos, id);
        Val::Inst(id)
    }

    pub fn br(&mut self, dest: BlockId) -> InstId {
        self.insert(Op::Br { dest }, Ty::Void)
    }

    pub fn cond_br(&mut self, cond: Val, on_true: BlockId, on_false: BlockId) -> InstId {
        self.insert(
            Op::CondBr {
                cond,
                on_true,
                on_false,
            },
            Ty::Void,
        )
    }

    pub fn ret(&mut self, value: Option<Val>) -> InstId {
        self.insert(Op::Ret { value }, Ty::Void)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> Builder {
        let params = vec![
            Param {
                name: "p".to_string(),
                ty: Ty::ptr(AddrSpace::Global),
                attrs: vec![],
            },
            Param {
                name: "n".to_string(),
                ty: Ty::I32,
                attrs: vec![],
            },
        ];
        Builder::new(Function::new("f", params, Ty::Void), "entry")
    }

    #[test]
    fn test_constant_folding() {
        let mut b = builder();
        let two = b.i32(2);
        let three = b.i32(3);
        let five = b.add(two, three);
        assert_eq!(b.func().as_const_int(five), Some(5));
        let n = Val::Param(1);
        let zero = b.i32(0);
        assert_eq!(b.add(n, zero), n);
        let one = b.i32(1);
        assert_eq!(b.mul(n, one), n);
        assert_eq!(b.func().num_insts(), 0);
    }

    #[test]
    fn test_add_reassociates_constants() {
        let mut b = builder();
        let n = Val::Param(1);
        let x = b.add_i32(n, 4);
        let y = b.add_i32(x, 3);
        let Some(id) = y.as_inst() else {
            panic!("expected instruction");
        };
        match b.func().inst(id).op {
            Op::Binary { op: BinOp::Add, lhs, rhs } => {
                assert_eq!(lhs, n);
                assert_eq!(b.func().as_const_int(rhs), Some(7));
            }
            ref other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_gep_constant_offsets_fold_into_immediates() {
        let mut b = builder();
        let n = Val::Param(1);
        let idx = b.add_i32(n, 4);
        let ptr = b.gep(Scalar::F32, Val::Param(0), idx);
        let (base, offset) = b.split_const_offset(ptr);
        assert_eq!(offset, 16);
        let Some(id) = base.as_inst() else {
            panic!("expected gep base");
        };
        assert!(matches!(b.func().inst(id).op, Op::Gep { index, .. } if index == n));
        let four = b.i32(4);
        let again = b.gep(Scalar::F32, ptr, four);
        assert_eq!(b.split_const_offset(again), (base, 32));
    }

    #[test]
    fn test_cursor_stack_restores_position() {
        let mut b = builder();
        let entry = b.current_block();
        let exit = b.add_block("exit");
        let term = b.br(exit);
        b.position_at_end(exit);
        b.push_cursor(Cursor::Before(term));
        let v = b.add_i32(Val::Param(1), 1);
        b.pop_cursor().unwrap();
        assert_eq!(b.cursor(), Cursor::End(exit));
        let insts = &b.func().block(entry).insts;
        assert_eq!(insts.len(), 2);
        assert_eq!(Val::Inst(insts[0]), v);
        assert!(b.pop_cursor().is_err());
    }

    #[test]
    fn test_phis_stay_grouped_at_block_head() {
        let mut b = builder();
        let body = b.add_block("body");
        b.position_at_end(body);
        let x = b.add_i32(Val::Param(1), 1);
        let p1 = b.phi(Ty::I32);
        let p2 = b.phi(Ty::I32);
        let insts = b.func().block(body).insts.clone();
        assert_eq!(
            insts.iter().map(|&i| Val::Inst(i)).collect::<Vec<_>>(),
            vec![p1, p2, x]
        );
    }

    #[test]
    fn test_split_block_rewires_successor_phis() {
        let mut b = builder();
        let entry = b.current_block();
        let join = b.add_block("join");
        let term = b.br(join);
        b.position_at_end(join);
        let phi = b.phi(Ty::I32);
        let one = b.i32(1);
        b.func_mut().add_incoming(phi, one, entry).unwrap();
        b.ret(None);

        let tail = b.func_mut().split_block_before(term, "tail");
        assert_eq!(b.func().inst(term).block, tail);
        assert_eq!(b.func().predecessors(join), vec![tail]);
        let Some(id) = phi.as_inst() else {
            panic!("phi is an instruction");
        };
        match &b.func().inst(id).op {
            Op::Phi { incoming } => assert_eq!(incoming, &vec![(one, tail)]),
            other => panic!("unexpected {other:?}"),
        }
    }
}
