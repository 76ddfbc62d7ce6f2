// A reference interpreter for the low-level IR. It runs one function over a grid of blocks,
// one block at a time. Inside a block every thread has its own registers and program
// counter and runs on its own until it reaches a collective operation (a barrier or a warp
// shuffle) or returns. Collectives complete once every live participant waits on them:
// all live lanes of the warp for a shuffle, all live threads of the block for a barrier.
// When some threads wait and none can proceed the run fails with a deadlock, which is how
// tests catch missing or misplaced barriers. Asynchronous copies snapshot their source at
// issue time and land in shared memory when a wait_group retires their group. Values of
// watched instructions are recorded per thread so tests can observe loop-carried state.

//! Execution of generated kernels.

mod error;
mod memory;
mod value;

pub use error::{SimError, SimResult};
pub use memory::{Memory, GLOBAL_BASE, SHARED_BASE};
pub use value::{from_bytes, to_bytes, Value};

use crate::lir::{BlockId, Function, InstId, Intrinsic, Module, Op, Scalar, Ty, Val};
use hashbrown::HashSet;
use std::collections::VecDeque;
use value::{binary, bits_of, cast, fcmp, float_of, icmp, map2, rmw};

const WARP_SIZE: usize = 32;

/// Default per-thread instruction budget.
pub const DEFAULT_STEP_LIMIT: u64 = 5_000_000;

/// One recorded value of a watched instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watched {
    pub block: [u32; 3],
    pub thread: u32,
    pub inst: InstId,
    pub value: Value,
}

/// A copy issued by `cp.async`, waiting for its group to retire.
#[derive(Debug, Clone)]
struct PendingCopy {
    dst: u64,
    data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
enum State {
    Ready,
    AtBarrier,
    AtShuffle { inst: InstId, value: Value, mask: u32 },
    Done,
}

#[derive(Debug)]
struct Thread {
    id: u32,
    regs: Vec<Option<Value>>,
    block: BlockId,
    pos: usize,
    state: State,
    uncommitted: Vec<PendingCopy>,
    groups: VecDeque<Vec<PendingCopy>>,
    steps: u64,
}

impl Thread {
    fn new(id: u32, entry: BlockId, num_insts: usize) -> Self {
        Self {
            id,
            regs: vec![None; num_insts],
            block: entry,
            pos: 0,
            state: State::Ready,
            uncommitted: Vec::new(),
            groups: VecDeque::new(),
            steps: 0,
        }
    }

    fn set(&mut self, inst: InstId, value: Value) {
        let i = inst.0 as usize;
        if i >= self.regs.len() {
            self.regs.resize(i + 1, None);
        }
        self.regs[i] = Some(value);
    }

    fn is_live(&self) -> bool {
        self.state != State::Done
    }
}

/// Interpreter over a global memory shared by every launch.
pub struct Simulator {
    pub memory: Memory,
    step_limit: u64,
    watch: HashSet<InstId>,
    trace: Vec<Watched>,
    /// Address and size of each constant-memory array, by global index.
    globals: Vec<(u64, u64)>,
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Simulator {
    pub fn new() -> Self {
        Self {
            memory: Memory::new(),
            step_limit: DEFAULT_STEP_LIMIT,
            watch: HashSet::new(),
            trace: Vec::new(),
            globals: Vec::new(),
        }
    }

    pub fn with_step_limit(mut self, limit: u64) -> Self {
        self.step_limit = limit;
        self
    }

    pub fn alloc(&mut self, bytes: usize) -> u64 {
        self.memory.alloc(bytes)
    }

    /// Record every value `v` takes.
    pub fn watch(&mut self, v: Val) {
        if let Val::Inst(id) = v {
            self.watch.insert(id);
        }
    }

    /// Values `v` took in `thread` of block `block`, in execution order.
    pub fn watched(&self, v: Val, block: [u32; 3], thread: u32) -> Vec<Value> {
        self.trace
            .iter()
            .filter(|w| Val::Inst(w.inst) == v && w.block == block && w.thread == thread)
            .map(|w| w.value.clone())
            .collect()
    }

    /// Addresses of the constant arrays of `module`, allocated zeroed on first
    /// use. Arrays keep their contents across launches so the host can fill
    /// them beforehand.
    pub fn global_addresses(&mut self, module: &Module) -> Vec<u64> {
        for (index, global) in module.globals.iter().enumerate() {
            let size = global.size_bytes();
            match self.globals.get(index) {
                Some(&(_, have)) if have == size => {}
                _ => {
                    let address = self.memory.alloc(size as usize);
                    if index < self.globals.len() {
                        self.globals[index] = (address, size);
                    } else {
                        self.globals.push((address, size));
                    }
                }
            }
        }
        self.globals
            .iter()
            .take(module.globals.len())
            .map(|&(address, _)| address)
            .collect()
    }

    /// Run `name` from `module` over `grid` blocks.
    pub fn launch(
        &mut self,
        module: &Module,
        name: &str,
        grid: [u32; 3],
        args: &[Value],
    ) -> SimResult<()> {
        let func = module
            .function(name)
            .ok_or_else(|| SimError::unsupported(format!("missing function @{name}")))?;
        self.global_addresses(module);
        self.run(func, module.shared_bytes, grid, args)
    }

    pub fn run(
        &mut self,
        func: &Function,
        shared_bytes: u32,
        grid: [u32; 3],
        args: &[Value],
    ) -> SimResult<()> {
        let implicit = func.params.len().checked_sub(args.len());
        let grid_params = match implicit {
            Some(0) => false,
            Some(3) if !func.is_kernel => true,
            _ => {
                return Err(SimError::unsupported(format!(
                    "call of @{} with {} arguments for {} parameters",
                    func.name,
                    args.len(),
                    func.params.len()
                )))
            }
        };
        log::debug!(
            "simulating @{} over {grid:?} blocks of {} threads",
            func.name,
            func.max_threads.unwrap_or(1)
        );
        for z in 0..grid[2] {
            for y in 0..grid[1] {
                for x in 0..grid[0] {
                    let block = [x, y, z];
                    let mut params = args.to_vec();
                    if grid_params {
                        params.extend(block.iter().map(|&i| Value::i32(i as i32)));
                    }
                    self.memory.reset_shared(shared_bytes);
                    let cta = Cta {
                        func,
                        args: &params,
                        block,
                        grid,
                    };
                    self.run_block(&cta)?;
                }
            }
        }
        Ok(())
    }

    fn run_block(&mut self, cta: &Cta<'_>) -> SimResult<()> {
        let func = cta.func;
        let entry = func
            .entry()
            .ok_or_else(|| SimError::unsupported(format!("@{} has no body", func.name)))?;
        let n = func.max_threads.unwrap_or(1) as usize;
        let arena = func.num_insts().max(1);
        let mut threads: Vec<Thread> = (0..n)
            .map(|t| Thread::new(t as u32, entry, arena))
            .collect();

        loop {
            let mut progressed = false;
            for t in threads.iter_mut() {
                while t.state == State::Ready {
                    self.step(cta, t)?;
                    progressed = true;
                }
            }
            if threads.iter().all(|t| !t.is_live()) {
                return Ok(());
            }
            for warp in threads.chunks_mut(WARP_SIZE) {
                progressed |= self.resolve_shuffle(cta, warp);
            }
            let live: Vec<&Thread> = threads.iter().filter(|t| t.is_live()).collect();
            if live.iter().all(|t| t.state == State::AtBarrier) {
                for t in threads.iter_mut().filter(|t| t.state == State::AtBarrier) {
                    t.state = State::Ready;
                    t.pos += 1;
                }
                progressed = true;
            }
            if !progressed {
                return Err(SimError::Deadlock {
                    reason: describe_waits(func, &threads),
                });
            }
        }
    }

    fn operand(&self, cta: &Cta<'_>, t: &Thread, v: Val) -> SimResult<Value> {
        match v {
            Val::Inst(id) => t
                .regs
                .get(id.0 as usize)
                .and_then(Option::clone)
                .ok_or(SimError::UseBeforeDef {
                    inst: id.0,
                    thread: t.id,
                }),
            Val::Param(i) => cta
                .args
                .get(i as usize)
                .cloned()
                .ok_or_else(|| SimError::unsupported(format!("parameter {i}"))),
            Val::Const(id) => Ok(Value::constant(cta.func.const_value(id))),
            Val::SharedBase => Ok(Value::ptr(SHARED_BASE)),
            Val::Global(index) => self
                .globals
                .get(index as usize)
                .map(|&(address, _)| Value::ptr(address))
                .ok_or_else(|| SimError::unsupported(format!("constant array @const{index}"))),
        }
    }

    /// Complete the shuffle of `warp` if every live lane waits on the same one.
    fn resolve_shuffle(&mut self, cta: &Cta<'_>, warp: &mut [Thread]) -> bool {
        let mut waiting = warp.iter().filter(|t| t.is_live()).map(|t| match &t.state {
            State::AtShuffle { inst, .. } => Some(*inst),
            _ => None,
        });
        let Some(Some(first)) = waiting.next() else {
            return false;
        };
        if !waiting.all(|w| w == Some(first)) {
            return false;
        }

        let sent: Vec<Option<Value>> = warp
            .iter()
            .map(|t| match &t.state {
                State::AtShuffle { value, .. } => Some(value.clone()),
                _ => None,
            })
            .collect();
        for (lane, t) in warp.iter_mut().enumerate() {
            let State::AtShuffle { inst, value, mask } = &t.state else {
                continue;
            };
            let src = lane ^ *mask as usize;
            let got = sent.get(src).cloned().flatten().unwrap_or_else(|| value.clone());
            let inst = *inst;
            self.define(cta, t, inst, got);
            t.state = State::Ready;
            t.pos += 1;
        }
        true
    }

    fn define(&mut self, cta: &Cta<'_>, t: &mut Thread, inst: InstId, value: Value) {
        if self.watch.contains(&inst) {
            self.trace.push(Watched {
                block: cta.block,
                thread: t.id,
                inst,
                value: value.clone(),
            });
        }
        t.set(inst, value);
    }

    /// Move `t` to `dest`, assigning the phis of `dest` in parallel.
    fn jump(&mut self, cta: &Cta<'_>, t: &mut Thread, dest: BlockId) -> SimResult<()> {
        let func = cta.func;
        let from = t.block;
        let phis = func.phis(dest);
        let mut values = Vec::with_capacity(phis.len());
        for &phi in &phis {
            let Op::Phi { incoming } = &func.inst(phi).op else {
                continue;
            };
            let Some(&(v, _)) = incoming.iter().find(|&&(_, b)| b == from) else {
                return Err(SimError::MissingIncoming {
                    block: func.block(dest).name.clone(),
                    from: func.block(from).name.clone(),
                });
            };
            values.push(self.operand(cta, t, v)?);
        }
        for (&phi, value) in phis.iter().zip(values) {
            self.define(cta, t, phi, value);
        }
        t.block = dest;
        t.pos = phis.len();
        Ok(())
    }

    /// Execute one instruction of `t`.
    fn step(&mut self, cta: &Cta<'_>, t: &mut Thread) -> SimResult<()> {
        t.steps += 1;
        if t.steps > self.step_limit {
            return Err(SimError::StepLimit {
                thread: t.id,
                limit: self.step_limit,
            });
        }
        let func = cta.func;
        let Some(&id) = func.block(t.block).insts.get(t.pos) else {
            return Err(SimError::ub(format!(
                "fell off the end of block '{}'",
                func.block(t.block).name
            )));
        };
        let inst = func.inst(id);
        let ty = inst.ty;

        let result = match &inst.op {
            Op::Phi { .. } => {
                return Err(SimError::ub(format!(
                    "phi %{} after the head of its block",
                    id.0
                )))
            }
            Op::Binary { op, lhs, rhs } => {
                let a = self.operand(cta, t, *lhs)?;
                let b = self.operand(cta, t, *rhs)?;
                let elem = elem_of(ty)?;
                map2(&a, &b, ty, |x, y| binary(*op, elem, x, y))?
            }
            Op::ICmp { pred, lhs, rhs } => {
                let a = self.operand(cta, t, *lhs)?;
                let b = self.operand(cta, t, *rhs)?;
                let elem = elem_of(func.ty_of(*lhs))?;
                map2(&a, &b, ty, |x, y| Ok(icmp(*pred, elem, x, y) as u64))?
            }
            Op::FCmp { pred, lhs, rhs } => {
                let a = self.operand(cta, t, *lhs)?;
                let b = self.operand(cta, t, *rhs)?;
                let elem = elem_of(func.ty_of(*lhs))?;
                map2(&a, &b, ty, |x, y| Ok(fcmp(*pred, elem, x, y) as u64))?
            }
            Op::Cast { op, arg } => {
                let a = self.operand(cta, t, *arg)?;
                cast(*op, &a, func.ty_of(*arg), ty)?
            }
            Op::Select {
                cond,
                on_true,
                on_false,
            } => {
                let pick = if self.operand(cta, t, *cond)?.as_bool() {
                    on_true
                } else {
                    on_false
                };
                self.operand(cta, t, *pick)?
            }
            Op::Gep { elem, ptr, index } => {
                let base = self.operand(cta, t, *ptr)?.bits();
                let index_ty = elem_of(func.ty_of(*index))?;
                let i = crate::lir::sign_extend(self.operand(cta, t, *index)?.bits(), index_ty.bits());
                let offset = i.wrapping_mul(elem.bytes() as i64);
                Value::ptr(base.wrapping_add(offset as u64))
            }
            Op::Load { ptr } => {
                let address = self.operand(cta, t, *ptr)?.bits();
                let bytes = self.memory.read(address, byte_size(ty))?;
                from_bytes(bytes, ty)
            }
            Op::Store { ptr, value } => {
                let address = self.operand(cta, t, *ptr)?.bits();
                let v = self.operand(cta, t, *value)?;
                self.memory.write(address, &to_bytes(&v, func.ty_of(*value)))?;
                t.pos += 1;
                return Ok(());
            }
            Op::ExtractElement { vector, index } => {
                let v = self.operand(cta, t, *vector)?;
                let lane = v.lanes().get(*index as usize).copied().ok_or_else(|| {
                    SimError::ub(format!("lane {index} of a {}-lane vector", v.lanes().len()))
                })?;
                Value::Scalar(lane)
            }
            Op::InsertElement {
                vector,
                element,
                index,
            } => {
                let v = self.operand(cta, t, *vector)?;
                let e = self.operand(cta, t, *element)?.bits();
                let mut lanes = v.lanes().to_vec();
                let slot = lanes.get_mut(*index as usize).ok_or_else(|| {
                    SimError::ub(format!("insert into lane {index} out of range"))
                })?;
                *slot = e;
                Value::Vector(lanes)
            }
            Op::Call { intrinsic, args } => {
                match self.call(cta, t, id, *intrinsic, args, ty)? {
                    Some(v) => v,
                    None => return Ok(()),
                }
            }
            Op::Br { dest } => {
                self.jump(cta, t, *dest)?;
                return Ok(());
            }
            Op::CondBr {
                cond,
                on_true,
                on_false,
            } => {
                let dest = if self.operand(cta, t, *cond)?.as_bool() {
                    *on_true
                } else {
                    *on_false
                };
                self.jump(cta, t, dest)?;
                return Ok(());
            }
            Op::Ret { .. } => {
                t.state = State::Done;
                return Ok(());
            }
        };
        if ty != Ty::Void {
            self.define(cta, t, id, result);
        }
        t.pos += 1;
        Ok(())
    }

    /// Run an intrinsic. `None` means the thread now waits on a collective.
    fn call(
        &mut self,
        cta: &Cta<'_>,
        t: &mut Thread,
        id: InstId,
        intrinsic: Intrinsic,
        args: &[Val],
        ty: Ty,
    ) -> SimResult<Option<Value>> {
        let arg = |i: usize| -> SimResult<Value> {
            let v = args
                .get(i)
                .copied()
                .ok_or_else(|| SimError::ub(format!("{intrinsic:?} lacks operand {i}")))?;
            self.operand(cta, t, v)
        };
        let unary_float = |x: Value, f: fn(f64) -> f64| -> SimResult<Value> {
            let elem = elem_of(ty)?;
            Ok(Value::Scalar(bits_of(f(float_of(x.bits(), elem)), elem)))
        };

        let value = match intrinsic {
            Intrinsic::ThreadIdx(axis) => Value::i32(if axis == 0 { t.id as i32 } else { 0 }),
            Intrinsic::BlockIdx(axis) => Value::i32(cta.block[axis as usize % 3] as i32),
            Intrinsic::NumBlocks(axis) => Value::i32(cta.grid[axis as usize % 3] as i32),
            Intrinsic::Barrier => {
                t.state = State::AtBarrier;
                return Ok(None);
            }
            Intrinsic::ShflBfly => {
                let value = arg(0)?;
                let mask = arg(1)?.bits() as u32;
                t.state = State::AtShuffle {
                    inst: id,
                    value,
                    mask,
                };
                return Ok(None);
            }
            Intrinsic::MemFence => Value::Scalar(0),
            Intrinsic::Ex2 => unary_float(arg(0)?, f64::exp2)?,
            Intrinsic::Lg2 => unary_float(arg(0)?, f64::log2)?,
            Intrinsic::Sin => unary_float(arg(0)?, f64::sin)?,
            Intrinsic::Cos => unary_float(arg(0)?, f64::cos)?,
            Intrinsic::Sqrt => unary_float(arg(0)?, f64::sqrt)?,
            Intrinsic::MulHiU32 => {
                let a = arg(0)?.bits() & 0xffff_ffff;
                let b = arg(1)?.bits() & 0xffff_ffff;
                Value::Scalar((a * b) >> 32)
            }
            Intrinsic::CvtRnBf16F32 => {
                let x = arg(0)?.as_f32();
                Value::Scalar(half::bf16::from_f32(x).to_bits() as u64)
            }
            Intrinsic::Prmt(selector) => {
                let a = arg(0)?.bits() & 0xffff_ffff;
                let b = arg(1)?.bits() & 0xffff_ffff;
                Value::Scalar(permute_bytes(a | (b << 32), selector))
            }
            Intrinsic::LdGlobal {
                width,
                words,
                offset,
                has_other,
                ..
            } => {
                let pred = arg(0)?.as_bool();
                let address = arg(1)?.bits().wrapping_add(offset as u64);
                let len = (width * words / 8) as usize;
                if pred {
                    from_bytes(self.memory.read(address, len)?, ty)
                } else if has_other {
                    let word = Scalar::int(width)
                        .map(Ty::Scalar)
                        .ok_or_else(|| SimError::unsupported(format!("{width}-bit words")))?;
                    let mut bytes = Vec::with_capacity(len);
                    for w in 0..words as usize {
                        bytes.extend(to_bytes(&arg(2 + w)?, word));
                    }
                    from_bytes(&bytes, ty)
                } else {
                    Value::zero(ty)
                }
            }
            Intrinsic::AtomicCas { offset } => {
                let pred = arg(0)?.as_bool();
                let address = arg(1)?.bits().wrapping_add(offset as u64);
                let cmp = arg(2)?;
                let val = arg(3)?;
                if !pred {
                    return Ok(Some(Value::zero(ty)));
                }
                let old = from_bytes(self.memory.read(address, byte_size(ty))?, ty);
                if old.bits() == cmp.bits() {
                    self.memory.write(address, &to_bytes(&val, ty))?;
                }
                old
            }
            Intrinsic::AtomicRmw { op, offset, vec } => {
                let pred = arg(0)?.as_bool();
                let address = arg(1)?.bits().wrapping_add(offset as u64);
                let val = arg(2)?;
                if !pred {
                    return Ok(Some(Value::zero(ty)));
                }
                let elem = elem_of(ty)?;
                let size = elem.bytes() as u64;
                let mut olds = Vec::with_capacity(vec as usize);
                for (i, &x) in val.lanes().iter().enumerate().take(vec as usize) {
                    let at = address + i as u64 * size;
                    let old = from_bytes(self.memory.read(at, size as usize)?, Ty::Scalar(elem));
                    let new = rmw(op, elem, old.bits(), x);
                    self.memory
                        .write(at, &to_bytes(&Value::Scalar(new), Ty::Scalar(elem)))?;
                    olds.push(old.bits());
                }
                match ty {
                    Ty::Vector(..) => Value::Vector(olds),
                    _ => Value::Scalar(olds.first().copied().unwrap_or(0)),
                }
            }
            Intrinsic::StSharedPred => {
                let pred = arg(0)?.as_bool();
                let address = arg(1)?.bits();
                let val = arg(2)?;
                if pred {
                    let vty = args.get(2).map_or(Ty::Void, |&v| cta.func.ty_of(v));
                    self.memory.write(address, &to_bytes(&val, vty))?;
                }
                Value::Scalar(0)
            }
            Intrinsic::CpAsync {
                bytes,
                dst_offset,
                src_offset,
                ..
            } => {
                let dst = arg(0)?.bits().wrapping_add(dst_offset as u64);
                let src = arg(1)?.bits().wrapping_add(src_offset as u64);
                let src_size = (arg(2)?.bits() as u32).min(bytes) as usize;
                let mut data = if src_size > 0 {
                    self.memory.read(src, src_size)?.to_vec()
                } else {
                    Vec::new()
                };
                data.resize(bytes as usize, 0);
                t.uncommitted.push(PendingCopy { dst, data });
                Value::Scalar(0)
            }
            Intrinsic::CpAsyncCommitGroup => {
                let group = std::mem::take(&mut t.uncommitted);
                t.groups.push_back(group);
                Value::Scalar(0)
            }
            Intrinsic::CpAsyncWaitGroup(n) => {
                while t.groups.len() > n as usize {
                    if let Some(group) = t.groups.pop_front() {
                        for copy in group {
                            self.memory.write(copy.dst, &copy.data)?;
                        }
                    }
                }
                Value::Scalar(0)
            }
        };
        Ok(Some(value))
    }
}

/// Launch context of one block.
struct Cta<'f> {
    func: &'f Function,
    args: &'f [Value],
    block: [u32; 3],
    grid: [u32; 3],
}

fn elem_of(ty: Ty) -> SimResult<Scalar> {
    ty.elem()
        .ok_or_else(|| SimError::unsupported(format!("arithmetic on {ty}")))
}

fn byte_size(ty: Ty) -> usize {
    ty.elem().map_or(0, |e| (e.bytes() * ty.lanes()) as usize)
}

/// Bytes of `source` picked by the four selector nibbles of `prmt.b32`.
fn permute_bytes(source: u64, selector: u16) -> u64 {
    (0..4).fold(0, |out, i| {
        let sel = (selector >> (4 * i)) & 0xf;
        let mut byte = (source >> (8 * (sel & 7))) & 0xff;
        if sel & 8 != 0 {
            byte = if byte & 0x80 != 0 { 0xff } else { 0 };
        }
        out | (byte << (8 * i))
    })
}

fn describe_waits(func: &Function, threads: &[Thread]) -> String {
    let barrier = threads.iter().filter(|t| t.state == State::AtBarrier).count();
    let shuffle = threads
        .iter()
        .filter(|t| matches!(t.state, State::AtShuffle { .. }))
        .count();
    let done = threads.iter().filter(|t| !t.is_live()).count();
    format!(
        "@{}: {barrier} threads at a barrier, {shuffle} at a shuffle, {done} returned",
        func.name
    )
}

/// Instruction of `func` named `name`.
pub fn named_value(func: &Function, name: &str) -> Option<Val> {
    func.insts()
        .map(|(_, i)| i)
        .find(|&i| func.inst(i).name.as_deref() == Some(name))
        .map(Val::Inst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::{AddrSpace, Builder, CacheHint, Function, IntPredicate, Param};

    fn kernel(threads: u32) -> Builder {
        kernel_with(threads, Vec::new())
    }

    fn kernel_with(threads: u32, params: Vec<Param>) -> Builder {
        let mut func = Function::new("k", params, Ty::Void);
        func.is_kernel = true;
        func.max_threads = Some(threads);
        Builder::new(func, "entry")
    }

    #[test]
    fn test_barrier_releases_all_threads() {
        let mut b = kernel(64);
        b.call(Intrinsic::Barrier, vec![], Ty::Void);
        b.ret(None);
        let func = b.finish();
        let mut sim = Simulator::new();
        sim.run(&func, 0, [2, 1, 1], &[]).unwrap();
    }

    #[test]
    fn test_divergent_barrier_deadlocks() {
        let mut b = kernel(64);
        let tid = b.call(Intrinsic::ThreadIdx(0), vec![], Ty::I32);
        let zero = b.i32(0);
        let first = b.icmp(IntPredicate::Eq, tid, zero);
        let wait = b.add_block("wait");
        let exit = b.add_block("exit");
        b.cond_br(first, wait, exit);
        b.position_at_end(wait);
        b.call(Intrinsic::Barrier, vec![], Ty::Void);
        b.br(exit);
        b.position_at_end(exit);
        b.call(Intrinsic::Barrier, vec![], Ty::Void);
        b.ret(None);
        let func = b.finish();
        // every thread reaches some barrier, so the two are released together
        Simulator::new().run(&func, 0, [1, 1, 1], &[]).unwrap();

        let mut b = kernel(64);
        let tid = b.call(Intrinsic::ThreadIdx(0), vec![], Ty::I32);
        let zero = b.i32(0);
        let first = b.icmp(IntPredicate::Eq, tid, zero);
        let wait = b.add_block("wait");
        let exit = b.add_block("exit");
        b.cond_br(first, wait, exit);
        b.position_at_end(wait);
        let lanes = b.i32(1);
        b.call(Intrinsic::ShflBfly, vec![tid, lanes], Ty::I32);
        b.br(exit);
        b.position_at_end(exit);
        b.call(Intrinsic::Barrier, vec![], Ty::Void);
        b.ret(None);
        let func = b.finish();
        let err = Simulator::new().run(&func, 0, [1, 1, 1], &[]).unwrap_err();
        assert!(matches!(err, SimError::Deadlock { .. }), "{err}");
    }

    #[test]
    fn test_butterfly_shuffle_swaps_lanes() {
        let mut b = kernel(32);
        let tid = b.call(Intrinsic::ThreadIdx(0), vec![], Ty::I32);
        let mask = b.i32(3);
        let got = b.call(Intrinsic::ShflBfly, vec![tid, mask], Ty::I32);
        b.ret(None);
        let func = b.finish();
        let mut sim = Simulator::new();
        sim.watch(got);
        sim.run(&func, 0, [1, 1, 1], &[]).unwrap();
        assert_eq!(sim.watched(got, [0, 0, 0], 5), vec![Value::i32(6)]);
        assert_eq!(sim.watched(got, [0, 0, 0], 30), vec![Value::i32(29)]);
    }

    #[test]
    fn test_permute_picks_and_replicates_bytes() {
        let source = 0x8877_6655_4433_2211;
        assert_eq!(permute_bytes(source, 0x3210), 0x4433_2211);
        assert_eq!(permute_bytes(source, 0x7531), 0x8866_4422);
        assert_eq!(permute_bytes(0x0000_0000_0000_bbaa << 32, 0x5040), 0xbb00_aa00);
        assert_eq!(permute_bytes(0x80, 0x4448), 0xff);
    }

    #[test]
    fn test_use_before_def_is_reported() {
        let mut b = kernel(32);
        let entry = b.current_block();
        let other = b.add_block("other");
        b.position_at_end(other);
        let tid = b.call(Intrinsic::ThreadIdx(0), vec![], Ty::I32);
        b.ret(None);
        b.position_at_end(entry);
        let one = b.i32(1);
        b.add(tid, one);
        b.ret(None);
        let func = b.finish();
        let err = Simulator::new().run(&func, 0, [1, 1, 1], &[]).unwrap_err();
        assert!(matches!(err, SimError::UseBeforeDef { .. }));
    }

    #[test]
    fn test_async_copies_land_at_wait() {
        let params = vec![Param {
            name: "src".to_string(),
            ty: Ty::ptr(AddrSpace::Global),
            attrs: Vec::new(),
        }];
        let mut b = kernel_with(1, params);
        let src = Val::Param(0);
        let full = b.i32(8);
        let none = b.i32(0);
        let copy = |b: &mut Builder, size: Val, dst_offset: i64| {
            b.call(
                Intrinsic::CpAsync {
                    bytes: 8,
                    dst_offset,
                    src_offset: 0,
                    cache: CacheHint::Ca,
                },
                vec![Val::SharedBase, src, size],
                Ty::Void,
            );
        };
        copy(&mut b, full, 0);
        b.call(Intrinsic::CpAsyncCommitGroup, vec![], Ty::Void);
        let before = b.load(Ty::I32, Val::SharedBase);
        // masked off: nothing is read and the slot is zero-filled
        copy(&mut b, none, 8);
        b.call(Intrinsic::CpAsyncCommitGroup, vec![], Ty::Void);
        b.call(Intrinsic::CpAsyncWaitGroup(0), vec![], Ty::Void);
        let after = b.load(Ty::Vector(Scalar::I32, 4), Val::SharedBase);
        b.ret(None);
        let func = b.finish();

        let mut sim = Simulator::new();
        let buf = sim.alloc(8);
        sim.memory.write_i32s(buf, &[42, 43]).unwrap();
        sim.memory.reset_shared(16);
        sim.watch(before);
        sim.watch(after);
        sim.run(&func, 16, [1, 1, 1], &[Value::ptr(buf)]).unwrap();
        assert_eq!(sim.watched(before, [0, 0, 0], 0), vec![Value::i32(0)]);
        assert_eq!(
            sim.watched(after, [0, 0, 0], 0),
            vec![Value::Vector(vec![42, 43, 0, 0])]
        );
    }
}
