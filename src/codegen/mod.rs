// The code generator. Each tile IR function is lowered by one FunctionCodegen pass that walks
// a fixed sequence of phases: build the low-level signature, create every basic block up
// front, initialize the thread-to-element mapping of every layout the function uses, visit
// the body in program order, and finally wire loop-carried state (multi-buffered shared
// memory pointers and phi incoming edges) that could only be connected once every block had
// been emitted. Tile values are scalarized: a value owns one low-level value per coordinate
// its layout assigns to the current thread, kept in a write-once table keyed by coordinate
// tuples allocated in the session arena. The emitter dispatches on the closed tile
// instruction enum; layout conversions, reductions, atomics and async copies become explicit
// shared-memory protocols separated by target barriers.

//! Tile IR to low-level IR lowering.

mod atomic;
mod cast;
mod convert;
mod emit;
mod indices;
mod memory;
mod pending;
mod reduce;
mod shared;
pub mod values;

use crate::analysis::{Allocation, AllocationQuery, LayoutId, LayoutQuery};
use crate::core::{CodegenConfig, CompilationSession, CompileError, CompileResult, SessionStats};
use crate::lir::{self, verify, AddrSpace, Builder, Cursor, Param, ParamAttr, Scalar, Ty, Val};
use crate::target::{Target, HOST_GRID_PARAMS};
use crate::tile_ir::{self as tir, Attribute, FuncId, Inst, Module, ParsedModule, ValueId, ValueKind};
use bumpalo::Bump;
use hashbrown::{HashMap, HashSet};

use indices::{Axis, AxisKey};
use pending::PendingEdge;
use shared::BufferState;
pub use values::{Coord, ValueTable};

/// Result of compiling a module.
#[derive(Debug, Clone)]
pub struct Compilation {
    pub module: lir::Module,
    pub stats: SessionStats,
}

/// Lower a parsed module for `target`.
pub fn compile(
    parsed: &ParsedModule,
    target: &dyn Target,
    config: &CodegenConfig,
) -> CompileResult<Compilation> {
    compile_module(&parsed.module, &parsed.layouts, target, config)
}

/// Lower `module` with an explicit layout assignment.
pub fn compile_module(
    module: &Module,
    layouts: &dyn LayoutQuery,
    target: &dyn Target,
    config: &CodegenConfig,
) -> CompileResult<Compilation> {
    for id in layouts.layout_ids() {
        layouts.layout(id).validate()?;
    }
    let alloc = Allocation::plan(module, layouts)?;
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let generator = Generator::new(module, layouts, &alloc, target, config, &session);
    let module = generator.generate()?;
    Ok(Compilation {
        module,
        stats: session.stats(),
    })
}

/// Module driver: lowers every function with a fresh [`FunctionCodegen`].
pub struct Generator<'a, 'arena> {
    module: &'a Module,
    layouts: &'a dyn LayoutQuery,
    alloc: &'a dyn AllocationQuery,
    target: &'a dyn Target,
    config: &'a CodegenConfig,
    session: &'a CompilationSession<'arena>,
}

impl<'a, 'arena> Generator<'a, 'arena> {
    pub fn new(
        module: &'a Module,
        layouts: &'a dyn LayoutQuery,
        alloc: &'a dyn AllocationQuery,
        target: &'a dyn Target,
        config: &'a CodegenConfig,
        session: &'a CompilationSession<'arena>,
    ) -> Self {
        Self {
            module,
            layouts,
            alloc,
            target,
            config,
            session,
        }
    }

    pub fn generate(&self) -> CompileResult<lir::Module> {
        let mut out = lir::Module::new(self.module.name.clone(), self.target.name());
        if self.target.is_gpu() {
            out.shared_bytes = self.alloc.allocated_size();
            self.session.record_shared_bytes(out.shared_bytes);
        }
        for id in self.module.const_arrays() {
            let value = self.module.value(id);
            let (Some(elem), Some(&Inst::AllocConst { size })) =
                (value.ty.scalar.pointee(), value.inst())
            else {
                continue;
            };
            out.globals.push(lir::Global {
                elem: values::lir_scalar(elem),
                count: size,
            });
        }
        for (id, _) in self.module.functions() {
            out.functions.push(self.generate_function(id)?);
        }
        Ok(out)
    }

    /// Lower the function called `name`.
    pub fn generate_named(&self, name: &str) -> CompileResult<lir::Function> {
        let id = self
            .module
            .function_by_name(name)
            .ok_or_else(|| CompileError::FunctionNotFound {
                name: name.to_string(),
            })?;
        self.generate_function(id)
    }

    fn generate_function(&self, id: FuncId) -> CompileResult<lir::Function> {
        let name = &self.module.function(id).name;
        log::info!(
            "lowering @{name} for {} ({} warps)",
            self.target.name(),
            self.config.num_warps
        );
        let func = FunctionCodegen::new(
            self.module,
            self.layouts,
            self.alloc,
            self.target,
            self.config,
            self.session,
            id,
        )?
        .run()?;
        if self.config.verify {
            verify::verify_function(&func)?;
        }
        self.session.record_function_compiled(name, func.num_insts());
        Ok(func)
    }
}

/// Lowering progress of one function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Created,
    SignatureBuilt,
    BlocksAllocated,
    LayoutsInitialized,
    BodyVisited,
    Finalized,
}

/// Lowering state of one function.
pub struct FunctionCodegen<'a, 'arena> {
    module: &'a Module,
    layouts: &'a dyn LayoutQuery,
    alloc: &'a dyn AllocationQuery,
    target: &'a dyn Target,
    config: &'a CodegenConfig,
    session: &'a CompilationSession<'arena>,
    func: FuncId,
    phase: Phase,
    b: Builder,

    /// First and last low-level block of every tile block. They differ once
    /// lowering splits a block.
    block_entry: HashMap<tir::BlockId, lir::BlockId>,
    block_exit: HashMap<tir::BlockId, lir::BlockId>,

    tid: Option<Val>,
    axes: HashMap<(LayoutId, usize), Axis>,
    axis_cache: HashMap<AxisKey, Axis>,
    coord_lists: HashMap<LayoutId, &'arena [Coord<'arena>]>,
    idxs: HashMap<ValueId, &'arena [Coord<'arena>]>,
    values: ValueTable<'arena>,

    buffers: HashMap<LayoutId, BufferState>,
    /// Shared memory pointer of every value with a shared layout.
    shmems: HashMap<ValueId, Val>,
    swizzled: HashMap<(LayoutId, Coord<'arena>), Val>,

    seen: HashSet<ValueId>,
    pending: Vec<PendingEdge>,
}

impl<'a, 'arena> FunctionCodegen<'a, 'arena> {
    pub fn new(
        module: &'a Module,
        layouts: &'a dyn LayoutQuery,
        alloc: &'a dyn AllocationQuery,
        target: &'a dyn Target,
        config: &'a CodegenConfig,
        session: &'a CompilationSession<'arena>,
        func: FuncId,
    ) -> CompileResult<Self> {
        let f = module.function(func);
        let entry = f.entry().ok_or_else(|| {
            CompileError::internal(format!("function @{} has no blocks", f.name))
        })?;
        let shell = lir::Function::new(f.name.clone(), Vec::new(), Ty::Void);
        let b = Builder::new(shell, &module.block(entry).name);
        Ok(Self {
            module,
            layouts,
            alloc,
            target,
            config,
            session,
            func,
            phase: Phase::Created,
            b,
            block_entry: HashMap::new(),
            block_exit: HashMap::new(),
            tid: None,
            axes: HashMap::new(),
            axis_cache: HashMap::new(),
            coord_lists: HashMap::new(),
            idxs: HashMap::new(),
            values: ValueTable::new(),
            buffers: HashMap::new(),
            shmems: HashMap::new(),
            swizzled: HashMap::new(),
            seen: HashSet::new(),
            pending: Vec::new(),
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Run every phase and return the finished function.
    pub fn run(mut self) -> CompileResult<lir::Function> {
        self.build_signature()?;
        self.allocate_blocks()?;
        self.init_layouts()?;
        self.visit_body()?;
        self.finalize()?;
        self.into_function()
    }

    pub fn into_function(self) -> CompileResult<lir::Function> {
        self.expect_phase(Phase::Finalized, "into_function")?;
        Ok(self.b.finish())
    }

    fn expect_phase(&self, expected: Phase, step: &str) -> CompileResult<()> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(CompileError::internal(format!(
                "{step} needs phase {expected:?} but @{} is in {:?}",
                self.module.function(self.func).name,
                self.phase
            )))
        }
    }

    /// Threads cooperating on one program instance.
    fn num_threads(&self) -> u32 {
        if self.target.is_gpu() {
            self.config.num_threads()
        } else {
            1
        }
    }

    pub fn build_signature(&mut self) -> CompileResult<()> {
        self.expect_phase(Phase::Created, "build_signature")?;
        let module = self.module;
        let func = module.function(self.func);

        let mut params = Vec::with_capacity(func.args.len() + HOST_GRID_PARAMS as usize);
        for (i, &arg) in func.args.iter().enumerate() {
            let value = module.value(arg);
            if value.ty.is_block() {
                return Err(CompileError::unsupported(format!(
                    "tile-typed argument %{} of @{}",
                    value.name, func.name
                )));
            }
            let attrs = func
                .arg_attrs
                .get(i)
                .map(|attrs| lower_attributes(attrs, &value.name))
                .unwrap_or_default();
            params.push(Param {
                name: value.name.clone(),
                ty: values::scalar_of(value.ty.scalar).map(Ty::Scalar)?,
                attrs,
            });
        }
        if !self.target.is_gpu() {
            for axis in ["x", "y", "z"] {
                params.push(Param {
                    name: format!("block_id.{axis}"),
                    ty: Ty::I32,
                    attrs: Vec::new(),
                });
            }
        }
        if func.ret.is_block() {
            return Err(CompileError::unsupported(format!(
                "tile-typed return value of @{}",
                func.name
            )));
        }
        let ret = values::ty_of(func.ret.scalar)?;

        let threads = self.num_threads();
        let is_gpu = self.target.is_gpu();
        let f = self.b.func_mut();
        f.params = params;
        f.ret = ret;
        if is_gpu {
            f.is_kernel = true;
            f.max_threads = Some(threads);
        }

        for (i, &arg) in func.args.iter().enumerate() {
            self.values.define(arg, &[], Val::Param(i as u32))?;
            self.init_idx(arg)?;
            self.seen.insert(arg);
        }
        self.phase = Phase::SignatureBuilt;
        Ok(())
    }

    pub fn allocate_blocks(&mut self) -> CompileResult<()> {
        self.expect_phase(Phase::SignatureBuilt, "allocate_blocks")?;
        let module = self.module;
        let func = module.function(self.func);
        let entry = self
            .b
            .func()
            .entry()
            .ok_or_else(|| CompileError::internal("builder lost its entry block"))?;
        for (i, &block) in func.blocks.iter().enumerate() {
            let id = if i == 0 {
                entry
            } else {
                self.b.add_block(&module.block(block).name)
            };
            self.block_entry.insert(block, id);
            self.block_exit.insert(block, id);
        }
        self.phase = Phase::BlocksAllocated;
        Ok(())
    }

    pub fn visit_body(&mut self) -> CompileResult<()> {
        self.expect_phase(Phase::LayoutsInitialized, "visit_body")?;
        let module = self.module;
        for &block in &module.function(self.func).blocks {
            let entry = self.entry_block(block)?;
            self.b.position_at_end(entry);
            for &v in &module.block(block).insts {
                self.visit_value(v)?;
            }
            let exit = self.b.current_block();
            self.block_exit.insert(block, exit);
        }
        self.phase = Phase::BodyVisited;
        Ok(())
    }

    pub fn finalize(&mut self) -> CompileResult<()> {
        self.expect_phase(Phase::BodyVisited, "finalize")?;
        self.resolve_pending()?;
        if self.b.cursor_depth() != 0 {
            return Err(CompileError::internal(format!(
                "{} builder cursors left on the stack",
                self.b.cursor_depth()
            )));
        }
        self.phase = Phase::Finalized;
        Ok(())
    }

    fn visit_value(&mut self, v: ValueId) -> CompileResult<()> {
        if !self.seen.insert(v) {
            return Ok(());
        }
        let module = self.module;
        let value = module.value(v);
        let inst = match &value.kind {
            ValueKind::Constant(_) => return self.init_idx(v),
            ValueKind::Argument { .. } => {
                return Err(CompileError::internal(format!(
                    "argument %{} does not belong to @{}",
                    value.name,
                    module.function(self.func).name
                )))
            }
            ValueKind::Inst(inst) => inst,
        };
        if value.func != self.func {
            return Err(CompileError::internal(format!(
                "%{} is used outside its function",
                value.name
            )));
        }

        self.bind_shared(v)?;
        if !inst.is_phi() {
            for op in inst.operands() {
                self.visit_value(op)?;
            }
        }
        self.init_idx(v)?;
        self.session.record_value_lowered(inst.opcode());
        log::trace!("lowering %{} = {}", value.name, inst.opcode());
        self.emit(v, inst)
    }

    // Shared helpers.

    fn entry_block(&self, block: tir::BlockId) -> CompileResult<lir::BlockId> {
        self.block_entry
            .get(&block)
            .copied()
            .ok_or_else(|| CompileError::internal(format!("block {} was not allocated", block.0)))
    }

    fn exit_block(&self, block: tir::BlockId) -> CompileResult<lir::BlockId> {
        self.block_exit
            .get(&block)
            .copied()
            .ok_or_else(|| CompileError::internal(format!("block {} was not allocated", block.0)))
    }

    /// Insertion point for values that must dominate the whole function.
    fn entry_cursor(&self) -> CompileResult<Cursor> {
        let entry = self
            .b
            .func()
            .entry()
            .ok_or_else(|| CompileError::internal("function has no entry block"))?;
        Ok(match self.b.func().terminator(entry) {
            Some(term) => Cursor::Before(term),
            None => Cursor::End(entry),
        })
    }

    /// Linear thread index, computed once in the entry block.
    fn thread_id(&mut self) -> CompileResult<Val> {
        if let Some(tid) = self.tid {
            return Ok(tid);
        }
        let cursor = self.entry_cursor()?;
        self.b.push_cursor(cursor);
        let tid = self.target.thread_id(&mut self.b, 0);
        self.b.pop_cursor()?;
        self.tid = Some(tid);
        Ok(tid)
    }

    fn barrier(&mut self) {
        if self.target.barrier(&mut self.b).is_some() {
            self.session.record_barrier();
        }
    }

    fn layout_id(&self, v: ValueId) -> Option<LayoutId> {
        self.layouts.layout_of(v)
    }

    fn require_layout(&self, v: ValueId) -> CompileResult<LayoutId> {
        self.layouts.layout_of(v).ok_or_else(|| {
            CompileError::internal(format!(
                "tile value %{} has no layout",
                self.module.value(v).name
            ))
        })
    }

    /// Coordinates of `v` owned by the current thread.
    fn coords(&self, v: ValueId) -> CompileResult<&'arena [Coord<'arena>]> {
        self.idxs.get(&v).copied().ok_or_else(|| {
            CompileError::internal(format!(
                "coordinates of %{} requested before materialization",
                self.module.value(v).name
            ))
        })
    }

    fn coord(&self, vals: &[Val]) -> Coord<'arena> {
        self.session.alloc_slice(vals)
    }

    /// Low-level value of `v` at `coord`. Scalars are uniform, so any
    /// coordinate reads their single entry.
    fn get(&mut self, v: ValueId, coord: Coord<'arena>) -> CompileResult<Val> {
        let module = self.module;
        let value = module.value(v);
        if let ValueKind::Constant(k) = value.kind {
            return self.constant(&value.ty, k);
        }
        let coord = if value.ty.is_block() { coord } else { &[] };
        self.values.get(v, coord)
    }

    fn define(&mut self, v: ValueId, coord: Coord<'arena>, val: Val) -> CompileResult<()> {
        self.values.define(v, coord, val)
    }

    /// Byte pointer to the scratch region planned for `v`.
    fn scratch_base(&mut self, v: ValueId) -> CompileResult<Val> {
        let offset = self
            .alloc
            .offset(crate::analysis::AllocKey::Scratch(v))
            .ok_or_else(|| {
                CompileError::internal(format!(
                    "no scratch memory planned for %{}",
                    self.module.value(v).name
                ))
            })?;
        let offset = self.b.i32(offset as i32);
        Ok(self.b.gep(Scalar::I8, Val::SharedBase, offset))
    }

    #[cfg(test)]
    fn table(&self) -> &ValueTable<'arena> {
        &self.values
    }
}

fn lower_attributes(attrs: &[Attribute], arg: &str) -> Vec<ParamAttr> {
    attrs
        .iter()
        .filter_map(|attr| match attr {
            Attribute::NoAlias => Some(ParamAttr::NoAlias),
            Attribute::ReadOnly => Some(ParamAttr::ReadOnly),
            Attribute::WriteOnly => Some(ParamAttr::WriteOnly),
            Attribute::Aligned(n) => Some(ParamAttr::Align(*n)),
            Attribute::Retune => {
                log::debug!("dropping retune attribute of %{arg}");
                None
            }
        })
        .collect()
}

/// Address space of shared memory pointers.
const SHARED: AddrSpace = AddrSpace::Shared;
