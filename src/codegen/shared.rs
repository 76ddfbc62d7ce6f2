//! Shared memory staging: base pointers of shared tiles and the loop-carried
//! state of double and N-stage buffers.
//!
//! Buffered layouts get placeholder phis at the loop header when layouts are
//! initialized. The header is visited before the latch that produces the next
//! copy, so the placeholders only receive their incoming edges in
//! [`FunctionCodegen::resolve_buffers`], once the whole body exists.

use super::pending::PendingEdge;
use super::{FunctionCodegen, SHARED};
use crate::analysis::{AllocKey, Buffering, LayoutId, SharedLayout};
use crate::core::{CompileError, CompileResult};
use crate::lir::{self, Cursor, IntPredicate, Scalar, Ty, Val};
use crate::tile_ir::{self as tir, ValueId};

/// Pointers of one shared layout.
#[derive(Debug, Clone)]
pub(super) struct BufferState {
    /// First copy; also the pointer before the loop.
    pub base: Val,
    /// Bytes per copy.
    pub stage_bytes: u32,
    pub kind: BufferKind,
}

#[derive(Debug, Clone)]
pub(super) enum BufferKind {
    Single,
    Double {
        header: tir::BlockId,
        /// Copy read by the current iteration.
        current: Val,
        /// Signed byte distance to the other copy.
        offset: Val,
        next: Val,
    },
    Staged {
        header: tir::BlockId,
        stages: u32,
        current: Val,
        next: Val,
        read_idx: Val,
        write_idx: Val,
    },
}

impl BufferState {
    /// Pointer seen by values of the layout that are neither prologue fills
    /// nor the latch.
    fn current(&self) -> Val {
        match self.kind {
            BufferKind::Single => self.base,
            BufferKind::Double { current, .. } | BufferKind::Staged { current, .. } => current,
        }
    }
}

impl<'a, 'arena> FunctionCodegen<'a, 'arena> {
    /// Create the base pointer of layout `id` and, for buffered layouts, the
    /// header placeholders. Runs with the cursor in the entry block.
    pub(super) fn init_shared_buffer(&mut self, id: LayoutId, l: &SharedLayout) -> CompileResult<()> {
        let offset = self.alloc.offset(AllocKey::Layout(id)).ok_or_else(|| {
            CompileError::internal(format!("no shared memory planned for layout {}", id.0))
        })?;
        let offset = self.b.i32(offset as i32);
        let base = self.b.gep(Scalar::I8, Val::SharedBase, offset);
        let stage_bytes = l.stage_bytes();

        let kind = match &l.buffering {
            Buffering::None => BufferKind::Single,
            Buffering::Double { phi, .. } => {
                let header = self.buffer_header(*phi)?;
                let block = self.entry_block(header)?;
                let current = self.b.phi_in(block, Ty::ptr(SHARED));
                let offset = self.b.phi_in(block, Ty::I32);
                self.b.set_name(current, "smem.ptr");
                self.b.set_name(offset, "smem.off");
                self.b.push_cursor(Cursor::End(block));
                let next = self.b.gep(Scalar::I8, current, offset);
                self.b.pop_cursor()?;
                self.b.set_name(next, "smem.next");
                BufferKind::Double {
                    header,
                    current,
                    offset,
                    next,
                }
            }
            Buffering::Staged { phi, stages, .. } => {
                let header = self.buffer_header(*phi)?;
                let block = self.entry_block(header)?;
                let read_idx = self.b.phi_in(block, Ty::I32);
                let write_idx = self.b.phi_in(block, Ty::I32);
                let current = self.b.phi_in(block, Ty::ptr(SHARED));
                let next = self.b.phi_in(block, Ty::ptr(SHARED));
                self.b.set_name(read_idx, "smem.read_idx");
                self.b.set_name(write_idx, "smem.write_idx");
                self.b.set_name(current, "smem.ptr");
                self.b.set_name(next, "smem.next");
                BufferKind::Staged {
                    header,
                    stages: *stages,
                    current,
                    next,
                    read_idx,
                    write_idx,
                }
            }
        };
        if !matches!(kind, BufferKind::Single) {
            log::debug!(
                "layout {} is {}-way buffered, {stage_bytes} bytes per copy",
                id.0,
                l.buffering.copies()
            );
            self.pending.push(PendingEdge::Buffer { layout: id });
        }
        self.buffers.insert(
            id,
            BufferState {
                base,
                stage_bytes,
                kind,
            },
        );
        Ok(())
    }

    fn buffer_header(&self, phi: ValueId) -> CompileResult<tir::BlockId> {
        let value = self.module.value(phi);
        match (&value.block, value.inst()) {
            (Some(block), Some(inst)) if inst.is_phi() && value.func == self.func => Ok(*block),
            _ => Err(CompileError::internal(format!(
                "buffer placeholder %{} is not a phi of @{}",
                value.name,
                self.module.function(self.func).name
            ))),
        }
    }

    /// Record the shared memory pointer of `v` if its layout lives in shared
    /// memory. Called at the point `v` is lowered.
    pub(super) fn bind_shared(&mut self, v: ValueId) -> CompileResult<()> {
        let layouts = self.layouts;
        let Some(id) = self.layout_id(v) else {
            return Ok(());
        };
        let Some(l) = layouts.layout(id).as_shared() else {
            return Ok(());
        };
        let state = self.buffers.get(&id).cloned().ok_or_else(|| {
            CompileError::internal(format!("shared layout {} was not initialized", id.0))
        })?;

        let ptr = match (&l.buffering, &state.kind) {
            (Buffering::Double { first, latch, .. }, BufferKind::Double { next, .. }) => {
                if v == *latch {
                    *next
                } else if v == *first {
                    state.base
                } else {
                    state.current()
                }
            }
            (
                Buffering::Staged { latch, firsts, .. },
                BufferKind::Staged { write_idx, .. },
            ) => {
                if let Some(stage) = firsts.iter().position(|&f| f == v) {
                    let bytes = self.b.i32((stage as u32 * state.stage_bytes) as i32);
                    self.b.gep(Scalar::I8, state.base, bytes)
                } else if v == *latch {
                    let bytes = self.b.mul_i32(*write_idx, state.stage_bytes as i32);
                    self.b.gep(Scalar::I8, state.base, bytes)
                } else {
                    state.current()
                }
            }
            _ => state.current(),
        };
        self.shmems.insert(v, ptr);
        Ok(())
    }

    /// Wire the header placeholders of every buffered layout. Wraparound
    /// blocks of N-stage buffers are created before any edge is added, since
    /// they move the exit of the latch block.
    pub(super) fn resolve_buffers(&mut self, layouts: &[LayoutId]) -> CompileResult<()> {
        let mut wrapped: Vec<(LayoutId, Val, Val)> = Vec::new();
        for &id in layouts {
            let state = self.buffer_state(id)?;
            if let BufferKind::Staged {
                stages,
                read_idx,
                write_idx,
                ..
            } = state.kind
            {
                let latch_block = self.latch_block(id)?;
                let read = self.wrap_stage_index(latch_block, read_idx, stages)?;
                let write = self.wrap_stage_index(latch_block, write_idx, stages)?;
                wrapped.push((id, read, write));
            }
        }

        for &id in layouts {
            let state = self.buffer_state(id)?;
            match state.kind {
                BufferKind::Single => {}
                BufferKind::Double { .. } => self.finish_double(id, &state)?,
                BufferKind::Staged { .. } => {
                    let (read, write) = wrapped
                        .iter()
                        .find(|(w, ..)| *w == id)
                        .map(|&(_, r, w)| (r, w))
                        .ok_or_else(|| {
                            CompileError::internal(format!("layout {} lost its wraparound", id.0))
                        })?;
                    self.finish_staged(id, &state, read, write)?;
                }
            }
        }
        Ok(())
    }

    fn buffer_state(&self, id: LayoutId) -> CompileResult<BufferState> {
        self.buffers
            .get(&id)
            .cloned()
            .ok_or_else(|| CompileError::internal(format!("no buffer state for layout {}", id.0)))
    }

    /// Incoming edges `(value, block)` of the buffering phi of layout `id`.
    fn buffer_edges(&self, id: LayoutId) -> CompileResult<(ValueId, Vec<(ValueId, tir::BlockId)>)> {
        let layouts = self.layouts;
        let l = layouts.layout(id).as_shared().ok_or_else(|| {
            CompileError::internal(format!("layout {} is not shared", id.0))
        })?;
        let (phi, latch) = match &l.buffering {
            Buffering::Double { phi, latch, .. } | Buffering::Staged { phi, latch, .. } => {
                (*phi, *latch)
            }
            Buffering::None => {
                return Err(CompileError::internal(format!(
                    "layout {} is not buffered",
                    id.0
                )))
            }
        };
        match self.module.value(phi).inst() {
            Some(tir::Inst::Phi { incoming }) => Ok((latch, incoming.clone())),
            _ => Err(CompileError::internal(format!(
                "buffer placeholder %{} is not a phi",
                self.module.value(phi).name
            ))),
        }
    }

    /// Tile block whose back edge carries the latch of layout `id`.
    fn latch_block(&self, id: LayoutId) -> CompileResult<tir::BlockId> {
        let (latch, incoming) = self.buffer_edges(id)?;
        incoming
            .iter()
            .find(|&&(v, _)| v == latch)
            .map(|&(_, block)| block)
            .ok_or_else(|| {
                CompileError::internal(format!(
                    "latch %{} does not reach the loop header",
                    self.module.value(latch).name
                ))
            })
    }

    /// `idx == stages - 1 ? 0 : idx + 1`, as a branch diamond at the end of
    /// `latch`. The diamond's join becomes the new exit of `latch`.
    fn wrap_stage_index(&mut self, latch: tir::BlockId, idx: Val, stages: u32) -> CompileResult<Val> {
        let exit = self.exit_block(latch)?;
        let term = self.b.func().terminator(exit).ok_or_else(|| {
            CompileError::internal(format!("latch block {} is not terminated", latch.0))
        })?;

        self.b.push_cursor(Cursor::Before(term));
        let last = self.b.i32(stages as i32 - 1);
        let at_end = self.b.icmp(IntPredicate::Eq, idx, last);
        self.b.pop_cursor()?;

        let join = self.b.func_mut().split_block_before(term, "stage.join");
        let func = self.b.func_mut();
        let reset = func.add_block_after(exit, "stage.reset");
        let bump = func.add_block_after(reset, "stage.next");

        self.b.push_cursor(Cursor::End(exit));
        self.b.cond_br(at_end, reset, bump);
        self.b.position_at_end(reset);
        self.b.br(join);
        self.b.position_at_end(bump);
        let inc = self.b.add_i32(idx, 1);
        self.b.br(join);
        let wrapped = self.b.phi_in(join, Ty::I32);
        self.b.pop_cursor()?;

        let zero = self.b.i32(0);
        let func = self.b.func_mut();
        func.add_incoming(wrapped, zero, reset)?;
        func.add_incoming(wrapped, inc, bump)?;
        self.block_exit.insert(latch, join);
        Ok(wrapped)
    }

    /// Insert computations before the terminator of the exit of `block`.
    fn at_block_end(&self, block: tir::BlockId) -> CompileResult<(lir::BlockId, Cursor)> {
        let exit = self.exit_block(block)?;
        let cursor = match self.b.func().terminator(exit) {
            Some(term) => Cursor::Before(term),
            None => Cursor::End(exit),
        };
        Ok((exit, cursor))
    }

    fn finish_double(&mut self, id: LayoutId, state: &BufferState) -> CompileResult<()> {
        let BufferKind::Double {
            header,
            current,
            offset,
            ..
        } = state.kind
        else {
            return Err(CompileError::internal("double buffer state expected"));
        };
        let (latch, incoming) = self.buffer_edges(id)?;
        for (value, block) in incoming {
            let (pred, cursor) = self.at_block_end(block)?;
            let delta = if value == latch {
                self.b.push_cursor(cursor);
                let flipped = self.b.neg(offset);
                self.b.pop_cursor()?;
                flipped
            } else {
                self.b.i32(state.stage_bytes as i32)
            };
            let ptr = self.shmems.get(&value).copied().ok_or_else(|| {
                CompileError::internal(format!(
                    "%{} reaches a buffered phi without a shared pointer",
                    self.module.value(value).name
                ))
            })?;
            let func = self.b.func_mut();
            func.add_incoming(offset, delta, pred)?;
            func.add_incoming(current, ptr, pred)?;
        }
        log::debug!("finalized double buffer of layout {} at block {}", id.0, header.0);
        Ok(())
    }

    fn finish_staged(
        &mut self,
        id: LayoutId,
        state: &BufferState,
        read: Val,
        write: Val,
    ) -> CompileResult<()> {
        let BufferKind::Staged {
            header,
            stages,
            current,
            next,
            read_idx,
            write_idx,
        } = state.kind
        else {
            return Err(CompileError::internal("staged buffer state expected"));
        };
        let (latch, incoming) = self.buffer_edges(id)?;
        for (value, block) in incoming {
            let (pred, cursor) = self.at_block_end(block)?;
            let edges = if value == latch {
                // the copy read next lives at the stage the read index names
                self.b.push_cursor(cursor);
                let bytes = self.b.mul_i32(read_idx, state.stage_bytes as i32);
                let next_ptr = self.b.gep(Scalar::I8, state.base, bytes);
                self.b.pop_cursor()?;
                [(read_idx, read), (write_idx, write), (current, next), (next, next_ptr)]
            } else {
                // prologue filled stages 0..stages-1; stage 1 is read second
                self.b.push_cursor(cursor);
                let one = self.b.i32(state.stage_bytes as i32);
                let second = self.b.gep(Scalar::I8, state.base, one);
                self.b.pop_cursor()?;
                let first_read = self.b.i32(2.min(stages as i32 - 1));
                let first_write = self.b.i32(stages as i32 - 1);
                [
                    (read_idx, first_read),
                    (write_idx, first_write),
                    (current, state.base),
                    (next, second),
                ]
            };
            let func = self.b.func_mut();
            for (phi, value) in edges {
                func.add_incoming(phi, value, pred)?;
            }
        }
        log::debug!(
            "finalized {stages}-stage buffer of layout {} at block {}",
            id.0,
            header.0
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::codegen::compile;
    use crate::core::CodegenConfig;
    use crate::lir::{verify, Function, Op};
    use crate::target::{HostTarget, NvidiaTarget};
    use crate::tile_ir::parse_module;

    const DOUBLE: &str = r#"
#blk = scanline<shape=[32, 32], order=[1, 0], nts=[1, 4], mts=[16, 8]>
#smem = shared<shape=[32, 32], order=[1, 0], elem=f32, vec=4, per_phase=1, max_phase=8, double(%a, %a0, %a1)>
func @k(%x: ptr<f32>, %n: i32) {
entry:
  %p = splat %x : ptr<f32>[32, 32] #blk
  %a0 = load_async %p : f32[32, 32] #smem
  %zero = const 0 : i32
  br ^loop
loop:
  %i = phi [%zero, ^entry], [%next, ^loop] : i32
  %a = phi [%a0, ^entry], [%a1, ^loop] : f32[32, 32] #smem
  async_wait 0
  barrier
  %t = copy_from_shared %a : f32[32, 32] #blk
  %a1 = load_async %p : f32[32, 32] #smem
  %one = const 1 : i32
  %next = add %i, %one : i32
  %c = icmp slt %next, %n : i1
  condbr %c, ^loop, ^exit
exit:
  ret
}
"#;

    const STAGED: &str = r#"
#blk = scanline<shape=[32, 32], order=[1, 0], nts=[1, 4], mts=[16, 8]>
#smem = shared<shape=[32, 32], order=[1, 0], elem=f32, vec=4, per_phase=1, max_phase=8, stages(3, %a, %a2, [%a0, %a1])>
func @k(%x: ptr<f32>, %n: i32) {
entry:
  %p = splat %x : ptr<f32>[32, 32] #blk
  %a0 = load_async %p : f32[32, 32] #smem
  %a1 = load_async %p : f32[32, 32] #smem
  %zero = const 0 : i32
  br ^loop
loop:
  %i = phi [%zero, ^entry], [%next, ^loop] : i32
  %a = phi [%a1, ^entry], [%a2, ^loop] : f32[32, 32] #smem
  async_wait 1
  barrier
  %t = copy_from_shared %a : f32[32, 32] #blk
  %a2 = load_async %p : f32[32, 32] #smem
  %one = const 1 : i32
  %next = add %i, %one : i32
  %c = icmp slt %next, %n : i1
  condbr %c, ^loop, ^exit
exit:
  ret
}
"#;

    fn named_phis<'f>(func: &'f Function, prefix: &str) -> Vec<&'f Op> {
        func.insts()
            .map(|(_, i)| func.inst(i))
            .filter(|inst| inst.op.is_phi())
            .filter(|inst| inst.name.as_deref().is_some_and(|n| n.starts_with(prefix)))
            .map(|inst| &inst.op)
            .collect()
    }

    #[test]
    fn test_double_buffer_placeholders_are_wired() {
        let parsed = parse_module(DOUBLE).unwrap();
        let out = compile(&parsed, &NvidiaTarget::new(80), &CodegenConfig::default()).unwrap();
        let func = &out.module.functions[0];
        verify::verify_function(func).unwrap();
        assert_eq!(out.module.shared_bytes, 2 * 32 * 32 * 4);

        let offsets = named_phis(func, "smem.off");
        assert_eq!(offsets.len(), 1);
        let Op::Phi { incoming } = offsets[0] else {
            unreachable!()
        };
        assert_eq!(incoming.len(), 2);
        assert!(incoming
            .iter()
            .any(|&(v, _)| func.as_const_int(v) == Some(32 * 32 * 4)));
        let printed = func.to_string();
        assert!(printed.contains("smem.next"), "{printed}");
    }

    #[test]
    fn test_staged_buffer_synthesizes_wraparound() {
        let parsed = parse_module(STAGED).unwrap();
        let out = compile(&parsed, &NvidiaTarget::new(80), &CodegenConfig::default()).unwrap();
        let func = &out.module.functions[0];
        verify::verify_function(func).unwrap();
        assert_eq!(out.module.shared_bytes, 3 * 32 * 32 * 4);

        let names: Vec<&str> = func
            .blocks()
            .iter()
            .map(|&b| func.block(b).name.as_str())
            .collect();
        assert_eq!(names.iter().filter(|n| n.starts_with("stage.reset")).count(), 2);
        assert_eq!(names.iter().filter(|n| n.starts_with("stage.join")).count(), 2);
        for prefix in ["smem.read_idx", "smem.write_idx", "smem.ptr", "smem.next"] {
            let phis = named_phis(func, prefix);
            assert_eq!(phis.len(), 1, "{prefix}");
            let Op::Phi { incoming } = phis[0] else {
                unreachable!()
            };
            assert_eq!(incoming.len(), 2, "{prefix}");
        }
    }

    #[test]
    fn test_shared_layouts_rejected_on_host() {
        let parsed = parse_module(DOUBLE).unwrap();
        let err = compile(&parsed, &HostTarget, &CodegenConfig::default()).unwrap_err();
        assert!(err.is_unsupported());
    }
}
