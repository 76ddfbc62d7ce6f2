//! Deferred wiring of loop-carried values.
//!
//! Phis are created when their block is visited but their incoming values
//! may be defined later in program order. Every placeholder is recorded as a
//! [`PendingEdge`] and connected in one pass after the body is complete.

use super::FunctionCodegen;
use crate::analysis::LayoutId;
use crate::core::{CompileError, CompileResult};
use crate::tile_ir::{Inst, ValueId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum PendingEdge {
    /// Per-coordinate phis of a distributed or scalar tile phi.
    Phi { phi: ValueId },
    /// Header placeholders of a double or N-stage buffered shared layout.
    Buffer { layout: LayoutId },
}

impl<'a, 'arena> FunctionCodegen<'a, 'arena> {
    /// Connect every placeholder. Buffers go first: their wraparound blocks
    /// change the exit blocks phi edges come from.
    pub(super) fn resolve_pending(&mut self) -> CompileResult<()> {
        let pending = std::mem::take(&mut self.pending);
        let buffers: Vec<LayoutId> = pending
            .iter()
            .filter_map(|edge| match *edge {
                PendingEdge::Buffer { layout } => Some(layout),
                PendingEdge::Phi { .. } => None,
            })
            .collect();
        self.resolve_buffers(&buffers)?;

        for edge in pending {
            if let PendingEdge::Phi { phi } = edge {
                self.resolve_phi(phi)?;
            }
        }
        Ok(())
    }

    fn resolve_phi(&mut self, v: ValueId) -> CompileResult<()> {
        let module = self.module;
        let value = module.value(v);
        let Some(Inst::Phi { incoming }) = value.inst() else {
            return Err(CompileError::internal(format!(
                "pending edge recorded for non-phi %{}",
                value.name
            )));
        };
        for &(inc, block) in incoming {
            if !self.seen.contains(&inc) && module.value(inc).inst().is_some() {
                return Err(CompileError::internal(format!(
                    "%{} flows into %{} but was never lowered",
                    module.value(inc).name,
                    value.name
                )));
            }
            let pred = self.exit_block(block)?;
            for &c in self.coords(v)? {
                let phi = self.get(v, c)?;
                let x = self.get(inc, c)?;
                self.b.func_mut().add_incoming(phi, x, pred)?;
            }
        }
        Ok(())
    }
}
