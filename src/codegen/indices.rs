//! Thread-to-element mapping of distributed layouts.

use super::{Coord, FunctionCodegen, Phase};
use crate::analysis::{Layout, LayoutId, MmaLayout, ScanlineLayout, SharedLayout};
use crate::core::{CompileError, CompileResult};
use crate::lir::Val;
use crate::tile_ir::ValueId;

/// Index values one thread owns along one dimension of a layout.
#[derive(Debug, Clone)]
pub(super) struct Axis {
    /// Position of the thread along the dimension.
    pub thread_id: Val,
    /// Element indices, ascending.
    pub values: Vec<Val>,
}

/// Everything that determines the index values of one scanline dimension.
/// Layouts agreeing on it share their index values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(super) struct AxisKey {
    divisor: u32,
    modulus: Option<u32>,
    wrap: Option<u32>,
    nts: u32,
    per_cta: u32,
    count: u32,
}

impl<'a, 'arena> FunctionCodegen<'a, 'arena> {
    pub fn init_layouts(&mut self) -> CompileResult<()> {
        self.expect_phase(Phase::BlocksAllocated, "init_layouts")?;
        let layouts = self.layouts;
        let entry = self.entry_cursor()?;
        self.b.set_cursor(entry);

        let threads = self.num_threads();
        let used = self.used_layouts();
        if !self.target.is_gpu() {
            if let Some(id) = used
                .iter()
                .find(|&&id| matches!(layouts.layout(id), Layout::Shared(_)))
            {
                return Err(CompileError::unsupported(format!(
                    "shared layout {} on the {} target",
                    id.0,
                    self.target.name()
                )));
            }
        }
        let mut mmas: Vec<LayoutId> = Vec::new();
        for id in used {
            log::debug!("initializing layout {} over {threads} threads", id.0);
            match layouts.layout(id) {
                Layout::Scanline(l) => self.init_scanline(id, l, threads)?,
                Layout::Mma(l) => {
                    let same = mmas
                        .iter()
                        .copied()
                        .find(|&prev| layouts.layout(prev) == layouts.layout(id));
                    match same {
                        Some(prev) => {
                            for k in 0..2 {
                                if let Some(axis) = self.axes.get(&(prev, k)).cloned() {
                                    self.axes.insert((id, k), axis);
                                }
                            }
                        }
                        None => {
                            self.init_mma(id, l, threads)?;
                            mmas.push(id);
                        }
                    }
                }
                Layout::Shared(l) => self.init_shared(id, l)?,
            }
        }
        self.phase = Phase::LayoutsInitialized;
        Ok(())
    }

    /// Layouts referenced by the function, in id order.
    fn used_layouts(&self) -> Vec<LayoutId> {
        let module = self.module;
        let func = module.function(self.func);
        let mut ids: Vec<LayoutId> = func
            .args
            .iter()
            .chain(&func.constants)
            .chain(func.blocks.iter().flat_map(|&b| &module.block(b).insts))
            .filter_map(|&v| self.layout_id(v))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    fn init_shared(&mut self, id: LayoutId, l: &SharedLayout) -> CompileResult<()> {
        if !self.target.is_gpu() {
            return Err(CompileError::unsupported(format!(
                "shared layout on the {} target",
                self.target.name()
            )));
        }
        self.init_shared_buffer(id, l)
    }

    fn init_scanline(&mut self, id: LayoutId, l: &ScanlineLayout, threads: u32) -> CompileResult<()> {
        if l.num_threads() != threads {
            return Err(CompileError::internal(format!(
                "scanline layout {} spans {} threads but blocks have {threads}",
                id.0,
                l.num_threads()
            )));
        }
        let mut divisor = 1;
        for &k in &l.order {
            let axis = if l.shape[k] == 1 {
                let zero = self.b.i32(0);
                Axis {
                    thread_id: zero,
                    values: vec![zero],
                }
            } else {
                let per_cta = l.shape_per_cta(k);
                let key = AxisKey {
                    divisor,
                    modulus: (divisor * l.mts[k] != threads).then_some(l.mts[k]),
                    wrap: (per_cta > l.shape[k]).then(|| l.shape[k] / l.nts[k]),
                    nts: l.nts[k],
                    per_cta,
                    count: l.per_thread(k),
                };
                self.scanline_axis(key)?
            };
            self.axes.insert((id, k), axis);
            divisor *= l.mts[k];
        }
        Ok(())
    }

    fn scanline_axis(&mut self, key: AxisKey) -> CompileResult<Axis> {
        if let Some(axis) = self.axis_cache.get(&key) {
            return Ok(axis.clone());
        }
        let tid = self.thread_id()?;
        let divisor = self.b.i32(key.divisor as i32);
        let mut t = self.b.udiv(tid, divisor);
        if let Some(m) = key.modulus {
            let m = self.b.i32(m as i32);
            t = self.b.urem(t, m);
        }
        if let Some(w) = key.wrap {
            let w = self.b.i32(w as i32);
            t = self.b.urem(t, w);
        }
        let base = self.b.mul_i32(t, key.nts as i32);
        let mut values = Vec::with_capacity(key.count as usize);
        for n in 0..key.count {
            let offset = n / key.nts * key.per_cta + n % key.nts;
            values.push(self.b.add_i32(base, offset as i32));
        }
        let axis = Axis {
            thread_id: t,
            values,
        };
        self.axis_cache.insert(key, axis.clone());
        Ok(axis)
    }

    fn init_mma(&mut self, id: LayoutId, l: &MmaLayout, threads: u32) -> CompileResult<()> {
        if !self.target.supports_mma() {
            return Err(CompileError::unsupported(format!(
                "mma layout on {}",
                self.target.name()
            )));
        }
        if l.num_warps() * 32 != threads {
            return Err(CompileError::internal(format!(
                "mma layout {} spans {} warps but blocks have {} threads",
                id.0,
                l.num_warps(),
                threads
            )));
        }
        let cc = self.target.compute_capability();
        let tid = self.thread_id()?;
        let b = &mut self.b;
        let c32 = b.i32(32);
        let lane = b.urem(tid, c32);
        let warp = b.udiv(tid, c32);
        let wpt0 = b.i32(l.wpt[0] as i32);
        let wpt1 = b.i32(l.wpt[1] as i32);
        let warp0 = b.urem(warp, wpt0);
        let warp1 = b.udiv(warp, wpt0);
        let warp1 = b.urem(warp1, wpt1);
        let off_warp_m = b.mul_i32(warp0, l.shape_per_warp(0, cc) as i32);
        let off_warp_n = b.mul_i32(warp1, l.shape_per_warp(1, cc) as i32);

        let mut idx_m = Vec::new();
        let mut idx_n = Vec::new();
        let step_m = l.shape_per_cta(0, cc) as usize;
        let step_n = l.shape_per_cta(1, cc) as usize;
        if cc >= 80 {
            let c4 = b.i32(4);
            let row = b.udiv(lane, c4);
            let off_m = b.add(row, off_warp_m);
            let col = b.urem(lane, c4);
            let col = b.mul_i32(col, 2);
            let off_n = b.add(col, off_warp_n);
            for m in (0..l.shape[0] as usize).step_by(step_m) {
                idx_m.push(b.add_i32(off_m, m as i32));
                idx_m.push(b.add_i32(off_m, m as i32 + 8));
            }
            for n in (0..l.shape[1] as usize).step_by(step_n) {
                idx_n.push(b.add_i32(off_n, n as i32));
                idx_n.push(b.add_i32(off_n, n as i32 + 1));
            }
        } else {
            let [fpw0, fpw1] = l.fpw;
            let [rep0, rep1] = l.rep;
            let c4 = b.i32(4);
            let c16 = b.i32(16);
            let quad = b.and(lane, c16);
            let quad = b.udiv(quad, c4);
            let off_quad_m = b.mul_i32(quad, (fpw0 * (rep0 / 2)) as i32);
            let pair = b.urem(lane, c16);
            let pair = b.udiv(pair, c4);
            let fpw0_v = b.i32(fpw0 as i32);
            let fpw1_v = b.i32(fpw1 as i32);
            let pair_m = b.urem(pair, fpw0_v);
            let off_pair_m = b.mul_i32(pair_m, (4 * (rep0 / 2)) as i32);
            let pair_n = b.udiv(pair, fpw0_v);
            let pair_n = b.urem(pair_n, fpw1_v);
            let off_pair_n = b.mul_i32(pair_n, (4 * (rep1 / 2)) as i32);

            let c1 = b.i32(1);
            let c2 = b.i32(2);
            let lane_m = b.and(lane, c1);
            let off_m = b.add(off_pair_m, off_quad_m);
            let off_m = b.add(off_warp_m, off_m);
            let off_m = b.add(lane_m, off_m);
            let lane_n = b.and(lane, c2);
            let off_n = b.add(off_warp_n, off_pair_n);
            let off_n = b.add(lane_n, off_n);
            for m in (0..l.shape[0]).step_by(step_m) {
                for mm in 0..rep0 {
                    idx_m.push(b.add_i32(off_m, (m + mm * 2) as i32));
                }
            }
            for n in (0..l.shape[1]).step_by(step_n) {
                for nn in 0..rep1 {
                    let base = n + nn / 2 * 4 + (nn % 2) * 2 * fpw1 * rep1;
                    idx_n.push(b.add_i32(off_n, base as i32));
                    idx_n.push(b.add_i32(off_n, base as i32 + 1));
                }
            }
        }
        self.axes.insert(
            (id, 0),
            Axis {
                thread_id: warp0,
                values: idx_m,
            },
        );
        self.axes.insert(
            (id, 1),
            Axis {
                thread_id: warp1,
                values: idx_n,
            },
        );
        Ok(())
    }

    /// Position of the current thread along dimension `k` of a layout.
    pub(super) fn axis_thread_id(&self, id: LayoutId, k: usize) -> CompileResult<Val> {
        self.axes
            .get(&(id, k))
            .map(|axis| axis.thread_id)
            .ok_or_else(|| CompileError::internal(format!("axis {k} of layout {} missing", id.0)))
    }

    /// Materialize the coordinates `v` owns in the current thread.
    pub(super) fn init_idx(&mut self, v: ValueId) -> CompileResult<()> {
        if self.idxs.contains_key(&v) {
            return Ok(());
        }
        let module = self.module;
        let value = module.value(v);
        if !value.ty.is_block() {
            let scalar: &[Coord<'arena>] = self.session.alloc_slice(&[&[][..]]);
            self.idxs.insert(v, scalar);
            return Ok(());
        }
        let id = self.require_layout(v)?;
        let coords = self.layout_coords(id)?;
        if !coords.is_empty() && self.layouts.layout(id).shape() != value.ty.shape.as_slice() {
            return Err(CompileError::internal(format!(
                "%{} has shape {:?} but its layout covers {:?}",
                value.name,
                value.ty.shape,
                self.layouts.layout(id).shape()
            )));
        }
        self.idxs.insert(v, coords);
        Ok(())
    }

    /// Coordinates of a layout with `order[0]` varying fastest. Shared layouts
    /// own no registers.
    fn layout_coords(&mut self, id: LayoutId) -> CompileResult<&'arena [Coord<'arena>]> {
        if let Some(&coords) = self.coord_lists.get(&id) {
            return Ok(coords);
        }
        let layout = self.layouts.layout(id);
        if layout.is_shared() {
            return Ok(&[]);
        }
        let order = layout.order();
        let rank = layout.rank();
        let mut dims = Vec::with_capacity(rank);
        for k in 0..rank {
            let axis = self.axes.get(&(id, k)).ok_or_else(|| {
                CompileError::internal(format!("layout {} used before initialization", id.0))
            })?;
            dims.push(axis.values.as_slice());
        }
        let total: usize = dims.iter().map(|d| d.len()).product();
        let mut coords = Vec::with_capacity(total);
        let mut coord = vec![Val::SharedBase; rank];
        for i in 0..total {
            let mut rem = i;
            for &k in &order {
                coord[k] = dims[k][rem % dims[k].len()];
                rem /= dims[k].len();
            }
            coords.push(self.session.alloc_slice(&coord));
        }
        let coords = self.session.alloc_slice(&coords);
        self.coord_lists.insert(id, coords);
        Ok(coords)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{Allocation, LayoutQuery};
    use crate::core::test_utils::test::TestContext;
    use crate::core::CodegenConfig;
    use crate::lir::Op;
    use crate::target::{HostTarget, NvidiaTarget, Target};
    use crate::tile_ir::{parse_module, FuncId, ParsedModule};

    const TWO_LAYOUTS: &str = r#"
#a = scanline<shape=[32, 32], order=[1, 0], nts=[1, 4], mts=[16, 8]>
#b = scanline<shape=[32, 32], order=[1, 0], nts=[1, 4], mts=[16, 8]>
#c = scanline<shape=[32], order=[0], nts=[1], mts=[128]>
func @k() {
entry:
  %x = make_range 0 : i32[32] #c
  ret
}
"#;

    fn layout_named(parsed: &ParsedModule, shape: &[u32]) -> Vec<LayoutId> {
        parsed
            .layouts
            .layout_ids()
            .into_iter()
            .filter(|&id| parsed.layouts.layout(id).shape() == shape)
            .collect()
    }

    fn with_layouts<F>(text: &str, target: &dyn Target, check: F)
    where
        F: FnOnce(&mut FunctionCodegen<'_, '_>, &ParsedModule),
    {
        let parsed = parse_module(text).unwrap();
        let alloc = Allocation::plan(&parsed.module, &parsed.layouts).unwrap();
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let config = CodegenConfig::default();
        let mut cg = FunctionCodegen::new(
            &parsed.module,
            &parsed.layouts,
            &alloc,
            target,
            &config,
            &session,
            FuncId(0),
        )
        .unwrap();
        cg.build_signature().unwrap();
        cg.allocate_blocks().unwrap();
        cg.init_layouts().unwrap();
        check(&mut cg, &parsed);
    }

    #[test]
    fn test_unused_layouts_are_skipped() {
        with_layouts(TWO_LAYOUTS, &NvidiaTarget::new(80), |cg, parsed| {
            let used = layout_named(parsed, &[32]);
            assert_eq!(cg.axes.len(), 1);
            assert!(cg.axes.contains_key(&(used[0], 0)));
        });
    }

    #[test]
    fn test_elements_per_thread_follow_nts_and_mts() {
        let text = r#"
#a = scanline<shape=[32, 32], order=[1, 0], nts=[1, 4], mts=[16, 8]>
#b = scanline<shape=[32, 32], order=[1, 0], nts=[1, 4], mts=[16, 8]>
func @k(%p: ptr<f32>) {
entry:
  %x = splat %p : ptr<f32>[32, 32] #a
  %y = splat %p : ptr<f32>[32, 32] #b
  ret
}
"#;
        with_layouts(text, &NvidiaTarget::new(80), |cg, parsed| {
            let ids = layout_named(parsed, &[32, 32]);
            let (a, b) = (ids[0], ids[1]);
            assert_eq!(cg.axes[&(a, 0)].values.len(), 2);
            assert_eq!(cg.axes[&(a, 1)].values.len(), 4);
            assert_eq!(cg.axes[&(a, 1)].values, cg.axes[&(b, 1)].values);

            let x = parsed.module.block(parsed.module.function(FuncId(0)).blocks[0]).insts[0];
            cg.init_idx(x).unwrap();
            let coords = cg.coords(x).unwrap();
            assert_eq!(coords.len(), 8);
            // Dimension 1 varies fastest.
            assert_eq!(coords[0][0], coords[1][0]);
            assert_ne!(coords[0][1], coords[1][1]);
            assert_eq!(coords[4][1], coords[0][1]);
        });
    }

    #[test]
    fn test_thread_id_is_read_once() {
        let text = r#"
#a = scanline<shape=[16, 64], order=[1, 0], nts=[1, 2], mts=[4, 32]>
#c = scanline<shape=[128], order=[0], nts=[1], mts=[128]>
func @k(%p: ptr<f32>) {
entry:
  %x = splat %p : ptr<f32>[16, 64] #a
  %r = make_range 0 : i32[128] #c
  ret
}
"#;
        with_layouts(text, &NvidiaTarget::new(80), |cg, _| {
            let f = cg.b.func();
            let tid_reads = f
                .insts()
                .filter(|&(_, i)| matches!(f.inst(i).op, Op::Call { .. }))
                .count();
            assert_eq!(tid_reads, 1);
        });
    }

    #[test]
    fn test_host_indices_are_constants() {
        let text = r#"
#a = scanline<shape=[4, 8], order=[1, 0], nts=[4, 8], mts=[1, 1]>
func @k(%p: ptr<f32>) {
entry:
  %x = splat %p : ptr<f32>[4, 8] #a
  ret
}
"#;
        with_layouts(text, &HostTarget, |cg, parsed| {
            let id = layout_named(parsed, &[4, 8])[0];
            let f = cg.b.func();
            let cols: Vec<i64> = cg.axes[&(id, 1)]
                .values
                .iter()
                .map(|&v| f.as_const_int(v).unwrap())
                .collect();
            assert_eq!(cols, (0..8).collect::<Vec<_>>());
            assert_eq!(f.num_insts(), 0);
        });
    }

    #[test]
    fn test_replicated_dimension_wraps() {
        let text = r#"
#r = scanline<shape=[16], order=[0], nts=[4], mts=[128]>
func @k() {
entry:
  %x = make_range 0 : i32[16] #r
  ret
}
"#;
        with_layouts(text, &NvidiaTarget::new(80), |cg, parsed| {
            let id = layout_named(parsed, &[16])[0];
            assert_eq!(cg.axes[&(id, 0)].values.len(), 4);
            let f = cg.b.func();
            let rems = f
                .insts()
                .filter(|&(_, i)| {
                    matches!(
                        f.inst(i).op,
                        Op::Binary {
                            op: crate::lir::BinOp::URem,
                            ..
                        }
                    )
                })
                .count();
            assert_eq!(rems, 1);
        });
    }

    #[test]
    fn test_mma_needs_tensor_cores() {
        let text = r#"
#m = mma<shape=[32, 32], wpt=[2, 2]>
func @k() {
entry:
  %x = make_range 0 : i32[32, 32] #m
  ret
}
"#;
        with_layouts(text, &NvidiaTarget::new(80), |cg, parsed| {
            let id = layout_named(parsed, &[32, 32])[0];
            // 16x8 fragments on 2x2 warps: rows m and m+8 per 32-row pass.
            assert_eq!(cg.axes[&(id, 0)].values.len(), 2);
            assert_eq!(cg.axes[&(id, 1)].values.len(), 4);
        });

        let parsed = parse_module(text).unwrap();
        let err = crate::codegen::compile(&parsed, &NvidiaTarget::new(60), &CodegenConfig::default())
            .unwrap_err();
        assert!(err.is_unsupported());
    }

    #[test]
    fn test_mma_volta_fragments() {
        let text = r#"
#m = mma<shape=[64, 64], wpt=[2, 2], fpw=[2, 2], rep=[2, 2]>
func @k() {
entry:
  %x = make_range 0 : i32[64, 64] #m
  ret
}
"#;
        with_layouts(text, &NvidiaTarget::new(70), |cg, parsed| {
            let id = layout_named(parsed, &[64, 64])[0];
            // shape_per_cta = 2 * 4 * 2 * 2 = 32: two passes of rep=2 rows, four columns each.
            assert_eq!(cg.axes[&(id, 0)].values.len(), 4);
            assert_eq!(cg.axes[&(id, 1)].values.len(), 8);
        });
    }

    #[test]
    fn test_thread_count_mismatch_is_internal() {
        let text = r#"
#a = scanline<shape=[64], order=[0], nts=[1], mts=[64]>
func @k() {
entry:
  %x = make_range 0 : i32[64] #a
  ret
}
"#;
        let parsed = parse_module(text).unwrap();
        let err = crate::codegen::compile(&parsed, &NvidiaTarget::new(80), &CodegenConfig::default())
            .unwrap_err();
        assert!(matches!(err, CompileError::Internal { .. }));
    }
}
