//! Global loads and stores.
//!
//! Coordinates are grouped by the vector width of the access; each group is
//! one predicated transaction of up to four words. Sub-word elements are
//! packed into words and unpacked with bit casts. Constant memory is read
//! with plain scalar loads.

use super::values::lir_scalar;
use super::{Coord, FunctionCodegen};
use crate::core::{CompileError, CompileResult};
use crate::lir::{CacheHint, Cursor, Intrinsic, Scalar, Ty, Val};
use crate::tile_ir::{CacheModifier, Constant, Inst, ScalarType, ValueId, ValueKind};

/// Tile IR address space of `alloc_const` arrays.
pub(super) const CONST_SPACE: u32 = 4;

impl<'a, 'arena> FunctionCodegen<'a, 'arena> {
    /// Elements per transaction: contiguous elements per thread along the
    /// fastest axis, capped by the known alignment of the pointer.
    pub(super) fn vector_width(&self, ptr: ValueId) -> usize {
        let Some(id) = self.layout_id(ptr) else {
            return 1;
        };
        let Some(l) = self.layouts.layout(id).as_scanline() else {
            return 1;
        };
        let nts = l.nts[l.order[0]];
        nts.min(self.layouts.alignment(ptr)).max(1) as usize
    }

    /// Load `coords` of the tile `ptr` points to, `vec` elements per transaction.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn lower_global_load(
        &mut self,
        ptr: ValueId,
        coords: &[Coord<'arena>],
        elem: Scalar,
        mask: Option<ValueId>,
        other: Option<ValueId>,
        cache: CacheHint,
        vec: usize,
    ) -> CompileResult<Vec<Val>> {
        let nbits = elem.bits();
        let total = nbits * vec as u32;
        let width = total.min(nbits.max(32));
        let words = (total / width).max(1);
        let per_word = (width / nbits) as usize;
        let word = Scalar::int(width).ok_or_else(|| {
            CompileError::unsupported(format!("{width}-bit global load words"))
        })?;
        let has_other = other.is_some_and(|o| !self.is_zero_fill(o) && !self.is_undef(o));

        let mut out = Vec::with_capacity(coords.len());
        for chunk in coords.chunks(vec) {
            if chunk.len() != vec {
                return Err(CompileError::internal(format!(
                    "{} coordinates do not split into groups of {vec}",
                    coords.len()
                )));
            }
            let c0 = chunk[0];
            let address = self.get(ptr, c0)?;
            let (base, offset) = self.b.split_const_offset(address);
            let pred = match mask {
                Some(m) => self.get(m, c0)?,
                None => self.b.i1(true),
            };

            let mut args = vec![pred, base];
            if let (true, Some(o)) = (has_other, other) {
                for group in chunk.chunks(per_word) {
                    let mut lanes = Vec::with_capacity(group.len());
                    for &c in group {
                        lanes.push(self.get(o, c)?);
                    }
                    let packed = self.b.pack(&lanes);
                    args.push(self.b.bitcast(packed, Ty::Scalar(word)));
                }
            }

            let ret_ty = if words > 1 {
                Ty::Vector(word, words)
            } else {
                Ty::Scalar(word)
            };
            let ret = self.b.call(
                Intrinsic::LdGlobal {
                    width,
                    words,
                    offset,
                    cache,
                    has_other,
                },
                args,
                ret_ty,
            );
            for w in 0..words {
                let bits = if words > 1 { self.b.extract(ret, w) } else { ret };
                if per_word > 1 {
                    let lanes = self.b.bitcast(bits, Ty::Vector(elem, per_word as u32));
                    for s in 0..per_word {
                        out.push(self.b.extract(lanes, s as u32));
                    }
                } else {
                    out.push(self.b.bitcast(bits, Ty::Scalar(elem)));
                }
            }
        }
        Ok(out)
    }

    pub(super) fn emit_load(
        &mut self,
        v: ValueId,
        ptr: ValueId,
        mask: Option<ValueId>,
        other: Option<ValueId>,
        cache: CacheModifier,
    ) -> CompileResult<()> {
        let elem = lir_scalar(self.elem_of(v).map_err(|_| {
            CompileError::unsupported("load of a non-numeric element")
        })?);
        let block = self.module.value(v).ty.is_block();
        let coords = self.coords(v)?;
        if matches!(self.module.value(ptr).ty.scalar, ScalarType::Ptr(_, CONST_SPACE)) {
            if mask.is_some() {
                return Err(CompileError::unsupported("masked load from constant memory"));
            }
            for &c in coords {
                let address = self.get(ptr, c)?;
                let val = self.b.load(Ty::Scalar(elem), address);
                self.define(v, c, val)?;
            }
            return Ok(());
        }
        let vec = if block { self.vector_width(ptr) } else { 1 };
        let values =
            self.lower_global_load(ptr, coords, elem, mask, other, lower_cache(cache), vec)?;
        for (&c, val) in coords.iter().zip(values) {
            self.define(v, c, val)?;
        }
        Ok(())
    }

    pub(super) fn emit_store(
        &mut self,
        ptr: ValueId,
        value: ValueId,
        mask: Option<ValueId>,
    ) -> CompileResult<()> {
        let vec = if self.module.value(value).ty.is_block() {
            self.vector_width(ptr)
        } else {
            1
        };
        let coords = self.coords(value)?;
        for chunk in coords.chunks(vec) {
            let c0 = chunk[0];
            let address = self.get(ptr, c0)?;
            let mut lanes = Vec::with_capacity(chunk.len());
            for &c in chunk {
                lanes.push(self.get(value, c)?);
            }
            let packed = self.b.pack(&lanes);
            match mask {
                Some(m) => {
                    let cond = self.get(m, c0)?;
                    self.emit_guarded(cond, "store", |cg| {
                        cg.b.store(address, packed);
                        Ok(())
                    })?;
                }
                None => {
                    self.b.store(address, packed);
                }
            }
        }
        Ok(())
    }

    /// Emit `body` in a block entered only when `cond` holds. The cursor ends
    /// up in the join block.
    pub(super) fn emit_guarded<F>(&mut self, cond: Val, name: &str, body: F) -> CompileResult<()>
    where
        F: FnOnce(&mut Self) -> CompileResult<()>,
    {
        match self.b.cursor() {
            Cursor::End(block) => {
                let then = self.b.func_mut().add_block_after(block, format!("{name}.then"));
                let end = self.b.func_mut().add_block_after(then, format!("{name}.end"));
                self.b.cond_br(cond, then, end);
                self.b.position_at_end(then);
                body(self)?;
                self.b.br(end);
                self.b.position_at_end(end);
            }
            Cursor::Before(at) => {
                let block = self.b.func().inst(at).block;
                let end = self.b.func_mut().split_block_before(at, format!("{name}.end"));
                let then = self.b.func_mut().add_block_after(block, format!("{name}.then"));
                self.b.position_at_end(block);
                self.b.cond_br(cond, then, end);
                self.b.position_at_end(then);
                body(self)?;
                self.b.br(end);
                self.b.position_before(at);
            }
        }
        Ok(())
    }

    /// Constant a tile is filled with, looking through splats and broadcasts.
    fn fill_constant(&self, v: ValueId) -> Option<Constant> {
        match &self.module.value(v).kind {
            ValueKind::Constant(k) => Some(*k),
            ValueKind::Inst(Inst::Splat { arg } | Inst::Broadcast { arg }) => {
                self.fill_constant(*arg)
            }
            _ => None,
        }
    }

    pub(super) fn is_zero_fill(&self, v: ValueId) -> bool {
        match self.fill_constant(v) {
            Some(Constant::Int(0)) => true,
            Some(Constant::Float(f)) => f.to_bits() == 0,
            _ => false,
        }
    }

    pub(super) fn is_undef(&self, v: ValueId) -> bool {
        matches!(self.fill_constant(v), Some(Constant::Undef))
    }
}

pub(super) fn lower_cache(cache: CacheModifier) -> CacheHint {
    match cache {
        CacheModifier::None => CacheHint::None,
        CacheModifier::Ca => CacheHint::Ca,
        CacheModifier::Cg => CacheHint::Cg,
    }
}

#[cfg(test)]
mod tests {
    use crate::codegen::compile;
    use crate::core::CodegenConfig;
    use crate::lir::{Function, Intrinsic, Op};
    use crate::target::NvidiaTarget;
    use crate::tile_ir::parse_module;

    fn lower(text: &str) -> Function {
        let parsed = parse_module(text).unwrap();
        let out = compile(&parsed, &NvidiaTarget::new(80), &CodegenConfig::default()).unwrap();
        out.module.functions[0].clone()
    }

    fn loads(func: &Function) -> Vec<Intrinsic> {
        func.insts()
            .filter_map(|(_, i)| match &func.inst(i).op {
                Op::Call { intrinsic, .. } if matches!(intrinsic, Intrinsic::LdGlobal { .. }) => {
                    Some(*intrinsic)
                }
                _ => None,
            })
            .collect()
    }

    fn copy_kernel(elem: &str, nts: u32, align: u32) -> String {
        let mts = 128;
        let n = nts * mts;
        format!(
            r#"
#blk = scanline<shape=[{n}], order=[0], nts=[{nts}], mts=[{mts}]>
func @copy(%src: ptr<{elem}>, %dst: ptr<{elem}>) {{
entry:
  %r = make_range 0 : i32[{n}] #blk
  %ps = splat %src : ptr<{elem}>[{n}] #blk
  %p = gep %ps, %r : ptr<{elem}>[{n}] #blk !align {align}
  %v = load %p : {elem}[{n}] #blk
  %pd = splat %dst : ptr<{elem}>[{n}] #blk
  %q = gep %pd, %r : ptr<{elem}>[{n}] #blk !align {align}
  store %q, %v
  ret
}}
"#
        )
    }

    #[test]
    fn test_vector_width_follows_alignment() {
        let func = lower(&copy_kernel("f32", 4, 4));
        let l = loads(&func);
        assert_eq!(l.len(), 1);
        assert!(matches!(
            l[0],
            Intrinsic::LdGlobal {
                width: 32,
                words: 4,
                ..
            }
        ));

        let func = lower(&copy_kernel("f32", 4, 1));
        assert_eq!(loads(&func).len(), 4);
    }

    #[test]
    fn test_half_elements_are_packed_into_words() {
        let func = lower(&copy_kernel("f16", 8, 8));
        let l = loads(&func);
        assert_eq!(l.len(), 1);
        assert!(matches!(
            l[0],
            Intrinsic::LdGlobal {
                width: 32,
                words: 4,
                ..
            }
        ));
        let printed = func.to_string();
        assert!(printed.contains("ld.global.v4.b32"), "{printed}");
    }

    #[test]
    fn test_constant_index_becomes_immediate_offset() {
        let text = r#"
#blk = scanline<shape=[128], order=[0], nts=[1], mts=[128]>
func @k(%src: ptr<f32>) {
entry:
  %r = make_range 4 : i32[128] #blk
  %ps = splat %src : ptr<f32>[128] #blk
  %p = gep %ps, %r : ptr<f32>[128] #blk
  %v = load %p : f32[128] #blk
  ret
}
"#;
        let func = lower(text);
        assert!(matches!(
            loads(&func)[0],
            Intrinsic::LdGlobal { offset: 16, .. }
        ));
    }

    #[test]
    fn test_masked_store_branches_around_the_store() {
        let text = r#"
#blk = scanline<shape=[128], order=[0], nts=[1], mts=[128]>
func @k(%dst: ptr<i32>, %n: i32) {
entry:
  %r = make_range 0 : i32[128] #blk
  %bound = splat %n : i32[128] #blk
  %m = icmp slt %r, %bound : i1[128] #blk
  %pd = splat %dst : ptr<i32>[128] #blk
  %q = gep %pd, %r : ptr<i32>[128] #blk
  store %q, %r, %m
  ret
}
"#;
        let func = lower(text);
        let printed = func.to_string();
        assert!(printed.contains("store.then"), "{printed}");
        assert!(printed.contains("store.end"), "{printed}");
        assert_eq!(func.blocks().len(), 3);
    }

    #[test]
    fn test_zero_other_needs_no_fill_operands() {
        let text = r#"
#blk = scanline<shape=[128], order=[0], nts=[1], mts=[128]>
func @k(%src: ptr<f32>, %n: i32) {
entry:
  %zero = const 0.0 : f32
  %one = const 1.0 : f32
  %r = make_range 0 : i32[128] #blk
  %bound = splat %n : i32[128] #blk
  %m = icmp slt %r, %bound : i1[128] #blk
  %ps = splat %src : ptr<f32>[128] #blk
  %p = gep %ps, %r : ptr<f32>[128] #blk
  %z = splat %zero : f32[128] #blk
  %o = splat %one : f32[128] #blk
  %a = load %p, %m, %z : f32[128] #blk
  %b = load %p, %m, %o : f32[128] #blk
  ret
}
"#;
        let func = lower(text);
        let l = loads(&func);
        assert!(matches!(l[0], Intrinsic::LdGlobal { has_other: false, .. }));
        assert!(matches!(l[1], Intrinsic::LdGlobal { has_other: true, .. }));
    }
}
