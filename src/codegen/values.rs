//! Scalarized value table and type mapping.
//!
//! Every tile value is represented by one low-level value per coordinate the
//! current thread owns. Coordinates are arena slices of index values, compared
//! by content, so two coordinates built from the same axis values are the same
//! key.

use crate::core::{CompileError, CompileResult};
use crate::lir::{AddrSpace, Scalar, Ty, Val};
use crate::tile_ir::{ElemType, ScalarType, ValueId};
use hashbrown::hash_map::Entry;
use hashbrown::HashMap;

/// Index tuple of one tile element; empty for scalars.
pub type Coord<'arena> = &'arena [Val];

/// Write-once map from `(value, coordinate)` to the low-level value.
#[derive(Debug, Default)]
pub struct ValueTable<'arena> {
    entries: HashMap<(ValueId, Coord<'arena>), Val>,
}

impl<'arena> ValueTable<'arena> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn define(&mut self, value: ValueId, coord: Coord<'arena>, val: Val) -> CompileResult<()> {
        match self.entries.entry((value, coord)) {
            Entry::Occupied(_) => Err(CompileError::internal(format!(
                "value {} defined twice at coordinate {coord:?}",
                value.0
            ))),
            Entry::Vacant(slot) => {
                slot.insert(val);
                Ok(())
            }
        }
    }

    pub fn get(&self, value: ValueId, coord: Coord<'arena>) -> CompileResult<Val> {
        self.entries.get(&(value, coord)).copied().ok_or_else(|| {
            CompileError::internal(format!(
                "value {} read before write at coordinate {coord:?}",
                value.0
            ))
        })
    }

    pub fn contains(&self, value: ValueId, coord: Coord<'arena>) -> bool {
        self.entries.contains_key(&(value, coord))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Register type of a tile element. Narrow floats travel as raw integer bits.
pub fn lir_scalar(elem: ElemType) -> Scalar {
    match elem {
        ElemType::I1 => Scalar::I1,
        ElemType::I8 | ElemType::Fp8 => Scalar::I8,
        ElemType::I16 | ElemType::Bf16 => Scalar::I16,
        ElemType::I32 => Scalar::I32,
        ElemType::I64 => Scalar::I64,
        ElemType::F16 => Scalar::F16,
        ElemType::F32 => Scalar::F32,
        ElemType::F64 => Scalar::F64,
    }
}

pub fn scalar_of(scalar: ScalarType) -> CompileResult<Scalar> {
    match scalar {
        ScalarType::Void => Err(CompileError::internal("void value used as data")),
        ScalarType::Elem(e) => Ok(lir_scalar(e)),
        ScalarType::Ptr(_, space) => Ok(Scalar::Ptr(AddrSpace::from_index(space)?)),
    }
}

pub fn ty_of(scalar: ScalarType) -> CompileResult<Ty> {
    match scalar {
        ScalarType::Void => Ok(Ty::Void),
        other => scalar_of(other).map(Ty::Scalar),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_utils::test::TestContext;
    use crate::lir::ConstId;

    #[test]
    fn test_define_is_write_once() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let mut table = ValueTable::new();
        let coord = session.alloc_slice(&[Val::Param(0)]);
        table.define(ValueId(3), coord, Val::Param(1)).unwrap();
        let err = table.define(ValueId(3), coord, Val::Param(2)).unwrap_err();
        assert!(matches!(err, CompileError::Internal { .. }));
        assert_eq!(table.get(ValueId(3), coord).unwrap(), Val::Param(1));
    }

    #[test]
    fn test_read_before_write_is_internal() {
        let table = ValueTable::new();
        let err = table.get(ValueId(7), &[]).unwrap_err();
        assert!(err.to_string().contains("read before write"));
    }

    #[test]
    fn test_coordinates_compare_by_content() {
        let ctx = TestContext::new();
        let session = ctx.create_session();
        let mut table = ValueTable::new();
        let a = session.alloc_slice(&[Val::Const(ConstId(0)), Val::Param(2)]);
        let b = session.alloc_slice(&[Val::Const(ConstId(0)), Val::Param(2)]);
        table.define(ValueId(0), a, Val::Param(5)).unwrap();
        assert!(table.contains(ValueId(0), b));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_type_mapping() {
        assert_eq!(lir_scalar(ElemType::Bf16), Scalar::I16);
        assert_eq!(lir_scalar(ElemType::Fp8), Scalar::I8);
        assert_eq!(
            ty_of(ScalarType::Ptr(ElemType::F32, 3)).unwrap(),
            Ty::ptr(AddrSpace::Shared)
        );
        assert_eq!(ty_of(ScalarType::Void).unwrap(), Ty::Void);
        assert!(scalar_of(ScalarType::Ptr(ElemType::F32, 7))
            .unwrap_err()
            .is_unsupported());
    }
}
