// Analysis results consumed by the code generator. Layout assignment and shared memory
// allocation are computed elsewhere; the generator only reads them through the LayoutQuery
// and AllocationQuery traits defined here. LayoutTable is an in-memory implementation
// filled by the tile IR parser (layout declarations and `#layout` annotations) or by tests,
// and Allocation is a simple bump planner that assigns one region per shared layout and per
// value that needs scratch space.

//! Read-only analysis queries used during lowering.

pub mod allocation;
pub mod layout;

use crate::tile_ir::ValueId;
use hashbrown::HashMap;

pub use allocation::{AllocKey, Allocation, AllocationQuery};
pub use layout::{
    reduce_scratch_shape, Buffering, Layout, LayoutId, MmaLayout, ScanlineLayout, SharedLayout,
};

/// Layout assignment of tile values.
pub trait LayoutQuery {
    /// Layout of a tile value, if it has one.
    fn layout_of(&self, value: ValueId) -> Option<LayoutId>;

    fn layout(&self, id: LayoutId) -> &Layout;

    /// Every layout known to the analysis.
    fn layout_ids(&self) -> Vec<LayoutId>;

    /// Number of contiguous elements along the fastest axis known to start at an
    /// aligned address.
    fn alignment(&self, _value: ValueId) -> u32 {
        1
    }
}

/// In-memory layout assignment.
#[derive(Debug, Clone, Default)]
pub struct LayoutTable {
    layouts: Vec<Layout>,
    assignment: HashMap<ValueId, LayoutId>,
    alignment: HashMap<ValueId, u32>,
}

impl LayoutTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_layout(&mut self, layout: Layout) -> LayoutId {
        let id = LayoutId(self.layouts.len() as u32);
        self.layouts.push(layout);
        id
    }

    /// Replace a layout, e.g. to attach buffering once the loop values exist.
    pub fn set_layout(&mut self, id: LayoutId, layout: Layout) {
        self.layouts[id.0 as usize] = layout;
    }

    pub fn assign(&mut self, value: ValueId, layout: LayoutId) {
        self.assignment.insert(value, layout);
    }

    pub fn set_alignment(&mut self, value: ValueId, alignment: u32) {
        self.alignment.insert(value, alignment);
    }

    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty()
    }
}

impl LayoutQuery for LayoutTable {
    fn layout_of(&self, value: ValueId) -> Option<LayoutId> {
        self.assignment.get(&value).copied()
    }

    fn layout(&self, id: LayoutId) -> &Layout {
        &self.layouts[id.0 as usize]
    }

    fn layout_ids(&self) -> Vec<LayoutId> {
        (0..self.layouts.len() as u32).map(LayoutId).collect()
    }

    fn alignment(&self, value: ValueId) -> u32 {
        self.alignment.get(&value).copied().unwrap_or(1)
    }
}
