//! Compilation session: the arena behind coordinate tuples and the
//! statistics gathered while lowering a module.
//!
//! Coordinates are `&'arena [Val]` slices allocated here once per
//! materialization; they are `Copy`, hash by content and outlive every
//! per-function table that keys on them.

use bumpalo::Bump;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;

pub struct CompilationSession<'arena> {
    arena: &'arena Bump,
    stats: RefCell<SessionStats>,
}

impl<'arena> CompilationSession<'arena> {
    pub fn new(arena: &'arena Bump) -> Self {
        Self {
            arena,
            stats: RefCell::new(SessionStats::default()),
        }
    }

    /// Copy `slice` into the session arena.
    pub fn alloc_slice<T: Copy>(&self, slice: &[T]) -> &'arena [T] {
        self.arena.alloc_slice_copy(slice)
    }

    /// Record a finished function of `instructions` low-level instructions.
    pub fn record_function_compiled(&self, name: &str, instructions: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.functions_compiled += 1;
        stats.instructions_emitted += instructions;
        if stats.largest_function.as_ref().map_or(true, |(_, n)| *n < instructions) {
            stats.largest_function = Some((name.to_string(), instructions));
        }
    }

    pub fn record_value_lowered(&self, opcode: &str) {
        let mut stats = self.stats.borrow_mut();
        stats.values_lowered += 1;
        *stats.opcode_counts.entry(opcode.to_string()).or_insert(0) += 1;
    }

    pub fn record_barrier(&self) {
        self.stats.borrow_mut().barriers_emitted += 1;
    }

    pub fn record_shared_bytes(&self, bytes: u32) {
        self.stats.borrow_mut().shared_bytes = bytes;
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    pub functions_compiled: usize,
    /// Tile values visited, in total and per opcode.
    pub values_lowered: usize,
    pub opcode_counts: HashMap<String, usize>,
    pub instructions_emitted: usize,
    /// Name and instruction count of the biggest lowered function.
    pub largest_function: Option<(String, usize)>,
    pub barriers_emitted: usize,
    pub shared_bytes: u32,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "functions:    {}", self.functions_compiled)?;
        writeln!(f, "values:       {}", self.values_lowered)?;
        writeln!(f, "instructions: {}", self.instructions_emitted)?;
        if let Some((name, size)) = &self.largest_function {
            writeln!(f, "largest:      @{name} ({size})")?;
        }
        writeln!(f, "barriers:     {}", self.barriers_emitted)?;
        writeln!(f, "shared bytes: {}", self.shared_bytes)?;
        let mut opcodes: Vec<_> = self.opcode_counts.iter().collect();
        opcodes.sort();
        for (opcode, count) in opcodes {
            writeln!(f, "  {opcode:<18} {count}")?;
        }
        Ok(())
    }
}
