//! Simulated address spaces.
//!
//! Global memory is a list of host-created allocations placed from
//! [`GLOBAL_BASE`] upwards. Shared memory is one arena per block, addressed
//! from [`SHARED_BASE`]; it is reset before every block runs.

use super::error::{SimError, SimResult};

/// Address of the first global allocation. Lower addresses are never valid.
pub const GLOBAL_BASE: u64 = 0x1000;
/// Address of the shared memory arena of the running block.
pub const SHARED_BASE: u64 = 1 << 40;

const ALIGN: u64 = 256;

#[derive(Debug, Clone, Default)]
pub struct Memory {
    global: Vec<u8>,
    /// `(start, len)` of every allocation.
    allocations: Vec<(u64, u64)>,
    shared: Vec<u8>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `bytes` zeroed bytes of global memory.
    pub fn alloc(&mut self, bytes: usize) -> u64 {
        let start = GLOBAL_BASE + (self.global.len() as u64).next_multiple_of(ALIGN);
        let end = start + bytes as u64;
        self.global.resize((end - GLOBAL_BASE) as usize, 0);
        self.allocations.push((start, bytes as u64));
        start
    }

    pub fn reset_shared(&mut self, bytes: u32) {
        self.shared.clear();
        self.shared.resize(bytes as usize, 0);
    }

    fn global_range(&self, address: u64, len: usize) -> SimResult<std::ops::Range<usize>> {
        let end = address.checked_add(len as u64);
        let inside = self
            .allocations
            .iter()
            .any(|&(start, size)| address >= start && end.is_some_and(|e| e <= start + size));
        if !inside {
            return Err(SimError::OutOfBounds { address, len });
        }
        let lo = (address - GLOBAL_BASE) as usize;
        Ok(lo..lo + len)
    }

    fn shared_range(&self, address: u64, len: usize) -> SimResult<std::ops::Range<usize>> {
        let lo = address - SHARED_BASE;
        match lo.checked_add(len as u64) {
            Some(hi) if hi <= self.shared.len() as u64 => Ok(lo as usize..hi as usize),
            _ => Err(SimError::OutOfBounds { address, len }),
        }
    }

    pub fn read(&self, address: u64, len: usize) -> SimResult<&[u8]> {
        if address >= SHARED_BASE {
            let range = self.shared_range(address, len)?;
            Ok(&self.shared[range])
        } else {
            let range = self.global_range(address, len)?;
            Ok(&self.global[range])
        }
    }

    pub fn write(&mut self, address: u64, bytes: &[u8]) -> SimResult<()> {
        let target = if address >= SHARED_BASE {
            let range = self.shared_range(address, bytes.len())?;
            &mut self.shared[range]
        } else {
            let range = self.global_range(address, bytes.len())?;
            &mut self.global[range]
        };
        target.copy_from_slice(bytes);
        Ok(())
    }

    // Typed helpers for host code.

    pub fn write_i32s(&mut self, address: u64, values: &[i32]) -> SimResult<()> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.write(address, &bytes)
    }

    pub fn read_i32s(&self, address: u64, count: usize) -> SimResult<Vec<i32>> {
        let bytes = self.read(address, count * 4)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    pub fn write_f32s(&mut self, address: u64, values: &[f32]) -> SimResult<()> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.write(address, &bytes)
    }

    pub fn read_f32s(&self, address: u64, count: usize) -> SimResult<Vec<f32>> {
        let bytes = self.read(address, count * 4)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    pub fn write_f16s(&mut self, address: u64, values: &[f32]) -> SimResult<()> {
        let bytes: Vec<u8> = values
            .iter()
            .flat_map(|&v| half::f16::from_f32(v).to_le_bytes())
            .collect();
        self.write(address, &bytes)
    }

    pub fn read_f16s(&self, address: u64, count: usize) -> SimResult<Vec<f32>> {
        let bytes = self.read(address, count * 2)?;
        Ok(bytes
            .chunks_exact(2)
            .map(|c| half::f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocations_are_disjoint_and_checked() {
        let mut mem = Memory::new();
        let a = mem.alloc(16);
        let b = mem.alloc(4);
        assert_eq!(a, GLOBAL_BASE);
        assert!(b >= a + 16);
        mem.write_i32s(a, &[1, 2, 3, 4]).unwrap();
        assert_eq!(mem.read_i32s(a + 4, 2).unwrap(), vec![2, 3]);
        assert!(matches!(
            mem.read(a + 12, 8),
            Err(SimError::OutOfBounds { .. })
        ));
        assert!(mem.read(0, 4).is_err());
    }

    #[test]
    fn test_shared_arena_is_reset() {
        let mut mem = Memory::new();
        mem.reset_shared(8);
        mem.write(SHARED_BASE + 4, &[7, 7, 7, 7]).unwrap();
        assert!(mem.write(SHARED_BASE + 6, &[0; 4]).is_err());
        mem.reset_shared(8);
        assert_eq!(mem.read(SHARED_BASE + 4, 4).unwrap(), &[0, 0, 0, 0]);
    }
}
