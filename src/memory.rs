use crate::error::ConfigError;

/// Address width of the default backing memory (16 MiB).
pub const DEFAULT_MEMORY_BITS: u32 = 24;
const MAX_MEMORY_BITS: u32 = 32;

/// Byte-addressable storage behind the cache.
///
/// Callers keep every block inside `0..size()`; the cache checks this before
/// issuing a read or write, so implementations may treat it as a precondition.
pub trait Memory {
    fn size(&self) -> u64;
    /// Fills `buf` with the bytes starting at `base`.
    fn read_block(&self, base: u64, buf: &mut [u8]);
    /// Stores `data` starting at `base`, visible to later reads.
    fn write_block(&mut self, base: u64, data: &[u8]);
}

/// A flat, zero-initialised memory of `1 << bits` bytes.
#[derive(Debug, Clone)]
pub struct FlatMemory {
    bytes: Vec<u8>,
}

impl FlatMemory {
    pub fn new(bits: u32) -> Result<Self, ConfigError> {
        if bits == 0 || bits > MAX_MEMORY_BITS {
            return Err(ConfigError::MemoryBits(bits));
        }
        Ok(FlatMemory {
            bytes: vec![0; 1 << bits],
        })
    }

    fn span(&self, base: u64, len: usize) -> std::ops::Range<usize> {
        let start = base as usize;
        start..start + len
    }
}

impl Memory for FlatMemory {
    fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read_block(&self, base: u64, buf: &mut [u8]) {
        buf.copy_from_slice(&self.bytes[self.span(base, buf.len())]);
    }

    fn write_block(&mut self, base: u64, data: &[u8]) {
        let span = self.span(base, data.len());
        self.bytes[span].copy_from_slice(data);
    }
}
