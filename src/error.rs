use std::{io, path::PathBuf};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid cache configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("trace line {line}: {reason}")]
    Parse { line: usize, reason: String },
    #[error("access out of range: {0}")]
    Range(#[from] RangeError),
    #[error("cannot read trace {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot write output: {0}")]
    Output(#[from] io::Error),
}

impl Error {
    pub fn parse(line: usize, reason: impl Into<String>) -> Self {
        Error::Parse {
            line,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("block size {0} is not a power of two")]
    BlockSize(usize),
    #[error("associativity must be at least 1")]
    NoWays,
    #[error("cache size of {0} KB overflows")]
    TooLarge(usize),
    #[error("set count {0} is not a power of two")]
    SetCount(usize),
    #[error("memory width of {0} bits is not supported (1..=32)")]
    MemoryBits(u32),
    #[error("{n_sets} sets x {n_ways} ways x {block_size} byte blocks is too large to allocate")]
    Overflow {
        n_sets: usize,
        n_ways: usize,
        block_size: usize,
    },
    #[error("block size {block_size} exceeds memory size {memory_size}")]
    BlockExceedsMemory { block_size: usize, memory_size: u64 },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("{size} byte access at offset {offset} crosses a {block_size} byte block")]
    SpansBlock {
        offset: usize,
        size: usize,
        block_size: usize,
    },
    #[error("zero byte access at {0:#x}")]
    Empty(u64),
    #[error("address {addr:#x} is beyond the {memory_size:#x} byte memory")]
    OutOfMemory { addr: u64, memory_size: u64 },
}
