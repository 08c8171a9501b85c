use std::io::Write;

use log::info;

use crate::{
    cache::{Cache, Geometry},
    error::{ConfigError, Result},
    hex,
    memory::Memory,
    replace::{lru::Lru, Replace},
    trace::Record,
};

/// Replays trace records against a cache and its backing memory, one line of
/// output per record.
#[derive(Debug)]
pub struct Simulator<M: Memory, R: Replace = Lru> {
    cache: Cache<R>,
    memory: M,
    hex_buf: String,
}

impl<M: Memory> Simulator<M> {
    pub fn new(geometry: Geometry, memory: M) -> Result<Self> {
        Simulator::with_cache(Cache::new(geometry), memory)
    }
}

impl<M: Memory, R: Replace> Simulator<M, R> {
    pub fn with_cache(cache: Cache<R>, memory: M) -> Result<Self> {
        let block_size = cache.geometry().block_size;
        if block_size as u64 > memory.size() {
            return Err(ConfigError::BlockExceedsMemory {
                block_size,
                memory_size: memory.size(),
            }
            .into());
        }
        Ok(Simulator {
            cache,
            memory,
            hex_buf: String::with_capacity(2 * block_size),
        })
    }

    pub fn cache(&self) -> &Cache<R> {
        &self.cache
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub fn into_parts(self) -> (Cache<R>, M) {
        (self.cache, self.memory)
    }

    /// Performs a single record and writes its result line.
    pub fn step<W: Write + ?Sized>(&mut self, record: &Record, out: &mut W) -> Result<()> {
        let addr = record.addr();
        let res = self.cache.access(&mut self.memory, record.request())?;
        let outcome = if res.hit { "hit" } else { "miss" };
        match record {
            Record::Load { .. } => {
                hex::encode_into(res.data, &mut self.hex_buf);
                writeln!(out, "load {addr:#x} {outcome} {}", self.hex_buf)?;
            }
            Record::Store { .. } => writeln!(out, "store {addr:#x} {outcome}")?,
        }
        Ok(())
    }

    /// Runs records to exhaustion, stopping at the first error. Lines for records
    /// before the failing one have already been written. Returns the record count.
    pub fn run<I, W>(&mut self, records: I, mut out: W) -> Result<u64>
    where
        I: IntoIterator<Item = Result<Record>>,
        W: Write,
    {
        let mut count = 0;
        for record in records {
            self.step(&record?, &mut out)?;
            count += 1;
        }
        out.flush()?;

        let stats = self.cache.stats();
        info!(
            "{} accesses: {} hits, {} misses, {} evictions, {} write-backs",
            count, stats.hits, stats.misses, stats.evictions, stats.writebacks
        );
        Ok(count)
    }
}
