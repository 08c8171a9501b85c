use std::ops::Range;

use log::{debug, trace};
use serde::Serialize;

use crate::{
    error::{ConfigError, RangeError, Result},
    memory::Memory,
    replace::{lru::Lru, Replace},
};

/// A byte address split into its cache coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Addr {
    pub offset: usize,
    pub set: usize,
    pub tag: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BitSection {
    shift: u32,
    mask: u64,
}

impl BitSection {
    fn apply(&self, num: u64) -> u64 {
        (num >> self.shift) & self.mask
    }
}

/// Shape of the cache, fixed for the lifetime of a simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Geometry {
    pub block_size: usize,
    pub n_ways: usize,
    pub n_sets: usize,
    #[serde(skip)]
    offset_sec: BitSection,
    #[serde(skip)]
    set_sec: BitSection,
    #[serde(skip)]
    tag_shift: u32,
}

impl Geometry {
    /// Derives the set count from a total size in bytes.
    ///
    /// A cache too small to hold one full set still gets one set.
    pub fn new(
        total_size: usize,
        n_ways: usize,
        block_size: usize,
    ) -> std::result::Result<Self, ConfigError> {
        if !block_size.is_power_of_two() {
            return Err(ConfigError::BlockSize(block_size));
        }
        if n_ways == 0 {
            return Err(ConfigError::NoWays);
        }
        let n_sets = (total_size / block_size / n_ways).max(1);
        if !n_sets.is_power_of_two() {
            return Err(ConfigError::SetCount(n_sets));
        }
        let capacity = n_sets
            .checked_mul(n_ways)
            .and_then(|blocks| blocks.checked_mul(block_size))
            .filter(|&bytes| bytes <= isize::MAX as usize);
        if capacity.is_none() {
            return Err(ConfigError::Overflow {
                n_sets,
                n_ways,
                block_size,
            });
        }

        let offset_bits = block_size.ilog2();
        let index_bits = n_sets.ilog2();
        Ok(Geometry {
            block_size,
            n_ways,
            n_sets,
            offset_sec: BitSection {
                shift: 0,
                mask: block_size as u64 - 1,
            },
            set_sec: BitSection {
                shift: offset_bits,
                mask: n_sets as u64 - 1,
            },
            tag_shift: offset_bits + index_bits,
        })
    }

    pub fn offset_bits(&self) -> u32 {
        self.set_sec.shift
    }

    pub fn index_bits(&self) -> u32 {
        self.tag_shift - self.set_sec.shift
    }

    /// Bytes of data the cache can hold.
    pub fn capacity(&self) -> usize {
        self.n_sets * self.n_ways * self.block_size
    }

    pub fn split_addr(&self, addr: u64) -> Addr {
        Addr {
            offset: self.offset_sec.apply(addr) as usize,
            set: self.set_sec.apply(addr) as usize,
            tag: addr.checked_shr(self.tag_shift).unwrap_or(0),
        }
    }

    /// Base address of the block identified by `tag` in `set`.
    pub fn block_addr(&self, tag: u64, set: usize) -> u64 {
        tag.checked_shl(self.tag_shift).unwrap_or(0) | ((set as u64) << self.set_sec.shift)
    }
}

/// Metadata for one slot of a set. The block bytes live in the cache's data arena.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Way {
    pub valid: bool,
    pub dirty: bool,
    pub tag: u64,
    /// Accesses to the set since this way was last touched.
    pub age: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request<'a> {
    Load { addr: u64, size: usize },
    Store { addr: u64, value: &'a [u8] },
}

impl Request<'_> {
    pub fn addr(&self) -> u64 {
        match *self {
            Request::Load { addr, .. } | Request::Store { addr, .. } => addr,
        }
    }

    pub fn size(&self) -> usize {
        match *self {
            Request::Load { size, .. } => size,
            Request::Store { value, .. } => value.len(),
        }
    }
}

/// Result of one access. `data` holds the loaded bytes and is empty for stores.
#[derive(Debug, PartialEq, Eq)]
pub struct AccessResult<'a> {
    pub hit: bool,
    pub data: &'a [u8],
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CacheStats {
    #[serde(flatten)]
    pub geometry: Geometry,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub writebacks: u64,
    pub miss_rate: f64,
}

/// Write-back, write-allocate set-associative cache.
#[derive(Debug)]
pub struct Cache<R: Replace = Lru> {
    geometry: Geometry,
    ways: Vec<Way>,
    data: Vec<u8>,
    repl: R,
    hits: u64,
    misses: u64,
    evictions: u64,
    writebacks: u64,
}

impl Cache<Lru> {
    pub fn new(geometry: Geometry) -> Self {
        Cache::with_policy(geometry, Lru::new())
    }
}

impl<R: Replace> Cache<R> {
    pub fn with_policy(geometry: Geometry, repl: R) -> Self {
        debug!(
            "cache: {} sets x {} ways x {} byte blocks ({} offset bits, {} index bits)",
            geometry.n_sets,
            geometry.n_ways,
            geometry.block_size,
            geometry.offset_bits(),
            geometry.index_bits()
        );
        let n_blocks = geometry.n_sets * geometry.n_ways;
        Cache {
            geometry,
            ways: vec![Way::default(); n_blocks],
            data: vec![0; n_blocks * geometry.block_size],
            repl,
            hits: 0,
            misses: 0,
            evictions: 0,
            writebacks: 0,
        }
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn split_addr(&self, addr: u64) -> Addr {
        self.geometry.split_addr(addr)
    }

    fn set_range(&self, set: usize) -> Range<usize> {
        set * self.geometry.n_ways..(set + 1) * self.geometry.n_ways
    }

    fn block_range(&self, slot: usize) -> Range<usize> {
        slot * self.geometry.block_size..(slot + 1) * self.geometry.block_size
    }

    /// The ways of `set`, in way order.
    pub fn set(&self, set: usize) -> &[Way] {
        &self.ways[self.set_range(set)]
    }

    /// The buffered bytes of `way` in `set`, whether or not the way is valid.
    pub fn block(&self, set: usize, way: usize) -> &[u8] {
        let slot = self.set_range(set).start + way;
        &self.data[self.block_range(slot)]
    }

    /// Performs one load or store, filling from and writing back to `mem` on a miss.
    ///
    /// The request is range checked before anything is touched, so an error leaves
    /// both the cache and the memory unchanged.
    pub fn access<M: Memory + ?Sized>(
        &mut self,
        mem: &mut M,
        req: Request<'_>,
    ) -> Result<AccessResult<'_>> {
        let addr = req.addr();
        let size = req.size();
        let Addr { offset, set, tag } = self.split_addr(addr);
        self.check_range(mem, addr, offset, size)?;

        let set_range = self.set_range(set);
        let hit = self.ways[set_range.clone()]
            .iter()
            .position(|w| w.valid && w.tag == tag);

        let way = match hit {
            Some(way) => {
                self.hits += 1;
                way
            }
            None => {
                self.misses += 1;
                let victim = self.repl.victim(&self.ways[set_range.clone()]);
                self.fill(mem, set, victim, tag, addr - offset as u64);
                victim
            }
        };
        trace!(
            "{:#x}: tag {:#x} set {} offset {} -> way {} {}",
            addr,
            tag,
            set,
            offset,
            way,
            if hit.is_some() { "hit" } else { "miss" }
        );

        let slot = set_range.start + way;
        let start = self.block_range(slot).start + offset;
        let bytes = start..start + size;
        if let Request::Store { value, .. } = req {
            self.data[bytes.clone()].copy_from_slice(value);
            self.ways[slot].dirty = true;
        }
        self.repl.touch(&mut self.ways[set_range], way);

        let data: &[u8] = match req {
            Request::Load { .. } => &self.data[bytes],
            Request::Store { .. } => &[],
        };
        Ok(AccessResult {
            hit: hit.is_some(),
            data,
        })
    }

    fn check_range<M: Memory + ?Sized>(
        &self,
        mem: &M,
        addr: u64,
        offset: usize,
        size: usize,
    ) -> std::result::Result<(), RangeError> {
        let block_size = self.geometry.block_size;
        if size == 0 {
            return Err(RangeError::Empty(addr));
        }
        if offset.checked_add(size).map_or(true, |end| end > block_size) {
            return Err(RangeError::SpansBlock {
                offset,
                size,
                block_size,
            });
        }
        let memory_size = mem.size();
        let block_end = (addr - offset as u64).checked_add(block_size as u64);
        match block_end {
            Some(end) if end <= memory_size => Ok(()),
            _ => Err(RangeError::OutOfMemory { addr, memory_size }),
        }
    }

    /// Replaces the block in `way` with the block at `base`, writing the old one
    /// back to its own address first if it is dirty.
    fn fill<M: Memory + ?Sized>(
        &mut self,
        mem: &mut M,
        set: usize,
        way: usize,
        tag: u64,
        base: u64,
    ) {
        let slot = self.set_range(set).start + way;
        let block = self.block_range(slot);
        let victim = self.ways[slot];

        if victim.valid {
            self.evictions += 1;
            if victim.dirty {
                let victim_addr = self.geometry.block_addr(victim.tag, set);
                trace!("write back set {} way {} to {:#x}", set, way, victim_addr);
                mem.write_block(victim_addr, &self.data[block.clone()]);
                self.writebacks += 1;
            }
        }

        mem.read_block(base, &mut self.data[block]);
        self.ways[slot] = Way {
            valid: true,
            dirty: false,
            tag,
            age: 0,
        };
    }

    pub fn stats(&self) -> CacheStats {
        let total = self.hits + self.misses;
        let miss_rate = if total == 0 {
            0.0
        } else {
            self.misses as f64 / total as f64
        };
        CacheStats {
            geometry: self.geometry,
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            writebacks: self.writebacks,
            miss_rate,
        }
    }

    pub fn clear_stats(&mut self) {
        self.hits = 0;
        self.misses = 0;
        self.evictions = 0;
        self.writebacks = 0;
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::*;
    use crate::memory::FlatMemory;

    /// Records every block written back so tests can check where dirty data went.
    struct SpyMemory {
        inner: FlatMemory,
        writes: Vec<(u64, Vec<u8>)>,
    }

    impl SpyMemory {
        fn new() -> Self {
            SpyMemory {
                inner: FlatMemory::new(16).unwrap(),
                writes: Vec::new(),
            }
        }
    }

    impl Memory for SpyMemory {
        fn size(&self) -> u64 {
            self.inner.size()
        }

        fn read_block(&self, base: u64, buf: &mut [u8]) {
            self.inner.read_block(base, buf)
        }

        fn write_block(&mut self, base: u64, data: &[u8]) {
            self.writes.push((base, data.to_vec()));
            self.inner.write_block(base, data)
        }
    }

    fn load(addr: u64, size: usize) -> Request<'static> {
        Request::Load { addr, size }
    }

    #[test]
    fn geometry_follows_size_ways_and_block() {
        let g = Geometry::new(1024, 1, 64).unwrap();
        assert_eq!((g.n_sets, g.offset_bits(), g.index_bits()), (16, 6, 4));

        let g = Geometry::new(32 * 1024, 4, 32).unwrap();
        assert_eq!((g.n_sets, g.offset_bits(), g.index_bits()), (256, 5, 8));

        // Smaller than a single set.
        let g = Geometry::new(64, 4, 64).unwrap();
        assert_eq!((g.n_sets, g.index_bits()), (1, 0));
    }

    #[test]
    fn geometry_rejects_bad_shapes() {
        assert_eq!(Geometry::new(1024, 1, 48), Err(ConfigError::BlockSize(48)));
        assert_eq!(Geometry::new(1024, 1, 0), Err(ConfigError::BlockSize(0)));
        assert_eq!(Geometry::new(1024, 0, 64), Err(ConfigError::NoWays));
        assert_eq!(Geometry::new(1024, 3, 64), Err(ConfigError::SetCount(5)));
        // One set, but far too many ways to address.
        assert_eq!(
            Geometry::new(1024, 1 << 60, 64),
            Err(ConfigError::Overflow {
                n_sets: 1,
                n_ways: 1 << 60,
                block_size: 64
            })
        );
    }

    #[test]
    fn split_addr_fields() {
        let g = Geometry::new(1024, 1, 64).unwrap();
        assert_eq!(
            g.split_addr(0x1234),
            Addr {
                offset: 0x34,
                set: 0x8,
                tag: 0x4
            }
        );
        // Tag keeps every high bit.
        assert_eq!(g.split_addr(u64::MAX).tag, u64::MAX >> 10);
    }

    #[test]
    fn direct_mapped_scenario() {
        let mut mem = FlatMemory::new(24).unwrap();
        let mut cache = Cache::new(Geometry::new(1024, 1, 64).unwrap());

        assert!(!cache.access(&mut mem, load(0x0, 4)).unwrap().hit);
        assert!(!cache.access(&mut mem, load(0x40, 4)).unwrap().hit);
        // 0x40 lands in set 1, so set 0 still holds block 0.
        assert!(cache.access(&mut mem, load(0x0, 4)).unwrap().hit);
        // Same set, different tag.
        assert!(!cache.access(&mut mem, load(0x400, 4)).unwrap().hit);
        assert!(!cache.access(&mut mem, load(0x0, 4)).unwrap().hit);
    }

    #[test]
    fn two_way_evicts_oldest() {
        let mut mem = FlatMemory::new(24).unwrap();
        // One set of two 16 byte ways: every block collides.
        let mut cache = Cache::new(Geometry::new(32, 2, 16).unwrap());
        let (a, b, c) = (0x000, 0x100, 0x200);

        assert!(!cache.access(&mut mem, load(a, 1)).unwrap().hit);
        assert!(!cache.access(&mut mem, load(b, 1)).unwrap().hit);
        assert!(!cache.access(&mut mem, load(c, 1)).unwrap().hit);

        assert!(cache.access(&mut mem, load(b, 1)).unwrap().hit);
        assert!(cache.access(&mut mem, load(c, 1)).unwrap().hit);
        assert!(!cache.access(&mut mem, load(a, 1)).unwrap().hit);
    }

    #[test]
    fn hit_refreshes_recency() {
        let mut mem = FlatMemory::new(24).unwrap();
        let mut cache = Cache::new(Geometry::new(32, 2, 16).unwrap());

        cache.access(&mut mem, load(0x000, 1)).unwrap();
        cache.access(&mut mem, load(0x100, 1)).unwrap();
        assert!(cache.access(&mut mem, load(0x000, 1)).unwrap().hit);
        // 0x100 is now the oldest.
        cache.access(&mut mem, load(0x200, 1)).unwrap();
        assert!(cache.access(&mut mem, load(0x000, 1)).unwrap().hit);
        assert!(!cache.access(&mut mem, load(0x100, 1)).unwrap().hit);
    }

    #[test]
    fn store_miss_allocates_dirty_block() {
        let mut mem = FlatMemory::new(24).unwrap();
        mem.write_block(0x40, &[0xaa; 16]);
        let mut cache = Cache::new(Geometry::new(64, 1, 16).unwrap());

        let res = cache
            .access(
                &mut mem,
                Request::Store {
                    addr: 0x44,
                    value: &[1, 2],
                },
            )
            .unwrap();
        assert!(!res.hit);
        assert!(res.data.is_empty());

        let Addr { set, .. } = cache.split_addr(0x44);
        assert!(cache.set(set)[0].dirty);
        let mut expected = [0xaa; 16];
        expected[4..6].copy_from_slice(&[1, 2]);
        assert_eq!(cache.block(set, 0), &expected);

        let res = cache.access(&mut mem, load(0x43, 4)).unwrap();
        assert_eq!(res, AccessResult { hit: true, data: &[0xaa, 1, 2, 0xaa] });
        // Memory has not seen the store yet.
        let mut backing = [0; 2];
        mem.read_block(0x44, &mut backing);
        assert_eq!(backing, [0xaa, 0xaa]);
    }

    #[test]
    fn write_back_targets_victim_address() {
        let mut mem = SpyMemory::new();
        // 4 sets of 16 bytes, direct mapped: 0x010 and 0x050 share set 1.
        let mut cache = Cache::new(Geometry::new(64, 1, 16).unwrap());

        cache
            .access(&mut mem, Request::Store { addr: 0x012, value: &[0xde, 0xad] })
            .unwrap();
        cache
            .access(&mut mem, Request::Store { addr: 0x01e, value: &[0xbe] })
            .unwrap();
        assert!(mem.writes.is_empty());

        assert!(!cache.access(&mut mem, load(0x054, 4)).unwrap().hit);

        let mut expected = vec![0; 16];
        expected[2] = 0xde;
        expected[3] = 0xad;
        expected[14] = 0xbe;
        assert_eq!(mem.writes, vec![(0x010, expected)]);
        assert_eq!(cache.stats().writebacks, 1);
        assert!(!cache.set(1)[0].dirty);

        // The stored bytes come back from memory on refill.
        let res = cache.access(&mut mem, load(0x012, 2)).unwrap();
        assert_eq!(res.data, &[0xde, 0xad]);
    }

    #[test]
    fn clean_and_invalid_victims_are_not_written_back() {
        let mut mem = SpyMemory::new();
        let mut cache = Cache::new(Geometry::new(64, 1, 16).unwrap());

        cache.access(&mut mem, load(0x010, 1)).unwrap();
        cache.access(&mut mem, load(0x050, 1)).unwrap();
        assert!(mem.writes.is_empty());
        let stats = cache.stats();
        assert_eq!((stats.evictions, stats.writebacks), (1, 0));
    }

    #[test]
    fn range_errors_leave_state_untouched() {
        let mut mem = FlatMemory::new(12).unwrap();
        let mut cache = Cache::new(Geometry::new(64, 1, 16).unwrap());

        let err = cache.access(&mut mem, load(0x0e, 4)).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Range(RangeError::SpansBlock {
                offset: 14,
                size: 4,
                block_size: 16
            })
        ));
        let err = cache.access(&mut mem, load(0x1000, 1)).unwrap_err();
        assert!(matches!(err, crate::Error::Range(RangeError::OutOfMemory { .. })));
        let err = cache.access(&mut mem, load(0x0, 0)).unwrap_err();
        assert!(matches!(err, crate::Error::Range(RangeError::Empty(0))));
        // A size that wraps the block offset is still a span error.
        let err = cache.access(&mut mem, load(0x1, usize::MAX)).unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Range(RangeError::SpansBlock {
                offset: 1,
                size: usize::MAX,
                block_size: 16
            })
        ));

        assert!(cache.set(0).iter().all(|w| !w.valid));
        assert_eq!(cache.stats().misses, 0);
    }

    #[test]
    fn stats_count_and_clear() {
        let mut mem = FlatMemory::new(24).unwrap();
        let mut cache = Cache::new(Geometry::new(1024, 2, 64).unwrap());
        cache.access(&mut mem, load(0x0, 4)).unwrap();
        cache.access(&mut mem, load(0x0, 4)).unwrap();
        cache.access(&mut mem, load(0x4, 4)).unwrap();
        cache.access(&mut mem, load(0x1000, 4)).unwrap();

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (2, 2));
        assert_eq!(stats.miss_rate, 0.5);

        cache.clear_stats();
        assert_eq!(cache.stats().hits, 0);
        assert!(cache.access(&mut mem, load(0x0, 4)).unwrap().hit);
    }

    proptest! {
        #[test]
        fn geometry_covers_rounded_capacity(
            block_bits in 0u32..8,
            way_bits in 0u32..4,
            set_bits in 0u32..8,
            slack in 0usize..4096,
        ) {
            let block = 1usize << block_bits;
            let ways = 1usize << way_bits;
            let unit = block * ways;
            let total = (unit << set_bits) + slack % unit;
            let g = Geometry::new(total, ways, block).unwrap();
            prop_assert!(g.n_sets >= 1);
            prop_assert_eq!(g.capacity(), total / unit * unit);
        }

        #[test]
        fn split_addr_round_trips(
            addr in any::<u64>(),
            block_bits in 0u32..12,
            ways in 1usize..8,
            set_bits in 0u32..12,
        ) {
            let block = 1usize << block_bits;
            let g = Geometry::new((block * ways) << set_bits, ways, block).unwrap();
            let Addr { offset, set, tag } = g.split_addr(addr);
            prop_assert_eq!(g.block_addr(tag, set) | offset as u64, addr);
        }

        #[test]
        fn no_duplicate_tags_in_a_set(addrs in prop::collection::vec(0u64..0x2000, 1..200)) {
            let mut mem = FlatMemory::new(16).unwrap();
            let mut cache = Cache::new(Geometry::new(256, 4, 16).unwrap());
            for addr in addrs {
                cache.access(&mut mem, load(addr, 1)).unwrap();
                for set in 0..cache.geometry().n_sets {
                    let live: Vec<u64> = cache.set(set).iter().filter(|w| w.valid).map(|w| w.tag).collect();
                    let mut unique = live.clone();
                    unique.sort_unstable();
                    unique.dedup();
                    prop_assert_eq!(unique.len(), live.len());
                }
            }
        }
    }
}
