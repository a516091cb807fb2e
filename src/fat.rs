use std::sync::{Arc, Mutex, PoisonError};

use bytemuck::{AnyBitPattern, NoUninit};
use endify::Endify;

use crate::{boot::Geometry, disk::SectorSource};

/// exFAT cluster numbers are 28 bits wide; the top nibble of a FAT entry is
/// reserved and ignored.
const CLUSTER_MASK: u32 = 0x0FFF_FFFF;
const BAD_CLUSTER: u32 = 0x0FFF_FFF7;
const END_OF_CHAIN_MIN: u32 = 0x0FFF_FFF8;

/// One raw 32-bit little-endian FAT slot.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, PartialOrd, Ord, PartialEq, Eq, AnyBitPattern, NoUninit, Endify)]
pub(crate) struct FatEntry(pub(crate) u32);

impl FatEntry {
    pub(crate) fn decode(self) -> ChainEntry {
        match self.0 & CLUSTER_MASK {
            0 => ChainEntry::Free,
            BAD_CLUSTER => ChainEntry::BadCluster,
            n if n >= END_OF_CHAIN_MIN => ChainEntry::EndOfChain,
            n => ChainEntry::Next(n),
        }
    }
}

/// Interpreted FAT slot value.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChainEntry {
    /// The chain continues at this cluster.
    Next(u32),
    EndOfChain,
    BadCluster,
    Free,
}

/// Number of FAT sectors kept in memory at once.
const CACHE_WAYS: usize = 4;

struct CacheSlot {
    sector: u64,
    ttl: u64,
    buf: Vec<u8>,
}

struct SectorCache {
    slots: Vec<CacheSlot>,
    clock: u64,
}

/// Random-access view of the active FAT. Reads go through a small
/// least-recently-used cache of sector buffers; the whole accessor is safe
/// to share across threads.
pub(crate) struct Fat {
    geom: Arc<Geometry>,
    source: Arc<dyn SectorSource>,
    cache: Mutex<SectorCache>,
}

impl Fat {
    pub(crate) fn new(geom: Arc<Geometry>, source: Arc<dyn SectorSource>) -> Fat {
        Fat {
            geom,
            source,
            cache: Mutex::new(SectorCache {
                slots: Vec::with_capacity(CACHE_WAYS),
                clock: 0,
            }),
        }
    }

    /// Looks up the FAT slot for `cluster` and interprets it.
    ///
    /// Out-of-heap cluster numbers decode to [`ChainEntry::EndOfChain`] so a
    /// chain walk over corrupted input terminates instead of reading past
    /// the table.
    pub(crate) fn next(&self, cluster: u32) -> std::io::Result<ChainEntry> {
        if !self.geom.in_heap(cluster) {
            return Ok(ChainEntry::EndOfChain);
        }

        let bps = self.geom.bytes_per_sector as u64;
        let entry_offset = self.geom.fat_offset_sectors as u64 * bps + 4 * cluster as u64;
        let sector = entry_offset / bps;
        let in_sector = (entry_offset % bps) as usize;

        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.clock += 1;
        let clock = cache.clock;

        if let Some(slot) = cache.slots.iter_mut().find(|s| s.sector == sector) {
            slot.ttl = clock;
            let raw = FatEntry(u32::from_le_bytes(
                slot.buf[in_sector..in_sector + 4].try_into().unwrap(),
            ));
            return Ok(raw.decode());
        }

        let mut buf = vec![0u8; bps as usize];
        self.source.read_exact_at(sector * bps, &mut buf)?;
        let raw = FatEntry(u32::from_le_bytes(
            buf[in_sector..in_sector + 4].try_into().unwrap(),
        ));

        if cache.slots.len() < CACHE_WAYS {
            cache.slots.push(CacheSlot {
                sector,
                ttl: clock,
                buf,
            });
        } else if let Some(victim) = cache.slots.iter_mut().min_by_key(|s| s.ttl) {
            victim.sector = sector;
            victim.ttl = clock;
            victim.buf = buf;
        }

        Ok(raw.decode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ImageBuilder;

    #[test]
    fn test_fat_entry_decode() {
        assert_eq!(FatEntry(0).decode(), ChainEntry::Free);
        assert_eq!(FatEntry(5).decode(), ChainEntry::Next(5));
        // top nibble is ignored
        assert_eq!(FatEntry(0xF000_0005).decode(), ChainEntry::Next(5));
        assert_eq!(FatEntry(0xFFFF_FFF7).decode(), ChainEntry::BadCluster);
        assert_eq!(FatEntry(0xFFFF_FFF8).decode(), ChainEntry::EndOfChain);
        assert_eq!(FatEntry(0xFFFF_FFFF).decode(), ChainEntry::EndOfChain);
    }

    #[test]
    fn test_fat_chain_lookup_and_cache_reuse() {
        let mut img = ImageBuilder::new();
        img.chain(&[5, 6, 7]);
        let (source, geom) = img.build();
        let fat = Fat::new(Arc::new(geom), Arc::new(source));

        assert_eq!(fat.next(5).unwrap(), ChainEntry::Next(6));
        assert_eq!(fat.next(6).unwrap(), ChainEntry::Next(7));
        assert_eq!(fat.next(7).unwrap(), ChainEntry::EndOfChain);
        assert_eq!(fat.next(8).unwrap(), ChainEntry::Free);
        // out of heap
        assert_eq!(fat.next(0).unwrap(), ChainEntry::EndOfChain);
        assert_eq!(fat.next(u32::MAX).unwrap(), ChainEntry::EndOfChain);

        // repeated lookups are served from the cached sector
        for _ in 0..100 {
            assert_eq!(fat.next(5).unwrap(), ChainEntry::Next(6));
        }
        let cache = fat.cache.lock().unwrap();
        assert_eq!(cache.slots.len(), 1);
    }
}
