//! Stable identities for directory-entry slots.
//!
//! Every 32-byte slot of the cluster heap has a deterministic [`InodeId`]
//! derived from its byte offset; no lookup tables are involved and the
//! mapping inverts in O(1). A handful of IDs below the heap range denote
//! manufactured entries (the root directory, the boot record and the FAT
//! images), and one ID past the heap denotes the synthetic orphan
//! directory.

use std::fmt;

use crate::{
    boot::{Geometry, RECORD_SIZE},
    entry::{Allocation, Entry, EntryKind, FileAttributes},
    timestamp::Timestamps,
};

/// Identity of one directory-entry slot (or one virtual file).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InodeId(pub u64);

impl InodeId {
    /// The root directory.
    pub const ROOT: InodeId = InodeId(1);
    /// The boot record, exposed as a 512-byte virtual file.
    pub const MBR: InodeId = InodeId(2);
    /// The first FAT, exposed as a virtual file.
    pub const FAT1: InodeId = InodeId(3);
    /// The second FAT (TexFAT volumes only).
    pub const FAT2: InodeId = InodeId(4);
}

impl fmt::Display for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// First ID assigned to a real slot; chosen so the reserved IDs above fit
/// below it.
const BASE: u64 = 5;

/// Deterministic mapping between slot byte offsets and [`InodeId`]s for one
/// volume.
#[derive(Debug, Clone)]
pub(crate) struct InodeSpace {
    data_area_offset: u64,
    slot_count: u64,
}

impl InodeSpace {
    pub(crate) fn new(geom: &Geometry) -> InodeSpace {
        let heap_bytes = geom.cluster_count as u64 * geom.bytes_per_cluster as u64;
        InodeSpace {
            data_area_offset: geom.data_area_offset(),
            slot_count: heap_bytes / RECORD_SIZE as u64,
        }
    }

    /// ID of the last real slot.
    pub(crate) fn last(&self) -> InodeId {
        InodeId(BASE + self.slot_count - 1)
    }

    /// The synthetic orphan directory sits one past the slot range.
    pub(crate) fn orphan_dir(&self) -> InodeId {
        InodeId(BASE + self.slot_count)
    }

    /// ID of the slot at the absolute byte `offset`. The offset must be
    /// 32-byte aligned within the cluster heap.
    pub(crate) fn id_of(&self, offset: u64) -> Option<InodeId> {
        if offset < self.data_area_offset {
            return None;
        }
        let index = (offset - self.data_area_offset) / RECORD_SIZE as u64;
        (index < self.slot_count).then_some(InodeId(BASE + index))
    }

    /// Absolute byte offset of a real slot, the inverse of [`id_of`].
    ///
    /// [`id_of`]: InodeSpace::id_of
    pub(crate) fn offset_of(&self, id: InodeId) -> Option<u64> {
        let index = id.0.checked_sub(BASE)?;
        (index < self.slot_count).then_some(self.data_area_offset + index * RECORD_SIZE as u64)
    }

}

fn virtual_entry(id: InodeId, name: &str, kind: EntryKind, size_bytes: u64) -> Entry {
    Entry {
        id,
        parent_id: InodeId::ROOT,
        name: name.to_string(),
        kind,
        attributes: FileAttributes::empty(),
        size_bytes,
        first_cluster: 0,
        fat_chain_valid: false,
        allocation: Allocation::Allocated,
        times: Timestamps::default(),
        name_hash: 0,
        checksum_ok: None,
        diagnostics: Vec::new(),
    }
}

/// The root directory entry. Its size is the resolved length of the root's
/// cluster chain, which the engine computes at open time.
pub(crate) fn root_entry(geom: &Geometry, size_bytes: u64) -> Entry {
    let mut entry = virtual_entry(InodeId::ROOT, "/", EntryKind::Directory, size_bytes);
    entry.attributes = FileAttributes::DIRECTORY;
    entry.first_cluster = geom.root_dir_first_cluster;
    entry.fat_chain_valid = true;
    entry
}

/// The boot record as a 512-byte virtual file at sector 0.
pub(crate) fn mbr_entry() -> Entry {
    virtual_entry(InodeId::MBR, "$MBR", EntryKind::Virtual, 512)
}

/// The n-th FAT (0 or 1) as a virtual file.
pub(crate) fn fat_entry(geom: &Geometry, index: u8) -> Entry {
    let id = if index == 0 { InodeId::FAT1 } else { InodeId::FAT2 };
    let name = if index == 0 { "$FAT1" } else { "$FAT2" };
    let size = geom.fat_length_sectors as u64 * geom.bytes_per_sector as u64;
    virtual_entry(id, name, EntryKind::Virtual, size)
}

/// The synthetic directory that collects unreachable deleted entries.
pub(crate) fn orphan_dir_entry(inodes: &InodeSpace) -> Entry {
    let mut entry = virtual_entry(inodes.orphan_dir(), "$OrphanFiles", EntryKind::Directory, 0);
    entry.attributes = FileAttributes::DIRECTORY;
    entry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::{FS_NAME, BOOT_SIGNATURE, RawBootSector};
    use bytemuck::Zeroable;

    fn geom() -> Geometry {
        let mut raw = RawBootSector::zeroed();
        raw.filesystem_name = FS_NAME;
        raw.boot_signature = BOOT_SIGNATURE.to_le();
        raw.volume_length = 131072u64.to_le();
        raw.fat_offset = 24u32.to_le();
        raw.fat_length = 128u32.to_le();
        raw.cluster_heap_offset = 256u32.to_le();
        raw.cluster_count = 16344u32.to_le();
        raw.first_cluster_of_root_directory = 4u32.to_le();
        raw.bytes_per_sector_shift = 9;
        raw.sectors_per_cluster_shift = 3;
        raw.number_of_fats = 1;
        Geometry::try_from_raw(&raw).unwrap()
    }

    #[test]
    fn test_id_offset_roundtrip() {
        let geom = geom();
        let inodes = InodeSpace::new(&geom);
        let data_start = geom.data_area_offset();

        assert_eq!(inodes.id_of(data_start), Some(InodeId(BASE)));
        assert_eq!(inodes.id_of(data_start + 32), Some(InodeId(BASE + 1)));
        assert_eq!(inodes.id_of(0), None);

        for id in [InodeId(BASE), InodeId(BASE + 1234), inodes.last()] {
            let offset = inodes.offset_of(id).unwrap();
            assert_eq!(inodes.id_of(offset), Some(id));
        }

        // reserved and orphan IDs are not slots
        assert_eq!(inodes.offset_of(InodeId::ROOT), None);
        assert_eq!(inodes.offset_of(InodeId::FAT2), None);
        assert_eq!(inodes.offset_of(inodes.orphan_dir()), None);
    }

    #[test]
    fn test_virtual_entries() {
        let geom = geom();
        let inodes = InodeSpace::new(&geom);

        let root = root_entry(&geom, 4096);
        assert_eq!(root.id, InodeId::ROOT);
        assert!(root.is_dir());
        assert_eq!(root.first_cluster, geom.root_dir_first_cluster);

        assert_eq!(mbr_entry().size_bytes, 512);
        assert_eq!(fat_entry(&geom, 0).size_bytes, 128 * 512);
        assert!(orphan_dir_entry(&inodes).is_dir());
        assert!(orphan_dir_entry(&inodes).id > inodes.last());
    }
}
