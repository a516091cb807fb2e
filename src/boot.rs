use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use checked_num::CheckedU64;

use crate::{disk::SectorSource, error::OpenError};

/// `"EXFAT   "`, including three trailing spaces.
pub(crate) const FS_NAME: [u8; 8] = *b"EXFAT   ";
/// `0xAA55`, stored in the last two bytes of the boot sector.
pub(crate) const BOOT_SIGNATURE: u16 = 0xAA55;
/// Sector index of the backup boot region.
pub(crate) const BACKUP_BOOT_SECTOR: u64 = 12;
/// exFAT reserves cluster numbers 0 and 1; the heap starts at 2.
pub const FIRST_CLUSTER_INDEX: u32 = 2;
/// One directory-entry record is 32 bytes.
pub const RECORD_SIZE: u32 = 32;

/// The Main/Backup Boot Sector structure for an exFAT volume, exactly as it
/// appears on disk (512 bytes, all multi-byte fields little-endian).
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct RawBootSector {
    /// The jump instruction for CPUs to execute bootstrapping instructions in `boot_code`.
    /// - Must be `0xEB 0x76 0x90` in order (low-order byte first).
    pub(crate) jump_boot: [u8; 3],

    /// The name of the file system on the volume.
    /// - Must be `"EXFAT   "` (including three trailing spaces).
    pub(crate) filesystem_name: [u8; 8],

    /// Reserved field corresponding to the FAT12/16/32 BIOS Parameter Block.
    /// - Must be all zeroes to prevent misinterpretation by FAT-based systems.
    pub(crate) _reserved: [u8; 53],

    /// The sector offset from the beginning of the media to the partition that contains the exFAT volume.
    /// - A value of `0` indicates that this field should be ignored.
    pub(crate) partition_offset: u64,

    /// The total size of the exFAT volume in sectors.
    pub(crate) volume_length: u64,

    /// The sector offset from the start of the volume to the First FAT.
    pub(crate) fat_offset: u32,

    /// The number of sectors occupied by each FAT.
    pub(crate) fat_length: u32,

    /// The sector offset from the start of the volume to the Cluster Heap.
    pub(crate) cluster_heap_offset: u32,

    /// The number of clusters in the Cluster Heap.
    pub(crate) cluster_count: u32,

    /// The cluster index of the first cluster in the root directory.
    /// - Must be between `2` (first valid cluster) and `ClusterCount + 1`.
    pub(crate) first_cluster_of_root_directory: u32,

    /// A unique serial number for identifying the volume.
    pub(crate) volume_serial_number: u32,

    /// The revision number of the exFAT structures on the volume.
    /// - The high byte represents the major version, and the low byte represents the minor version.
    pub(crate) file_system_revision: u16,

    /// A set of flags that indicate file system status. See [`VolumeFlags`].
    pub(crate) volume_flags: u16,

    /// The sector size in a power-of-two exponent.
    /// - Valid range: `9` (512 bytes) to `12` (4096 bytes).
    pub(crate) bytes_per_sector_shift: u8,

    /// The number of sectors per cluster in a power-of-two exponent.
    /// - Valid range: `0` (1 sector per cluster) to `25 - BytesPerSectorShift`.
    pub(crate) sectors_per_cluster_shift: u8,

    /// The number of File Allocation Tables (FATs) in the volume.
    /// - `1`: Only the First FAT is present.
    /// - `2`: Used in **TexFAT**, which has a Second FAT and a Second Allocation Bitmap.
    pub(crate) number_of_fats: u8,

    /// Extended INT 13h drive number, useful for bootstrapping.
    pub(crate) drive_select: u8,

    /// The percentage of allocated clusters in the Cluster Heap.
    /// - `0xFF` means the percentage is unknown.
    pub(crate) percent_in_use: u8,

    /// Reserved for future use. Must be set to zero.
    pub(crate) _reserved2: [u8; 7],

    /// The bootstrapping code that is executed if the volume is bootable.
    pub(crate) boot_code: [u8; 390],

    /// Identifies this sector as a boot sector.
    /// - Must be `0xAA55` to be considered valid.
    pub(crate) boot_signature: u16,
}

impl RawBootSector {
    pub(crate) fn looks_like_exfat(&self) -> bool {
        self.filesystem_name == FS_NAME && u16::from_le(self.boot_signature) == BOOT_SIGNATURE
    }
}

bitflags! {
    /// A set of flags that indicate file system status.
    #[derive(Copy, Clone, Debug, Default, Ord, PartialOrd, Eq, PartialEq)]
    pub struct VolumeFlags: u16 {
        /// - **Bit 0**: `ActiveFat` (0 = First FAT, 1 = Second FAT used in TexFAT).
        const ACTIVE_FAT = 1 << 0;
        /// - **Bit 1**: `VolumeDirty` (0 = clean, 1 = dirty).
        const VOLUME_DIRTY = 1 << 1;
        /// - **Bit 2**: `MediaFailure` (0 = no failures, 1 = known media failures).
        const MEDIA_FAILURE = 1 << 2;
        /// - **Bit 3**: `ClearToZero` (should be cleared before modifying file system structures).
        const CLEAR_TO_ZERO = 1 << 3;
    }
}

/// Volume geometry derived from a validated boot sector. Computed once at
/// open time and shared by value (or `Arc`) with every other component.
#[derive(Debug, Clone)]
pub struct Geometry {
    pub bytes_per_sector: u32,
    pub sectors_per_cluster: u32,
    pub bytes_per_cluster: u32,
    pub fat_count: u8,
    pub fat_offset_sectors: u32,
    pub fat_length_sectors: u32,
    pub cluster_heap_offset_sectors: u32,
    pub cluster_count: u32,
    pub first_cluster_number: u32,
    pub last_cluster_number: u32,
    pub root_dir_first_cluster: u32,
    pub volume_length_sectors: u64,
    pub volume_serial: u32,
    pub volume_flags: VolumeFlags,
    pub records_per_sector: u32,
    pub records_per_cluster: u32,
}

impl Geometry {
    /// Reads the boot sector (falling back to the backup copy at sector 12)
    /// and derives the volume geometry, validating every cross-constraint.
    pub(crate) fn read_from<S: SectorSource + ?Sized>(source: &S) -> Result<Geometry, OpenError> {
        let mut buf = [0u8; 512];
        source.read_exact_at(0, &mut buf)?;
        let mut raw: RawBootSector = bytemuck::pod_read_unaligned(&buf);

        if !raw.looks_like_exfat() {
            // damaged main boot region: try the backup copy
            let backup_offset = BACKUP_BOOT_SECTOR * source.sector_size_bytes() as u64;
            source.read_exact_at(backup_offset, &mut buf)?;
            raw = bytemuck::pod_read_unaligned(&buf);
            if !raw.looks_like_exfat() {
                return Err(OpenError::WrongFs);
            }
            log::warn!("main boot sector invalid, using backup at sector {BACKUP_BOOT_SECTOR}");
        }

        Geometry::try_from_raw(&raw)
    }

    pub(crate) fn try_from_raw(raw: &RawBootSector) -> Result<Geometry, OpenError> {
        let bps_shift = raw.bytes_per_sector_shift;
        if !(9..=12).contains(&bps_shift) {
            return Err(OpenError::InvalidBytesPerSectorShift(bps_shift));
        }

        // the sum of both shifts is capped so clusters stay at or below 32MB
        let spc_shift = raw.sectors_per_cluster_shift;
        if bps_shift as u32 + spc_shift as u32 > 25 {
            return Err(OpenError::InvalidSectorsPerClusterShift(spc_shift));
        }

        let fat_count = raw.number_of_fats;
        if ![1, 2].contains(&fat_count) {
            return Err(OpenError::InvalidNumberOfFats(fat_count));
        }

        let fat_offset = u32::from_le(raw.fat_offset);
        let fat_length = u32::from_le(raw.fat_length);
        if fat_length == 0 {
            return Err(OpenError::EmptyFat);
        }

        let volume_length = u64::from_le(raw.volume_length);
        let cluster_heap_offset = u32::from_le(raw.cluster_heap_offset);
        let cluster_count = u32::from_le(raw.cluster_count);

        let fat_bounds_err = || OpenError::FatOutOfBounds {
            offset: fat_offset,
            length: fat_length,
        };
        let fat_end = (CheckedU64::new(fat_offset as u64)
            + fat_length as u64 * fat_count as u64)
            .ok_or(fat_bounds_err())?;
        if fat_offset == 0
            || fat_offset as u64 >= volume_length
            || fat_end > cluster_heap_offset as u64
        {
            return Err(fat_bounds_err());
        }

        let bytes_per_sector = 1u32 << bps_shift;
        let sectors_per_cluster = 1u32 << spc_shift;

        let heap_bounds_err = || OpenError::HeapOutOfBounds {
            offset: cluster_heap_offset,
            clusters: cluster_count,
        };
        let heap_end = (CheckedU64::new(cluster_heap_offset as u64)
            + cluster_count as u64 * sectors_per_cluster as u64)
            .ok_or(heap_bounds_err())?;
        if heap_end > volume_length {
            return Err(heap_bounds_err());
        }

        let first_cluster_number = FIRST_CLUSTER_INDEX;
        let last_cluster_number = first_cluster_number + cluster_count - 1;

        let root = u32::from_le(raw.first_cluster_of_root_directory);
        if root < first_cluster_number || root > last_cluster_number {
            return Err(OpenError::InvalidRootDirectoryClusterIndex(root));
        }

        let records_per_sector = bytes_per_sector / RECORD_SIZE;

        Ok(Geometry {
            bytes_per_sector,
            sectors_per_cluster,
            bytes_per_cluster: bytes_per_sector * sectors_per_cluster,
            fat_count,
            fat_offset_sectors: fat_offset,
            fat_length_sectors: fat_length,
            cluster_heap_offset_sectors: cluster_heap_offset,
            cluster_count,
            first_cluster_number,
            last_cluster_number,
            root_dir_first_cluster: root,
            volume_length_sectors: volume_length,
            volume_serial: u32::from_le(raw.volume_serial_number),
            volume_flags: VolumeFlags::from_bits_truncate(u16::from_le(raw.volume_flags)),
            records_per_sector,
            records_per_cluster: records_per_sector * sectors_per_cluster,
        })
    }

    /// Whether `cluster` addresses a slot of the cluster heap.
    pub fn in_heap(&self, cluster: u32) -> bool {
        (self.first_cluster_number..=self.last_cluster_number).contains(&cluster)
    }

    /// First sector of the given heap cluster.
    pub fn cluster_to_sector(&self, cluster: u32) -> u64 {
        self.cluster_heap_offset_sectors as u64
            + (cluster - self.first_cluster_number) as u64 * self.sectors_per_cluster as u64
    }

    /// Absolute byte offset of the given heap cluster, or `None` when the
    /// cluster lies outside the heap.
    pub fn cluster_offset(&self, cluster: u32) -> Option<u64> {
        self.in_heap(cluster)
            .then(|| self.cluster_to_sector(cluster) * self.bytes_per_sector as u64)
    }

    /// Absolute byte offset of a sector.
    pub fn sector_offset(&self, sector: u64) -> u64 {
        sector * self.bytes_per_sector as u64
    }

    /// Heap cluster containing the given sector, or `None` for sectors
    /// outside the heap. Inverse of [`cluster_to_sector`].
    ///
    /// [`cluster_to_sector`]: Geometry::cluster_to_sector
    pub fn sector_to_cluster(&self, sector: u64) -> Option<u32> {
        let relative = sector.checked_sub(self.cluster_heap_offset_sectors as u64)?;
        let cluster = self.first_cluster_number as u64 + relative / self.sectors_per_cluster as u64;
        u32::try_from(cluster).ok().filter(|c| self.in_heap(*c))
    }

    /// Absolute byte offset where the cluster heap (data area) begins.
    pub fn data_area_offset(&self) -> u64 {
        self.cluster_heap_offset_sectors as u64 * self.bytes_per_sector as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_raw() -> RawBootSector {
        let mut raw = RawBootSector::zeroed();
        raw.jump_boot = [0xEB, 0x76, 0x90];
        raw.filesystem_name = FS_NAME;
        raw.boot_signature = BOOT_SIGNATURE.to_le();
        raw.volume_length = 131072u64.to_le(); // 64 MiB of 512-byte sectors
        raw.fat_offset = 24u32.to_le();
        raw.fat_length = 128u32.to_le();
        raw.cluster_heap_offset = 256u32.to_le();
        raw.cluster_count = 16344u32.to_le(); // (131072 - 256) / 8
        raw.first_cluster_of_root_directory = 4u32.to_le();
        raw.bytes_per_sector_shift = 9;
        raw.sectors_per_cluster_shift = 3; // 4 KiB clusters
        raw.number_of_fats = 1;
        raw
    }

    #[test]
    fn test_geometry_roundtrip() {
        let geom = Geometry::try_from_raw(&valid_raw()).unwrap();
        assert_eq!(geom.bytes_per_sector, 512);
        assert_eq!(geom.sectors_per_cluster, 8);
        assert_eq!(geom.bytes_per_cluster, 4096);
        assert_eq!(geom.records_per_sector, 16);
        assert_eq!(geom.records_per_cluster, 128);
        assert_eq!(
            geom.last_cluster_number - geom.first_cluster_number + 1,
            geom.cluster_count
        );
        assert_eq!(geom.cluster_to_sector(2), 256);
        assert_eq!(geom.cluster_to_sector(3), 264);
        assert_eq!(geom.cluster_offset(1), None);
        assert_eq!(geom.sector_to_cluster(256), Some(2));
        assert_eq!(geom.sector_to_cluster(271), Some(3));
        assert_eq!(geom.sector_to_cluster(0), None);
    }

    #[test]
    fn test_geometry_rejects_bad_shifts() {
        let mut raw = valid_raw();
        raw.bytes_per_sector_shift = 8;
        assert!(matches!(
            Geometry::try_from_raw(&raw),
            Err(OpenError::InvalidBytesPerSectorShift(8))
        ));

        let mut raw = valid_raw();
        raw.sectors_per_cluster_shift = 17; // 9 + 17 > 25
        assert!(matches!(
            Geometry::try_from_raw(&raw),
            Err(OpenError::InvalidSectorsPerClusterShift(17))
        ));
    }

    #[test]
    fn test_geometry_rejects_bad_layout() {
        let mut raw = valid_raw();
        raw.number_of_fats = 3;
        assert!(matches!(
            Geometry::try_from_raw(&raw),
            Err(OpenError::InvalidNumberOfFats(3))
        ));

        let mut raw = valid_raw();
        raw.fat_length = 0;
        assert!(matches!(Geometry::try_from_raw(&raw), Err(OpenError::EmptyFat)));

        let mut raw = valid_raw();
        raw.cluster_count = u32::MAX.to_le();
        assert!(matches!(
            Geometry::try_from_raw(&raw),
            Err(OpenError::HeapOutOfBounds { .. })
        ));

        let mut raw = valid_raw();
        raw.first_cluster_of_root_directory = 1u32.to_le();
        assert!(matches!(
            Geometry::try_from_raw(&raw),
            Err(OpenError::InvalidRootDirectoryClusterIndex(1))
        ));
    }

    #[test]
    fn test_raw_boot_sector_layout() {
        assert_eq!(size_of::<RawBootSector>(), 512);
    }
}
