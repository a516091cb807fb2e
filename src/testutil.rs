//! In-memory exFAT image construction for tests.
//!
//! [`ImageBuilder`] assembles a small but structurally complete volume: a
//! valid boot sector (main and backup), a FAT, an allocation bitmap at
//! cluster 2, and a root directory at cluster 4 carrying the bitmap record.
//! Tests layer directories, files and deliberate damage on top.

use bytemuck::Zeroable;

use crate::{
    boot::{BOOT_SIGNATURE, FS_NAME, Geometry, RawBootSector},
    entry::{set_checksum, FileAttributes, IN_USE_BIT, NAME_UNITS_PER_RECORD},
};

const BITMAP_CLUSTER: u32 = 2;
const FAT_EOC: u32 = 0xFFFF_FFFF;

/// 2023-05-15 10:00:00 in the packed on-disk layout.
const PACKED_TIME: u32 = (((43 << 9) | (5 << 5) | 15) << 16) | (10 << 11);

pub(crate) struct ImageBuilder {
    data: Vec<u8>,
    geom: Geometry,
    root_records: Vec<[u8; 32]>,
    include_bitmap_record: bool,
    bitmap_length: u64,
}

impl ImageBuilder {
    pub(crate) fn new() -> ImageBuilder {
        let mut raw = RawBootSector::zeroed();
        raw.jump_boot = [0xEB, 0x76, 0x90];
        raw.filesystem_name = FS_NAME;
        raw.boot_signature = BOOT_SIGNATURE.to_le();
        raw.volume_length = 131072u64.to_le();
        raw.fat_offset = 24u32.to_le();
        raw.fat_length = 128u32.to_le();
        raw.cluster_heap_offset = 256u32.to_le();
        raw.cluster_count = 16344u32.to_le();
        raw.first_cluster_of_root_directory = 4u32.to_le();
        raw.volume_serial_number = 0xDEAD_BEEFu32.to_le();
        raw.bytes_per_sector_shift = 9;
        raw.sectors_per_cluster_shift = 3;
        raw.number_of_fats = 1;

        let geom = Geometry::try_from_raw(&raw).unwrap();
        let mut data = vec![0u8; geom.volume_length_sectors as usize * 512];
        let boot = bytemuck::bytes_of(&raw);
        data[..512].copy_from_slice(boot);
        data[12 * 512..13 * 512].copy_from_slice(boot);

        let mut img = ImageBuilder {
            data,
            geom,
            root_records: Vec::new(),
            include_bitmap_record: true,
            bitmap_length: 16344u64.div_ceil(8),
        };
        // media descriptor slots plus the bitmap and root metadata clusters
        img.set_fat(0, 0x0FFF_FFF8);
        img.set_fat(1, FAT_EOC);
        img.set_fat(BITMAP_CLUSTER, FAT_EOC);
        img.set_fat(img.geom.root_dir_first_cluster, FAT_EOC);
        img.allocate(BITMAP_CLUSTER);
        img.allocate(img.geom.root_dir_first_cluster);
        img
    }

    pub(crate) fn geometry(&self) -> Geometry {
        self.geom.clone()
    }

    fn cluster_offset(&self, cluster: u32) -> usize {
        self.geom.cluster_offset(cluster).unwrap() as usize
    }

    fn set_fat(&mut self, cluster: u32, value: u32) {
        let off = self.geom.fat_offset_sectors as usize * 512 + 4 * cluster as usize;
        self.data[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Writes a single raw FAT slot, without touching the bitmap.
    pub(crate) fn fat_link(&mut self, cluster: u32, next: u32) {
        self.set_fat(cluster, next);
    }

    /// Marks a cluster live in the allocation bitmap.
    pub(crate) fn allocate(&mut self, cluster: u32) {
        let index = (cluster - self.geom.first_cluster_number) as usize;
        let off = self.cluster_offset(BITMAP_CLUSTER) + index / 8;
        self.data[off] |= 1 << (index % 8);
    }

    /// Chains the given clusters in the FAT (last one gets end-of-chain) and
    /// marks them all live.
    pub(crate) fn chain(&mut self, clusters: &[u32]) {
        for pair in clusters.windows(2) {
            self.set_fat(pair[0], pair[1]);
        }
        if let Some(last) = clusters.last() {
            self.set_fat(*last, FAT_EOC);
        }
        for c in clusters {
            self.allocate(*c);
        }
    }

    /// Appends records to the root directory, after the bitmap record.
    pub(crate) fn add_root(&mut self, records: &[[u8; 32]]) {
        self.root_records.extend_from_slice(records);
    }

    /// Writes a directory's records at the given cluster and marks it live
    /// with an end-of-chain FAT slot.
    pub(crate) fn dir(&mut self, cluster: u32, records: &[[u8; 32]]) {
        let base = self.cluster_offset(cluster);
        for (i, rec) in records.iter().enumerate() {
            self.data[base + i * 32..base + i * 32 + 32].copy_from_slice(rec);
        }
        self.set_fat(cluster, FAT_EOC);
        self.allocate(cluster);
    }

    /// Writes raw records at a cluster without allocating it. Used to plant
    /// deleted directories and orphaned entry sets.
    pub(crate) fn raw_cluster(&mut self, cluster: u32, records: &[[u8; 32]]) {
        let base = self.cluster_offset(cluster);
        for (i, rec) in records.iter().enumerate() {
            self.data[base + i * 32..base + i * 32 + 32].copy_from_slice(rec);
        }
    }

    /// Writes file content bytes at a cluster.
    pub(crate) fn write_cluster(&mut self, cluster: u32, bytes: &[u8]) {
        let base = self.cluster_offset(cluster);
        self.data[base..base + bytes.len()].copy_from_slice(bytes);
    }

    pub(crate) fn omit_bitmap_record(&mut self) {
        self.include_bitmap_record = false;
    }

    /// Stores the given byte length in the bitmap record instead of the
    /// correct one.
    pub(crate) fn corrupt_bitmap_length(&mut self, length: u64) {
        self.bitmap_length = length;
    }

    /// Corrupts the main boot sector. The backup at sector 12 stays valid.
    pub(crate) fn damage_main_boot_sector(&mut self) {
        self.data[..512].fill(0x5A);
    }

    pub(crate) fn build(self) -> (Vec<u8>, Geometry) {
        let mut data = self.data;
        let root = self.geom.cluster_offset(self.geom.root_dir_first_cluster).unwrap() as usize;

        let mut records = Vec::new();
        if self.include_bitmap_record {
            records.push(bitmap_record(BITMAP_CLUSTER, self.bitmap_length, true));
        }
        records.extend_from_slice(&self.root_records);
        for (i, rec) in records.iter().enumerate() {
            data[root + i * 32..root + i * 32 + 32].copy_from_slice(rec);
        }

        (data, self.geom)
    }
}

/// Builds the file/stream/name record sequence for one entry set.
pub(crate) struct EntrySet {
    name_units: Vec<u16>,
    first_cluster: u32,
    size_bytes: u64,
    attributes: FileAttributes,
    in_use: bool,
    no_fat_chain: bool,
}

impl EntrySet {
    pub(crate) fn file(name: &str, first_cluster: u32, size_bytes: u64) -> EntrySet {
        EntrySet::file_with_units(&name.encode_utf16().collect::<Vec<_>>(), first_cluster, size_bytes)
    }

    pub(crate) fn file_with_units(units: &[u16], first_cluster: u32, size_bytes: u64) -> EntrySet {
        EntrySet {
            name_units: units.to_vec(),
            first_cluster,
            size_bytes,
            attributes: FileAttributes::ARCHIVE,
            in_use: true,
            no_fat_chain: false,
        }
    }

    pub(crate) fn dir(name: &str, first_cluster: u32) -> EntrySet {
        let mut set = EntrySet::file(name, first_cluster, 4096);
        set.attributes = FileAttributes::DIRECTORY;
        set
    }

    pub(crate) fn allocated(mut self) -> EntrySet {
        self.in_use = true;
        self
    }

    pub(crate) fn deleted(mut self) -> EntrySet {
        self.in_use = false;
        self
    }

    /// Marks the stream contiguous (no FAT chain).
    pub(crate) fn contiguous(mut self) -> EntrySet {
        self.no_fat_chain = true;
        self
    }

    pub(crate) fn records(&self) -> Vec<[u8; 32]> {
        let name_record_count = self.name_units.len().div_ceil(NAME_UNITS_PER_RECORD).max(1);
        let use_bit = if self.in_use { IN_USE_BIT } else { 0 };

        let mut file = [0u8; 32];
        file[0] = 0x05 | use_bit;
        file[1] = 1 + name_record_count as u8;
        file[4..6].copy_from_slice(&self.attributes.bits().to_le_bytes());
        for off in [8, 12, 16] {
            file[off..off + 4].copy_from_slice(&PACKED_TIME.to_le_bytes());
        }

        let mut stream = [0u8; 32];
        stream[0] = 0x40 | use_bit;
        stream[1] = 0x01 | if self.no_fat_chain { 0x02 } else { 0 };
        stream[3] = self.name_units.len() as u8;
        stream[4..6].copy_from_slice(&name_hash(&self.name_units).to_le_bytes());
        stream[8..16].copy_from_slice(&self.size_bytes.to_le_bytes());
        stream[20..24].copy_from_slice(&self.first_cluster.to_le_bytes());
        stream[24..32].copy_from_slice(&self.size_bytes.to_le_bytes());

        let mut out = vec![file, stream];
        for chunk in self.name_units.chunks(NAME_UNITS_PER_RECORD) {
            let mut name = [0u8; 32];
            name[0] = 0x41 | use_bit;
            for (i, unit) in chunk.iter().enumerate() {
                name[2 + 2 * i..4 + 2 * i].copy_from_slice(&unit.to_le_bytes());
            }
            out.push(name);
        }
        if self.name_units.is_empty() {
            let mut name = [0u8; 32];
            name[0] = 0x41 | use_bit;
            out.push(name);
        }

        let sum = set_checksum(out.iter());
        out[0][2..4].copy_from_slice(&sum.to_le_bytes());
        out
    }
}

fn name_hash(units: &[u16]) -> u16 {
    units
        .iter()
        .flat_map(|u| u.to_le_bytes())
        .fold(0u16, |h, b| h.rotate_right(1).wrapping_add(b as u16))
}

pub(crate) fn volume_label_record(label: &str, in_use: bool) -> [u8; 32] {
    let mut raw = [0u8; 32];
    raw[0] = 0x03 | if in_use { IN_USE_BIT } else { 0 };
    let units: Vec<u16> = label.encode_utf16().collect();
    raw[1] = units.len() as u8;
    for (i, unit) in units.iter().take(NAME_UNITS_PER_RECORD).enumerate() {
        raw[2 + 2 * i..4 + 2 * i].copy_from_slice(&unit.to_le_bytes());
    }
    raw
}

pub(crate) fn bitmap_record(first_cluster: u32, length_bytes: u64, in_use: bool) -> [u8; 32] {
    let mut raw = [0u8; 32];
    raw[0] = 0x01 | if in_use { IN_USE_BIT } else { 0 };
    raw[20..24].copy_from_slice(&first_cluster.to_le_bytes());
    raw[24..32].copy_from_slice(&length_bytes.to_le_bytes());
    raw
}
