//! Directory-entry records and their classification.
//!
//! Every slot of a directory is one 32-byte record; the type byte at offset
//! 0 selects the layout and its bit 7 says whether the slot is in use. A
//! logical file is an ordered *entry set*: one [`FileEntry`], one
//! [`StreamEntry`] and one or more [`NameEntry`] records, tied together by a
//! secondary count and a 16-bit checksum over the whole set.
//!
//! Records are decoded field by field; no layout is ever reinterpreted
//! through pointer casts.

use bitflags::bitflags;

use crate::{
    boot::Geometry,
    error::Diagnostic,
    inode::InodeId,
    timestamp::{self, Timestamps},
};

pub(crate) mod assembler;

pub(crate) const TYPE_BITMAP: u8 = 0x81;
pub(crate) const TYPE_UPCASE: u8 = 0x82;
pub(crate) const TYPE_VOLUME_LABEL: u8 = 0x83;
pub(crate) const TYPE_FILE: u8 = 0x85;
pub(crate) const TYPE_VOLUME_GUID: u8 = 0xA0;
pub(crate) const TYPE_TEXFAT: u8 = 0xA1;
pub(crate) const TYPE_ACL: u8 = 0xE2;
pub(crate) const TYPE_STREAM: u8 = 0xC0;
pub(crate) const TYPE_NAME: u8 = 0xC1;
/// Bit 7 of the type byte: set while the slot is allocated, cleared on
/// deletion.
pub(crate) const IN_USE_BIT: u8 = 0x80;

/// Up to 15 UTF-16 code units fit in one file-name record.
pub(crate) const NAME_UNITS_PER_RECORD: usize = 15;
/// exFAT caps file names at 255 UTF-16 code units.
pub(crate) const MAX_NAME_UNITS: usize = 255;

fn le16(raw: &[u8; 32], off: usize) -> u16 {
    u16::from_le_bytes([raw[off], raw[off + 1]])
}

fn le32(raw: &[u8; 32], off: usize) -> u32 {
    u32::from_le_bytes(raw[off..off + 4].try_into().unwrap())
}

fn le64(raw: &[u8; 32], off: usize) -> u64 {
    u64::from_le_bytes(raw[off..off + 8].try_into().unwrap())
}

bitflags! {
    /// File attribute word of a file entry (FAT-compatible bit layout).
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct FileAttributes: u16 {
        const READ_ONLY = 0x0001;
        const HIDDEN = 0x0002;
        const SYSTEM = 0x0004;
        const DIRECTORY = 0x0010;
        const ARCHIVE = 0x0020;
    }
}

bitflags! {
    /// General secondary flags of stream extension and file name records.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct SecondaryFlags: u8 {
        const ALLOCATION_POSSIBLE = 1 << 0;
        /// Set when the stream is stored contiguously and the FAT holds no
        /// chain for it.
        const NO_FAT_CHAIN = 1 << 1;
    }
}

/// File entry: the primary record of an entry set.
#[derive(Copy, Clone, Debug)]
pub(crate) struct FileEntry {
    pub(crate) in_use: bool,
    pub(crate) secondary_count: u8,
    pub(crate) set_checksum: u16,
    pub(crate) attributes: FileAttributes,
    pub(crate) create_timestamp: u32,
    pub(crate) modified_timestamp: u32,
    pub(crate) accessed_timestamp: u32,
    pub(crate) create_10ms: u8,
    pub(crate) modified_10ms: u8,
    pub(crate) create_utc_offset: u8,
    pub(crate) modified_utc_offset: u8,
    pub(crate) accessed_utc_offset: u8,
}

impl FileEntry {
    fn decode(raw: &[u8; 32], in_use: bool) -> FileEntry {
        FileEntry {
            in_use,
            secondary_count: raw[1],
            set_checksum: le16(raw, 2),
            attributes: FileAttributes::from_bits_truncate(le16(raw, 4)),
            create_timestamp: le32(raw, 8),
            modified_timestamp: le32(raw, 12),
            accessed_timestamp: le32(raw, 16),
            create_10ms: raw[20],
            modified_10ms: raw[21],
            create_utc_offset: raw[22],
            modified_utc_offset: raw[23],
            accessed_utc_offset: raw[24],
        }
    }

    pub(crate) fn timestamps(&self) -> Timestamps {
        Timestamps {
            created: timestamp::decode(self.create_timestamp, self.create_10ms, self.create_utc_offset),
            modified: timestamp::decode(
                self.modified_timestamp,
                self.modified_10ms,
                self.modified_utc_offset,
            ),
            accessed: timestamp::decode(self.accessed_timestamp, 0, self.accessed_utc_offset),
        }
    }
}

/// Stream extension: carries the data location and the name length/hash.
#[derive(Copy, Clone, Debug)]
pub(crate) struct StreamEntry {
    pub(crate) in_use: bool,
    pub(crate) flags: SecondaryFlags,
    pub(crate) name_length: u8,
    pub(crate) name_hash: u16,
    pub(crate) valid_data_length: u64,
    pub(crate) first_cluster: u32,
    pub(crate) data_length: u64,
}

impl StreamEntry {
    fn decode(raw: &[u8; 32], in_use: bool) -> StreamEntry {
        StreamEntry {
            in_use,
            flags: SecondaryFlags::from_bits_truncate(raw[1]),
            name_length: raw[3],
            name_hash: le16(raw, 4),
            valid_data_length: le64(raw, 8),
            first_cluster: le32(raw, 20),
            data_length: le64(raw, 24),
        }
    }

    /// Clear `NO_FAT_CHAIN` bit means the FAT holds a chain for this stream.
    pub(crate) fn fat_chain_valid(&self) -> bool {
        !self.flags.contains(SecondaryFlags::NO_FAT_CHAIN)
    }
}

/// File name record: one 30-byte fragment of the UTF-16 name.
#[derive(Copy, Clone, Debug)]
pub(crate) struct NameEntry {
    pub(crate) in_use: bool,
    pub(crate) units: [u16; NAME_UNITS_PER_RECORD],
}

impl NameEntry {
    fn decode(raw: &[u8; 32], in_use: bool) -> NameEntry {
        let mut units = [0u16; NAME_UNITS_PER_RECORD];
        for (i, unit) in units.iter_mut().enumerate() {
            *unit = le16(raw, 2 + 2 * i);
        }
        NameEntry { in_use, units }
    }
}

/// Volume label record, stored directly in the root directory. Labels are
/// at most 11 characters; the full 30-byte unit area is kept so a slightly
/// overlong count can still be rendered.
#[derive(Copy, Clone, Debug)]
pub(crate) struct VolumeLabelEntry {
    pub(crate) in_use: bool,
    pub(crate) char_count: u8,
    pub(crate) units: [u16; NAME_UNITS_PER_RECORD],
}

impl VolumeLabelEntry {
    fn decode(raw: &[u8; 32], in_use: bool) -> VolumeLabelEntry {
        let mut units = [0u16; NAME_UNITS_PER_RECORD];
        for (i, unit) in units.iter_mut().enumerate() {
            *unit = le16(raw, 2 + 2 * i);
        }
        VolumeLabelEntry {
            in_use,
            char_count: raw[1],
            units,
        }
    }
}

/// Allocation bitmap record. Bit 0 of the flags byte distinguishes the
/// second (TexFAT) bitmap from the first.
#[derive(Copy, Clone, Debug)]
pub(crate) struct BitmapEntry {
    pub(crate) in_use: bool,
    pub(crate) flags: u8,
    pub(crate) first_cluster: u32,
    pub(crate) data_length: u64,
}

impl BitmapEntry {
    fn decode(raw: &[u8; 32], in_use: bool) -> BitmapEntry {
        BitmapEntry {
            in_use,
            flags: raw[1],
            first_cluster: le32(raw, 20),
            data_length: le64(raw, 24),
        }
    }

    pub(crate) fn index(&self) -> u8 {
        self.flags & 1
    }
}

/// Upcase table record.
#[derive(Copy, Clone, Debug)]
pub(crate) struct UpcaseEntry {
    pub(crate) in_use: bool,
    pub(crate) first_cluster: u32,
    pub(crate) data_length: u64,
}

impl UpcaseEntry {
    fn decode(raw: &[u8; 32], in_use: bool) -> UpcaseEntry {
        UpcaseEntry {
            in_use,
            first_cluster: le32(raw, 20),
            data_length: le64(raw, 24),
        }
    }
}

/// One decoded 32-byte directory record.
#[derive(Copy, Clone, Debug)]
pub(crate) enum Record {
    File(FileEntry),
    Stream(StreamEntry),
    Name(NameEntry),
    VolumeLabel(VolumeLabelEntry),
    Bitmap(BitmapEntry),
    Upcase(UpcaseEntry),
    VolumeGuid { in_use: bool },
    TexFat { in_use: bool },
    Acl { in_use: bool },
}

impl Record {
    /// Shallow classification: dispatch on the type byte alone. Returns
    /// `None` for the end-of-directory marker and unknown type values.
    pub(crate) fn classify(raw: &[u8; 32]) -> Option<Record> {
        let type_byte = raw[0];
        if type_byte == 0 {
            return None;
        }
        let in_use = type_byte & IN_USE_BIT != 0;
        Some(match type_byte | IN_USE_BIT {
            TYPE_FILE => Record::File(FileEntry::decode(raw, in_use)),
            TYPE_STREAM => Record::Stream(StreamEntry::decode(raw, in_use)),
            TYPE_NAME => Record::Name(NameEntry::decode(raw, in_use)),
            TYPE_VOLUME_LABEL => Record::VolumeLabel(VolumeLabelEntry::decode(raw, in_use)),
            TYPE_BITMAP => Record::Bitmap(BitmapEntry::decode(raw, in_use)),
            TYPE_UPCASE => Record::Upcase(UpcaseEntry::decode(raw, in_use)),
            TYPE_VOLUME_GUID => Record::VolumeGuid { in_use },
            TYPE_TEXFAT => Record::TexFat { in_use },
            TYPE_ACL => Record::Acl { in_use },
            _ => return None,
        })
    }

    pub(crate) fn in_use(&self) -> bool {
        match *self {
            Record::File(FileEntry { in_use, .. })
            | Record::Stream(StreamEntry { in_use, .. })
            | Record::Name(NameEntry { in_use, .. })
            | Record::VolumeLabel(VolumeLabelEntry { in_use, .. })
            | Record::Bitmap(BitmapEntry { in_use, .. })
            | Record::Upcase(UpcaseEntry { in_use, .. })
            | Record::VolumeGuid { in_use }
            | Record::TexFat { in_use }
            | Record::Acl { in_use } => in_use,
        }
    }

    /// Deep validity check, used when parsing slots that are not known to
    /// belong to a live directory. `strict` additionally rejects file
    /// entries whose three timestamps are all unset; the on-disk format
    /// permits that, so it is a heuristic, not a rule.
    pub(crate) fn deep_valid(&self, geom: &Geometry, strict: bool) -> bool {
        match self {
            Record::File(file) => {
                if !(2..=18).contains(&file.secondary_count) {
                    return false;
                }
                !(strict && file.timestamps().all_unset())
            }
            Record::Stream(stream) => {
                stream.name_length as usize <= MAX_NAME_UNITS
                    && stream.name_length > 0
                    && stream.valid_data_length <= stream.data_length
                    && (stream.first_cluster == 0 || geom.in_heap(stream.first_cluster))
            }
            Record::Upcase(upcase) => geom.in_heap(upcase.first_cluster),
            Record::Bitmap(bitmap) => {
                bitmap.data_length == (geom.cluster_count as u64).div_ceil(8)
            }
            _ => true,
        }
    }
}

/// Entry-set checksum: a right-rotating 16-bit sum over every byte of the
/// set, skipping the checksum field itself in the primary record.
pub(crate) fn set_checksum<'a, I>(records: I) -> u16
where
    I: IntoIterator<Item = &'a [u8; 32]>,
{
    let mut sum = 0u16;
    for (index, record) in records.into_iter().enumerate() {
        for (i, b) in record.iter().enumerate() {
            if index == 0 && (i == 2 || i == 3) {
                continue;
            }
            sum = sum.rotate_right(1).wrapping_add(*b as u16);
        }
    }
    sum
}

/// Kind of an exported [`Entry`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    VolumeLabel,
    /// Manufactured by the engine: the root, boot/FAT images, the orphan
    /// directory and named placeholders for special root records.
    Virtual,
}

/// Whether the entry set was live when the image was captured.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Allocation {
    Allocated,
    Deleted,
}

/// One file, directory or special record reconstructed from the volume.
/// Values are self-contained; they stay valid after the engine is dropped.
#[derive(Clone, Debug)]
pub struct Entry {
    /// Identity of the file entry slot this record was parsed from.
    pub id: InodeId,
    pub parent_id: InodeId,
    /// UTF-8 name. Control characters are replaced with `^`, invalid
    /// surrogates with U+FFFD; see the `NameDecodeLossy` diagnostic.
    pub name: String,
    pub kind: EntryKind,
    pub attributes: FileAttributes,
    pub size_bytes: u64,
    /// Zero when the entry has no data stream.
    pub first_cluster: u32,
    /// False when the stream is contiguous and the FAT must be ignored.
    pub fat_chain_valid: bool,
    pub allocation: Allocation,
    pub times: Timestamps,
    /// Name hash as stored in the stream extension record.
    pub name_hash: u16,
    /// Result of recomputing the set checksum, when the set was complete.
    pub checksum_ok: Option<bool>,
    /// Recoverable conditions hit while parsing this entry.
    pub diagnostics: Vec<Diagnostic>,
}

impl Entry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}
