//! Grouping of raw directory records into logical entries.
//!
//! The assembler is a small state machine fed one 32-byte slot at a time.
//! A file entry opens an accumulator, the stream extension fills in the
//! data location, and name records append UTF-16 units; once the secondary
//! count is satisfied the accumulated state is emitted as one [`Entry`].
//! Anything that breaks the sequence discards the accumulator, so torn and
//! partially overwritten sets never surface as half-filled entries.

use std::io;

use crate::{
    bitmap::Bitmaps,
    boot::Geometry,
    chain::RunList,
    disk::SectorSource,
    entry::{
        Allocation, Entry, EntryKind, FileAttributes, FileEntry, MAX_NAME_UNITS,
        NAME_UNITS_PER_RECORD, NameEntry, Record, StreamEntry, VolumeLabelEntry,
    },
    error::Diagnostic,
    inode::{InodeId, InodeSpace},
    timestamp::Timestamps,
};

/// How many leading invalid slots flag a directory as corrupt.
const CORRUPT_SLOT_LIMIT: u32 = 4;

/// Entries assembled from one directory, plus directory-level conditions
/// (a corrupt leading buffer, FAT chain loops) that are not tied to any
/// single entry.
#[derive(Debug, Default)]
pub(crate) struct DirOutput {
    pub(crate) entries: Vec<Entry>,
    pub(crate) diagnostics: Vec<Diagnostic>,
}

/// In-flight entry set: the file record, the stream once seen, and the name
/// units buffered so far. The raw records are kept for the checksum.
struct Accumulator {
    id: InodeId,
    file: FileEntry,
    stream: Option<StreamEntry>,
    name_units: Vec<u16>,
    expected_secondaries: u8,
    actual_secondaries: u8,
    raw: Vec<[u8; 32]>,
    sector_allocated: bool,
}

impl Accumulator {
    fn new(id: InodeId, file: FileEntry, raw: [u8; 32], sector_allocated: bool) -> Accumulator {
        Accumulator {
            id,
            file,
            stream: None,
            name_units: Vec::new(),
            expected_secondaries: file.secondary_count,
            actual_secondaries: 0,
            raw: vec![raw],
            sector_allocated,
        }
    }
}

enum LastKind {
    File,
    Stream,
    Name,
}

/// The state machine. Feed it slots in directory order with [`push_slot`],
/// then take the output with [`finish`].
///
/// [`push_slot`]: Assembler::push_slot
/// [`finish`]: Assembler::finish
pub(crate) struct Assembler<'a> {
    geom: &'a Geometry,
    parent_id: InodeId,
    /// Require deep record validity for every slot. Set from the start in
    /// recovery contexts, or after the leading slots of a live directory
    /// turn out to be garbage.
    deep: bool,
    strict: bool,
    dir_id: InodeId,
    slots_seen: u32,
    leading_invalid: u32,
    last: Option<LastKind>,
    acc: Option<Accumulator>,
    out: DirOutput,
}

impl<'a> Assembler<'a> {
    pub(crate) fn new(geom: &'a Geometry, dir_id: InodeId, parent_id: InodeId) -> Assembler<'a> {
        Assembler {
            geom,
            parent_id,
            deep: false,
            strict: false,
            dir_id,
            slots_seen: 0,
            leading_invalid: 0,
            last: None,
            acc: None,
            out: DirOutput::default(),
        }
    }

    /// Requires deep verdicts from the first slot on. Used by the orphan
    /// scanner, which reads slots with no containing directory to vouch for
    /// them.
    pub(crate) fn deep(mut self) -> Assembler<'a> {
        self.deep = true;
        self
    }

    pub(crate) fn strict(mut self, strict: bool) -> Assembler<'a> {
        self.strict = strict;
        self
    }

    fn discard(&mut self) {
        self.acc = None;
        self.last = None;
    }

    /// Emits the accumulator if and only if it is complete: stream present
    /// and the claimed name fully buffered. A file record interrupted by
    /// the next set, a special record or the end of the directory never
    /// produced a name, so there is nothing worth surfacing.
    fn flush(&mut self) {
        if let Some(acc) = self.acc.take()
            && let Some(stream) = acc.stream
            && acc.name_units.len() >= stream.name_length as usize
        {
            self.emit(acc, stream);
        }
        self.last = None;
    }

    fn emit(&mut self, acc: Accumulator, stream: StreamEntry) {
        let mut diagnostics = Vec::new();
        let units = &acc.name_units[..(stream.name_length as usize).min(acc.name_units.len())];
        let (name, lossy) = decode_name(units);
        if lossy {
            diagnostics.push(Diagnostic::NameDecodeLossy { id: acc.id });
        }

        // the stored sum only covers a complete set
        let checksum_ok = (acc.raw.len() == acc.expected_secondaries as usize + 1)
            .then(|| super::set_checksum(acc.raw.iter()) == acc.file.set_checksum);

        let allocation = if acc.sector_allocated && acc.file.in_use {
            Allocation::Allocated
        } else {
            Allocation::Deleted
        };
        let kind = if acc.file.attributes.contains(FileAttributes::DIRECTORY) {
            EntryKind::Directory
        } else {
            EntryKind::File
        };

        self.out.entries.push(Entry {
            id: acc.id,
            parent_id: self.parent_id,
            name,
            kind,
            attributes: acc.file.attributes,
            size_bytes: stream.data_length,
            first_cluster: stream.first_cluster,
            fat_chain_valid: stream.fat_chain_valid(),
            allocation,
            times: acc.file.timestamps(),
            name_hash: stream.name_hash,
            checksum_ok,
            diagnostics,
        });
    }

    fn emit_special(&mut self, id: InodeId, name: &str, kind: EntryKind, in_use: bool,
                    first_cluster: u32, size_bytes: u64, sector_allocated: bool) {
        let allocation = if sector_allocated && in_use {
            Allocation::Allocated
        } else {
            Allocation::Deleted
        };
        self.out.entries.push(Entry {
            id,
            parent_id: self.parent_id,
            name: name.to_string(),
            kind,
            attributes: FileAttributes::empty(),
            size_bytes,
            first_cluster,
            fat_chain_valid: false,
            allocation,
            times: Timestamps::default(),
            name_hash: 0,
            checksum_ok: None,
            diagnostics: Vec::new(),
        });
    }

    fn invalid_slot(&mut self) {
        if self.slots_seen <= CORRUPT_SLOT_LIMIT {
            self.leading_invalid += 1;
            if self.leading_invalid == CORRUPT_SLOT_LIMIT && !self.deep {
                log::warn!("directory {} starts with garbage records", self.dir_id);
                self.deep = true;
                self.out
                    .diagnostics
                    .push(Diagnostic::CorruptDirectory { dir: self.dir_id });
            }
        }
        self.discard();
    }

    /// Feeds one slot. `id` is the slot's inode identity and
    /// `sector_allocated` the allocation-bitmap verdict for its sector.
    pub(crate) fn push_slot(&mut self, id: InodeId, raw: &[u8; 32], sector_allocated: bool) {
        self.slots_seen += 1;

        let Some(record) = Record::classify(raw) else {
            self.invalid_slot();
            return;
        };
        if self.deep && !record.deep_valid(self.geom, self.strict) {
            self.invalid_slot();
            return;
        }

        match record {
            Record::File(file) => {
                self.flush();
                self.acc = Some(Accumulator::new(id, file, *raw, sector_allocated));
                self.last = Some(LastKind::File);
            }
            Record::Stream(stream) => {
                let Some(acc) = self.acc.as_mut() else {
                    self.discard();
                    return;
                };
                if !matches!(self.last, Some(LastKind::File)) || stream.in_use != acc.file.in_use {
                    self.discard();
                    return;
                }
                acc.stream = Some(stream);
                acc.actual_secondaries += 1;
                acc.raw.push(*raw);
                self.last = Some(LastKind::Stream);
            }
            Record::Name(name) => self.push_name(name, raw),
            Record::VolumeLabel(label) => {
                self.flush();
                self.emit_label(id, label, sector_allocated);
            }
            Record::VolumeGuid { in_use } => {
                self.flush();
                self.emit_special(id, "$VOLUME_GUID", EntryKind::Virtual, in_use, 0, 0, sector_allocated);
            }
            Record::Bitmap(bitmap) => {
                self.flush();
                self.emit_special(
                    id, "$ALLOC_BITMAP", EntryKind::Virtual, bitmap.in_use,
                    bitmap.first_cluster, bitmap.data_length, sector_allocated,
                );
            }
            Record::Upcase(upcase) => {
                self.flush();
                self.emit_special(
                    id, "$UPCASE_TABLE", EntryKind::Virtual, upcase.in_use,
                    upcase.first_cluster, upcase.data_length, sector_allocated,
                );
            }
            Record::TexFat { in_use } => {
                self.flush();
                self.emit_special(id, "$TEXFAT", EntryKind::Virtual, in_use, 0, 0, sector_allocated);
            }
            Record::Acl { in_use } => {
                self.flush();
                self.emit_special(id, "$ACT", EntryKind::Virtual, in_use, 0, 0, sector_allocated);
            }
        }
    }

    fn push_name(&mut self, name: NameEntry, raw: &[u8; 32]) {
        let Some(acc) = self.acc.as_mut() else {
            self.discard();
            return;
        };
        if !matches!(self.last, Some(LastKind::Stream | LastKind::Name))
            || name.in_use != acc.file.in_use
        {
            self.discard();
            return;
        }
        let Some(stream) = acc.stream else {
            self.discard();
            return;
        };

        let expected = (stream.name_length as usize).min(MAX_NAME_UNITS);
        let remaining = expected.saturating_sub(acc.name_units.len());
        acc.name_units
            .extend_from_slice(&name.units[..remaining.min(NAME_UNITS_PER_RECORD)]);
        acc.actual_secondaries += 1;
        acc.raw.push(*raw);
        self.last = Some(LastKind::Name);

        if acc.actual_secondaries >= acc.expected_secondaries && acc.name_units.len() >= expected {
            if let Some(acc) = self.acc.take() {
                self.emit(acc, stream);
            }
            self.last = None;
        }
    }

    fn emit_label(&mut self, id: InodeId, label: VolumeLabelEntry, sector_allocated: bool) {
        let count = (label.char_count as usize).min(NAME_UNITS_PER_RECORD);
        let (name, _) = decode_name(&label.units[..count]);
        let allocation = if sector_allocated && label.in_use {
            Allocation::Allocated
        } else {
            Allocation::Deleted
        };
        self.out.entries.push(Entry {
            id,
            parent_id: self.parent_id,
            name,
            kind: EntryKind::VolumeLabel,
            attributes: FileAttributes::empty(),
            size_bytes: 0,
            first_cluster: 0,
            fat_chain_valid: false,
            allocation,
            times: Timestamps::default(),
            name_hash: 0,
            checksum_ok: None,
            diagnostics: Vec::new(),
        });
    }

    pub(crate) fn finish(mut self) -> DirOutput {
        self.flush();
        self.out
    }
}

/// Lenient UTF-16 to UTF-8 conversion. Unpaired surrogates become U+FFFD
/// and control characters are shown as `^`; the second return value flags
/// that a replacement happened.
pub(crate) fn decode_name(units: &[u16]) -> (String, bool) {
    let mut lossy = false;
    let name = char::decode_utf16(units.iter().copied())
        .map(|unit| match unit {
            Ok('\u{01}'..='\u{1F}') => {
                lossy = true;
                '^'
            }
            Ok(c) => c,
            Err(_) => {
                lossy = true;
                '\u{FFFD}'
            }
        })
        .collect();
    (name, lossy)
}

/// Walks every slot of a directory whose chain has been resolved to `runs`
/// and assembles its entries. One allocation-bitmap query is made per
/// sector; a sector that is unallocated and does not open with a plausible
/// record is skipped wholesale.
pub(crate) fn assemble_directory(
    geom: &Geometry,
    source: &dyn SectorSource,
    inodes: &InodeSpace,
    bitmap: &Bitmaps,
    runs: &RunList,
    dir_id: InodeId,
    strict: bool,
) -> io::Result<DirOutput> {
    let mut asm = Assembler::new(geom, dir_id, dir_id).strict(strict);
    let mut sector_buf = vec![0u8; geom.bytes_per_sector as usize];

    for run in &runs.runs {
        for sector in run.first_sector..run.first_sector + run.sector_count {
            let offset = geom.sector_offset(sector);
            source.read_exact_at(offset, &mut sector_buf)?;

            let allocated = match geom.sector_to_cluster(sector) {
                Some(cluster) => bitmap.is_allocated(cluster)?,
                None => false,
            };

            let first: &[u8; 32] = sector_buf[..32].try_into().unwrap();
            if !allocated && Record::classify(first).is_none() {
                continue;
            }

            for (i, slot) in sector_buf.chunks_exact(32).enumerate() {
                let raw: &[u8; 32] = slot.try_into().unwrap();
                let id = inodes
                    .id_of(offset + i as u64 * 32)
                    .unwrap_or(InodeId(u64::MAX));
                asm.push_slot(id, raw, allocated);
            }
        }
    }

    let mut out = asm.finish();
    out.diagnostics.extend(runs.diagnostics.iter().cloned());
    Ok(out)
}
