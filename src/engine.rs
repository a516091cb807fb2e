//! The engine handle and the public directory walk.
//!
//! [`Engine::open`] validates the boot sector, locates the allocation
//! bitmap and resolves the root directory chain; everything else is lazy.
//! The handle is shareable across threads: each internal cache (FAT
//! sectors, bitmap sector, orphan results, the parent map) sits behind its
//! own mutex, and the sector source is only ever read.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use bitflags::bitflags;
use derive_builder::Builder;

use crate::{
    bitmap::Bitmaps,
    boot::Geometry,
    chain::{self, Run, RunList},
    disk::SectorSource,
    entry::{
        Allocation, Entry, EntryKind,
        assembler::{Assembler, DirOutput, assemble_directory},
    },
    error::{Diagnostic, OpenError, WalkError},
    fat::{ChainEntry, Fat},
    inode::{self, InodeId, InodeSpace},
    orphan::OrphanFinder,
};

/// Deepest directory nesting the walk will follow.
const MAX_WALK_DEPTH: u32 = 128;
/// Longest accumulated path, in UTF-8 bytes, the walk will follow.
const MAX_WALK_PATH: usize = 4096;

/// Largest entry set: one file record plus up to 18 secondaries.
const MAX_SET_RECORDS: usize = 19;

bitflags! {
    /// Selects what a [`walk`] surfaces.
    ///
    /// [`walk`]: Engine::walk
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct WalkFlags: u8 {
        /// Include live entries.
        const ALLOCATED = 1 << 0;
        /// Include deleted but recoverable entries.
        const DELETED = 1 << 1;
        /// Descend into subdirectories.
        const RECURSIVE = 1 << 2;
        /// Do not surface the synthetic orphan directory under the root.
        const EXCLUDE_ORPHANS = 1 << 3;
        /// Skip the synthetic `.` and `..` entries.
        const NOOP_DOT = 1 << 4;
    }
}

/// Per-entry callback; returning `false` stops the walk.
pub type ProgressFn = Arc<dyn Fn(&Entry) -> bool + Send + Sync>;

/// Configuration of one [`Engine::walk`] call.
#[derive(Clone, Builder)]
#[builder(pattern = "owned")]
pub struct WalkOptions {
    #[builder(default = "WalkFlags::ALLOCATED | WalkFlags::RECURSIVE")]
    pub flags: WalkFlags,
    /// Reject recovered file records whose timestamps are all unset. The
    /// on-disk format permits such records, so this is a heuristic.
    #[builder(default)]
    pub strict: bool,
    #[builder(default, setter(strip_option))]
    pub progress: Option<ProgressFn>,
}

impl Default for WalkOptions {
    fn default() -> WalkOptions {
        WalkOptions {
            flags: WalkFlags::ALLOCATED | WalkFlags::RECURSIVE,
            strict: false,
            progress: None,
        }
    }
}

impl WalkOptions {
    pub fn builder() -> WalkOptionsBuilder {
        WalkOptionsBuilder::default()
    }
}

/// Shared read-only state of one opened volume.
pub(crate) struct Volume {
    pub(crate) geom: Arc<Geometry>,
    pub(crate) source: Arc<dyn SectorSource>,
    pub(crate) fat: Fat,
    pub(crate) bitmap: Bitmaps,
    pub(crate) inodes: InodeSpace,
}

impl Volume {
    /// Resolves a directory's own cluster chain.
    pub(crate) fn dir_runs(
        &self,
        first_cluster: u32,
        size_bytes: u64,
        fat_chain_valid: bool,
    ) -> io::Result<RunList> {
        chain::resolve_runs(&self.geom, &self.fat, first_cluster, size_bytes, fat_chain_valid)
    }

    pub(crate) fn assemble(
        &self,
        runs: &RunList,
        dir_id: InodeId,
        strict: bool,
    ) -> io::Result<DirOutput> {
        assemble_directory(
            &self.geom,
            self.source.as_ref(),
            &self.inodes,
            &self.bitmap,
            runs,
            dir_id,
            strict,
        )
    }

    /// Reads the sectors of a run list and returns up to `size_bytes` of
    /// content.
    pub(crate) fn read_runs(&self, runs: &RunList, size_bytes: u64) -> io::Result<Vec<u8>> {
        let bps = self.geom.bytes_per_sector as u64;
        // a claimed size is untrusted input: cap the preallocation at what
        // the image can physically hold
        let capacity = runs
            .total_sectors()
            .saturating_mul(bps)
            .min(size_bytes)
            .min(self.source.size_bytes());
        let mut out = Vec::with_capacity(capacity as usize);
        let mut buf = vec![0u8; self.geom.bytes_per_sector as usize];

        'runs: for run in &runs.runs {
            for sector in run.first_sector..run.first_sector + run.sector_count {
                self.source.read_exact_at(self.geom.sector_offset(sector), &mut buf)?;
                let remaining = size_bytes - out.len() as u64;
                if remaining <= bps {
                    out.extend_from_slice(&buf[..remaining as usize]);
                    break 'runs;
                }
                out.extend_from_slice(&buf);
            }
        }
        Ok(out)
    }
}

/// A read-only exFAT analysis session over one sector source.
pub struct Engine {
    vol: Volume,
    root_runs: RunList,
    root_size: u64,
    orphans: OrphanFinder,
    /// Subdirectory inode to parent inode, filled in as walks descend. Lets
    /// `..` resolve without re-walking from the root.
    parents: Mutex<HashMap<InodeId, InodeId>>,
}

impl Engine {
    /// Opens a volume: validates the boot sector, locates the allocation
    /// bitmap and resolves the root directory chain. The source is read
    /// only, never written.
    pub fn open<S: SectorSource + 'static>(source: S) -> Result<Engine, OpenError> {
        let source: Arc<dyn SectorSource> = Arc::new(source);
        let geom = Arc::new(Geometry::read_from(source.as_ref())?);
        log::info!(
            "opened exFAT volume: serial {:08X}, {} clusters of {} bytes",
            geom.volume_serial,
            geom.cluster_count,
            geom.bytes_per_cluster,
        );

        let fat = Fat::new(Arc::clone(&geom), Arc::clone(&source));
        let bitmap = Bitmaps::locate(Arc::clone(&geom), Arc::clone(&source), &fat)?;
        if bitmap.has_secondary() {
            log::debug!("TexFAT volume: second allocation bitmap present, reading the first only");
        }
        let inodes = InodeSpace::new(&geom);
        let vol = Volume {
            geom: Arc::clone(&geom),
            source,
            fat,
            bitmap,
            inodes,
        };

        // the root stream has no size field anywhere; its length is however
        // far its FAT chain reaches
        let root_runs = vol.dir_runs(geom.root_dir_first_cluster, u64::MAX, true)?;
        let root_size = root_runs.total_sectors() * geom.bytes_per_sector as u64;

        Ok(Engine {
            vol,
            root_runs,
            root_size,
            orphans: OrphanFinder::new(),
            parents: Mutex::new(HashMap::new()),
        })
    }

    pub fn geometry(&self) -> &Geometry {
        &self.vol.geom
    }

    /// ID of the synthetic directory that collects orphaned entries.
    pub fn orphan_dir_id(&self) -> InodeId {
        self.vol.inodes.orphan_dir()
    }

    /// The volume label, when the root carries a live label record.
    pub fn volume_label(&self) -> Result<Option<String>, WalkError> {
        let out = self.vol.assemble(&self.root_runs, InodeId::ROOT, false)?;
        Ok(out
            .entries
            .into_iter()
            .find(|e| e.kind == EntryKind::VolumeLabel && e.allocation == Allocation::Allocated)
            .map(|e| e.name))
    }

    /// Reconstructs the entry stored at `id`.
    ///
    /// Reserved IDs yield the corresponding virtual entry. A heap slot is
    /// parsed in place with deep validity checks, since nothing vouches for
    /// it being part of a live directory.
    pub fn entry(&self, id: InodeId) -> Result<Entry, WalkError> {
        match id {
            InodeId::ROOT => return Ok(inode::root_entry(&self.vol.geom, self.root_size)),
            InodeId::MBR => return Ok(inode::mbr_entry()),
            InodeId::FAT1 => return Ok(inode::fat_entry(&self.vol.geom, 0)),
            InodeId::FAT2 if self.vol.geom.fat_count == 2 => {
                return Ok(inode::fat_entry(&self.vol.geom, 1));
            }
            id if id == self.vol.inodes.orphan_dir() => {
                return Ok(inode::orphan_dir_entry(&self.vol.inodes));
            }
            _ => {}
        }

        let offset = self
            .vol
            .inodes
            .offset_of(id)
            .ok_or(WalkError::UnknownInode(id))?;
        let parent = self
            .parents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .copied()
            .unwrap_or(InodeId::ROOT);

        let last_slot = self.vol.inodes.offset_of(self.vol.inodes.last()).unwrap_or(offset);
        let records = (((last_slot - offset) / 32) as usize + 1).min(MAX_SET_RECORDS);
        let mut buf = vec![0u8; records * 32];
        self.vol.source.read_exact_at(offset, &mut buf)?;

        let mut asm = Assembler::new(&self.vol.geom, id, parent).deep();
        for (i, slot) in buf.chunks_exact(32).enumerate() {
            let raw: &[u8; 32] = slot.try_into().unwrap();
            let slot_offset = offset + i as u64 * 32;
            let allocated = match self.vol.geom.sector_to_cluster(slot_offset / self.vol.geom.bytes_per_sector as u64) {
                Some(cluster) => self.vol.bitmap.is_allocated(cluster)?,
                None => false,
            };
            let slot_id = self.vol.inodes.id_of(slot_offset).unwrap_or(InodeId(u64::MAX));
            asm.push_slot(slot_id, raw, allocated);
        }

        asm.finish()
            .entries
            .into_iter()
            .find(|e| e.id == id)
            .ok_or(WalkError::NotAnEntry(id))
    }

    /// Sector runs of the entry's data stream.
    ///
    /// Virtual entries map to their fixed on-disk regions. For a deleted
    /// entry whose FAT slot has been wiped, the recovery walk of the
    /// allocation bitmap is used instead of the chain.
    pub fn resolve_runs(&self, id: InodeId) -> Result<RunList, WalkError> {
        let geom = &self.vol.geom;
        let fixed = |first_sector, sector_count| RunList {
            runs: vec![Run {
                first_sector,
                sector_count,
            }],
            diagnostics: Vec::new(),
        };

        match id {
            InodeId::ROOT => return Ok(self.root_runs.clone()),
            InodeId::MBR => return Ok(fixed(0, 1)),
            InodeId::FAT1 => {
                return Ok(fixed(geom.fat_offset_sectors as u64, geom.fat_length_sectors as u64));
            }
            InodeId::FAT2 if geom.fat_count == 2 => {
                return Ok(fixed(
                    geom.fat_offset_sectors as u64 + geom.fat_length_sectors as u64,
                    geom.fat_length_sectors as u64,
                ));
            }
            id if id == self.vol.inodes.orphan_dir() => return Ok(RunList::default()),
            _ => {}
        }

        let entry = self.entry(id)?;
        Ok(self.entry_runs(&entry)?)
    }

    fn entry_runs(&self, entry: &Entry) -> io::Result<RunList> {
        if entry.allocation == Allocation::Deleted
            && entry.fat_chain_valid
            && self.vol.fat.next(entry.first_cluster)? == ChainEntry::Free
        {
            return chain::recover_runs(
                &self.vol.geom,
                &self.vol.bitmap,
                entry.first_cluster,
                entry.size_bytes,
            );
        }
        chain::resolve_runs(
            &self.vol.geom,
            &self.vol.fat,
            entry.first_cluster,
            entry.size_bytes,
            entry.fat_chain_valid,
        )
    }

    /// Reads the full content of the entry at `id`.
    pub fn read_file(&self, id: InodeId) -> Result<Vec<u8>, WalkError> {
        let size = self.entry(id)?.size_bytes;
        let runs = self.resolve_runs(id)?;
        Ok(self.vol.read_runs(&runs, size)?)
    }

    /// Lists the children of a directory entry, in slot order, filtered by
    /// the allocation flags. The root additionally carries the virtual
    /// entries and the orphan directory at the end.
    fn children(&self, dir: &Entry, opts: &WalkOptions) -> Result<Vec<Entry>, WalkError> {
        let mut entries = if dir.id == self.vol.inodes.orphan_dir() {
            self.orphans
                .entries(&self.vol, &self.root_runs, opts.strict)?
                .as_ref()
                .clone()
        } else if dir.id == InodeId::ROOT {
            let out = self.vol.assemble(&self.root_runs, InodeId::ROOT, opts.strict)?;
            report_dir_diagnostics(&out);
            out.entries
        } else {
            if dir.first_cluster == 0 {
                return Ok(Vec::new());
            }
            let runs = self.entry_runs(dir).map_err(WalkError::Io)?;
            let out = self.vol.assemble(&runs, dir.id, opts.strict)?;
            report_dir_diagnostics(&out);
            out.entries
        };

        entries.retain(|e| match e.allocation {
            Allocation::Allocated => opts.flags.contains(WalkFlags::ALLOCATED),
            Allocation::Deleted => opts.flags.contains(WalkFlags::DELETED),
        });

        // manufactured entries have no on-disk allocation state; they join
        // after the filter so a deleted-only walk still reaches the orphan
        // directory
        if dir.id == InodeId::ROOT {
            entries.push(inode::mbr_entry());
            entries.push(inode::fat_entry(&self.vol.geom, 0));
            if self.vol.geom.fat_count == 2 {
                entries.push(inode::fat_entry(&self.vol.geom, 1));
            }
            if !opts.flags.contains(WalkFlags::EXCLUDE_ORPHANS) {
                entries.push(inode::orphan_dir_entry(&self.vol.inodes));
            }
        }

        let mut parents = self.parents.lock().unwrap_or_else(PoisonError::into_inner);
        for e in entries.iter().filter(|e| e.is_dir()) {
            parents.insert(e.id, dir.id);
        }
        Ok(entries)
    }

    /// Depth-first iteration over a directory. Entries come in on-disk slot
    /// order, `.` and `..` first unless suppressed, subdirectories expanded
    /// in place when [`WalkFlags::RECURSIVE`] is set.
    pub fn walk(&self, dir_id: InodeId, opts: WalkOptions) -> Result<Walk<'_>, WalkError> {
        let dir = self.entry(dir_id)?;
        if !dir.is_dir() {
            return Err(WalkError::NotADirectory(dir_id));
        }

        let mut walk = Walk {
            engine: self,
            opts,
            stack: Vec::new(),
            pending_err: None,
            stopped: false,
        };
        walk.push_dir(&dir, dir.parent_id, 0, dir.name.len())?;
        Ok(walk)
    }
}

fn report_dir_diagnostics(out: &DirOutput) {
    for diag in &out.diagnostics {
        log::warn!("directory diagnostic: {diag:?}");
    }
}

struct Frame {
    entries: std::vec::IntoIter<Entry>,
    depth: u32,
    path_len: usize,
}

/// Pull-based walk state. Dropping it cancels the traversal.
pub struct Walk<'a> {
    engine: &'a Engine,
    opts: WalkOptions,
    stack: Vec<Frame>,
    pending_err: Option<WalkError>,
    stopped: bool,
}

impl Walk<'_> {
    fn push_dir(
        &mut self,
        dir: &Entry,
        parent_id: InodeId,
        depth: u32,
        path_len: usize,
    ) -> Result<(), WalkError> {
        let children = self.engine.children(dir, &self.opts)?;

        let mut entries = Vec::with_capacity(children.len() + 2);
        if !self.opts.flags.contains(WalkFlags::NOOP_DOT) {
            let mut dot = dir.clone();
            dot.name = ".".to_string();
            entries.push(dot);

            let mut dotdot = dir.clone();
            dotdot.name = "..".to_string();
            dotdot.id = parent_id;
            dotdot.parent_id = dir.id;
            entries.push(dotdot);
        }
        entries.extend(children);

        self.stack.push(Frame {
            entries: entries.into_iter(),
            depth,
            path_len,
        });
        Ok(())
    }
}

impl Iterator for Walk<'_> {
    type Item = Result<Entry, WalkError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.stopped {
            return None;
        }
        if let Some(err) = self.pending_err.take() {
            return Some(Err(err));
        }

        loop {
            let frame = self.stack.last_mut()?;
            let Some(mut entry) = frame.entries.next() else {
                self.stack.pop();
                continue;
            };
            let depth = frame.depth;
            let path_len = frame.path_len;

            let is_dot = entry.name == "." || entry.name == "..";
            if entry.is_dir() && !is_dot && self.opts.flags.contains(WalkFlags::RECURSIVE) {
                let child_path = path_len + 1 + entry.name.len();
                if depth + 1 >= MAX_WALK_DEPTH || child_path > MAX_WALK_PATH {
                    log::warn!("walk depth limit hit below directory {}", entry.id);
                    entry
                        .diagnostics
                        .push(Diagnostic::DepthLimitExceeded { dir: entry.id });
                } else if let Err(err) =
                    self.push_dir(&entry, entry.parent_id, depth + 1, child_path)
                {
                    // surface the descent failure right after its directory
                    self.pending_err = Some(err);
                }
            }

            if let Some(progress) = &self.opts.progress
                && !progress(&entry)
            {
                self.stopped = true;
            }
            return Some(Ok(entry));
        }
    }
}
