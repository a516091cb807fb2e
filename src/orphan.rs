//! Discovery of entry sets unreachable from the root.
//!
//! A live walk first records every inode reachable from the root, then the
//! whole cluster heap is scanned slot by slot with deep validity checks.
//! Deleted sets whose identity never appeared in the live walk end up as
//! children of the synthetic orphan directory. The result is computed once
//! per session and cached.

use std::collections::HashSet;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use crate::{
    chain::{self, RunList},
    engine::Volume,
    entry::{assembler::Assembler, Allocation, Entry, EntryKind},
    fat::ChainEntry,
    inode::InodeId,
};

#[derive(Default)]
struct LiveSets {
    ids: HashSet<InodeId>,
    /// Clusters holding the records of reachable directories. The heap scan
    /// skips them: their slots were already accounted for by the live walk.
    dir_clusters: HashSet<u32>,
}

pub(crate) struct OrphanFinder {
    cache: Mutex<Option<Arc<Vec<Entry>>>>,
}

impl OrphanFinder {
    pub(crate) fn new() -> OrphanFinder {
        OrphanFinder {
            cache: Mutex::new(None),
        }
    }

    /// Children of the orphan directory, computed on first use.
    pub(crate) fn entries(
        &self,
        vol: &Volume,
        root_runs: &RunList,
        strict: bool,
    ) -> io::Result<Arc<Vec<Entry>>> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cached) = cache.as_ref() {
            return Ok(Arc::clone(cached));
        }

        let live = live_walk(vol, root_runs)?;
        let candidates = scan_heap(vol, &live, strict)?;
        let orphans = drop_descendants(vol, candidates)?;
        log::info!("orphan scan finished: {} unreachable entries", orphans.len());

        let orphans = Arc::new(orphans);
        *cache = Some(Arc::clone(&orphans));
        Ok(orphans)
    }
}

fn record_run_clusters(vol: &Volume, runs: &RunList, into: &mut HashSet<u32>) {
    for run in &runs.runs {
        for sector in run.first_sector..run.first_sector + run.sector_count {
            if let Some(cluster) = vol.geom.sector_to_cluster(sector) {
                into.insert(cluster);
            }
        }
    }
}

/// Walks the directory tree from the root, recording every inode emitted.
/// Deleted subdirectories are descended into as well: their contents are
/// reachable through the tree and therefore not orphans.
fn live_walk(vol: &Volume, root_runs: &RunList) -> io::Result<LiveSets> {
    let mut live = LiveSets::default();
    let mut visited_first_clusters: HashSet<u32> = HashSet::new();
    visited_first_clusters.insert(vol.geom.root_dir_first_cluster);

    let mut stack: Vec<(InodeId, RunList)> = vec![(InodeId::ROOT, root_runs.clone())];
    while let Some((dir_id, runs)) = stack.pop() {
        record_run_clusters(vol, &runs, &mut live.dir_clusters);

        let out = vol.assemble(&runs, dir_id, false)?;
        for entry in out.entries {
            live.ids.insert(entry.id);
            if entry.is_dir()
                && entry.first_cluster != 0
                && visited_first_clusters.insert(entry.first_cluster)
            {
                let runs =
                    vol.dir_runs(entry.first_cluster, entry.size_bytes, entry.fat_chain_valid)?;
                stack.push((entry.id, runs));
            }
        }
    }
    Ok(live)
}

/// Scans every heap cluster outside the live directories, assembling entry
/// sets with deep verdicts. Adjacent clusters are fed to one assembler so a
/// set spanning a cluster boundary still comes out whole.
fn scan_heap(vol: &Volume, live: &LiveSets, strict: bool) -> io::Result<Vec<Entry>> {
    let geom = &vol.geom;
    let orphan_dir = vol.inodes.orphan_dir();
    let mut out = Vec::new();
    let mut buf = vec![0u8; geom.bytes_per_cluster as usize];
    let mut asm: Option<Assembler<'_>> = None;

    let collect = |asm: Option<Assembler<'_>>, out: &mut Vec<Entry>| {
        if let Some(asm) = asm {
            out.extend(asm.finish().entries.into_iter().filter(|e| {
                e.allocation == Allocation::Deleted
                    && !live.ids.contains(&e.id)
                    && matches!(e.kind, EntryKind::File | EntryKind::Directory)
            }));
        }
    };

    for cluster in geom.first_cluster_number..=geom.last_cluster_number {
        if live.dir_clusters.contains(&cluster) {
            // break the slot sequence: sets never straddle a live directory
            collect(asm.take(), &mut out);
            continue;
        }

        let Some(offset) = geom.cluster_offset(cluster) else {
            break;
        };
        vol.source.read_exact_at(offset, &mut buf)?;
        let allocated = vol.bitmap.is_allocated(cluster)?;

        let asm = asm.get_or_insert_with(|| {
            Assembler::new(geom, orphan_dir, orphan_dir).deep().strict(strict)
        });
        for (i, slot) in buf.chunks_exact(32).enumerate() {
            let raw: &[u8; 32] = slot.try_into().unwrap();
            let id = vol
                .inodes
                .id_of(offset + i as u64 * 32)
                .unwrap_or(InodeId(u64::MAX));
            asm.push_slot(id, raw, allocated);
        }
    }

    collect(asm.take(), &mut out);
    Ok(out)
}

/// Drops candidates that live inside the clusters of an earlier orphan
/// directory: they remain discoverable by walking that directory, so
/// listing them at the top level would duplicate them.
fn drop_descendants(vol: &Volume, candidates: Vec<Entry>) -> io::Result<Vec<Entry>> {
    let bps = vol.geom.bytes_per_sector as u64;
    let mut covered: HashSet<u32> = HashSet::new();
    let mut kept = Vec::new();

    for entry in candidates {
        let slot_cluster = vol
            .inodes
            .offset_of(entry.id)
            .and_then(|offset| vol.geom.sector_to_cluster(offset / bps));
        if let Some(cluster) = slot_cluster
            && covered.contains(&cluster)
        {
            continue;
        }

        if entry.is_dir() && entry.first_cluster != 0 {
            let runs = if entry.fat_chain_valid
                && vol.fat.next(entry.first_cluster)? == ChainEntry::Free
            {
                chain::recover_runs(&vol.geom, &vol.bitmap, entry.first_cluster, entry.size_bytes)?
            } else {
                chain::resolve_runs(
                    &vol.geom,
                    &vol.fat,
                    entry.first_cluster,
                    entry.size_bytes,
                    entry.fat_chain_valid,
                )?
            };
            record_run_clusters(vol, &runs, &mut covered);
        }
        kept.push(entry);
    }
    Ok(kept)
}
