use std::collections::HashSet;
use std::io;

use crate::{
    bitmap::Bitmaps,
    boot::Geometry,
    error::Diagnostic,
    fat::{ChainEntry, Fat},
};

/// A maximal contiguous range of sectors holding part of one stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Run {
    pub first_sector: u64,
    pub sector_count: u64,
}

/// Ordered runs describing a logical stream, plus any recoverable
/// conditions hit while resolving it.
#[derive(Clone, Debug, Default)]
pub struct RunList {
    pub runs: Vec<Run>,
    pub diagnostics: Vec<Diagnostic>,
}

impl RunList {
    pub fn total_sectors(&self) -> u64 {
        self.runs.iter().map(|r| r.sector_count).sum()
    }
}

fn push_run(runs: &mut Vec<Run>, first_sector: u64, sector_count: u64) {
    if let Some(last) = runs.last_mut()
        && last.first_sector + last.sector_count == first_sector
    {
        last.sector_count += sector_count;
        return;
    }
    runs.push(Run {
        first_sector,
        sector_count,
    });
}

/// Resolves a stream's starting cluster into sector runs.
///
/// With `fat_chain_valid == false` the stream is contiguous and the FAT is
/// ignored: the result is a single run covering `ceil(size / sector)`
/// sectors. Otherwise the FAT chain is followed, bounds-checked against the
/// heap, until the size is covered or the chain ends. A revisited cluster
/// stops the walk and is reported as [`Diagnostic::LoopDetected`]; the runs
/// gathered so far are still returned.
pub(crate) fn resolve_runs(
    geom: &Geometry,
    fat: &Fat,
    start: u32,
    size_bytes: u64,
    fat_chain_valid: bool,
) -> io::Result<RunList> {
    let mut out = RunList::default();
    let bps = geom.bytes_per_sector as u64;
    let mut sectors_needed = size_bytes.div_ceil(bps);

    if sectors_needed == 0 || !geom.in_heap(start) {
        return Ok(out);
    }

    if !fat_chain_valid {
        out.runs.push(Run {
            first_sector: geom.cluster_to_sector(start),
            sector_count: sectors_needed,
        });
        return Ok(out);
    }

    let spc = geom.sectors_per_cluster as u64;
    let mut seen: HashSet<u32> = HashSet::new();
    let mut current = start;

    while sectors_needed > 0 && geom.in_heap(current) {
        if !seen.insert(current) {
            log::warn!("FAT chain loops back to cluster {current}");
            out.diagnostics.push(Diagnostic::LoopDetected { cluster: current });
            break;
        }

        let take = spc.min(sectors_needed);
        push_run(&mut out.runs, geom.cluster_to_sector(current), take);
        sectors_needed -= take;

        match fat.next(current)? {
            ChainEntry::Next(next) => current = next,
            ChainEntry::EndOfChain | ChainEntry::BadCluster | ChainEntry::Free => break,
        }
    }

    Ok(out)
}

/// Recovery walk for deleted streams whose FAT chain has been wiped.
///
/// Starting at `start`, clusters the allocation bitmap reports as live are
/// skipped and the rest collected until the logical size is covered or the
/// heap ends. When the starting cluster itself is live again, recovery is
/// impossible; a single-cluster run is returned so the caller can still
/// inspect the first cluster and its slack.
pub(crate) fn recover_runs(
    geom: &Geometry,
    bitmap: &Bitmaps,
    start: u32,
    size_bytes: u64,
) -> io::Result<RunList> {
    let mut out = RunList::default();
    if !geom.in_heap(start) {
        return Ok(out);
    }

    let spc = geom.sectors_per_cluster as u64;

    if bitmap.is_allocated(start)? {
        log::debug!("cluster {start} reallocated, recovery reduced to the first cluster");
        out.runs.push(Run {
            first_sector: geom.cluster_to_sector(start),
            sector_count: spc,
        });
        return Ok(out);
    }

    let mut sectors_needed = size_bytes.div_ceil(geom.bytes_per_sector as u64);
    let mut current = start;

    while sectors_needed > 0 && geom.in_heap(current) {
        if !bitmap.is_allocated(current)? {
            let take = spc.min(sectors_needed);
            push_run(&mut out.runs, geom.cluster_to_sector(current), take);
            sectors_needed -= take;
        }
        current += 1;
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::testutil::ImageBuilder;

    fn fixture(chains: &[&[u32]]) -> (Arc<Geometry>, Fat) {
        let mut img = ImageBuilder::new();
        for chain in chains {
            img.chain(chain);
        }
        let (source, geom) = img.build();
        let geom = Arc::new(geom);
        let fat = Fat::new(Arc::clone(&geom), Arc::new(source));
        (geom, fat)
    }

    #[test]
    fn test_contiguous_stream_is_one_run() {
        let (geom, fat) = fixture(&[]);
        // 12345 bytes => 25 sectors; no FAT chain
        let runs = resolve_runs(&geom, &fat, 5, 12_345, false).unwrap();
        assert_eq!(runs.runs.len(), 1);
        assert_eq!(runs.runs[0].first_sector, geom.cluster_to_sector(5));
        assert_eq!(runs.runs[0].sector_count, 25);
        assert!(runs.diagnostics.is_empty());
    }

    #[test]
    fn test_fat_chain_runs_cover_exact_sectors() {
        // contiguous chain: merged into a single run
        let (geom, fat) = fixture(&[&[5, 6, 7]]);
        let runs = resolve_runs(&geom, &fat, 5, 12_345, true).unwrap();
        assert_eq!(runs.total_sectors(), 12_345u64.div_ceil(512));
        assert_eq!(runs.runs.len(), 1);

        // fragmented chain: one run per fragment
        let (geom, fat) = fixture(&[&[5, 9, 6]]);
        let full = 3 * geom.bytes_per_cluster as u64;
        let runs = resolve_runs(&geom, &fat, 5, full, true).unwrap();
        assert_eq!(runs.runs.len(), 3);
        assert_eq!(runs.total_sectors(), full / 512);
    }

    #[test]
    fn test_loop_detection_terminates() {
        // 10 -> 11 -> 10
        let mut img = ImageBuilder::new();
        img.fat_link(10, 11);
        img.fat_link(11, 10);
        let (source, geom) = img.build();
        let geom = Arc::new(geom);
        let fat = Fat::new(Arc::clone(&geom), Arc::new(source));

        let huge = 100 * geom.bytes_per_cluster as u64;
        let runs = resolve_runs(&geom, &fat, 10, huge, true).unwrap();
        assert!(runs.runs.len() <= 2);
        assert_eq!(
            runs.diagnostics,
            vec![Diagnostic::LoopDetected { cluster: 10 }]
        );
    }

    #[test]
    fn test_zero_size_and_out_of_heap() {
        let (geom, fat) = fixture(&[&[5]]);
        assert!(resolve_runs(&geom, &fat, 5, 0, true).unwrap().runs.is_empty());
        assert!(resolve_runs(&geom, &fat, 0, 512, true).unwrap().runs.is_empty());
        assert!(
            resolve_runs(&geom, &fat, geom.last_cluster_number + 1, 512, false)
                .unwrap()
                .runs
                .is_empty()
        );
    }
}
