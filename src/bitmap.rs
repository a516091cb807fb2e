use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use crate::{
    boot::Geometry,
    chain::{Run, resolve_runs},
    disk::SectorSource,
    entry::{BitmapEntry, Record},
    error::OpenError,
    fat::{ChainEntry, Fat},
};

/// Location of one on-disk allocation bitmap.
#[derive(Debug, Clone)]
struct AllocBitmap {
    first_cluster: u32,
    length_bytes: u64,
    /// Sector runs of the bitmap's own data stream.
    runs: Vec<Run>,
}

/// Allocation state oracle. Located by scanning the root directory during
/// open; reads are served through a one-sector cache behind a mutex.
///
/// TexFAT volumes carry a second bitmap; its location is captured but all
/// queries go to the primary, matching the engine's read-only view of the
/// first FAT.
pub(crate) struct Bitmaps {
    geom: Arc<Geometry>,
    source: Arc<dyn SectorSource>,
    primary: AllocBitmap,
    secondary: Option<AllocBitmap>,
    cache: Mutex<Option<(u64, Vec<u8>)>>,
}

impl Bitmaps {
    /// Scans the root directory's cluster chain for allocation bitmap
    /// records, stopping once `fat_count` bitmaps have been captured or the
    /// chain ends. Each captured bitmap is validated against the cluster
    /// count.
    pub(crate) fn locate(
        geom: Arc<Geometry>,
        source: Arc<dyn SectorSource>,
        fat: &Fat,
    ) -> Result<Bitmaps, OpenError> {
        let mut found: Vec<BitmapEntry> = Vec::new();
        let wanted = geom.fat_count as usize;

        let mut cluster = geom.root_dir_first_cluster;
        let mut visited = 0u32;
        let mut sector_buf = vec![0u8; geom.bytes_per_sector as usize];

        'chain: while geom.in_heap(cluster) && visited < geom.cluster_count {
            visited += 1;
            let first_sector = geom.cluster_to_sector(cluster);

            for s in 0..geom.sectors_per_cluster as u64 {
                let offset = geom.sector_offset(first_sector + s);
                source.read_exact_at(offset, &mut sector_buf)?;

                for slot in sector_buf.chunks_exact(32) {
                    let raw: &[u8; 32] = slot.try_into().unwrap();
                    if let Some(Record::Bitmap(bitmap)) = Record::classify(raw)
                        && bitmap.in_use
                        && !found.iter().any(|b| b.index() == bitmap.index())
                    {
                        found.push(bitmap);
                        if found.len() == wanted {
                            break 'chain;
                        }
                    }
                }
            }

            match fat.next(cluster).map_err(OpenError::Io)? {
                ChainEntry::Next(next) => cluster = next,
                _ => break,
            }
        }

        // the first bitmap (flags bit 0 clear) is the one the engine reads
        let Some(primary) = found.iter().find(|b| b.index() == 0).copied() else {
            return Err(OpenError::BitmapMissing);
        };
        let secondary = found.iter().find(|b| b.index() == 1).copied();

        let primary = Bitmaps::validate(&geom, fat, primary)?;
        let secondary = secondary
            .map(|entry| Bitmaps::validate(&geom, fat, entry))
            .transpose()?;
        log::debug!(
            "allocation bitmap at cluster {}, {} bytes",
            primary.first_cluster,
            primary.length_bytes,
        );

        Ok(Bitmaps {
            geom,
            source,
            primary,
            secondary,
            cache: Mutex::new(None),
        })
    }

    fn validate(geom: &Geometry, fat: &Fat, entry: BitmapEntry) -> Result<AllocBitmap, OpenError> {
        let expected = (geom.cluster_count as u64).div_ceil(8);
        if entry.data_length != expected {
            return Err(OpenError::BitmapWrongLength {
                expected,
                found: entry.data_length,
            });
        }
        if !geom.in_heap(entry.first_cluster) {
            return Err(OpenError::BitmapOutOfBounds(entry.first_cluster));
        }

        // resolve the bitmap's own stream; formatters usually chain it in
        // the FAT, but a contiguous fallback covers volumes that do not
        let resolved = resolve_runs(geom, fat, entry.first_cluster, entry.data_length, true)
            .map_err(OpenError::Io)?;
        let needed = entry.data_length.div_ceil(geom.bytes_per_sector as u64);
        let runs = if resolved.total_sectors() >= needed && resolved.diagnostics.is_empty() {
            resolved.runs
        } else {
            vec![Run {
                first_sector: geom.cluster_to_sector(entry.first_cluster),
                sector_count: needed,
            }]
        };

        Ok(AllocBitmap {
            first_cluster: entry.first_cluster,
            length_bytes: entry.data_length,
            runs,
        })
    }

    pub(crate) fn has_secondary(&self) -> bool {
        self.secondary.is_some()
    }

    /// Whether the cluster is marked live in the primary bitmap. Clusters
    /// outside the recorded bitmap length read as free.
    pub(crate) fn is_allocated(&self, cluster: u32) -> io::Result<bool> {
        if !self.geom.in_heap(cluster) {
            return Ok(false);
        }
        let index = (cluster - self.geom.first_cluster_number) as u64;
        let byte_index = index / 8;
        if byte_index >= self.primary.length_bytes {
            return Ok(false);
        }

        let bps = self.geom.bytes_per_sector as u64;
        let logical_sector = byte_index / bps;

        // map the logical bitmap sector onto the image through the run list
        let mut remaining = logical_sector;
        let mut image_sector = None;
        for run in &self.primary.runs {
            if remaining < run.sector_count {
                image_sector = Some(run.first_sector + remaining);
                break;
            }
            remaining -= run.sector_count;
        }
        let Some(image_sector) = image_sector else {
            return Ok(false);
        };

        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        let hit = matches!(cache.as_ref(), Some((sector, _)) if *sector == image_sector);
        if !hit {
            let mut buf = vec![0u8; bps as usize];
            self.source.read_exact_at(image_sector * bps, &mut buf)?;
            *cache = Some((image_sector, buf));
        }
        let Some((_, buf)) = cache.as_ref() else {
            return Ok(false);
        };

        let byte = buf[(byte_index % bps) as usize];
        Ok(byte & (1 << (index % 8)) != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ImageBuilder;

    fn open(img: ImageBuilder) -> Result<Bitmaps, OpenError> {
        let (source, geom) = img.build();
        let geom = Arc::new(geom);
        let source: Arc<dyn SectorSource> = Arc::new(source);
        let fat = Fat::new(Arc::clone(&geom), Arc::clone(&source));
        Bitmaps::locate(geom, source, &fat)
    }

    #[test]
    fn test_locate_and_query() {
        let mut img = ImageBuilder::new();
        img.allocate(5);
        img.allocate(7);
        let bitmaps = open(img).unwrap();

        assert!(bitmaps.is_allocated(5).unwrap());
        assert!(!bitmaps.is_allocated(6).unwrap());
        assert!(bitmaps.is_allocated(7).unwrap());
        // the builder marks its own metadata clusters live
        assert!(bitmaps.is_allocated(2).unwrap());
        // out of range reads as free
        assert!(!bitmaps.is_allocated(0).unwrap());
        assert!(!bitmaps.is_allocated(u32::MAX).unwrap());
        assert!(!bitmaps.has_secondary());
    }

    #[test]
    fn test_missing_bitmap_fails_open() {
        let mut img = ImageBuilder::new();
        img.omit_bitmap_record();
        assert!(matches!(open(img), Err(OpenError::BitmapMissing)));
    }

    #[test]
    fn test_wrong_length_fails_open() {
        let mut img = ImageBuilder::new();
        img.corrupt_bitmap_length(3);
        assert!(matches!(
            open(img),
            Err(OpenError::BitmapWrongLength { .. })
        ));
    }
}
