//! FAT32 FSInfo bookkeeping: an advisory free-cluster count and the last
//! allocated cluster, used as a search hint. On FAT16 the same state is kept
//! in memory only.

use emvfs::FsResult;

use crate::block::BlockDevice;
use crate::boot::{read_u32, write_u32};
use crate::fat::FatEntry;
use crate::fs::FatFs;

pub const FSINFO_LEAD_SIGNATURE: u32 = 0x4161_5252;
pub const FSINFO_STRUCT_SIGNATURE: u32 = 0x6141_7272;
pub const FSINFO_TRAIL_SIGNATURE: u32 = 0xaa55_0000;
pub const UNKNOWN_FREE_COUNT: u32 = 0xffff_ffff;

pub(crate) const FSINFO_LEAD_OFFSET: usize = 0;
pub(crate) const FSINFO_STRUCT_OFFSET: usize = 484;
pub(crate) const FSINFO_FREE_COUNT_OFFSET: usize = 488;
pub(crate) const FSINFO_NEXT_FREE_OFFSET: usize = 492;
pub(crate) const FSINFO_TRAIL_OFFSET: usize = 508;

const FIRST_CLUSTER: u32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FsInfo {
    pub free_count: u32,
    pub next_free: u32,
    dirty: bool,
}

impl FsInfo {
    pub const fn unknown() -> Self {
        Self {
            free_count: UNKNOWN_FREE_COUNT,
            next_free: FIRST_CLUSTER,
            dirty: false,
        }
    }

    /// Builds the in-memory state from raw on-disk fields, discarding values
    /// that cannot be right for a volume of `cluster_count` clusters.
    pub fn from_raw(free_count: u32, next_free: u32, cluster_count: u32) -> Self {
        let mut info = Self::unknown();
        if free_count <= cluster_count {
            info.free_count = free_count;
        } else if free_count != UNKNOWN_FREE_COUNT {
            log::warn!(
                "emfat: fsinfo free count {} exceeds {} clusters",
                free_count,
                cluster_count
            );
        }
        if next_free >= FIRST_CLUSTER && next_free <= cluster_count + 1 {
            info.next_free = next_free;
        }
        info
    }

    pub fn free_clusters(&self) -> Option<u32> {
        if self.free_count == UNKNOWN_FREE_COUNT {
            None
        } else {
            Some(self.free_count)
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn note_allocated(&mut self, cluster: u32) {
        self.next_free = cluster;
        if self.free_count != UNKNOWN_FREE_COUNT {
            self.free_count = self.free_count.saturating_sub(1);
        }
        self.dirty = true;
    }

    pub(crate) fn note_freed(&mut self, count: u32) {
        if self.free_count != UNKNOWN_FREE_COUNT {
            self.free_count = self.free_count.saturating_add(count);
        }
        self.dirty = true;
    }
}

impl<D: BlockDevice> FatFs<D> {
    pub(crate) fn read_fsinfo(&mut self) -> FsResult<()> {
        let Some(sector) = self.geo.fsinfo_sector else {
            self.fsinfo = FsInfo::unknown();
            return Ok(());
        };
        let buf = self.cache.read(&self.dev, sector)?;
        let free_count = read_u32(buf, FSINFO_FREE_COUNT_OFFSET);
        let next_free = read_u32(buf, FSINFO_NEXT_FREE_OFFSET);
        self.fsinfo = FsInfo::from_raw(free_count, next_free, self.geo.cluster_count);
        log::debug!(
            "emfat: fsinfo free={:?} next={}",
            self.fsinfo.free_clusters(),
            self.fsinfo.next_free
        );
        Ok(())
    }

    /// Stores the FSInfo fields if anything changed since the last write.
    /// The sector goes through the cache; the caller's flush puts it on disk.
    pub(crate) fn write_fsinfo(&mut self) -> FsResult<()> {
        if !self.fsinfo.dirty {
            return Ok(());
        }
        let Some(sector) = self.geo.fsinfo_sector else {
            self.fsinfo.dirty = false;
            return Ok(());
        };
        let buf = self.cache.read_mut(&self.dev, sector)?;
        write_u32(buf, FSINFO_FREE_COUNT_OFFSET, self.fsinfo.free_count);
        write_u32(buf, FSINFO_NEXT_FREE_OFFSET, self.fsinfo.next_free);
        self.fsinfo.dirty = false;
        log::debug!(
            "emfat: fsinfo stored free={:?} next={}",
            self.fsinfo.free_clusters(),
            self.fsinfo.next_free
        );
        Ok(())
    }

    /// Recounts free clusters with a full FAT scan and rewrites FSInfo.
    pub fn repair_fsinfo(&mut self) -> FsResult<()> {
        let mut fs = self.flushing();
        let mut free = 0u32;
        let mut first_free = 0u32;
        for cluster in FIRST_CLUSTER..=fs.geo.max_cluster() {
            if fs.fat_get(cluster)? == FatEntry::Free {
                free += 1;
                if first_free == 0 {
                    first_free = cluster;
                }
            }
        }
        fs.fsinfo.free_count = free;
        fs.fsinfo.next_free = if first_free > FIRST_CLUSTER {
            first_free - 1
        } else {
            FIRST_CLUSTER
        };
        fs.fsinfo.dirty = true;
        log::info!("emfat: fsinfo repaired, {} free clusters", free);
        fs.write_fsinfo()?;
        fs.finish()
    }
}
