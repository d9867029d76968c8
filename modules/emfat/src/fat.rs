//! File allocation table access: entry codec, chain walking and cluster
//! allocation.

use emvfs::{FsError, FsResult};

use crate::block::{BlockDevice, MAX_SECTOR_SIZE};
use crate::boot::{read_u16, read_u32, write_u16, write_u32, FatType};
use crate::fs::FatFs;

const FAT16_BAD: u32 = 0xfff7;
const FAT16_EOC_MIN: u32 = 0xfff8;
const FAT16_EOC: u32 = 0xffff;
const FAT32_MASK: u32 = 0x0fff_ffff;
const FAT32_BAD: u32 = 0x0fff_fff7;
const FAT32_EOC_MIN: u32 = 0x0fff_fff8;
const FAT32_EOC: u32 = 0x0fff_ffff;

static ZERO_SECTOR: [u8; MAX_SECTOR_SIZE] = [0; MAX_SECTOR_SIZE];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FatEntry {
    Free,
    Next(u32),
    Bad,
    EndOfChain,
}

impl FatEntry {
    pub fn decode(raw: u32, fat_type: FatType) -> Self {
        let (raw, bad, eoc_min) = match fat_type {
            FatType::Fat32 => (raw & FAT32_MASK, FAT32_BAD, FAT32_EOC_MIN),
            FatType::Fat16 | FatType::Fat12 => (raw & 0xffff, FAT16_BAD, FAT16_EOC_MIN),
        };
        match raw {
            0 => FatEntry::Free,
            value if value == bad => FatEntry::Bad,
            value if value >= eoc_min => FatEntry::EndOfChain,
            value => FatEntry::Next(value),
        }
    }

    pub fn encode(self, fat_type: FatType) -> u32 {
        let (bad, eoc) = match fat_type {
            FatType::Fat32 => (FAT32_BAD, FAT32_EOC),
            FatType::Fat16 | FatType::Fat12 => (FAT16_BAD, FAT16_EOC),
        };
        match self {
            FatEntry::Free => 0,
            FatEntry::Next(cluster) => cluster,
            FatEntry::Bad => bad,
            FatEntry::EndOfChain => eoc,
        }
    }
}

/// Clusters added to a chain by one `chain_extend` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChainExtent {
    pub first: u32,
    pub count: u32,
}

impl<D: BlockDevice> FatFs<D> {
    fn fat_location(&self, cluster: u32) -> (u32, usize) {
        let bytes_per_sector = self.geo.bytes_per_sector as usize;
        let fat_offset = cluster as usize * self.geo.fat_type.entry_size();
        let sector = self.geo.first_fat_sector + (fat_offset / bytes_per_sector) as u32;
        (sector, fat_offset % bytes_per_sector)
    }

    pub fn fat_get(&mut self, cluster: u32) -> FsResult<FatEntry> {
        if cluster > self.geo.max_cluster() {
            return Err(FsError::Invalid);
        }
        let (sector, offset) = self.fat_location(cluster);
        let fat_type = self.geo.fat_type;
        let buf = self.cache.read(&self.dev, sector)?;
        let raw = match fat_type {
            FatType::Fat32 => read_u32(buf, offset),
            FatType::Fat16 | FatType::Fat12 => read_u16(buf, offset) as u32,
        };
        Ok(FatEntry::decode(raw, fat_type))
    }

    /// Updates one FAT entry in the cache. The caller flushes.
    pub fn fat_set(&mut self, cluster: u32, entry: FatEntry) -> FsResult<()> {
        if cluster < 2 || cluster > self.geo.max_cluster() {
            return Err(FsError::Invalid);
        }
        let (sector, offset) = self.fat_location(cluster);
        let fat_type = self.geo.fat_type;
        let value = entry.encode(fat_type);
        let buf = self.cache.read_mut(&self.dev, sector)?;
        match fat_type {
            FatType::Fat32 => {
                // the top four bits are reserved and must survive the update
                let old = read_u32(buf, offset);
                write_u32(buf, offset, (old & !FAT32_MASK) | (value & FAT32_MASK));
            }
            FatType::Fat16 | FatType::Fat12 => write_u16(buf, offset, value as u16),
        }
        Ok(())
    }

    /// The cluster following `cluster`, or `None` at the end of the chain.
    ///
    /// A link into a free, bad or out-of-range cluster means the chain is
    /// broken; it is logged and treated as the end of the chain.
    pub fn next_cluster(&mut self, cluster: u32) -> FsResult<Option<u32>> {
        match self.fat_get(cluster)? {
            FatEntry::Next(next) if self.geo.is_valid_cluster(next) => Ok(Some(next)),
            FatEntry::Next(next) => {
                log::warn!("emfat: cluster {} links to out-of-range cluster {}", cluster, next);
                Ok(None)
            }
            FatEntry::EndOfChain => Ok(None),
            FatEntry::Free => {
                log::warn!("emfat: broken chain, cluster {} is marked free", cluster);
                Ok(None)
            }
            FatEntry::Bad => {
                log::warn!("emfat: broken chain, cluster {} is marked bad", cluster);
                Ok(None)
            }
        }
    }

    /// Number of clusters in the chain starting at `start`; 0 for no chain.
    pub fn chain_length(&mut self, start: u32) -> FsResult<u32> {
        if start == 0 {
            return Ok(0);
        }
        if !self.geo.is_valid_cluster(start) {
            log::warn!("emfat: chain starts at invalid cluster {}", start);
            return Ok(0);
        }
        let mut length = 1u32;
        let mut cluster = start;
        while let Some(next) = self.next_cluster(cluster)? {
            if length >= self.geo.cluster_count {
                log::warn!("emfat: chain from cluster {} loops", start);
                break;
            }
            length += 1;
            cluster = next;
        }
        Ok(length)
    }

    /// Last cluster of the chain holding `cluster`.
    fn chain_tail(&mut self, cluster: u32) -> FsResult<u32> {
        let mut tail = cluster;
        let mut steps = 0u32;
        while let Some(next) = self.next_cluster(tail)? {
            steps += 1;
            if steps > self.geo.cluster_count {
                log::warn!("emfat: chain through cluster {} loops", cluster);
                break;
            }
            tail = next;
        }
        Ok(tail)
    }

    /// First free cluster in `start..=stop`, or 0 if there is none.
    pub fn free_search(&mut self, start: u32, stop: u32) -> FsResult<u32> {
        let start = start.max(2);
        let stop = stop.min(self.geo.max_cluster());
        for cluster in start..=stop {
            if self.fat_get(cluster)? == FatEntry::Free {
                return Ok(cluster);
            }
        }
        Ok(0)
    }

    /// Finds a free cluster, searching after the FSInfo hint first and then
    /// wrapping to the start of the FAT. Returns 0 when the volume is full.
    pub fn free_find(&mut self) -> FsResult<u32> {
        let max = self.geo.max_cluster();
        let hint = self.fsinfo.next_free;
        let start = if self.geo.is_valid_cluster(hint) { hint + 1 } else { 2 };
        let mut found = if start <= max {
            self.free_search(start, max)?
        } else {
            0
        };
        if found == 0 && start > 2 {
            found = self.free_search(2, start - 1)?;
        }
        if found != 0 {
            self.fsinfo.note_allocated(found);
        }
        Ok(found)
    }

    /// Takes a free cluster, terminates it and appends it after `prev`
    /// (0 starts a new chain).
    pub fn allocate(&mut self, prev: u32) -> FsResult<u32> {
        let cluster = self.free_find()?;
        if cluster == 0 {
            return Err(FsError::NoSpace);
        }
        self.fat_set(cluster, FatEntry::EndOfChain)?;
        if prev != 0 {
            let old = self.fat_get(prev)?;
            if old != FatEntry::EndOfChain {
                log::warn!(
                    "emfat: linking cluster {} after non-tail cluster {} ({:?})",
                    cluster,
                    prev,
                    old
                );
            }
            self.fat_set(prev, FatEntry::Next(cluster))?;
        }
        log::trace!("emfat: allocated cluster {} after {}", cluster, prev);
        Ok(cluster)
    }

    /// Appends up to `count` clusters to the chain holding `start`, or builds
    /// a new chain when `start` is 0.
    ///
    /// Stops early when the volume fills up; the returned extent says how many
    /// clusters were actually added. Fails with `NoSpace` only if none were.
    pub fn chain_extend(&mut self, start: u32, count: u32) -> FsResult<ChainExtent> {
        let mut tail = if start == 0 { 0 } else { self.chain_tail(start)? };
        let mut extent = ChainExtent { first: 0, count: 0 };
        while extent.count < count {
            match self.allocate(tail) {
                Ok(cluster) => {
                    if extent.count == 0 {
                        extent.first = cluster;
                    }
                    extent.count += 1;
                    tail = cluster;
                }
                Err(FsError::NoSpace) => {
                    log::warn!("emfat: volume full after {} of {} clusters", extent.count, count);
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        if count > 0 && extent.count == 0 {
            return Err(FsError::NoSpace);
        }
        Ok(extent)
    }

    /// Releases every cluster of the chain starting at `start` and returns how
    /// many were freed.
    pub fn chain_free(&mut self, start: u32) -> FsResult<u32> {
        if !self.geo.is_valid_cluster(start) {
            return Ok(0);
        }
        let mut freed = 0u32;
        let mut cluster = start;
        loop {
            let entry = self.fat_get(cluster)?;
            match entry {
                FatEntry::Free => {
                    log::warn!(
                        "emfat: cluster {} already free while releasing chain {}",
                        cluster,
                        start
                    );
                    break;
                }
                FatEntry::Bad => {
                    log::warn!("emfat: chain {} runs into bad cluster {}", start, cluster);
                    break;
                }
                _ => {}
            }
            self.fat_set(cluster, FatEntry::Free)?;
            freed += 1;
            match entry {
                FatEntry::Next(next)
                    if self.geo.is_valid_cluster(next) && freed < self.geo.cluster_count =>
                {
                    cluster = next;
                }
                FatEntry::EndOfChain => break,
                other => {
                    log::warn!(
                        "emfat: chain {} ends abnormally at cluster {} ({:?})",
                        start,
                        cluster,
                        other
                    );
                    break;
                }
            }
        }
        self.fsinfo.note_freed(freed);
        self.write_fsinfo()?;
        Ok(freed)
    }

    /// Fills a freshly allocated cluster with zeroes, bypassing the cache.
    pub(crate) fn zero_cluster(&mut self, cluster: u32) -> FsResult<()> {
        let bytes_per_sector = self.geo.bytes_per_sector as usize;
        let first = self.geo.cluster_to_sector(cluster);
        for sector in first..first + self.geo.sectors_per_cluster {
            self.cache.invalidate(sector);
            let written = self
                .dev
                .write_at(self.geo.sector_addr(sector), &ZERO_SECTOR[..bytes_per_sector]);
            if written != bytes_per_sector {
                return Err(FsError::Io);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::FormatOptions;
    use crate::testutil::formatted;

    #[test]
    fn entry_codec() {
        assert_eq!(FatEntry::decode(0, FatType::Fat16), FatEntry::Free);
        assert_eq!(FatEntry::decode(0xfff7, FatType::Fat16), FatEntry::Bad);
        assert_eq!(FatEntry::decode(0xfff8, FatType::Fat16), FatEntry::EndOfChain);
        assert_eq!(FatEntry::decode(0x1234, FatType::Fat16), FatEntry::Next(0x1234));
        assert_eq!(FatEntry::decode(0xf000_0000, FatType::Fat32), FatEntry::Free);
        assert_eq!(FatEntry::decode(0x0fff_fff7, FatType::Fat32), FatEntry::Bad);
        assert_eq!(FatEntry::decode(0xffff_ffff, FatType::Fat32), FatEntry::EndOfChain);
        assert_eq!(FatEntry::decode(0x1000_0005, FatType::Fat32), FatEntry::Next(5));
        assert_eq!(FatEntry::EndOfChain.encode(FatType::Fat16), 0xffff);
        assert_eq!(FatEntry::EndOfChain.encode(FatType::Fat32), 0x0fff_ffff);
    }

    #[test]
    fn fat32_set_keeps_reserved_bits() {
        let disk = formatted(&FormatOptions::fat32(4096));
        let mut fs = FatFs::mount(&disk).unwrap();
        let (sector, offset) = fs.fat_location(9);
        fs.cache.read_mut(&disk, sector).unwrap()[offset + 3] = 0xa0;
        fs.fat_set(9, FatEntry::Next(10)).unwrap();
        let raw = read_u32(fs.cache.read(&disk, sector).unwrap(), offset);
        assert_eq!(raw, 0xa000_000a);
        assert_eq!(fs.fat_get(9).unwrap(), FatEntry::Next(10));
    }

    #[test]
    fn chain_walk_reaches_end() {
        let disk = formatted(&FormatOptions::fat32(4096));
        let mut fs = FatFs::mount(&disk).unwrap();
        let extent = fs.chain_extend(0, 5).unwrap();
        assert_eq!(extent.count, 5);
        let length = fs.chain_length(extent.first).unwrap();
        assert_eq!(length, 5);
        let mut cluster = extent.first;
        for _ in 1..length {
            cluster = fs.next_cluster(cluster).unwrap().unwrap();
        }
        assert_eq!(fs.next_cluster(cluster).unwrap(), None);
        assert_eq!(fs.fat_get(cluster).unwrap(), FatEntry::EndOfChain);
        assert_eq!(fs.chain_length(0).unwrap(), 0);
    }

    #[test]
    fn extend_appends_to_tail() {
        let disk = formatted(&FormatOptions::fat32(4096));
        let mut fs = FatFs::mount(&disk).unwrap();
        let head = fs.chain_extend(0, 2).unwrap().first;
        let more = fs.chain_extend(head, 3).unwrap();
        assert_eq!(more.count, 3);
        assert_eq!(fs.chain_length(head).unwrap(), 5);
        assert_eq!(fs.chain_length(more.first).unwrap(), 3);
    }

    #[test]
    fn free_count_is_conserved() {
        let disk = formatted(&FormatOptions::fat32(4096));
        let mut fs = FatFs::mount(&disk).unwrap();
        let before = fs.free_clusters().unwrap();
        let head = fs.chain_extend(0, 7).unwrap().first;
        assert_eq!(fs.free_clusters(), Some(before - 7));
        assert_eq!(fs.chain_free(head).unwrap(), 7);
        assert_eq!(fs.free_clusters(), Some(before));
        assert_eq!(fs.fat_get(head).unwrap(), FatEntry::Free);
    }

    #[test]
    fn free_find_wraps_past_hint() {
        let disk = formatted(&FormatOptions::fat32(4096));
        let mut fs = FatFs::mount(&disk).unwrap();
        let max = fs.geometry().max_cluster();
        fs.fsinfo.next_free = max;
        let cluster = fs.free_find().unwrap();
        assert_eq!(cluster, 3);
        assert_eq!(fs.fsinfo().next_free, 3);
    }

    #[test]
    fn free_search_reports_full_range() {
        let disk = formatted(&FormatOptions::fat32(4096));
        let mut fs = FatFs::mount(&disk).unwrap();
        assert_eq!(fs.free_search(2, 2).unwrap(), 0);
        assert_eq!(fs.free_search(2, 3).unwrap(), 3);
    }

    #[test]
    fn extend_on_full_volume() {
        let disk = formatted(&FormatOptions::fat32(4096));
        let mut fs = FatFs::mount(&disk).unwrap();
        let free = fs.free_clusters().unwrap();
        let head = fs.chain_extend(0, free - 1).unwrap().first;
        let partial = fs.chain_extend(head, 3).unwrap();
        assert_eq!(partial.count, 1);
        assert_eq!(fs.free_clusters(), Some(0));
        assert_eq!(fs.chain_extend(head, 1).err(), Some(FsError::NoSpace));
        assert_eq!(fs.allocate(0).err(), Some(FsError::NoSpace));
    }

    #[test]
    fn broken_chain_ends_walk() {
        let disk = formatted(&FormatOptions::fat32(4096));
        let mut fs = FatFs::mount(&disk).unwrap();
        let head = fs.chain_extend(0, 3).unwrap().first;
        let second = fs.next_cluster(head).unwrap().unwrap();
        let third = fs.next_cluster(second).unwrap().unwrap();
        fs.fat_set(third, FatEntry::Free).unwrap();
        assert_eq!(fs.next_cluster(second).unwrap(), Some(third));
        assert_eq!(fs.next_cluster(third).unwrap(), None);
        assert_eq!(fs.chain_length(head).unwrap(), 3);
    }

    #[test]
    fn bad_clusters_stay_out_of_the_pool() {
        let disk = formatted(&FormatOptions::fat32(4096));
        let mut fs = FatFs::mount(&disk).unwrap();
        let before = fs.free_clusters().unwrap();
        let head = fs.chain_extend(0, 3).unwrap().first;
        let second = fs.next_cluster(head).unwrap().unwrap();
        let third = fs.next_cluster(second).unwrap().unwrap();
        fs.fat_set(third, FatEntry::Bad).unwrap();
        assert_eq!(fs.chain_free(head).unwrap(), 2);
        assert_eq!(fs.fat_get(third).unwrap(), FatEntry::Bad);
        assert_eq!(fs.fat_get(second).unwrap(), FatEntry::Free);
        assert_eq!(fs.free_clusters(), Some(before - 1));
    }

    #[test]
    fn looping_chain_is_bounded() {
        let disk = formatted(&FormatOptions::fat32(4096));
        let mut fs = FatFs::mount(&disk).unwrap();
        let head = fs.chain_extend(0, 2).unwrap().first;
        let second = fs.next_cluster(head).unwrap().unwrap();
        fs.fat_set(second, FatEntry::Next(head)).unwrap();
        let count = fs.geometry().cluster_count;
        assert_eq!(fs.chain_length(head).unwrap(), count);
    }

    #[test]
    fn fat16_chains() {
        let disk = formatted(&FormatOptions::fat16(8192));
        let mut fs = FatFs::mount(&disk).unwrap();
        let head = fs.chain_extend(0, 4).unwrap().first;
        assert_eq!(fs.chain_length(head).unwrap(), 4);
        let (sector, offset) = fs.fat_location(head);
        let raw = read_u16(fs.cache.read(&disk, sector).unwrap(), offset);
        assert_eq!(raw as u32, head + 1);
        assert_eq!(fs.chain_free(head).unwrap(), 4);
    }
}
