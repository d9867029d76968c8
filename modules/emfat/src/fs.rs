//! Mounted volume state and the [`FileSystem`] surface.

use core::ops::{Deref, DerefMut};

use emvfs::{DirEntry, FileSystem, FsError, FsResult, Metadata, OpenFlags, SeekWhence};

use crate::block::{BlockDevice, FatMirror, SectorCache};
use crate::boot::{BiosParameterBlock, FatType, Geometry, PartitionRecord, MBR_SECTOR_SIZE};
use crate::dir::Lookup;
use crate::file::FatFile;
use crate::fsinfo::FsInfo;

/// A mounted FAT volume. Owns the device and the one-sector metadata cache;
/// every operation goes through `&mut self`.
pub struct FatFs<D: BlockDevice> {
    pub(crate) dev: D,
    pub(crate) geo: Geometry,
    pub(crate) cache: SectorCache,
    pub(crate) fsinfo: FsInfo,
}

impl<D: BlockDevice> FatFs<D> {
    /// Reads the first partition record, its boot sector and FSInfo.
    pub fn mount(dev: D) -> FsResult<Self> {
        let mut mbr = [0u8; MBR_SECTOR_SIZE];
        if dev.read_at(0, &mut mbr) != MBR_SECTOR_SIZE {
            return Err(FsError::Io);
        }
        let record = PartitionRecord::first_of(&mbr)?;
        let Some(fat_type) = FatType::from_partition_type(record.part_type) else {
            log::warn!("emfat: partition type {:#04x} is not FAT", record.part_type);
            return Err(FsError::Invalid);
        };
        let offset = record.lba_start as u64 * MBR_SECTOR_SIZE as u64;
        let mut boot = [0u8; MBR_SECTOR_SIZE];
        if dev.read_at(offset, &mut boot) != MBR_SECTOR_SIZE {
            return Err(FsError::Io);
        }
        let bpb = BiosParameterBlock::parse(&boot)?;
        let geo = Geometry::derive(fat_type, offset, &bpb)?;
        let mut cache = SectorCache::new(offset, geo.bytes_per_sector as usize)?;
        cache.set_mirror(FatMirror {
            first: geo.first_fat_sector,
            sectors: geo.sectors_per_fat,
            copies: geo.num_fats,
        });
        let mut fs = Self {
            dev,
            geo,
            cache,
            fsinfo: FsInfo::unknown(),
        };
        fs.read_fsinfo()?;
        log::info!(
            "emfat: mounted {:?} at {:#x}: {} clusters of {} bytes, FAT at {}, data at {}",
            geo.fat_type,
            offset,
            geo.cluster_count,
            geo.bytes_per_cluster,
            geo.first_fat_sector,
            geo.first_data_sector
        );
        Ok(fs)
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }

    pub fn fsinfo(&self) -> &FsInfo {
        &self.fsinfo
    }

    /// Advisory free cluster count, if known.
    pub fn free_clusters(&self) -> Option<u32> {
        self.fsinfo.free_clusters()
    }

    /// Writes pending FSInfo changes and the dirty cache sector.
    pub fn sync(&mut self) -> FsResult<()> {
        self.write_fsinfo()?;
        self.cache.flush(&self.dev)
    }

    pub fn into_device(mut self) -> FsResult<D> {
        self.sync()?;
        Ok(self.dev)
    }

    /// Borrows the volume for a mutating operation; whatever happens, the
    /// metadata is synced when the guard goes away.
    pub(crate) fn flushing(&mut self) -> Flushing<'_, D> {
        Flushing { fs: self, armed: true }
    }

    /// Reads file data straight from the device. Returns the byte count the
    /// device delivered.
    pub(crate) fn read_raw(
        &mut self,
        sector: u32,
        offset: usize,
        buf: &mut [u8],
    ) -> FsResult<usize> {
        if self.cache.cached() == Some(sector) {
            self.cache.flush(&self.dev)?;
        }
        Ok(self.dev.read_at(self.geo.sector_addr(sector) + offset as u64, buf))
    }

    pub(crate) fn write_raw(&mut self, sector: u32, offset: usize, buf: &[u8]) -> FsResult<usize> {
        if self.cache.cached() == Some(sector) {
            self.cache.flush(&self.dev)?;
            self.cache.invalidate(sector);
        }
        Ok(self.dev.write_at(self.geo.sector_addr(sector) + offset as u64, buf))
    }

    pub fn read_dir(
        &mut self,
        path: &str,
        offset: usize,
        entries: &mut [DirEntry],
    ) -> FsResult<usize> {
        match self.resolve(path)? {
            Lookup::Found(dir) if dir.is_dir => self.list_dir(dir.cluster, offset, entries),
            Lookup::Found(_) => Err(FsError::NotDir),
            Lookup::Missing { .. } => Err(FsError::NotFound),
        }
    }
}

pub(crate) struct Flushing<'a, D: BlockDevice> {
    fs: &'a mut FatFs<D>,
    armed: bool,
}

impl<D: BlockDevice> Flushing<'_, D> {
    /// Syncs now and reports the outcome.
    pub fn finish(mut self) -> FsResult<()> {
        self.armed = false;
        self.fs.sync()
    }
}

impl<D: BlockDevice> Deref for Flushing<'_, D> {
    type Target = FatFs<D>;

    fn deref(&self) -> &Self::Target {
        self.fs
    }
}

impl<D: BlockDevice> DerefMut for Flushing<'_, D> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.fs
    }
}

impl<D: BlockDevice> Drop for Flushing<'_, D> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(err) = self.fs.sync() {
                log::error!("emfat: deferred flush failed: {}", err);
            }
        }
    }
}

impl<D: BlockDevice> FileSystem for FatFs<D> {
    type Handle = FatFile;

    fn open(&mut self, path: &str, flags: OpenFlags) -> FsResult<FatFile> {
        FatFs::open(self, path, flags)
    }

    fn read(&mut self, handle: &mut FatFile, buf: &mut [u8]) -> FsResult<usize> {
        FatFs::read(self, handle, buf)
    }

    fn write(&mut self, handle: &mut FatFile, buf: &[u8]) -> FsResult<usize> {
        FatFs::write(self, handle, buf)
    }

    fn seek(&mut self, handle: &mut FatFile, offset: i64, whence: SeekWhence) -> FsResult<u64> {
        FatFs::seek(self, handle, offset, whence)
    }

    fn close(&mut self, handle: FatFile) -> FsResult<()> {
        FatFs::close(self, handle)
    }

    fn unlink(&mut self, path: &str) -> FsResult<()> {
        FatFs::unlink(self, path)
    }

    fn metadata(&mut self, path: &str) -> FsResult<Metadata> {
        FatFs::metadata(self, path)
    }

    fn read_dir(&mut self, path: &str, offset: usize, entries: &mut [DirEntry]) -> FsResult<usize> {
        FatFs::read_dir(self, path, offset, entries)
    }
}
