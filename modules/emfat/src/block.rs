use emvfs::{FsError, FsResult};

pub const MAX_SECTOR_SIZE: usize = 4096;

/// Byte-addressed storage the engine sits on.
///
/// Both calls return how many bytes were actually transferred; anything short
/// of `buf.len()` is treated as a device failure by the layers above.
pub trait BlockDevice {
    fn read_at(&self, addr: u64, buf: &mut [u8]) -> usize;
    fn write_at(&self, addr: u64, buf: &[u8]) -> usize;
}

impl<T: BlockDevice + ?Sized> BlockDevice for &T {
    fn read_at(&self, addr: u64, buf: &mut [u8]) -> usize {
        (**self).read_at(addr, buf)
    }

    fn write_at(&self, addr: u64, buf: &[u8]) -> usize {
        (**self).write_at(addr, buf)
    }
}

/// Sector range of FAT #0 and how many copies follow it back to back.
#[derive(Clone, Copy, Debug)]
pub struct FatMirror {
    pub first: u32,
    pub sectors: u32,
    pub copies: u8,
}

/// Single-sector write-back cache for FAT, directory and FSInfo sectors.
///
/// Sector ids are relative to `base`, the partition's byte offset. A dirty
/// sector is written back before the buffer is repointed.
pub struct SectorCache {
    base: u64,
    size: usize,
    sector: Option<u32>,
    dirty: bool,
    mirror: Option<FatMirror>,
    buf: [u8; MAX_SECTOR_SIZE],
}

impl SectorCache {
    pub fn new(base: u64, size: usize) -> FsResult<Self> {
        if size == 0 || size > MAX_SECTOR_SIZE {
            return Err(FsError::Invalid);
        }
        Ok(Self {
            base,
            size,
            sector: None,
            dirty: false,
            mirror: None,
            buf: [0; MAX_SECTOR_SIZE],
        })
    }

    pub fn set_mirror(&mut self, mirror: FatMirror) {
        self.mirror = Some(mirror);
    }

    pub fn cached(&self) -> Option<u32> {
        self.sector
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn sector_addr(&self, sector: u32) -> u64 {
        self.base + sector as u64 * self.size as u64
    }

    pub fn read<D: BlockDevice + ?Sized>(&mut self, dev: &D, sector: u32) -> FsResult<&[u8]> {
        self.load(dev, sector)?;
        Ok(&self.buf[..self.size])
    }

    /// Loads `sector` and hands out its buffer already marked dirty.
    pub fn read_mut<D: BlockDevice + ?Sized>(
        &mut self,
        dev: &D,
        sector: u32,
    ) -> FsResult<&mut [u8]> {
        self.load(dev, sector)?;
        self.dirty = true;
        Ok(&mut self.buf[..self.size])
    }

    /// Marks the cached copy of `sector` as modified. Nothing reaches the
    /// device until the next flush or repoint.
    pub fn write(&mut self, sector: u32) -> FsResult<()> {
        if self.sector != Some(sector) {
            return Err(FsError::Invalid);
        }
        self.dirty = true;
        Ok(())
    }

    pub fn flush<D: BlockDevice + ?Sized>(&mut self, dev: &D) -> FsResult<()> {
        let sector = match self.sector {
            Some(sector) if self.dirty => sector,
            _ => return Ok(()),
        };
        self.store(dev, sector)?;
        if let Some(mirror) = self.mirror {
            if sector >= mirror.first && sector < mirror.first + mirror.sectors {
                for copy in 1..mirror.copies as u32 {
                    self.store(dev, sector + copy * mirror.sectors)?;
                }
            }
        }
        self.dirty = false;
        Ok(())
    }

    /// Drops a cached copy of `sector` without writing it back.
    pub fn invalidate(&mut self, sector: u32) {
        if self.sector == Some(sector) {
            self.sector = None;
            self.dirty = false;
        }
    }

    fn load<D: BlockDevice + ?Sized>(&mut self, dev: &D, sector: u32) -> FsResult<()> {
        if self.sector == Some(sector) {
            return Ok(());
        }
        self.flush(dev)?;
        self.sector = None;
        let addr = self.sector_addr(sector);
        let read = dev.read_at(addr, &mut self.buf[..self.size]);
        if read != self.size {
            log::warn!("emfat: short read of sector {} ({}/{} bytes)", sector, read, self.size);
            return Err(FsError::Io);
        }
        self.sector = Some(sector);
        Ok(())
    }

    fn store<D: BlockDevice + ?Sized>(&self, dev: &D, sector: u32) -> FsResult<()> {
        let written = dev.write_at(self.sector_addr(sector), &self.buf[..self.size]);
        if written != self.size {
            log::warn!("emfat: short write of sector {} ({}/{} bytes)", sector, written, self.size);
            return Err(FsError::Io);
        }
        Ok(())
    }
}
