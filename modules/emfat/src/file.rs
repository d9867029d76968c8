//! Open file handles and the byte-level operations on them.

use emvfs::{FileType, FsError, FsResult, Metadata, OpenFlags, SeekWhence};

use crate::block::BlockDevice;
use crate::dir::{Attributes, EntryLocation, Lookup};
use crate::fs::FatFs;
use crate::name::has_wildcards;

const MODE_DIR: u16 = 0o755;
const MODE_FILE: u16 = 0o644;
const MODE_READ_ONLY_DIR: u16 = 0o555;
const MODE_READ_ONLY_FILE: u16 = 0o444;

/// An open regular file.
///
/// `cluster` holds the byte just before `offset` (the start cluster while
/// `offset` is 0), so a handle parked at the end of its last cluster never
/// needs a link that is not there yet.
#[derive(Debug)]
pub struct FatFile {
    flags: OpenFlags,
    offset: u32,
    size: u32,
    alloc: u32,
    start_cluster: u32,
    cluster: u32,
    entry: EntryLocation,
}

impl FatFile {
    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Bytes covered by the cluster chain.
    pub fn allocated(&self) -> u32 {
        self.alloc
    }

    pub fn start_cluster(&self) -> u32 {
        self.start_cluster
    }

    pub fn entry(&self) -> EntryLocation {
        self.entry
    }
}

impl<D: BlockDevice> FatFs<D> {
    pub fn open(&mut self, path: &str, flags: OpenFlags) -> FsResult<FatFile> {
        if path.is_empty() {
            return Err(FsError::Invalid);
        }
        let mut fs = self.flushing();
        let bytes_per_cluster = fs.geo.bytes_per_cluster;
        let mut file = match fs.resolve(path)? {
            Lookup::Found(entry) => {
                if entry.is_dir {
                    return Err(FsError::IsDir);
                }
                let location = entry.location.ok_or(FsError::IsDir)?;
                if flags.writable() && entry.attributes.contains(Attributes::READ_ONLY) {
                    return Err(FsError::Permission);
                }
                let mut file = FatFile {
                    flags,
                    offset: 0,
                    size: entry.size,
                    alloc: 0,
                    start_cluster: entry.cluster,
                    cluster: entry.cluster,
                    entry: location,
                };
                if flags.contains(OpenFlags::TRUNCATE) && flags.writable() {
                    if entry.cluster != 0 {
                        fs.chain_free(entry.cluster)?;
                    }
                    fs.set_size(location, 0)?;
                    fs.set_cluster(location, 0)?;
                    file.size = 0;
                    file.start_cluster = 0;
                    file.cluster = 0;
                } else {
                    file.alloc = fs.chain_length(entry.cluster)?.saturating_mul(bytes_per_cluster);
                    if file.size > file.alloc {
                        log::warn!(
                            "emfat: {} claims {} bytes but its chain holds {}",
                            path,
                            file.size,
                            file.alloc
                        );
                    }
                }
                file
            }
            Lookup::Missing { parent, name } => {
                if !flags.contains(OpenFlags::CREATE) {
                    return Err(FsError::NotFound);
                }
                if has_wildcards(name) {
                    return Err(FsError::Invalid);
                }
                let entry = fs.append(parent, name)?;
                FatFile {
                    flags,
                    offset: 0,
                    size: 0,
                    alloc: 0,
                    start_cluster: 0,
                    cluster: 0,
                    entry: entry.location.ok_or(FsError::Invalid)?,
                }
            }
        };
        if flags.contains(OpenFlags::APPEND) {
            fs.seek(&mut file, 0, SeekWhence::End)?;
        }
        fs.finish()?;
        Ok(file)
    }

    /// Cluster holding the byte at `file.offset`, following the chain when
    /// the offset sits on a cluster boundary.
    fn data_cluster(&mut self, file: &FatFile) -> FsResult<Option<u32>> {
        if file.offset == 0 {
            return Ok(Some(file.start_cluster).filter(|&cluster| cluster != 0));
        }
        if file.offset % self.geo.bytes_per_cluster != 0 {
            return Ok(Some(file.cluster));
        }
        self.next_cluster(file.cluster)
    }

    /// Sector and in-sector byte offset of `offset` within `cluster`.
    fn data_position(&self, cluster: u32, offset: u32) -> (u32, usize) {
        let in_cluster = offset % self.geo.bytes_per_cluster;
        let sector = self.geo.cluster_to_sector(cluster) + in_cluster / self.geo.bytes_per_sector;
        (sector, (in_cluster % self.geo.bytes_per_sector) as usize)
    }

    pub fn read(&mut self, file: &mut FatFile, buf: &mut [u8]) -> FsResult<usize> {
        if !file.flags.readable() {
            return Err(FsError::Permission);
        }
        let bytes_per_sector = self.geo.bytes_per_sector as usize;
        let want = buf.len().min(file.size.saturating_sub(file.offset) as usize);
        let mut done = 0usize;
        while done < want {
            let Some(cluster) = self.data_cluster(file)? else {
                log::warn!("emfat: chain ended at byte {} of {}", file.offset, file.size);
                break;
            };
            let (sector, in_sector) = self.data_position(cluster, file.offset);
            let chunk = (want - done).min(bytes_per_sector - in_sector);
            let n = self.read_raw(sector, in_sector, &mut buf[done..done + chunk])?;
            if n > 0 {
                file.cluster = cluster;
                file.offset += n as u32;
                done += n;
            }
            if n < chunk {
                log::warn!("emfat: short device read in sector {}", sector);
                break;
            }
        }
        Ok(done)
    }

    /// Writes at the handle's offset, growing the chain as needed.
    ///
    /// A volume that fills up part way gives a short count; one that cannot
    /// take a single byte gives `NoSpace`.
    pub fn write(&mut self, file: &mut FatFile, buf: &[u8]) -> FsResult<usize> {
        if !file.flags.writable() {
            return Err(FsError::Permission);
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let mut fs = self.flushing();
        let bytes_per_cluster = fs.geo.bytes_per_cluster;
        let bytes_per_sector = fs.geo.bytes_per_sector as usize;
        let len = buf.len().min((u32::MAX - file.offset) as usize) as u32;
        let end = file.offset + len;

        let mut volume_full = false;
        if end > file.alloc {
            let have = file.alloc / bytes_per_cluster;
            let need = (end - 1) / bytes_per_cluster + 1 - have;
            let from = if file.cluster != 0 { file.cluster } else { file.start_cluster };
            match fs.chain_extend(from, need) {
                Ok(extent) => {
                    if file.start_cluster == 0 {
                        file.start_cluster = extent.first;
                        file.cluster = extent.first;
                        fs.set_cluster(file.entry, extent.first)?;
                    }
                    file.alloc += extent.count * bytes_per_cluster;
                    volume_full = extent.count < need;
                }
                Err(FsError::NoSpace) => volume_full = true,
                Err(err) => return Err(err),
            }
        }

        let want = len.min(file.alloc.saturating_sub(file.offset)) as usize;
        let mut done = 0usize;
        while done < want {
            let Some(cluster) = fs.data_cluster(file)? else {
                log::warn!("emfat: chain ended at byte {} while writing", file.offset);
                break;
            };
            let (sector, in_sector) = fs.data_position(cluster, file.offset);
            let chunk = (want - done).min(bytes_per_sector - in_sector);
            let n = fs.write_raw(sector, in_sector, &buf[done..done + chunk])?;
            if n > 0 {
                file.cluster = cluster;
                file.offset += n as u32;
                done += n;
            }
            if n < chunk {
                log::warn!("emfat: short device write in sector {}", sector);
                break;
            }
        }

        file.size = file.size.max(file.offset);
        fs.set_size(file.entry, file.size)?;
        fs.set_cluster(file.entry, file.start_cluster)?;
        fs.write_fsinfo()?;
        fs.finish()?;
        if done == 0 && volume_full {
            return Err(FsError::NoSpace);
        }
        Ok(done)
    }

    /// Moves the handle and returns the new offset, clamped to the file size.
    pub fn seek(&mut self, file: &mut FatFile, offset: i64, whence: SeekWhence) -> FsResult<u64> {
        let base = match whence {
            SeekWhence::Set => 0,
            SeekWhence::Cur => file.offset as i64,
            SeekWhence::End => file.size as i64,
        };
        let mut target = base.saturating_add(offset).clamp(0, file.size as i64) as u32;
        let mut cluster = file.start_cluster;
        if target > 0 && cluster == 0 {
            log::warn!("emfat: sized file without clusters");
            target = 0;
        }
        if target > 0 {
            let steps = (target - 1) / self.geo.bytes_per_cluster;
            for step in 0..steps {
                match self.next_cluster(cluster)? {
                    Some(next) => cluster = next,
                    None => {
                        log::warn!("emfat: chain ended after {} clusters while seeking", step + 1);
                        target = (step + 1) * self.geo.bytes_per_cluster;
                        break;
                    }
                }
            }
        }
        file.offset = target;
        file.cluster = cluster;
        Ok(target as u64)
    }

    pub fn close(&mut self, file: FatFile) -> FsResult<()> {
        log::trace!("emfat: closing file at sector {}", file.entry.sector);
        self.sync()
    }

    pub fn unlink(&mut self, path: &str) -> FsResult<()> {
        let mut fs = self.flushing();
        let entry = match fs.resolve(path)? {
            Lookup::Found(entry) if entry.is_dir => return Err(FsError::IsDir),
            Lookup::Found(entry) => entry,
            Lookup::Missing { .. } => return Err(FsError::NotFound),
        };
        let location = entry.location.ok_or(FsError::IsDir)?;
        if entry.cluster != 0 {
            fs.chain_free(entry.cluster)?;
        }
        fs.delete_entry(entry.parent, location)?;
        fs.finish()
    }

    pub fn metadata(&mut self, path: &str) -> FsResult<Metadata> {
        let entry = match self.resolve(path)? {
            Lookup::Found(entry) => entry,
            Lookup::Missing { .. } => return Err(FsError::NotFound),
        };
        let read_only = entry.attributes.contains(Attributes::READ_ONLY);
        let (file_type, mode) = match (entry.is_dir, read_only) {
            (true, false) => (FileType::Dir, MODE_DIR),
            (true, true) => (FileType::Dir, MODE_READ_ONLY_DIR),
            (false, false) => (FileType::File, MODE_FILE),
            (false, true) => (FileType::File, MODE_READ_ONLY_FILE),
        };
        Ok(Metadata::new(file_type, entry.size as u64, mode))
    }
}
