//! Directory traversal and modification.

use bitflags::bitflags;
use emvfs::{DirEntry, FileType, FsError, FsResult};

use crate::block::BlockDevice;
use crate::boot::{read_u16, read_u32, write_u16, write_u32, FatType, Geometry};
use crate::fs::FatFs;
use crate::name::{
    encode_short_name, lfn_checksum, short_name_display, wildcard_match, LongNameBuilder, Name,
    LFN_CHECKSUM_OFFSET, SHORT_NAME_LEN,
};

pub const DIR_ENTRY_SIZE: usize = 32;

const ENTRY_END: u8 = 0x00;
const ENTRY_DELETED: u8 = 0xe5;
const ATTR_LFN_MASK: u8 = 0x0f;

const DIR_ATTR_OFFSET: usize = 11;
const DIR_CREATE_TIME_OFFSET: usize = 14;
const DIR_CREATE_DATE_OFFSET: usize = 16;
const DIR_ACCESS_DATE_OFFSET: usize = 18;
const DIR_CLUSTER_HI_OFFSET: usize = 20;
const DIR_WRITE_TIME_OFFSET: usize = 22;
const DIR_WRITE_DATE_OFFSET: usize = 24;
const DIR_CLUSTER_LO_OFFSET: usize = 26;
const DIR_SIZE_OFFSET: usize = 28;

/// 1980-01-01, the earliest date the format can express.
const DEFAULT_DATE: u16 = (1 << 5) | 1;
const DEFAULT_TIME: u16 = 0;

const DOT: &[u8; SHORT_NAME_LEN] = b".          ";
const DOT_DOT: &[u8; SHORT_NAME_LEN] = b"..         ";

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Attributes: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN = 0x02;
        const SYSTEM = 0x04;
        const VOLUME_ID = 0x08;
        const DIRECTORY = 0x10;
        const ARCHIVE = 0x20;
    }
}

fn is_lfn(raw: &[u8]) -> bool {
    raw[DIR_ATTR_OFFSET] & ATTR_LFN_MASK == ATTR_LFN_MASK
}

/// Sector and byte offset of a 32-byte entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EntryLocation {
    pub sector: u32,
    pub offset: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Moved,
    ChainEnd,
}

/// Position of one slot inside a directory. Cluster 0 is the fixed FAT16
/// root region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirCursor {
    cluster: u32,
    sector: u32,
    offset: u16,
}

impl DirCursor {
    pub fn first(geo: &Geometry, cluster: u32) -> Self {
        let cluster = if cluster == 0 && geo.fat_type == FatType::Fat32 {
            geo.root_cluster
        } else {
            cluster
        };
        Self {
            cluster,
            sector: geo.cluster_to_sector(cluster),
            offset: 0,
        }
    }

    pub fn cluster(&self) -> u32 {
        self.cluster
    }

    pub fn location(&self) -> EntryLocation {
        EntryLocation {
            sector: self.sector,
            offset: self.offset,
        }
    }

    pub fn entry<D: BlockDevice>(&self, fs: &mut FatFs<D>) -> FsResult<[u8; DIR_ENTRY_SIZE]> {
        let buf = fs.cache.read(&fs.dev, self.sector)?;
        let offset = self.offset as usize;
        let mut raw = [0u8; DIR_ENTRY_SIZE];
        raw.copy_from_slice(&buf[offset..offset + DIR_ENTRY_SIZE]);
        Ok(raw)
    }

    /// Moves to the next slot, following the cluster chain. Never allocates;
    /// at the end of the directory the cursor stays where it is.
    pub fn advance<D: BlockDevice>(&mut self, fs: &mut FatFs<D>) -> FsResult<Step> {
        let geo = *fs.geometry();
        let next_offset = self.offset as u32 + DIR_ENTRY_SIZE as u32;
        if next_offset < geo.bytes_per_sector {
            self.offset = next_offset as u16;
            return Ok(Step::Moved);
        }
        let next_sector = self.sector + 1;
        if self.cluster == 0 {
            if next_sector >= geo.first_dir_sector + geo.root_dir_sectors {
                return Ok(Step::ChainEnd);
            }
            self.sector = next_sector;
        } else if next_sector - geo.cluster_to_sector(self.cluster) < geo.sectors_per_cluster {
            self.sector = next_sector;
        } else {
            match fs.next_cluster(self.cluster)? {
                Some(next) => {
                    self.cluster = next;
                    self.sector = geo.cluster_to_sector(next);
                }
                None => return Ok(Step::ChainEnd),
            }
        }
        self.offset = 0;
        Ok(Step::Moved)
    }

    /// Grows the directory by one zeroed cluster and moves to its first slot.
    pub fn extend<D: BlockDevice>(&mut self, fs: &mut FatFs<D>) -> FsResult<()> {
        if self.cluster == 0 {
            return Err(FsError::NoSpace);
        }
        let cluster = fs.allocate(self.cluster)?;
        fs.zero_cluster(cluster)?;
        log::debug!("emfat: directory grew by cluster {} after {}", cluster, self.cluster);
        self.cluster = cluster;
        self.sector = fs.geometry().cluster_to_sector(cluster);
        self.offset = 0;
        Ok(())
    }

    pub fn advance_or_extend<D: BlockDevice>(&mut self, fs: &mut FatFs<D>) -> FsResult<()> {
        if self.advance(fs)? == Step::ChainEnd {
            self.extend(fs)?;
        }
        Ok(())
    }
}

/// A short entry as seen by a directory walk.
pub struct DirRecord {
    pub raw: [u8; DIR_ENTRY_SIZE],
    pub location: EntryLocation,
    pub long_name: Option<Name>,
}

impl DirRecord {
    pub fn short_name(&self) -> &[u8; SHORT_NAME_LEN] {
        self.raw[..SHORT_NAME_LEN]
            .try_into()
            .unwrap_or(&[b' '; SHORT_NAME_LEN])
    }

    pub fn attributes(&self) -> Attributes {
        Attributes::from_bits_truncate(self.raw[DIR_ATTR_OFFSET])
    }

    pub fn is_dot(&self) -> bool {
        self.short_name() == DOT
    }

    pub fn is_dot_dot(&self) -> bool {
        self.short_name() == DOT_DOT
    }

    pub fn is_volume_label(&self) -> bool {
        self.attributes().contains(Attributes::VOLUME_ID)
    }

    pub fn is_dir(&self) -> bool {
        self.attributes().contains(Attributes::DIRECTORY)
    }

    pub fn name(&self) -> Name {
        self.long_name.unwrap_or_else(|| short_name_display(&self.raw))
    }

    pub fn size(&self) -> u32 {
        read_u32(&self.raw, DIR_SIZE_OFFSET)
    }

    pub fn cluster(&self, fat_type: FatType) -> u32 {
        let low = read_u16(&self.raw, DIR_CLUSTER_LO_OFFSET) as u32;
        match fat_type {
            FatType::Fat32 => ((read_u16(&self.raw, DIR_CLUSTER_HI_OFFSET) as u32) << 16) | low,
            FatType::Fat16 | FatType::Fat12 => low,
        }
    }
}

/// A resolved directory entry.
#[derive(Clone, Copy, Debug)]
pub struct FindResult {
    pub cluster: u32,
    pub size: u32,
    /// `None` for the root directory, which has no entry of its own.
    pub location: Option<EntryLocation>,
    pub name: Name,
    pub is_dir: bool,
    pub attributes: Attributes,
    /// Cluster of the directory holding the entry.
    pub parent: u32,
}

impl FindResult {
    pub fn is_root(&self) -> bool {
        self.location.is_none()
    }
}

#[derive(Debug)]
pub enum Lookup<'a> {
    Found(FindResult),
    /// Only the last component is missing; it can be created in `parent`.
    Missing { parent: u32, name: &'a str },
}

impl<D: BlockDevice> FatFs<D> {
    /// Cluster number that names the root directory: 0 on FAT16, the root
    /// cluster on FAT32.
    pub fn root_cluster(&self) -> u32 {
        self.geo.root_cluster
    }

    pub fn root(&self) -> FindResult {
        FindResult {
            cluster: self.root_cluster(),
            size: 0,
            location: None,
            name: Name::empty(),
            is_dir: true,
            attributes: Attributes::DIRECTORY,
            parent: self.root_cluster(),
        }
    }

    /// Visits every short entry of directory `dir` in order, with its long
    /// name when one precedes it. `visit` returns `true` to stop.
    pub fn walk_dir(
        &mut self,
        dir: u32,
        mut visit: impl FnMut(&DirRecord) -> FsResult<bool>,
    ) -> FsResult<()> {
        let mut cursor = DirCursor::first(&self.geo, dir);
        let mut lfn = LongNameBuilder::new();
        loop {
            let raw = cursor.entry(self)?;
            match raw[0] {
                ENTRY_END => return Ok(()),
                ENTRY_DELETED => lfn.reset(),
                _ if is_lfn(&raw) => lfn.push(&raw),
                _ => {
                    let mut short = [0u8; SHORT_NAME_LEN];
                    short.copy_from_slice(&raw[..SHORT_NAME_LEN]);
                    let long_name = lfn.take(&short);
                    let record = DirRecord {
                        raw,
                        location: cursor.location(),
                        long_name,
                    };
                    if visit(&record)? {
                        return Ok(());
                    }
                }
            }
            if cursor.advance(self)? == Step::ChainEnd {
                return Ok(());
            }
        }
    }

    fn find_result(&self, record: &DirRecord, parent: u32) -> FindResult {
        let is_dir = record.is_dir();
        let mut cluster = record.cluster(self.geo.fat_type);
        if is_dir && cluster == 0 {
            cluster = self.root_cluster();
        }
        FindResult {
            cluster,
            size: record.size(),
            location: Some(record.location),
            name: record.name(),
            is_dir,
            attributes: record.attributes(),
            parent,
        }
    }

    /// Looks `component` up in directory `dir`. Long names take precedence:
    /// an entry that has one is matched on it alone.
    pub fn directory_search(&mut self, dir: u32, component: &str) -> FsResult<Option<FindResult>> {
        let mut found = None;
        self.walk_dir(dir, |record| {
            if record.is_dot() || record.is_volume_label() {
                return Ok(false);
            }
            if wildcard_match(component, record.name().as_str()) {
                found = Some((record.raw, record.location, record.long_name));
                return Ok(true);
            }
            Ok(false)
        })?;
        Ok(found.map(|(raw, location, long_name)| {
            let record = DirRecord {
                raw,
                location,
                long_name,
            };
            self.find_result(&record, dir)
        }))
    }

    /// Walks `path` from the root.
    pub fn resolve<'a>(&mut self, path: &'a str) -> FsResult<Lookup<'a>> {
        let mut current = self.root();
        let mut components = path.split('/').filter(|c| !c.is_empty()).peekable();
        while let Some(component) = components.next() {
            let last = components.peek().is_none();
            if !current.is_dir {
                return Err(FsError::NotDir);
            }
            if component == "." {
                continue;
            }
            if component == ".." && current.is_root() {
                current = self.root();
                continue;
            }
            match self.directory_search(current.cluster, component)? {
                Some(entry) if entry.is_dir && entry.cluster == self.root_cluster() => {
                    current = self.root();
                }
                Some(entry) => current = entry,
                None if last => {
                    return Ok(Lookup::Missing {
                        parent: current.cluster,
                        name: component,
                    })
                }
                None => return Err(FsError::NotFound),
            }
        }
        Ok(Lookup::Found(current))
    }

    /// Adds a short entry for `name` to directory `dir`, reusing the first
    /// free slot or growing the directory. The entry starts out empty.
    pub fn append(&mut self, dir: u32, name: &str) -> FsResult<FindResult> {
        let short = encode_short_name(name)?;
        let mut cursor = DirCursor::first(&self.geo, dir);
        let mut slot = None;
        loop {
            let raw = cursor.entry(self)?;
            match raw[0] {
                ENTRY_END => {
                    slot.get_or_insert(cursor.location());
                    break;
                }
                ENTRY_DELETED => {
                    slot.get_or_insert(cursor.location());
                }
                _ if !is_lfn(&raw) && raw[..SHORT_NAME_LEN] == short => {
                    return Err(FsError::AlreadyExists);
                }
                _ => {}
            }
            if cursor.advance(self)? == Step::ChainEnd {
                break;
            }
        }
        let location = match slot {
            Some(location) => location,
            None => {
                cursor.extend(self)?;
                cursor.location()
            }
        };
        let mut raw = [0u8; DIR_ENTRY_SIZE];
        raw[..SHORT_NAME_LEN].copy_from_slice(&short);
        raw[DIR_ATTR_OFFSET] = Attributes::ARCHIVE.bits();
        write_u16(&mut raw, DIR_CREATE_TIME_OFFSET, DEFAULT_TIME);
        write_u16(&mut raw, DIR_CREATE_DATE_OFFSET, DEFAULT_DATE);
        write_u16(&mut raw, DIR_ACCESS_DATE_OFFSET, DEFAULT_DATE);
        write_u16(&mut raw, DIR_WRITE_TIME_OFFSET, DEFAULT_TIME);
        write_u16(&mut raw, DIR_WRITE_DATE_OFFSET, DEFAULT_DATE);
        self.patch_entry(location, |entry| entry.copy_from_slice(&raw))?;
        let record = DirRecord {
            raw,
            location,
            long_name: None,
        };
        Ok(self.find_result(&record, dir))
    }

    fn patch_entry(
        &mut self,
        location: EntryLocation,
        patch: impl FnOnce(&mut [u8]),
    ) -> FsResult<()> {
        let buf = self.cache.read_mut(&self.dev, location.sector)?;
        let offset = location.offset as usize;
        patch(&mut buf[offset..offset + DIR_ENTRY_SIZE]);
        Ok(())
    }

    /// Rewrites the size field of an entry in the cache. The caller flushes.
    pub fn set_size(&mut self, location: EntryLocation, size: u32) -> FsResult<()> {
        self.patch_entry(location, |entry| write_u32(entry, DIR_SIZE_OFFSET, size))
    }

    /// Rewrites the first-cluster fields of an entry in the cache.
    pub fn set_cluster(&mut self, location: EntryLocation, cluster: u32) -> FsResult<()> {
        self.patch_entry(location, |entry| {
            write_u16(entry, DIR_CLUSTER_HI_OFFSET, (cluster >> 16) as u16);
            write_u16(entry, DIR_CLUSTER_LO_OFFSET, cluster as u16);
        })
    }

    /// Marks the entry at `location` deleted together with the long-name
    /// fragments that directly precede it.
    pub fn delete_entry(&mut self, dir: u32, location: EntryLocation) -> FsResult<()> {
        let buf = self.cache.read(&self.dev, location.sector)?;
        let offset = location.offset as usize;
        let mut short = [0u8; SHORT_NAME_LEN];
        short.copy_from_slice(&buf[offset..offset + SHORT_NAME_LEN]);
        let checksum = lfn_checksum(&short);
        self.patch_entry(location, |entry| entry[0] = ENTRY_DELETED)?;

        let mut cursor = DirCursor::first(&self.geo, dir);
        let mut run: Option<(DirCursor, u32)> = None;
        while cursor.location() != location {
            let raw = cursor.entry(self)?;
            run = match run {
                _ if raw[0] == ENTRY_END => None,
                _ if raw[0] == ENTRY_DELETED || !is_lfn(&raw) => None,
                _ if raw[LFN_CHECKSUM_OFFSET] != checksum => None,
                Some((start, count)) => Some((start, count + 1)),
                None => Some((cursor, 1)),
            };
            if cursor.advance(self)? == Step::ChainEnd {
                log::warn!("emfat: deleted entry not reached while sweeping its long name");
                return Ok(());
            }
        }
        if let Some((mut fragment, count)) = run {
            for _ in 0..count {
                self.patch_entry(fragment.location(), |entry| entry[0] = ENTRY_DELETED)?;
                fragment.advance(self)?;
            }
        }
        Ok(())
    }

    /// Lists directory `dir` starting at the `offset`-th visible entry.
    pub fn list_dir(
        &mut self,
        dir: u32,
        offset: usize,
        entries: &mut [DirEntry],
    ) -> FsResult<usize> {
        let mut index = 0usize;
        let mut filled = 0usize;
        self.walk_dir(dir, |record| {
            if record.is_dot() || record.is_dot_dot() || record.is_volume_label() {
                return Ok(false);
            }
            if filled == entries.len() {
                return Ok(true);
            }
            if index >= offset {
                let entry = &mut entries[filled];
                entry.file_type = if record.is_dir() { FileType::Dir } else { FileType::File };
                entry.size = record.size();
                entry.set_name(record.name().as_bytes())?;
                filled += 1;
            }
            index += 1;
            Ok(false)
        })?;
        Ok(filled)
    }
}

#[cfg(test)]
mod tests {
    use std::format;
    use std::string::String;
    use std::vec;

    use super::*;
    use crate::image::FormatOptions;
    use crate::testutil::{formatted, lfn_fragments, RamDisk};

    fn plant_root<D: BlockDevice>(fs: &mut FatFs<D>, slot: usize, raw: &[u8; DIR_ENTRY_SIZE]) {
        let per_sector = fs.geometry().bytes_per_sector as usize / DIR_ENTRY_SIZE;
        let location = EntryLocation {
            sector: fs.geometry().first_dir_sector + (slot / per_sector) as u32,
            offset: ((slot % per_sector) * DIR_ENTRY_SIZE) as u16,
        };
        fs.patch_entry(location, |entry| entry.copy_from_slice(raw)).unwrap();
    }

    fn short_raw(short: &[u8; 11], attr: u8, cluster: u32, size: u32) -> [u8; DIR_ENTRY_SIZE] {
        let mut raw = [0u8; DIR_ENTRY_SIZE];
        raw[..11].copy_from_slice(short);
        raw[DIR_ATTR_OFFSET] = attr;
        write_u16(&mut raw, DIR_CLUSTER_HI_OFFSET, (cluster >> 16) as u16);
        write_u16(&mut raw, DIR_CLUSTER_LO_OFFSET, cluster as u16);
        write_u32(&mut raw, DIR_SIZE_OFFSET, size);
        raw
    }

    /// Plants `long` as fragments followed by its short entry; returns the
    /// next free slot.
    fn plant_long<D: BlockDevice>(
        fs: &mut FatFs<D>,
        slot: usize,
        long: &str,
        short: &[u8; 11],
    ) -> usize {
        let fragments = lfn_fragments(long, short);
        for (idx, fragment) in fragments.iter().enumerate() {
            plant_root(fs, slot + idx, fragment);
        }
        plant_root(fs, slot + fragments.len(), &short_raw(short, 0x20, 0, 0));
        slot + fragments.len() + 1
    }

    fn fat16() -> RamDisk {
        formatted(&FormatOptions::fat16(8192))
    }

    #[test]
    fn cursor_stops_at_fixed_root_end() {
        let disk = fat16();
        let mut fs = FatFs::mount(&disk).unwrap();
        let root_entries = fs.geometry().root_dir_sectors as usize * 512 / DIR_ENTRY_SIZE;
        let mut cursor = DirCursor::first(fs.geometry(), 0);
        for _ in 1..root_entries {
            assert_eq!(cursor.advance(&mut fs).unwrap(), Step::Moved);
        }
        let last = cursor;
        assert_eq!(cursor.advance(&mut fs).unwrap(), Step::ChainEnd);
        assert_eq!(cursor, last);
        assert_eq!(cursor.extend(&mut fs), Err(FsError::NoSpace));
    }

    #[test]
    fn directory_grows_one_cluster_per_sixteen_entries() {
        let disk = formatted(&FormatOptions::fat32(4096));
        let mut fs = FatFs::mount(&disk).unwrap();
        let root = fs.root_cluster();
        for i in 0..16 {
            fs.append(root, &format!("file{}.txt", i)).unwrap();
        }
        assert_eq!(fs.chain_length(root).unwrap(), 1);
        let grown = fs.append(root, "file16.txt").unwrap();
        assert_eq!(fs.chain_length(root).unwrap(), 2);
        let location = grown.location.unwrap();
        assert_eq!(location.offset, 0);
        let second = fs.next_cluster(root).unwrap().unwrap();
        assert_eq!(location.sector, fs.geometry().cluster_to_sector(second));

        let mut cursor = DirCursor::first(fs.geometry(), root);
        let mut seen = 0;
        loop {
            let raw = cursor.entry(&mut fs).unwrap();
            if seen > 16 {
                assert_eq!(raw, [0u8; DIR_ENTRY_SIZE]);
            }
            seen += 1;
            if cursor.advance(&mut fs).unwrap() == Step::ChainEnd {
                break;
            }
        }
        assert_eq!(seen, 32);
    }

    #[test]
    fn advance_or_extend_grows_chain() {
        let disk = formatted(&FormatOptions::fat32(4096));
        let mut fs = FatFs::mount(&disk).unwrap();
        let root = fs.root_cluster();
        let mut cursor = DirCursor::first(fs.geometry(), 0);
        assert_eq!(cursor.cluster(), root);
        for _ in 0..15 {
            cursor.advance_or_extend(&mut fs).unwrap();
        }
        assert_eq!(cursor.cluster(), root);
        cursor.advance_or_extend(&mut fs).unwrap();
        assert_ne!(cursor.cluster(), root);
        assert_eq!(cursor.location().offset, 0);
        assert_eq!(cursor.entry(&mut fs).unwrap(), [0u8; DIR_ENTRY_SIZE]);
        assert_eq!(fs.chain_length(root).unwrap(), 2);
    }

    #[test]
    fn append_writes_plain_short_entry() {
        let disk = fat16();
        let mut fs = FatFs::mount(&disk).unwrap();
        let entry = fs.append(0, "notes.md").unwrap();
        assert_eq!(entry.name.as_str(), "NOTES.MD");
        assert_eq!((entry.cluster, entry.size), (0, 0));
        let location = entry.location.unwrap();
        assert_eq!(location.sector, fs.geometry().first_dir_sector);
        fs.sync().unwrap();
        let addr = fs.geometry().sector_addr(location.sector) as usize;
        let raw = disk.bytes(addr, DIR_ENTRY_SIZE);
        assert_eq!(&raw[..11], b"NOTES   MD ");
        assert_eq!(raw[DIR_ATTR_OFFSET], 0x20);
        assert_eq!(read_u16(&raw, DIR_WRITE_DATE_OFFSET), 0x0021);
        assert_eq!(read_u16(&raw, DIR_WRITE_TIME_OFFSET), 0);
        assert_eq!(read_u32(&raw, DIR_SIZE_OFFSET), 0);
        assert_eq!(fs.append(0, "NOTES.MD").err(), Some(FsError::AlreadyExists));
    }

    #[test]
    fn append_reuses_deleted_slot() {
        let disk = fat16();
        let mut fs = FatFs::mount(&disk).unwrap();
        let first = fs.append(0, "a.txt").unwrap();
        fs.append(0, "b.txt").unwrap();
        fs.delete_entry(0, first.location.unwrap()).unwrap();
        let reused = fs.append(0, "c.txt").unwrap();
        assert_eq!(reused.location, first.location);
    }

    #[test]
    fn search_prefers_long_names() {
        let disk = fat16();
        let mut fs = FatFs::mount(&disk).unwrap();
        let next = plant_long(&mut fs, 0, "Quarterly Report.xlsx", b"QUARTE~1XLS");
        plant_root(&mut fs, next, &short_raw(b"PLAIN   TXT", 0x20, 5, 10));

        let found = fs.directory_search(0, "quarterly report.XLSX").unwrap().unwrap();
        assert_eq!(found.name.as_str(), "Quarterly Report.xlsx");
        assert!(fs.directory_search(0, "QUARTE~1.XLS").unwrap().is_none());
        let wild = fs.directory_search(0, "*.txt").unwrap().unwrap();
        assert_eq!((wild.cluster, wild.size), (5, 10));
        assert_eq!(wild.location.unwrap().offset as usize, next * DIR_ENTRY_SIZE);
    }

    #[test]
    fn long_names_of_every_length_resolve() {
        let disk = fat16();
        let mut fs = FatFs::mount(&disk).unwrap();
        let max: String = (0..255).map(|i| (b'a' + (i % 26) as u8) as char).collect();
        let names = [String::from("q"), "m".repeat(13), "n".repeat(14), max];
        let shorts: [&[u8; 11]; 4] = [
            b"Q~1        ",
            b"MMMMMM~1   ",
            b"NNNNNN~1   ",
            b"ABCDEF~1   ",
        ];
        let mut slot = 0;
        for (long, short) in names.iter().zip(shorts) {
            slot = plant_long(&mut fs, slot, long, short);
        }
        for long in &names {
            let found = fs.directory_search(0, long).unwrap().unwrap();
            assert_eq!(found.name.as_str(), long.as_str());
        }
    }

    #[test]
    fn latin1_long_names_resolve() {
        let disk = fat16();
        let mut fs = FatFs::mount(&disk).unwrap();
        plant_long(&mut fs, 0, "caf\u{e9}.txt", b"CAF~1   TXT");
        let found = fs.directory_search(0, "caf\u{e9}.txt").unwrap().unwrap();
        assert_eq!(found.name.as_str(), "caf\u{e9}.txt");
        assert!(fs.directory_search(0, "caf?.TXT").unwrap().is_some());
        assert!(fs.directory_search(0, "cafe.txt").unwrap().is_none());
        let mut entries = vec![DirEntry::empty(); 2];
        assert_eq!(fs.list_dir(0, 0, &mut entries).unwrap(), 1);
        assert_eq!(entries[0].name(), "caf\u{e9}.txt".as_bytes());
    }

    #[test]
    fn label_and_dot_entries_are_skipped() {
        let disk = fat16();
        let mut fs = FatFs::mount(&disk).unwrap();
        plant_root(&mut fs, 0, &short_raw(b"MY VOLUME  ", 0x08, 0, 0));
        plant_root(&mut fs, 1, &short_raw(b"DATA       ", 0x20, 3, 1));
        assert!(fs.directory_search(0, "MY VOLUME").unwrap().is_none());
        let mut entries = vec![DirEntry::empty(); 4];
        assert_eq!(fs.list_dir(0, 0, &mut entries).unwrap(), 1);
        assert_eq!(entries[0].name(), b"DATA");
    }

    #[test]
    fn resolve_walks_subdirectories() {
        let disk = fat16();
        let mut fs = FatFs::mount(&disk).unwrap();
        let sub = fs.allocate(0).unwrap();
        fs.zero_cluster(sub).unwrap();
        plant_root(&mut fs, 0, &short_raw(b"SUB        ", 0x10, sub, 0));
        plant_root(&mut fs, 1, &short_raw(b"FILE    TXT", 0x20, 0, 0));
        fs.patch_entry(
            DirCursor::first(fs.geometry(), sub).location(),
            |entry| entry.copy_from_slice(&short_raw(DOT, 0x10, sub, 0)),
        )
        .unwrap();
        let mut dotdot = DirCursor::first(fs.geometry(), sub);
        dotdot.advance(&mut fs).unwrap();
        fs.patch_entry(dotdot.location(), |entry| {
            entry.copy_from_slice(&short_raw(DOT_DOT, 0x10, 0, 0))
        })
        .unwrap();
        fs.append(sub, "inner.bin").unwrap();

        match fs.resolve("/sub/inner.bin").unwrap() {
            Lookup::Found(entry) => assert_eq!(entry.parent, sub),
            other => panic!("unexpected {:?}", other),
        }
        match fs.resolve("sub/./../sub/..").unwrap() {
            Lookup::Found(entry) => assert!(entry.is_root()),
            other => panic!("unexpected {:?}", other),
        }
        match fs.resolve("/sub/new.txt").unwrap() {
            Lookup::Missing { parent, name } => assert_eq!((parent, name), (sub, "new.txt")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(fs.resolve("/nope/new.txt").err(), Some(FsError::NotFound));
        assert_eq!(fs.resolve("/file.txt/x").err(), Some(FsError::NotDir));
        assert!(matches!(fs.resolve("/").unwrap(), Lookup::Found(root) if root.is_root()));
    }

    #[test]
    fn delete_sweeps_matching_fragments_only() {
        let disk = fat16();
        let mut fs = FatFs::mount(&disk).unwrap();
        let stray = lfn_fragments("stray", b"OTHER   TXT");
        plant_root(&mut fs, 0, &stray[0]);
        let next = plant_long(&mut fs, 1, "a long file name.txt", b"ALONGF~1TXT");
        let target = fs.directory_search(0, "a long file name.txt").unwrap().unwrap();
        fs.delete_entry(0, target.location.unwrap()).unwrap();

        let mut cursor = DirCursor::first(fs.geometry(), 0);
        let mut leads = vec![];
        for _ in 0..next {
            leads.push(cursor.entry(&mut fs).unwrap()[0]);
            cursor.advance(&mut fs).unwrap();
        }
        assert_eq!(leads[0], stray[0][0]);
        assert!(leads[1..].iter().all(|&lead| lead == ENTRY_DELETED));
        assert!(fs.directory_search(0, "*").unwrap().is_none());
    }
}
