//! Lays out blank FAT16/FAT32 volumes behind a one-entry partition table.

use emvfs::{FsError, FsResult};

use crate::block::MAX_SECTOR_SIZE;
use crate::boot::*;
use crate::fat::FatEntry;
use crate::fsinfo::{
    FSINFO_FREE_COUNT_OFFSET, FSINFO_LEAD_OFFSET, FSINFO_LEAD_SIGNATURE, FSINFO_NEXT_FREE_OFFSET,
    FSINFO_STRUCT_OFFSET, FSINFO_STRUCT_SIGNATURE, FSINFO_TRAIL_OFFSET, FSINFO_TRAIL_SIGNATURE,
};

const MEDIA_FIXED_DISK: u8 = 0xf8;
const OEM_NAME: &[u8; 8] = b"EMFAT   ";
const VOLUME_LABEL: &[u8; 11] = b"NO NAME    ";
const VOLUME_ID: u32 = 0x1980_0101;
const EXTENDED_BOOT_SIGNATURE: u8 = 0x29;
const DRIVE_NUMBER: u8 = 0x80;
const FAT32_FSINFO_SECTOR: u16 = 1;
const FAT32_BACKUP_BOOT_SECTOR: u16 = 6;
const FAT32_ROOT_CLUSTER: u32 = 2;
const FAT16_MAX_CLUSTERS: u32 = 65524;
const FAT32_MAX_CLUSTERS: u32 = 0x0fff_fff5;

/// Layout of a volume to create.
#[derive(Clone, Copy, Debug)]
pub struct FormatOptions {
    pub fat_type: FatType,
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub num_fats: u8,
    /// Fixed root directory capacity, FAT16 only.
    pub root_entries: u16,
    /// Partition start in 512-byte MBR sectors.
    pub partition_start: u32,
    /// Partition length in `bytes_per_sector` units.
    pub total_sectors: u32,
}

impl FormatOptions {
    pub const fn fat16(total_sectors: u32) -> Self {
        Self {
            fat_type: FatType::Fat16,
            bytes_per_sector: 512,
            sectors_per_cluster: 4,
            reserved_sectors: 1,
            num_fats: 2,
            root_entries: 512,
            partition_start: 8,
            total_sectors,
        }
    }

    pub const fn fat32(total_sectors: u32) -> Self {
        Self {
            fat_type: FatType::Fat32,
            bytes_per_sector: 512,
            sectors_per_cluster: 1,
            reserved_sectors: 32,
            num_fats: 2,
            root_entries: 0,
            partition_start: 8,
            total_sectors,
        }
    }

    pub fn sectors_per_cluster(mut self, sectors: u8) -> Self {
        self.sectors_per_cluster = sectors;
        self
    }

    pub fn bytes_per_sector(mut self, bytes: u16) -> Self {
        self.bytes_per_sector = bytes;
        self
    }

    fn partition_offset(&self) -> usize {
        self.partition_start as usize * MBR_SECTOR_SIZE
    }

    /// Bytes a device needs to hold the partition table and the volume.
    pub fn image_size(&self) -> usize {
        self.partition_offset() + self.total_sectors as usize * self.bytes_per_sector as usize
    }

    fn root_dir_sectors(&self) -> u32 {
        match self.fat_type {
            FatType::Fat32 => 0,
            _ => {
                let bps = self.bytes_per_sector as u32;
                (self.root_entries as u32 * 32 + bps - 1) / bps
            }
        }
    }

    /// Smallest FAT that covers every cluster left after it is placed.
    fn fat_layout(&self) -> FsResult<(u32, u32)> {
        let bps = self.bytes_per_sector as u64;
        let spc = self.sectors_per_cluster as u32;
        let entry_size = self.fat_type.entry_size() as u64;
        let mut fat_sectors = 1u32;
        loop {
            let data_start = self.reserved_sectors as u32
                + self.num_fats as u32 * fat_sectors
                + self.root_dir_sectors();
            if data_start >= self.total_sectors {
                return Err(FsError::Invalid);
            }
            let clusters = (self.total_sectors - data_start) / spc;
            let needed = ((clusters as u64 + 2) * entry_size + bps - 1) / bps;
            if needed <= fat_sectors as u64 {
                return Ok((fat_sectors, clusters));
            }
            fat_sectors = needed as u32;
        }
    }

    fn validate(&self) -> FsResult<()> {
        let bps = self.bytes_per_sector as usize;
        if bps < MBR_SECTOR_SIZE || bps > MAX_SECTOR_SIZE || !bps.is_power_of_two() {
            return Err(FsError::Invalid);
        }
        if self.sectors_per_cluster == 0 || !self.sectors_per_cluster.is_power_of_two() {
            return Err(FsError::Invalid);
        }
        if self.num_fats == 0 || self.reserved_sectors == 0 || self.partition_start == 0 {
            return Err(FsError::Invalid);
        }
        match self.fat_type {
            FatType::Fat12 => Err(FsError::NotSupported),
            FatType::Fat16 if self.root_entries == 0 => Err(FsError::Invalid),
            FatType::Fat32 if self.reserved_sectors <= FAT32_FSINFO_SECTOR => Err(FsError::Invalid),
            _ => Ok(()),
        }
    }
}

fn write_boot_sector(sector: &mut [u8], opts: &FormatOptions, fat_sectors: u32) {
    let fat32 = opts.fat_type == FatType::Fat32;
    let jump: [u8; 3] = if fat32 { [0xeb, 0x58, 0x90] } else { [0xeb, 0x3c, 0x90] };
    sector[..3].copy_from_slice(&jump);
    sector[3..11].copy_from_slice(OEM_NAME);
    write_u16(sector, BPB_BYTES_PER_SECTOR_OFFSET, opts.bytes_per_sector);
    sector[BPB_SECTORS_PER_CLUSTER_OFFSET] = opts.sectors_per_cluster;
    write_u16(sector, BPB_RESERVED_SECTORS_OFFSET, opts.reserved_sectors);
    sector[BPB_NUM_FATS_OFFSET] = opts.num_fats;
    sector[BPB_MEDIA_OFFSET] = MEDIA_FIXED_DISK;
    write_u16(sector, BPB_SECTORS_PER_TRACK_OFFSET, 63);
    write_u16(sector, BPB_HEADS_OFFSET, 255);
    write_u32(sector, BPB_HIDDEN_SECTORS_OFFSET, opts.partition_start);
    if !fat32 && opts.total_sectors <= u16::MAX as u32 {
        write_u16(sector, BPB_TOTAL_SECTORS_16_OFFSET, opts.total_sectors as u16);
    } else {
        write_u32(sector, BPB_TOTAL_SECTORS_32_OFFSET, opts.total_sectors);
    }
    // drive number, boot signature, id, label and type follow the BPB proper
    let ext = if fat32 {
        write_u32(sector, BPB_FAT_SIZE_32_OFFSET, fat_sectors);
        write_u32(sector, BPB_ROOT_CLUSTER_OFFSET, FAT32_ROOT_CLUSTER);
        write_u16(sector, BPB_FSINFO_SECTOR_OFFSET, FAT32_FSINFO_SECTOR);
        if opts.reserved_sectors > FAT32_BACKUP_BOOT_SECTOR + 1 {
            write_u16(sector, BPB_BACKUP_BOOT_OFFSET, FAT32_BACKUP_BOOT_SECTOR);
        }
        64
    } else {
        write_u16(sector, BPB_ROOT_ENTRIES_OFFSET, opts.root_entries);
        write_u16(sector, BPB_FAT_SIZE_16_OFFSET, fat_sectors as u16);
        36
    };
    sector[ext] = DRIVE_NUMBER;
    sector[ext + 2] = EXTENDED_BOOT_SIGNATURE;
    write_u32(sector, ext + 3, VOLUME_ID);
    sector[ext + 7..ext + 18].copy_from_slice(VOLUME_LABEL);
    sector[ext + 18..ext + 26].copy_from_slice(if fat32 { b"FAT32   " } else { b"FAT16   " });
    write_u16(sector, BOOT_SIGNATURE_OFFSET, BOOT_SIGNATURE);
}

fn write_fsinfo_sector(sector: &mut [u8], free: u32) {
    write_u32(sector, FSINFO_LEAD_OFFSET, FSINFO_LEAD_SIGNATURE);
    write_u32(sector, FSINFO_STRUCT_OFFSET, FSINFO_STRUCT_SIGNATURE);
    write_u32(sector, FSINFO_FREE_COUNT_OFFSET, free);
    write_u32(sector, FSINFO_NEXT_FREE_OFFSET, FAT32_ROOT_CLUSTER);
    write_u32(sector, FSINFO_TRAIL_OFFSET, FSINFO_TRAIL_SIGNATURE);
}

/// Writes an MBR and a blank volume described by `opts` into `buf`.
/// Returns the number of bytes the image occupies.
pub fn format_volume(buf: &mut [u8], opts: &FormatOptions) -> FsResult<usize> {
    opts.validate()?;
    let size = opts.image_size();
    if buf.len() < size {
        return Err(FsError::Invalid);
    }
    let (fat_sectors, clusters) = opts.fat_layout()?;
    let max_clusters = match opts.fat_type {
        FatType::Fat32 => FAT32_MAX_CLUSTERS,
        _ => FAT16_MAX_CLUSTERS,
    };
    if clusters == 0 || clusters > max_clusters {
        return Err(FsError::Invalid);
    }

    let bps = opts.bytes_per_sector as usize;
    let part = opts.partition_offset();
    let data_start = opts.reserved_sectors as usize
        + opts.num_fats as usize * fat_sectors as usize
        + opts.root_dir_sectors() as usize;
    // metadata plus the first cluster, which is the FAT32 root
    let cleared = part + (data_start + opts.sectors_per_cluster as usize) * bps;
    buf[..cleared.min(size)].fill(0);

    let record = PartitionRecord {
        active: 0,
        chs_start: [0, 0, 0],
        part_type: match opts.fat_type {
            FatType::Fat32 => PART_TYPE_FAT32_LBA,
            _ => PART_TYPE_FAT16,
        },
        chs_end: [0xfe, 0xff, 0xff],
        lba_start: opts.partition_start,
        sector_count: (opts.total_sectors as u64 * bps as u64 / MBR_SECTOR_SIZE as u64) as u32,
    };
    record.encode(&mut buf[PARTITION_TABLE_OFFSET..PARTITION_TABLE_OFFSET + PARTITION_RECORD_SIZE]);
    write_u16(buf, BOOT_SIGNATURE_OFFSET, BOOT_SIGNATURE);

    let volume = &mut buf[part..size];
    write_boot_sector(&mut volume[..bps], opts, fat_sectors);
    if opts.fat_type == FatType::Fat32 {
        let fsinfo = FAT32_FSINFO_SECTOR as usize * bps;
        write_fsinfo_sector(&mut volume[fsinfo..fsinfo + bps], clusters - 1);
        if opts.reserved_sectors > FAT32_BACKUP_BOOT_SECTOR + 1 {
            let backup = FAT32_BACKUP_BOOT_SECTOR as usize * bps;
            volume.copy_within(0..2 * bps, backup);
        }
    }

    for copy in 0..opts.num_fats as usize {
        let fat = (opts.reserved_sectors as usize + copy * fat_sectors as usize) * bps;
        match opts.fat_type {
            FatType::Fat32 => {
                write_u32(volume, fat, 0x0fff_ff00 | MEDIA_FIXED_DISK as u32);
                write_u32(volume, fat + 4, FatEntry::EndOfChain.encode(FatType::Fat32));
                write_u32(volume, fat + 8, FatEntry::EndOfChain.encode(FatType::Fat32));
            }
            _ => {
                write_u16(volume, fat, 0xff00 | MEDIA_FIXED_DISK as u16);
                write_u16(volume, fat + 2, FatEntry::EndOfChain.encode(FatType::Fat16) as u16);
            }
        }
    }
    log::debug!(
        "emfat: formatted {:?} volume, {} clusters, {} sectors per FAT",
        opts.fat_type,
        clusters,
        fat_sectors
    );
    Ok(size)
}
