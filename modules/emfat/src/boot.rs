//! Master boot record and BIOS parameter block parsing, and the volume
//! geometry derived from them.

use emvfs::{FsError, FsResult};

use crate::block::MAX_SECTOR_SIZE;

pub const MBR_SECTOR_SIZE: usize = 512;
pub const PARTITION_TABLE_OFFSET: usize = 446;
pub const PARTITION_RECORD_SIZE: usize = 16;
pub const BOOT_SIGNATURE_OFFSET: usize = 510;
pub const BOOT_SIGNATURE: u16 = 0xaa55;

pub const PART_TYPE_FAT12: u8 = 0x01;
pub const PART_TYPE_FAT16: u8 = 0x06;
pub const PART_TYPE_FAT32_CHS: u8 = 0x0b;
pub const PART_TYPE_FAT32_LBA: u8 = 0x0c;

pub(crate) const BPB_BYTES_PER_SECTOR_OFFSET: usize = 11;
pub(crate) const BPB_SECTORS_PER_CLUSTER_OFFSET: usize = 13;
pub(crate) const BPB_RESERVED_SECTORS_OFFSET: usize = 14;
pub(crate) const BPB_NUM_FATS_OFFSET: usize = 16;
pub(crate) const BPB_ROOT_ENTRIES_OFFSET: usize = 17;
pub(crate) const BPB_TOTAL_SECTORS_16_OFFSET: usize = 19;
pub(crate) const BPB_MEDIA_OFFSET: usize = 21;
pub(crate) const BPB_FAT_SIZE_16_OFFSET: usize = 22;
pub(crate) const BPB_SECTORS_PER_TRACK_OFFSET: usize = 24;
pub(crate) const BPB_HEADS_OFFSET: usize = 26;
pub(crate) const BPB_HIDDEN_SECTORS_OFFSET: usize = 28;
pub(crate) const BPB_TOTAL_SECTORS_32_OFFSET: usize = 32;
pub(crate) const BPB_FAT_SIZE_32_OFFSET: usize = 36;
pub(crate) const BPB_EXT_FLAGS_OFFSET: usize = 40;
pub(crate) const BPB_FS_VERSION_OFFSET: usize = 42;
pub(crate) const BPB_ROOT_CLUSTER_OFFSET: usize = 44;
pub(crate) const BPB_FSINFO_SECTOR_OFFSET: usize = 48;
pub(crate) const BPB_BACKUP_BOOT_OFFSET: usize = 50;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FatType {
    /// Recognized so it can be refused; there is no 12-bit entry path.
    Fat12,
    Fat16,
    Fat32,
}

impl FatType {
    pub fn from_partition_type(code: u8) -> Option<Self> {
        match code {
            PART_TYPE_FAT12 => Some(FatType::Fat12),
            PART_TYPE_FAT16 => Some(FatType::Fat16),
            PART_TYPE_FAT32_CHS | PART_TYPE_FAT32_LBA => Some(FatType::Fat32),
            _ => None,
        }
    }

    /// Bytes per FAT entry.
    pub fn entry_size(self) -> usize {
        match self {
            FatType::Fat32 => 4,
            FatType::Fat16 | FatType::Fat12 => 2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartitionRecord {
    pub active: u8,
    pub chs_start: [u8; 3],
    pub part_type: u8,
    pub chs_end: [u8; 3],
    pub lba_start: u32,
    pub sector_count: u32,
}

impl PartitionRecord {
    pub fn parse(raw: &[u8]) -> Self {
        Self {
            active: raw[0],
            chs_start: [raw[1], raw[2], raw[3]],
            part_type: raw[4],
            chs_end: [raw[5], raw[6], raw[7]],
            lba_start: read_u32(raw, 8),
            sector_count: read_u32(raw, 12),
        }
    }

    pub fn encode(&self, raw: &mut [u8]) {
        raw[0] = self.active;
        raw[1..4].copy_from_slice(&self.chs_start);
        raw[4] = self.part_type;
        raw[5..8].copy_from_slice(&self.chs_end);
        write_u32(raw, 8, self.lba_start);
        write_u32(raw, 12, self.sector_count);
    }

    /// First partition record of an MBR sector.
    pub fn first_of(mbr: &[u8]) -> FsResult<Self> {
        if mbr.len() < MBR_SECTOR_SIZE || read_u16(mbr, BOOT_SIGNATURE_OFFSET) != BOOT_SIGNATURE {
            return Err(FsError::Invalid);
        }
        Ok(Self::parse(
            &mbr[PARTITION_TABLE_OFFSET..PARTITION_TABLE_OFFSET + PARTITION_RECORD_SIZE],
        ))
    }
}

#[derive(Clone, Copy, Debug)]
pub struct BiosParameterBlock {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub num_fats: u8,
    pub root_entries: u16,
    pub total_sectors: u32,
    pub media: u8,
    pub sectors_per_fat: u32,
    pub sectors_per_track: u16,
    pub heads: u16,
    pub hidden_sectors: u32,
    pub ext_flags: u16,
    pub fs_version: u16,
    pub root_cluster: u32,
    pub fsinfo_sector: u16,
    pub backup_boot_sector: u16,
}

impl BiosParameterBlock {
    pub fn parse(buf: &[u8]) -> FsResult<Self> {
        if buf.len() < MBR_SECTOR_SIZE {
            return Err(FsError::Invalid);
        }
        if read_u16(buf, BOOT_SIGNATURE_OFFSET) != BOOT_SIGNATURE {
            return Err(FsError::Invalid);
        }
        let total_sectors_16 = read_u16(buf, BPB_TOTAL_SECTORS_16_OFFSET);
        let fat_size_16 = read_u16(buf, BPB_FAT_SIZE_16_OFFSET);
        let total_sectors = if total_sectors_16 != 0 {
            total_sectors_16 as u32
        } else {
            read_u32(buf, BPB_TOTAL_SECTORS_32_OFFSET)
        };
        let fat32 = fat_size_16 == 0;
        let sectors_per_fat = if fat32 {
            read_u32(buf, BPB_FAT_SIZE_32_OFFSET)
        } else {
            fat_size_16 as u32
        };
        let (ext_flags, fs_version, root_cluster, fsinfo_sector, backup_boot_sector) = if fat32 {
            (
                read_u16(buf, BPB_EXT_FLAGS_OFFSET),
                read_u16(buf, BPB_FS_VERSION_OFFSET),
                read_u32(buf, BPB_ROOT_CLUSTER_OFFSET),
                read_u16(buf, BPB_FSINFO_SECTOR_OFFSET),
                read_u16(buf, BPB_BACKUP_BOOT_OFFSET),
            )
        } else {
            (0, 0, 0, 0, 0)
        };
        let bpb = Self {
            bytes_per_sector: read_u16(buf, BPB_BYTES_PER_SECTOR_OFFSET),
            sectors_per_cluster: buf[BPB_SECTORS_PER_CLUSTER_OFFSET],
            reserved_sectors: read_u16(buf, BPB_RESERVED_SECTORS_OFFSET),
            num_fats: buf[BPB_NUM_FATS_OFFSET],
            root_entries: read_u16(buf, BPB_ROOT_ENTRIES_OFFSET),
            total_sectors,
            media: buf[BPB_MEDIA_OFFSET],
            sectors_per_fat,
            sectors_per_track: read_u16(buf, BPB_SECTORS_PER_TRACK_OFFSET),
            heads: read_u16(buf, BPB_HEADS_OFFSET),
            hidden_sectors: read_u32(buf, BPB_HIDDEN_SECTORS_OFFSET),
            ext_flags,
            fs_version,
            root_cluster,
            fsinfo_sector,
            backup_boot_sector,
        };
        let bps = bpb.bytes_per_sector as usize;
        if bps < MBR_SECTOR_SIZE
            || bps > MAX_SECTOR_SIZE
            || !bps.is_power_of_two()
            || bpb.sectors_per_cluster == 0
            || bpb.reserved_sectors == 0
            || bpb.num_fats == 0
            || bpb.total_sectors == 0
            || bpb.sectors_per_fat == 0
        {
            return Err(FsError::Invalid);
        }
        Ok(bpb)
    }

    pub fn root_dir_sectors(&self) -> u32 {
        let bps = self.bytes_per_sector as u32;
        (self.root_entries as u32 * 32 + bps - 1) / bps
    }
}

/// Everything the engine needs to turn clusters into sectors. Sector numbers
/// are relative to the start of the partition.
#[derive(Clone, Copy, Debug)]
pub struct Geometry {
    pub fat_type: FatType,
    pub partition_offset: u64,
    pub bytes_per_sector: u32,
    pub sectors_per_cluster: u32,
    pub bytes_per_cluster: u32,
    pub num_fats: u8,
    pub sectors_per_fat: u32,
    pub first_fat_sector: u32,
    /// FAT16: first sector of the fixed root region. FAT32: first sector of
    /// the root cluster.
    pub first_dir_sector: u32,
    pub root_dir_sectors: u32,
    pub first_data_sector: u32,
    /// 0 on FAT16, where the root is not a cluster chain.
    pub root_cluster: u32,
    pub cluster_count: u32,
    pub fsinfo_sector: Option<u32>,
}

impl Geometry {
    pub fn derive(
        fat_type: FatType,
        partition_offset: u64,
        bpb: &BiosParameterBlock,
    ) -> FsResult<Self> {
        if fat_type == FatType::Fat12 {
            return Err(FsError::NotSupported);
        }
        let bytes_per_sector = bpb.bytes_per_sector as u32;
        let sectors_per_cluster = bpb.sectors_per_cluster as u32;
        let bytes_per_cluster = bytes_per_sector * sectors_per_cluster;
        if bytes_per_cluster == 0 {
            return Err(FsError::Invalid);
        }
        let first_fat_sector = bpb.reserved_sectors as u32;
        let root_dir_sectors = bpb.root_dir_sectors();
        let fixed_root = (bpb.num_fats as u32)
            .checked_mul(bpb.sectors_per_fat)
            .and_then(|fat_region| fat_region.checked_add(first_fat_sector))
            .ok_or(FsError::Invalid)?;
        let first_data_sector = fixed_root
            .checked_add(root_dir_sectors)
            .ok_or(FsError::Invalid)?;
        if bpb.total_sectors <= first_data_sector {
            return Err(FsError::Invalid);
        }
        let cluster_count = (bpb.total_sectors - first_data_sector) / sectors_per_cluster;
        if cluster_count == 0 {
            return Err(FsError::Invalid);
        }
        // The FAT must have an entry for every data cluster.
        let fat_entries = (bpb.sectors_per_fat as u64 * bytes_per_sector as u64)
            / fat_type.entry_size() as u64;
        if fat_entries < cluster_count as u64 + 2 {
            return Err(FsError::Invalid);
        }
        let (root_cluster, first_dir_sector, fsinfo_sector) = match fat_type {
            FatType::Fat32 => {
                if bpb.root_cluster < 2 || bpb.root_cluster > cluster_count + 1 {
                    return Err(FsError::Invalid);
                }
                let first_dir =
                    first_data_sector + (bpb.root_cluster - 2) * sectors_per_cluster;
                let fsinfo = match bpb.fsinfo_sector {
                    0 | 0xffff => None,
                    sector if (sector as u32) < first_fat_sector => Some(sector as u32),
                    _ => None,
                };
                (bpb.root_cluster, first_dir, fsinfo)
            }
            _ => {
                if root_dir_sectors == 0 {
                    return Err(FsError::Invalid);
                }
                (0, fixed_root, None)
            }
        };
        Ok(Self {
            fat_type,
            partition_offset,
            bytes_per_sector,
            sectors_per_cluster,
            bytes_per_cluster,
            num_fats: bpb.num_fats,
            sectors_per_fat: bpb.sectors_per_fat,
            first_fat_sector,
            first_dir_sector,
            root_dir_sectors,
            first_data_sector,
            root_cluster,
            cluster_count,
            fsinfo_sector,
        })
    }

    /// Highest valid cluster number.
    pub fn max_cluster(&self) -> u32 {
        self.cluster_count + 1
    }

    pub fn is_valid_cluster(&self, cluster: u32) -> bool {
        cluster >= 2 && cluster <= self.max_cluster()
    }

    /// First sector of `cluster`. Cluster 0 names the root directory: the
    /// fixed region on FAT16, the root cluster on FAT32.
    pub fn cluster_to_sector(&self, cluster: u32) -> u32 {
        if cluster == 0 {
            return self.first_dir_sector;
        }
        self.first_data_sector + (cluster - 2) * self.sectors_per_cluster
    }

    pub fn sector_addr(&self, sector: u32) -> u64 {
        self.partition_offset + sector as u64 * self.bytes_per_sector as u64
    }
}

pub(crate) fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

pub(crate) fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

pub(crate) fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}
