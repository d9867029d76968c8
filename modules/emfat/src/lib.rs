//! FAT16/FAT32 engine for byte-addressed block devices.
//!
//! A [`FatFs`] is mounted from the first partition of a device and owns a
//! single-sector write-back cache for FAT, directory and FSInfo sectors. File
//! data moves between the device and caller buffers without passing through
//! the cache.

#![no_std]

pub mod block;
pub mod boot;
pub mod dir;
pub mod fat;
pub mod file;
pub mod fs;
pub mod fsinfo;
pub mod image;
pub mod name;

pub use block::{BlockDevice, SectorCache, MAX_SECTOR_SIZE};
pub use boot::{FatType, Geometry};
pub use dir::{Attributes, DirCursor, EntryLocation, FindResult, Lookup, Step};
pub use emvfs::{DirEntry, FileSystem, FileType, FsError, FsResult, Metadata, OpenFlags, SeekWhence};
pub use fat::{ChainExtent, FatEntry};
pub use file::FatFile;
pub use fs::FatFs;
pub use fsinfo::FsInfo;
pub use image::{format_volume, FormatOptions};
pub use name::Name;

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod testutil;
