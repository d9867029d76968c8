#![no_std]

// VFS-facing surface shared by filesystem engines: errors, open flags and
// the handle-based file operations a VFS layer dispatches to.

use core::fmt;

use bitflags::bitflags;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FsError {
    NotFound,
    NotDir,
    IsDir,
    AlreadyExists,
    Invalid,
    NoSpace,
    NotSupported,
    Io,
    Permission,
}

impl FsError {
    /// POSIX errno equivalent, for VFS layers that speak errno.
    pub const fn errno(self) -> i32 {
        match self {
            FsError::NotFound => 2,
            FsError::Io => 5,
            FsError::Permission => 13,
            FsError::AlreadyExists => 17,
            FsError::NotDir => 20,
            FsError::IsDir => 21,
            FsError::Invalid => 22,
            FsError::NoSpace => 28,
            FsError::NotSupported => 95,
        }
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            FsError::NotFound => "no such file or directory",
            FsError::NotDir => "not a directory",
            FsError::IsDir => "is a directory",
            FsError::AlreadyExists => "file exists",
            FsError::Invalid => "invalid argument",
            FsError::NoSpace => "no space left on device",
            FsError::NotSupported => "operation not supported",
            FsError::Io => "i/o error",
            FsError::Permission => "permission denied",
        };
        f.write_str(msg)
    }
}

pub type FsResult<T> = core::result::Result<T, FsError>;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const CREATE = 1 << 2;
        const TRUNCATE = 1 << 3;
        const APPEND = 1 << 4;
    }
}

impl OpenFlags {
    pub const READ_WRITE: Self = Self::READ.union(Self::WRITE);

    pub fn readable(self) -> bool {
        self.contains(Self::READ)
    }

    pub fn writable(self) -> bool {
        self.contains(Self::WRITE)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    File,
    Dir,
}

/// Longest name, in characters.
pub const MAX_NAME_LEN: usize = 255;
/// UTF-8 bytes needed for `MAX_NAME_LEN` Latin-1 characters.
pub const MAX_NAME_BYTES: usize = MAX_NAME_LEN * 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub file_type: FileType,
    pub size: u32,
    pub name_len: u16,
    pub name: [u8; MAX_NAME_BYTES],
}

impl DirEntry {
    pub const fn empty() -> Self {
        Self {
            file_type: FileType::File,
            size: 0,
            name_len: 0,
            name: [0; MAX_NAME_BYTES],
        }
    }

    pub fn set_name(&mut self, name: &[u8]) -> FsResult<()> {
        if name.len() > MAX_NAME_BYTES {
            return Err(FsError::Invalid);
        }
        let len = name.len();
        self.name[..len].copy_from_slice(name);
        self.name_len = len as u16;
        Ok(())
    }

    pub fn name(&self) -> &[u8] {
        &self.name[..self.name_len as usize]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Metadata {
    pub file_type: FileType,
    pub size: u64,
    pub mode: u16,
}

impl Metadata {
    pub const fn new(file_type: FileType, size: u64, mode: u16) -> Self {
        Self { file_type, size, mode }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeekWhence {
    Set,
    Cur,
    End,
}

/// Handle-based operations a mounted filesystem offers to a VFS.
///
/// The filesystem value is threaded through every call; handles carry no
/// reference back to it, so several may be open at once.
pub trait FileSystem {
    type Handle;

    fn open(&mut self, path: &str, flags: OpenFlags) -> FsResult<Self::Handle>;
    fn read(&mut self, handle: &mut Self::Handle, buf: &mut [u8]) -> FsResult<usize>;
    fn write(&mut self, handle: &mut Self::Handle, buf: &[u8]) -> FsResult<usize>;
    fn seek(&mut self, handle: &mut Self::Handle, offset: i64, whence: SeekWhence) -> FsResult<u64>;
    fn close(&mut self, handle: Self::Handle) -> FsResult<()>;
    fn unlink(&mut self, path: &str) -> FsResult<()>;
    fn metadata(&mut self, path: &str) -> FsResult<Metadata>;
    fn read_dir(&mut self, path: &str, offset: usize, entries: &mut [DirEntry]) -> FsResult<usize>;
}
