use core::cell::{Cell, RefCell};
use std::vec;
use std::vec::Vec;

use crate::block::BlockDevice;
use crate::image::{format_volume, FormatOptions};
use crate::name::{
    lfn_checksum, LFN_CHARS_PER_FRAGMENT, LFN_CHECKSUM_OFFSET, LFN_LAST_FRAGMENT, LFN_UNIT_OFFSETS,
};

pub struct RamDisk {
    data: RefCell<Vec<u8>>,
}

impl RamDisk {
    pub fn new(size: usize) -> Self {
        Self {
            data: RefCell::new(vec![0u8; size]),
        }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data: RefCell::new(data),
        }
    }

    pub fn bytes(&self, offset: usize, len: usize) -> Vec<u8> {
        self.data.borrow()[offset..offset + len].to_vec()
    }

    pub fn poke(&self, offset: usize, bytes: &[u8]) {
        self.data.borrow_mut()[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data.into_inner()
    }
}

impl BlockDevice for RamDisk {
    fn read_at(&self, addr: u64, buf: &mut [u8]) -> usize {
        let data = self.data.borrow();
        let start = addr as usize;
        if start >= data.len() {
            return 0;
        }
        let count = core::cmp::min(buf.len(), data.len() - start);
        buf[..count].copy_from_slice(&data[start..start + count]);
        count
    }

    fn write_at(&self, addr: u64, buf: &[u8]) -> usize {
        let mut data = self.data.borrow_mut();
        let start = addr as usize;
        if start >= data.len() {
            return 0;
        }
        let count = core::cmp::min(buf.len(), data.len() - start);
        data[start..start + count].copy_from_slice(&buf[..count]);
        count
    }
}

/// Counts device calls so tests can observe cache hits.
pub struct CountingDisk {
    inner: RamDisk,
    reads: Cell<usize>,
    writes: Cell<usize>,
}

impl CountingDisk {
    pub fn new(inner: RamDisk) -> Self {
        Self {
            inner,
            reads: Cell::new(0),
            writes: Cell::new(0),
        }
    }

    pub fn reads(&self) -> usize {
        self.reads.get()
    }

    pub fn writes(&self) -> usize {
        self.writes.get()
    }
}

impl BlockDevice for CountingDisk {
    fn read_at(&self, addr: u64, buf: &mut [u8]) -> usize {
        self.reads.set(self.reads.get() + 1);
        self.inner.read_at(addr, buf)
    }

    fn write_at(&self, addr: u64, buf: &[u8]) -> usize {
        self.writes.set(self.writes.get() + 1);
        self.inner.write_at(addr, buf)
    }
}

/// Passes data reads through until `budget` bytes have been read at or above
/// `data_from`, then returns short counts.
pub struct FailingDisk {
    inner: RamDisk,
    data_from: u64,
    budget: Cell<usize>,
}

impl FailingDisk {
    pub fn new(inner: RamDisk, data_from: u64, budget: usize) -> Self {
        Self {
            inner,
            data_from,
            budget: Cell::new(budget),
        }
    }
}

impl BlockDevice for FailingDisk {
    fn read_at(&self, addr: u64, buf: &mut [u8]) -> usize {
        if addr < self.data_from {
            return self.inner.read_at(addr, buf);
        }
        let allowed = core::cmp::min(self.budget.get(), buf.len());
        self.budget.set(self.budget.get() - allowed);
        self.inner.read_at(addr, &mut buf[..allowed])
    }

    fn write_at(&self, addr: u64, buf: &[u8]) -> usize {
        self.inner.write_at(addr, buf)
    }
}

/// A pattern that does not repeat on sector or cluster boundaries.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
}

/// A blank volume laid out by `opts`, partition table included.
pub fn formatted(opts: &FormatOptions) -> RamDisk {
    let mut image = vec![0u8; opts.image_size()];
    format_volume(&mut image, opts).unwrap();
    RamDisk::from_vec(image)
}

/// Long-name fragments for `long` in on-disk order (last fragment first).
pub fn lfn_fragments(long: &str, short: &[u8; 11]) -> Vec<[u8; 32]> {
    let units: Vec<u16> = long.encode_utf16().collect();
    let count = (units.len() + LFN_CHARS_PER_FRAGMENT - 1) / LFN_CHARS_PER_FRAGMENT;
    let checksum = lfn_checksum(short);
    (1..=count)
        .rev()
        .map(|ordinal| {
            let mut entry = [0u8; 32];
            entry[0] = ordinal as u8 | if ordinal == count { LFN_LAST_FRAGMENT } else { 0 };
            entry[11] = 0x0f;
            entry[LFN_CHECKSUM_OFFSET] = checksum;
            let base = (ordinal - 1) * LFN_CHARS_PER_FRAGMENT;
            for (idx, &offset) in LFN_UNIT_OFFSETS.iter().enumerate() {
                let unit = match (base + idx).cmp(&units.len()) {
                    core::cmp::Ordering::Less => units[base + idx],
                    core::cmp::Ordering::Equal => 0x0000,
                    core::cmp::Ordering::Greater => 0xffff,
                };
                entry[offset..offset + 2].copy_from_slice(&unit.to_le_bytes());
            }
            entry
        })
        .collect()
}
