//! Directory entry names: 8.3 short names, long-name fragment assembly and
//! wildcard matching.

use core::fmt;

use emvfs::{FsError, FsResult, MAX_NAME_BYTES};

pub const SHORT_NAME_LEN: usize = 11;
pub const MAX_LFN_FRAGMENTS: usize = 20;
pub const LFN_CHARS_PER_FRAGMENT: usize = 13;

pub(crate) const LFN_ORDINAL_MASK: u8 = 0x3f;
pub(crate) const LFN_LAST_FRAGMENT: u8 = 0x40;
pub(crate) const LFN_CHECKSUM_OFFSET: usize = 13;
pub(crate) const LFN_UNIT_OFFSETS: [usize; LFN_CHARS_PER_FRAGMENT] =
    [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];

const NT_LOWER_BASE: u8 = 0x08;
const NT_LOWER_EXT: u8 = 0x10;
const NT_CASE_OFFSET: usize = 12;
const KANJI_LEAD_ESCAPE: u8 = 0x05;
const DELETED_LEAD: u8 = 0xe5;

/// A reconstructed entry name, held as UTF-8. On-disk bytes and long-name
/// units are Latin-1, so every character takes at most two bytes.
#[derive(Clone, Copy)]
pub struct Name {
    buf: [u8; MAX_NAME_BYTES],
    len: usize,
}

impl Name {
    pub const fn empty() -> Self {
        Self {
            buf: [0; MAX_NAME_BYTES],
            len: 0,
        }
    }

    fn push(&mut self, ch: u8) -> bool {
        let ch = if ch == 0 { '?' } else { ch as char };
        if self.len + ch.len_utf8() > MAX_NAME_BYTES {
            return false;
        }
        self.len += ch.encode_utf8(&mut self.buf[self.len..]).len();
        true
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn as_str(&self) -> &str {
        core::str::from_utf8(self.as_bytes()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl PartialEq for Name {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for Name {}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn lfn_checksum(short: &[u8; SHORT_NAME_LEN]) -> u8 {
    short
        .iter()
        .fold(0u8, |sum, &ch| (sum >> 1).wrapping_add(sum << 7).wrapping_add(ch))
}

fn is_short_name_char(ch: u8) -> bool {
    ch.is_ascii_graphic() && !b"\"*+,/:;<=>?[\\]|".contains(&ch)
}

/// Builds the on-disk 8.3 form of `name`: uppercased, spaces and dots
/// dropped, unusable characters replaced by `_`, base and extension
/// truncated to 8 and 3 characters.
pub fn encode_short_name(name: &str) -> FsResult<[u8; SHORT_NAME_LEN]> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(FsError::Invalid);
    }
    let (base, ext) = match name.rfind('.') {
        Some(dot) if dot > 0 => (&name[..dot], &name[dot + 1..]),
        _ => (name, ""),
    };
    let mut short = [b' '; SHORT_NAME_LEN];
    let fill = |dst: &mut [u8], src: &str| {
        let mut len = 0;
        for ch in src.chars().filter(|&ch| ch != ' ' && ch != '.') {
            if len == dst.len() {
                break;
            }
            dst[len] = match u8::try_from(ch) {
                Ok(ch) if is_short_name_char(ch) => ch.to_ascii_uppercase(),
                _ => b'_',
            };
            len += 1;
        }
        len
    };
    if fill(&mut short[..8], base) == 0 {
        return Err(FsError::Invalid);
    }
    fill(&mut short[8..], ext);
    Ok(short)
}

/// Readable form of the short name stored in a 32-byte entry, honoring the
/// lowercase flags some writers keep in byte 12.
pub fn short_name_display(entry: &[u8]) -> Name {
    let case = entry[NT_CASE_OFFSET];
    let mut name = Name::empty();
    let trimmed = |part: &[u8]| part.iter().rposition(|&ch| ch != b' ').map_or(0, |idx| idx + 1);
    let base = &entry[..8];
    let ext = &entry[8..SHORT_NAME_LEN];
    for (idx, &ch) in base[..trimmed(base)].iter().enumerate() {
        let ch = if idx == 0 && ch == KANJI_LEAD_ESCAPE { DELETED_LEAD } else { ch };
        name.push(if case & NT_LOWER_BASE != 0 { ch.to_ascii_lowercase() } else { ch });
    }
    let ext_len = trimmed(ext);
    if ext_len > 0 {
        name.push(b'.');
        for &ch in &ext[..ext_len] {
            name.push(if case & NT_LOWER_EXT != 0 { ch.to_ascii_lowercase() } else { ch });
        }
    }
    name
}

fn char_at(text: &str, at: usize) -> Option<char> {
    text[at..].chars().next()
}

/// Match with `*` (any run) and `?` (any one character). ASCII letters
/// compare case-insensitively.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    let (mut p, mut n) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;
    while let Some(ch) = char_at(name, n) {
        match char_at(pattern, p) {
            Some('*') => {
                backtrack = Some((p, n));
                p += 1;
            }
            Some(pc) if pc == '?' || pc.eq_ignore_ascii_case(&ch) => {
                p += pc.len_utf8();
                n += ch.len_utf8();
            }
            _ => {
                let Some((star, matched)) = backtrack else {
                    return false;
                };
                let skipped = matched + char_at(name, matched).map_or(1, char::len_utf8);
                p = star + 1;
                n = skipped;
                backtrack = Some((star, skipped));
            }
        }
    }
    pattern[p..].chars().all(|ch| ch == '*')
}

pub fn has_wildcards(name: &str) -> bool {
    name.bytes().any(|ch| ch == b'*' || ch == b'?')
}

/// Collects long-name fragments that precede a short entry.
///
/// Fragments are stored last-first; each carries its ordinal and the
/// checksum of the short name it belongs to. Any break in the sequence drops
/// what was gathered so far.
pub struct LongNameBuilder {
    units: [u8; MAX_LFN_FRAGMENTS * LFN_CHARS_PER_FRAGMENT],
    expected: u8,
    checksum: u8,
    active: bool,
}

impl LongNameBuilder {
    pub const fn new() -> Self {
        Self {
            units: [0; MAX_LFN_FRAGMENTS * LFN_CHARS_PER_FRAGMENT],
            expected: 0,
            checksum: 0,
            active: false,
        }
    }

    pub fn reset(&mut self) {
        self.expected = 0;
        self.active = false;
    }

    pub fn push(&mut self, entry: &[u8]) {
        let ordinal = entry[0] & LFN_ORDINAL_MASK;
        let checksum = entry[LFN_CHECKSUM_OFFSET];
        if entry[0] & LFN_LAST_FRAGMENT != 0 {
            self.units.fill(0);
            self.active = true;
            self.expected = ordinal;
            self.checksum = checksum;
        }
        if !self.active
            || ordinal == 0
            || ordinal as usize > MAX_LFN_FRAGMENTS
            || ordinal != self.expected
            || checksum != self.checksum
        {
            self.reset();
            return;
        }
        let base = (ordinal as usize - 1) * LFN_CHARS_PER_FRAGMENT;
        for (idx, &offset) in LFN_UNIT_OFFSETS.iter().enumerate() {
            let unit = u16::from_le_bytes([entry[offset], entry[offset + 1]]);
            self.units[base + idx] = match unit {
                0x0000 | 0xffff => 0,
                unit if unit <= 0xff => unit as u8,
                _ => b'?',
            };
        }
        self.expected -= 1;
    }

    /// Hands out the assembled name if it is complete and belongs to `short`.
    pub fn take(&mut self, short: &[u8; SHORT_NAME_LEN]) -> Option<Name> {
        let complete = self.active && self.expected == 0 && self.checksum == lfn_checksum(short);
        self.reset();
        if !complete {
            return None;
        }
        let mut name = Name::empty();
        for &ch in self.units.iter().take_while(|&&ch| ch != 0) {
            if !name.push(ch) {
                break;
            }
        }
        if name.is_empty() {
            None
        } else {
            Some(name)
        }
    }
}

impl Default for LongNameBuilder {
    fn default() -> Self {
        Self::new()
    }
}
