//! Header block encoding.
//!
//! Every archive entry starts with one 512-byte header.  The common fields
//! (offsets 0-156) are shared between both supported dialects:
//!
//! | Offset | Size | Field     |
//! |--------|------|-----------|
//! | 0      | 100  | name      |
//! | 100    | 8    | mode      |
//! | 108    | 8    | uid       |
//! | 116    | 8    | gid       |
//! | 124    | 12   | size      |
//! | 136    | 12   | mtime     |
//! | 148    | 8    | checksum  |
//! | 156    | 1    | typeflag  |
//! | 157    | 100  | linkname  |
//!
//! USTAR additionally fills `magic`, `version`, `uname`, `gname`,
//! `devmajor`, `devminor` and `prefix` (offsets 257-500).  A Unix V7 header
//! leaves that area zeroed.

use std::{fmt, str::FromStr};

use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::{
    error::{Error, Result},
    Block, BLOCK_SIZE,
};

const USTAR_MAGIC: &[u8; 6] = b"ustar\0";
const USTAR_VERSION: &[u8; 2] = b"00";

const NAME_LEN: usize = 100;
const PREFIX_LEN: usize = 155;
const CHECKSUM_RANGE: std::ops::Range<usize> = 148..156;

// ============================================================================
// Dialect and entry kinds
// ============================================================================

/// Header dialect, fixed for the lifetime of an archive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Format {
    /// The Seventh Edition Unix header: no directory, device or fifo type flags.
    #[default]
    UnixV7,
    /// POSIX.1-1988 ustar: owner names, device numbers and a name prefix.
    Ustar,
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Format::UnixV7 => "unix_v7",
            Format::Ustar => "ustar",
        })
    }
}

impl FromStr for Format {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unix_v7" | "v7" => Ok(Format::UnixV7),
            "ustar" => Ok(Format::Ustar),
            _ => Err(Error::UnknownSetting {
                setting: "format",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntryKind {
    Regular,
    Directory,
    Symlink,
    Hardlink,
    CharDevice,
    BlockDevice,
    Fifo,
}

impl EntryKind {
    /// The typeflag byte written for this kind under `format`.
    ///
    /// Returns `None` if the dialect cannot represent the kind at all.
    pub fn typeflag(self, format: Format) -> Option<u8> {
        match (self, format) {
            (EntryKind::Regular, _) => Some(b'0'),
            (EntryKind::Hardlink, _) => Some(b'1'),
            (EntryKind::Symlink, _) => Some(b'2'),
            (EntryKind::Directory, Format::UnixV7) => Some(b'0'),
            (EntryKind::Directory, Format::Ustar) => Some(b'5'),
            (EntryKind::CharDevice, Format::Ustar) => Some(b'3'),
            (EntryKind::BlockDevice, Format::Ustar) => Some(b'4'),
            (EntryKind::Fifo, Format::Ustar) => Some(b'6'),
            (EntryKind::CharDevice | EntryKind::BlockDevice | EntryKind::Fifo, Format::UnixV7) => {
                None
            }
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntryKind::Regular => "regular file",
            EntryKind::Directory => "directory",
            EntryKind::Symlink => "symbolic link",
            EntryKind::Hardlink => "hard link",
            EntryKind::CharDevice => "character device",
            EntryKind::BlockDevice => "block device",
            EntryKind::Fifo => "fifo",
        })
    }
}

// ============================================================================
// Entry metadata
// ============================================================================

/// Everything a header needs to know about one archive entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub kind: EntryKind,
    /// Name inside the archive, already normalized.
    pub name: String,
    /// Target of a symbolic or hard link; empty otherwise.
    pub link_target: String,
    /// Permission bits; anything above `0o7777` is ignored.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Owner names, only written by the USTAR dialect.
    pub user_name: String,
    pub group_name: String,
    /// Content size in bytes; zero for everything but regular files.
    pub size: u64,
    /// Seconds since the epoch.  Negative values are stored as zero.
    pub mtime: i64,
    pub dev_major: u32,
    pub dev_minor: u32,
}

impl Entry {
    pub fn new(kind: EntryKind, name: impl Into<String>) -> Self {
        Entry {
            kind,
            name: name.into(),
            link_target: String::new(),
            mode: 0,
            uid: 0,
            gid: 0,
            user_name: String::new(),
            group_name: String::new(),
            size: 0,
            mtime: 0,
            dev_major: 0,
            dev_minor: 0,
        }
    }

    pub fn file(name: impl Into<String>, mode: u32) -> Self {
        Entry::new(EntryKind::Regular, name).with_mode(mode)
    }

    pub fn directory(name: impl Into<String>, mode: u32) -> Self {
        Entry::new(EntryKind::Directory, name).with_mode(mode)
    }

    pub fn symlink(name: impl Into<String>, target: impl Into<String>) -> Self {
        let mut entry = Entry::new(EntryKind::Symlink, name).with_mode(0o777);
        entry.link_target = target.into();
        entry
    }

    pub fn hardlink(name: impl Into<String>, target: impl Into<String>) -> Self {
        let mut entry = Entry::new(EntryKind::Hardlink, name).with_mode(0o644);
        entry.link_target = target.into();
        entry
    }

    pub fn char_device(name: impl Into<String>, mode: u32, major: u32, minor: u32) -> Self {
        Entry::new(EntryKind::CharDevice, name)
            .with_mode(mode)
            .with_device(major, minor)
    }

    pub fn block_device(name: impl Into<String>, mode: u32, major: u32, minor: u32) -> Self {
        Entry::new(EntryKind::BlockDevice, name)
            .with_mode(mode)
            .with_device(major, minor)
    }

    pub fn fifo(name: impl Into<String>, mode: u32) -> Self {
        Entry::new(EntryKind::Fifo, name).with_mode(mode)
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    pub fn with_owner_names(mut self, user: impl Into<String>, group: impl Into<String>) -> Self {
        self.user_name = user.into();
        self.group_name = group.into();
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn with_mtime(mut self, mtime: i64) -> Self {
        self.mtime = mtime;
        self
    }

    pub fn with_device(mut self, major: u32, minor: u32) -> Self {
        self.dev_major = major;
        self.dev_minor = minor;
        self
    }
}

// ============================================================================
// Raw layout
// ============================================================================

/// Byte layout of a USTAR header.  A V7 header is the same struct with the
/// USTAR-only fields left zeroed.
#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct RawHeader {
    name: [u8; 100],
    mode: [u8; 8],
    uid: [u8; 8],
    gid: [u8; 8],
    size: [u8; 12],
    mtime: [u8; 12],
    checksum: [u8; 8],
    typeflag: u8,
    linkname: [u8; 100],
    magic: [u8; 6],
    version: [u8; 2],
    uname: [u8; 32],
    gname: [u8; 32],
    devmajor: [u8; 8],
    devminor: [u8; 8],
    prefix: [u8; 155],
    pad: [u8; 12],
}

/// Copy as much of `value` as fits into `field`; the rest of the field stays
/// NUL.
fn put_str(field: &mut [u8], value: &[u8]) {
    let len = value.len().min(field.len());
    field[..len].copy_from_slice(&value[..len]);
}

/// Write `value` as zero-padded octal filling all but the last byte of
/// `field`, which stays NUL.
fn put_octal(field: &mut [u8], name: &'static str, value: u64) -> Result<()> {
    let width = field.len() - 1;
    let digits = format!("{value:0width$o}");
    if digits.len() > width {
        return Err(Error::FieldOverflow {
            field: name,
            value,
            width,
        });
    }
    field[..width].copy_from_slice(digits.as_bytes());
    Ok(())
}

/// Find where a long name can be cut into `(prefix, name)` for USTAR.
///
/// The cut is the last `/` that leaves at most 155 bytes in front of it.  If
/// the remainder after that separator is empty or still longer than 100
/// bytes there is no usable split.
fn split_ustar_name(name: &[u8]) -> Option<(&[u8], &[u8])> {
    let window = &name[..name.len().min(PREFIX_LEN + 1)];
    let pos = window.iter().rposition(|&b| b == b'/')?;
    let (prefix, rest) = (&name[..pos], &name[pos + 1..]);
    if rest.is_empty() || rest.len() > NAME_LEN {
        return None;
    }
    Some((prefix, rest))
}

// ============================================================================
// Header block
// ============================================================================

/// A fully encoded header, checksum included.
#[derive(Clone, Copy)]
pub struct HeaderBlock {
    raw: RawHeader,
}

impl HeaderBlock {
    /// Encode `entry` for `format`.
    ///
    /// Fails if the dialect cannot represent the entry kind, or a numeric
    /// field does not fit its width.  Names that do not fit are truncated.
    pub fn encode(entry: &Entry, format: Format) -> Result<Self> {
        let typeflag = entry
            .kind
            .typeflag(format)
            .ok_or(Error::UnsupportedEntry {
                kind: entry.kind,
                format,
            })?;

        let mut raw = RawHeader::new_zeroed();

        let name = match (entry.kind, format) {
            (EntryKind::Directory, Format::UnixV7) if !entry.name.ends_with('/') => {
                format!("{}/", entry.name)
            }
            _ => entry.name.clone(),
        };
        let name = name.as_bytes();
        match format {
            Format::Ustar if name.len() > NAME_LEN => match split_ustar_name(name) {
                Some((prefix, rest)) => {
                    put_str(&mut raw.prefix, prefix);
                    put_str(&mut raw.name, rest);
                }
                None => put_str(&mut raw.name, name),
            },
            _ => put_str(&mut raw.name, name),
        }

        put_octal(&mut raw.mode, "mode", u64::from(entry.mode & 0o7777))?;
        put_octal(&mut raw.uid, "uid", u64::from(entry.uid))?;
        put_octal(&mut raw.gid, "gid", u64::from(entry.gid))?;
        put_octal(&mut raw.size, "size", entry.size)?;
        put_octal(&mut raw.mtime, "mtime", entry.mtime.max(0) as u64)?;
        raw.typeflag = typeflag;

        if matches!(entry.kind, EntryKind::Symlink | EntryKind::Hardlink) {
            put_str(&mut raw.linkname, entry.link_target.as_bytes());
        }

        if format == Format::Ustar {
            raw.magic.copy_from_slice(USTAR_MAGIC);
            raw.version.copy_from_slice(USTAR_VERSION);
            put_str(&mut raw.uname, entry.user_name.as_bytes());
            put_str(&mut raw.gname, entry.group_name.as_bytes());
            put_octal(&mut raw.devmajor, "devmajor", u64::from(entry.dev_major))?;
            put_octal(&mut raw.devminor, "devminor", u64::from(entry.dev_minor))?;
        }

        let mut header = HeaderBlock { raw };
        header.seal();
        Ok(header)
    }

    /// Unsigned sum of all header bytes with the checksum field counted as
    /// spaces.
    pub fn compute_checksum(&self) -> u32 {
        checksum(self.raw.as_bytes())
    }

    fn seal(&mut self) {
        let sum = self.compute_checksum();
        // six digits, NUL, space; the largest possible sum fits in six
        let digits = format!("{sum:06o}");
        self.raw.checksum[..6].copy_from_slice(digits.as_bytes());
        self.raw.checksum[6] = 0;
        self.raw.checksum[7] = b' ';
    }

    pub fn to_block(&self) -> Block {
        let mut block = [0u8; BLOCK_SIZE];
        block.copy_from_slice(self.raw.as_bytes());
        block
    }
}

impl fmt::Debug for HeaderBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeaderBlock")
            .field("name", &String::from_utf8_lossy(truncate_null(&self.raw.name)))
            .field("typeflag", &(self.raw.typeflag as char))
            .field("size", &String::from_utf8_lossy(truncate_null(&self.raw.size)))
            .finish_non_exhaustive()
    }
}

fn truncate_null(bytes: &[u8]) -> &[u8] {
    match bytes.iter().position(|&b| b == 0) {
        Some(pos) => &bytes[..pos],
        None => bytes,
    }
}

/// Checksum of a raw 512-byte header.
pub fn checksum(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .enumerate()
        .map(|(i, &b)| {
            if CHECKSUM_RANGE.contains(&i) {
                u32::from(b' ')
            } else {
                u32::from(b)
            }
        })
        .sum()
}
