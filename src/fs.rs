//! Access to the host filesystem and account database.
//!
//! The archive writer never touches the host directly; it goes through
//! [`FilesystemQuery`] and [`IdentityResolver`], so that callers can feed it
//! a synthetic tree.  [`HostFilesystem`] and [`SystemIdentity`] are the
//! implementations used by default.

use std::{
    ffi::OsStr,
    fs::File,
    io::{self, Read},
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};

use nix::unistd::{Gid, Group, Uid, User};
use rustix::fs::{fstat, major, minor, readlinkat, statat, AtFlags, FileType, Stat, CWD};

use crate::catalog::FileIdentity;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
    Unknown,
}

/// The metadata of one path, as reported without following symlinks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileStat {
    pub kind: FileKind,
    /// Permission bits only.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime: i64,
    pub dev: u64,
    pub ino: u64,
    pub rdev_major: u32,
    pub rdev_minor: u32,
}

impl FileStat {
    pub fn identity(&self) -> FileIdentity {
        FileIdentity {
            dev: self.dev,
            ino: self.ino,
        }
    }
}

/// Read-only view of a filesystem.
pub trait FilesystemQuery {
    /// Metadata of `path` itself, not of a symlink's target.
    fn stat(&self, path: &Path) -> io::Result<FileStat>;

    fn exists(&self, path: &Path) -> bool {
        self.stat(path).is_ok()
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf>;

    /// Full paths of the entries of a directory, in a stable order.
    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;

    fn open(&self, path: &Path) -> io::Result<Box<dyn Read>>;

    /// Separator between path segments.
    fn separator(&self) -> char {
        '/'
    }
}

/// Owner and group name lookup.
pub trait IdentityResolver {
    fn user_name(&self, uid: u32) -> Option<String>;
    fn group_name(&self, gid: u32) -> Option<String>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct HostFilesystem;

fn kind_of(mode: u32) -> FileKind {
    match FileType::from_raw_mode(mode) {
        FileType::RegularFile => FileKind::Regular,
        FileType::Directory => FileKind::Directory,
        FileType::Symlink => FileKind::Symlink,
        FileType::CharacterDevice => FileKind::CharDevice,
        FileType::BlockDevice => FileKind::BlockDevice,
        FileType::Fifo => FileKind::Fifo,
        FileType::Socket => FileKind::Socket,
        FileType::Unknown => FileKind::Unknown,
    }
}

fn convert_stat(buf: &Stat) -> FileStat {
    FileStat {
        kind: kind_of(buf.st_mode),
        mode: buf.st_mode & 0o7777,
        uid: buf.st_uid,
        gid: buf.st_gid,
        size: buf.st_size.max(0) as u64,
        mtime: buf.st_mtime as i64,
        dev: buf.st_dev as u64,
        ino: buf.st_ino as u64,
        rdev_major: major(buf.st_rdev as u64),
        rdev_minor: minor(buf.st_rdev as u64),
    }
}

impl FilesystemQuery for HostFilesystem {
    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        let buf = statat(CWD, path, AtFlags::SYMLINK_NOFOLLOW)?;
        Ok(convert_stat(&buf))
    }

    fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
        let target = readlinkat(CWD, path, vec![])?;
        Ok(PathBuf::from(OsStr::from_bytes(target.as_bytes())))
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let mut children = std::fs::read_dir(path)?
            .map(|entry| entry.map(|entry| entry.path()))
            .collect::<io::Result<Vec<_>>>()?;
        children.sort();
        Ok(children)
    }

    fn open(&self, path: &Path) -> io::Result<Box<dyn Read>> {
        Ok(Box::new(File::open(path)?))
    }
}

/// Identity of an open file, used to keep an archive out of itself.
pub fn file_identity(file: &File) -> io::Result<FileIdentity> {
    let buf = fstat(file)?;
    Ok(FileIdentity {
        dev: buf.st_dev as u64,
        ino: buf.st_ino as u64,
    })
}

/// Names from the system account database.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemIdentity;

impl IdentityResolver for SystemIdentity {
    fn user_name(&self, uid: u32) -> Option<String> {
        User::from_uid(Uid::from_raw(uid)).ok().flatten().map(|user| user.name)
    }

    fn group_name(&self, gid: u32) -> Option<String> {
        Group::from_gid(Gid::from_raw(gid))
            .ok()
            .flatten()
            .map(|group| group.name)
    }
}
