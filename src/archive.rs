//! The archive writer.
//!
//! A [`TarWriter`] owns one output for its whole lifetime and appends entries
//! strictly in call order.  The only thing ever rewritten is the header of
//! a deferred-size streamed entry, exactly once, when that entry completes.

use std::{
    fs::File,
    io::{self, Read},
    path::Path,
};

use log::{debug, warn};

use crate::{
    block::BlockWriter,
    catalog::{Catalog, FileIdentity},
    error::{Error, IoContext, Result},
    fs::{
        file_identity, FileKind, FileStat, FilesystemQuery, HostFilesystem, IdentityResolver,
        SystemIdentity,
    },
    header::{Entry, EntryKind, Format, HeaderBlock},
    lz4::Compression,
    output::Output,
    path::{archive_name, compose_rename, path_str, validate_rename},
    stream::{StreamMode, StreamState},
    Block, BLOCK_SIZE,
};

const ZERO_BLOCK: Block = [0; BLOCK_SIZE];

/// Settings fixed when an archive is created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArchiveOptions {
    pub format: Format,
    pub compression: Compression,
}

impl ArchiveOptions {
    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }
}

pub struct TarWriter {
    // None once closed
    output: Option<Output>,
    options: ArchiveOptions,
    seekable: bool,
    catalog: Catalog,
    stream: Option<StreamState>,
    fs: Box<dyn FilesystemQuery>,
    ids: Box<dyn IdentityResolver>,
    // identity of the output file, if there is one
    own_identity: Option<FileIdentity>,
}

impl TarWriter {
    /// Create (or truncate) the archive file at `path`.
    pub fn create(path: impl AsRef<Path>, options: ArchiveOptions) -> Result<Self> {
        Self::create_with(path, options, HostFilesystem, SystemIdentity)
    }

    pub fn create_with(
        path: impl AsRef<Path>,
        options: ArchiveOptions,
        fs: impl FilesystemQuery + 'static,
        ids: impl IdentityResolver + 'static,
    ) -> Result<Self> {
        let path = path.as_ref();
        let file = File::create(path).io_context(|| format!("creating {}", path.display()))?;
        let identity = file_identity(&file)
            .io_context(|| format!("stat {}", path.display()))?;
        let output = Output::new(BlockWriter::to_file(file), options.compression)?;
        debug!("writing {} archive to {}", options.format, path.display());
        Ok(Self::from_parts(output, options, Box::new(fs), Box::new(ids), Some(identity)))
    }

    /// Push the archive block by block to `callback` instead of a file.
    ///
    /// Deferred-size entries are not available in this mode.
    pub fn with_callback(
        callback: impl FnMut(&Block, usize) -> io::Result<()> + 'static,
        options: ArchiveOptions,
    ) -> Result<Self> {
        Self::with_callback_and(callback, options, HostFilesystem, SystemIdentity)
    }

    pub fn with_callback_and(
        callback: impl FnMut(&Block, usize) -> io::Result<()> + 'static,
        options: ArchiveOptions,
        fs: impl FilesystemQuery + 'static,
        ids: impl IdentityResolver + 'static,
    ) -> Result<Self> {
        let output = Output::from_callback(Box::new(callback), options.compression)?;
        Ok(Self::from_parts(output, options, Box::new(fs), Box::new(ids), None))
    }

    fn from_parts(
        output: Output,
        options: ArchiveOptions,
        fs: Box<dyn FilesystemQuery>,
        ids: Box<dyn IdentityResolver>,
        own_identity: Option<FileIdentity>,
    ) -> Self {
        TarWriter {
            seekable: output.is_seekable(),
            output: Some(output),
            options,
            catalog: Catalog::new(),
            stream: None,
            fs,
            ids,
            own_identity,
        }
    }

    pub fn is_open(&self) -> bool {
        self.output.is_some()
    }

    pub fn format(&self) -> Format {
        self.options.format
    }

    pub fn compression(&self) -> Compression {
        self.options.compression
    }

    /// Whether headers can be patched after their content was written.
    pub fn is_seekable(&self) -> bool {
        self.seekable
    }

    fn output(&mut self) -> Result<&mut Output> {
        self.output.as_mut().ok_or(Error::Closed)
    }

    /// Fail unless a new entry may be started.
    fn ready(&self) -> Result<()> {
        if self.output.is_none() {
            return Err(Error::Closed);
        }
        if self.stream.is_some() {
            return Err(Error::StreamInProgress);
        }
        Ok(())
    }

    /// Validate and normalize a caller-supplied name.
    fn caller_name(name: &str) -> Result<String> {
        validate_rename(name)?;
        archive_name(name, '/')
    }

    /// Encode `entry`, refusing names already taken by another
    /// non-directory entry.
    fn encode(&self, entry: &Entry) -> Result<HeaderBlock> {
        if entry.kind != EntryKind::Directory {
            self.catalog.check_name(&entry.name)?;
        }
        HeaderBlock::encode(entry, self.options.format)
    }

    fn committed(&mut self, entry: &Entry) {
        if entry.kind != EntryKind::Directory {
            self.catalog.record_name(&entry.name);
        }
        debug!("added {} {:?} ({} bytes)", entry.kind, entry.name, entry.size);
    }

    /// Write a header-only entry.
    fn commit(&mut self, entry: &Entry) -> Result<()> {
        let header = self.encode(entry)?;
        self.output()?.write_header(&header.to_block())?;
        self.committed(entry);
        Ok(())
    }

    // ========================================================================
    // Filesystem entries
    // ========================================================================

    fn stat_source(&self, path: &Path) -> Result<FileStat> {
        match self.fs.stat(path) {
            Ok(stat) => Ok(stat),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(Error::MissingSource(path.to_path_buf()))
            }
            Err(e) => Err(Error::io(format!("stat {}", path.display()), e)),
        }
    }

    fn describe_stat(&self, path: &Path, name: String, stat: &FileStat) -> Result<Entry> {
        let kind = match stat.kind {
            FileKind::Regular => EntryKind::Regular,
            FileKind::Directory => EntryKind::Directory,
            FileKind::Symlink => EntryKind::Symlink,
            FileKind::CharDevice => EntryKind::CharDevice,
            FileKind::BlockDevice => EntryKind::BlockDevice,
            FileKind::Fifo => EntryKind::Fifo,
            FileKind::Socket | FileKind::Unknown => {
                return Err(Error::UnsupportedFileType(path.to_path_buf()))
            }
        };

        let mut entry = Entry::new(kind, name)
            .with_mode(stat.mode)
            .with_owner(stat.uid, stat.gid)
            .with_mtime(stat.mtime);
        if self.options.format == Format::Ustar {
            entry.user_name = self.ids.user_name(stat.uid).unwrap_or_default();
            entry.group_name = self.ids.group_name(stat.gid).unwrap_or_default();
        }

        match kind {
            EntryKind::Regular => match self.catalog.link_target(stat.identity()) {
                Some(target) => {
                    entry.kind = EntryKind::Hardlink;
                    entry.link_target = target.to_string();
                }
                None => entry.size = stat.size,
            },
            EntryKind::Symlink => {
                let target = self
                    .fs
                    .read_link(path)
                    .io_context(|| format!("reading link {}", path.display()))?;
                entry.link_target = path_str(&target)?.to_string();
            }
            EntryKind::CharDevice | EntryKind::BlockDevice => {
                entry = entry.with_device(stat.rdev_major, stat.rdev_minor);
            }
            _ => {}
        }
        Ok(entry)
    }

    /// The entry that adding `path` would produce, without writing it.
    pub fn describe(&self, path: impl AsRef<Path>) -> Result<Entry> {
        let path = path.as_ref();
        let name = archive_name(path_str(path)?, self.fs.separator())?;
        self.describe_stat(path, name, &self.stat_source(path)?)
    }

    /// Like [`TarWriter::describe`], with the entry stored as `name`.
    pub fn describe_as(&self, path: impl AsRef<Path>, name: &str) -> Result<Entry> {
        let path = path.as_ref();
        let name = Self::caller_name(name)?;
        self.describe_stat(path, name, &self.stat_source(path)?)
    }

    /// Add a single path.  Directories are added without their contents.
    pub fn add_from_filesystem(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let name = archive_name(path_str(path)?, self.fs.separator())?;
        self.add_path(path, name)
    }

    /// Add a single path, stored in the archive as `name`.
    pub fn add_from_filesystem_as(&mut self, path: impl AsRef<Path>, name: &str) -> Result<()> {
        let name = Self::caller_name(name)?;
        self.add_path(path.as_ref(), name)
    }

    /// Add `root` and, if it is a directory, everything below it.
    ///
    /// Directories come before their contents, siblings in the order the
    /// filesystem lists them.  Sockets below `root` are skipped, as is
    /// anything that disappears between listing and archiving it.
    pub fn add_from_filesystem_recursive(&mut self, root: impl AsRef<Path>) -> Result<()> {
        self.add_tree(root.as_ref(), None)
    }

    /// Recursive add with `root` stored as `name` and everything below it
    /// renamed accordingly.
    pub fn add_from_filesystem_recursive_as(
        &mut self,
        root: impl AsRef<Path>,
        name: &str,
    ) -> Result<()> {
        validate_rename(name)?;
        self.add_tree(root.as_ref(), Some(name))
    }

    fn add_tree(&mut self, root: &Path, base: Option<&str>) -> Result<()> {
        self.ready()?;
        let separator = self.fs.separator();
        let mut pending = vec![root.to_path_buf()];

        while let Some(path) = pending.pop() {
            let name = match base {
                Some(base) => archive_name(&compose_rename(base, root, &path)?, separator)?,
                None => archive_name(path_str(&path)?, separator)?,
            };
            if path != root && !self.fs.exists(&path) {
                warn!("skipping {}: removed while archiving", path.display());
                continue;
            }
            let stat = self.stat_source(&path)?;
            if path != root && matches!(stat.kind, FileKind::Socket | FileKind::Unknown) {
                warn!("skipping {}: unsupported file type", path.display());
                continue;
            }

            let is_dir = stat.kind == FileKind::Directory;
            self.add_stat(&path, name, stat)?;

            if is_dir {
                let children = self
                    .fs
                    .read_dir(&path)
                    .io_context(|| format!("reading directory {}", path.display()))?;
                pending.extend(children.into_iter().rev());
            }
        }
        Ok(())
    }

    fn add_path(&mut self, path: &Path, name: String) -> Result<()> {
        self.ready()?;
        let stat = self.stat_source(path)?;
        self.add_stat(path, name, stat)
    }

    fn add_stat(&mut self, path: &Path, name: String, stat: FileStat) -> Result<()> {
        if self.own_identity == Some(stat.identity()) {
            return Err(Error::ArchiveContainsItself(path.to_path_buf()));
        }

        let entry = self.describe_stat(path, name, &stat)?;
        if entry.kind != EntryKind::Regular {
            return self.commit(&entry);
        }

        let name = entry.name.clone();
        if self.seekable {
            self.add_file_counted(path, entry)?;
        } else {
            self.add_file_sized(path, entry)?;
        }
        self.catalog.record_identity(stat.identity(), &name);
        Ok(())
    }

    /// Content of unknown final length: placeholder header, copy to end of
    /// file, then patch the header with the byte count actually read.
    fn add_file_counted(&mut self, path: &Path, mut entry: Entry) -> Result<()> {
        // refuse early what could not be encoded anyway
        self.encode(&entry)?;
        let mut reader = self
            .fs
            .open(path)
            .io_context(|| format!("opening {}", path.display()))?;

        let output = self.output.as_mut().ok_or(Error::Closed)?;
        let header_position = output.header_position()?;
        output.write_header(&ZERO_BLOCK)?;
        let mut state = StreamState::new(StreamMode::Deferred { header_position });
        let copied = state.copy_from(&mut reader, None, output)?;
        state.finish(output)?;

        if copied != entry.size {
            warn!(
                "{} changed size while being archived ({} -> {copied} bytes)",
                path.display(),
                entry.size
            );
        }
        entry.size = copied;
        let header = HeaderBlock::encode(&entry, self.options.format)?;
        output.rewrite_header(header_position, &header.to_block())?;
        self.committed(&entry);
        Ok(())
    }

    /// Content of the size reported by stat, for outputs that cannot seek.
    /// A source that shrank is padded with zeros, one that grew is cut off.
    fn add_file_sized(&mut self, path: &Path, entry: Entry) -> Result<()> {
        let header = self.encode(&entry)?;
        let mut reader = self
            .fs
            .open(path)
            .io_context(|| format!("opening {}", path.display()))?;

        let output = self.output.as_mut().ok_or(Error::Closed)?;
        output.write_header(&header.to_block())?;
        let size = entry.size;
        let mut state = StreamState::new(StreamMode::Declared { entry });
        let copied = state.copy_from(&mut reader, Some(size), output)?;

        if copied < size {
            warn!(
                "{} shrank while being archived, padding {} missing bytes",
                path.display(),
                size - copied
            );
            let mut missing = size - copied;
            while missing > 0 {
                let n = missing.min(BLOCK_SIZE as u64) as usize;
                state.append(&ZERO_BLOCK[..n], output)?;
                missing -= n as u64;
            }
        } else {
            let mut extra = [0u8; 1];
            match reader.read(&mut extra) {
                Ok(0) => {}
                Ok(_) => warn!(
                    "{} grew while being archived, storing only the first {size} bytes",
                    path.display()
                ),
                Err(e) => warn!(
                    "{}: checking for content past {size} bytes: {e}",
                    path.display()
                ),
            }
        }

        if let StreamMode::Declared { entry } = state.finish(output)? {
            self.committed(&entry);
        }
        Ok(())
    }

    // ========================================================================
    // In-memory entries
    // ========================================================================

    /// Add a regular file whose content is `data`.
    ///
    /// The entry's size is taken from `data`; its name must be a valid
    /// rename target.
    pub fn add_bytes(&mut self, mut entry: Entry, data: &[u8]) -> Result<()> {
        self.ready()?;
        entry.name = Self::caller_name(&entry.name)?;
        if entry.kind != EntryKind::Regular {
            return Err(Error::NotRegularFile(entry.name));
        }
        entry.size = data.len() as u64;

        let header = self.encode(&entry)?;
        let output = self.output.as_mut().ok_or(Error::Closed)?;
        output.write_header(&header.to_block())?;
        let mut state = StreamState::new(StreamMode::Declared { entry });
        state.append(data, output)?;
        if let StreamMode::Declared { entry } = state.finish(output)? {
            self.committed(&entry);
        }
        Ok(())
    }

    /// Add an entry that consists of its header only: a directory, link,
    /// device or fifo.  Regular files added this way are empty.
    pub fn add_entry(&mut self, mut entry: Entry) -> Result<()> {
        self.ready()?;
        entry.name = Self::caller_name(&entry.name)?;
        entry.size = 0;
        self.commit(&entry)
    }

    // ========================================================================
    // Streamed entries
    // ========================================================================

    /// Start a regular file whose size is not known yet.
    ///
    /// A zeroed placeholder header is written now and replaced by
    /// [`TarWriter::complete_stream`].  Needs a seekable output.
    pub fn begin_stream(&mut self) -> Result<()> {
        self.ready()?;
        if !self.seekable {
            return Err(Error::NotSeekable);
        }
        let output = self.output()?;
        let header_position = output.header_position()?;
        output.write_header(&ZERO_BLOCK)?;
        self.stream = Some(StreamState::new(StreamMode::Deferred { header_position }));
        Ok(())
    }

    /// Start a regular file of known size.  The header goes out right away
    /// with `entry.size`, so this works on any output.
    ///
    /// The size is trusted: if a different amount of data is appended, the
    /// archive is left inconsistent.
    pub fn begin_stream_sized(&mut self, mut entry: Entry) -> Result<()> {
        self.ready()?;
        entry.name = Self::caller_name(&entry.name)?;
        if entry.kind != EntryKind::Regular {
            return Err(Error::NotRegularFile(entry.name));
        }
        let header = self.encode(&entry)?;
        self.output()?.write_header(&header.to_block())?;
        self.stream = Some(StreamState::new(StreamMode::Declared { entry }));
        Ok(())
    }

    /// Append content to the streamed entry in progress.
    pub fn append_stream(&mut self, data: &[u8]) -> Result<()> {
        let output = self.output.as_mut().ok_or(Error::Closed)?;
        let state = self.stream.as_mut().ok_or(Error::NoStreamInProgress)?;
        state.append(data, output)
    }

    /// Finish an entry started with [`TarWriter::begin_stream`].
    ///
    /// `entry` supplies the metadata; its size is replaced by the number of
    /// bytes appended.
    ///
    /// If `entry` is refused, the stream stays open and this can be called
    /// again with different metadata.
    pub fn complete_stream(&mut self, mut entry: Entry) -> Result<()> {
        let written = match &self.stream {
            _ if self.output.is_none() => return Err(Error::Closed),
            None => return Err(Error::NoStreamInProgress),
            Some(state) if !matches!(state.mode(), StreamMode::Deferred { .. }) => {
                return Err(Error::StreamModeMismatch("begin_stream"))
            }
            Some(state) => state.written(),
        };
        entry.name = Self::caller_name(&entry.name)?;
        if entry.kind != EntryKind::Regular {
            return Err(Error::NotRegularFile(entry.name));
        }
        entry.size = written;
        let header = self.encode(&entry)?;

        let Some(state) = self.stream.take() else {
            return Err(Error::NoStreamInProgress);
        };
        let output = self.output.as_mut().ok_or(Error::Closed)?;
        if let StreamMode::Deferred { header_position } = state.finish(output)? {
            output.rewrite_header(header_position, &header.to_block())?;
        }
        self.committed(&entry);
        Ok(())
    }

    /// Finish an entry started with [`TarWriter::begin_stream_sized`].
    pub fn end_stream(&mut self) -> Result<()> {
        match &self.stream {
            _ if self.output.is_none() => return Err(Error::Closed),
            None => return Err(Error::NoStreamInProgress),
            Some(state) if !matches!(state.mode(), StreamMode::Declared { .. }) => {
                return Err(Error::StreamModeMismatch("begin_stream_sized"))
            }
            Some(_) => {}
        }
        let Some(state) = self.stream.take() else {
            return Err(Error::NoStreamInProgress);
        };
        let written = state.written();

        let output = self.output.as_mut().ok_or(Error::Closed)?;
        if let StreamMode::Declared { entry } = state.finish(output)? {
            if written != entry.size {
                warn!(
                    "{:?} was declared as {} bytes but {written} were written",
                    entry.name, entry.size
                );
            }
            self.committed(&entry);
        }
        Ok(())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Terminate the archive and release the output.
    ///
    /// Closing twice is harmless.  A streamed entry must be completed first.
    pub fn close(&mut self) -> Result<()> {
        if self.output.is_none() {
            return Ok(());
        }
        if self.stream.is_some() {
            return Err(Error::StreamInProgress);
        }
        self.terminate()
    }

    /// Consuming variant of [`TarWriter::close`].
    pub fn finish(mut self) -> Result<()> {
        self.close()
    }

    fn terminate(&mut self) -> Result<()> {
        let Some(mut output) = self.output.take() else {
            return Ok(());
        };
        output.write_data(&ZERO_BLOCK)?;
        output.write_data(&ZERO_BLOCK)?;
        output.finish()?;
        debug!("archive closed");
        Ok(())
    }
}

impl Drop for TarWriter {
    fn drop(&mut self) {
        if self.output.is_none() {
            return;
        }
        if self.stream.take().is_some() {
            warn!("archive dropped with a streamed entry in progress");
        }
        if let Err(e) = self.terminate() {
            warn!("failed to close archive: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, collections::HashMap, path::PathBuf, rc::Rc};

    use similar_asserts::assert_eq;

    use super::*;
    use crate::error::ErrorKind;

    /// A synthetic tree: path -> (stat, content or link target).
    #[derive(Default)]
    struct FakeFs {
        files: HashMap<PathBuf, (FileStat, Vec<u8>)>,
        // listed by read_dir but gone by the time they are looked at
        vanished: Vec<PathBuf>,
        // reading past the content fails instead of returning EOF
        tail_error: bool,
    }

    struct TailError;

    impl Read for TailError {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::other("device went away"))
        }
    }

    impl FakeFs {
        fn meta(kind: FileKind, ino: u64, size: u64) -> FileStat {
            FileStat {
                kind,
                mode: 0o640,
                uid: 1000,
                gid: 1000,
                size,
                mtime: 1234,
                dev: 1,
                ino,
                rdev_major: 0,
                rdev_minor: 0,
            }
        }

        fn with(mut self, path: &str, stat: FileStat, data: &[u8]) -> Self {
            self.files.insert(PathBuf::from(path), (stat, data.to_vec()));
            self
        }

        fn file(self, path: &str, ino: u64, data: &[u8]) -> Self {
            let stat = Self::meta(FileKind::Regular, ino, data.len() as u64);
            self.with(path, stat, data)
        }

        fn dir(self, path: &str, ino: u64) -> Self {
            let stat = Self::meta(FileKind::Directory, ino, 0);
            self.with(path, stat, b"")
        }

        fn vanished(mut self, path: &str) -> Self {
            self.vanished.push(PathBuf::from(path));
            self
        }
    }

    impl FilesystemQuery for FakeFs {
        fn stat(&self, path: &Path) -> io::Result<FileStat> {
            self.files
                .get(path)
                .map(|(stat, _)| stat.clone())
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
        }

        fn read_link(&self, path: &Path) -> io::Result<PathBuf> {
            let (_, data) = self.files.get(path).ok_or(io::ErrorKind::NotFound)?;
            Ok(PathBuf::from(String::from_utf8_lossy(data).into_owned()))
        }

        fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
            let mut children: Vec<PathBuf> = self
                .files
                .keys()
                .chain(&self.vanished)
                .filter(|p| p.parent() == Some(path))
                .cloned()
                .collect();
            children.sort();
            Ok(children)
        }

        fn open(&self, path: &Path) -> io::Result<Box<dyn Read>> {
            let (_, data) = self.files.get(path).ok_or(io::ErrorKind::NotFound)?;
            let content = io::Cursor::new(data.clone());
            if self.tail_error {
                Ok(Box::new(content.chain(TailError)))
            } else {
                Ok(Box::new(content))
            }
        }
    }

    struct FakeIds;

    impl IdentityResolver for FakeIds {
        fn user_name(&self, uid: u32) -> Option<String> {
            (uid == 1000).then(|| "alice".to_string())
        }

        fn group_name(&self, _gid: u32) -> Option<String> {
            None
        }
    }

    fn collecting(
        fs: FakeFs,
        options: ArchiveOptions,
    ) -> (TarWriter, Rc<RefCell<Vec<u8>>>) {
        let seen = Rc::new(RefCell::new(vec![]));
        let sink = Rc::clone(&seen);
        let tar = TarWriter::with_callback_and(
            move |block: &Block, size: usize| {
                sink.borrow_mut().extend_from_slice(&block[..size]);
                Ok(())
            },
            options,
            fs,
            FakeIds,
        )
        .unwrap();
        (tar, seen)
    }

    fn writing_file(fs: FakeFs) -> (TarWriter, tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.tar");
        let tar = TarWriter::create_with(&path, ArchiveOptions::default(), fs, FakeIds).unwrap();
        (tar, dir, path)
    }

    fn read_entries(path: &Path) -> Vec<(String, Vec<u8>)> {
        let mut archive = tar::Archive::new(File::open(path).unwrap());
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let name = entry.path().unwrap().to_string_lossy().into_owned();
                let mut data = vec![];
                entry.read_to_end(&mut data).unwrap();
                (name, data)
            })
            .collect()
    }

    fn header_name(block: &[u8]) -> &[u8] {
        let end = block[..100].iter().position(|&b| b == 0).unwrap_or(100);
        &block[..end]
    }

    #[test]
    fn test_hardlink_substitution() {
        let fs = FakeFs::default()
            .file("a", 7, b"shared")
            .file("b", 7, b"shared");
        let (mut tar, seen) = collecting(fs, ArchiveOptions::default());
        tar.add_from_filesystem("a").unwrap();
        tar.add_from_filesystem("b").unwrap();

        let b = tar.describe("b").unwrap();
        assert_eq!(b.kind, EntryKind::Hardlink);
        assert_eq!(b.link_target, "a");
        tar.close().unwrap();

        let seen = seen.borrow();
        // header + data, hardlink header, terminator
        assert_eq!(seen.len(), 5 * BLOCK_SIZE);
        let link = &seen[2 * BLOCK_SIZE..3 * BLOCK_SIZE];
        assert_eq!(header_name(link), b"b");
        assert_eq!(link[156], b'1');
        assert_eq!(&link[157..158], b"a");
        assert_eq!(&link[124..136], b"00000000000\0");
    }

    #[test]
    fn test_duplicate_names() {
        let fs = FakeFs::default()
            .file("x/f", 1, b"one")
            .file("y/f", 2, b"two")
            .dir("d", 3);
        let (mut tar, seen) = collecting(fs, ArchiveOptions::default());
        tar.add_from_filesystem_as("x/f", "f").unwrap();
        let err = tar.add_from_filesystem_as("y/f", "f").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Logic);

        tar.add_from_filesystem("d").unwrap();
        tar.add_from_filesystem("d").unwrap();
        tar.close().unwrap();
        // f header + data, two directory headers, terminator
        assert_eq!(seen.borrow().len(), 6 * BLOCK_SIZE);
    }

    #[test]
    fn test_recursive_order_and_rename() {
        let fs = FakeFs::default()
            .dir("/src", 1)
            .dir("/src/sub", 2)
            .file("/src/sub/z", 3, b"z")
            .file("/src/a", 4, b"a")
            .with("/src/sock", FakeFs::meta(FileKind::Socket, 5, 0), b"")
            .with("/src/ln", FakeFs::meta(FileKind::Symlink, 6, 0), b"a");
        let (mut tar, seen) = collecting(fs, ArchiveOptions::default().with_format(Format::Ustar));
        tar.add_from_filesystem_recursive_as("/src", "out").unwrap();
        tar.close().unwrap();

        let seen = seen.borrow();
        let mut names = vec![];
        let mut offset = 0;
        while offset < seen.len() && seen[offset] != 0 {
            let header = &seen[offset..offset + BLOCK_SIZE];
            names.push(String::from_utf8_lossy(header_name(header)).into_owned());
            let blocks = if header[156] == b'0' { 2 } else { 1 };
            offset += blocks * BLOCK_SIZE;
        }
        assert_eq!(names, vec!["out", "out/a", "out/ln", "out/sub", "out/sub/z"]);
        // uname resolved, gname unknown
        assert_eq!(&seen[265..270], b"alice");
        assert_eq!(seen[297], 0);
    }

    #[test]
    fn test_socket_rejected_when_added_directly() {
        let fs = FakeFs::default().with("s", FakeFs::meta(FileKind::Socket, 1, 0), b"");
        let (mut tar, _) = collecting(fs, ArchiveOptions::default());
        let err = tar.add_from_filesystem("s").unwrap_err();
        assert!(matches!(err, Error::UnsupportedFileType(_)));
    }

    #[test]
    fn test_missing_source() {
        let (mut tar, _) = collecting(FakeFs::default(), ArchiveOptions::default());
        let err = tar.add_from_filesystem("nope").unwrap_err();
        assert!(matches!(err, Error::MissingSource(_)));
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_fixed_size_copy_pads_short_source() {
        // stat claims 600 bytes but only 10 can be read
        let fs = FakeFs::default().with(
            "short",
            FakeFs::meta(FileKind::Regular, 1, 600),
            b"0123456789",
        );
        let (mut tar, seen) = collecting(fs, ArchiveOptions::default());
        tar.add_from_filesystem("short").unwrap();
        tar.close().unwrap();

        let seen = seen.borrow();
        assert_eq!(seen.len(), 5 * BLOCK_SIZE);
        assert_eq!(&seen[124..136], b"00000001130\0");
        assert_eq!(&seen[512..522], b"0123456789");
        assert!(seen[522..1536].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_fixed_size_copy_truncates_long_source() {
        let fs = FakeFs::default().with(
            "long",
            FakeFs::meta(FileKind::Regular, 1, 4),
            b"0123456789",
        );
        let (mut tar, seen) = collecting(fs, ArchiveOptions::default());
        tar.add_from_filesystem("long").unwrap();
        tar.close().unwrap();

        let seen = seen.borrow();
        assert_eq!(seen.len(), 4 * BLOCK_SIZE);
        assert_eq!(&seen[512..516], b"0123");
        assert!(seen[516..1024].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_fixed_size_copy_tolerates_error_past_end() {
        let mut fs = FakeFs::default().file("f", 1, b"0123");
        fs.tail_error = true;
        let (mut tar, seen) = collecting(fs, ArchiveOptions::default());
        tar.add_from_filesystem("f").unwrap();
        tar.close().unwrap();

        let seen = seen.borrow();
        assert_eq!(seen.len(), 4 * BLOCK_SIZE);
        assert_eq!(&seen[124..136], b"00000000004\0");
        assert_eq!(&seen[512..516], b"0123");
    }

    #[test]
    fn test_counted_copy_stores_bytes_read() {
        // stat sizes are stale: one file grew, the other shrank
        let fs = FakeFs::default()
            .with("grown", FakeFs::meta(FileKind::Regular, 1, 3), b"abcdefgh")
            .with("shrunk", FakeFs::meta(FileKind::Regular, 2, 600), b"0123456789");
        let (mut tar, _dir, path) = writing_file(fs);
        assert!(tar.is_seekable());
        assert_eq!(tar.describe("grown").unwrap().size, 3);

        tar.add_from_filesystem_as("grown", "g").unwrap();
        tar.add_from_filesystem("shrunk").unwrap();
        tar.close().unwrap();

        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents.len(), 6 * BLOCK_SIZE);
        assert_eq!(&contents[124..136], b"00000000010\0");
        assert_eq!(&contents[1024 + 124..1024 + 136], b"00000000012\0");
        assert_eq!(
            read_entries(&path),
            vec![
                ("g".to_string(), b"abcdefgh".to_vec()),
                ("shrunk".to_string(), b"0123456789".to_vec()),
            ]
        );
    }

    #[test]
    fn test_refused_completion_keeps_stream_open() {
        let (mut tar, _dir, path) = writing_file(FakeFs::default());
        tar.add_bytes(Entry::file("dup", 0o644), b"first").unwrap();
        tar.begin_stream().unwrap();
        tar.append_stream(b"streamed").unwrap();

        assert!(matches!(
            tar.complete_stream(Entry::file("dup", 0o644)),
            Err(Error::DuplicateEntry(_))
        ));
        assert!(matches!(tar.close(), Err(Error::StreamInProgress)));
        tar.complete_stream(Entry::file("other", 0o644)).unwrap();
        tar.add_bytes(Entry::file("after", 0o644), b"last").unwrap();
        tar.close().unwrap();

        assert_eq!(
            read_entries(&path),
            vec![
                ("dup".to_string(), b"first".to_vec()),
                ("other".to_string(), b"streamed".to_vec()),
                ("after".to_string(), b"last".to_vec()),
            ]
        );
    }

    #[test]
    fn test_recursive_skips_vanished_entries() {
        let fs = FakeFs::default()
            .dir("d", 1)
            .file("d/kept", 2, b"k")
            .vanished("d/gone");
        let (mut tar, seen) = collecting(fs, ArchiveOptions::default());
        tar.add_from_filesystem_recursive("d").unwrap();
        assert!(matches!(
            tar.add_from_filesystem("d/gone"),
            Err(Error::MissingSource(_))
        ));
        tar.close().unwrap();

        let seen = seen.borrow();
        // directory header, kept header + data, terminator
        assert_eq!(seen.len(), 5 * BLOCK_SIZE);
        assert_eq!(header_name(&seen[BLOCK_SIZE..]), b"d/kept");
    }

    #[test]
    fn test_streaming_state_errors() {
        let (mut tar, seen) = collecting(FakeFs::default(), ArchiveOptions::default());
        assert!(matches!(tar.begin_stream(), Err(Error::NotSeekable)));
        assert!(matches!(tar.append_stream(b"x"), Err(Error::NoStreamInProgress)));
        assert!(matches!(tar.end_stream(), Err(Error::NoStreamInProgress)));

        tar.begin_stream_sized(Entry::file("s", 0o644).with_size(5)).unwrap();
        let err = tar.add_bytes(Entry::file("t", 0o644), b"t").unwrap_err();
        assert!(matches!(err, Error::StreamInProgress));
        assert!(matches!(
            tar.complete_stream(Entry::file("s", 0o644)),
            Err(Error::StreamModeMismatch(_))
        ));
        assert!(matches!(tar.close(), Err(Error::StreamInProgress)));

        tar.append_stream(b"12").unwrap();
        tar.append_stream(b"345").unwrap();
        tar.end_stream().unwrap();
        tar.close().unwrap();

        let seen = seen.borrow();
        assert_eq!(seen.len(), 4 * BLOCK_SIZE);
        assert_eq!(&seen[512..517], b"12345");
    }

    #[test]
    fn test_closed_archive() {
        let (mut tar, seen) = collecting(FakeFs::default(), ArchiveOptions::default());
        assert!(tar.is_open());
        tar.close().unwrap();
        assert!(!tar.is_open());
        tar.close().unwrap();
        assert_eq!(seen.borrow().len(), 2 * BLOCK_SIZE);

        let err = tar.add_bytes(Entry::file("late", 0o644), b"").unwrap_err();
        assert!(matches!(err, Error::Closed));
        assert!(matches!(tar.append_stream(b""), Err(Error::Closed)));
        assert!(matches!(tar.end_stream(), Err(Error::Closed)));
    }

    #[test]
    fn test_drop_terminates() {
        let (mut tar, seen) = collecting(FakeFs::default(), ArchiveOptions::default());
        tar.add_entry(Entry::directory("d", 0o755)).unwrap();
        drop(tar);
        assert_eq!(seen.borrow().len(), 3 * BLOCK_SIZE);
    }

    #[test]
    fn test_entry_names_are_validated() {
        let (mut tar, _) = collecting(FakeFs::default(), ArchiveOptions::default());
        let err = tar.add_bytes(Entry::file("../etc/passwd", 0o644), b"").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = tar.add_bytes(Entry::directory("dir", 0o755), b"").unwrap_err();
        assert!(matches!(err, Error::NotRegularFile(_)));
        tar.add_bytes(Entry::file("/abs/name", 0o644), b"").unwrap();
        assert!(matches!(
            tar.add_bytes(Entry::file("abs/name", 0o644), b""),
            Err(Error::DuplicateEntry(_))
        ));
    }

    #[test]
    fn test_v7_rejects_fifo() {
        let fs = FakeFs::default().with("p", FakeFs::meta(FileKind::Fifo, 1, 0), b"");
        let (mut tar, _) = collecting(fs, ArchiveOptions::default());
        let err = tar.add_from_filesystem("p").unwrap_err();
        assert!(matches!(err, Error::UnsupportedEntry { .. }));
        tar.add_entry(Entry::fifo("q", 0o644)).unwrap_err();
    }
}
