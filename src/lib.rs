//! Byte-exact tar archive writer.
//!
//! `tarstream` encodes filesystem entries and in-memory byte streams into a
//! Unix V7 or USTAR tar container, optionally wrapped in a streaming LZ4
//! frame.  Entries whose final size is only known after their content has
//! been consumed are supported on seekable outputs by writing a placeholder
//! header and patching it once the stream completes.
//!
//! ```no_run
//! use tarstream::{ArchiveOptions, Entry, Format, TarWriter};
//!
//! # fn main() -> tarstream::Result<()> {
//! let options = ArchiveOptions::default().with_format(Format::Ustar);
//! let mut tar = TarWriter::create("out.tar", options)?;
//! tar.add_from_filesystem_recursive("some/dir")?;
//! tar.add_bytes(Entry::file("notes.txt", 0o644), b"hello")?;
//! tar.close()?;
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod block;
pub mod catalog;
pub mod error;
pub mod fs;
pub mod header;
pub mod lz4;
pub mod output;
pub mod path;
pub mod stream;

pub use archive::{ArchiveOptions, TarWriter};
pub use block::BlockCallback;
pub use error::{Error, ErrorKind, Result};
pub use fs::{FileKind, FileStat, FilesystemQuery, HostFilesystem, IdentityResolver, SystemIdentity};
pub use header::{Entry, EntryKind, Format, HeaderBlock};
pub use lz4::Compression;

/// Size of every unit written to the archive.
pub const BLOCK_SIZE: usize = 512;

/// One archive block.
pub type Block = [u8; BLOCK_SIZE];
