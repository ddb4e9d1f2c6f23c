use std::{io, path::PathBuf};

use thiserror::Error;

use crate::header::{EntryKind, Format};

/// Coarse classification of an [`Error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller passed something the archive cannot represent or must refuse.
    InvalidArgument,
    /// The operation is not valid in the writer's current state.
    Logic,
    /// The operating system reported a failure.
    Io,
    /// The LZ4 codec reported a failure.
    Compression,
}

/// Writing an archive failed.
///
/// Any error leaves the archive in an unspecified state: callers should stop
/// using the writer that produced it.
#[derive(Error, Debug)] // can't derive PartialEq because of std::io::Error
pub enum Error {
    #[error("invalid archive name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },
    #[error("unknown {setting} {value:?}")]
    UnknownSetting {
        setting: &'static str,
        value: String,
    },
    #[error("path {} is not valid UTF-8", .0.display())]
    NonUtf8Path(PathBuf),
    #[error("cannot archive {}: source does not exist", .0.display())]
    MissingSource(PathBuf),
    #[error("cannot archive {}: unsupported file type", .0.display())]
    UnsupportedFileType(PathBuf),
    #[error("{kind} entries are not supported by the {format} format")]
    UnsupportedEntry { kind: EntryKind, format: Format },
    #[error("entry {0:?} must be a regular file")]
    NotRegularFile(String),
    #[error("value {value} does not fit in the {width}-digit {field} field")]
    FieldOverflow {
        field: &'static str,
        value: u64,
        width: usize,
    },
    #[error("refusing to add {} to itself", .0.display())]
    ArchiveContainsItself(PathBuf),
    #[error("archive is closed")]
    Closed,
    #[error("a streaming entry is still in progress")]
    StreamInProgress,
    #[error("no streaming entry is in progress")]
    NoStreamInProgress,
    #[error("the streaming entry in progress was not started with {0}")]
    StreamModeMismatch(&'static str),
    #[error("archive already contains an entry named {0:?}")]
    DuplicateEntry(String),
    #[error("deferred-size entries need a seekable output")]
    NotSeekable,
    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("lz4 compression failed: {0}")]
    Compression(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidName { .. }
            | Error::UnknownSetting { .. }
            | Error::NonUtf8Path(_)
            | Error::MissingSource(_)
            | Error::UnsupportedFileType(_)
            | Error::UnsupportedEntry { .. }
            | Error::NotRegularFile(_)
            | Error::FieldOverflow { .. }
            | Error::ArchiveContainsItself(_) => ErrorKind::InvalidArgument,
            Error::Closed
            | Error::StreamInProgress
            | Error::NoStreamInProgress
            | Error::StreamModeMismatch(_)
            | Error::DuplicateEntry(_)
            | Error::NotSeekable => ErrorKind::Logic,
            Error::Io { .. } => ErrorKind::Io,
            Error::Compression(_) => ErrorKind::Compression,
        }
    }

    /// The OS error code behind an I/O failure, if there is one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Io { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Attach context to a bare `std::io::Error`.
pub(crate) trait IoContext<T> {
    fn io_context<F, C>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn io_context<F, C>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.map_err(|source| Error::io(context(), source))
    }
}
