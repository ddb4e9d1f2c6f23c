//! The final sink of an archive.
//!
//! A [`BlockWriter`] either owns a seekable file or pushes every block to a
//! caller-supplied callback.  Only the file sink can go back and rewrite a
//! header.

use std::{
    fs::File,
    io::{self, BufWriter, Seek, SeekFrom, Write},
};

use log::trace;

use crate::{
    error::{Error, IoContext, Result},
    Block, BLOCK_SIZE,
};

/// Receives the archive one block at a time, together with the number of
/// valid bytes in that block.
///
/// Uncompressed archives always fill the whole block.  With LZ4 framing the
/// compressed byte stream is cut into blocks and the last block of each
/// flush can be partial.
pub type BlockCallback = Box<dyn FnMut(&Block, usize) -> io::Result<()>>;

enum Sink {
    File(BufWriter<File>),
    Callback(BlockCallback),
}

pub struct BlockWriter {
    sink: Sink,
    position: u64,
}

impl BlockWriter {
    pub fn to_file(file: File) -> Self {
        BlockWriter {
            sink: Sink::File(BufWriter::new(file)),
            position: 0,
        }
    }

    pub fn to_callback(callback: BlockCallback) -> Self {
        BlockWriter {
            sink: Sink::Callback(callback),
            position: 0,
        }
    }

    pub fn is_seekable(&self) -> bool {
        matches!(self.sink, Sink::File(_))
    }

    /// Offset of the next byte to be written.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn write_all(&mut self, data: &[u8]) -> Result<()> {
        match &mut self.sink {
            Sink::File(file) => file
                .write_all(data)
                .io_context(|| format!("writing archive at offset {}", self.position))?,
            Sink::Callback(callback) => {
                let mut block = [0u8; BLOCK_SIZE];
                for chunk in data.chunks(BLOCK_SIZE) {
                    block[..chunk.len()].copy_from_slice(chunk);
                    block[chunk.len()..].fill(0);
                    callback(&block, chunk.len()).io_context(|| "archive output callback")?;
                }
            }
        }
        self.position += data.len() as u64;
        Ok(())
    }

    /// Move the write position.  Buffered data is flushed first.
    pub fn seek(&mut self, offset: u64) -> Result<()> {
        match &mut self.sink {
            Sink::File(file) => {
                trace!("seeking archive output {} -> {offset}", self.position);
                file.seek(SeekFrom::Start(offset))
                    .io_context(|| format!("seeking archive output to offset {offset}"))?;
                self.position = offset;
                Ok(())
            }
            Sink::Callback(_) => Err(Error::NotSeekable),
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        if let Sink::File(file) = &mut self.sink {
            trace!("flushing archive output at offset {}", self.position);
            file.flush().io_context(|| "flushing archive output")?;
        }
        Ok(())
    }
}
