//! LZ4 frame encoding around the tar byte stream.
//!
//! The frame is built by hand around the `lz4_flex` block codec rather than
//! with its streaming encoder: headers must be written as uncompressed frame
//! blocks so that a placeholder header can later be overwritten in place by
//! one of exactly the same encoded length.
//!
//! Frame layout: magic, descriptor (FLG, BD, HC), then a sequence of blocks
//! each prefixed with a little-endian `u32` size whose high bit marks stored
//! (uncompressed) data, and finally a zero end mark.  Blocks are independent
//! and no content checksum is written.

use std::{fmt, str::FromStr};

use log::trace;
use xxhash_rust::xxh32::xxh32;

use crate::error::{Error, Result};

const MAGIC: u32 = 0x184D_2204;
/// Version 01, independent blocks, no block or content checksums.
const FLG: u8 = 0b0110_0000;
/// 64 KiB maximum block size.
const BD: u8 = 0b0100_0000;
const MAX_BLOCK_SIZE: usize = 64 * 1024;
const STORED_FLAG: u32 = 0x8000_0000;
/// Size prefix in front of every frame block.
pub(crate) const BLOCK_PREFIX_LEN: usize = 4;

/// Optional framing applied around the whole archive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Compression {
    #[default]
    None,
    Lz4,
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Compression::None => "none",
            Compression::Lz4 => "lz4",
        })
    }
}

impl FromStr for Compression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Compression::None),
            "lz4" => Ok(Compression::Lz4),
            _ => Err(Error::UnknownSetting {
                setting: "compression",
                value: s.to_string(),
            }),
        }
    }
}

/// Encoded frame bytes waiting to be handed to the sink.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    data: Vec<u8>,
}

impl OutputBuffer {
    pub fn fill(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    fn fill_block_prefix(&mut self, len: usize, stored: bool) {
        let mut prefix = len as u32;
        if stored {
            prefix |= STORED_FLAG;
        }
        self.fill(&prefix.to_le_bytes());
    }

    pub fn pending(&self) -> &[u8] {
        &self.data
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Forget everything returned by [`OutputBuffer::pending`].
    pub fn clear(&mut self) {
        self.data.clear();
    }
}

/// Frame encoder.  Input accumulates until a full frame block is available
/// or the caller forces a flush.
pub struct Lz4Encoder {
    input: Vec<u8>,
    scratch: Vec<u8>,
    output: OutputBuffer,
}

impl Default for Lz4Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Lz4Encoder {
    /// A new encoder with the frame header already in its output.
    pub fn new() -> Self {
        let mut output = OutputBuffer::default();
        output.fill(&MAGIC.to_le_bytes());
        output.fill(&[FLG, BD, descriptor_checksum(FLG, BD)]);
        Lz4Encoder {
            input: Vec::with_capacity(MAX_BLOCK_SIZE),
            scratch: vec![],
            output,
        }
    }

    pub fn output(&mut self) -> &mut OutputBuffer {
        &mut self.output
    }

    /// Queue data for compression.
    pub fn write(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let take = (MAX_BLOCK_SIZE - self.input.len()).min(data.len());
            self.input.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.input.len() == MAX_BLOCK_SIZE {
                self.compress_input()?;
            }
        }
        Ok(())
    }

    /// Close the current block so that all queued input is in the output.
    pub fn flush(&mut self) -> Result<()> {
        if !self.input.is_empty() {
            self.compress_input()?;
        }
        Ok(())
    }

    /// Append `data` as one uncompressed block, after everything queued
    /// before it.  The encoded length is always `data.len() + 4`.
    pub fn write_stored(&mut self, data: &[u8]) -> Result<()> {
        self.flush()?;
        self.output.fill_block_prefix(data.len(), true);
        self.output.fill(data);
        Ok(())
    }

    /// Flush and append the end mark.
    pub fn finish(&mut self) -> Result<()> {
        self.flush()?;
        self.output.fill(&0u32.to_le_bytes());
        Ok(())
    }

    fn compress_input(&mut self) -> Result<()> {
        let bound = lz4_flex::block::get_maximum_output_size(self.input.len());
        self.scratch.resize(bound, 0);
        let compressed = lz4_flex::block::compress_into(&self.input, &mut self.scratch)
            .map_err(|e| Error::Compression(e.to_string()))?;

        if compressed < self.input.len() {
            trace!("lz4 block {} -> {compressed} bytes", self.input.len());
            self.output.fill_block_prefix(compressed, false);
            self.output.fill(&self.scratch[..compressed]);
        } else {
            trace!("lz4 block of {} bytes stored", self.input.len());
            self.output.fill_block_prefix(self.input.len(), true);
            self.output.fill(&self.input);
        }
        self.input.clear();
        Ok(())
    }
}

/// Stored-block encoding of `data`, used to overwrite a block in place.
pub(crate) fn stored_block(data: &[u8]) -> Vec<u8> {
    let mut buf = OutputBuffer {
        data: Vec::with_capacity(BLOCK_PREFIX_LEN + data.len()),
    };
    buf.fill_block_prefix(data.len(), true);
    buf.fill(data);
    buf.data
}

fn descriptor_checksum(flg: u8, bd: u8) -> u8 {
    (xxh32(&[flg, bd], 0) >> 8) as u8
}
