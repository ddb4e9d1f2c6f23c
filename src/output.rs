//! Block output with optional LZ4 framing.
//!
//! Tar data goes through the frame encoder as compressible input, while
//! headers are always emitted as stored frame blocks.  That keeps the
//! encoded length of a header fixed, so a placeholder written at
//! [`Output::header_position`] can be overwritten in place.

use log::trace;

use crate::{
    block::{BlockCallback, BlockWriter},
    error::Result,
    lz4::{self, Compression, Lz4Encoder},
    Block,
};

pub struct Output {
    sink: BlockWriter,
    encoder: Option<Lz4Encoder>,
}

impl Output {
    pub fn new(sink: BlockWriter, compression: Compression) -> Result<Self> {
        let mut output = Output {
            sink,
            encoder: match compression {
                Compression::None => None,
                Compression::Lz4 => Some(Lz4Encoder::new()),
            },
        };
        // frame header goes out immediately
        output.drain()?;
        Ok(output)
    }

    pub fn from_callback(callback: BlockCallback, compression: Compression) -> Result<Self> {
        Self::new(BlockWriter::to_callback(callback), compression)
    }

    pub fn is_seekable(&self) -> bool {
        self.sink.is_seekable()
    }

    fn drain(&mut self) -> Result<()> {
        if let Some(encoder) = &mut self.encoder {
            let output = encoder.output();
            if !output.is_empty() {
                trace!("emitting {} bytes of lz4 frame", output.pending().len());
                self.sink.write_all(output.pending())?;
                output.clear();
            }
        }
        Ok(())
    }

    /// Flush everything queued so far down to the sink.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(encoder) = &mut self.encoder {
            encoder.flush()?;
        }
        self.drain()?;
        self.sink.flush()
    }

    /// Sink offset at which the next header will start.
    ///
    /// Pending compressed data is flushed first so the offset is final.
    pub fn header_position(&mut self) -> Result<u64> {
        self.flush()?;
        Ok(self.sink.position())
    }

    pub fn write_header(&mut self, block: &Block) -> Result<()> {
        match &mut self.encoder {
            Some(encoder) => {
                encoder.write_stored(block)?;
                self.drain()
            }
            None => self.sink.write_all(block),
        }
    }

    pub fn write_data(&mut self, data: &[u8]) -> Result<()> {
        match &mut self.encoder {
            Some(encoder) => {
                encoder.write(data)?;
                self.drain()
            }
            None => self.sink.write_all(data),
        }
    }

    /// Overwrite the header previously written at `position` and return to
    /// the end of the output.
    pub fn rewrite_header(&mut self, position: u64, block: &Block) -> Result<()> {
        self.flush()?;
        let end = self.sink.position();
        self.sink.seek(position)?;
        match self.encoder {
            Some(_) => self.sink.write_all(&lz4::stored_block(block))?,
            None => self.sink.write_all(block)?,
        }
        self.sink.flush()?;
        self.sink.seek(end)
    }

    /// End the LZ4 frame, if any, and flush the sink.
    pub fn finish(&mut self) -> Result<()> {
        if let Some(encoder) = &mut self.encoder {
            encoder.finish()?;
        }
        self.drain()?;
        self.sink.flush()
    }
}
