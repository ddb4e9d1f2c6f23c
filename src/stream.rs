//! Turning arbitrary write sizes into whole archive blocks.

use std::io::{self, Read};

use crate::{
    error::{IoContext, Result},
    header::Entry,
    output::Output,
    Block, BLOCK_SIZE,
};

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// How the header of a streamed entry gets its size.
#[derive(Debug)]
pub enum StreamMode {
    /// A zeroed placeholder header sits at this output offset and is
    /// overwritten once the stream completes.
    Deferred { header_position: u64 },
    /// The header was written up front with the caller's size.
    Declared { entry: Entry },
}

/// One streaming entry in progress.
#[derive(Debug)]
pub struct StreamState {
    mode: StreamMode,
    block: Block,
    used: usize,
    written: u64,
}

impl StreamState {
    pub fn new(mode: StreamMode) -> Self {
        StreamState {
            mode,
            block: [0; BLOCK_SIZE],
            used: 0,
            written: 0,
        }
    }

    pub fn mode(&self) -> &StreamMode {
        &self.mode
    }

    /// Content bytes accepted so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn append(&mut self, mut data: &[u8], output: &mut Output) -> Result<()> {
        self.written += data.len() as u64;

        if self.used > 0 {
            let take = (BLOCK_SIZE - self.used).min(data.len());
            self.block[self.used..self.used + take].copy_from_slice(&data[..take]);
            self.used += take;
            data = &data[take..];
            if self.used < BLOCK_SIZE {
                return Ok(());
            }
            output.write_data(&self.block)?;
            self.used = 0;
        }

        let whole = data.len() - data.len() % BLOCK_SIZE;
        if whole > 0 {
            output.write_data(&data[..whole])?;
        }

        let rest = &data[whole..];
        self.block[..rest.len()].copy_from_slice(rest);
        self.used = rest.len();
        Ok(())
    }

    /// Copy `reader` to its end, or up to `limit` bytes if given.
    ///
    /// Returns the number of bytes read, which is less than `limit` if the
    /// source ran out early.
    pub fn copy_from(
        &mut self,
        reader: &mut dyn Read,
        limit: Option<u64>,
        output: &mut Output,
    ) -> Result<u64> {
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut copied = 0u64;
        loop {
            let want = match limit {
                Some(limit) if limit - copied < buf.len() as u64 => (limit - copied) as usize,
                _ => buf.len(),
            };
            if want == 0 {
                break;
            }
            let n = match reader.read(&mut buf[..want]) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).io_context(|| "reading entry content"),
            };
            self.append(&buf[..n], output)?;
            copied += n as u64;
        }
        Ok(copied)
    }

    /// Zero-fill the current block and write it out.
    pub fn finish(mut self, output: &mut Output) -> Result<StreamMode> {
        if self.used > 0 {
            self.block[self.used..].fill(0);
            output.write_data(&self.block)?;
        }
        Ok(self.mode)
    }
}
