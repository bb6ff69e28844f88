// SPDX-License-Identifier: MPL-2.0

use super::factory::IoRegion;
use crate::prelude::*;

/// Sequential block-buffered reads over one region.
pub struct BufferedReader<R> {
    region: R,
    block: Vec<u8>,
    /// Next region offset to fill the block buffer from.
    position: u64,
    buf_start: usize,
    buf_end: usize,
}

impl<R: IoRegion> BufferedReader<R> {
    pub fn new(region: R) -> Self {
        BufferedReader {
            region,
            block: vec![0; BLOCK_SIZE],
            position: 0,
            buf_start: 0,
            buf_end: 0,
        }
    }

    fn refill(&mut self) -> Result<()> {
        let remaining = self.region.num_bytes() - self.position;
        if remaining == 0 {
            return_errno_with_msg!(CorruptData, "read past the end of the region");
        }
        let chunk = remaining.min(BLOCK_SIZE as u64) as usize;
        self.region.read_at(self.position, &mut self.block[..chunk])?;
        self.position += chunk as u64;
        self.buf_start = 0;
        self.buf_end = chunk;
        Ok(())
    }

    /// Reads the next `out.len()` bytes of the region.
    pub fn read_exact(&mut self, out: &mut [u8]) -> Result<()> {
        let mut copied = 0;
        while copied < out.len() {
            if self.buf_start == self.buf_end {
                self.refill()?;
            }
            let take = (out.len() - copied).min(self.buf_end - self.buf_start);
            out[copied..copied + take]
                .copy_from_slice(&self.block[self.buf_start..self.buf_start + take]);
            self.buf_start += take;
            copied += take;
        }
        Ok(())
    }

    /// Reads the next bytes and checks them against `expected`.
    pub fn verify(&mut self, expected: &[u8]) -> Result<()> {
        let mut actual = vec![0; expected.len()];
        self.read_exact(&mut actual)?;
        if actual != expected {
            return_errno_with_msg!(CorruptData, "data read does not match expected bytes");
        }
        Ok(())
    }
}

/// Sequential block-buffered writes over one region.
pub struct BufferedWriter<R> {
    region: R,
    block: Vec<u8>,
    /// Region offset at which the block buffer will land.
    position: u64,
    buf_end: usize,
}

impl<R: IoRegion> BufferedWriter<R> {
    pub fn new(region: R) -> Self {
        BufferedWriter {
            region,
            block: vec![0; BLOCK_SIZE],
            position: 0,
            buf_end: 0,
        }
    }

    fn check_space(&self, num_bytes: usize) -> Result<()> {
        if self.position + (self.buf_end + num_bytes) as u64 > self.region.num_bytes() {
            return_errno_with_msg!(NoSpace, "write past the end of the region");
        }
        Ok(())
    }

    fn drain_block(&mut self) -> Result<()> {
        if self.buf_end > 0 {
            self.region.write_at(self.position, &self.block[..self.buf_end])?;
            self.position += self.buf_end as u64;
            self.buf_end = 0;
        }
        Ok(())
    }

    /// Appends bytes to the region.
    pub fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.check_space(bytes.len())?;
        let mut written = 0;
        while written < bytes.len() {
            let take = (bytes.len() - written).min(BLOCK_SIZE - self.buf_end);
            self.block[self.buf_end..self.buf_end + take]
                .copy_from_slice(&bytes[written..written + take]);
            self.buf_end += take;
            written += take;
            if self.buf_end == BLOCK_SIZE {
                self.drain_block()?;
            }
        }
        Ok(())
    }

    /// Appends `num_bytes` zero bytes to the region.
    pub fn write_zeros(&mut self, num_bytes: usize) -> Result<()> {
        self.check_space(num_bytes)?;
        let mut remaining = num_bytes;
        while remaining > 0 {
            let take = remaining.min(BLOCK_SIZE - self.buf_end);
            self.block[self.buf_end..self.buf_end + take].fill(0);
            self.buf_end += take;
            remaining -= take;
            if self.buf_end == BLOCK_SIZE {
                self.drain_block()?;
            }
        }
        Ok(())
    }

    /// Writes out buffered bytes and persists them.
    pub fn flush(&mut self) -> Result<()> {
        self.drain_block()?;
        self.region.flush()
    }
}
