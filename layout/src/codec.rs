// SPDX-License-Identifier: MPL-2.0

//! A length-tracked buffer for the little-endian on-disk codecs.
//!
//! Encoding appends to the content region; decoding consumes from its
//! front. Every decode sequence ends by checking that the declared struct
//! size was consumed exactly.

use crate::prelude::*;

#[derive(Debug)]
pub(crate) struct Buffer {
    data: Vec<u8>,
    /// Offset of the next byte to get.
    start: usize,
    /// Offset one past the last content byte, and where the next put lands.
    end: usize,
}

impl Buffer {
    /// Creates an empty buffer with a fixed capacity, ready for encoding.
    pub fn new(capacity: usize) -> Self {
        Buffer {
            data: vec![0; capacity],
            start: 0,
            end: 0,
        }
    }

    /// Wraps bytes read from storage, ready for decoding.
    pub fn wrap(data: Vec<u8>) -> Self {
        let end = data.len();
        Buffer {
            data,
            start: 0,
            end,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The number of content bytes not yet consumed.
    pub fn content_len(&self) -> usize {
        self.end - self.start
    }

    /// The content bytes not yet consumed.
    pub fn contents(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    /// Drops all content, making the buffer ready for re-encoding.
    pub fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    /// Replaces the content with bytes read from storage.
    pub fn load_contents(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.capacity() {
            return_errno_with_msg!(CorruptData, "content is larger than its buffer");
        }
        self.data[..bytes.len()].copy_from_slice(bytes);
        self.start = 0;
        self.end = bytes.len();
        Ok(())
    }

    /// Makes all consumed content available to get again.
    pub fn rewind_all(&mut self) {
        self.start = 0;
    }

    pub fn skip_forward(&mut self, num_bytes: usize) -> Result<()> {
        if self.content_len() < num_bytes {
            return_errno_with_msg!(CorruptData, "cannot skip past the end of buffer content");
        }
        self.start += num_bytes;
        Ok(())
    }

    fn get_slice(&mut self, num_bytes: usize) -> Result<&[u8]> {
        if self.content_len() < num_bytes {
            return_errno_with_msg!(CorruptData, "buffer content ended mid-field");
        }
        let slice = &self.data[self.start..self.start + num_bytes];
        self.start += num_bytes;
        Ok(slice)
    }

    pub fn get_bytes(&mut self, out: &mut [u8]) -> Result<()> {
        let slice = self.get_slice(out.len())?;
        out.copy_from_slice(slice);
        Ok(())
    }

    pub fn get_u16_le(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.get_slice(2)?.try_into().unwrap()))
    }

    pub fn get_u32_le(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.get_slice(4)?.try_into().unwrap()))
    }

    pub fn get_i32_le(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.get_slice(4)?.try_into().unwrap()))
    }

    pub fn get_u64_le(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.get_slice(8)?.try_into().unwrap()))
    }

    fn put_slice(&mut self, num_bytes: usize) -> Result<&mut [u8]> {
        if self.capacity() - self.end < num_bytes {
            return_errno_with_msg!(UnexpectedResult, "encoded data overruns its buffer");
        }
        let slice = &mut self.data[self.end..self.end + num_bytes];
        self.end += num_bytes;
        Ok(slice)
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.put_slice(bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    pub fn put_zeros(&mut self, num_bytes: usize) -> Result<()> {
        self.put_slice(num_bytes)?.fill(0);
        Ok(())
    }

    pub fn put_u16_le(&mut self, value: u16) -> Result<()> {
        self.put_bytes(&value.to_le_bytes())
    }

    pub fn put_u32_le(&mut self, value: u32) -> Result<()> {
        self.put_bytes(&value.to_le_bytes())
    }

    pub fn put_i32_le(&mut self, value: i32) -> Result<()> {
        self.put_bytes(&value.to_le_bytes())
    }

    pub fn put_u64_le(&mut self, value: u64) -> Result<()> {
        self.put_bytes(&value.to_le_bytes())
    }

    /// Checks that a decode consumed its declared struct size exactly.
    pub fn require_drained(&self, expected_size: usize) -> Result<()> {
        if self.content_len() != 0 {
            error!(
                "{} bytes decoded of {} expected",
                expected_size.saturating_sub(self.content_len()),
                expected_size
            );
            return_errno!(CorruptData);
        }
        Ok(())
    }

    /// Checks that an encode produced its declared struct size exactly.
    pub fn require_encoded(&self, expected_size: usize) -> Result<()> {
        if self.content_len() != expected_size {
            error!(
                "{} bytes encoded of {} expected",
                self.content_len(),
                expected_size
            );
            return_errno!(UnexpectedResult);
        }
        Ok(())
    }
}
