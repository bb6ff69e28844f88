// SPDX-License-Identifier: MPL-2.0

//! The block I/O facade over a named backing store.

mod buffered;
mod factory;

pub use self::{
    buffered::{BufferedReader, BufferedWriter},
    factory::{FileIoFactory, FileIoRegion, IoAccess, IoFactory, IoRegion, MemIoFactory, MemIoRegion},
};

pub type BlockCount = u64;

pub const BLOCK_SIZE: usize = 0x1000;
