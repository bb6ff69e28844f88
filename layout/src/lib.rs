// SPDX-License-Identifier: MPL-2.0

//! Persistent on-disk layout management for a deduplicating index.
//!
//! This crate owns the geometry of an index on a block store: the super
//! block, the saved configuration, the volume region, and a small ring of
//! save slots holding crash-consistent snapshots of the index's in-memory
//! state. The index itself (volume, volume index, open chapter) is an
//! external collaborator; the layout allocates regions for it and hands
//! it buffered readers and writers.
//!
//! All on-storage records are little-endian and byte-exact, and every
//! save is bound to its physical offset and the volume identity by a
//! nonce, so a record decoded from the wrong place or the wrong volume
//! never validates.

mod codec;
mod error;
mod nonce;
mod prelude;

mod bio;
mod config;
mod index;
mod layout;
mod page_map;

pub use self::{
    bio::{
        BLOCK_SIZE, BlockCount, BufferedReader, BufferedWriter, FileIoFactory, FileIoRegion,
        IoAccess, IoFactory, IoRegion, MemIoFactory, MemIoRegion,
    },
    config::{Geometry, IndexConfig, compute_index_size},
    error::{Errno, Error},
    index::{DedupIndex, IndexStateData},
    layout::{IndexLayout, make_layout},
    page_map::{IndexPageBounds, IndexPageMap},
};
