// SPDX-License-Identifier: MPL-2.0

//! The seam between the layout and the deduplication index it serves.
//!
//! The layout owns regions and hands out readers and writers; the index
//! owns the bytes that flow through them. When a save hands out several
//! volume index writers, each zone worker owns one exclusively.

use crate::{
    bio::{BufferedReader, BufferedWriter, IoRegion},
    prelude::*,
};

/// The numbers a clean shutdown must preserve for the index.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct IndexStateData {
    pub newest_chapter: u64,
    pub oldest_chapter: u64,
    pub last_save: u64,
}

/// The deduplication index, as the layout sees it.
///
/// The layout drives these hooks during `save_index_state` and
/// `load_index_state`; each hook receives handles opened on the regions
/// allocated for that component and must consume or produce its own byte
/// format. The `writers`/`readers` slices hold one handle per zone.
pub trait DedupIndex {
    fn zone_count(&self) -> u32;

    fn state(&self) -> IndexStateData;

    fn restore_state(&mut self, state: IndexStateData);

    fn save_open_chapter<R: IoRegion>(&mut self, writer: &mut BufferedWriter<R>) -> Result<()>;

    fn load_open_chapter<R: IoRegion>(&mut self, reader: &mut BufferedReader<R>) -> Result<()>;

    fn save_volume_index<R: IoRegion>(&mut self, writers: &mut [BufferedWriter<R>]) -> Result<()>;

    fn load_volume_index<R: IoRegion>(&mut self, readers: &mut [BufferedReader<R>]) -> Result<()>;

    fn save_index_page_map<R: IoRegion>(&mut self, writer: &mut BufferedWriter<R>) -> Result<()>;

    fn load_index_page_map<R: IoRegion>(&mut self, reader: &mut BufferedReader<R>) -> Result<()>;
}
