// SPDX-License-Identifier: MPL-2.0

//! The index page map.
//!
//! Each volume maintains an index page map which records how the chapter
//! delta lists are distributed among the index pages for that chapter.
//!
//! The map is conceptually a two-dimensional array indexed by chapter
//! number and index page number within the chapter. Each entry contains
//! the number of the last delta list on that index page. The information
//! for the last page in each chapter is not recorded, as it is known from
//! the geometry.

use crate::{
    bio::{BufferedReader, BufferedWriter, IoRegion},
    codec::Buffer,
    config::Geometry,
    prelude::*,
};

const PAGE_MAP_MAGIC: &[u8; 8] = b"ALBIPM02";

type Entry = u16;

fn num_entries(geometry: &Geometry) -> usize {
    geometry.chapters_per_volume as usize
        * (geometry.index_pages_per_chapter as usize).saturating_sub(1)
}

fn entries_size(geometry: &Geometry) -> u64 {
    (size_of::<Entry>() * num_entries(geometry)) as u64
}

/// The number of bytes a saved index page map occupies.
pub(crate) fn compute_save_size(geometry: &Geometry) -> u64 {
    PAGE_MAP_MAGIC.len() as u64 + size_of::<u64>() as u64 + entries_size(geometry)
}

/// The lowest and highest delta list found on one index page.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct IndexPageBounds {
    pub lowest_list: u32,
    pub highest_list: u32,
}

pub struct IndexPageMap {
    geometry: Geometry,
    entries: Vec<Entry>,
    last_update: u64,
}

impl IndexPageMap {
    pub fn new(geometry: &Geometry) -> Result<Self> {
        if geometry.index_pages_per_chapter == 0 || geometry.delta_lists_per_chapter == 0 {
            return_errno_with_msg!(
                InvalidArgs,
                "a chapter must hold at least one index page and delta list"
            );
        }
        if geometry.delta_lists_per_chapter - 1 > u16::MAX.into() {
            error!(
                "delta lists per chapter ({}) is too large",
                geometry.delta_lists_per_chapter
            );
            return_errno!(BadState);
        }

        Ok(IndexPageMap {
            geometry: geometry.clone(),
            entries: vec![0; num_entries(geometry)],
            last_update: 0,
        })
    }

    /// The virtual chapter of the most recent update.
    pub fn last_update(&self) -> u64 {
        self.last_update
    }

    /// Records that an index page ends with the given delta list.
    pub fn update(
        &mut self,
        virtual_chapter_number: u64,
        chapter_number: u32,
        index_page_number: u32,
        delta_list_number: u32,
    ) -> Result<()> {
        let geometry = &self.geometry;
        if virtual_chapter_number < self.last_update || virtual_chapter_number > self.last_update + 1
        {
            // When replaying the volume, the last update will be 0.
            if self.last_update != 0 {
                warn!(
                    "unexpected index page map update, jumping from {} to {}",
                    self.last_update, virtual_chapter_number
                );
            }
        }
        self.last_update = virtual_chapter_number;

        if chapter_number >= geometry.chapters_per_volume {
            error!(
                "chapter number {chapter_number} exceeds maximum {}",
                geometry.chapters_per_volume - 1
            );
            return_errno!(InvalidArgs);
        }
        if index_page_number >= geometry.index_pages_per_chapter {
            error!(
                "index page number {index_page_number} exceeds maximum {}",
                geometry.index_pages_per_chapter - 1
            );
            return_errno!(InvalidArgs);
        }
        if delta_list_number >= geometry.delta_lists_per_chapter {
            error!(
                "delta list number {delta_list_number} exceeds maximum {}",
                geometry.delta_lists_per_chapter - 1
            );
            return_errno!(InvalidArgs);
        }

        if index_page_number == geometry.index_pages_per_chapter - 1 {
            return Ok(());
        }

        let slot = (chapter_number * (geometry.index_pages_per_chapter - 1) + index_page_number)
            as usize;
        self.entries[slot] = delta_list_number as Entry;
        Ok(())
    }

    /// Finds the index page within a chapter that holds a delta list.
    pub fn find_index_page_number(
        &self,
        delta_list_number: u32,
        chapter_number: u32,
    ) -> Result<u32> {
        let geometry = &self.geometry;
        if chapter_number >= geometry.chapters_per_volume {
            error!(
                "chapter number {chapter_number} exceeds maximum {}",
                geometry.chapters_per_volume - 1
            );
            return_errno!(InvalidArgs);
        }

        let slot = (chapter_number * (geometry.index_pages_per_chapter - 1)) as usize;
        let limit = slot + (geometry.index_pages_per_chapter - 1) as usize;
        let mut index_page_number = 0;
        for slot in slot..limit {
            if delta_list_number <= self.entries[slot].into() {
                break;
            }
            index_page_number += 1;
        }

        if index_page_number >= geometry.index_pages_per_chapter {
            return_errno_with_msg!(UnexpectedResult, "index page number too large");
        }
        Ok(index_page_number)
    }

    /// The range of delta lists found on one index page.
    pub fn get_list_number_bounds(
        &self,
        chapter_number: u32,
        index_page_number: u32,
    ) -> Result<IndexPageBounds> {
        let geometry = &self.geometry;
        if chapter_number >= geometry.chapters_per_volume {
            return_errno_with_msg!(InvalidArgs, "chapter number is out of range");
        }
        if index_page_number >= geometry.index_pages_per_chapter {
            return_errno_with_msg!(InvalidArgs, "index page number is out of range");
        }

        let slot = (chapter_number * (geometry.index_pages_per_chapter - 1)) as usize;
        let lowest_list = if index_page_number == 0 {
            0
        } else {
            u32::from(self.entries[slot + index_page_number as usize - 1]) + 1
        };
        let highest_list = if index_page_number == geometry.index_pages_per_chapter - 1 {
            geometry.delta_lists_per_chapter - 1
        } else {
            self.entries[slot + index_page_number as usize].into()
        };

        Ok(IndexPageBounds {
            lowest_list,
            highest_list,
        })
    }

    /// Saves the map through a writer opened on its layout region.
    pub fn write_to<R: IoRegion>(&self, writer: &mut BufferedWriter<R>) -> Result<()> {
        let mut buffer = Buffer::new(8 + entries_size(&self.geometry) as usize);
        buffer.put_u64_le(self.last_update)?;
        for entry in &self.entries {
            buffer.put_u16_le(*entry)?;
        }

        writer.write_all(PAGE_MAP_MAGIC)?;
        writer.write_all(buffer.contents())?;
        writer.flush().inspect_err(|_| {
            error!("cannot flush index page map data");
        })
    }

    /// Restores the map through a reader opened on its layout region.
    pub fn read_from<R: IoRegion>(&mut self, reader: &mut BufferedReader<R>) -> Result<()> {
        reader.verify(PAGE_MAP_MAGIC).inspect_err(|_| {
            error!("bad index page map saved magic");
        })?;

        let mut bytes = vec![0; 8 + entries_size(&self.geometry) as usize];
        reader.read_exact(&mut bytes).inspect_err(|_| {
            error!("cannot read index page map data");
        })?;

        let mut buffer = Buffer::wrap(bytes);
        self.last_update = buffer.get_u64_le()?;
        for entry in &mut self.entries {
            *entry = buffer.get_u16_le()?;
        }
        buffer.require_drained(8 + entries_size(&self.geometry) as usize)?;

        debug!("read index page map, last update {}", self.last_update);
        Ok(())
    }
}
