// SPDX-License-Identifier: MPL-2.0

use super::{
    iter::RegionIterator,
    region::{
        LayoutRegion, RL_KIND_HEADER, RL_KIND_INDEX_PAGE_MAP, RL_KIND_OPEN_CHAPTER, RL_KIND_SAVE,
        RL_KIND_SCRATCH, RL_KIND_VOLUME_INDEX, RegionTable, RH_TYPE_SAVE, SOLE_INSTANCE,
        setup_layout,
    },
    super_block::SuperBlockData,
};
use crate::{
    bio::{BufferedReader, IoRegion},
    codec::Buffer,
    nonce::{current_time_ms, generate_secondary_nonce},
    prelude::*,
};

pub(crate) const INDEX_STATE_BUFFER_SIZE: usize = 512;

/// The record binding one save slot to its moment and its place.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub(crate) struct IndexSaveData {
    /// Milliseconds since the epoch at instantiation.
    pub timestamp: u64,
    /// Secondary nonce derived from the sub-index nonce.
    pub nonce: u64,
    /// Always 1 when the slot holds a save.
    pub version: u32,
}

impl IndexSaveData {
    pub const ENCODED_SIZE: usize = 24;

    pub fn encode(&self, buffer: &mut Buffer) -> Result<()> {
        buffer.put_u64_le(self.timestamp)?;
        buffer.put_u64_le(self.nonce)?;
        buffer.put_u32_le(self.version)?;
        buffer.put_zeros(4)?;
        buffer.require_encoded(Self::ENCODED_SIZE)
    }

    pub fn decode(buffer: &mut Buffer) -> Result<Self> {
        let save_data = IndexSaveData {
            timestamp: buffer.get_u64_le()?,
            nonce: buffer.get_u64_le()?,
            version: buffer.get_u32_le()?,
        };
        buffer.skip_forward(4)?;
        buffer.require_drained(Self::ENCODED_SIZE)?;
        Ok(save_data)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub(crate) enum IndexSaveType {
    Save,
    #[default]
    NoSave,
}

/// One save slot and its sub-division.
#[derive(Default, Debug)]
pub(crate) struct IndexSaveLayout {
    /// The whole slot within the sub-index.
    pub index_save: LayoutRegion,
    pub header: LayoutRegion,
    pub num_zones: u32,
    pub index_page_map: LayoutRegion,
    pub free_space: LayoutRegion,
    pub volume_index_zones: Vec<LayoutRegion>,
    pub open_chapter: Option<LayoutRegion>,
    pub save_type: IndexSaveType,
    pub save_data: IndexSaveData,
    pub state_buffer: Option<Buffer>,
}

impl IndexSaveLayout {
    /// Lays out the slot interior for a given zone count.
    ///
    /// Zones and the open chapter are save-time parameters; the rest of
    /// the slot is scratch.
    pub fn populate(&mut self, super_block: &SuperBlockData, num_zones: u32, save_type: IndexSaveType) {
        let mut next_block = self.index_save.start_block;

        self.header = setup_layout(&mut next_block, 1, RL_KIND_HEADER, SOLE_INSTANCE);
        self.index_page_map = setup_layout(
            &mut next_block,
            super_block.page_map_blocks,
            RL_KIND_INDEX_PAGE_MAP,
            SOLE_INSTANCE,
        );

        // Sizes here may come from storage; mimic unsigned wraparound so a
        // bad table walks to a mismatch instead of a panic.
        let blocks_avail = self
            .index_save
            .num_blocks
            .wrapping_sub(next_block.wrapping_sub(self.index_save.start_block))
            .wrapping_sub(super_block.open_chapter_blocks);

        if num_zones > 0 {
            let zone_blocks = blocks_avail / u64::from(num_zones);
            for zone in 0..num_zones {
                self.volume_index_zones[zone as usize] = setup_layout(
                    &mut next_block,
                    zone_blocks,
                    RL_KIND_VOLUME_INDEX,
                    zone as u16,
                );
            }
        }

        if save_type == IndexSaveType::Save && self.open_chapter.is_some() {
            self.open_chapter = Some(setup_layout(
                &mut next_block,
                super_block.open_chapter_blocks,
                RL_KIND_OPEN_CHAPTER,
                SOLE_INSTANCE,
            ));
        }

        let free_space_blocks = self
            .index_save
            .num_blocks
            .wrapping_sub(next_block.wrapping_sub(self.index_save.start_block));
        self.free_space = setup_layout(
            &mut next_block,
            free_space_blocks,
            RL_KIND_SCRATCH,
            SOLE_INSTANCE,
        );
    }

    /// Returns the slot to its freshly-formatted state: no zones, no open
    /// chapter, no state buffer, a minimal interior of header, page map
    /// and scratch.
    pub fn reset(
        &mut self,
        next_block: &mut BlockCount,
        save_blocks: BlockCount,
        page_map_blocks: BlockCount,
        instance: u16,
    ) {
        *self = IndexSaveLayout::default();

        let mut slot_end = *next_block;
        self.index_save = setup_layout(&mut slot_end, save_blocks, RL_KIND_SAVE, instance);
        self.header = setup_layout(next_block, 1, RL_KIND_HEADER, SOLE_INSTANCE);
        self.index_page_map = setup_layout(
            next_block,
            page_map_blocks,
            RL_KIND_INDEX_PAGE_MAP,
            SOLE_INSTANCE,
        );
        let remaining = slot_end.wrapping_sub(*next_block);
        self.free_space =
            setup_layout(next_block, remaining, RL_KIND_SCRATCH, SOLE_INSTANCE);
    }

    /// Rebuilds the slot interior from a region table read from storage.
    pub fn reconstruct(
        &mut self,
        save_data: IndexSaveData,
        super_block: &SuperBlockData,
        table: &RegionTable,
    ) -> Result<()> {
        self.num_zones = 0;
        self.save_data = save_data;
        self.save_type = if table.header.region_type == RH_TYPE_SAVE {
            IndexSaveType::Save
        } else {
            IndexSaveType::NoSave
        };

        // A table holding nothing but scratch is a freshly-reset slot.
        if table.regions.is_empty()
            || (table.regions.len() == 1 && table.regions[0].kind == RL_KIND_SCRATCH)
        {
            self.populate(super_block, 0, IndexSaveType::NoSave);
            return Ok(());
        }

        let mut iter = RegionIterator::new(&table.regions, self.index_save.start_block);

        if let Some(region) = iter.expect(true, 1, RL_KIND_HEADER, SOLE_INSTANCE) {
            self.header = region;
        }
        if let Some(region) = iter.expect(true, 0, RL_KIND_INDEX_PAGE_MAP, SOLE_INSTANCE) {
            self.index_page_map = region;
        }

        let mut probe = iter.clone();
        let mut num_zones: u32 = 0;
        while probe
            .expect(false, 0, RL_KIND_VOLUME_INDEX, num_zones as u16)
            .is_some()
        {
            num_zones += 1;
        }
        self.num_zones = num_zones;
        if num_zones > 0 {
            self.volume_index_zones = vec![LayoutRegion::default(); num_zones as usize];
        }
        if self.save_type == IndexSaveType::Save {
            self.open_chapter = Some(LayoutRegion::default());
        }

        for zone in 0..num_zones {
            if let Some(region) = iter.expect(true, 0, RL_KIND_VOLUME_INDEX, zone as u16) {
                self.volume_index_zones[zone as usize] = region;
            }
        }
        if self.save_type == IndexSaveType::Save
            && let Some(region) = iter.expect(true, 0, RL_KIND_OPEN_CHAPTER, SOLE_INSTANCE)
        {
            self.open_chapter = Some(region);
        }

        let slot_end = self
            .index_save
            .start_block
            .wrapping_add(self.index_save.num_blocks);
        match iter.expect(false, 0, RL_KIND_SCRATCH, SOLE_INSTANCE) {
            Some(region) => self.free_space = region,
            None if iter.result().is_ok() => {
                self.free_space = LayoutRegion {
                    start_block: iter.next_block(),
                    num_blocks: slot_end.wrapping_sub(iter.next_block()),
                    checksum: 0,
                    kind: RL_KIND_SCRATCH,
                    instance: SOLE_INSTANCE,
                };
                iter.set_next_block(slot_end);
            }
            None => {}
        }

        iter.result()?;
        if iter.has_remaining_regions() {
            return_errno_with_msg!(UnexpectedResult, "unexpected additional regions in save");
        }
        if iter.next_block() != slot_end {
            return_errno_with_msg!(UnexpectedResult, "index save layout table incomplete");
        }
        Ok(())
    }

    /// Derives the nonce binding this save to its place and moment.
    ///
    /// The payload covers the save data with a zeroed nonce field,
    /// followed by the slot's start block.
    pub fn generate_save_nonce(&self, volume_nonce: u64) -> u64 {
        let mut buffer = [0u8; 32];
        buffer[..8].copy_from_slice(&self.save_data.timestamp.to_le_bytes());
        // Bytes 8..16 hold the zeroed nonce field.
        buffer[16..20].copy_from_slice(&self.save_data.version.to_le_bytes());
        // Bytes 20..24 hold the record padding.
        buffer[24..32].copy_from_slice(&self.index_save.start_block.to_le_bytes());
        generate_secondary_nonce(volume_nonce, &buffer)
    }

    /// Checks the slot's validity predicate, returning its save time.
    pub fn validate(&self, volume_nonce: u64) -> Result<u64> {
        if self.save_type != IndexSaveType::Save
            || self.num_zones == 0
            || self.save_data.timestamp == 0
        {
            return_errno!(BadState);
        }
        if self.save_data.nonce != self.generate_save_nonce(volume_nonce) {
            return_errno!(BadState);
        }
        Ok(self.save_data.timestamp)
    }

    /// Prepares the slot to receive a new save.
    pub fn instantiate(
        &mut self,
        super_block: &SuperBlockData,
        volume_nonce: u64,
        num_zones: u32,
    ) {
        if self.open_chapter.is_none() {
            self.open_chapter = Some(LayoutRegion::default());
        }
        if num_zones != self.num_zones {
            self.volume_index_zones = vec![LayoutRegion::default(); num_zones as usize];
            self.num_zones = num_zones;
        }

        self.populate(super_block, num_zones, IndexSaveType::Save);

        self.state_buffer = Some(Buffer::new(INDEX_STATE_BUFFER_SIZE));
        self.save_type = IndexSaveType::Save;
        self.save_data = IndexSaveData {
            timestamp: current_time_ms(),
            nonce: 0,
            version: 1,
        };
        self.save_data.nonce = self.generate_save_nonce(volume_nonce);
    }

    /// Abandons the in-memory save without touching storage.
    pub fn mutilate(&mut self) {
        self.save_data = IndexSaveData::default();
        self.save_type = IndexSaveType::NoSave;
        self.num_zones = 0;
        self.state_buffer = None;
    }

    /// Collects the slot's interior regions for its header table.
    pub fn make_region_table(&self) -> Vec<LayoutRegion> {
        let mut regions = Vec::with_capacity(4 + self.num_zones as usize);
        regions.push(self.header);
        regions.push(self.index_page_map);
        regions.extend_from_slice(&self.volume_index_zones[..self.num_zones as usize]);
        if let Some(open_chapter) = self.open_chapter {
            regions.push(open_chapter);
        }
        if self.free_space.num_blocks > 0 {
            regions.push(self.free_space);
        }
        regions
    }
}

/// Reads the save data record and state payload that trail a slot's
/// region table.
pub(crate) fn read_index_save_data<R: IoRegion>(
    reader: &mut BufferedReader<R>,
    mut saved_size: usize,
) -> Result<(IndexSaveData, Option<Buffer>)> {
    let mut save_data = IndexSaveData::default();

    if saved_size > 0 {
        if saved_size < IndexSaveData::ENCODED_SIZE {
            error!("unexpected index save data size {saved_size}");
            return_errno!(CorruptData);
        }

        let mut bytes = vec![0; IndexSaveData::ENCODED_SIZE];
        reader.read_exact(&mut bytes).inspect_err(|_| {
            error!("cannot read index save data");
        })?;
        save_data = IndexSaveData::decode(&mut Buffer::wrap(bytes))?;
        saved_size -= IndexSaveData::ENCODED_SIZE;

        if save_data.version > 1 {
            error!("unknown index save version number {}", save_data.version);
            return_errno!(UnsupportedVersion);
        }
        if saved_size > INDEX_STATE_BUFFER_SIZE {
            error!("unexpected index state buffer size {saved_size}");
            return_errno!(CorruptData);
        }
    }

    if save_data.version == 0 {
        return Ok((save_data, None));
    }

    let mut state_buffer = Buffer::new(INDEX_STATE_BUFFER_SIZE);
    if saved_size > 0 {
        let mut bytes = vec![0; saved_size];
        reader.read_exact(&mut bytes)?;
        state_buffer.load_contents(&bytes)?;
    }
    Ok((save_data, Some(state_buffer)))
}

/// Picks the slot to overwrite: the oldest valid one, with any invalid
/// slot counting as older than every valid one.
pub(crate) fn select_oldest_slot(
    saves: &[IndexSaveLayout],
    volume_nonce: u64,
) -> Result<usize> {
    let mut oldest: Option<usize> = None;
    let mut oldest_time = 0;

    for (slot, save) in saves.iter().enumerate() {
        let save_time = save.validate(volume_nonce).unwrap_or(0);
        if oldest.is_none() || save_time < oldest_time {
            oldest = Some(slot);
            oldest_time = save_time;
        }
    }

    match oldest {
        Some(slot) => Ok(slot),
        None => Err(Error::with_msg(
            UnexpectedResult,
            "no oldest or free save slot",
        )),
    }
}

/// Picks the newest valid slot, the one a load must read.
pub(crate) fn select_latest_slot(
    saves: &[IndexSaveLayout],
    volume_nonce: u64,
) -> Result<usize> {
    let mut latest: Option<usize> = None;
    let mut latest_time = 0;

    for (slot, save) in saves.iter().enumerate() {
        let Ok(save_time) = save.validate(volume_nonce) else {
            continue;
        };
        if save_time > latest_time {
            latest = Some(slot);
            latest_time = save_time;
        }
    }

    match latest {
        Some(slot) => Ok(slot),
        None => {
            error!("no valid index save found");
            return_errno!(IndexNotSavedCleanly);
        }
    }
}
