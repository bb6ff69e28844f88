// SPDX-License-Identifier: MPL-2.0

//! The on-disk layout of a deduplication index.
//!
//! A layout divides its backing store into fixed-size regions, sized when
//! the index is created. Every region begins on a block boundary. Save
//! regions are further sub-divided into regions of their own.
//!
//! Each region has a kind and an instance number. Kinds that only ever
//! have one instance use the sole-instance number. The save slots use
//! instances to tell slots apart, and the volume index regions within a
//! save use instances to record which zone was saved.
//!
//! ```text
//!     +-+-+--------+--------+--------+-----+---  -+-+
//!     | | |   s u b - i n d e x              ...  | |
//!     |H|C+--------+--------+--------+-----+---  -+S|
//!     |D|f| volume | save   | save   |     |      |e|
//!     |R|g| region | slot 0 | slot 1 | ... | ...  |a|
//!     | | |        |        |        |     |      |l|
//!     +-+-+--------+--------+--------+-----+---  -+-+
//! ```
//!
//! The header block holds the encoded region table and the super block
//! data; the config block holds the saved index configuration. There are
//! at least two save slots so that an incomplete save can never take the
//! last good state with it; slots are reused oldest-first, round-robin.
//!
//! Anatomy of a save slot:
//!
//! ```text
//!     +-+-----+------+------+-----+   -+-----+
//!     |H| IPM | VI   | VI   |     |    | OC  |
//!     |D|     | zone | zone | ... |    |     |
//!     |R|     | 0    | 1    |     |    |     |
//!     +-+-----+------+------+-----+   -+-----+
//! ```
//!
//! A slot's header block holds its own region table, the save data record
//! and the index state for that save. Each save carries a nonce derived
//! from the sub-index nonce, binding the record to this volume and this
//! slot.

mod iter;
mod region;
mod save;
mod super_block;

use self::{
    iter::RegionIterator,
    region::{
        LayoutRegion, RL_KIND_CONFIG, RL_KIND_HEADER, RL_KIND_INDEX, RL_KIND_INDEX_PAGE_MAP,
        RL_KIND_OPEN_CHAPTER, RL_KIND_SAVE, RL_KIND_SEAL, RL_KIND_VOLUME, RL_KIND_VOLUME_INDEX,
        REGION_HEADER_VERSION, REGION_MAGIC, RegionHeader, RegionTable, RH_TYPE_SAVE,
        RH_TYPE_SUPER, RH_TYPE_UNSAVED, SOLE_INSTANCE, load_region_table, setup_layout,
    },
    save::{
        IndexSaveData, IndexSaveLayout, IndexSaveType, read_index_save_data, select_latest_slot,
        select_oldest_slot,
    },
    super_block::SuperBlockData,
};
use crate::{
    bio::{BufferedReader, BufferedWriter, FileIoFactory, IoAccess, IoFactory},
    codec::Buffer,
    config::{self, Geometry, IndexConfig, SaveLayoutSizes, compute_sizes},
    index::{DedupIndex, IndexStateData},
    nonce::generate_secondary_nonce,
    prelude::*,
};

const INDEX_STATE_SIGNATURE: i32 = -1;
const INDEX_STATE_VERSION_ID: i32 = 301;

/// The single sub-index a layout holds, and its save slots.
#[derive(Default, Debug)]
struct SubIndexLayout {
    sub_index: LayoutRegion,
    /// The volume nonce all saves of this sub-index are bound to.
    nonce: u64,
    volume: LayoutRegion,
    saves: Vec<IndexSaveLayout>,
}

/// The persistent geometry of one deduplication index on one store.
#[derive(Debug)]
pub struct IndexLayout<F: IoFactory> {
    factory: F,
    /// Byte offset of the first block of the layout.
    offset: u64,
    super_block: SuperBlockData,
    header: LayoutRegion,
    config: LayoutRegion,
    index: SubIndexLayout,
    seal: LayoutRegion,
    total_blocks: BlockCount,
}

/// Opens a layout over a file or device named by the configuration,
/// creating a fresh layout or loading a saved one.
pub fn make_layout(config: &IndexConfig, new_layout: bool) -> Result<IndexLayout<FileIoFactory>> {
    let access = if new_layout {
        IoAccess::CreateReadWrite
    } else {
        IoAccess::ReadWrite
    };
    let factory = FileIoFactory::open(&config.name, access)?;
    if new_layout {
        let sizes = compute_sizes(config)?;
        factory.set_writable_size(config.offset + config.size.max(sizes.total_size))?;
        IndexLayout::create(factory, config)
    } else {
        IndexLayout::load(factory, config)
    }
}

impl<F: IoFactory> IndexLayout<F> {
    /// Creates a fresh layout on the factory's store and persists it.
    pub fn create(factory: F, config: &IndexConfig) -> Result<Self> {
        let sizes = compute_sizes(config)?;
        let mut layout = Self::new_empty(factory, config, &sizes)?;
        layout.init_single_file_layout(&sizes)?;
        layout.save_sub_index_regions()?;
        layout.save_single_file_layout(0)?;
        layout.write_index_config(&config.geometry, 0)?;
        info!("created index layout of {} blocks", layout.total_blocks);
        Ok(layout)
    }

    /// Loads the layout saved on the factory's store.
    pub fn load(factory: F, config: &IndexConfig) -> Result<Self> {
        let sizes = compute_sizes(config)?;
        let mut layout = Self::new_empty(factory, config, &sizes)?;
        layout.load_index_layout(config)?;
        Ok(layout)
    }

    fn new_empty(factory: F, config: &IndexConfig, sizes: &SaveLayoutSizes) -> Result<Self> {
        let writable_size = factory.writable_size()? & !(BLOCK_SIZE as u64 - 1);
        if writable_size < config.size + config.offset {
            error!(
                "index storage ({writable_size}) is smaller than the requested size {}",
                config.size + config.offset
            );
            return_errno!(NoSpace);
        }

        let factory_size = if config.size > 0 {
            config.size
        } else {
            writable_size
        };
        if factory_size < sizes.total_size {
            error!(
                "index storage ({factory_size}) is smaller than the required size {}",
                sizes.total_size
            );
            return_errno!(NoSpace);
        }

        Ok(IndexLayout {
            factory,
            offset: config.offset,
            super_block: SuperBlockData::default(),
            header: LayoutRegion::default(),
            config: LayoutRegion::default(),
            index: SubIndexLayout::default(),
            seal: LayoutRegion::default(),
            total_blocks: 0,
        })
    }

    /// The nonce binding saves to this volume.
    pub fn volume_nonce(&self) -> u64 {
        self.index.nonce
    }

    /// Opens a region over the whole volume for the index to use.
    pub fn open_volume_region(&self) -> Result<F::Region> {
        let volume = &self.index.volume;
        let start = (volume.start_block + self.super_block.volume_offset
            - self.super_block.start_offset)
            * BLOCK_SIZE as u64;
        let size = volume.num_blocks * BLOCK_SIZE as u64;
        self.factory.open_region(start, size).inspect_err(|_| {
            error!("cannot access index volume region");
        })
    }

    /// Swaps the backing store, retaining the in-memory layout.
    pub fn replace_storage(&self, name: &str) -> Result<()> {
        self.factory.replace_storage(name)
    }

    fn open_layout_reader(
        &self,
        region: &LayoutRegion,
        offset_blocks: i64,
    ) -> Result<BufferedReader<F::Region>> {
        let start = (region.start_block as i64 + offset_blocks) as u64 * BLOCK_SIZE as u64;
        let size = region.num_blocks * BLOCK_SIZE as u64;
        Ok(BufferedReader::new(self.factory.open_region(start, size)?))
    }

    fn open_layout_writer(
        &self,
        region: &LayoutRegion,
        offset_blocks: i64,
    ) -> Result<BufferedWriter<F::Region>> {
        let start = (region.start_block as i64 + offset_blocks) as u64 * BLOCK_SIZE as u64;
        let size = region.num_blocks * BLOCK_SIZE as u64;
        Ok(BufferedWriter::new(self.factory.open_region(start, size)?))
    }

    fn define_sub_index_nonce(&mut self, index_id: u16) {
        let primary_nonce = self.super_block.nonce;
        let mut buffer = [0u8; 10];
        buffer[..8].copy_from_slice(&self.index.sub_index.start_block.to_le_bytes());
        buffer[8..].copy_from_slice(&index_id.to_le_bytes());

        let mut nonce = generate_secondary_nonce(primary_nonce, &buffer);
        if nonce == 0 {
            // Zero means "unset" downstream, so derive a non-zero one.
            nonce = generate_secondary_nonce((!primary_nonce).wrapping_add(1), &buffer);
        }
        self.index.nonce = nonce;
    }

    fn init_single_file_layout(&mut self, sizes: &SaveLayoutSizes) -> Result<()> {
        self.total_blocks = sizes.total_blocks;
        self.super_block = SuperBlockData::generate(
            sizes.block_size as u32,
            sizes.num_saves,
            sizes.open_chapter_blocks,
            sizes.page_map_blocks,
        );
        self.index.saves = (0..self.super_block.max_saves)
            .map(|_| IndexSaveLayout::default())
            .collect();

        let mut next_block = self.offset / BLOCK_SIZE as u64;
        self.header = setup_layout(&mut next_block, 1, RL_KIND_HEADER, SOLE_INSTANCE);
        self.config = setup_layout(&mut next_block, 1, RL_KIND_CONFIG, SOLE_INSTANCE);
        self.setup_sub_index(&mut next_block, sizes, 0)?;
        self.seal = setup_layout(&mut next_block, 1, RL_KIND_SEAL, SOLE_INSTANCE);

        if next_block * BLOCK_SIZE as u64 > self.offset + sizes.total_size {
            return_errno_with_msg!(UnexpectedResult, "layout does not fit as expected");
        }
        Ok(())
    }

    fn setup_sub_index(
        &mut self,
        next_block: &mut BlockCount,
        sizes: &SaveLayoutSizes,
        instance: u16,
    ) -> Result<()> {
        let mut sub_index_end = *next_block;
        self.index.sub_index = setup_layout(
            &mut sub_index_end,
            sizes.sub_index_blocks,
            RL_KIND_INDEX,
            instance,
        );
        self.index.volume =
            setup_layout(next_block, sizes.volume_blocks, RL_KIND_VOLUME, SOLE_INSTANCE);

        for slot in 0..sizes.num_saves {
            self.index.saves[slot as usize].reset(
                next_block,
                sizes.save_blocks,
                sizes.page_map_blocks,
                slot,
            );
        }

        if sub_index_end != *next_block {
            return_errno_with_msg!(UnexpectedResult, "sub index layout regions do not agree");
        }

        self.define_sub_index_nonce(instance);
        Ok(())
    }

    /// Writes the slot's header block: its region table, save data and
    /// state payload.
    fn write_index_save_layout(&mut self, slot: usize) -> Result<()> {
        let save = &self.index.saves[slot];
        let regions = save.make_region_table();
        let payload = IndexSaveData::ENCODED_SIZE
            + save
                .state_buffer
                .as_ref()
                .map_or(0, |buffer| buffer.content_len());
        let table = RegionTable {
            header: RegionHeader {
                magic: REGION_MAGIC,
                region_blocks: save.index_save.num_blocks,
                region_type: match save.save_type {
                    IndexSaveType::Save => RH_TYPE_SAVE,
                    IndexSaveType::NoSave => RH_TYPE_UNSAVED,
                },
                version: REGION_HEADER_VERSION,
                num_regions: regions.len() as u16,
                payload: payload as u16,
            },
            regions,
        };

        let header_region = save.header;
        let mut writer =
            self.open_layout_writer(&header_region, -(self.super_block.start_offset as i64))?;
        self.write_index_save_header(slot, &table, &mut writer)
    }

    fn write_index_save_header(
        &self,
        slot: usize,
        table: &RegionTable,
        writer: &mut BufferedWriter<F::Region>,
    ) -> Result<()> {
        writer.write_all(table.encode()?.contents())?;

        let save = &self.index.saves[slot];
        let mut buffer = Buffer::new(IndexSaveData::ENCODED_SIZE);
        save.save_data.encode(&mut buffer)?;
        writer.write_all(buffer.contents())?;

        if let Some(state_buffer) = &save.state_buffer {
            writer.write_all(state_buffer.contents())?;
        }
        writer.flush()
    }

    fn save_sub_index_regions(&mut self) -> Result<()> {
        for slot in 0..self.index.saves.len() {
            self.write_index_save_layout(slot).inspect_err(|_| {
                error!("unable to format index save {slot} layout");
            })?;
        }
        Ok(())
    }

    fn make_single_file_region_table(&self) -> RegionTable {
        let mut regions = Vec::with_capacity(5 + self.index.saves.len());
        regions.push(self.header);
        regions.push(self.config);
        regions.push(self.index.sub_index);
        regions.push(self.index.volume);
        for save in &self.index.saves {
            regions.push(save.index_save);
        }
        regions.push(self.seal);

        RegionTable {
            header: RegionHeader {
                magic: REGION_MAGIC,
                region_blocks: self.total_blocks,
                region_type: RH_TYPE_SUPER,
                version: REGION_HEADER_VERSION,
                num_regions: regions.len() as u16,
                payload: self.super_block.encoded_size() as u16,
            },
            regions,
        }
    }

    /// Writes the outer region table and super block data.
    fn save_single_file_layout(&self, offset_blocks: i64) -> Result<()> {
        let table = self.make_single_file_region_table();
        let mut writer = self.open_layout_writer(&self.header, offset_blocks)?;

        writer.write_all(table.encode()?.contents())?;

        let mut buffer = Buffer::new(self.super_block.encoded_size());
        self.super_block.encode(&mut buffer)?;
        writer.write_all(buffer.contents())?;
        writer.flush()
    }

    fn write_index_config(&self, geometry: &Geometry, offset_blocks: i64) -> Result<()> {
        let mut writer = self
            .open_layout_writer(&self.config, offset_blocks)
            .inspect_err(|_| error!("failed to open config region"))?;
        config::write_config(&mut writer, geometry)
            .inspect_err(|_| error!("failed to write config region"))?;
        writer
            .flush()
            .inspect_err(|_| error!("cannot flush config writer"))
    }

    fn load_index_layout(&mut self, config: &IndexConfig) -> Result<()> {
        let mut reader = BufferedReader::new(
            self.factory
                .open_region(self.offset, BLOCK_SIZE as u64)
                .inspect_err(|_| error!("unable to read superblock"))?,
        );
        self.load_super_block(
            BLOCK_SIZE as u32,
            self.offset / BLOCK_SIZE as u64,
            &mut reader,
        )?;
        self.load_sub_index_regions()?;
        self.verify_index_config(config)
    }

    fn load_super_block(
        &mut self,
        block_size: u32,
        first_block: BlockCount,
        reader: &mut BufferedReader<F::Region>,
    ) -> Result<()> {
        let table = load_region_table(reader)?;
        if table.header.region_type != RH_TYPE_SUPER {
            return_errno_with_msg!(CorruptData, "not a superblock region table");
        }

        let mut payload = vec![0; table.header.payload as usize];
        reader
            .read_exact(&mut payload)
            .inspect_err(|_| error!("cannot read superblock data"))?;
        let super_block = SuperBlockData::decode(&mut Buffer::wrap(payload))
            .inspect_err(|_| error!("unknown superblock format"))?;
        super_block.validate(block_size)?;

        self.super_block = super_block;
        self.index.saves = (0..self.super_block.max_saves)
            .map(|_| IndexSaveLayout::default())
            .collect();

        let first_block = first_block
            .wrapping_sub(self.super_block.volume_offset - self.super_block.start_offset);
        self.reconstitute_single_file_layout(&table, first_block)
    }

    /// Rebuilds the in-memory layout from the region table and super block
    /// read from storage.
    fn reconstitute_single_file_layout(
        &mut self,
        table: &RegionTable,
        first_block: BlockCount,
    ) -> Result<()> {
        self.total_blocks = table.header.region_blocks;

        let mut iter = RegionIterator::new(&table.regions, first_block);
        if let Some(region) = iter.expect(true, 1, RL_KIND_HEADER, SOLE_INSTANCE) {
            self.header = region;
        }
        if let Some(region) = iter.expect(true, 1, RL_KIND_CONFIG, SOLE_INSTANCE) {
            self.config = region;
        }
        self.expect_sub_index(&mut iter, 0);
        if let Some(region) = iter.expect(true, 1, RL_KIND_SEAL, SOLE_INSTANCE) {
            self.seal = region;
        }
        iter.result()?;

        if iter.next_block().wrapping_sub(self.super_block.volume_offset)
            != first_block.wrapping_add(self.total_blocks)
        {
            return_errno_with_msg!(UnexpectedResult, "layout table does not span total blocks");
        }
        Ok(())
    }

    fn expect_sub_index(&mut self, iter: &mut RegionIterator<'_>, instance: u16) {
        if iter.result().is_err() {
            return;
        }

        let start_block = iter.next_block();
        if let Some(region) = iter.expect(true, 0, RL_KIND_INDEX, instance) {
            self.index.sub_index = region;
        }
        let end_block = iter.next_block();
        iter.set_next_block(start_block);

        if let Some(region) = iter.expect(true, 0, RL_KIND_VOLUME, SOLE_INSTANCE) {
            self.index.volume = region;
        }

        // A converted volume sits further out than its region records.
        iter.advance_block(self.super_block.volume_offset);
        let end_block = end_block.wrapping_add(self.super_block.volume_offset);

        for slot in 0..self.super_block.max_saves {
            if let Some(region) = iter.expect(true, 0, RL_KIND_SAVE, slot) {
                self.index.saves[slot as usize].index_save = region;
            }
        }

        if iter.next_block() != end_block {
            iter.record_error("sub index region does not span all saves");
        }

        self.define_sub_index_nonce(instance);
    }

    fn load_sub_index_regions(&mut self) -> Result<()> {
        for slot in 0..self.index.saves.len() {
            let save_region = self.index.saves[slot].index_save;
            let mut reader = self
                .open_layout_reader(&save_region, -(self.super_block.start_offset as i64))
                .inspect_err(|_| error!("cannot get reader for index save {slot}"))?;
            self.load_index_save(slot, &mut reader)?;
        }
        Ok(())
    }

    fn load_index_save(
        &mut self,
        slot: usize,
        reader: &mut BufferedReader<F::Region>,
    ) -> Result<()> {
        let table = load_region_table(reader)
            .inspect_err(|_| error!("cannot read index save {slot} header"))?;

        if table.header.region_blocks != self.index.saves[slot].index_save.num_blocks {
            error!(
                "unexpected index save {slot} region block count {}",
                table.header.region_blocks
            );
            return_errno!(CorruptData);
        }
        if table.header.region_type != RH_TYPE_SAVE && table.header.region_type != RH_TYPE_UNSAVED {
            error!(
                "unexpected index save {slot} header type {}",
                table.header.region_type
            );
            return_errno!(CorruptData);
        }

        let (save_data, state_buffer) =
            read_index_save_data(reader, table.header.payload as usize)
                .inspect_err(|_| error!("unknown index save {slot} data format"))?;

        let save = &mut self.index.saves[slot];
        save.state_buffer = state_buffer;
        if let Err(err) = save.reconstruct(save_data, &self.super_block, &table) {
            save.state_buffer = None;
            error!("cannot reconstruct index save {slot}");
            return Err(err);
        }
        Ok(())
    }

    fn verify_index_config(&self, config: &IndexConfig) -> Result<()> {
        let offset_blocks =
            (self.super_block.volume_offset - self.super_block.start_offset) as i64;
        let mut reader = self
            .open_layout_reader(&self.config, offset_blocks)
            .inspect_err(|_| error!("failed to open config reader"))?;
        config::verify_config(&mut reader, &config.geometry)
            .inspect_err(|_| error!("failed to read config region"))
    }

    fn find_layout_region(&self, slot: usize, kind: u16, zone: u32) -> Result<LayoutRegion> {
        let save = &self.index.saves[slot];
        match kind {
            RL_KIND_INDEX_PAGE_MAP => Ok(save.index_page_map),
            RL_KIND_OPEN_CHAPTER => save.open_chapter.ok_or_else(|| {
                error!("save slot {slot} has no open chapter");
                Error::new(UnexpectedResult)
            }),
            RL_KIND_VOLUME_INDEX => {
                if zone >= save.num_zones {
                    error!("save slot {slot} has no volume index zone {zone}");
                    return_errno!(UnexpectedResult);
                }
                Ok(save.volume_index_zones[zone as usize])
            }
            _ => {
                error!("unexpected region kind {kind}");
                return_errno!(InvalidArgs);
            }
        }
    }

    fn open_save_region_reader(
        &self,
        slot: usize,
        kind: u16,
        zone: u32,
    ) -> Result<BufferedReader<F::Region>> {
        let region = self.find_layout_region(slot, kind, zone)?;
        self.open_layout_reader(&region, -(self.super_block.start_offset as i64))
    }

    fn open_save_region_writer(
        &self,
        slot: usize,
        kind: u16,
        zone: u32,
    ) -> Result<BufferedWriter<F::Region>> {
        let region = self.find_layout_region(slot, kind, zone)?;
        self.open_layout_writer(&region, -(self.super_block.start_offset as i64))
    }

    /// Rewrites a slot as unsaved, so that a crash mid-save can never
    /// resurrect its previous contents.
    fn invalidate_old_save(&mut self, slot: usize) -> Result<()> {
        let save = &mut self.index.saves[slot];
        let mut start_block = save.index_save.start_block;
        let save_blocks = save.index_save.num_blocks;
        let instance = save.index_save.instance;

        save.reset(
            &mut start_block,
            save_blocks,
            self.super_block.page_map_blocks,
            instance,
        );
        self.write_index_save_layout(slot)
    }

    /// Selects the oldest slot, invalidates it on storage, and prepares it
    /// for a new save.
    fn setup_save_slot(&mut self, num_zones: u32) -> Result<usize> {
        let slot = select_oldest_slot(&self.index.saves, self.index.nonce)?;
        self.invalidate_old_save(slot)?;
        let volume_nonce = self.index.nonce;
        self.index.saves[slot].instantiate(&self.super_block, volume_nonce, num_zones);
        Ok(slot)
    }

    fn cancel_save(&mut self, slot: usize) {
        self.index.saves[slot].mutilate();
    }

    fn commit_save(&mut self, slot: usize) -> Result<()> {
        self.write_index_save_layout(slot)
    }

    fn write_index_state_data(&mut self, slot: usize, state: IndexStateData) -> Result<()> {
        let save = &mut self.index.saves[slot];
        let Some(buffer) = save.state_buffer.as_mut() else {
            return_errno_with_msg!(UnexpectedResult, "save slot has no state buffer");
        };

        buffer.clear();
        buffer.put_i32_le(INDEX_STATE_SIGNATURE)?;
        buffer.put_i32_le(INDEX_STATE_VERSION_ID)?;
        buffer.put_u64_le(state.newest_chapter)?;
        buffer.put_u64_le(state.oldest_chapter)?;
        buffer.put_u64_le(state.last_save)?;
        buffer.put_zeros(4)?;
        buffer.put_zeros(4)?;
        Ok(())
    }

    fn read_index_state_data(&mut self, slot: usize) -> Result<IndexStateData> {
        let save = &mut self.index.saves[slot];
        let Some(buffer) = save.state_buffer.as_mut() else {
            return_errno_with_msg!(UnexpectedResult, "save slot has no state buffer");
        };

        buffer.rewind_all();
        let signature = buffer.get_i32_le()?;
        let version_id = buffer.get_i32_le()?;
        if signature != INDEX_STATE_SIGNATURE || version_id != INDEX_STATE_VERSION_ID {
            error!("index state version {signature},{version_id} is unsupported");
            return_errno!(UnsupportedVersion);
        }

        let state = IndexStateData {
            newest_chapter: buffer.get_u64_le()?,
            oldest_chapter: buffer.get_u64_le()?,
            last_save: buffer.get_u64_le()?,
        };
        buffer.skip_forward(4)?;
        buffer.skip_forward(4)?;
        Ok(state)
    }

    fn write_save_contents<I: DedupIndex>(&mut self, slot: usize, index: &mut I) -> Result<()> {
        self.write_index_state_data(slot, index.state())?;

        let mut writer = self.open_save_region_writer(slot, RL_KIND_OPEN_CHAPTER, 0)?;
        index.save_open_chapter(&mut writer)?;
        writer.flush()?;
        drop(writer);

        let num_zones = self.index.saves[slot].num_zones;
        let mut writers = Vec::with_capacity(num_zones as usize);
        for zone in 0..num_zones {
            writers.push(self.open_save_region_writer(slot, RL_KIND_VOLUME_INDEX, zone)?);
        }
        index.save_volume_index(&mut writers)?;
        for writer in &mut writers {
            writer.flush()?;
        }
        drop(writers);

        let mut writer = self.open_save_region_writer(slot, RL_KIND_INDEX_PAGE_MAP, 0)?;
        index.save_index_page_map(&mut writer)?;
        writer.flush()
    }

    /// Saves the index's state into the oldest save slot.
    ///
    /// The slot is invalidated on storage before any new bytes land in it
    /// and committed only after every component has been written, so at
    /// any point in between the other slots still hold the most recent
    /// good save.
    pub fn save_index_state<I: DedupIndex>(&mut self, index: &mut I) -> Result<()> {
        let slot = self.setup_save_slot(index.zone_count())?;
        if let Err(err) = self.write_save_contents(slot, index) {
            self.cancel_save(slot);
            return Err(err);
        }
        self.commit_save(slot)?;
        debug!("committed index save in slot {slot}");
        Ok(())
    }

    /// Restores the index's state from the latest valid save slot.
    pub fn load_index_state<I: DedupIndex>(&mut self, index: &mut I) -> Result<()> {
        let slot = select_latest_slot(&self.index.saves, self.index.nonce)?;
        let num_zones = self.index.saves[slot].num_zones;

        let state = self.read_index_state_data(slot)?;
        index.restore_state(state);

        let mut reader = self.open_save_region_reader(slot, RL_KIND_OPEN_CHAPTER, 0)?;
        index.load_open_chapter(&mut reader)?;
        drop(reader);

        let mut readers = Vec::with_capacity(num_zones as usize);
        for zone in 0..num_zones {
            readers.push(self.open_save_region_reader(slot, RL_KIND_VOLUME_INDEX, zone)?);
        }
        index.load_volume_index(&mut readers)?;
        drop(readers);

        let mut reader = self.open_save_region_reader(slot, RL_KIND_INDEX_PAGE_MAP, 0)?;
        index.load_index_page_map(&mut reader)?;

        debug!("loaded index save from slot {slot}");
        Ok(())
    }

    /// Invalidates every save slot on storage.
    pub fn discard_index_state(&mut self) -> Result<()> {
        let mut saved_result = Ok(());
        for slot in 0..self.index.saves.len() {
            if let Err(err) = self.invalidate_old_save(slot) {
                saved_result = Err(err);
            }
        }
        saved_result.inspect_err(|_| error!("cannot destroy all index saves"))
    }

    /// Zero-fills the start of the open chapter region of the latest valid
    /// save, discarding the chapter while leaving the save valid.
    pub fn discard_open_chapter(&mut self) -> Result<()> {
        let slot = select_latest_slot(&self.index.saves, self.index.nonce)?;
        let mut writer = self.open_save_region_writer(slot, RL_KIND_OPEN_CHAPTER, 0)?;
        writer.write_zeros(BLOCK_SIZE)?;
        writer.flush()
    }

    /// Rewrites this layout as a converted one, shifted forward by
    /// `offset` bytes with `lvm_offset` bytes hidden in front, without
    /// changing the in-memory layout.
    ///
    /// This fabricates converted storage for testing the version 7 load
    /// path; conversion itself is an offline operation.
    #[cfg(any(test, feature = "conversion-testing"))]
    pub fn update_layout(
        &mut self,
        geometry: &Geometry,
        lvm_offset: u64,
        offset: u64,
    ) -> Result<()> {
        let offset_blocks = offset / BLOCK_SIZE as u64;
        let lvm_blocks = lvm_offset / BLOCK_SIZE as u64;

        let super_block = self.super_block.clone();
        let sub_index_blocks = self.index.sub_index.num_blocks;
        let volume_blocks = self.index.volume.num_blocks;
        let total_blocks = self.total_blocks;

        self.super_block.start_offset = lvm_blocks;
        self.super_block.volume_offset = offset_blocks;
        self.index.sub_index.num_blocks -= offset_blocks;
        self.index.volume.num_blocks -= offset_blocks;
        self.total_blocks -= offset_blocks;
        self.super_block.version = 7;

        let result = self
            .save_single_file_layout(offset_blocks as i64)
            .and_then(|_| self.write_index_config(geometry, offset_blocks as i64));

        self.super_block = super_block;
        self.index.sub_index.num_blocks = sub_index_blocks;
        self.index.volume.num_blocks = volume_blocks;
        self.total_blocks = total_blocks;
        result
    }
}

#[cfg(test)]
mod tests {
    use std::{thread::sleep, time::Duration};

    use super::*;
    use crate::{
        bio::{IoRegion, MemIoFactory},
        error::Errno,
        page_map::IndexPageMap,
    };

    fn test_geometry() -> Geometry {
        Geometry {
            bytes_per_page: 4096,
            bytes_per_volume: 64 * 4096,
            chapters_per_volume: 16,
            index_pages_per_chapter: 4,
            delta_lists_per_chapter: 64,
            volume_index_save_bytes: 2 * 4096,
            open_chapter_save_bytes: 4 * 4096,
        }
    }

    fn test_config(offset: u64) -> IndexConfig {
        IndexConfig {
            name: String::new(),
            size: 0,
            offset,
            geometry: test_geometry(),
        }
    }

    // 83 layout blocks: header + config + (64 volume + 2 * 8 save) + seal.
    const TOTAL_BLOCKS: u64 = 83;

    fn test_factory(extra_blocks: u64) -> MemIoFactory {
        MemIoFactory::new(((TOTAL_BLOCKS + extra_blocks) * 4096) as usize)
    }

    /// A stand-in index that round-trips bytes through every hook.
    struct TestIndex {
        zones: u32,
        state: IndexStateData,
        open_chapter: Vec<u8>,
        zone_records: Vec<u64>,
        page_map: IndexPageMap,
        fail_volume_index_save: bool,
    }

    impl TestIndex {
        fn new(zones: u32) -> Self {
            TestIndex {
                zones,
                state: IndexStateData::default(),
                open_chapter: vec![0xc5; 600],
                zone_records: (0..zones).map(|zone| 0x1000 + u64::from(zone)).collect(),
                page_map: IndexPageMap::new(&test_geometry()).unwrap(),
                fail_volume_index_save: false,
            }
        }

        fn blank(zones: u32) -> Self {
            let mut index = Self::new(zones);
            index.open_chapter = vec![0; 600];
            index.zone_records = vec![0; zones as usize];
            index
        }
    }

    impl DedupIndex for TestIndex {
        fn zone_count(&self) -> u32 {
            self.zones
        }

        fn state(&self) -> IndexStateData {
            self.state
        }

        fn restore_state(&mut self, state: IndexStateData) {
            self.state = state;
        }

        fn save_open_chapter<R: IoRegion>(
            &mut self,
            writer: &mut BufferedWriter<R>,
        ) -> Result<()> {
            writer.write_all(b"OPCH")?;
            writer.write_all(&(self.open_chapter.len() as u32).to_le_bytes())?;
            writer.write_all(&self.open_chapter)
        }

        fn load_open_chapter<R: IoRegion>(
            &mut self,
            reader: &mut BufferedReader<R>,
        ) -> Result<()> {
            reader.verify(b"OPCH")?;
            let mut len = [0u8; 4];
            reader.read_exact(&mut len)?;
            self.open_chapter = vec![0; u32::from_le_bytes(len) as usize];
            reader.read_exact(&mut self.open_chapter)
        }

        fn save_volume_index<R: IoRegion>(
            &mut self,
            writers: &mut [BufferedWriter<R>],
        ) -> Result<()> {
            if self.fail_volume_index_save {
                return_errno_with_msg!(IoFailed, "injected volume index failure");
            }
            for (zone, writer) in writers.iter_mut().enumerate() {
                writer.write_all(&self.zone_records[zone].to_le_bytes())?;
            }
            Ok(())
        }

        fn load_volume_index<R: IoRegion>(
            &mut self,
            readers: &mut [BufferedReader<R>],
        ) -> Result<()> {
            self.zone_records = vec![0; readers.len()];
            for (zone, reader) in readers.iter_mut().enumerate() {
                let mut record = [0u8; 8];
                reader.read_exact(&mut record)?;
                self.zone_records[zone] = u64::from_le_bytes(record);
            }
            Ok(())
        }

        fn save_index_page_map<R: IoRegion>(
            &mut self,
            writer: &mut BufferedWriter<R>,
        ) -> Result<()> {
            self.page_map.write_to(writer)
        }

        fn load_index_page_map<R: IoRegion>(
            &mut self,
            reader: &mut BufferedReader<R>,
        ) -> Result<()> {
            self.page_map.read_from(reader)
        }
    }

    fn latest_slot<F: IoFactory>(layout: &IndexLayout<F>) -> Result<usize> {
        select_latest_slot(&layout.index.saves, layout.index.nonce)
    }

    #[test]
    fn compute_index_size_matches_the_layout() {
        assert_eq!(
            crate::compute_index_size(&test_config(0)).unwrap(),
            TOTAL_BLOCKS * 4096
        );
    }

    #[test]
    fn create_then_reload_reproduces_the_layout() {
        let factory = test_factory(0);
        let config = test_config(0);
        let created = IndexLayout::create(factory.clone(), &config).unwrap();
        assert_eq!(created.total_blocks, TOTAL_BLOCKS);

        let loaded = IndexLayout::load(factory, &config).unwrap();
        assert_eq!(loaded.super_block, created.super_block);
        assert_eq!(loaded.header, created.header);
        assert_eq!(loaded.config, created.config);
        assert_eq!(loaded.seal, created.seal);
        assert_eq!(loaded.index.sub_index, created.index.sub_index);
        assert_eq!(loaded.index.volume, created.index.volume);
        assert_eq!(loaded.index.nonce, created.index.nonce);
        assert_eq!(loaded.total_blocks, created.total_blocks);
        assert_eq!(loaded.index.saves.len(), created.index.saves.len());
        for (reloaded, original) in loaded.index.saves.iter().zip(&created.index.saves) {
            assert_eq!(reloaded.index_save, original.index_save);
            assert_eq!(reloaded.header, original.header);
            assert_eq!(reloaded.index_page_map, original.index_page_map);
            assert_eq!(reloaded.free_space, original.free_space);
            assert_eq!(reloaded.save_data, original.save_data);
        }
        assert_eq!(loaded.volume_nonce(), created.volume_nonce());
    }

    #[test]
    fn layout_regions_are_contiguous() {
        let factory = test_factory(0);
        let layout = IndexLayout::create(factory, &test_config(0)).unwrap();

        let table = layout.make_single_file_region_table();
        // The sub-index spans the volume and the saves, so walk the
        // physical regions in on-storage order.
        let mut next_block = 0;
        for region in table
            .regions
            .iter()
            .filter(|region| region.kind != RL_KIND_INDEX)
        {
            assert_eq!(region.start_block, next_block);
            next_block += region.num_blocks;
        }
        assert_eq!(next_block, TOTAL_BLOCKS);

        for save in &layout.index.saves {
            let mut next_block = save.index_save.start_block;
            assert_eq!(save.header.start_block, next_block);
            next_block += save.header.num_blocks;
            assert_eq!(save.index_page_map.start_block, next_block);
            next_block += save.index_page_map.num_blocks;
            assert_eq!(save.free_space.start_block, next_block);
            next_block += save.free_space.num_blocks;
            assert_eq!(
                next_block,
                save.index_save.start_block + save.index_save.num_blocks
            );
        }
    }

    #[test]
    fn save_then_load_round_trips_the_index_state() {
        let factory = test_factory(0);
        let config = test_config(0);
        let mut layout = IndexLayout::create(factory.clone(), &config).unwrap();

        let mut index = TestIndex::new(2);
        index.state = IndexStateData {
            newest_chapter: 7,
            oldest_chapter: 2,
            last_save: 42,
        };
        index.page_map.update(3, 1, 0, 11).unwrap();
        layout.save_index_state(&mut index).unwrap();

        // Drop the in-memory layout and reload everything from storage.
        drop(layout);
        let mut reloaded = IndexLayout::load(factory, &config).unwrap();
        let mut restored = TestIndex::blank(2);
        reloaded.load_index_state(&mut restored).unwrap();

        assert_eq!(restored.state, index.state);
        assert_eq!(restored.open_chapter, index.open_chapter);
        assert_eq!(restored.zone_records, index.zone_records);
        assert_eq!(restored.page_map.last_update(), 3);
    }

    #[test]
    fn saves_rotate_round_robin() {
        let factory = test_factory(0);
        let mut layout = IndexLayout::create(factory, &test_config(0)).unwrap();
        let mut index = TestIndex::new(1);

        layout.save_index_state(&mut index).unwrap();
        let first_slot = latest_slot(&layout).unwrap();
        let first_time = layout.index.saves[first_slot].save_data.timestamp;

        sleep(Duration::from_millis(2));
        layout.save_index_state(&mut index).unwrap();
        let second_slot = latest_slot(&layout).unwrap();
        assert_ne!(second_slot, first_slot);

        sleep(Duration::from_millis(2));
        layout.save_index_state(&mut index).unwrap();
        let third_slot = latest_slot(&layout).unwrap();
        assert_eq!(third_slot, first_slot);
        assert!(layout.index.saves[third_slot].save_data.timestamp > first_time);
    }

    #[test]
    fn failed_save_leaves_the_previous_save_loadable() {
        let factory = test_factory(0);
        let config = test_config(0);
        let mut layout = IndexLayout::create(factory.clone(), &config).unwrap();

        let mut index = TestIndex::new(1);
        index.state.last_save = 1;
        layout.save_index_state(&mut index).unwrap();

        sleep(Duration::from_millis(2));
        index.state.last_save = 2;
        layout.save_index_state(&mut index).unwrap();
        let committed_slot = latest_slot(&layout).unwrap();

        // The next save selects the oldest slot and invalidates it on
        // storage, then dies before committing.
        sleep(Duration::from_millis(2));
        index.state.last_save = 3;
        index.fail_volume_index_save = true;
        let err = layout.save_index_state(&mut index).unwrap_err();
        assert_eq!(err.errno(), Errno::IoFailed);

        // Reopening the storage must find the save from before the crash.
        let mut reloaded = IndexLayout::load(factory, &config).unwrap();
        assert_eq!(latest_slot(&reloaded).unwrap(), committed_slot);
        let mut restored = TestIndex::blank(1);
        reloaded.load_index_state(&mut restored).unwrap();
        assert_eq!(restored.state.last_save, 2);
    }

    #[test]
    fn discarding_state_invalidates_every_slot() {
        let factory = test_factory(0);
        let config = test_config(0);
        let mut layout = IndexLayout::create(factory.clone(), &config).unwrap();
        let mut index = TestIndex::new(1);
        layout.save_index_state(&mut index).unwrap();

        layout.discard_index_state().unwrap();
        assert_eq!(
            latest_slot(&layout).unwrap_err().errno(),
            Errno::IndexNotSavedCleanly
        );

        let mut reloaded = IndexLayout::load(factory, &config).unwrap();
        let mut restored = TestIndex::blank(1);
        assert_eq!(
            reloaded.load_index_state(&mut restored).unwrap_err().errno(),
            Errno::IndexNotSavedCleanly
        );
    }

    #[test]
    fn discarding_the_open_chapter_keeps_the_save_valid() {
        let factory = test_factory(0);
        let config = test_config(0);
        let mut layout = IndexLayout::create(factory.clone(), &config).unwrap();
        let mut index = TestIndex::new(1);
        layout.save_index_state(&mut index).unwrap();

        layout.discard_open_chapter().unwrap();

        let mut reloaded = IndexLayout::load(factory, &config).unwrap();
        let mut restored = TestIndex::blank(1);
        // The open chapter magic is gone, so its load fails, but the save
        // slot itself is still the valid latest one.
        assert!(latest_slot(&reloaded).is_ok());
        assert_eq!(
            reloaded.load_index_state(&mut restored).unwrap_err().errno(),
            Errno::CorruptData
        );
    }

    #[test]
    fn blank_storage_is_not_an_index() {
        let factory = test_factory(0);
        let err = IndexLayout::load(factory, &test_config(0)).unwrap_err();
        assert_eq!(err.errno(), Errno::NoIndex);
    }

    #[test]
    fn undersized_storage_is_rejected() {
        let factory = MemIoFactory::new(((TOTAL_BLOCKS - 1) * 4096) as usize);
        let err = IndexLayout::create(factory, &test_config(0)).unwrap_err();
        assert_eq!(err.errno(), Errno::NoSpace);

        // An explicit size bound below the requirement fails the same way.
        let factory = test_factory(8);
        let mut config = test_config(0);
        config.size = (TOTAL_BLOCKS - 1) * 4096;
        let err = IndexLayout::create(factory, &config).unwrap_err();
        assert_eq!(err.errno(), Errno::NoSpace);
    }

    // Byte offset of the super block payload within the header block: the
    // region table holds 7 regions.
    const SUPER_DATA_OFFSET: u64 =
        (RegionHeader::ENCODED_SIZE + 7 * LayoutRegion::ENCODED_SIZE) as u64;

    #[test]
    fn corrupted_magic_label_is_corrupt_data() {
        let factory = test_factory(0);
        let config = test_config(0);
        IndexLayout::create(factory.clone(), &config).unwrap();

        let region = factory.open_region(0, 4096).unwrap();
        let mut byte = [0u8; 1];
        region.read_at(SUPER_DATA_OFFSET, &mut byte).unwrap();
        byte[0] ^= 0xff;
        region.write_at(SUPER_DATA_OFFSET, &byte).unwrap();

        let err = IndexLayout::load(factory, &config).unwrap_err();
        assert_eq!(err.errno(), Errno::CorruptData);
    }

    #[test]
    fn development_super_version_is_unsupported() {
        let factory = test_factory(0);
        let config = test_config(0);
        IndexLayout::create(factory.clone(), &config).unwrap();

        // The version field follows the magic label, nonce info and nonce.
        let version_offset = SUPER_DATA_OFFSET + 32 + 32 + 8;
        let region = factory.open_region(0, 4096).unwrap();
        region.write_at(version_offset, &5u32.to_le_bytes()).unwrap();

        let err = IndexLayout::load(factory, &config).unwrap_err();
        assert_eq!(err.errno(), Errno::UnsupportedVersion);
    }

    #[test]
    fn tampered_state_version_is_unsupported() {
        let factory = test_factory(0);
        let config = test_config(0);
        let mut layout = IndexLayout::create(factory.clone(), &config).unwrap();
        let mut index = TestIndex::new(1);
        layout.save_index_state(&mut index).unwrap();
        let slot = latest_slot(&layout).unwrap();

        // Overwrite the state record's version id in the slot header
        // block. The save nonce does not cover the state payload, so the
        // slot stays valid and the state check itself must fire.
        let header_block = layout.index.saves[slot].header.start_block;
        let num_regions = layout.index.saves[slot].make_region_table().len();
        let table_bytes =
            (RegionHeader::ENCODED_SIZE + num_regions * LayoutRegion::ENCODED_SIZE) as u64;
        let version_id_offset =
            header_block * 4096 + table_bytes + IndexSaveData::ENCODED_SIZE as u64 + 4;
        let region = factory.open_region(0, TOTAL_BLOCKS * 4096).unwrap();
        region
            .write_at(version_id_offset, &300i32.to_le_bytes())
            .unwrap();

        let mut reloaded = IndexLayout::load(factory, &config).unwrap();
        let mut restored = TestIndex::blank(1);
        assert_eq!(
            reloaded.load_index_state(&mut restored).unwrap_err().errno(),
            Errno::UnsupportedVersion
        );
    }

    #[test]
    fn creating_at_an_offset_shifts_every_region() {
        let factory = test_factory(4);
        let config = test_config(4 * 4096);
        let layout = IndexLayout::create(factory.clone(), &config).unwrap();
        assert_eq!(layout.header.start_block, 4);

        let loaded = IndexLayout::load(factory, &config).unwrap();
        assert_eq!(loaded.header.start_block, 4);
        assert_eq!(loaded.index.volume, layout.index.volume);
    }

    #[test]
    fn converted_layout_loads_with_shifted_volume() {
        let factory = test_factory(0);
        let config = test_config(0);
        let mut layout = IndexLayout::create(factory.clone(), &config).unwrap();
        let mut index = TestIndex::new(1);
        index.state.last_save = 9;
        layout.save_index_state(&mut index).unwrap();
        let nonce = layout.volume_nonce();

        // Shift the volume forward by four blocks, as the offline
        // conversion tool would, and reopen at the shifted super block.
        let offset_blocks = 4u64;
        layout
            .update_layout(&config.geometry, 0, offset_blocks * 4096)
            .unwrap();
        drop(layout);

        let mut converted_config = config.clone();
        converted_config.offset = offset_blocks * 4096;
        let mut converted = IndexLayout::load(factory, &converted_config).unwrap();

        assert!(converted.super_block.is_converted());
        assert_eq!(converted.super_block.volume_offset, offset_blocks);
        assert_eq!(converted.super_block.start_offset, 0);
        assert_eq!(converted.volume_nonce(), nonce);

        // The volume region is opened past the conversion shift.
        let volume = converted.open_volume_region().unwrap();
        assert_eq!(
            volume.num_bytes(),
            (64 - offset_blocks) * 4096
        );

        // The saves were not moved by the conversion.
        let mut restored = TestIndex::blank(1);
        converted.load_index_state(&mut restored).unwrap();
        assert_eq!(restored.state.last_save, 9);
    }

    #[test]
    fn make_layout_runs_on_a_real_file() {
        let path = std::env::temp_dir().join(format!("albireo-layout-test-{}", std::process::id()));
        let mut config = test_config(0);
        config.name = path.to_str().unwrap().to_string();

        let layout = make_layout(&config, true).unwrap();
        drop(layout);

        let mut layout = make_layout(&config, false).unwrap();
        let mut index = TestIndex::new(1);
        index.state.last_save = 5;
        layout.save_index_state(&mut index).unwrap();
        drop(layout);

        let mut layout = make_layout(&config, false).unwrap();
        let mut restored = TestIndex::blank(1);
        layout.load_index_state(&mut restored).unwrap();
        assert_eq!(restored.state.last_save, 5);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn inconsistent_conversion_offsets_are_corrupt() {
        let factory = test_factory(0);
        let config = test_config(0);
        let mut layout = IndexLayout::create(factory.clone(), &config).unwrap();
        layout
            .update_layout(&config.geometry, 0, 4 * 4096)
            .unwrap();
        drop(layout);

        // Rewrite the converted super block's offsets so that the start
        // offset exceeds the volume offset.
        let super_offset = 4 * 4096 + SUPER_DATA_OFFSET;
        let start_offset_field = super_offset + 104 + 8;
        let region = factory.open_region(0, TOTAL_BLOCKS * 4096).unwrap();
        region
            .write_at(start_offset_field, &100u64.to_le_bytes())
            .unwrap();

        let mut converted_config = config.clone();
        converted_config.offset = 4 * 4096;
        let err = IndexLayout::load(factory, &converted_config).unwrap_err();
        assert_eq!(err.errno(), Errno::CorruptData);
    }
}
