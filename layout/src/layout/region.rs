// SPDX-License-Identifier: MPL-2.0

use crate::{
    bio::{BufferedReader, IoRegion},
    codec::Buffer,
    prelude::*,
};

/// 'AlbRgn01' as stored on disk, little-endian.
pub(crate) const REGION_MAGIC: u64 = 0x416c_6252_676e_3031;

pub(crate) const REGION_HEADER_VERSION: u16 = 1;

/// Instance number for regions that appear exactly once.
pub(crate) const SOLE_INSTANCE: u16 = 65535;

/// Region table types.
pub(crate) const RH_TYPE_SUPER: u16 = 1;
pub(crate) const RH_TYPE_SAVE: u16 = 2;
pub(crate) const RH_TYPE_UNSAVED: u16 = 4;

/// Region kinds.
pub(crate) const RL_KIND_SCRATCH: u16 = 0;
pub(crate) const RL_KIND_HEADER: u16 = 1;
pub(crate) const RL_KIND_CONFIG: u16 = 100;
pub(crate) const RL_KIND_INDEX: u16 = 101;
pub(crate) const RL_KIND_SEAL: u16 = 102;
pub(crate) const RL_KIND_VOLUME: u16 = 201;
pub(crate) const RL_KIND_SAVE: u16 = 202;
pub(crate) const RL_KIND_INDEX_PAGE_MAP: u16 = 301;
pub(crate) const RL_KIND_VOLUME_INDEX: u16 = 302;
pub(crate) const RL_KIND_OPEN_CHAPTER: u16 = 303;

/// One contiguous span of blocks with a kind and an instance number.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub(crate) struct LayoutRegion {
    pub start_block: BlockCount,
    pub num_blocks: BlockCount,
    /// Reserved, currently zero.
    pub checksum: u32,
    pub kind: u16,
    pub instance: u16,
}

impl LayoutRegion {
    pub const ENCODED_SIZE: usize = 24;

    pub fn encode(&self, buffer: &mut Buffer) -> Result<()> {
        let starting_length = buffer.content_len();
        buffer.put_u64_le(self.start_block)?;
        buffer.put_u64_le(self.num_blocks)?;
        buffer.put_u32_le(self.checksum)?;
        buffer.put_u16_le(self.kind)?;
        buffer.put_u16_le(self.instance)?;
        if buffer.content_len() - starting_length != Self::ENCODED_SIZE {
            return_errno_with_msg!(UnexpectedResult, "encoded layout region has the wrong size");
        }
        Ok(())
    }

    pub fn decode(buffer: &mut Buffer) -> Result<Self> {
        let starting_length = buffer.content_len();
        let region = LayoutRegion {
            start_block: buffer.get_u64_le()?,
            num_blocks: buffer.get_u64_le()?,
            checksum: buffer.get_u32_le()?,
            kind: buffer.get_u16_le()?,
            instance: buffer.get_u16_le()?,
        };
        if starting_length - buffer.content_len() != Self::ENCODED_SIZE {
            return_errno_with_msg!(CorruptData, "decoded layout region has the wrong size");
        }
        Ok(region)
    }
}

/// Lays a region down at the running cursor and advances it.
pub(crate) fn setup_layout(
    next_block: &mut BlockCount,
    num_blocks: BlockCount,
    kind: u16,
    instance: u16,
) -> LayoutRegion {
    let region = LayoutRegion {
        start_block: *next_block,
        num_blocks,
        checksum: 0,
        kind,
        instance,
    };
    *next_block = next_block.wrapping_add(num_blocks);
    region
}

/// The header that prefixes every region table.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct RegionHeader {
    pub magic: u64,
    /// Total blocks covered by this table.
    pub region_blocks: BlockCount,
    pub region_type: u16,
    pub version: u16,
    pub num_regions: u16,
    /// Bytes of additional body following the table.
    pub payload: u16,
}

impl RegionHeader {
    pub const ENCODED_SIZE: usize = 24;

    pub fn encode(&self, buffer: &mut Buffer) -> Result<()> {
        let starting_length = buffer.content_len();
        buffer.put_u64_le(REGION_MAGIC)?;
        buffer.put_u64_le(self.region_blocks)?;
        buffer.put_u16_le(self.region_type)?;
        buffer.put_u16_le(self.version)?;
        buffer.put_u16_le(self.num_regions)?;
        buffer.put_u16_le(self.payload)?;
        if buffer.content_len() - starting_length != Self::ENCODED_SIZE {
            return_errno_with_msg!(UnexpectedResult, "encoded region header has the wrong size");
        }
        Ok(())
    }

    pub fn decode(buffer: &mut Buffer) -> Result<Self> {
        let header = RegionHeader {
            magic: buffer.get_u64_le()?,
            region_blocks: buffer.get_u64_le()?,
            region_type: buffer.get_u16_le()?,
            version: buffer.get_u16_le()?,
            num_regions: buffer.get_u16_le()?,
            payload: buffer.get_u16_le()?,
        };
        buffer.require_drained(Self::ENCODED_SIZE)?;
        Ok(header)
    }
}

/// A region header and the layout regions it declares.
#[derive(Clone, Debug)]
pub(crate) struct RegionTable {
    pub header: RegionHeader,
    pub regions: Vec<LayoutRegion>,
}

impl RegionTable {
    /// Encodes the whole table for writing.
    pub fn encode(&self) -> Result<Buffer> {
        let table_size =
            RegionHeader::ENCODED_SIZE + self.regions.len() * LayoutRegion::ENCODED_SIZE;
        let mut buffer = Buffer::new(table_size);
        self.header.encode(&mut buffer)?;
        for region in &self.regions {
            region.encode(&mut buffer)?;
        }
        buffer.require_encoded(table_size)?;
        Ok(buffer)
    }
}

/// Reads a region table from the front of a region.
pub(crate) fn load_region_table<R: IoRegion>(
    reader: &mut BufferedReader<R>,
) -> Result<RegionTable> {
    let mut header_bytes = vec![0; RegionHeader::ENCODED_SIZE];
    reader.read_exact(&mut header_bytes).inspect_err(|_| {
        error!("cannot read region table header");
    })?;
    let header = RegionHeader::decode(&mut Buffer::wrap(header_bytes))?;

    if header.magic != REGION_MAGIC {
        return_errno!(NoIndex);
    }
    if header.version != REGION_HEADER_VERSION {
        error!("unknown region table version {}", header.version);
        return_errno!(UnsupportedVersion);
    }

    let mut region_bytes = vec![0; header.num_regions as usize * LayoutRegion::ENCODED_SIZE];
    reader.read_exact(&mut region_bytes).inspect_err(|_| {
        error!("cannot read region table layouts");
    })?;
    let mut buffer = Buffer::wrap(region_bytes);
    let regions = (0..header.num_regions)
        .map(|_| LayoutRegion::decode(&mut buffer))
        .collect::<Result<Vec<_>>>()?;

    Ok(RegionTable { header, regions })
}
