// SPDX-License-Identifier: MPL-2.0

//! Caller-supplied configuration and the derived on-disk sizing.

use crate::{
    bio::{BufferedReader, BufferedWriter, IoRegion},
    codec::Buffer,
    page_map,
    prelude::*,
};

/// The shape of the index an on-disk layout is sized for.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Geometry {
    /// Bytes in each volume page. Must be a multiple of the block size.
    pub bytes_per_page: u64,
    /// Bytes in the whole volume region.
    pub bytes_per_volume: u64,
    /// Chapters in the volume.
    pub chapters_per_volume: u32,
    /// Index pages in each chapter.
    pub index_pages_per_chapter: u32,
    /// Delta lists in each chapter.
    pub delta_lists_per_chapter: u32,
    /// Bytes needed to save the volume index, across all zones.
    pub volume_index_save_bytes: u64,
    /// Bytes needed to save the open chapter.
    pub open_chapter_save_bytes: u64,
}

/// What the caller asks of a layout.
#[derive(Clone, Debug)]
pub struct IndexConfig {
    /// Identifier of the backing store.
    pub name: String,
    /// Bytes available for the layout; 0 means the full store.
    pub size: u64,
    /// Byte offset of the first block of the layout.
    pub offset: u64,
    pub geometry: Geometry,
}

/// Sizes of the regions a layout is divided into.
///
/// The volume index blocks cover all zones; zones divide them at save
/// time.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SaveLayoutSizes {
    pub num_saves: u16,
    pub block_size: usize,
    pub volume_blocks: BlockCount,
    pub volume_index_blocks: BlockCount,
    pub page_map_blocks: BlockCount,
    pub open_chapter_blocks: BlockCount,
    pub save_blocks: BlockCount,
    pub sub_index_blocks: BlockCount,
    pub total_blocks: BlockCount,
    pub total_size: u64,
}

fn block_count(bytes: u64) -> BlockCount {
    bytes.div_ceil(BLOCK_SIZE as u64)
}

pub(crate) fn compute_sizes(config: &IndexConfig) -> Result<SaveLayoutSizes> {
    let geometry = &config.geometry;
    if geometry.bytes_per_page % BLOCK_SIZE as u64 != 0 {
        error!("page size not a multiple of block size");
        return_errno!(IncorrectAlignment);
    }

    let num_saves = 2u16;
    let volume_blocks = geometry.bytes_per_volume / BLOCK_SIZE as u64;
    let volume_index_blocks = block_count(geometry.volume_index_save_bytes);
    let page_map_blocks = block_count(page_map::compute_save_size(geometry));
    let open_chapter_blocks = block_count(geometry.open_chapter_save_bytes);
    let save_blocks = 1 + volume_index_blocks + page_map_blocks + open_chapter_blocks;
    let sub_index_blocks = volume_blocks + u64::from(num_saves) * save_blocks;
    let total_blocks = 3 + sub_index_blocks;

    Ok(SaveLayoutSizes {
        num_saves,
        block_size: BLOCK_SIZE,
        volume_blocks,
        volume_index_blocks,
        page_map_blocks,
        open_chapter_blocks,
        save_blocks,
        sub_index_blocks,
        total_blocks,
        total_size: total_blocks * BLOCK_SIZE as u64,
    })
}

/// Computes the number of bytes of backing store an index described by
/// `config` will occupy.
pub fn compute_index_size(config: &IndexConfig) -> Result<u64> {
    let sizes = compute_sizes(config)?;
    Ok(sizes.total_size)
}

const CONFIG_MAGIC: &[u8; 8] = b"AlbICfg1";
const CONFIG_VERSION: u32 = 1;
const CONFIG_ENCODED_SIZE: usize = 48;

fn encode_geometry(buffer: &mut Buffer, geometry: &Geometry) -> Result<()> {
    buffer.put_u32_le(CONFIG_VERSION)?;
    buffer.put_u64_le(geometry.bytes_per_page)?;
    buffer.put_u64_le(geometry.bytes_per_volume)?;
    buffer.put_u32_le(geometry.chapters_per_volume)?;
    buffer.put_u32_le(geometry.index_pages_per_chapter)?;
    buffer.put_u32_le(geometry.delta_lists_per_chapter)?;
    buffer.put_u64_le(geometry.volume_index_save_bytes)?;
    buffer.put_u64_le(geometry.open_chapter_save_bytes)?;
    buffer.require_encoded(CONFIG_ENCODED_SIZE)
}

fn decode_geometry(buffer: &mut Buffer) -> Result<Geometry> {
    let version = buffer.get_u32_le()?;
    if version != CONFIG_VERSION {
        error!("unknown configuration record version {version}");
        return_errno!(UnsupportedVersion);
    }
    let geometry = Geometry {
        bytes_per_page: buffer.get_u64_le()?,
        bytes_per_volume: buffer.get_u64_le()?,
        chapters_per_volume: buffer.get_u32_le()?,
        index_pages_per_chapter: buffer.get_u32_le()?,
        delta_lists_per_chapter: buffer.get_u32_le()?,
        volume_index_save_bytes: buffer.get_u64_le()?,
        open_chapter_save_bytes: buffer.get_u64_le()?,
    };
    buffer.require_drained(CONFIG_ENCODED_SIZE)?;
    Ok(geometry)
}

/// Writes the index configuration record.
pub(crate) fn write_config<R: IoRegion>(
    writer: &mut BufferedWriter<R>,
    geometry: &Geometry,
) -> Result<()> {
    let mut buffer = Buffer::new(CONFIG_ENCODED_SIZE);
    encode_geometry(&mut buffer, geometry)?;
    writer.write_all(CONFIG_MAGIC)?;
    writer.write_all(buffer.contents())
}

/// Reads the saved index configuration record and checks it against the
/// configuration the caller supplied.
pub(crate) fn verify_config<R: IoRegion>(
    reader: &mut BufferedReader<R>,
    geometry: &Geometry,
) -> Result<()> {
    reader.verify(CONFIG_MAGIC)?;
    let mut bytes = vec![0; CONFIG_ENCODED_SIZE];
    reader.read_exact(&mut bytes)?;
    let saved = decode_geometry(&mut Buffer::wrap(bytes))?;
    if saved != *geometry {
        error!("supplied index configuration does not match the saved one");
        return_errno!(CorruptData);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bio::{IoFactory, MemIoFactory};

    fn small_geometry() -> Geometry {
        Geometry {
            bytes_per_page: 4096,
            bytes_per_volume: 64 * 4096,
            chapters_per_volume: 16,
            index_pages_per_chapter: 4,
            delta_lists_per_chapter: 32,
            volume_index_save_bytes: 2 * 4096,
            open_chapter_save_bytes: 4 * 4096,
        }
    }

    fn small_config() -> IndexConfig {
        IndexConfig {
            name: String::new(),
            size: 0,
            offset: 0,
            geometry: small_geometry(),
        }
    }

    #[test]
    fn sizes_add_up() {
        let sizes = compute_sizes(&small_config()).unwrap();
        assert_eq!(sizes.num_saves, 2);
        assert_eq!(sizes.volume_blocks, 64);
        assert_eq!(sizes.volume_index_blocks, 2);
        assert_eq!(sizes.page_map_blocks, 1);
        assert_eq!(sizes.open_chapter_blocks, 4);
        assert_eq!(sizes.save_blocks, 1 + 2 + 1 + 4);
        assert_eq!(sizes.sub_index_blocks, 64 + 2 * 8);
        assert_eq!(sizes.total_blocks, 83);
        assert_eq!(sizes.total_size, 83 * 4096);
    }

    #[test]
    fn unaligned_page_size_is_rejected() {
        let mut config = small_config();
        config.geometry.bytes_per_page = 4096 + 512;
        let err = compute_sizes(&config).unwrap_err();
        assert_eq!(err.errno(), crate::Errno::IncorrectAlignment);
    }

    #[test]
    fn config_record_round_trips() {
        let factory = MemIoFactory::new(4096);
        let geometry = small_geometry();
        let mut writer = BufferedWriter::new(factory.open_region(0, 4096).unwrap());
        write_config(&mut writer, &geometry).unwrap();
        writer.flush().unwrap();

        let mut reader = BufferedReader::new(factory.open_region(0, 4096).unwrap());
        verify_config(&mut reader, &geometry).unwrap();
    }

    #[test]
    fn mismatched_config_is_corrupt() {
        let factory = MemIoFactory::new(4096);
        let mut writer = BufferedWriter::new(factory.open_region(0, 4096).unwrap());
        write_config(&mut writer, &small_geometry()).unwrap();
        writer.flush().unwrap();

        let mut other = small_geometry();
        other.chapters_per_volume += 1;
        let mut reader = BufferedReader::new(factory.open_region(0, 4096).unwrap());
        let err = verify_config(&mut reader, &other).unwrap_err();
        assert_eq!(err.errno(), crate::Errno::CorruptData);
    }
}
