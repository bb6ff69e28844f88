// SPDX-License-Identifier: MPL-2.0

use crate::{
    codec::Buffer,
    nonce::{NONCE_INFO_SIZE, create_unique_nonce_data, generate_primary_nonce},
    prelude::*,
};

pub(crate) const SINGLE_FILE_MAGIC: &[u8; 32] = b"*ALBIREO*SINGLE*FILE*LAYOUT*001*";

/// Version 3 is the normal current version.
///
/// Versions 4 through 6 were incremental development versions and are not
/// supported.
///
/// Version 7 is used for layouts which have been shifted forward on the
/// storage to make room for prepended volume-manager metadata without
/// losing all deduplication.
pub(crate) const SUPER_VERSION_MINIMUM: u32 = 3;
pub(crate) const SUPER_VERSION_CURRENT: u32 = 3;
pub(crate) const SUPER_VERSION_MAXIMUM: u32 = 7;

const MIN_SAVES: u16 = 2;
const MAX_SAVES: u16 = 5;

/// The data held in the super block, one per layout.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub(crate) struct SuperBlockData {
    pub magic_label: [u8; 32],
    pub nonce_info: [u8; NONCE_INFO_SIZE],
    /// Primary nonce, derived from `nonce_info`.
    pub nonce: u64,
    pub version: u32,
    /// Recorded for verification.
    pub block_size: u32,
    /// Always 1.
    pub num_indexes: u16,
    pub max_saves: u16,
    /// Per-save open chapter allocation.
    pub open_chapter_blocks: BlockCount,
    /// Per-save index page map allocation.
    pub page_map_blocks: BlockCount,
    /// Blocks the volume has been shifted forward; version 7 only.
    pub volume_offset: BlockCount,
    /// Blocks hidden in front of the layout; version 7 only.
    pub start_offset: BlockCount,
}

impl SuperBlockData {
    /// Generates the super block for a fresh layout.
    pub fn generate(
        block_size: u32,
        max_saves: u16,
        open_chapter_blocks: BlockCount,
        page_map_blocks: BlockCount,
    ) -> Self {
        let nonce_info = create_unique_nonce_data();
        let nonce = generate_primary_nonce(&nonce_info);
        SuperBlockData {
            magic_label: *SINGLE_FILE_MAGIC,
            nonce_info,
            nonce,
            version: SUPER_VERSION_CURRENT,
            block_size,
            num_indexes: 1,
            max_saves,
            open_chapter_blocks,
            page_map_blocks,
            volume_offset: 0,
            start_offset: 0,
        }
    }

    pub fn is_converted(&self) -> bool {
        self.version == 7
    }

    /// The number of payload bytes this super block encodes to.
    ///
    /// The two offset fields are present only in converted layouts.
    pub fn encoded_size(&self) -> usize {
        if self.is_converted() { 120 } else { 104 }
    }

    pub fn encode(&self, buffer: &mut Buffer) -> Result<()> {
        buffer.put_bytes(&self.magic_label)?;
        buffer.put_bytes(&self.nonce_info)?;
        buffer.put_u64_le(self.nonce)?;
        buffer.put_u32_le(self.version)?;
        buffer.put_u32_le(self.block_size)?;
        buffer.put_u16_le(self.num_indexes)?;
        buffer.put_u16_le(self.max_saves)?;
        buffer.put_zeros(4)?;
        buffer.put_u64_le(self.open_chapter_blocks)?;
        buffer.put_u64_le(self.page_map_blocks)?;
        if self.is_converted() {
            buffer.put_u64_le(self.volume_offset)?;
            buffer.put_u64_le(self.start_offset)?;
        }
        buffer.require_encoded(self.encoded_size())
    }

    pub fn decode(buffer: &mut Buffer) -> Result<Self> {
        let expected_size = buffer.content_len();
        let mut magic_label = [0u8; 32];
        buffer.get_bytes(&mut magic_label)?;
        let mut nonce_info = [0u8; NONCE_INFO_SIZE];
        buffer.get_bytes(&mut nonce_info)?;
        let mut super_block = SuperBlockData {
            magic_label,
            nonce_info,
            nonce: buffer.get_u64_le()?,
            version: buffer.get_u32_le()?,
            block_size: buffer.get_u32_le()?,
            num_indexes: buffer.get_u16_le()?,
            max_saves: buffer.get_u16_le()?,
            open_chapter_blocks: 0,
            page_map_blocks: 0,
            volume_offset: 0,
            start_offset: 0,
        };
        buffer.skip_forward(4)?;
        super_block.open_chapter_blocks = buffer.get_u64_le()?;
        super_block.page_map_blocks = buffer.get_u64_le()?;
        if super_block.is_converted() {
            super_block.volume_offset = buffer.get_u64_le()?;
            super_block.start_offset = buffer.get_u64_le()?;
        }
        buffer.require_drained(expected_size)?;
        Ok(super_block)
    }

    /// Checks every invariant a super block read from storage must hold.
    pub fn validate(&self, block_size: u32) -> Result<()> {
        if self.magic_label != *SINGLE_FILE_MAGIC {
            error!("unknown superblock magic label");
            return_errno!(CorruptData);
        }

        if self.version < SUPER_VERSION_MINIMUM
            || (4..=6).contains(&self.version)
            || self.version > SUPER_VERSION_MAXIMUM
        {
            error!("unknown superblock version number {}", self.version);
            return_errno!(UnsupportedVersion);
        }

        if self.volume_offset < self.start_offset {
            error!(
                "inconsistent offsets (start {}, volume {})",
                self.start_offset, self.volume_offset
            );
            return_errno!(CorruptData);
        }

        // Multiple sub-indexes are a layout of the distant past.
        if self.num_indexes != 1 {
            error!("invalid subindex count {}", self.num_indexes);
            return_errno!(CorruptData);
        }

        if !(MIN_SAVES..=MAX_SAVES).contains(&self.max_saves) {
            error!("invalid save slot count {}", self.max_saves);
            return_errno!(CorruptData);
        }

        if generate_primary_nonce(&self.nonce_info) != self.nonce {
            error!("inconsistent superblock nonce");
            return_errno!(CorruptData);
        }

        if self.block_size != block_size {
            error!(
                "superblock saved block size {} differs from supplied block size {}",
                self.block_size, block_size
            );
            return_errno!(CorruptData);
        }

        Ok(())
    }
}
