//! Sizing of the three IVFC hash levels.
//!
//! Lengths are derived bottom-up (the data-adjacent level 2 first, since each
//! level above it holds one digest per block of the level below), offsets are
//! then accumulated top-down starting from level 0.

use serde::Serialize;

use crate::header::{MASTER_HASH_OFFSET, MEDIA_UNIT_SIZE};
use crate::layout::align_up;

/// SHA-256 digest length.
pub const HASH_SIZE: u64 = 0x20;

pub const DEFAULT_BLOCK_SIZE: u64 = 0x1000;
/// Two digests per block, so every level is at most half the one below.
pub const MIN_BLOCK_SIZE: u64 = 2 * HASH_SIZE;
/// Largest block whose log2 still fits the header field with room to spare.
pub const MAX_BLOCK_SIZE: u64 = 1 << 31;
/// Upper bound on level-2 data; keeps every region offset inside u64.
pub const MAX_DATA_LENGTH: u64 = 1 << 62;

pub const LEVEL_COUNT: usize = 3;

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct HashLevel {
    pub block_size: u64,
    pub data_length: u64,
    pub hash_offset: u64,
}

impl HashLevel {
    pub fn aligned_length(&self) -> u64 {
        align_up(self.data_length, self.block_size)
    }

    pub fn block_count(&self) -> u64 {
        self.aligned_length() / self.block_size
    }

    /// Bytes of digests this level produces for the level above it.
    pub fn digest_length(&self) -> u64 {
        self.block_count() * HASH_SIZE
    }

    pub fn log2_block_size(&self) -> u32 {
        self.block_size.trailing_zeros()
    }
}

/// The sized tree: level 0 is checked by the master hashes, level 2 holds
/// the metadata blob and file data.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct HashTree {
    pub levels: [HashLevel; LEVEL_COUNT],
    pub master_hash_length: u64,
}

/// Physical placement of every region of the image, in absolute offsets.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Regions {
    pub master_hash_offset: u64,
    pub metadata_offset: u64,
    pub data_base: u64,
    pub data_end: u64,
    pub hash_base: u64,
    pub image_length: u64,
}

/// Derive the three levels from the level-2 data length.
pub fn size(total_data_length: u64, block_sizes: [u64; LEVEL_COUNT]) -> HashTree {
    let mut levels = block_sizes.map(|block_size| HashLevel {
        block_size,
        data_length: 0,
        hash_offset: 0,
    });

    levels[2].data_length = total_data_length;
    levels[1].data_length = levels[2].digest_length();
    levels[0].data_length = levels[1].digest_length();
    let master_hash_length = levels[0].digest_length();

    let mut lofs = 0u64;
    for level in levels.iter_mut() {
        level.hash_offset = lofs;
        lofs += level.aligned_length();
    }

    HashTree { levels, master_hash_length }
}

impl HashTree {
    /// Offset where the metadata blob (and so level 2) begins.
    pub fn metadata_offset(&self) -> u64 {
        align_up(self.master_hash_length + MASTER_HASH_OFFSET, self.levels[0].block_size)
    }

    /// Length covered by the super-block hash: header plus master hashes,
    /// rounded to a media unit.
    pub fn super_block_length(&self) -> u64 {
        align_up(self.master_hash_length + MASTER_HASH_OFFSET, MEDIA_UNIT_SIZE)
    }

    pub fn regions(&self, metadata_length: u64) -> Regions {
        let metadata_offset = self.metadata_offset();
        let data_end = metadata_offset + self.levels[2].data_length;
        let hash_base = align_up(data_end, self.levels[2].block_size);
        let level1_end = hash_base + self.levels[1].hash_offset + self.levels[1].data_length;
        Regions {
            master_hash_offset: MASTER_HASH_OFFSET,
            metadata_offset,
            data_base: metadata_offset + metadata_length,
            data_end,
            hash_base,
            image_length: align_up(level1_end, self.levels[1].block_size),
        }
    }
}
