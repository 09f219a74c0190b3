use sha2::{Digest, Sha256};

use crate::build::Stage;
use crate::error::BuildResult;
use crate::layout::align_up;
use crate::levels::{HashLevel, HashTree, Regions, HASH_SIZE, LEVEL_COUNT};
use crate::progress::Progress;
use crate::scratch::ScratchImage;

/// Hash every block of one level, reading from `read_at` and appending the
/// digests in block order at `write_at`. A short final block is hashed as a
/// full zero-padded block.
fn hash_level(
    scratch: &mut ScratchImage,
    level: &HashLevel,
    read_at: u64,
    write_at: u64,
    progress: &Progress,
) -> BuildResult<()> {
    let bs = level.block_size as usize;
    let mut block = vec![0u8; bs];
    let mut out: Vec<u8> = Vec::with_capacity(bs);
    let mut flushed = 0u64;

    let mut ofs = 0u64;
    while ofs < level.data_length {
        let n = ((level.data_length - ofs) as usize).min(bs);
        scratch.read_at_padded(read_at + ofs, &mut block[..n])?;
        block[n..].fill(0);
        out.extend_from_slice(&Sha256::digest(&block));
        progress.inc_block();
        if out.len() >= bs {
            scratch.write_at(write_at + flushed, &out)?;
            flushed += out.len() as u64;
            out.clear();
        }
        ofs += level.block_size;
    }
    if !out.is_empty() {
        scratch.write_at(write_at + flushed, &out)?;
        flushed += out.len() as u64;
    }
    debug_assert_eq!(flushed, level.block_count() * HASH_SIZE);
    Ok(())
}

/// Build the hash tree over the assembled data, innermost level first, and
/// return the super-block hash.
///
/// Each level's digests are the next level's data, so a level only starts
/// once the one below it is fully written:
///
/// | Level | Reads | Writes |
/// | ----- | ----- | ------ |
/// | 2 | metadata + file data | `hash_base + levels[1].hash_offset` |
/// | 1 | `hash_base + levels[1].hash_offset` | `hash_base + levels[0].hash_offset` |
/// | 0 | `hash_base + levels[0].hash_offset` | master-hash region |
pub fn populate(
    scratch: &mut ScratchImage,
    tree: &HashTree,
    regions: &Regions,
    stage: Stage<'_>,
) -> BuildResult<[u8; 32]> {
    let Stage { cancel, progress } = stage;
    let hash_base = regions.hash_base;
    let mut read_at = regions.metadata_offset;
    let mut write_at = hash_base + tree.levels[1].hash_offset;

    for i in (0..LEVEL_COUNT).rev() {
        cancel.check()?;
        let level = &tree.levels[i];
        progress.set_stage(&format!("Computing level {i} hashes"));
        log::info!("Computing level {} hashes ({} blocks)", i, level.block_count());
        hash_level(scratch, level, read_at, write_at, progress)?;

        if i == 2 {
            // Level 1 has to begin on a block boundary.
            let end = write_at + level.digest_length();
            scratch.pad_to(align_up(end, tree.levels[1].block_size))?;
        }
        if i > 0 {
            read_at = hash_base + tree.levels[i - 1].hash_offset;
            write_at = if i > 1 {
                hash_base + tree.levels[i - 2].hash_offset
            } else {
                regions.master_hash_offset
            };
        }
    }

    super_block_hash(scratch, tree)
}

/// SHA-256 over the header and master hashes, rounded to a media unit.
pub fn super_block_hash(scratch: &mut ScratchImage, tree: &HashTree) -> BuildResult<[u8; 32]> {
    let mut buf = vec![0u8; tree.super_block_length() as usize];
    scratch.read_at_padded(0, &mut buf)?;
    Ok(Sha256::digest(&buf).into())
}
