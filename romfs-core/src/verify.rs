use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::VerifyError;
use crate::header::{self, HEADER_LEN};
use crate::levels::{HashTree, HASH_SIZE, LEVEL_COUNT};
use crate::scratch::read_at_padded;

#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub tree: HashTree,
    /// Per level: blocks whose digest matched the stored one.
    pub blocks_ok: [u64; LEVEL_COUNT],
    pub blocks_bad: [u64; LEVEL_COUNT],
    pub super_block_hash: [u8; 32],
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.blocks_bad.iter().all(|&b| b == 0)
    }
}

/// Recompute the whole hash tree of the image at `path` and compare it
/// against the digests stored in it.
pub fn verify_image(path: &Path) -> Result<VerifyReport, VerifyError> {
    let mut f = BufReader::new(File::open(path)?);
    verify_reader(&mut f)
}

pub fn verify_reader<R: Read + Seek>(f: &mut R) -> Result<VerifyReport, VerifyError> {
    let mut hdr = vec![0u8; HEADER_LEN as usize];
    let got = read_at_padded(f, 0, &mut hdr)?;
    if got < hdr.len() {
        return Err(VerifyError::BadHeader(format!("image is only {got} bytes")));
    }
    let tree = header::decode(&hdr)?;
    // Hash placement does not depend on the metadata length.
    let regions = tree.regions(0);
    let len = f.seek(SeekFrom::End(0))?;
    if len < regions.image_length {
        return Err(VerifyError::BadHeader(format!(
            "image is {len:#x} bytes, header describes {:#x}",
            regions.image_length
        )));
    }

    let mut blocks_ok = [0u64; LEVEL_COUNT];
    let mut blocks_bad = [0u64; LEVEL_COUNT];
    for i in (0..LEVEL_COUNT).rev() {
        let level = &tree.levels[i];
        let data_at = if i == 2 {
            regions.metadata_offset
        } else {
            regions.hash_base + level.hash_offset
        };
        let hash_at = if i > 0 {
            regions.hash_base + tree.levels[i - 1].hash_offset
        } else {
            regions.master_hash_offset
        };

        let bs = level.block_size as usize;
        let mut block = vec![0u8; bs];
        let mut stored = [0u8; HASH_SIZE as usize];
        let mut ofs = 0u64;
        let mut idx = 0u64;
        while ofs < level.data_length {
            let n = ((level.data_length - ofs) as usize).min(bs);
            read_at_padded(f, data_at + ofs, &mut block[..n])?;
            block[n..].fill(0);
            read_at_padded(f, hash_at + idx * HASH_SIZE, &mut stored)?;
            if Sha256::digest(&block).as_slice() == stored {
                blocks_ok[i] += 1;
            } else {
                blocks_bad[i] += 1;
            }
            ofs += level.block_size;
            idx += 1;
        }
        if blocks_bad[i] > 0 {
            log::warn!("level {}: {} of {} blocks failed", i, blocks_bad[i], idx);
        }
    }

    let mut sb = vec![0u8; tree.super_block_length() as usize];
    read_at_padded(f, 0, &mut sb)?;
    let super_block_hash = Sha256::digest(&sb).into();

    Ok(VerifyReport { tree, blocks_ok, blocks_bad, super_block_hash })
}
