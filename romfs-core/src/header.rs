use crate::error::VerifyError;
use crate::levels::{HashLevel, HashTree, LEVEL_COUNT, MAX_BLOCK_SIZE, MAX_DATA_LENGTH, MIN_BLOCK_SIZE};

/// "IVFC" read as a little-endian u32.
pub const IVFC_MAGIC: u32 = 0x4346_5649;
pub const IVFC_VERSION: u32 = 0x0001_0000;

/// Bytes of header proper; the value stored in the header length field.
pub const HEADER_LEN: u64 = 0x5C;
/// Master hashes start right after the header, 16-byte aligned.
pub const MASTER_HASH_OFFSET: u64 = (HEADER_LEN + 0xF) & !0xF;
pub const MEDIA_UNIT_SIZE: u64 = 0x200;

const LEVEL_DESC_LEN: usize = 8 + 8 + 4 + 4;
const LEVELS_OFFSET: usize = 0x0C;
const HEADER_LEN_OFFSET: usize = LEVELS_OFFSET + LEVEL_COUNT * LEVEL_DESC_LEN;

/// Serialize the fixed-layout IVFC header for `tree`.
pub fn encode(tree: &HashTree) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN as usize);
    buf.extend_from_slice(&IVFC_MAGIC.to_le_bytes());
    buf.extend_from_slice(&IVFC_VERSION.to_le_bytes());
    buf.extend_from_slice(&(tree.master_hash_length as u32).to_le_bytes());
    for level in &tree.levels {
        buf.extend_from_slice(&level.hash_offset.to_le_bytes());
        buf.extend_from_slice(&level.data_length.to_le_bytes());
        buf.extend_from_slice(&level.log2_block_size().to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes()); // reserved
    }
    buf.extend_from_slice(&(HEADER_LEN as u32).to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes()); // optional info size
    debug_assert_eq!(buf.len() as u64, HEADER_LEN);
    buf
}

fn u32_at(buf: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(b)
}

fn u64_at(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(b)
}

/// Parse a header back into the tree it describes.
pub fn decode(buf: &[u8]) -> Result<HashTree, VerifyError> {
    if (buf.len() as u64) < HEADER_LEN {
        return Err(VerifyError::BadHeader(format!("{} bytes, need {}", buf.len(), HEADER_LEN)));
    }
    let magic = u32_at(buf, 0);
    if magic != IVFC_MAGIC {
        return Err(VerifyError::BadMagic(magic));
    }
    let version = u32_at(buf, 4);
    if version != IVFC_VERSION {
        return Err(VerifyError::BadHeader(format!("unsupported version {version:#x}")));
    }
    let header_len = u32_at(buf, HEADER_LEN_OFFSET) as u64;
    if header_len != HEADER_LEN {
        return Err(VerifyError::BadHeader(format!("header length {header_len:#x}")));
    }
    let master_hash_length = u32_at(buf, 8) as u64;

    let mut levels = [HashLevel { block_size: 0, data_length: 0, hash_offset: 0 }; LEVEL_COUNT];
    for (i, level) in levels.iter_mut().enumerate() {
        let at = LEVELS_OFFSET + i * LEVEL_DESC_LEN;
        let log2 = u32_at(buf, at + 16);
        let block_size = 1u64.checked_shl(log2).unwrap_or(0);
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
            return Err(VerifyError::BadHeader(format!("level {i} block size 2^{log2}")));
        }
        level.hash_offset = u64_at(buf, at);
        level.data_length = u64_at(buf, at + 8);
        level.block_size = block_size;
    }
    if levels[2].data_length > MAX_DATA_LENGTH {
        return Err(VerifyError::BadHeader(format!("level 2 length {:#x}", levels[2].data_length)));
    }

    // Each level holds exactly one digest per block of the level below it.
    // Checked innermost first so every digest length is computed from a
    // level already known to be bounded.
    for i in [1, 0] {
        let want = levels[i + 1].digest_length();
        if levels[i].data_length != want {
            return Err(VerifyError::BadHeader(format!(
                "level {i} length {:#x}, expected {want:#x}",
                levels[i].data_length
            )));
        }
    }
    if master_hash_length != levels[0].digest_length() {
        return Err(VerifyError::BadHeader(format!(
            "master hash length {master_hash_length:#x}, expected {:#x}",
            levels[0].digest_length()
        )));
    }

    // Offsets must be the running sum of the aligned lengths above them.
    let mut lofs = 0u64;
    for (i, level) in levels.iter().enumerate() {
        if level.hash_offset != lofs {
            return Err(VerifyError::BadHeader(format!(
                "level {i} hash offset {:#x}, expected {lofs:#x}",
                level.hash_offset
            )));
        }
        lofs += level.aligned_length();
    }

    Ok(HashTree { levels, master_hash_length })
}
