//! File/directory name tables embedded ahead of the file data.
//!
//! The default [`RomfsMetadata`] emits the RomFS level-3 layout:
//!
//! | Offset | Content |
//! | -----: | ------- |
//! | 0x00   | header: ten u32 fields, see below |
//! | 0x28   | directory hash buckets (u32 each) |
//! |        | directory entries |
//! |        | file hash buckets (u32 each) |
//! |        | file entries |
//! |        | zero padding to 16 bytes |
//!
//! Header fields in order: header length (0x28), directory hash table
//! offset/length, directory table offset/length, file hash table
//! offset/length, file table offset/length, file data offset. All table
//! links are byte offsets into their own table; [`EMPTY`] marks no link.
//! File data offsets are relative to the first byte after this blob.

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::path::Path;

use crate::layout::{align_up, FileEntry};

pub const EMPTY: u32 = 0xFFFF_FFFF;
pub const METADATA_HEADER_LEN: u32 = 0x28;
const DIR_ENTRY_LEN: u32 = 0x18;
const FILE_ENTRY_LEN: u32 = 0x20;
const BLOB_ALIGN: u64 = 0x10;

/// Produces the opaque blob stored between the master hashes and the file
/// data. Must be deterministic for identical input.
pub trait MetadataProvider: Send + Sync {
    fn build(&self, root: &Path, files: &[FileEntry]) -> Result<Vec<u8>>;
}

/// Embeds nothing; file data starts right at the metadata offset.
#[derive(Clone, Copy, Debug, Default)]
pub struct EmptyMetadata;

impl MetadataProvider for EmptyMetadata {
    fn build(&self, _root: &Path, _files: &[FileEntry]) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }
}

/// RomFS level-3 directory and file tables.
#[derive(Clone, Copy, Debug, Default)]
pub struct RomfsMetadata;

#[derive(Default)]
struct DirNode {
    name: String,
    parent: usize,
    dirs: BTreeMap<String, usize>,
    files: BTreeMap<String, usize>,
}

struct Tree {
    dirs: Vec<DirNode>,
}

impl Tree {
    fn from_entries(files: &[FileEntry]) -> Result<Self> {
        let mut dirs = vec![DirNode::default()];
        for (fi, fe) in files.iter().enumerate() {
            let parts: Vec<&str> = fe.rel_path.split('/').filter(|p| !p.is_empty()).collect();
            let Some((file_name, dir_parts)) = parts.split_last() else {
                bail!("empty path for file #{fi}");
            };
            let mut cur = 0usize;
            for part in dir_parts {
                cur = match dirs[cur].dirs.get(*part) {
                    Some(&d) => d,
                    None => {
                        let id = dirs.len();
                        dirs.push(DirNode { name: part.to_string(), parent: cur, ..Default::default() });
                        dirs[cur].dirs.insert(part.to_string(), id);
                        id
                    }
                };
            }
            if dirs[cur].files.insert(file_name.to_string(), fi).is_some() {
                bail!("duplicate path {:?}", fe.rel_path);
            }
        }
        Ok(Tree { dirs })
    }

    /// Directories in depth-first pre-order, root first.
    fn preorder(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.dirs.len());
        let mut stack = vec![0usize];
        while let Some(d) = stack.pop() {
            out.push(d);
            stack.extend(self.dirs[d].dirs.values().rev());
        }
        out
    }
}

fn utf16_name(name: &str) -> Vec<u16> {
    name.encode_utf16().collect()
}

fn entry_len(base: u32, name: &[u16]) -> u32 {
    base + align_up(name.len() as u64 * 2, 4) as u32
}

/// Bucket hash of a name under the directory at `parent`.
pub fn name_hash(parent: u32, name: &[u16]) -> u32 {
    let mut hash = parent ^ 123_456_789;
    for &unit in name {
        hash = hash.rotate_right(5) ^ unit as u32;
    }
    hash
}

/// Number of hash buckets for `count` entries.
pub fn hash_table_len(count: usize) -> u32 {
    let mut n = count as u32;
    if n < 3 {
        3
    } else if n < 19 {
        n | 1
    } else {
        while [2, 3, 5, 7, 11, 13, 17].iter().any(|p| n % p == 0) {
            n += 1;
        }
        n
    }
}

fn push_name(out: &mut Vec<u8>, name: &[u16]) {
    let start = out.len();
    for unit in name {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    let padded = align_up((out.len() - start) as u64, 4) as usize;
    out.resize(start + padded, 0);
}

impl MetadataProvider for RomfsMetadata {
    fn build(&self, _root: &Path, files: &[FileEntry]) -> Result<Vec<u8>> {
        let tree = Tree::from_entries(files)?;
        let order = tree.preorder();

        // Assign table offsets.
        let mut dir_off = vec![0u32; tree.dirs.len()];
        let mut dir_names = vec![Vec::new(); tree.dirs.len()];
        let mut dir_table_len = 0u32;
        for &d in &order {
            dir_names[d] = utf16_name(&tree.dirs[d].name);
            dir_off[d] = dir_table_len;
            dir_table_len += entry_len(DIR_ENTRY_LEN, &dir_names[d]);
        }
        let mut file_order = Vec::with_capacity(files.len());
        let mut file_off = vec![0u32; files.len()];
        let mut file_names = vec![Vec::new(); files.len()];
        let mut file_table_len = 0u32;
        for &d in &order {
            for (name, &fi) in &tree.dirs[d].files {
                file_names[fi] = utf16_name(name);
                file_off[fi] = file_table_len;
                file_table_len += entry_len(FILE_ENTRY_LEN, &file_names[fi]);
                file_order.push((d, fi));
            }
        }

        // Sibling links follow name order within each directory.
        let mut dir_sibling = vec![EMPTY; tree.dirs.len()];
        let mut file_sibling = vec![EMPTY; files.len()];
        for node in &tree.dirs {
            let ds: Vec<usize> = node.dirs.values().copied().collect();
            for w in ds.windows(2) {
                dir_sibling[w[0]] = dir_off[w[1]];
            }
            let fs: Vec<usize> = node.files.values().copied().collect();
            for w in fs.windows(2) {
                file_sibling[w[0]] = file_off[w[1]];
            }
        }

        // Hash chains: each new entry becomes its bucket's head.
        let dir_buckets = hash_table_len(tree.dirs.len());
        let mut dir_hash = vec![EMPTY; dir_buckets as usize];
        let mut dir_next = vec![EMPTY; tree.dirs.len()];
        for &d in &order {
            let parent = dir_off[tree.dirs[d].parent];
            let b = (name_hash(parent, &dir_names[d]) % dir_buckets) as usize;
            dir_next[d] = dir_hash[b];
            dir_hash[b] = dir_off[d];
        }
        let file_buckets = hash_table_len(files.len());
        let mut file_hash = vec![EMPTY; file_buckets as usize];
        let mut file_next = vec![EMPTY; files.len()];
        for &(d, fi) in &file_order {
            let b = (name_hash(dir_off[d], &file_names[fi]) % file_buckets) as usize;
            file_next[fi] = file_hash[b];
            file_hash[b] = file_off[fi];
        }

        let dir_hash_off = METADATA_HEADER_LEN;
        let dir_hash_len = dir_buckets * 4;
        let dir_table_off = dir_hash_off + dir_hash_len;
        let file_hash_off = dir_table_off + dir_table_len;
        let file_hash_len = file_buckets * 4;
        let file_table_off = file_hash_off + file_hash_len;
        let end = file_table_off as u64 + file_table_len as u64;
        let file_data_off = align_up(end, BLOB_ALIGN);
        let file_data_off = u32::try_from(file_data_off).context("name table exceeds 4 GiB")?;

        let mut out = Vec::with_capacity(file_data_off as usize);
        for v in [
            METADATA_HEADER_LEN,
            dir_hash_off,
            dir_hash_len,
            dir_table_off,
            dir_table_len,
            file_hash_off,
            file_hash_len,
            file_table_off,
            file_table_len,
            file_data_off,
        ] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        for v in &dir_hash {
            out.extend_from_slice(&v.to_le_bytes());
        }
        for &d in &order {
            let node = &tree.dirs[d];
            let child_dir = node.dirs.values().next().map(|&c| dir_off[c]).unwrap_or(EMPTY);
            let child_file = node.files.values().next().map(|&f| file_off[f]).unwrap_or(EMPTY);
            for v in [
                dir_off[node.parent],
                dir_sibling[d],
                child_dir,
                child_file,
                dir_next[d],
                dir_names[d].len() as u32 * 2,
            ] {
                out.extend_from_slice(&v.to_le_bytes());
            }
            push_name(&mut out, &dir_names[d]);
        }
        for v in &file_hash {
            out.extend_from_slice(&v.to_le_bytes());
        }
        for &(d, fi) in &file_order {
            let fe = &files[fi];
            out.extend_from_slice(&dir_off[d].to_le_bytes());
            out.extend_from_slice(&file_sibling[fi].to_le_bytes());
            out.extend_from_slice(&fe.offset.to_le_bytes());
            out.extend_from_slice(&fe.size.to_le_bytes());
            out.extend_from_slice(&file_next[fi].to_le_bytes());
            out.extend_from_slice(&(file_names[fi].len() as u32 * 2).to_le_bytes());
            push_name(&mut out, &file_names[fi]);
        }
        out.resize(file_data_off as usize, 0);
        Ok(out)
    }
}

fn utf16_to_string(units: &[u16]) -> String {
    String::from_utf16_lossy(units)
}

/// A file recovered from a level-3 name table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetaFile {
    pub path: String,
    pub offset: u64,
    pub size: u64,
}

struct TableReader<'a> {
    blob: &'a [u8],
}

impl TableReader<'_> {
    fn u32(&self, at: u64) -> Result<u32> {
        let at = at as usize;
        let b = self.blob.get(at..at + 4).context("name table truncated")?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&self, at: u64) -> Result<u64> {
        Ok(self.u32(at)? as u64 | (self.u32(at + 4)? as u64) << 32)
    }

    fn name(&self, at: u64, len: u32) -> Result<String> {
        let at = at as usize;
        let b = self.blob.get(at..at + len as usize).context("name truncated")?;
        let units: Vec<u16> = b.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
        Ok(utf16_to_string(&units))
    }
}

/// Walk a [`RomfsMetadata`] blob and list every file with its full path,
/// in table order.
pub fn list_files(blob: &[u8]) -> Result<Vec<MetaFile>> {
    let r = TableReader { blob };
    if r.u32(0)? != METADATA_HEADER_LEN {
        bail!("unexpected name table header length");
    }
    let dir_table = r.u32(12)? as u64;
    let dir_table_len = r.u32(16)? as u64;
    let file_table = r.u32(28)? as u64;
    let file_table_len = r.u32(32)? as u64;

    let mut out = Vec::new();
    // (directory offset, path prefix)
    let mut stack = vec![(0u32, String::new())];
    let mut visited = 0u64;
    while let Some((dir, prefix)) = stack.pop() {
        visited += 1;
        if dir as u64 >= dir_table_len || visited > dir_table_len {
            bail!("corrupt directory table");
        }
        let base = dir_table + dir as u64;
        let mut child_dirs = Vec::new();
        let mut child = r.u32(base + 8)?;
        while child != EMPTY {
            if child as u64 >= dir_table_len {
                bail!("corrupt directory link");
            }
            let cbase = dir_table + child as u64;
            let name = r.name(cbase + DIR_ENTRY_LEN as u64, r.u32(cbase + 20)?)?;
            child_dirs.push((child, format!("{prefix}{name}/")));
            child = r.u32(cbase + 4)?;
        }
        let mut file = r.u32(base + 12)?;
        while file != EMPTY {
            if file as u64 >= file_table_len || out.len() as u64 > file_table_len {
                bail!("corrupt file link");
            }
            let fbase = file_table + file as u64;
            let name = r.name(fbase + FILE_ENTRY_LEN as u64, r.u32(fbase + 28)?)?;
            out.push(MetaFile {
                path: format!("{prefix}{name}"),
                offset: r.u64(fbase + 8)?,
                size: r.u64(fbase + 16)?,
            });
            file = r.u32(fbase + 4)?;
        }
        stack.extend(child_dirs.into_iter().rev());
    }
    Ok(out)
}

/// File data offset recorded in a [`RomfsMetadata`] blob header.
pub fn file_data_offset(blob: &[u8]) -> Result<u64> {
    Ok(TableReader { blob }.u32(36)? as u64)
}
