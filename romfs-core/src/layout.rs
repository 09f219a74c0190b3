use serde::Serialize;
use std::path::PathBuf;

use crate::enumerate::SourceFile;
use crate::error::{BuildError, BuildResult};

/// Default per-file alignment inside the data region.
pub const FILE_ALIGNMENT: u64 = 0x10;

/// Round `x` up to the next multiple of `a` (`a` must be non-zero).
pub fn align_up(x: u64, a: u64) -> u64 {
    debug_assert!(a > 0, "alignment must be non-zero");
    x + ((a - x % a) % a)
}

/// [`align_up`] that reports overflow instead of wrapping.
pub fn checked_align_up(x: u64, a: u64) -> Option<u64> {
    if a == 0 {
        return None;
    }
    x.checked_add((a - x % a) % a)
}

/// A file with its final position relative to the start of the file data.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct FileEntry {
    pub rel_path: String,
    #[serde(skip)]
    pub abs_path: PathBuf,
    pub offset: u64,
    pub size: u64,
}

impl FileEntry {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// One file to place, with the alignment its offset must honour.
#[derive(Clone, Debug)]
pub struct LayoutInput {
    pub file: SourceFile,
    pub alignment: u64,
}

/// Ordered placements produced by [`plan`].
#[derive(Clone, Debug, Default)]
pub struct Layout {
    pub entries: Vec<FileEntry>,
}

impl Layout {
    /// End of the last placement, 0 when empty.
    pub fn data_end(&self) -> u64 {
        self.entries.last().map(FileEntry::end).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Place every input after the previous one, each at its own alignment.
/// Input order is kept verbatim. Fails if an offset leaves the u64 range.
pub fn plan_aligned<I>(inputs: I) -> BuildResult<Layout>
where
    I: IntoIterator<Item = LayoutInput>,
{
    let mut cur = 0u64;
    let mut entries = Vec::new();
    for LayoutInput { file, alignment } in inputs {
        let placed = checked_align_up(cur, alignment).and_then(|o| Some((o, o.checked_add(file.size)?)));
        let Some((offset, end)) = placed else {
            return Err(BuildError::InvalidConfig(format!(
                "{} does not fit: offset overflows at cursor {cur:#x}",
                file.rel_path
            )));
        };
        cur = end;
        entries.push(FileEntry {
            rel_path: file.rel_path,
            abs_path: file.abs_path,
            offset,
            size: file.size,
        });
    }
    Ok(Layout { entries })
}

/// Place `files` with one shared alignment.
pub fn plan(files: &[SourceFile], alignment: u64) -> BuildResult<Layout> {
    plan_aligned(files.iter().cloned().map(|file| LayoutInput { file, alignment }))
}
