use std::fs::File;
use std::io::{self, Read};

use crate::build::Stage;
use crate::error::{BuildError, BuildResult};
use crate::header;
use crate::layout::{FileEntry, Layout};
use crate::levels::{HashTree, Regions};
use crate::progress::Progress;
use crate::scratch::ScratchImage;

/// Write header, metadata blob and every planned file into `scratch`.
/// Returns the end-of-data cursor.
pub fn assemble(
    scratch: &mut ScratchImage,
    tree: &HashTree,
    regions: &Regions,
    metadata: &[u8],
    layout: &Layout,
    copy_chunk: usize,
    stage: Stage<'_>,
) -> BuildResult<u64> {
    let Stage { cancel, progress } = stage;
    scratch.write_at(0, &header::encode(tree))?;
    // Master hashes stay zero until the level-0 pass fills them.
    scratch.write_at(regions.metadata_offset, metadata)?;

    progress.set_stage("Writing level 2 data");
    progress.reset_files(layout.len() as u64, layout.data_end());
    let mut buf = vec![0u8; copy_chunk.max(1)];
    for fe in &layout.entries {
        cancel.check()?;
        copy_file(scratch, regions.data_base + fe.offset, fe, &mut buf, progress)?;
        progress.inc_file();
    }

    let end = regions.data_base + layout.data_end();
    debug_assert_eq!(end, regions.data_end);
    Ok(end)
}

fn copy_file(
    scratch: &mut ScratchImage,
    dest: u64,
    fe: &FileEntry,
    buf: &mut [u8],
    progress: &Progress,
) -> BuildResult<()> {
    let unreadable = |e: io::Error| BuildError::unreadable(&fe.abs_path, e);
    let mut src = File::open(&fe.abs_path).map_err(unreadable)?;
    log::debug!("{} -> {:#x} ({} bytes)", fe.rel_path, dest, fe.size);

    let mut copied = 0u64;
    while copied < fe.size {
        let want = ((fe.size - copied) as usize).min(buf.len());
        let n = read_full(&mut src, &mut buf[..want]).map_err(unreadable)?;
        if n == 0 {
            break;
        }
        scratch.write_at(dest + copied, &buf[..n])?;
        copied += n as u64;
        progress.add_bytes(n as u64);
    }
    // Anything beyond the planned size would spill into the next file.
    let mut one = [0u8; 1];
    let extra = read_full(&mut src, &mut one).map_err(unreadable)? as u64;
    if copied != fe.size || extra != 0 {
        return Err(BuildError::SourceFileChanged {
            path: fe.abs_path.clone(),
            expected: fe.size,
            actual: copied + extra,
        });
    }
    Ok(())
}

fn read_full(r: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match r.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}
