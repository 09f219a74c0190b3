use fs2::FileExt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::error::{BuildError, BuildResult};

/// The in-progress image. Every access names its absolute offset; nothing
/// relies on where a previous operation left the file cursor.
///
/// The backing file is exclusively locked while open and removed when the
/// value is dropped, so an aborted build leaves nothing behind.
pub struct ScratchImage {
    file: NamedTempFile,
}

impl ScratchImage {
    /// Create a locked scratch file inside `dir`.
    pub fn create_in(dir: &Path) -> BuildResult<Self> {
        let file = tempfile::Builder::new()
            .prefix(".romfs-")
            .suffix(".tmp")
            .tempfile_in(dir)
            .map_err(BuildError::scratch)?;
        file.as_file().try_lock_exclusive().map_err(BuildError::scratch)?;
        log::debug!("scratch image at {}", file.path().display());
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    fn handle(&mut self) -> &mut File {
        self.file.as_file_mut()
    }

    fn len(&self) -> BuildResult<u64> {
        Ok(self.file.as_file().metadata().map_err(BuildError::scratch)?.len())
    }

    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> BuildResult<()> {
        let f = self.handle();
        f.seek(SeekFrom::Start(offset)).map_err(BuildError::scratch)?;
        f.write_all(buf).map_err(BuildError::scratch)
    }

    /// Fill `buf` from `offset`; bytes past the end of the image read as
    /// zero. Returns how many bytes came from the file.
    pub fn read_at_padded(&mut self, offset: u64, buf: &mut [u8]) -> BuildResult<usize> {
        read_at_padded(self.handle(), offset, buf).map_err(BuildError::scratch)
    }

    /// Extend the image with zeros up to `len`; never shrinks it.
    pub fn pad_to(&mut self, len: u64) -> BuildResult<()> {
        if self.len()? < len {
            self.handle().set_len(len).map_err(BuildError::scratch)?;
        }
        Ok(())
    }

    /// Copy the whole image to `dest` in `chunk`-sized pieces, then delete
    /// the scratch file. A partially written destination is removed.
    pub fn persist_copy(mut self, dest: &Path, chunk: usize) -> BuildResult<u64> {
        let dest_err = |e: io::Error| BuildError::DestinationWriteFailure {
            path: dest.to_path_buf(),
            source: e,
        };
        self.handle().flush().map_err(BuildError::scratch)?;
        let len = self.len()?;

        let copied = (|| -> BuildResult<u64> {
            let mut out = File::create(dest).map_err(dest_err)?;
            let mut buf = vec![0u8; chunk.max(1)];
            let mut off = 0u64;
            while off < len {
                let n = ((len - off) as usize).min(buf.len());
                self.read_at_padded(off, &mut buf[..n])?;
                out.write_all(&buf[..n]).map_err(dest_err)?;
                off += n as u64;
            }
            out.sync_all().map_err(dest_err)?;
            Ok(off)
        })();

        match copied {
            Ok(n) => {
                let scratch: PathBuf = self.path().to_path_buf();
                let _ = self.file.as_file().unlock();
                self.file.close().map_err(BuildError::scratch)?;
                log::debug!("removed scratch image {}", scratch.display());
                Ok(n)
            }
            Err(e) => {
                let _ = std::fs::remove_file(dest);
                Err(e)
            }
        }
    }
}

/// Seek to `offset` and fill `buf`, zero-filling whatever lies past EOF.
/// Returns the number of bytes actually read.
pub fn read_at_padded<F: Read + Seek>(f: &mut F, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    f.seek(SeekFrom::Start(offset))?;
    let mut total = 0;
    while total < buf.len() {
        match f.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    buf[total..].fill(0);
    Ok(total)
}
