use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Fatal conditions of a build. None of these are retried; every one of
/// them aborts the pipeline and removes the scratch image.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("input directory does not exist: {0}")]
    InputDirectoryNotFound(PathBuf),

    #[error("failed to enumerate {path}: {source}")]
    Enumerate {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("source file unreadable: {path}: {source}")]
    SourceFileUnreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("source file changed during build: {path} (planned {expected} bytes, copied {actual})")]
    SourceFileChanged { path: PathBuf, expected: u64, actual: u64 },

    #[error("scratch image write failed: {0}")]
    ScratchWriteFailure(#[source] io::Error),

    #[error("failed to write destination {path}: {source}")]
    DestinationWriteFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("metadata build failed: {0:#}")]
    Metadata(anyhow::Error),

    #[error("invalid build configuration: {0}")]
    InvalidConfig(String),

    #[error("build cancelled")]
    Cancelled,
}

impl BuildError {
    pub(crate) fn scratch(e: io::Error) -> Self {
        BuildError::ScratchWriteFailure(e)
    }

    pub(crate) fn unreadable(path: impl Into<PathBuf>, e: io::Error) -> Self {
        BuildError::SourceFileUnreadable { path: path.into(), source: e }
    }
}

pub type BuildResult<T> = Result<T, BuildError>;

/// Errors surfaced while checking a finished image.
#[derive(Error, Debug)]
pub enum VerifyError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("bad IVFC magic: {0:#010x}")]
    BadMagic(u32),
    #[error("malformed IVFC header: {0}")]
    BadHeader(String),
}
