use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::assemble::assemble;
use crate::enumerate::{enumerate, EnumerateOptions};
use crate::error::{BuildError, BuildResult};
use crate::hashtree;
use crate::layout::{plan, FileEntry, FILE_ALIGNMENT};
use crate::levels::{
    self, HashTree, Regions, DEFAULT_BLOCK_SIZE, LEVEL_COUNT, MAX_BLOCK_SIZE, MAX_DATA_LENGTH, MIN_BLOCK_SIZE,
};
use crate::metadata::{MetadataProvider, RomfsMetadata};
use crate::progress::Progress;
use crate::scratch::ScratchImage;

/// Source read granularity while copying files into the image.
pub const DEFAULT_COPY_CHUNK: usize = 0x10_0000;
/// Write granularity of the final scratch-to-destination copy.
pub const DEFAULT_FINALIZE_CHUNK: usize = 0x40_0000;

#[derive(Clone, Debug)]
pub struct BuildConfig {
    pub alignment: u64,
    /// Block size of levels 0, 1 and 2.
    pub block_sizes: [u64; LEVEL_COUNT],
    pub copy_chunk: usize,
    pub finalize_chunk: usize,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            alignment: FILE_ALIGNMENT,
            block_sizes: [DEFAULT_BLOCK_SIZE; LEVEL_COUNT],
            copy_chunk: DEFAULT_COPY_CHUNK,
            finalize_chunk: DEFAULT_FINALIZE_CHUNK,
        }
    }
}

impl BuildConfig {
    pub fn validate(&self) -> BuildResult<()> {
        let bad = |m: String| Err(BuildError::InvalidConfig(m));
        for (i, &bs) in self.block_sizes.iter().enumerate() {
            // A block must hold at least two digests and fit the u32 log2 field.
            if !bs.is_power_of_two() || bs < MIN_BLOCK_SIZE || bs > MAX_BLOCK_SIZE {
                return bad(format!(
                    "level {i} block size {bs:#x} is not a power of two in {MIN_BLOCK_SIZE:#x}..={MAX_BLOCK_SIZE:#x}"
                ));
            }
        }
        let max_align = self.block_sizes[2];
        if !self.alignment.is_power_of_two() || self.alignment > max_align {
            return bad(format!(
                "alignment {:#x} is not a power of two up to the level 2 block size {max_align:#x}",
                self.alignment
            ));
        }
        if self.copy_chunk == 0 || self.finalize_chunk == 0 {
            return bad("chunk sizes must be non-zero".into());
        }
        Ok(())
    }
}

/// Everything one build needs, fixed before the build starts and passed
/// by reference through every stage.
#[derive(Clone)]
pub struct BuildContext {
    pub root: PathBuf,
    pub output: PathBuf,
    /// Directory holding the scratch image; the output's directory by default.
    pub scratch_dir: PathBuf,
    pub config: BuildConfig,
    pub enumerate: EnumerateOptions,
    pub metadata: Arc<dyn MetadataProvider>,
}

impl BuildContext {
    pub fn new(root: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        let output = output.into();
        let scratch_dir = match output.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Self {
            root: root.into(),
            output,
            scratch_dir,
            config: BuildConfig::default(),
            enumerate: EnumerateOptions::default(),
            metadata: Arc::new(RomfsMetadata),
        }
    }

    pub fn with_config(mut self, config: BuildConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_enumerate(mut self, opts: EnumerateOptions) -> Self {
        self.enumerate = opts;
        self
    }

    pub fn with_metadata(mut self, provider: impl MetadataProvider + 'static) -> Self {
        self.metadata = Arc::new(provider);
        self
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }
}

/// Cooperative cancellation flag. Checked between file copies and between
/// hash levels.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> BuildResult<()> {
        if self.is_cancelled() {
            Err(BuildError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Cancellation and progress reporting shared by the writing stages.
#[derive(Clone, Copy)]
pub struct Stage<'a> {
    pub cancel: &'a CancelToken,
    pub progress: &'a Progress,
}

/// Outcome of a finished build.
#[derive(Serialize, Clone, Debug)]
pub struct BuildReport {
    pub created_utc: String,
    pub root: String,
    pub output: String,
    pub files: Vec<FileEntry>,
    pub tree: HashTree,
    pub regions: Regions,
    pub metadata_length: u64,
    pub image_length: u64,
    pub super_block_hash: String,
    #[serde(skip)]
    pub super_block_digest: [u8; 32],
}

/// Build synchronously.
pub fn build(ctx: &BuildContext) -> BuildResult<BuildReport> {
    build_with(ctx, &CancelToken::new(), &Progress::default())
}

/// Build with an external cancel flag and progress sink. Returns only after
/// the destination is fully written (or the build failed and nothing was
/// left behind).
pub fn build_with(
    ctx: &BuildContext,
    cancel: &CancelToken,
    progress: &Progress,
) -> BuildResult<BuildReport> {
    ctx.config.validate()?;

    progress.set_stage("Creating layout");
    log::info!("Creating layout for {}...", ctx.root.display());
    let files = enumerate(&ctx.root, &ctx.enumerate)?;
    let layout = plan(&files, ctx.config.alignment)?;

    progress.set_stage("Creating metadata");
    log::info!("Creating RomFS metadata...");
    let metadata = ctx.metadata.build(&ctx.root, &layout.entries).map_err(BuildError::Metadata)?;
    let metadata_length = metadata.len() as u64;

    log::info!("Computing IVFC header data...");
    let total = metadata_length
        .checked_add(layout.data_end())
        .filter(|&t| t <= MAX_DATA_LENGTH)
        .ok_or_else(|| {
            BuildError::InvalidConfig(format!(
                "{:#x} bytes of metadata plus {:#x} bytes of file data exceed the image limit",
                metadata_length,
                layout.data_end()
            ))
        })?;
    let tree = levels::size(total, ctx.config.block_sizes);
    if tree.master_hash_length > u32::MAX as u64 {
        return Err(BuildError::InvalidConfig(format!(
            "master hash length {:#x} does not fit the header",
            tree.master_hash_length
        )));
    }
    let regions = tree.regions(metadata_length);
    log::debug!("levels: {:?}", tree.levels);
    log::debug!("regions: {:?}", regions);

    cancel.check()?;
    let stage = Stage { cancel, progress };
    let mut scratch = ScratchImage::create_in(&ctx.scratch_dir)?;
    log::info!("Writing level 2 data ({} files)...", layout.len());
    assemble(&mut scratch, &tree, &regions, &metadata, &layout, ctx.config.copy_chunk, stage)?;

    let digest = hashtree::populate(&mut scratch, &tree, &regions, stage)?;
    let super_block_hash = hex::encode_upper(digest);
    log::info!("RomFS super block hash: {}", super_block_hash);

    // Last point where the destination is still untouched.
    cancel.check()?;
    progress.set_stage("Writing binary");
    log::info!("Writing binary to {}...", ctx.output.display());
    let image_length = scratch.persist_copy(&ctx.output, ctx.config.finalize_chunk)?;
    log::info!("Wrote RomFS to {}.", ctx.output.display());

    Ok(BuildReport {
        created_utc: chrono::Utc::now().to_rfc3339(),
        root: ctx.root.to_string_lossy().to_string(),
        output: ctx.output.to_string_lossy().to_string(),
        files: layout.entries,
        tree,
        regions,
        metadata_length,
        image_length,
        super_block_hash,
        super_block_digest: digest,
    })
}

/// A build running on its own thread.
pub struct BuildHandle {
    cancel: CancelToken,
    progress: Progress,
    handle: JoinHandle<BuildResult<BuildReport>>,
}

impl BuildHandle {
    /// Ask the build to stop at its next checkpoint.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the build, including the final copy, and return its result.
    pub fn join(self) -> BuildResult<BuildReport> {
        match self.handle.join() {
            Ok(res) => res,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

/// Start a build in the background. The returned handle must be joined to
/// learn whether the image was written.
pub fn spawn(ctx: BuildContext, progress: Progress) -> BuildHandle {
    let cancel = CancelToken::new();
    let (c, p) = (cancel.clone(), progress.clone());
    let handle = thread::spawn(move || build_with(&ctx, &c, &p));
    BuildHandle { cancel, progress, handle }
}

/// Default output location for `input`: `<folder name>.bin` in `cwd`.
pub fn default_output(cwd: &Path, input: &Path) -> PathBuf {
    let name = input
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "romfs".to_string());
    cwd.join(format!("{name}.bin"))
}
