use anyhow::{bail, Context, Result};
use clap::Parser;
use std::fs::File;
use std::path::PathBuf;

use romfs_core::build::{self, default_output, BuildConfig, BuildContext, CancelToken};
use romfs_core::enumerate::EnumerateOptions;
use romfs_core::layout::FILE_ALIGNMENT;
use romfs_core::levels::{DEFAULT_BLOCK_SIZE, LEVEL_COUNT};
use romfs_core::metadata::EmptyMetadata;
use romfs_core::progress::Progress;
use romfs_core::verify::verify_image;

#[derive(Parser)]
#[command(name = "romfs", version, about = "Build an IVFC-verified RomFS image from a folder")]
struct Cli {
    /// Input folder, relative to the current directory
    input: PathBuf,
    /// Output image [default: <folder>.bin in the current directory]
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Write a JSON build report (layout, levels, super block hash)
    #[arg(long, value_name = "FILE")]
    report: Option<PathBuf>,
    #[arg(long)]
    include: Vec<String>,
    #[arg(long)]
    exclude: Vec<String>,
    #[arg(long, default_value_t = false)]
    follow_symlinks: bool,
    /// Embed no file/directory name table
    #[arg(long, default_value_t = false)]
    no_metadata: bool,
    /// Re-check the written image's hash tree
    #[arg(long, default_value_t = false)]
    verify: bool,
    #[arg(long, default_value_t = false)]
    progress: bool,
    /// Byte alignment of every file inside the data region (power of two,
    /// at most the block size)
    #[arg(long, default_value_t = FILE_ALIGNMENT)]
    alignment: u64,
    /// Hash block size used by all three levels (power of two)
    #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
    block_size: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let cwd = std::env::current_dir()?;
    let root = cwd.join(&cli.input);
    let output = cli.output.clone().unwrap_or_else(|| default_output(&cwd, &cli.input));

    let mut ctx = BuildContext::new(root, output)
        .with_config(BuildConfig {
            alignment: cli.alignment,
            block_sizes: [cli.block_size; LEVEL_COUNT],
            ..Default::default()
        })
        .with_enumerate(EnumerateOptions {
            include: cli.include.clone(),
            exclude: cli.exclude.clone(),
            follow_symlinks: cli.follow_symlinks,
        });
    if cli.no_metadata {
        ctx = ctx.with_metadata(EmptyMetadata);
    }

    let prog = Progress::new(cli.progress);
    prog.start();
    let res = build::build_with(&ctx, &CancelToken::new(), &prog);
    prog.stop();
    let report = res.with_context(|| format!("build {}", ctx.root.display()))?;

    if let Some(path) = &cli.report {
        let f = File::create(path).with_context(|| format!("create {}", path.display()))?;
        serde_json::to_writer_pretty(f, &report)?;
    }

    if cli.verify {
        let vr = verify_image(&ctx.output).with_context(|| format!("verify {}", ctx.output.display()))?;
        if !vr.is_ok() || vr.super_block_hash != report.super_block_digest {
            bail!("verification failed: bad blocks per level {:?}", vr.blocks_bad);
        }
        eprintln!("Verified {} block(s)", vr.blocks_ok.iter().sum::<u64>());
    }

    println!("{}", report.super_block_hash);
    Ok(())
}
