use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{BuildError, BuildResult};

/// A regular file found under the build root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceFile {
    /// Path relative to the root, `/`-separated.
    pub rel_path: String,
    pub abs_path: PathBuf,
    pub size: u64,
}

#[derive(Clone, Debug, Default)]
pub struct EnumerateOptions {
    /// Globs matched against the relative path; empty means everything.
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub follow_symlinks: bool,
}

fn build_globset(includes: &[String], excludes: &[String]) -> BuildResult<(GlobSet, GlobSet)> {
    let bad = |e: globset::Error| BuildError::InvalidConfig(e.to_string());
    let mut incb = GlobSetBuilder::new();
    let mut excb = GlobSetBuilder::new();
    if includes.is_empty() {
        incb.add(Glob::new("**/*").map_err(bad)?);
    }
    for g in includes {
        incb.add(Glob::new(g).map_err(bad)?);
    }
    for g in excludes {
        excb.add(Glob::new(g).map_err(bad)?);
    }
    Ok((incb.build().map_err(bad)?, excb.build().map_err(bad)?))
}

/// Walk `root` recursively and return every regular file in a total order:
/// entries of a directory sorted by name, descending into subdirectories in
/// place. The same tree always yields the same sequence.
pub fn enumerate(root: &Path, opts: &EnumerateOptions) -> BuildResult<Vec<SourceFile>> {
    if !root.is_dir() {
        return Err(BuildError::InputDirectoryNotFound(root.to_path_buf()));
    }
    let (inc, exc) = build_globset(&opts.include, &opts.exclude)?;

    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(opts.follow_symlinks)
        .sort_by_file_name();
    for ent in walker {
        let ent = ent.map_err(|e| BuildError::Enumerate { path: root.to_path_buf(), source: e })?;
        if !ent.file_type().is_file() {
            continue;
        }
        let path = ent.path();
        let rel = pathdiff::diff_paths(path, root).unwrap_or_else(|| path.to_path_buf());
        let rel_path = rel.to_string_lossy().replace('\\', "/");
        if !inc.is_match(&rel_path) || exc.is_match(&rel_path) {
            continue;
        }
        let size = ent
            .metadata()
            .map_err(|e| BuildError::Enumerate { path: path.to_path_buf(), source: e })?
            .len();
        files.push(SourceFile { rel_path, abs_path: path.to_path_buf(), size });
    }
    log::debug!("enumerated {} file(s) under {}", files.len(), root.display());
    Ok(files)
}
