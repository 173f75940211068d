// src/exec/staging.rs

//! Filesystem staging helpers for task volumes.
//!
//! Files that the spawned process only reads (openers, parent models) are
//! hard-linked when possible. Data samples are always copied as real trees,
//! since container volumes cannot follow symlinks out of the mount.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;
use walkdir::WalkDir;

pub const DATA_SAMPLES_DIR: &str = "data_samples";

/// Hard-link `src` to `dest`, copying when linking is not possible (e.g.
/// across filesystems).
pub fn link_file(src: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating dir {:?}", parent))?;
    }
    if let Err(err) = fs::hard_link(src, dest) {
        debug!(src = ?src, dest = ?dest, error = %err, "hard link failed; copying instead");
        fs::copy(src, dest).with_context(|| format!("copying {:?} to {:?}", src, dest))?;
    }
    Ok(())
}

/// Recursively copy a directory (or a single file) to `dest`.
pub fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    if src.is_file() {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(src, dest).with_context(|| format!("copying {:?} to {:?}", src, dest))?;
        return Ok(());
    }

    for entry in WalkDir::new(src).follow_links(true) {
        let entry = entry.with_context(|| format!("walking {:?}", src))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .with_context(|| format!("relativising {:?}", entry.path()))?;
        let target = dest.join(rel);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).with_context(|| format!("creating dir {:?}", target))?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)
                .with_context(|| format!("copying {:?} to {:?}", entry.path(), target))?;
        }
    }
    Ok(())
}

/// Copy one data sample into `<inputs_dir>/data_samples/<key>`.
///
/// Returns the staged directory. A directory already staged under that key is
/// left untouched, so staging the same sample twice is a no-op.
pub fn stage_data_sample(inputs_dir: &Path, key: &str, sample_path: &Path) -> Result<PathBuf> {
    let target = inputs_dir.join(DATA_SAMPLES_DIR).join(key);
    if target.exists() {
        debug!(data_sample = %key, "data sample already staged");
        return Ok(target);
    }

    if sample_path.is_dir() {
        copy_tree(sample_path, &target)?;
    } else {
        let name = sample_path
            .file_name()
            .with_context(|| format!("data sample path {:?} has no file name", sample_path))?;
        fs::create_dir_all(&target)?;
        fs::copy(sample_path, target.join(name))
            .with_context(|| format!("copying {:?}", sample_path))?;
    }

    debug!(data_sample = %key, dir = ?target, "staged data sample");
    Ok(target)
}
