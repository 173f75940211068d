// src/exec/archive.rs

//! Function archives: unpacking and entrypoint discovery.
//!
//! An archive is a directory, a `.zip`, or a `.tar.gz`/`.tgz`. It must hold
//! a `Dockerfile` whose `ENTRYPOINT` names the script and carries a
//! `--function-name` value.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result, anyhow, bail};
use regex::Regex;
use tracing::debug;

use crate::exec::staging::copy_tree;

pub const DESCRIPTOR_FILE_NAME: &str = "Dockerfile";

/// Parsed `ENTRYPOINT ["prog", "arg", ..., "--function-name", "train"]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entrypoint {
    pub program: String,
    pub args: Vec<String>,
    pub function_name: Option<String>,
}

fn entrypoint_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^\s*ENTRYPOINT\s*\[(?P<items>[^\]]*)\]\s*$").expect("valid regex")
    })
}

fn quoted_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#""((?:[^"\\]|\\.)*)""#).expect("valid regex"))
}

/// Parse the exec-form `ENTRYPOINT` line of a Dockerfile.
pub fn parse_entrypoint(dockerfile: &str) -> Result<Entrypoint> {
    let captures = entrypoint_re()
        .captures_iter(dockerfile)
        .last()
        .ok_or_else(|| anyhow!("no exec-form ENTRYPOINT found in {DESCRIPTOR_FILE_NAME}"))?;

    let items: Vec<String> = quoted_re()
        .captures_iter(&captures["items"])
        .map(|c| c[1].replace("\\\"", "\""))
        .collect();

    let (program, args) = items
        .split_first()
        .ok_or_else(|| anyhow!("ENTRYPOINT is empty"))?;

    let function_name = args
        .iter()
        .position(|a| a == "--function-name")
        .and_then(|i| args.get(i + 1))
        .cloned();

    Ok(Entrypoint {
        program: program.clone(),
        args: args.to_vec(),
        function_name,
    })
}

/// Unpack `archive` into `dest` (created if needed).
pub fn unpack_archive(archive: &Path, dest: &Path) -> Result<()> {
    if archive.is_dir() {
        return copy_tree(archive, dest);
    }

    let lower = archive.to_string_lossy().to_lowercase();
    fs::create_dir_all(dest).with_context(|| format!("creating dir {:?}", dest))?;

    if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
        let file = File::open(archive).with_context(|| format!("opening {:?}", archive))?;
        let gz = flate2::read::GzDecoder::new(file);
        tar::Archive::new(gz)
            .unpack(dest)
            .with_context(|| format!("extracting {:?}", archive))?;
    } else if lower.ends_with(".zip") {
        let file = File::open(archive).with_context(|| format!("opening {:?}", archive))?;
        let mut zip = zip::ZipArchive::new(file).with_context(|| format!("reading {:?}", archive))?;
        zip.extract(dest)
            .with_context(|| format!("extracting {:?}", archive))?;
    } else {
        bail!("unsupported archive format: {}", archive.display());
    }

    Ok(())
}

/// Unpack `archive` once into `cache_root/name` and return that directory.
///
/// A directory already present under that name is reused as is.
pub fn prepare_archive_dir(archive: &Path, cache_root: &Path, name: &str) -> Result<PathBuf> {
    let target = cache_root.join(name);
    if target.join(DESCRIPTOR_FILE_NAME).is_file() {
        debug!(name, dir = ?target, "reusing unpacked archive");
        return Ok(target);
    }

    fs::create_dir_all(cache_root).with_context(|| format!("creating dir {:?}", cache_root))?;
    let staging = tempfile::Builder::new()
        .prefix(".unpack-")
        .tempdir_in(cache_root)
        .with_context(|| format!("creating unpack dir in {:?}", cache_root))?;
    unpack_archive(archive, staging.path())?;

    let root = descriptor_root(staging.path())?;
    if target.exists() {
        fs::remove_dir_all(&target).with_context(|| format!("removing stale {:?}", target))?;
    }
    fs::rename(&root, &target).with_context(|| format!("moving unpacked archive to {:?}", target))?;

    debug!(name, dir = ?target, "unpacked archive");
    Ok(target)
}

/// Directory holding the descriptor: the unpack root, or its single child
/// directory when the archive wraps everything in one folder.
fn descriptor_root(dir: &Path) -> Result<PathBuf> {
    if dir.join(DESCRIPTOR_FILE_NAME).is_file() {
        return Ok(dir.to_path_buf());
    }
    let children: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    match children.as_slice() {
        [only] if only.join(DESCRIPTOR_FILE_NAME).is_file() => Ok(only.clone()),
        _ => bail!("archive does not contain a {DESCRIPTOR_FILE_NAME}"),
    }
}
