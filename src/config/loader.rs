// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::model::{RawWorkspaceFile, WorkspaceFile};
use crate::errors::Result;

pub const URL_ENV_VAR: &str = "FEDPLAN_URL";
pub const TOKEN_ENV_VAR: &str = "FEDPLAN_TOKEN";

/// Load a workspace file and return the raw, unvalidated `RawWorkspaceFile`.
///
/// This only performs TOML deserialization. Use [`load_and_validate`] for
/// the full pipeline.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawWorkspaceFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let config: RawWorkspaceFile = toml::from_str(&contents)?;

    Ok(config)
}

/// Load a workspace file, apply environment overrides and validate it.
///
/// Relative paths in the file are resolved against its directory.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<WorkspaceFile> {
    let path = path.as_ref();
    let mut raw = load_from_path(path)?;
    apply_env_overrides(&mut raw, |name| std::env::var(name).ok());
    let config = WorkspaceFile::try_from(raw)?;
    Ok(config.with_root_dir(config_root_dir(path)))
}

/// `FEDPLAN_URL` / `FEDPLAN_TOKEN` take precedence over the file.
pub fn apply_env_overrides<F>(raw: &mut RawWorkspaceFile, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = lookup(URL_ENV_VAR).filter(|v| !v.is_empty()) {
        debug!(url = %url, "url overridden from environment");
        raw.client.url = Some(url);
    }
    if let Some(token) = lookup(TOKEN_ENV_VAR).filter(|v| !v.is_empty()) {
        debug!("token overridden from environment");
        raw.client.token = Some(token);
    }
}

/// Default workspace file: `Fedplan.toml` in the current directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("Fedplan.toml")
}

/// Directory of the workspace file; the current directory for a bare file name.
pub fn config_root_dir(config_path: &Path) -> PathBuf {
    match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    }
}
