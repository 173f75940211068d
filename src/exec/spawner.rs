// src/exec/spawner.rs

//! Pluggable spawner abstraction.
//!
//! The worker talks to a `Spawner` instead of running processes directly, so
//! the same staging code drives a container runtime, a plain subprocess, or a
//! fake in tests.
//!
//! Command templates refer to three logical volumes through placeholders
//! ([`VOLUME_INPUTS`], [`VOLUME_OUTPUTS`], [`VOLUME_CLI_ARGS`]); each spawner
//! substitutes them with the paths its process will actually see.

use std::collections::BTreeMap;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use anyhow::Context;
use tracing::debug;

use crate::errors::Result;

pub const VOLUME_INPUTS: &str = "${_VOLUME_INPUTS}";
pub const VOLUME_OUTPUTS: &str = "${_VOLUME_OUTPUTS}";
pub const VOLUME_CLI_ARGS: &str = "${_VOLUME_CLI_ARGS}";

/// Past this many bytes of arguments, they are passed through a file.
pub const MAX_INLINE_ARGS_LEN: usize = 100_000;

/// File (inside the cli-args volume) holding one argument per line.
pub const ARGUMENTS_FILE_NAME: &str = "arguments.txt";

/// Host-side directories backing the logical volumes.
#[derive(Debug, Clone)]
pub struct Volumes {
    pub inputs: PathBuf,
    pub outputs: PathBuf,
    pub cli_args: PathBuf,
}

/// Everything a spawner needs to run one task.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Deterministic image / cache name derived from the function's content hash.
    pub name: String,
    pub archive_path: PathBuf,
    pub command_template: Vec<String>,
    /// Staged sample directories keyed by sample key. `None` when the
    /// runtime synthesises fake data instead.
    pub data_sample_paths: Option<BTreeMap<String, PathBuf>>,
    pub volumes: Volumes,
    /// `KEY=VALUE` pairs.
    pub envs: Option<Vec<String>>,
}

/// Runs a function archive against staged volumes.
///
/// Resolves to the execution log on success. Fails with
/// `FedplanError::BuildError` when the image/archive cannot be prepared and
/// `FedplanError::ExecutionError` when the process exits non-zero.
pub trait Spawner: Send + Sync {
    fn spawn(
        &self,
        request: SpawnRequest,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>>;
}

/// Replace volume placeholders in every argument.
pub fn substitute_volumes(
    template: &[String],
    inputs: &str,
    outputs: &str,
    cli_args: &str,
) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            arg.replace(VOLUME_INPUTS, inputs)
                .replace(VOLUME_OUTPUTS, outputs)
                .replace(VOLUME_CLI_ARGS, cli_args)
        })
        .collect()
}

/// Move arguments into a file when they get too long for a command line.
///
/// The file is written under `cli_args_dir` (host path) and referenced as
/// `@<runtime_cli_args>/arguments.txt`, the path the spawned process sees.
pub fn args_or_file(
    args: Vec<String>,
    cli_args_dir: &Path,
    runtime_cli_args: &str,
) -> Result<Vec<String>> {
    let total: usize = args.iter().map(|a| a.len() + 1).sum();
    if total <= MAX_INLINE_ARGS_LEN {
        return Ok(args);
    }

    fs::create_dir_all(cli_args_dir)
        .with_context(|| format!("creating cli args dir {:?}", cli_args_dir))?;
    let file = cli_args_dir.join(ARGUMENTS_FILE_NAME);
    fs::write(&file, args.join("\n"))
        .with_context(|| format!("writing arguments file {:?}", file))?;

    debug!(bytes = total, file = ?file, "command line too long; passing arguments by file");
    Ok(vec![format!("@{runtime_cli_args}/{ARGUMENTS_FILE_NAME}")])
}
