// src/exec/subprocess.rs

//! Spawner that runs a function's entrypoint script directly as a local
//! process, without any container.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::errors::{FedplanError, Result};
use crate::exec::archive::{DESCRIPTOR_FILE_NAME, parse_entrypoint, prepare_archive_dir};
use crate::exec::spawner::{SpawnRequest, Spawner, args_or_file, substitute_volumes};
use crate::exec::staging::stage_data_sample;

/// Overrides the interpreter named by the descriptor's `ENTRYPOINT`.
pub const PYTHON_ENV_VAR: &str = "FEDPLAN_PYTHON";

pub struct SubprocessSpawner {
    /// Where archives are unpacked, one directory per spawn name.
    cache_dir: PathBuf,
}

impl SubprocessSpawner {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }
}

impl Spawner for SubprocessSpawner {
    fn spawn(
        &self,
        request: SpawnRequest,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>> {
        Box::pin(async move { self.run(request).await })
    }
}

impl SubprocessSpawner {
    async fn run(&self, request: SpawnRequest) -> Result<String> {
        let name = request.name.clone();
        let build_error = |message: String| FedplanError::BuildError {
            name: name.clone(),
            message,
        };

        let workdir = prepare_archive_dir(&request.archive_path, &self.cache_dir, &request.name)
            .map_err(|e| build_error(format!("{e:#}")))?;
        let descriptor = std::fs::read_to_string(workdir.join(DESCRIPTOR_FILE_NAME))
            .map_err(|e| build_error(format!("reading {DESCRIPTOR_FILE_NAME}: {e}")))?;
        let entrypoint = parse_entrypoint(&descriptor).map_err(|e| build_error(format!("{e:#}")))?;

        // Samples outside the inputs volume are not visible to the process.
        if let Some(samples) = &request.data_sample_paths {
            for (key, path) in samples {
                if !path.starts_with(&request.volumes.inputs) {
                    stage_data_sample(&request.volumes.inputs, key, path)?;
                }
            }
        }

        let volumes = &request.volumes;
        let task_args = substitute_volumes(
            &request.command_template,
            &path_str(&volumes.inputs),
            &path_str(&volumes.outputs),
            &path_str(&volumes.cli_args),
        );
        let task_args = args_or_file(task_args, &volumes.cli_args, &path_str(&volumes.cli_args))?;

        let program = std::env::var(PYTHON_ENV_VAR).unwrap_or(entrypoint.program.clone());
        let mut cmd = Command::new(&program);
        cmd.args(&entrypoint.args)
            .args(&task_args)
            .current_dir(&workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for pair in request.envs.iter().flatten() {
            if let Some((k, v)) = pair.split_once('=') {
                cmd.env(k, v);
            }
        }

        info!(
            name = %request.name,
            program = %program,
            function = entrypoint.function_name.as_deref().unwrap_or("-"),
            "starting subprocess"
        );

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning '{program}' for '{}'", request.name))
            .map_err(|e| build_error(format!("{e:#}")))?;

        let stdout = collect_lines(child.stdout.take(), request.name.clone(), "stdout");
        let stderr = collect_lines(child.stderr.take(), request.name.clone(), "stderr");

        let status = child
            .wait()
            .await
            .with_context(|| format!("waiting for process of '{}'", request.name))?;
        let stdout = join_lines(stdout).await;
        let stderr = join_lines(stderr).await;

        info!(
            name = %request.name,
            exit_code = status.code().unwrap_or(-1),
            success = status.success(),
            "subprocess exited"
        );

        if !status.success() {
            return Err(FedplanError::ExecutionError {
                name: request.name,
                exit_code: status.code(),
                logs: stderr,
            });
        }

        Ok(combine_logs(stdout, stderr))
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Drain a child stream line by line, echoing at debug level.
pub(crate) fn collect_lines<R>(
    stream: Option<R>,
    name: String,
    label: &'static str,
) -> Option<JoinHandle<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let stream = stream?;
    Some(tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        let mut out = String::new();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(name = %name, "{label}: {line}");
            out.push_str(&line);
            out.push('\n');
        }
        out
    }))
}

pub(crate) async fn join_lines(handle: Option<JoinHandle<String>>) -> String {
    match handle {
        Some(h) => h.await.unwrap_or_default(),
        None => String::new(),
    }
}

pub(crate) fn combine_logs(stdout: String, stderr: String) -> String {
    if stderr.is_empty() {
        stdout
    } else if stdout.is_empty() {
        stderr
    } else {
        format!("{stdout}{stderr}")
    }
}
