// src/exec/docker.rs

//! Spawner that builds the function archive as a container image and runs
//! it through the `docker` CLI.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;

use anyhow::Context;
use tokio::process::Command;
use tracing::{debug, info};

use crate::errors::{FedplanError, Result};
use crate::exec::archive::prepare_archive_dir;
use crate::exec::spawner::{SpawnRequest, Spawner, args_or_file, substitute_volumes};
use crate::exec::staging::DATA_SAMPLES_DIR;
use crate::exec::subprocess::{collect_lines, combine_logs, join_lines};

pub const CONTAINER_INPUTS: &str = "/fedplan/inputs";
pub const CONTAINER_OUTPUTS: &str = "/fedplan/outputs";
pub const CONTAINER_CLI_ARGS: &str = "/fedplan/cli-args";

pub struct DockerSpawner {
    docker: String,
    /// Build contexts, one directory per image name.
    cache_dir: PathBuf,
}

impl DockerSpawner {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            docker: "docker".to_string(),
            cache_dir: cache_dir.into(),
        }
    }

    /// Use a different container CLI binary (e.g. `podman`).
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.docker = binary.into();
        self
    }

    async fn image_exists(&self, name: &str) -> bool {
        Command::new(&self.docker)
            .args(["image", "inspect", name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn ensure_image(&self, request: &SpawnRequest) -> Result<()> {
        if self.image_exists(&request.name).await {
            debug!(image = %request.name, "reusing existing image");
            return Ok(());
        }

        let build_error = |message: String| FedplanError::BuildError {
            name: request.name.clone(),
            message,
        };

        let context_dir =
            prepare_archive_dir(&request.archive_path, &self.cache_dir, &request.name)
                .map_err(|e| build_error(format!("{e:#}")))?;

        info!(image = %request.name, context = ?context_dir, "building image");
        let output = Command::new(&self.docker)
            .arg("build")
            .arg("-t")
            .arg(&request.name)
            .arg(&context_dir)
            .output()
            .await
            .map_err(|e| build_error(format!("running {} build: {e}", self.docker)))?;

        if !output.status.success() {
            return Err(build_error(String::from_utf8_lossy(&output.stderr).into_owned()));
        }
        Ok(())
    }

    fn run_args(&self, request: &SpawnRequest) -> Result<Vec<String>> {
        let volumes = &request.volumes;
        let mut args = vec!["run".to_string(), "--rm".to_string()];

        for (host, container) in [
            (&volumes.inputs, CONTAINER_INPUTS),
            (&volumes.outputs, CONTAINER_OUTPUTS),
            (&volumes.cli_args, CONTAINER_CLI_ARGS),
        ] {
            args.push("-v".to_string());
            args.push(mount(host, container, false));
        }

        // Samples staged outside the inputs volume get their own read-only mount.
        if let Some(samples) = &request.data_sample_paths {
            for (key, path) in samples {
                if !path.starts_with(&volumes.inputs) {
                    let target = format!("{CONTAINER_INPUTS}/{DATA_SAMPLES_DIR}/{key}");
                    args.push("-v".to_string());
                    args.push(mount(path, &target, true));
                }
            }
        }

        for pair in request.envs.iter().flatten() {
            args.push("-e".to_string());
            args.push(pair.clone());
        }

        args.push(request.name.clone());

        let task_args = substitute_volumes(
            &request.command_template,
            CONTAINER_INPUTS,
            CONTAINER_OUTPUTS,
            CONTAINER_CLI_ARGS,
        );
        args.extend(args_or_file(task_args, &volumes.cli_args, CONTAINER_CLI_ARGS)?);
        Ok(args)
    }

    async fn run(&self, request: SpawnRequest) -> Result<String> {
        self.ensure_image(&request).await?;
        let args = self.run_args(&request)?;

        info!(image = %request.name, "starting container");
        let mut child = Command::new(&self.docker)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning {} run for '{}'", self.docker, request.name))?;

        let stdout = collect_lines(child.stdout.take(), request.name.clone(), "stdout");
        let stderr = collect_lines(child.stderr.take(), request.name.clone(), "stderr");
        let status = child
            .wait()
            .await
            .with_context(|| format!("waiting for container '{}'", request.name))?;
        let logs = combine_logs(join_lines(stdout).await, join_lines(stderr).await);

        info!(
            image = %request.name,
            exit_code = status.code().unwrap_or(-1),
            success = status.success(),
            "container exited"
        );

        if !status.success() {
            return Err(FedplanError::ExecutionError {
                name: request.name,
                exit_code: status.code(),
                logs,
            });
        }
        Ok(logs)
    }
}

impl Spawner for DockerSpawner {
    fn spawn(
        &self,
        request: SpawnRequest,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + '_>> {
        Box::pin(async move { self.run(request).await })
    }
}

fn mount(host: &Path, container: &str, read_only: bool) -> String {
    let suffix = if read_only { ":ro" } else { "" };
    format!("{}:{container}{suffix}", host.display())
}
