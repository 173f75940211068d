// src/exec/worker.rs

//! Single-task executor.
//!
//! [`Worker::schedule_task`] runs one stored task end to end:
//!
//! 1. allocate a scoped working directory (removed on every exit path),
//! 2. move the task to `doing`,
//! 3. load its function,
//! 4. stage inputs (parent models, opener, data samples or fake data),
//! 5. lay out outputs and build the argument template,
//! 6. call the [`Spawner`],
//! 7. let spawner errors propagate to the caller untouched,
//! 8. persist outputs: every file goes to `outputs/<task>`, models become
//!    new assets and performances are recorded on the task,
//! 9. move the task to `done`,
//! 10. update the plan counters and the live performance snapshot.
//!
//! The store lock is taken in short sections and released before any await.
//! Input files are linked and copied on a blocking thread after the lock is
//! released.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::errors::{FedplanError, Result};
use crate::exec::performance::{collect_performances, write_snapshot};
use crate::exec::spawner::{
    SpawnRequest, Spawner, VOLUME_INPUTS, VOLUME_OUTPUTS, Volumes,
};
use crate::exec::staging::{DATA_SAMPLES_DIR, link_file, stage_data_sample};
use crate::models::{
    Addressable, ComputePlan, ComputePlanStatus, DataSample, Dataset, Function, InputSource,
    IoKind, OutModel, OutputValue, Task, TaskErrorType, TaskStatus,
};
use crate::store::{InMemoryAssetStore, SharedStore, filters, lock_store};

pub const TMP_DIR: &str = "tmp";
pub const OUTPUTS_DIR: &str = "outputs";
pub const OPENER_FILE_NAME: &str = "opener.py";
const MODELS_DIR: &str = "models";
const CLI_ARGS_DIR: &str = "cli-args";

/// One entry of the `--inputs` / `--outputs` JSON arguments.
#[derive(Debug, Clone, PartialEq, Serialize)]
struct ResourceRef {
    id: String,
    value: String,
    multiple: bool,
}

/// Staged inputs of one task, ready for the spawner.
#[derive(Debug, Default)]
struct StagedInputs {
    resources: Vec<ResourceRef>,
    data_sample_paths: BTreeMap<String, PathBuf>,
    fake_samples: Option<usize>,
}

pub struct Worker {
    store: SharedStore,
    spawner: Arc<dyn Spawner>,
    worker_dir: PathBuf,
    log_level: String,
}

impl Worker {
    pub fn new(store: SharedStore, spawner: Arc<dyn Spawner>, worker_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            spawner,
            worker_dir: worker_dir.into(),
            log_level: "info".to_string(),
        }
    }

    /// Log level forwarded to the function runtime.
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn worker_dir(&self) -> &Path {
        &self.worker_dir
    }

    /// Execute one task. Returns without running anything when the task or its
    /// plan is no longer runnable.
    pub async fn schedule_task(&self, task_key: &str) -> Result<()> {
        if !self.preflight(task_key)? {
            return Ok(());
        }

        // 1. Scoped working directory.
        let tmp_root = self.worker_dir.join(TMP_DIR);
        fs::create_dir_all(&tmp_root).with_context(|| format!("creating dir {:?}", tmp_root))?;
        let workdir = tempfile::Builder::new()
            .prefix("task-")
            .tempdir_in(&tmp_root)
            .with_context(|| format!("creating task dir in {:?}", tmp_root))?;
        let volumes = Volumes {
            inputs: workdir.path().join("inputs"),
            outputs: workdir.path().join("outputs"),
            cli_args: workdir.path().join(CLI_ARGS_DIR),
        };
        for dir in [&volumes.inputs, &volumes.outputs, &volumes.cli_args] {
            fs::create_dir_all(dir)?;
        }

        // 2-4. Start the task, load its function, stage inputs.
        let (task, function, plan) = {
            let mut store = lock_store(&self.store)?;
            let task = transition_task(&mut store, task_key, TaskStatus::Doing, None)?;
            let function: Function = store.get(&task.function_key)?;
            let plan = resolve_inputs(&store, &task, &function)?;
            (task, function, plan)
        };
        let inputs_dir = volumes.inputs.clone();
        let staged = tokio::task::spawn_blocking(move || plan.materialize(&inputs_dir))
            .await
            .map_err(|e| FedplanError::Other(anyhow::Error::from(e)))??;

        info!(
            task = %task.key,
            compute_plan = %task.compute_plan_key,
            rank = task.rank,
            function = %function.name,
            "executing task"
        );

        // 5. Outputs and arguments.
        let output_files: BTreeMap<String, String> = function
            .outputs
            .keys()
            .map(|id| (id.clone(), Uuid::new_v4().to_string()))
            .collect();
        let output_refs: Vec<ResourceRef> = function
            .outputs
            .iter()
            .map(|(id, output)| ResourceRef {
                id: id.clone(),
                value: format!("{VOLUME_OUTPUTS}/{}", output_files[id]),
                multiple: output.multiple,
            })
            .collect();

        let mut command = vec![
            "--rank".to_string(),
            task.rank.to_string(),
            "--inputs".to_string(),
            serde_json::to_string(&staged.resources)?,
            "--outputs".to_string(),
            serde_json::to_string(&output_refs)?,
            "--log-level".to_string(),
            self.log_level.clone(),
        ];
        if let Some(n) = staged.fake_samples {
            command.extend(["--fake-data".to_string(), "--n-fake-samples".to_string(), n.to_string()]);
        }

        // 6-7. Spawn; errors go straight back to the caller.
        let request = SpawnRequest {
            name: spawn_name(&function.archive.checksum),
            archive_path: PathBuf::from(&function.archive.storage_address),
            command_template: command,
            data_sample_paths: staged.fake_samples.is_none().then_some(staged.data_sample_paths),
            volumes: volumes.clone(),
            envs: Some(vec![
                format!("TASK_KEY={}", task.key),
                format!("COMPUTE_PLAN_KEY={}", task.compute_plan_key),
            ]),
        };
        let logs = self.spawner.spawn(request).await?;
        debug!(task = %task.key, log_bytes = logs.len(), "spawner finished");

        // 8. Persist outputs.
        let permanent_dir = self.worker_dir.join(OUTPUTS_DIR).join(&task.key);
        fs::create_dir_all(&permanent_dir)
            .with_context(|| format!("creating dir {:?}", permanent_dir))?;

        let mut values: BTreeMap<String, OutputValue> = BTreeMap::new();
        let mut new_models: Vec<OutModel> = Vec::new();
        let mut performance_updated = false;

        for (id, output) in &function.outputs {
            let file_name = &output_files[id];
            let produced = volumes.outputs.join(file_name);
            if !produced.is_file() {
                return Err(FedplanError::ExecutionError {
                    name: function.name.clone(),
                    exit_code: Some(0),
                    logs: format!("output '{id}' was not produced\n{logs}"),
                });
            }

            let dest = permanent_dir.join(file_name);
            fs::copy(&produced, &dest)
                .with_context(|| format!("copying {:?} to {:?}", produced, dest))?;

            match output.kind {
                IoKind::Performance => {
                    let raw = fs::read_to_string(&dest)
                        .with_context(|| format!("reading performance {:?}", dest))?;
                    let value: f64 = raw.trim().parse().map_err(|_| FedplanError::ExecutionError {
                        name: function.name.clone(),
                        exit_code: Some(0),
                        logs: format!("output '{id}' is not a number: {:?}", raw.trim()),
                    })?;
                    values.insert(id.clone(), OutputValue::Performance(value));
                    performance_updated = true;
                }
                IoKind::Model => {
                    let permissions = task
                        .outputs
                        .get(id)
                        .map(|o| o.permissions.clone())
                        .ok_or_else(|| {
                            FedplanError::InvalidRequest(format!(
                                "task '{}' has no output '{id}'",
                                task.key
                            ))
                        })?;
                    let model = OutModel {
                        key: Uuid::new_v4().to_string(),
                        compute_task_key: task.key.clone(),
                        address: Addressable {
                            storage_address: dest.to_string_lossy().into_owned(),
                            checksum: hash_file(&dest)?,
                        },
                        permissions,
                        owner: task.worker.clone(),
                        creation_date: Utc::now(),
                    };
                    values.insert(id.clone(), OutputValue::Model(model.clone()));
                    new_models.push(model);
                }
                other => {
                    return Err(FedplanError::InvalidRequest(format!(
                        "output '{id}' has unsupported kind {other:?}"
                    )));
                }
            }
        }

        // 9-10. Finish the task and the plan counters in one critical section.
        let plan = {
            let mut store = lock_store(&self.store)?;
            for model in new_models {
                store.insert(model)?;
            }
            let mut stored: Task = store.get(&task.key)?;
            for (id, value) in values {
                if let Some(output) = stored.outputs.get_mut(&id) {
                    output.value = Some(value);
                }
            }
            store.replace(stored)?;
            transition_task(&mut store, &task.key, TaskStatus::Done, None)?;
            store.get::<ComputePlan>(&task.compute_plan_key)?
        };

        if performance_updated {
            let performances = {
                let store = lock_store(&self.store)?;
                collect_performances(&store, &plan.key)?
            };
            write_snapshot(&self.worker_dir, &performances)?;
        }

        info!(
            task = %task.key,
            compute_plan = %plan.key,
            plan_status = ?plan.status,
            done = plan.done_count,
            total = plan.task_count,
            "task done"
        );
        Ok(())
    }

    /// Whether the task may start. Tasks of a failed or canceled plan that
    /// have not started are canceled instead.
    fn preflight(&self, task_key: &str) -> Result<bool> {
        let mut store = lock_store(&self.store)?;
        let task: Task = store.get(task_key)?;

        if task.status != TaskStatus::Waiting {
            warn!(task = %task_key, status = %task.status, "task is not waiting; skipping");
            return Ok(false);
        }

        let plan: ComputePlan = store.get(&task.compute_plan_key)?;
        if matches!(
            plan.status,
            ComputePlanStatus::Failed | ComputePlanStatus::Canceled
        ) {
            info!(
                task = %task_key,
                compute_plan = %plan.key,
                plan_status = ?plan.status,
                "plan is no longer runnable; canceling task"
            );
            transition_task(&mut store, task_key, TaskStatus::Canceled, None)?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Record a spawner failure on a task that was started.
    pub fn mark_failed(&self, task_key: &str, error: &FedplanError) -> Result<()> {
        let error_type = match error {
            FedplanError::BuildError { .. } => TaskErrorType::Build,
            FedplanError::ExecutionError { .. } => TaskErrorType::Execution,
            _ => TaskErrorType::Internal,
        };
        let mut store = lock_store(&self.store)?;
        let task: Task = store.get(task_key)?;
        if task.status.is_terminal() {
            return Ok(());
        }
        // A task that never started moves through `doing` so counters stay consistent.
        if task.status == TaskStatus::Waiting {
            transition_task(&mut store, task_key, TaskStatus::Doing, None)?;
        }
        transition_task(&mut store, task_key, TaskStatus::Failed, Some(error_type))?;
        warn!(task = %task_key, error_type = ?error_type, error = %error, "task failed");
        Ok(())
    }

    /// Cancel every task of the plan that has not started. Returns how many
    /// were canceled.
    pub fn cancel_waiting_tasks(&self, compute_plan_key: &str) -> Result<usize> {
        let mut store = lock_store(&self.store)?;
        cancel_waiting_tasks(&mut store, compute_plan_key)
    }
}

/// Apply a status change to a stored task and move the plan counters with it.
pub(crate) fn transition_task(
    store: &mut InMemoryAssetStore,
    task_key: &str,
    to: TaskStatus,
    error_type: Option<TaskErrorType>,
) -> Result<Task> {
    let mut task: Task = store.get(task_key)?;
    let from = task.status;
    if !from.can_transition_to(to) {
        return Err(FedplanError::InvalidRequest(format!(
            "task '{task_key}' cannot go from {from} to {to}"
        )));
    }

    let now = Utc::now();
    task.status = to;
    match to {
        TaskStatus::Doing => task.start_date = Some(now),
        TaskStatus::Done | TaskStatus::Failed | TaskStatus::Canceled => task.end_date = Some(now),
        TaskStatus::Waiting => {}
    }
    if error_type.is_some() {
        task.error_type = error_type;
    }

    let mut plan: ComputePlan = store.get(&task.compute_plan_key)?;
    plan.record_transition(from, to, now);
    debug_assert!(plan.counters_consistent());

    store.replace(task.clone())?;
    store.replace(plan)?;
    debug!(task = %task_key, from = %from, to = %to, "task transition");
    Ok(task)
}

pub(crate) fn cancel_waiting_tasks(
    store: &mut InMemoryAssetStore,
    compute_plan_key: &str,
) -> Result<usize> {
    let waiting: Vec<Task> = store.list(
        &filters([
            ("compute_plan_key", vec![compute_plan_key.to_string()]),
            ("status", vec![TaskStatus::Waiting.to_string()]),
        ]),
        None,
        true,
    )?;
    for task in &waiting {
        transition_task(store, &task.key, TaskStatus::Canceled, None)?;
    }
    if !waiting.is_empty() {
        info!(compute_plan = %compute_plan_key, canceled = waiting.len(), "canceled waiting tasks");
    }
    Ok(waiting.len())
}

/// Image / cache name for a function archive.
pub fn spawn_name(checksum: &str) -> String {
    let short = checksum.get(..16).unwrap_or(checksum);
    format!("function-{}", short.to_lowercase())
}

pub fn hash_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("reading {:?}", path))?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

/// Content hash of a file, or of a directory's files and relative paths.
pub fn hash_path(path: &Path) -> Result<String> {
    if !path.is_dir() {
        return hash_file(path);
    }
    let mut hasher = blake3::Hasher::new();
    for entry in WalkDir::new(path).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walking {:?}", path))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(path).unwrap_or(entry.path());
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update(&fs::read(entry.path()).with_context(|| format!("reading {:?}", entry.path()))?);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Resolve a task's inputs against the store. No file is touched here; the
/// returned plan lists the links and copies to perform once the lock is gone.
fn resolve_inputs(
    store: &InMemoryAssetStore,
    task: &Task,
    function: &Function,
) -> Result<StagingPlan> {
    let mut plan = StagingPlan::default();
    let mut samples: Vec<(String, DataSample)> = Vec::new();
    let mut remote_dataset = false;

    for input in &task.inputs {
        let declared = function.inputs.get(&input.identifier).ok_or_else(|| {
            FedplanError::InvalidRequest(format!(
                "input '{}' is not declared by function '{}'",
                input.identifier, function.key
            ))
        })?;

        match input.source()? {
            InputSource::ParentOutput {
                task_key,
                output_identifier,
            } => {
                let parent: Task = store.get(task_key)?;
                let value = parent
                    .outputs
                    .get(output_identifier)
                    .and_then(|o| o.value.as_ref())
                    .ok_or_else(|| {
                        FedplanError::InvalidRequest(format!(
                            "parent task '{task_key}' has no value for output '{output_identifier}'"
                        ))
                    })?;
                let models = value.models().ok_or_else(|| {
                    FedplanError::InvalidRequest(format!(
                        "input '{}' expects a model but parent output '{output_identifier}' of task '{task_key}' is a performance",
                        input.identifier
                    ))
                })?;
                for model in models {
                    let value = plan.link_model(model);
                    plan.staged.resources.push(ResourceRef {
                        id: input.identifier.clone(),
                        value,
                        multiple: declared.multiple,
                    });
                }
            }
            InputSource::Asset(key) => match declared.kind {
                IoKind::DataManager => {
                    let dataset: Dataset = store.get(key)?;
                    remote_dataset |= dataset.is_remote;
                    plan.links.push((
                        PathBuf::from(&dataset.opener.storage_address),
                        PathBuf::from(OPENER_FILE_NAME),
                    ));
                    plan.staged.resources.push(ResourceRef {
                        id: input.identifier.clone(),
                        value: format!("{VOLUME_INPUTS}/{OPENER_FILE_NAME}"),
                        multiple: false,
                    });
                }
                IoKind::DataSample => {
                    let sample: DataSample = store.get(key)?;
                    samples.push((input.identifier.clone(), sample));
                }
                IoKind::Model => {
                    let model: OutModel = store.get(key)?;
                    let value = plan.link_model(&model);
                    plan.staged.resources.push(ResourceRef {
                        id: input.identifier.clone(),
                        value,
                        multiple: declared.multiple,
                    });
                }
                IoKind::Performance => {
                    return Err(FedplanError::InvalidRequest(format!(
                        "input '{}' cannot take a performance asset",
                        input.identifier
                    )));
                }
            },
        }
    }

    for (_, sample) in &samples {
        remote_dataset |= sample.path.is_none();
        for dm_key in &sample.data_manager_keys {
            if let Ok(dataset) = store.get::<Dataset>(dm_key) {
                remote_dataset |= dataset.is_remote;
            }
        }
    }

    if remote_dataset {
        debug!(task = %task.key, samples = samples.len(), "remote dataset; using fake data");
        plan.staged.fake_samples = Some(samples.len());
        return Ok(plan);
    }

    for (identifier, sample) in samples {
        let path = sample.path.ok_or_else(|| {
            FedplanError::InvalidRequest(format!("data sample '{}' has no local path", sample.key))
        })?;
        plan.staged.resources.push(ResourceRef {
            id: identifier,
            value: format!("{VOLUME_INPUTS}/{DATA_SAMPLES_DIR}/{}", sample.key),
            multiple: true,
        });
        plan.samples.push((sample.key, path));
    }

    Ok(plan)
}

/// File operations for one task's inputs, relative to the inputs volume.
#[derive(Debug, Default)]
struct StagingPlan {
    staged: StagedInputs,
    links: Vec<(PathBuf, PathBuf)>,
    samples: Vec<(String, PathBuf)>,
}

impl StagingPlan {
    /// Queue a model link under an opaque name; returns its templated path.
    fn link_model(&mut self, model: &OutModel) -> String {
        let file_name = Uuid::new_v4().to_string();
        self.links.push((
            PathBuf::from(&model.address.storage_address),
            Path::new(MODELS_DIR).join(&file_name),
        ));
        format!("{VOLUME_INPUTS}/{MODELS_DIR}/{file_name}")
    }

    /// Link openers and models, copy data samples. Blocking.
    fn materialize(self, inputs_dir: &Path) -> Result<StagedInputs> {
        let mut staged = self.staged;
        for (src, rel) in &self.links {
            link_file(src, &inputs_dir.join(rel))?;
        }
        for (key, path) in self.samples {
            let staged_dir = stage_data_sample(inputs_dir, &key, &path)?;
            staged.data_sample_paths.insert(key, staged_dir);
        }
        Ok(staged)
    }
}
