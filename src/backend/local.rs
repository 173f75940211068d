// src/backend/local.rs

//! Local backend: assets live in the shared in-memory store and tasks run
//! through a [`Worker`] as soon as they are submitted.
//!
//! Plan submissions are validated completely before anything is committed.
//! Execution is sequential in rank order and fail-fast: the first task that
//! fails is marked `failed`, every task that has not started is `canceled`,
//! and the original error is returned.
//!
//! In hybrid mode a [`RemoteBackend`] is attached as a read-only source:
//! assets missing locally are fetched from it and cached, remote datasets are
//! flagged so their samples are replaced by fake data, and remote function
//! archives are downloaded into the worker directory.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backend::remote::RemoteBackend;
use crate::dag::ComputePlanBuilder;
use crate::errors::{FedplanError, Result};
use crate::exec::performance::{Performances, collect_performances};
use crate::exec::staging::copy_tree;
use crate::exec::worker::{cancel_waiting_tasks, hash_path};
use crate::exec::{Spawner, Worker};
use crate::models::task::parent_keys;
use crate::models::{
    Addressable, Asset, AssetKind, ComputePlan, ComputePlanStatus, ComputeTaskOutput,
    DataSample, Dataset, Function, InputRef, InputSource, IoKind, Organization, Task,
    TaskStatus, validate_metadata,
};
use crate::schemas::{
    ComputePlanRequest, DataSampleRequest, DatasetRequest, FunctionRequest, TaskRequest,
    UpdateComputePlanTasksRequest, UpdateRequest,
};
use crate::store::filters::sort_rows;
use crate::store::{Filters, InMemoryAssetStore, SharedStore, filters, lock_store};

const REMOTE_CACHE_DIR: &str = "remote";

pub struct LocalBackend {
    store: SharedStore,
    worker: Worker,
    organization: String,
    worker_dir: PathBuf,
    remote: Option<RemoteBackend>,
}

impl LocalBackend {
    pub fn new(
        store: SharedStore,
        spawner: Arc<dyn Spawner>,
        worker_dir: impl Into<PathBuf>,
        organization: impl Into<String>,
    ) -> Self {
        let worker_dir = worker_dir.into();
        Self {
            worker: Worker::new(store.clone(), spawner, worker_dir.clone()),
            store,
            organization: organization.into(),
            worker_dir,
            remote: None,
        }
    }

    /// Read missing assets from `remote` (hybrid mode).
    pub fn with_remote(mut self, remote: RemoteBackend) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.worker = self.worker.with_log_level(level);
        self
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn organization(&self) -> &str {
        &self.organization
    }

    pub fn is_hybrid(&self) -> bool {
        self.remote.is_some()
    }

    // ---------------------------------------------------------------------
    // Datasets, samples, functions
    // ---------------------------------------------------------------------

    pub fn add_dataset(&self, request: DatasetRequest) -> Result<String> {
        validate_metadata(&request.metadata)?;
        let key = request.key.unwrap_or_else(new_key);
        let opener = addressable(&request.opener, "opener")?;
        let description = request
            .description
            .as_deref()
            .map(|p| addressable(p, "description"))
            .transpose()?;

        let dataset = Dataset {
            key: key.clone(),
            name: request.name,
            owner: self.organization.clone(),
            opener,
            description,
            data_sample_keys: Vec::new(),
            permissions: request.permissions,
            metadata: request.metadata,
            creation_date: Utc::now(),
            is_remote: false,
        };
        lock_store(&self.store)?.insert(dataset)?;
        info!(dataset = %key, "dataset added");
        Ok(key)
    }

    /// Register a sample and link it to each of its datasets.
    pub async fn add_data_sample(&self, request: DataSampleRequest) -> Result<String> {
        if request.data_manager_keys.is_empty() {
            return Err(FedplanError::InvalidRequest(
                "a data sample needs at least one data_manager_key".to_string(),
            ));
        }
        for dm_key in &request.data_manager_keys {
            self.ensure_local(AssetKind::Dataset, dm_key).await?;
        }
        let path = fs::canonicalize(&request.path).map_err(|e| {
            FedplanError::InvalidRequest(format!(
                "data sample path {} is not readable: {e}",
                request.path.display()
            ))
        })?;
        let key = request.key.unwrap_or_else(new_key);

        let mut store = lock_store(&self.store)?;
        let mut datasets: Vec<Dataset> = request
            .data_manager_keys
            .iter()
            .map(|k| store.get(k))
            .collect::<Result<_>>()?;

        store.insert(DataSample {
            key: key.clone(),
            owner: self.organization.clone(),
            path: Some(path),
            data_manager_keys: dedup(request.data_manager_keys),
            creation_date: Utc::now(),
        })?;
        for dataset in &mut datasets {
            push_unique(&mut dataset.data_sample_keys, &key);
            store.replace(dataset.clone())?;
        }
        info!(data_sample = %key, datasets = datasets.len(), "data sample added");
        Ok(key)
    }

    pub fn add_function(&self, request: FunctionRequest) -> Result<String> {
        validate_metadata(&request.metadata)?;
        let key = request.key.unwrap_or_else(new_key);
        let archive = addressable(&request.archive, "archive")?;
        let description = request
            .description
            .as_deref()
            .map(|p| addressable(p, "description"))
            .transpose()?;

        let function = Function {
            key: key.clone(),
            name: request.name,
            category: request.category,
            owner: self.organization.clone(),
            archive,
            description,
            inputs: request.inputs,
            outputs: request.outputs,
            permissions: request.permissions,
            metadata: request.metadata,
            creation_date: Utc::now(),
        };
        lock_store(&self.store)?.insert(function)?;
        info!(function = %key, "function added");
        Ok(key)
    }

    // ---------------------------------------------------------------------
    // Tasks and compute plans
    // ---------------------------------------------------------------------

    /// Submit one task and run it.
    ///
    /// With `compute_plan_key` the task joins that plan and its rank is
    /// derived from its parents. Without it a new plan is created; the task
    /// must then be a root (rank 0).
    pub async fn add_task(&self, request: TaskRequest) -> Result<String> {
        self.fetch_dependencies(&request.function_key, &request.inputs)
            .await?;
        let key = request.key.clone().unwrap_or_else(new_key);

        let plan_key = {
            let mut store = lock_store(&self.store)?;
            if store.contains(AssetKind::Task, &key) {
                return Err(FedplanError::KeyAlreadyExists {
                    kind: AssetKind::Task,
                    key,
                });
            }
            validate_task(&store, &key, &request, &BTreeMap::new())?;

            let parents: Vec<Task> = parent_keys(&request.inputs)
                .into_iter()
                .map(|k| store.get::<Task>(k))
                .collect::<Result<_>>()?;
            let rank = parents.iter().map(|p| p.rank + 1).max().unwrap_or(0);
            if let Some(claimed) = request.rank
                && claimed != rank
            {
                return Err(FedplanError::InvalidRequest(format!(
                    "task '{key}' claims rank {claimed} but its parents give rank {rank}"
                )));
            }

            let plan_key = match &request.compute_plan_key {
                Some(plan_key) => {
                    let plan: ComputePlan = store.get(plan_key)?;
                    ensure_open(&plan)?;
                    if let Some(foreign) = parents.iter().find(|p| &p.compute_plan_key != plan_key) {
                        return Err(FedplanError::InvalidRequest(format!(
                            "parent task '{}' belongs to compute plan '{}', not '{plan_key}'",
                            foreign.key, foreign.compute_plan_key
                        )));
                    }
                    plan_key.clone()
                }
                None => {
                    if rank != 0 {
                        return Err(FedplanError::InvalidRequest(format!(
                            "task '{key}' has parents; it must name the compute_plan_key they belong to"
                        )));
                    }
                    let plan = ComputePlan::new(
                        new_key(),
                        format!("compute plan of task {key}"),
                        self.organization.clone(),
                        Utc::now(),
                    );
                    let plan_key = plan.key.clone();
                    store.insert(plan)?;
                    plan_key
                }
            };

            let task = self.new_task(request, key.clone(), &plan_key, rank);
            register_tasks(&mut store, &plan_key, vec![task])?;
            plan_key
        };

        self.run_tasks(&plan_key, std::slice::from_ref(&key)).await?;
        Ok(key)
    }

    /// Create a plan with all of its tasks, then run them in rank order.
    pub async fn add_compute_plan(&self, request: ComputePlanRequest) -> Result<ComputePlan> {
        validate_metadata(&request.metadata)?;
        let key = request.key.clone().unwrap_or_else(new_key);
        for (_, entry) in request.batches.iter() {
            self.fetch_dependencies(&entry.function_key, &entry.inputs)
                .await?;
        }

        let ranked = ComputePlanBuilder::new(&key).build_ranked(&request.batches)?;

        let task_keys = {
            let mut store = lock_store(&self.store)?;
            if store.contains(AssetKind::ComputePlan, &key) {
                return Err(FedplanError::KeyAlreadyExists {
                    kind: AssetKind::ComputePlan,
                    key,
                });
            }
            validate_submission(&store, &ranked)?;

            if request.delete_intermediary_models {
                warn!(compute_plan = %key, "delete_intermediary_models is not supported locally; models are kept");
            }
            let mut plan = ComputePlan::new(
                key.clone(),
                request.name,
                self.organization.clone(),
                Utc::now(),
            );
            plan.tag = request.tag;
            plan.metadata = request.metadata;
            plan.delete_intermediary_models = request.delete_intermediary_models;
            store.insert(plan)?;

            self.commit_ranked(&mut store, &key, ranked)?
        };

        info!(compute_plan = %key, tasks = task_keys.len(), "compute plan created");
        self.run_tasks(&key, &task_keys).await?;
        lock_store(&self.store)?.get(&key)
    }

    /// Add tasks to an existing plan. New tasks may depend on tasks already in
    /// the plan.
    pub async fn add_compute_plan_tasks(
        &self,
        request: UpdateComputePlanTasksRequest,
    ) -> Result<ComputePlan> {
        for (_, entry) in request.batches.iter() {
            self.fetch_dependencies(&entry.function_key, &entry.inputs)
                .await?;
        }

        let (ranked, existing) = {
            let store = lock_store(&self.store)?;
            let plan: ComputePlan = store.get(&request.key)?;
            ensure_open(&plan)?;
            let existing: BTreeMap<String, u32> = plan_tasks(&store, &request.key)?
                .into_iter()
                .map(|t| (t.key, t.rank))
                .collect();
            let ranked = ComputePlanBuilder::new(&request.key)
                .with_existing_ranks(existing.clone())
                .build_ranked(&request.batches)?;
            (ranked, existing)
        };

        let task_keys = {
            let mut store = lock_store(&self.store)?;
            validate_submission(&store, &ranked)?;
            self.commit_ranked(&mut store, &request.key, ranked)?
        };

        info!(
            compute_plan = %request.key,
            existing = existing.len(),
            added = task_keys.len(),
            "compute plan extended"
        );
        self.run_tasks(&request.key, &task_keys).await?;
        lock_store(&self.store)?.get(&request.key)
    }

    fn commit_ranked(
        &self,
        store: &mut InMemoryAssetStore,
        plan_key: &str,
        ranked: Vec<TaskRequest>,
    ) -> Result<Vec<String>> {
        let tasks: Vec<Task> = ranked
            .into_iter()
            .map(|request| {
                let key = request.key.clone().unwrap_or_else(new_key);
                let rank = request.rank.unwrap_or(0);
                self.new_task(request, key, plan_key, rank)
            })
            .collect();
        let keys = tasks.iter().map(|t| t.key.clone()).collect();
        register_tasks(store, plan_key, tasks)?;
        Ok(keys)
    }

    fn new_task(&self, request: TaskRequest, key: String, plan_key: &str, rank: u32) -> Task {
        let outputs = request
            .outputs
            .into_iter()
            .map(|(id, output)| {
                (
                    id,
                    ComputeTaskOutput {
                        permissions: output.permissions,
                        transient: output.transient,
                        value: None,
                    },
                )
            })
            .collect();

        Task {
            key,
            category: request.category,
            function_key: request.function_key,
            owner: self.organization.clone(),
            worker: request.worker,
            compute_plan_key: plan_key.to_string(),
            rank,
            status: TaskStatus::Waiting,
            inputs: request.inputs.iter().map(InputRef::normalized).collect(),
            outputs,
            metadata: request.metadata,
            tag: request.tag,
            creation_date: Utc::now(),
            start_date: None,
            end_date: None,
            error_type: None,
        }
    }

    /// Run tasks one after the other; stop the plan at the first failure.
    async fn run_tasks(&self, plan_key: &str, task_keys: &[String]) -> Result<()> {
        for key in task_keys {
            if let Err(err) = self.worker.schedule_task(key).await {
                error!(task = %key, compute_plan = %plan_key, error = %err, "task failed; stopping compute plan");
                if let Err(mark_err) = self.worker.mark_failed(key, &err) {
                    warn!(task = %key, error = %mark_err, "could not mark task failed");
                }
                if let Err(cancel_err) = self.worker.cancel_waiting_tasks(plan_key) {
                    warn!(compute_plan = %plan_key, error = %cancel_err, "could not cancel remaining tasks");
                }
                return Err(err);
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Reads and updates
    // ---------------------------------------------------------------------

    pub async fn get_asset(&self, kind: AssetKind, key: &str) -> Result<Asset> {
        let local = lock_store(&self.store)?.get_asset(kind, key);
        match local {
            Err(FedplanError::NotFound(_)) if self.remote.is_some() => {
                self.ensure_local(kind, key).await?;
                lock_store(&self.store)?.get_asset(kind, key)
            }
            other => other,
        }
    }

    pub async fn list_assets(
        &self,
        kind: AssetKind,
        filters: &Filters,
        order_by: Option<&str>,
        ascending: bool,
    ) -> Result<Vec<Asset>> {
        let mut assets = lock_store(&self.store)?.list_assets(kind, filters, order_by, ascending)?;
        if let Some(remote) = &self.remote {
            let known: BTreeSet<String> = assets.iter().map(|a| a.key().to_string()).collect();
            let remote_assets = remote.list_assets(kind, filters, order_by, ascending).await?;
            assets.extend(
                remote_assets
                    .into_iter()
                    .filter(|a| !known.contains(a.key())),
            );
            if let Some(field) = order_by {
                let mut rows = assets
                    .into_iter()
                    .map(|asset| asset.to_value().map(|value| (asset, value)))
                    .collect::<Result<Vec<_>>>()?;
                sort_rows(&mut rows, field, ascending);
                assets = rows.into_iter().map(|(asset, _)| asset).collect();
            }
        }
        Ok(assets)
    }

    /// Shallow merge of `name` and `metadata` into a dataset, function or
    /// compute plan.
    pub fn update(&self, kind: AssetKind, key: &str, request: UpdateRequest) -> Result<()> {
        if !matches!(
            kind,
            AssetKind::Dataset | AssetKind::Function | AssetKind::ComputePlan
        ) {
            return Err(FedplanError::InvalidRequest(format!(
                "{kind} assets cannot be updated"
            )));
        }
        if let Some(metadata) = &request.metadata {
            validate_metadata(metadata)?;
        }

        let mut store = lock_store(&self.store)?;
        let mut value = store.get_asset(kind, key)?.to_value()?;
        if let Some(name) = request.name {
            value["name"] = serde_json::Value::String(name);
        }
        if let Some(metadata) = request.metadata {
            value["metadata"] = serde_json::to_value(metadata)?;
        }
        store.update(Asset::from_value(kind, value)?)?;
        info!(%kind, key, "asset updated");
        Ok(())
    }

    pub fn link_dataset_with_data_samples(
        &self,
        dataset_key: &str,
        data_sample_keys: &[String],
    ) -> Result<Vec<String>> {
        let mut store = lock_store(&self.store)?;
        let mut dataset: Dataset = store.get(dataset_key)?;
        let samples: Vec<DataSample> = data_sample_keys
            .iter()
            .map(|k| store.get(k))
            .collect::<Result<_>>()?;

        for mut sample in samples {
            push_unique(&mut sample.data_manager_keys, dataset_key);
            push_unique(&mut dataset.data_sample_keys, &sample.key);
            store.replace(sample)?;
        }
        store.replace(dataset)?;
        info!(dataset = %dataset_key, samples = data_sample_keys.len(), "data samples linked");
        Ok(data_sample_keys.to_vec())
    }

    /// Remove the link in both directions. Returns the keys that were linked.
    pub fn unlink_dataset_with_data_samples(
        &self,
        dataset_key: &str,
        data_sample_keys: &[String],
    ) -> Result<Vec<String>> {
        let mut store = lock_store(&self.store)?;
        let mut dataset: Dataset = store.get(dataset_key)?;
        let samples: Vec<DataSample> = data_sample_keys
            .iter()
            .map(|k| store.get(k))
            .collect::<Result<_>>()?;

        let mut unlinked = Vec::new();
        for mut sample in samples {
            let before = sample.data_manager_keys.len();
            sample.data_manager_keys.retain(|k| k != dataset_key);
            dataset.data_sample_keys.retain(|k| k != &sample.key);
            if sample.data_manager_keys.len() != before {
                unlinked.push(sample.key.clone());
            }
            store.replace(sample)?;
        }
        store.replace(dataset)?;
        info!(dataset = %dataset_key, samples = unlinked.len(), "data samples unlinked");
        Ok(unlinked)
    }

    /// Copy the file behind an asset (opener, archive, model) into `dest_dir`.
    pub async fn download(&self, kind: AssetKind, key: &str, dest_dir: &Path) -> Result<PathBuf> {
        let source = match self.get_asset(kind, key).await? {
            Asset::Dataset(d) => d.opener.storage_address,
            Asset::Function(f) => f.archive.storage_address,
            Asset::Model(m) => m.address.storage_address,
            other => {
                return Err(FedplanError::InvalidRequest(format!(
                    "{} assets have no downloadable file",
                    other.kind()
                )));
            }
        };
        let source = PathBuf::from(source);
        let file_name = source.file_name().ok_or_else(|| {
            FedplanError::InvalidRequest(format!("{kind} '{key}' has no file name"))
        })?;
        let dest = dest_dir.join(file_name);
        fs::create_dir_all(dest_dir)?;
        copy_tree(&source, &dest)?;
        info!(%kind, key, path = ?dest, "asset downloaded");
        Ok(dest)
    }

    /// Text of a dataset's or function's description.
    pub async fn describe(&self, kind: AssetKind, key: &str) -> Result<String> {
        let description = match self.get_asset(kind, key).await? {
            Asset::Dataset(d) => d.description,
            Asset::Function(f) => f.description,
            other => {
                return Err(FedplanError::InvalidRequest(format!(
                    "{} assets have no description",
                    other.kind()
                )));
            }
        };
        let description = description
            .ok_or_else(|| FedplanError::NotFound(format!("description of {kind} '{key}'")))?;
        Ok(fs::read_to_string(&description.storage_address)?)
    }

    /// Cancel a plan: tasks that have not started become `canceled`.
    pub fn cancel_compute_plan(&self, key: &str) -> Result<ComputePlan> {
        let mut store = lock_store(&self.store)?;
        let plan: ComputePlan = store.get(key)?;
        if plan.status.is_terminal() {
            return Err(FedplanError::InvalidRequest(format!(
                "compute plan '{key}' is already {:?}",
                plan.status
            )));
        }
        cancel_waiting_tasks(&mut store, key)?;
        let mut plan: ComputePlan = store.get(key)?;
        plan.cancel(Utc::now());
        store.replace(plan.clone())?;
        info!(compute_plan = %key, "compute plan canceled");
        Ok(plan)
    }

    pub fn get_performances(&self, compute_plan_key: &str) -> Result<Performances> {
        let store = lock_store(&self.store)?;
        store.get::<ComputePlan>(compute_plan_key)?;
        collect_performances(&store, compute_plan_key)
    }

    /// Plans run to completion on submission, so this only reads the plan.
    pub fn wait_compute_plan(&self, key: &str) -> Result<ComputePlan> {
        lock_store(&self.store)?.get(key)
    }

    /// Distinct organizations seen as owners or workers.
    pub fn list_organizations(&self) -> Result<Vec<Organization>> {
        let store = lock_store(&self.store)?;
        let none = Filters::new();
        let mut ids: BTreeSet<String> = BTreeSet::new();
        ids.insert(self.organization.clone());
        for dataset in store.list::<Dataset>(&none, None, true)? {
            ids.insert(dataset.owner);
        }
        for function in store.list::<Function>(&none, None, true)? {
            ids.insert(function.owner);
        }
        for task in store.list::<Task>(&none, None, true)? {
            ids.insert(task.owner);
            ids.insert(task.worker);
        }
        Ok(ids
            .into_iter()
            .map(|id| Organization {
                is_current: id == self.organization,
                id,
            })
            .collect())
    }

    // ---------------------------------------------------------------------
    // Hybrid mode
    // ---------------------------------------------------------------------

    async fn fetch_dependencies(&self, function_key: &str, inputs: &[InputRef]) -> Result<()> {
        if self.remote.is_none() {
            return Ok(());
        }
        self.ensure_local(AssetKind::Function, function_key).await?;
        let function: Function = lock_store(&self.store)?.get(function_key)?;
        for input in inputs {
            let Ok(InputSource::Asset(key)) = input.source() else {
                continue;
            };
            // Undeclared identifiers are reported by validation.
            let Some(kind) = function
                .inputs
                .get(&input.identifier)
                .and_then(|declared| asset_kind_of(declared.kind))
            else {
                continue;
            };
            self.ensure_local(kind, key).await?;
        }
        Ok(())
    }

    /// Make `(kind, key)` available locally, fetching it from the remote
    /// backend when missing.
    async fn ensure_local(&self, kind: AssetKind, key: &str) -> Result<()> {
        if lock_store(&self.store)?.contains(kind, key) {
            return Ok(());
        }
        let Some(remote) = &self.remote else {
            return Err(FedplanError::NotFound(format!("{kind} '{key}'")));
        };

        let cache = self.worker_dir.join(REMOTE_CACHE_DIR).join(kind.to_string()).join(key);
        let asset = match remote.get_asset(kind, key).await? {
            Asset::Function(mut function) => {
                let path = remote.download(AssetKind::Function, key, &cache).await?;
                function.archive.storage_address = path.to_string_lossy().into_owned();
                Asset::Function(function)
            }
            Asset::Dataset(mut dataset) => {
                let path = remote.download(AssetKind::Dataset, key, &cache).await?;
                dataset.opener.storage_address = path.to_string_lossy().into_owned();
                dataset.is_remote = true;
                Asset::Dataset(dataset)
            }
            Asset::DataSample(mut sample) => {
                sample.path = None;
                Asset::DataSample(sample)
            }
            other => other,
        };

        info!(%kind, key, "cached remote asset");
        match lock_store(&self.store)?.add(asset) {
            Ok(()) | Err(FedplanError::KeyAlreadyExists { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// Insert new tasks and register them on their plan.
fn register_tasks(store: &mut InMemoryAssetStore, plan_key: &str, tasks: Vec<Task>) -> Result<()> {
    let count = tasks.len() as u32;
    for task in tasks {
        store.insert(task)?;
    }
    let mut plan: ComputePlan = store.get(plan_key)?;
    plan.add_tasks(count, Utc::now());
    store.replace(plan)
}

fn plan_tasks(store: &InMemoryAssetStore, plan_key: &str) -> Result<Vec<Task>> {
    store.list(&filters([("compute_plan_key", vec![plan_key])]), None, true)
}

fn ensure_open(plan: &ComputePlan) -> Result<()> {
    if matches!(
        plan.status,
        ComputePlanStatus::Failed | ComputePlanStatus::Canceled
    ) {
        return Err(FedplanError::InvalidRequest(format!(
            "compute plan '{}' is {:?}; no tasks can be added",
            plan.key, plan.status
        )));
    }
    Ok(())
}

/// Validate a ranked batch against the store and itself, before any commit.
fn validate_submission(store: &InMemoryAssetStore, ranked: &[TaskRequest]) -> Result<()> {
    let mut pending: BTreeMap<String, &TaskRequest> = BTreeMap::new();
    for request in ranked {
        if let Some(key) = &request.key {
            pending.insert(key.clone(), request);
        }
    }
    for (key, request) in &pending {
        if store.contains(AssetKind::Task, key) {
            return Err(FedplanError::KeyAlreadyExists {
                kind: AssetKind::Task,
                key: key.clone(),
            });
        }
        validate_task(store, key, request, &pending)?;
    }
    Ok(())
}

/// Check a task request against its function and the assets it references.
///
/// `pending` holds the other requests of the same submission, which count as
/// existing parents.
/// Asset kind an input of kind `kind` refers to by key.
fn asset_kind_of(kind: IoKind) -> Option<AssetKind> {
    match kind {
        IoKind::DataManager => Some(AssetKind::Dataset),
        IoKind::DataSample => Some(AssetKind::DataSample),
        IoKind::Model => Some(AssetKind::Model),
        IoKind::Performance => None,
    }
}

fn validate_task(
    store: &InMemoryAssetStore,
    key: &str,
    request: &TaskRequest,
    pending: &BTreeMap<String, &TaskRequest>,
) -> Result<()> {
    validate_metadata(&request.metadata)?;
    let function: Function = store.get(&request.function_key)?;

    let mut seen: BTreeMap<&str, usize> = BTreeMap::new();
    for input in &request.inputs {
        let declared = function.inputs.get(&input.identifier).ok_or_else(|| {
            FedplanError::InvalidRequest(format!(
                "task '{key}': input '{}' is not declared by function '{}'",
                input.identifier, function.key
            ))
        })?;
        *seen.entry(input.identifier.as_str()).or_default() += 1;

        match input.source()? {
            InputSource::Asset(asset_key) => {
                let kind = asset_kind_of(declared.kind).ok_or_else(|| {
                    FedplanError::InvalidRequest(format!(
                        "task '{key}': input '{}' cannot reference a performance",
                        input.identifier
                    ))
                })?;
                if !store.contains(kind, asset_key) {
                    return Err(FedplanError::NotFound(format!("{kind} '{asset_key}'")));
                }
            }
            InputSource::ParentOutput {
                task_key,
                output_identifier,
            } => {
                if declared.kind != IoKind::Model {
                    return Err(FedplanError::InvalidRequest(format!(
                        "task '{key}': input '{}' is not a model but references a parent output",
                        input.identifier
                    )));
                }
                let has_output = match pending.get(task_key) {
                    Some(parent) => parent.outputs.contains_key(output_identifier),
                    None => store
                        .get::<Task>(task_key)?
                        .outputs
                        .contains_key(output_identifier),
                };
                if !has_output {
                    return Err(FedplanError::InvalidRequest(format!(
                        "task '{key}': parent task '{task_key}' has no output '{output_identifier}'"
                    )));
                }
            }
        }
    }

    for (identifier, declared) in &function.inputs {
        let count = seen.get(identifier.as_str()).copied().unwrap_or(0);
        if count == 0 && !declared.optional {
            return Err(FedplanError::InvalidRequest(format!(
                "task '{key}': required input '{identifier}' is missing"
            )));
        }
        if count > 1 && !declared.multiple {
            return Err(FedplanError::InvalidRequest(format!(
                "task '{key}': input '{identifier}' accepts a single value, got {count}"
            )));
        }
    }

    let declared: BTreeSet<&String> = function.outputs.keys().collect();
    let given: BTreeSet<&String> = request.outputs.keys().collect();
    let difference: Vec<&str> = declared
        .symmetric_difference(&given)
        .map(|s| s.as_str())
        .collect();
    if !difference.is_empty() {
        return Err(FedplanError::InvalidRequest(format!(
            "task '{key}': outputs do not match function '{}' outputs; mismatched identifiers: {difference:?}",
            function.key
        )));
    }

    for (identifier, output) in &request.outputs {
        if output.transient {
            warn!(task = %key, output = %identifier, "transient outputs are not supported locally; ignoring");
        }
    }
    Ok(())
}

fn addressable(path: &Path, what: &str) -> Result<Addressable> {
    let path = fs::canonicalize(path).map_err(|e| {
        FedplanError::InvalidRequest(format!("{what} {} is not readable: {e}", path.display()))
    })?;
    Ok(Addressable {
        checksum: hash_path(&path)?,
        storage_address: path.to_string_lossy().into_owned(),
    })
}

fn new_key() -> String {
    Uuid::new_v4().to_string()
}

fn push_unique(keys: &mut Vec<String>, key: &str) {
    if !keys.iter().any(|k| k == key) {
        keys.push(key.to_string());
    }
}

fn dedup(keys: Vec<String>) -> Vec<String> {
    let mut out = Vec::with_capacity(keys.len());
    for key in keys {
        push_unique(&mut out, &key);
    }
    out
}
