// src/workspace.rs

//! Turning a [`WorkspaceFile`] into backend submissions.
//!
//! Entries in the workspace file refer to each other by `id`. Registration
//! creates datasets, data samples and functions in that order and records
//! the key each id was given; the compute plan request is then built with
//! ids replaced by keys.

use std::collections::BTreeMap;

use tracing::{debug, info};
use uuid::Uuid;

use crate::backend::Client;
use crate::config::model::{ComputePlanSection, TaskInputEntry, WorkspaceFile};
use crate::errors::{FedplanError, Result};
use crate::models::{InputRef, TaskCategory};
use crate::schemas::{
    ComputePlanBatches, ComputePlanRequest, ComputePlanTaskRequest, DataSampleRequest,
    DatasetRequest, FunctionRequest,
};

/// Keys assigned to workspace ids, per section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisteredAssets {
    pub datasets: BTreeMap<String, String>,
    pub data_samples: BTreeMap<String, String>,
    pub functions: BTreeMap<String, String>,
}

impl RegisteredAssets {
    /// Every id mapped to itself. Used to rank a plan without registering
    /// anything.
    pub fn identity(cfg: &WorkspaceFile) -> Self {
        let ids = |it: Vec<&String>| -> BTreeMap<String, String> {
            it.into_iter().map(|id| (id.clone(), id.clone())).collect()
        };
        Self {
            datasets: ids(cfg.dataset.iter().map(|d| &d.id).collect()),
            data_samples: ids(cfg.data_sample.iter().map(|s| &s.id).collect()),
            functions: ids(cfg.function.iter().map(|f| &f.id).collect()),
        }
    }
}

fn lookup<'a>(map: &'a BTreeMap<String, String>, what: &str, id: &str) -> Result<&'a String> {
    map.get(id)
        .ok_or_else(|| FedplanError::ConfigError(format!("unknown {what} '{id}'")))
}

/// Register datasets, then data samples, then functions.
pub async fn register_assets(client: &Client, cfg: &WorkspaceFile) -> Result<RegisteredAssets> {
    let mut assets = RegisteredAssets::default();

    for entry in &cfg.dataset {
        let key = client
            .add_dataset(DatasetRequest {
                key: None,
                name: entry.name.clone(),
                opener: cfg.resolve(&entry.opener),
                description: entry.description.as_deref().map(|p| cfg.resolve(p)),
                permissions: entry.permissions.clone(),
                metadata: entry.metadata.clone(),
            })
            .await?;
        debug!(id = %entry.id, key = %key, "registered dataset");
        assets.datasets.insert(entry.id.clone(), key);
    }

    for entry in &cfg.data_sample {
        let data_manager_keys = entry
            .datasets
            .iter()
            .map(|id| lookup(&assets.datasets, "dataset", id).cloned())
            .collect::<Result<Vec<_>>>()?;
        let key = client
            .add_data_sample(DataSampleRequest {
                key: None,
                path: cfg.resolve(&entry.path),
                data_manager_keys,
            })
            .await?;
        debug!(id = %entry.id, key = %key, "registered data sample");
        assets.data_samples.insert(entry.id.clone(), key);
    }

    for entry in &cfg.function {
        let key = client
            .add_function(FunctionRequest {
                key: None,
                name: entry.name.clone(),
                category: entry.category,
                archive: cfg.resolve(&entry.archive),
                description: entry.description.as_deref().map(|p| cfg.resolve(p)),
                inputs: entry.inputs.clone(),
                outputs: entry.outputs.clone(),
                permissions: entry.permissions.clone(),
                metadata: entry.metadata.clone(),
            })
            .await?;
        debug!(id = %entry.id, key = %key, "registered function");
        assets.functions.insert(entry.id.clone(), key);
    }

    info!(
        datasets = assets.datasets.len(),
        data_samples = assets.data_samples.len(),
        functions = assets.functions.len(),
        "workspace assets registered"
    );
    Ok(assets)
}

/// A fresh key for every task id of the plan.
pub fn new_task_keys(section: &ComputePlanSection) -> BTreeMap<String, String> {
    section
        .tasks
        .iter()
        .map(|t| (t.id.clone(), Uuid::new_v4().to_string()))
        .collect()
}

/// Task ids used as their own keys.
pub fn identity_task_keys(section: &ComputePlanSection) -> BTreeMap<String, String> {
    section
        .tasks
        .iter()
        .map(|t| (t.id.clone(), t.id.clone()))
        .collect()
}

/// Build the compute plan request for `section` with ids replaced by keys.
pub fn plan_request(
    cfg: &WorkspaceFile,
    section: &ComputePlanSection,
    assets: &RegisteredAssets,
    task_keys: &BTreeMap<String, String>,
) -> Result<ComputePlanRequest> {
    let mut batches = ComputePlanBatches::default();

    for task in &section.tasks {
        let inputs = task
            .inputs
            .iter()
            .map(|input| input_ref(input, assets, task_keys))
            .collect::<Result<Vec<_>>>()?;

        let request = ComputePlanTaskRequest {
            task_id: lookup(task_keys, "task", &task.id)?.clone(),
            function_key: lookup(&assets.functions, "function", &task.function)?.clone(),
            worker: task
                .worker
                .clone()
                .unwrap_or_else(|| cfg.client.organization.clone()),
            inputs,
            outputs: task.outputs.clone(),
            metadata: task.metadata.clone(),
            tag: task.tag.clone(),
        };

        match task.category {
            TaskCategory::Train => batches.train_tasks.push(request),
            TaskCategory::Aggregate => batches.aggregate_tasks.push(request),
            TaskCategory::Composite => batches.composite_tasks.push(request),
            TaskCategory::Predict => batches.predict_tasks.push(request),
            TaskCategory::Test => batches.test_tasks.push(request),
        }
    }

    Ok(ComputePlanRequest {
        key: Some(Uuid::new_v4().to_string()),
        name: section.name.clone(),
        tag: section.tag.clone(),
        metadata: section.metadata.clone(),
        delete_intermediary_models: section.delete_intermediary_models,
        batches,
    })
}

fn input_ref(
    input: &TaskInputEntry,
    assets: &RegisteredAssets,
    task_keys: &BTreeMap<String, String>,
) -> Result<InputRef> {
    let identifier = input.identifier.clone();
    if let Some(id) = &input.dataset {
        return Ok(InputRef::asset(identifier, lookup(&assets.datasets, "dataset", id)?));
    }
    if let Some(id) = &input.data_sample {
        return Ok(InputRef::asset(
            identifier,
            lookup(&assets.data_samples, "data sample", id)?,
        ));
    }
    if let Some(key) = &input.model {
        return Ok(InputRef::asset(identifier, key));
    }
    match (&input.parent, &input.output) {
        (Some(parent), Some(output)) => Ok(InputRef::parent_output(
            identifier,
            lookup(task_keys, "task", parent)?,
            output,
        )),
        _ => Err(FedplanError::ConfigError(format!(
            "input '{}' has no source",
            input.identifier
        ))),
    }
}
