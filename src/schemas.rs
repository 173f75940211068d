// src/schemas.rs

//! Creation requests accepted by the client facade.
//!
//! These mirror the records in [`crate::models`] minus everything the
//! backend fills in (owner, status, dates, rank, counters, checksums).

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::models::{
    FunctionCategory, FunctionInput, FunctionOutput, InputRef, Metadata, Permissions,
    TaskCategory,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetRequest {
    #[serde(default)]
    pub key: Option<String>,
    pub name: String,
    pub opener: PathBuf,
    #[serde(default)]
    pub description: Option<PathBuf>,
    #[serde(default)]
    pub permissions: Permissions,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSampleRequest {
    #[serde(default)]
    pub key: Option<String>,
    pub path: PathBuf,
    pub data_manager_keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionRequest {
    #[serde(default)]
    pub key: Option<String>,
    pub name: String,
    pub category: FunctionCategory,
    pub archive: PathBuf,
    #[serde(default)]
    pub description: Option<PathBuf>,
    #[serde(default)]
    pub inputs: BTreeMap<String, FunctionInput>,
    #[serde(default)]
    pub outputs: BTreeMap<String, FunctionOutput>,
    #[serde(default)]
    pub permissions: Permissions,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeTaskOutputRequest {
    #[serde(default)]
    pub permissions: Permissions,
    #[serde(default)]
    pub transient: bool,
}

/// A single task submission.
///
/// Plan assignment: with `compute_plan_key` set the task joins that existing
/// plan and its rank is derived from its parents; without it a new plan is
/// created, and the task must be rank 0 (`rank` unset or `Some(0)`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    #[serde(default)]
    pub key: Option<String>,
    pub category: TaskCategory,
    pub function_key: String,
    pub worker: String,
    #[serde(default)]
    pub compute_plan_key: Option<String>,
    #[serde(default)]
    pub rank: Option<u32>,
    #[serde(default)]
    pub inputs: Vec<InputRef>,
    #[serde(default)]
    pub outputs: BTreeMap<String, ComputeTaskOutputRequest>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub tag: String,
}

/// A task inside a compute plan batch. `task_id` becomes the task key and is
/// what other tasks of the batch use as `parent_task_key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputePlanTaskRequest {
    pub task_id: String,
    pub function_key: String,
    pub worker: String,
    #[serde(default)]
    pub inputs: Vec<InputRef>,
    #[serde(default)]
    pub outputs: BTreeMap<String, ComputeTaskOutputRequest>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub tag: String,
}

impl ComputePlanTaskRequest {
    /// Turn a batch entry into a standalone task request for `compute_plan_key`.
    pub fn into_task_request(self, category: TaskCategory, compute_plan_key: &str) -> TaskRequest {
        TaskRequest {
            key: Some(self.task_id),
            category,
            function_key: self.function_key,
            worker: self.worker,
            compute_plan_key: Some(compute_plan_key.to_string()),
            rank: None,
            inputs: self.inputs,
            outputs: self.outputs,
            metadata: self.metadata,
            tag: self.tag,
        }
    }
}

/// Task batches, one per category.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComputePlanBatches {
    #[serde(default)]
    pub train_tasks: Vec<ComputePlanTaskRequest>,
    #[serde(default)]
    pub aggregate_tasks: Vec<ComputePlanTaskRequest>,
    #[serde(default)]
    pub composite_tasks: Vec<ComputePlanTaskRequest>,
    #[serde(default)]
    pub predict_tasks: Vec<ComputePlanTaskRequest>,
    #[serde(default)]
    pub test_tasks: Vec<ComputePlanTaskRequest>,
}

impl ComputePlanBatches {
    /// All batch entries with their category, in batch order.
    pub fn iter(&self) -> impl Iterator<Item = (TaskCategory, &ComputePlanTaskRequest)> {
        let batches = [
            (TaskCategory::Train, &self.train_tasks),
            (TaskCategory::Aggregate, &self.aggregate_tasks),
            (TaskCategory::Composite, &self.composite_tasks),
            (TaskCategory::Predict, &self.predict_tasks),
            (TaskCategory::Test, &self.test_tasks),
        ];
        batches
            .into_iter()
            .flat_map(|(category, tasks)| tasks.iter().map(move |t| (category, t)))
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputePlanRequest {
    #[serde(default)]
    pub key: Option<String>,
    pub name: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub metadata: Metadata,
    /// Accepted for API parity; the local backend keeps every model.
    #[serde(default)]
    pub delete_intermediary_models: bool,
    #[serde(flatten)]
    pub batches: ComputePlanBatches,
}

/// New tasks for an already existing compute plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateComputePlanTasksRequest {
    pub key: String,
    #[serde(flatten)]
    pub batches: ComputePlanBatches,
}

/// Shallow field update (`name`, `metadata`) applied by `Client::update`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}
