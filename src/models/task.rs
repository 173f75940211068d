// src/models/task.rs

//! Compute tasks, their input references and their outputs.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{FedplanError, Result};
use crate::models::common::{Addressable, Metadata, Permissions};
use crate::models::dataset::OutModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    Train,
    Predict,
    Test,
    Aggregate,
    Composite,
}

/// Task lifecycle.
///
/// `waiting -> doing -> done`, `doing -> failed`, and `waiting -> canceled`.
/// `done`, `failed` and `canceled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Waiting,
    Doing,
    Done,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::Canceled
        )
    }

    /// Whether `self -> next` is an allowed transition.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Waiting, TaskStatus::Doing)
                | (TaskStatus::Waiting, TaskStatus::Canceled)
                | (TaskStatus::Doing, TaskStatus::Done)
                | (TaskStatus::Doing, TaskStatus::Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Doing => "doing",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// Why a task ended up `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorType {
    Build,
    Execution,
    Internal,
}

/// One input of a task: either a registered asset, or the output of a
/// parent task. Exactly one of the two sources is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRef {
    pub identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_output_identifier: Option<String>,

    /// Filled in at read time from the referenced asset; never stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addressable: Option<Addressable>,
    /// Filled in at read time from the referenced asset; never stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Permissions>,
}

/// Borrowed view of where an [`InputRef`] points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSource<'a> {
    Asset(&'a str),
    ParentOutput {
        task_key: &'a str,
        output_identifier: &'a str,
    },
}

impl InputRef {
    pub fn asset(identifier: impl Into<String>, asset_key: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            asset_key: Some(asset_key.into()),
            parent_task_key: None,
            parent_task_output_identifier: None,
            addressable: None,
            permissions: None,
        }
    }

    pub fn parent_output(
        identifier: impl Into<String>,
        parent_task_key: impl Into<String>,
        output_identifier: impl Into<String>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            asset_key: None,
            parent_task_key: Some(parent_task_key.into()),
            parent_task_output_identifier: Some(output_identifier.into()),
            addressable: None,
            permissions: None,
        }
    }

    /// Resolve the source, enforcing the exactly-one constraint.
    pub fn source(&self) -> Result<InputSource<'_>> {
        match (
            self.asset_key.as_deref(),
            self.parent_task_key.as_deref(),
            self.parent_task_output_identifier.as_deref(),
        ) {
            (Some(key), None, None) => Ok(InputSource::Asset(key)),
            (None, Some(task_key), Some(output_identifier)) => Ok(InputSource::ParentOutput {
                task_key,
                output_identifier,
            }),
            (None, None, None) => Err(FedplanError::InvalidRequest(format!(
                "input '{}' must reference either an asset_key or a parent task output",
                self.identifier
            ))),
            (Some(_), _, _) => Err(FedplanError::InvalidRequest(format!(
                "input '{}' cannot reference both an asset_key and a parent task output",
                self.identifier
            ))),
            (None, _, _) => Err(FedplanError::InvalidRequest(format!(
                "input '{}' needs both parent_task_key and parent_task_output_identifier",
                self.identifier
            ))),
        }
    }

    /// Copy of this reference without read-time denormalised fields.
    pub fn normalized(&self) -> Self {
        Self {
            addressable: None,
            permissions: None,
            ..self.clone()
        }
    }
}

/// Value produced by a task output once the task has run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputValue {
    Performance(f64),
    Model(OutModel),
    Models(Vec<OutModel>),
}

impl OutputValue {
    /// The models carried by this value, or `None` for a performance.
    pub fn models(&self) -> Option<Vec<&OutModel>> {
        match self {
            OutputValue::Performance(_) => None,
            OutputValue::Model(model) => Some(vec![model]),
            OutputValue::Models(models) => Some(models.iter().collect()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeTaskOutput {
    pub permissions: Permissions,
    /// Accepted but not honoured by the local backend (logged as a warning).
    #[serde(default)]
    pub transient: bool,
    #[serde(default)]
    pub value: Option<OutputValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub key: String,
    pub category: TaskCategory,
    pub function_key: String,
    pub owner: String,
    pub worker: String,
    pub compute_plan_key: String,
    pub rank: u32,
    pub status: TaskStatus,
    pub inputs: Vec<InputRef>,
    pub outputs: BTreeMap<String, ComputeTaskOutput>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub tag: String,
    pub creation_date: DateTime<Utc>,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_type: Option<TaskErrorType>,
}

impl Task {
    /// Distinct parent task keys, in input order.
    pub fn parent_task_keys(&self) -> Vec<&str> {
        parent_keys(&self.inputs)
    }
}

/// Distinct `parent_task_key`s referenced by a list of inputs, in order.
pub fn parent_keys(inputs: &[InputRef]) -> Vec<&str> {
    let mut keys: Vec<&str> = Vec::new();
    for key in inputs.iter().filter_map(|i| i.parent_task_key.as_deref()) {
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    keys
}
