// src/models/dataset.rs

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::common::{Addressable, Metadata, Permissions};

/// A dataset ("data manager"): an opener script plus the samples linked to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub key: String,
    pub name: String,
    pub owner: String,
    pub opener: Addressable,
    #[serde(default)]
    pub description: Option<Addressable>,
    /// Reverse side of `DataSample::data_manager_keys`.
    #[serde(default)]
    pub data_sample_keys: Vec<String>,
    pub permissions: Permissions,
    #[serde(default)]
    pub metadata: Metadata,
    pub creation_date: DateTime<Utc>,
    /// Set on datasets mirrored from a remote backend in hybrid mode. Their
    /// samples are never materialised locally.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_remote: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSample {
    pub key: String,
    pub owner: String,
    /// Local directory (or file) holding the sample. `None` for samples only
    /// known to a remote backend.
    #[serde(default)]
    pub path: Option<PathBuf>,
    pub data_manager_keys: Vec<String>,
    pub creation_date: DateTime<Utc>,
}

/// A model produced by a task output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutModel {
    pub key: String,
    pub compute_task_key: String,
    pub address: Addressable,
    pub permissions: Permissions,
    pub owner: String,
    pub creation_date: DateTime<Utc>,
}
