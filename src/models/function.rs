// src/models/function.rs

//! Registered algorithms ("functions") and their declared inputs/outputs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::common::{Addressable, Metadata, Permissions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionCategory {
    Simple,
    Composite,
    Aggregate,
    Predict,
    Metric,
}

/// Kind of resource flowing through a function input or output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoKind {
    Model,
    Performance,
    DataManager,
    DataSample,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionInput {
    pub kind: IoKind,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub multiple: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionOutput {
    pub kind: IoKind,
    #[serde(default)]
    pub multiple: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub key: String,
    pub name: String,
    pub category: FunctionCategory,
    pub owner: String,
    /// Packaged archive (directory, zip or tar.gz) and its content hash.
    pub archive: Addressable,
    #[serde(default)]
    pub description: Option<Addressable>,
    /// Declared inputs keyed by identifier.
    pub inputs: BTreeMap<String, FunctionInput>,
    /// Declared outputs keyed by identifier.
    pub outputs: BTreeMap<String, FunctionOutput>,
    pub permissions: Permissions,
    #[serde(default)]
    pub metadata: Metadata,
    pub creation_date: DateTime<Utc>,
}
