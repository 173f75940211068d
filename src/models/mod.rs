// src/models/mod.rs

//! Asset records shared by the local store, the executor and the remote
//! backend.
//!
//! Every asset type is one variant of [`Asset`], tagged by [`AssetKind`].
//! [`StoredAsset`] gives typed access on top of the tagged union.

pub mod common;
pub mod compute_plan;
pub mod dataset;
pub mod function;
pub mod task;

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub use common::{Addressable, Metadata, Organization, Permissions, validate_metadata};
pub use compute_plan::{ComputePlan, ComputePlanStatus};
pub use dataset::{DataSample, Dataset, OutModel};
pub use function::{Function, FunctionCategory, FunctionInput, FunctionOutput, IoKind};
pub use task::{
    ComputeTaskOutput, InputRef, InputSource, OutputValue, Task, TaskCategory, TaskErrorType,
    TaskStatus,
};

use crate::errors::{FedplanError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Dataset,
    DataSample,
    Function,
    Task,
    Model,
    ComputePlan,
}

impl AssetKind {
    /// Path segment used by the REST API for this kind.
    pub fn url_segment(self) -> &'static str {
        match self {
            AssetKind::Dataset => "data_manager",
            AssetKind::DataSample => "data_sample",
            AssetKind::Function => "function",
            AssetKind::Task => "task",
            AssetKind::Model => "model",
            AssetKind::ComputePlan => "compute_plan",
        }
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AssetKind::Dataset => "dataset",
            AssetKind::DataSample => "data_sample",
            AssetKind::Function => "function",
            AssetKind::Task => "task",
            AssetKind::Model => "model",
            AssetKind::ComputePlan => "compute_plan",
        };
        f.write_str(s)
    }
}

impl FromStr for AssetKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "dataset" | "data_manager" => Ok(AssetKind::Dataset),
            "data_sample" => Ok(AssetKind::DataSample),
            "function" | "algo" => Ok(AssetKind::Function),
            "task" => Ok(AssetKind::Task),
            "model" => Ok(AssetKind::Model),
            "compute_plan" => Ok(AssetKind::ComputePlan),
            other => Err(format!("unknown asset kind: {other}")),
        }
    }
}

/// Any stored asset.
#[derive(Debug, Clone, PartialEq)]
pub enum Asset {
    Dataset(Dataset),
    DataSample(DataSample),
    Function(Function),
    Task(Task),
    Model(OutModel),
    ComputePlan(ComputePlan),
}

impl Asset {
    pub fn kind(&self) -> AssetKind {
        match self {
            Asset::Dataset(_) => AssetKind::Dataset,
            Asset::DataSample(_) => AssetKind::DataSample,
            Asset::Function(_) => AssetKind::Function,
            Asset::Task(_) => AssetKind::Task,
            Asset::Model(_) => AssetKind::Model,
            Asset::ComputePlan(_) => AssetKind::ComputePlan,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Asset::Dataset(a) => &a.key,
            Asset::DataSample(a) => &a.key,
            Asset::Function(a) => &a.key,
            Asset::Task(a) => &a.key,
            Asset::Model(a) => &a.key,
            Asset::ComputePlan(a) => &a.key,
        }
    }

    /// JSON projection, used for filtering, ordering and field merges.
    pub fn to_value(&self) -> Result<serde_json::Value> {
        let value = match self {
            Asset::Dataset(a) => serde_json::to_value(a)?,
            Asset::DataSample(a) => serde_json::to_value(a)?,
            Asset::Function(a) => serde_json::to_value(a)?,
            Asset::Task(a) => serde_json::to_value(a)?,
            Asset::Model(a) => serde_json::to_value(a)?,
            Asset::ComputePlan(a) => serde_json::to_value(a)?,
        };
        Ok(value)
    }

    /// Rebuild an asset of the given kind from its JSON projection.
    pub fn from_value(kind: AssetKind, value: serde_json::Value) -> Result<Self> {
        let asset = match kind {
            AssetKind::Dataset => Asset::Dataset(serde_json::from_value(value)?),
            AssetKind::DataSample => Asset::DataSample(serde_json::from_value(value)?),
            AssetKind::Function => Asset::Function(serde_json::from_value(value)?),
            AssetKind::Task => Asset::Task(serde_json::from_value(value)?),
            AssetKind::Model => Asset::Model(serde_json::from_value(value)?),
            AssetKind::ComputePlan => Asset::ComputePlan(serde_json::from_value(value)?),
        };
        Ok(asset)
    }
}

/// Typed access to one variant of [`Asset`].
pub trait StoredAsset: Clone + Serialize + DeserializeOwned + Send + 'static {
    const KIND: AssetKind;

    fn key(&self) -> &str;
    fn into_asset(self) -> Asset;
    fn from_asset(asset: Asset) -> Option<Self>;

    /// Like [`StoredAsset::from_asset`], but reporting a kind mismatch as an error.
    fn try_from_asset(asset: Asset) -> Result<Self> {
        let kind = asset.kind();
        Self::from_asset(asset).ok_or_else(|| {
            FedplanError::Other(anyhow::anyhow!(
                "expected a {} asset, found a {kind}",
                Self::KIND
            ))
        })
    }
}

macro_rules! stored_asset {
    ($ty:ty, $variant:ident) => {
        impl StoredAsset for $ty {
            const KIND: AssetKind = AssetKind::$variant;

            fn key(&self) -> &str {
                &self.key
            }

            fn into_asset(self) -> Asset {
                Asset::$variant(self)
            }

            fn from_asset(asset: Asset) -> Option<Self> {
                match asset {
                    Asset::$variant(inner) => Some(inner),
                    _ => None,
                }
            }
        }
    };
}

stored_asset!(Dataset, Dataset);
stored_asset!(DataSample, DataSample);
stored_asset!(Function, Function);
stored_asset!(Task, Task);
stored_asset!(OutModel, Model);
stored_asset!(ComputePlan, ComputePlan);
