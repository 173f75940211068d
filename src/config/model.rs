// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::models::{FunctionCategory, FunctionInput, FunctionOutput, Metadata, Permissions, TaskCategory};
use crate::schemas::ComputeTaskOutputRequest;
use crate::types::BackendType;

/// Workspace file as read from TOML, before validation.
///
/// ```toml
/// [client]
/// backend = "subprocess"
/// organization = "org-1"
///
/// [[dataset]]
/// id = "iris"
/// name = "Iris"
/// opener = "assets/opener.py"
///
/// [[data_sample]]
/// id = "iris-train"
/// path = "data/train"
/// datasets = ["iris"]
///
/// [[function]]
/// id = "linear"
/// name = "Linear regression"
/// category = "simple"
/// archive = "assets/linear"
/// inputs.opener = { kind = "data_manager" }
/// inputs.datasamples = { kind = "data_sample", multiple = true }
/// outputs.model = { kind = "model" }
///
/// [compute_plan]
/// name = "demo"
///
/// [[compute_plan.task]]
/// id = "train"
/// category = "train"
/// function = "linear"
/// inputs = [
///   { identifier = "opener", dataset = "iris" },
///   { identifier = "datasamples", data_sample = "iris-train" },
/// ]
/// outputs.model = { permissions = { public = true } }
/// ```
///
/// Entries refer to each other through their `id`; keys are assigned when the
/// workspace is registered.
#[derive(Debug, Clone, Deserialize)]
pub struct RawWorkspaceFile {
    #[serde(default)]
    pub client: ClientSection,

    #[serde(default)]
    pub dataset: Vec<DatasetEntry>,

    #[serde(default)]
    pub data_sample: Vec<DataSampleEntry>,

    #[serde(default)]
    pub function: Vec<FunctionEntry>,

    #[serde(default)]
    pub compute_plan: Option<ComputePlanSection>,
}

/// Validated workspace. Built through `TryFrom<RawWorkspaceFile>`.
#[derive(Debug, Clone)]
pub struct WorkspaceFile {
    pub client: ClientSection,
    pub dataset: Vec<DatasetEntry>,
    pub data_sample: Vec<DataSampleEntry>,
    pub function: Vec<FunctionEntry>,
    pub compute_plan: Option<ComputePlanSection>,
    /// Directory relative paths are resolved against.
    pub root_dir: PathBuf,
}

impl WorkspaceFile {
    pub(crate) fn new_unchecked(raw: RawWorkspaceFile) -> Self {
        Self {
            client: raw.client,
            dataset: raw.dataset,
            data_sample: raw.data_sample,
            function: raw.function,
            compute_plan: raw.compute_plan,
            root_dir: PathBuf::from("."),
        }
    }

    pub fn with_root_dir(mut self, root_dir: impl Into<PathBuf>) -> Self {
        self.root_dir = root_dir.into();
        self
    }

    /// `path` as given if absolute, else relative to the workspace file.
    pub fn resolve(&self, path: &std::path::Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root_dir.join(path)
        }
    }
}

/// `[client]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSection {
    #[serde(default)]
    pub backend: BackendType,

    /// Owner id recorded on created assets.
    #[serde(default = "default_organization")]
    pub organization: String,

    /// Root for task scratch space, outputs, unpacked archives and snapshots.
    #[serde(default = "default_local_worker_dir")]
    pub local_worker_dir: PathBuf,

    /// REST endpoint (remote and hybrid modes). `FEDPLAN_URL` overrides it.
    #[serde(default)]
    pub url: Option<String>,

    /// API token. `FEDPLAN_TOKEN` overrides it.
    #[serde(default)]
    pub token: Option<String>,

    /// Skip TLS certificate verification.
    #[serde(default)]
    pub insecure: bool,

    /// How long a timed-out submission is polled for before giving up.
    #[serde(default = "default_retry_timeout_secs")]
    pub retry_timeout_secs: u64,

    /// Read assets from the remote backend, execute locally.
    #[serde(default)]
    pub hybrid: bool,
}

fn default_organization() -> String {
    "org-1".to_string()
}

fn default_local_worker_dir() -> PathBuf {
    PathBuf::from(".fedplan")
}

fn default_retry_timeout_secs() -> u64 {
    300
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            backend: BackendType::default(),
            organization: default_organization(),
            local_worker_dir: default_local_worker_dir(),
            url: None,
            token: None,
            insecure: false,
            retry_timeout_secs: default_retry_timeout_secs(),
            hybrid: false,
        }
    }
}

/// `[[dataset]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct DatasetEntry {
    pub id: String,
    pub name: String,
    pub opener: PathBuf,
    #[serde(default)]
    pub description: Option<PathBuf>,
    #[serde(default)]
    pub permissions: Permissions,
    #[serde(default)]
    pub metadata: Metadata,
}

/// `[[data_sample]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct DataSampleEntry {
    pub id: String,
    pub path: PathBuf,
    /// Ids of the `[[dataset]]` entries this sample belongs to.
    pub datasets: Vec<String>,
}

/// `[[function]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct FunctionEntry {
    pub id: String,
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

/// `[compute_plan]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ComputePlanSection {
    pub name: String,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub delete_intermediary_models: bool,
    #[serde(default, rename = "task")]
    pub tasks: Vec<TaskEntry>,
}

/// `[[compute_plan.task]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskEntry {
    pub id: String,
    pub category: TaskCategory,
    /// Id of a `[[function]]` entry.
    pub function: String,
    /// Defaults to `[client].organization`.
    #[serde(default)]
    pub worker: Option<String>,
    #[serde(default)]
    pub inputs: Vec<TaskInputEntry>,
    #[serde(default)]
    pub outputs: BTreeMap<String, ComputeTaskOutputRequest>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub tag: String,
}

/// One task input. Exactly one of `dataset`, `data_sample`, `model` or
/// `parent` (+ `output`) must be set.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskInputEntry {
    pub identifier: String,
    /// Id of a `[[dataset]]` entry.
    #[serde(default)]
    pub dataset: Option<String>,
    /// Id of a `[[data_sample]]` entry.
    #[serde(default)]
    pub data_sample: Option<String>,
    /// Key of an already registered model.
    #[serde(default)]
    pub model: Option<String>,
    /// Id of another task of the plan.
    #[serde(default)]
    pub parent: Option<String>,
    /// Output identifier on `parent`.
    #[serde(default)]
    pub output: Option<String>,
}
