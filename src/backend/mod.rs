// src/backend/mod.rs

//! Client facade over the local and remote backends.
//!
//! - [`local`] keeps assets in the shared in-memory store and runs tasks
//!   immediately through the worker (optionally reading from a remote
//!   backend in hybrid mode).
//! - [`remote`] translates every call into REST requests.
//!
//! [`Client`] exposes one surface for both, dispatching on [`Backend`].

pub mod local;
pub mod remote;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::config::model::ClientSection;
use crate::dag::ComputePlanBuilder;
use crate::errors::{FedplanError, Result};
use crate::exec::performance::Performances;
use crate::exec::{DockerSpawner, Spawner, SubprocessSpawner};
use crate::models::{Asset, AssetKind, ComputePlan, Organization, StoredAsset, Task};
use crate::schemas::{
    ComputePlanRequest, DataSampleRequest, DatasetRequest, FunctionRequest, TaskRequest,
    UpdateComputePlanTasksRequest, UpdateRequest,
};
use crate::store::{Filters, SharedStore, filters};
use crate::types::BackendType;

pub use local::LocalBackend;
pub use remote::RemoteBackend;

/// Sub-directory of the worker dir where function archives are unpacked.
pub const ARCHIVE_CACHE_DIR: &str = "functions";

pub enum Backend {
    Local(LocalBackend),
    Remote(RemoteBackend),
}

pub struct Client {
    backend: Backend,
}

impl Client {
    pub fn new(backend: Backend) -> Self {
        Self { backend }
    }

    pub fn local(
        store: SharedStore,
        spawner: Arc<dyn Spawner>,
        worker_dir: impl Into<PathBuf>,
        organization: impl Into<String>,
    ) -> Self {
        Self::new(Backend::Local(LocalBackend::new(
            store,
            spawner,
            worker_dir,
            organization,
        )))
    }

    pub fn remote(remote: RemoteBackend) -> Self {
        Self::new(Backend::Remote(remote))
    }

    /// Build a client from the `[client]` section. Local clients share `store`.
    pub fn from_config(config: &ClientSection, store: SharedStore) -> Result<Self> {
        let remote = match &config.url {
            Some(url) if config.backend == BackendType::Remote || config.hybrid => Some(
                RemoteBackend::new(
                    url,
                    config.token.clone(),
                    config.insecure,
                    Duration::from_secs(config.retry_timeout_secs),
                )?,
            ),
            _ => None,
        };

        let archive_cache = config.local_worker_dir.join(ARCHIVE_CACHE_DIR);
        let spawner: Arc<dyn Spawner> = match config.backend {
            BackendType::Remote => {
                let remote = remote.ok_or_else(|| {
                    FedplanError::ConfigError("remote backend requires [client].url".to_string())
                })?;
                info!(url = %remote.base_url(), "using remote backend");
                return Ok(Self::remote(remote));
            }
            BackendType::Docker => Arc::new(DockerSpawner::new(archive_cache)),
            BackendType::Subprocess => Arc::new(SubprocessSpawner::new(archive_cache)),
        };

        let mut local = LocalBackend::new(
            store,
            spawner,
            config.local_worker_dir.clone(),
            config.organization.clone(),
        );
        if let Some(remote) = remote {
            info!(url = %remote.base_url(), "hybrid mode: reading remote assets");
            local = local.with_remote(remote);
        }
        info!(backend = %config.backend, worker_dir = ?config.local_worker_dir, "using local backend");
        Ok(Self::new(Backend::Local(local)))
    }

    /// Log level passed to function processes. No effect on remote clients.
    pub fn with_worker_log_level(self, level: impl Into<String>) -> Self {
        match self.backend {
            Backend::Local(local) => Self::new(Backend::Local(local.with_log_level(level))),
            remote => Self::new(remote),
        }
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.backend, Backend::Remote(_))
    }

    // ---------------------------------------------------------------------
    // Creation
    // ---------------------------------------------------------------------

    pub async fn add_dataset(&self, mut request: DatasetRequest) -> Result<String> {
        match &self.backend {
            Backend::Local(local) => local.add_dataset(request),
            Backend::Remote(remote) => {
                let key = assign_key(&mut request.key);
                let body = serde_json::to_value(&request)?;
                remote.create_or_existing(AssetKind::Dataset, &key, &body).await
            }
        }
    }

    pub async fn add_data_sample(&self, mut request: DataSampleRequest) -> Result<String> {
        match &self.backend {
            Backend::Local(local) => local.add_data_sample(request).await,
            Backend::Remote(remote) => {
                let key = assign_key(&mut request.key);
                let body = serde_json::to_value(&request)?;
                remote
                    .create_or_existing(AssetKind::DataSample, &key, &body)
                    .await
            }
        }
    }

    pub async fn add_function(&self, mut request: FunctionRequest) -> Result<String> {
        match &self.backend {
            Backend::Local(local) => local.add_function(request),
            Backend::Remote(remote) => {
                let key = assign_key(&mut request.key);
                let body = serde_json::to_value(&request)?;
                remote.create_or_existing(AssetKind::Function, &key, &body).await
            }
        }
    }

    pub async fn add_task(&self, mut request: TaskRequest) -> Result<String> {
        match &self.backend {
            Backend::Local(local) => local.add_task(request).await,
            Backend::Remote(remote) => {
                let key = assign_key(&mut request.key);
                let body = serde_json::to_value(&request)?;
                remote.create_or_existing(AssetKind::Task, &key, &body).await
            }
        }
    }

    pub async fn add_compute_plan(&self, mut request: ComputePlanRequest) -> Result<ComputePlan> {
        match &self.backend {
            Backend::Local(local) => local.add_compute_plan(request).await,
            Backend::Remote(remote) => {
                let key = assign_key(&mut request.key);
                let ranked = ComputePlanBuilder::new(&key).build_ranked(&request.batches)?;
                let body = serde_json::json!({
                    "key": key,
                    "name": request.name,
                    "tag": request.tag,
                    "metadata": request.metadata,
                    "delete_intermediary_models": request.delete_intermediary_models,
                });
                remote.create(AssetKind::ComputePlan, &key, &body).await?;
                if !ranked.is_empty() {
                    remote.bulk_create_tasks(&key, to_values(&ranked)?).await?;
                }
                remote.get(&key).await
            }
        }
    }

    pub async fn add_compute_plan_tasks(
        &self,
        request: UpdateComputePlanTasksRequest,
    ) -> Result<ComputePlan> {
        match &self.backend {
            Backend::Local(local) => local.add_compute_plan_tasks(request).await,
            Backend::Remote(remote) => {
                let existing: BTreeMap<String, u32> = remote
                    .list_assets(
                        AssetKind::Task,
                        &filters([("compute_plan_key", vec![request.key.as_str()])]),
                        None,
                        true,
                    )
                    .await?
                    .into_iter()
                    .map(Task::try_from_asset)
                    .map(|t| t.map(|t| (t.key, t.rank)))
                    .collect::<Result<_>>()?;
                let ranked = ComputePlanBuilder::new(&request.key)
                    .with_existing_ranks(existing)
                    .build_ranked(&request.batches)?;
                remote.bulk_create_tasks(&request.key, to_values(&ranked)?).await?;
                remote.get(&request.key).await
            }
        }
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    pub async fn get_asset(&self, kind: AssetKind, key: &str) -> Result<Asset> {
        match &self.backend {
            Backend::Local(local) => local.get_asset(kind, key).await,
            Backend::Remote(remote) => remote.get_asset(kind, key).await,
        }
    }

    pub async fn get<T: StoredAsset>(&self, key: &str) -> Result<T> {
        T::try_from_asset(self.get_asset(T::KIND, key).await?)
    }

    pub async fn list_assets(
        &self,
        kind: AssetKind,
        filters: &Filters,
        order_by: Option<&str>,
        ascending: bool,
    ) -> Result<Vec<Asset>> {
        match &self.backend {
            Backend::Local(local) => local.list_assets(kind, filters, order_by, ascending).await,
            Backend::Remote(remote) => remote.list_assets(kind, filters, order_by, ascending).await,
        }
    }

    pub async fn list<T: StoredAsset>(
        &self,
        filters: &Filters,
        order_by: Option<&str>,
        ascending: bool,
    ) -> Result<Vec<T>> {
        self.list_assets(T::KIND, filters, order_by, ascending)
            .await?
            .into_iter()
            .map(T::try_from_asset)
            .collect()
    }

    pub async fn list_organizations(&self) -> Result<Vec<Organization>> {
        match &self.backend {
            Backend::Local(local) => local.list_organizations(),
            Backend::Remote(remote) => remote.list_organizations().await,
        }
    }

    pub async fn get_performances(&self, compute_plan_key: &str) -> Result<Performances> {
        match &self.backend {
            Backend::Local(local) => local.get_performances(compute_plan_key),
            Backend::Remote(remote) => remote.get_performances(compute_plan_key).await,
        }
    }

    pub async fn describe(&self, kind: AssetKind, key: &str) -> Result<String> {
        match &self.backend {
            Backend::Local(local) => local.describe(kind, key).await,
            Backend::Remote(remote) => remote.describe(kind, key).await,
        }
    }

    pub async fn download(&self, kind: AssetKind, key: &str, dest_dir: &Path) -> Result<PathBuf> {
        match &self.backend {
            Backend::Local(local) => local.download(kind, key, dest_dir).await,
            Backend::Remote(remote) => remote.download(kind, key, dest_dir).await,
        }
    }

    /// Wait for a plan to reach a terminal status. Local plans are already
    /// finished when their submission returns.
    pub async fn wait_compute_plan(&self, key: &str, timeout: Duration) -> Result<ComputePlan> {
        match &self.backend {
            Backend::Local(local) => local.wait_compute_plan(key),
            Backend::Remote(remote) => remote.wait_compute_plan(key, timeout).await,
        }
    }

    // ---------------------------------------------------------------------
    // Updates
    // ---------------------------------------------------------------------

    pub async fn update(&self, kind: AssetKind, key: &str, request: UpdateRequest) -> Result<()> {
        match &self.backend {
            Backend::Local(local) => local.update(kind, key, request),
            Backend::Remote(remote) => remote.update(kind, key, &request).await,
        }
    }

    pub async fn link_dataset_with_data_samples(
        &self,
        dataset_key: &str,
        data_sample_keys: &[String],
    ) -> Result<Vec<String>> {
        match &self.backend {
            Backend::Local(local) => {
                local.link_dataset_with_data_samples(dataset_key, data_sample_keys)
            }
            Backend::Remote(remote) => {
                remote
                    .link_dataset_with_data_samples(dataset_key, data_sample_keys)
                    .await
            }
        }
    }

    pub async fn unlink_dataset_with_data_samples(
        &self,
        dataset_key: &str,
        data_sample_keys: &[String],
    ) -> Result<Vec<String>> {
        match &self.backend {
            Backend::Local(local) => {
                local.unlink_dataset_with_data_samples(dataset_key, data_sample_keys)
            }
            Backend::Remote(_) => Err(FedplanError::InvalidRequest(
                "unlinking data samples is not supported by the remote backend".to_string(),
            )),
        }
    }

    pub async fn cancel_compute_plan(&self, key: &str) -> Result<ComputePlan> {
        match &self.backend {
            Backend::Local(local) => local.cancel_compute_plan(key),
            Backend::Remote(remote) => remote.cancel_compute_plan(key).await,
        }
    }
}

/// Fill in a missing key so a timed-out submission can be polled for.
fn assign_key(key: &mut Option<String>) -> String {
    key.get_or_insert_with(|| Uuid::new_v4().to_string()).clone()
}

fn to_values(tasks: &[TaskRequest]) -> Result<Vec<Value>> {
    tasks
        .iter()
        .map(|t| serde_json::to_value(t).map_err(FedplanError::from))
        .collect()
}
