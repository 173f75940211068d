// src/store/memory.rs

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::debug;

use crate::errors::{FedplanError, Result};
use crate::models::{Asset, AssetKind, StoredAsset};
use crate::store::denormalize::resolve_task_inputs;
use crate::store::filters::{Filters, matches, sort_rows};

/// Store shared by every local organization of a process.
///
/// The mutex is also what keeps task-status and plan-counter updates atomic
/// with respect to each other. It must never be held across an `.await`.
pub type SharedStore = Arc<Mutex<InMemoryAssetStore>>;

/// Lock a shared store, turning poisoning into an error.
pub fn lock_store(store: &SharedStore) -> Result<MutexGuard<'_, InMemoryAssetStore>> {
    store
        .lock()
        .map_err(|_| FedplanError::Other(anyhow::anyhow!("asset store lock poisoned")))
}

#[derive(Debug, Default)]
struct Bucket {
    /// Keys in insertion order, for stable listing.
    order: Vec<String>,
    assets: HashMap<String, Asset>,
}

/// Assets keyed by `(kind, key)`. One namespace per kind for the whole
/// process; nothing is ever deleted.
#[derive(Debug, Default)]
pub struct InMemoryAssetStore {
    buckets: HashMap<AssetKind, Bucket>,
}

impl InMemoryAssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh store wrapped for sharing.
    pub fn shared() -> SharedStore {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Insert a new asset; fails if `(kind, key)` is already present.
    pub fn add(&mut self, asset: Asset) -> Result<()> {
        let asset = strip_denormalized(asset);
        let kind = asset.kind();
        let key = asset.key().to_string();
        let bucket = self.buckets.entry(kind).or_default();

        if bucket.assets.contains_key(&key) {
            return Err(FedplanError::KeyAlreadyExists { kind, key });
        }

        debug!(%kind, key = %key, "store: add");
        bucket.order.push(key.clone());
        bucket.assets.insert(key, asset);
        Ok(())
    }

    /// Replace an existing asset; fails if it was never added.
    pub fn update(&mut self, asset: Asset) -> Result<()> {
        let asset = strip_denormalized(asset);
        let kind = asset.kind();
        let key = asset.key().to_string();

        let slot = self
            .buckets
            .get_mut(&kind)
            .and_then(|b| b.assets.get_mut(&key))
            .ok_or_else(|| FedplanError::NotFound(format!("{kind} '{key}'")))?;

        debug!(%kind, key = %key, "store: update");
        *slot = asset;
        Ok(())
    }

    pub fn contains(&self, kind: AssetKind, key: &str) -> bool {
        self.raw(kind, key).is_some()
    }

    /// Number of assets of a kind.
    pub fn count(&self, kind: AssetKind) -> usize {
        self.buckets.get(&kind).map_or(0, |b| b.order.len())
    }

    /// Stored value, without read-time resolution.
    pub(crate) fn raw(&self, kind: AssetKind, key: &str) -> Option<&Asset> {
        self.buckets.get(&kind)?.assets.get(key)
    }

    /// Fetch an asset. Task inputs are resolved against the referenced assets.
    pub fn get_asset(&self, kind: AssetKind, key: &str) -> Result<Asset> {
        let asset = self
            .raw(kind, key)
            .ok_or_else(|| FedplanError::NotFound(format!("{kind} '{key}'")))?;
        Ok(self.resolved(asset))
    }

    /// All assets of a kind matching `filters`, optionally ordered by a field.
    pub fn list_assets(
        &self,
        kind: AssetKind,
        filters: &Filters,
        order_by: Option<&str>,
        ascending: bool,
    ) -> Result<Vec<Asset>> {
        let Some(bucket) = self.buckets.get(&kind) else {
            return Ok(Vec::new());
        };

        let needs_projection = !filters.is_empty() || order_by.is_some();
        let mut rows: Vec<(Asset, serde_json::Value)> = Vec::with_capacity(bucket.order.len());

        for key in &bucket.order {
            let Some(asset) = bucket.assets.get(key) else {
                continue;
            };
            let asset = self.resolved(asset);
            let value = if needs_projection {
                asset.to_value()?
            } else {
                serde_json::Value::Null
            };
            if filters.is_empty() || matches(&value, filters) {
                rows.push((asset, value));
            }
        }

        match order_by {
            Some(field) => sort_rows(&mut rows, field, ascending),
            None if !ascending => rows.reverse(),
            None => {}
        }

        Ok(rows.into_iter().map(|(asset, _)| asset).collect())
    }

    pub fn get<T: StoredAsset>(&self, key: &str) -> Result<T> {
        T::try_from_asset(self.get_asset(T::KIND, key)?)
    }

    pub fn list<T: StoredAsset>(
        &self,
        filters: &Filters,
        order_by: Option<&str>,
        ascending: bool,
    ) -> Result<Vec<T>> {
        self.list_assets(T::KIND, filters, order_by, ascending)?
            .into_iter()
            .map(T::try_from_asset)
            .collect()
    }

    pub fn insert<T: StoredAsset>(&mut self, asset: T) -> Result<()> {
        self.add(asset.into_asset())
    }

    pub fn replace<T: StoredAsset>(&mut self, asset: T) -> Result<()> {
        self.update(asset.into_asset())
    }

    fn resolved(&self, asset: &Asset) -> Asset {
        match asset {
            Asset::Task(task) => Asset::Task(resolve_task_inputs(task, self)),
            other => other.clone(),
        }
    }
}

/// Drop read-time fields so the stored value never carries stale copies.
fn strip_denormalized(asset: Asset) -> Asset {
    match asset {
        Asset::Task(mut task) => {
            task.inputs = task.inputs.iter().map(|i| i.normalized()).collect();
            Asset::Task(task)
        }
        other => other,
    }
}
