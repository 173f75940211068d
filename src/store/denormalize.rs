// src/store/denormalize.rs

//! Read-time join of task inputs with the assets they reference.
//!
//! Stored tasks only hold keys. Before a task leaves the store, each input is
//! decorated with the referenced asset's address and permissions. This is a
//! pure function over a copy; the stored value is never touched.

use tracing::debug;

use crate::models::{
    Addressable, Asset, AssetKind, InputSource, OutputValue, Permissions, Task,
};
use crate::store::memory::InMemoryAssetStore;

pub fn resolve_task_inputs(task: &Task, store: &InMemoryAssetStore) -> Task {
    let mut resolved = task.clone();

    for input in &mut resolved.inputs {
        let (addressable, permissions) = match input.source() {
            Ok(InputSource::Asset(key)) => resolve_asset(store, key),
            Ok(InputSource::ParentOutput {
                task_key,
                output_identifier,
            }) => resolve_parent_output(store, task_key, output_identifier),
            Err(_) => (None, None),
        };

        if addressable.is_none() && permissions.is_none() {
            debug!(
                task = %task.key,
                input = %input.identifier,
                "input reference could not be resolved; leaving it bare"
            );
        }

        input.addressable = addressable;
        input.permissions = permissions;
    }

    resolved
}

fn resolve_asset(
    store: &InMemoryAssetStore,
    key: &str,
) -> (Option<Addressable>, Option<Permissions>) {
    if let Some(Asset::Dataset(dataset)) = store.raw(AssetKind::Dataset, key) {
        return (
            Some(dataset.opener.clone()),
            Some(dataset.permissions.clone()),
        );
    }
    if let Some(Asset::Model(model)) = store.raw(AssetKind::Model, key) {
        return (Some(model.address.clone()), Some(model.permissions.clone()));
    }
    (None, None)
}

fn resolve_parent_output(
    store: &InMemoryAssetStore,
    task_key: &str,
    output_identifier: &str,
) -> (Option<Addressable>, Option<Permissions>) {
    let Some(Asset::Task(parent)) = store.raw(AssetKind::Task, task_key) else {
        return (None, None);
    };
    let Some(output) = parent.outputs.get(output_identifier) else {
        return (None, None);
    };

    let addressable = match &output.value {
        Some(OutputValue::Model(model)) => Some(model.address.clone()),
        _ => None,
    };
    (addressable, Some(output.permissions.clone()))
}
