// src/config/validate.rs

use std::collections::HashSet;

use crate::config::model::{RawWorkspaceFile, TaskInputEntry, WorkspaceFile};
use crate::errors::{FedplanError, Result};
use crate::models::{Metadata, validate_metadata};
use crate::types::BackendType;

impl TryFrom<RawWorkspaceFile> for WorkspaceFile {
    type Error = crate::errors::FedplanError;

    fn try_from(raw: RawWorkspaceFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_workspace(&raw)?;
        Ok(WorkspaceFile::new_unchecked(raw))
    }
}

fn validate_raw_workspace(cfg: &RawWorkspaceFile) -> Result<()> {
    validate_client(cfg)?;
    validate_unique_ids(cfg)?;
    validate_data_samples(cfg)?;
    validate_metadata_fields(cfg)?;
    validate_tasks(cfg)?;
    Ok(())
}

fn config_error(message: impl Into<String>) -> FedplanError {
    FedplanError::ConfigError(message.into())
}

fn validate_client(cfg: &RawWorkspaceFile) -> Result<()> {
    let client = &cfg.client;

    if client.organization.trim().is_empty() {
        return Err(config_error("[client].organization must not be empty"));
    }
    if client.retry_timeout_secs == 0 {
        return Err(config_error(
            "[client].retry_timeout_secs must be >= 1 (got 0)",
        ));
    }

    let has_url = client.url.as_deref().is_some_and(|u| !u.trim().is_empty());
    if client.backend == BackendType::Remote && !has_url {
        return Err(config_error(
            "[client].backend = \"remote\" requires [client].url (or FEDPLAN_URL)",
        ));
    }
    if client.hybrid {
        if !client.backend.is_local() {
            return Err(config_error(
                "[client].hybrid only applies to the subprocess and docker backends",
            ));
        }
        if !has_url {
            return Err(config_error(
                "[client].hybrid = true requires [client].url (or FEDPLAN_URL)",
            ));
        }
    }
    Ok(())
}

fn ensure_unique<'a>(section: &str, ids: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();
    for id in ids {
        if id.trim().is_empty() {
            return Err(config_error(format!("[[{section}]] entry has an empty id")));
        }
        if !seen.insert(id) {
            return Err(config_error(format!(
                "duplicate id '{id}' in [[{section}]]"
            )));
        }
    }
    Ok(())
}

fn validate_unique_ids(cfg: &RawWorkspaceFile) -> Result<()> {
    ensure_unique("dataset", cfg.dataset.iter().map(|d| d.id.as_str()))?;
    ensure_unique("data_sample", cfg.data_sample.iter().map(|s| s.id.as_str()))?;
    ensure_unique("function", cfg.function.iter().map(|f| f.id.as_str()))?;
    if let Some(plan) = &cfg.compute_plan {
        ensure_unique("compute_plan.task", plan.tasks.iter().map(|t| t.id.as_str()))?;
    }
    Ok(())
}

fn validate_data_samples(cfg: &RawWorkspaceFile) -> Result<()> {
    let datasets: HashSet<&str> = cfg.dataset.iter().map(|d| d.id.as_str()).collect();
    for sample in &cfg.data_sample {
        if sample.datasets.is_empty() {
            return Err(config_error(format!(
                "data sample '{}' must belong to at least one dataset",
                sample.id
            )));
        }
        for dataset in &sample.datasets {
            if !datasets.contains(dataset.as_str()) {
                return Err(config_error(format!(
                    "data sample '{}' refers to unknown dataset '{dataset}'",
                    sample.id
                )));
            }
        }
    }
    Ok(())
}

fn check_metadata(owner: &str, metadata: &Metadata) -> Result<()> {
    validate_metadata(metadata).map_err(|err| config_error(format!("{owner}: {err}")))
}

fn validate_metadata_fields(cfg: &RawWorkspaceFile) -> Result<()> {
    for dataset in &cfg.dataset {
        check_metadata(&format!("dataset '{}'", dataset.id), &dataset.metadata)?;
    }
    for function in &cfg.function {
        check_metadata(&format!("function '{}'", function.id), &function.metadata)?;
    }
    if let Some(plan) = &cfg.compute_plan {
        check_metadata("[compute_plan]", &plan.metadata)?;
        for task in &plan.tasks {
            check_metadata(&format!("task '{}'", task.id), &task.metadata)?;
        }
    }
    Ok(())
}

fn validate_tasks(cfg: &RawWorkspaceFile) -> Result<()> {
    let Some(plan) = &cfg.compute_plan else {
        return Ok(());
    };

    let functions: HashSet<&str> = cfg.function.iter().map(|f| f.id.as_str()).collect();
    let datasets: HashSet<&str> = cfg.dataset.iter().map(|d| d.id.as_str()).collect();
    let samples: HashSet<&str> = cfg.data_sample.iter().map(|s| s.id.as_str()).collect();
    let tasks: HashSet<&str> = plan.tasks.iter().map(|t| t.id.as_str()).collect();

    for task in &plan.tasks {
        if !functions.contains(task.function.as_str()) {
            return Err(config_error(format!(
                "task '{}' refers to unknown function '{}'",
                task.id, task.function
            )));
        }
        for input in &task.inputs {
            validate_task_input(&task.id, input, &datasets, &samples, &tasks)?;
        }
    }
    // Cycles are reported when the plan is ranked.
    Ok(())
}

fn validate_task_input(
    task_id: &str,
    input: &TaskInputEntry,
    datasets: &HashSet<&str>,
    samples: &HashSet<&str>,
    tasks: &HashSet<&str>,
) -> Result<()> {
    let sources = [
        input.dataset.is_some(),
        input.data_sample.is_some(),
        input.model.is_some(),
        input.parent.is_some(),
    ]
    .into_iter()
    .filter(|set| *set)
    .count();
    if sources != 1 {
        return Err(config_error(format!(
            "task '{task_id}' input '{}' must set exactly one of dataset, data_sample, model or parent",
            input.identifier
        )));
    }

    if let Some(dataset) = &input.dataset
        && !datasets.contains(dataset.as_str())
    {
        return Err(config_error(format!(
            "task '{task_id}' input '{}' refers to unknown dataset '{dataset}'",
            input.identifier
        )));
    }
    if let Some(sample) = &input.data_sample
        && !samples.contains(sample.as_str())
    {
        return Err(config_error(format!(
            "task '{task_id}' input '{}' refers to unknown data sample '{sample}'",
            input.identifier
        )));
    }
    match (&input.parent, &input.output) {
        (Some(parent), Some(_)) => {
            if parent == task_id {
                return Err(config_error(format!(
                    "task '{task_id}' cannot use its own output as input"
                )));
            }
            if !tasks.contains(parent.as_str()) {
                return Err(config_error(format!(
                    "task '{task_id}' input '{}' refers to unknown parent task '{parent}'",
                    input.identifier
                )));
            }
        }
        (Some(_), None) => {
            return Err(config_error(format!(
                "task '{task_id}' input '{}' sets parent without output",
                input.identifier
            )));
        }
        (None, Some(_)) => {
            return Err(config_error(format!(
                "task '{task_id}' input '{}' sets output without parent",
                input.identifier
            )));
        }
        (None, None) => {}
    }
    Ok(())
}
