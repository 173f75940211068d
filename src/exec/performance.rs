// src/exec/performance.rs

//! Per-plan projection of performance outputs.
//!
//! The projection is written to
//! `<worker_dir>/live_performances/<plan>/performances.json` after every task
//! that produced a performance. Nothing reads the file back; the same
//! projection is computed on demand by `get_performances`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::Result;
use crate::models::{OutputValue, Task};
use crate::store::{InMemoryAssetStore, filters};

pub const LIVE_PERFORMANCES_DIR: &str = "live_performances";
pub const PERFORMANCES_FILE_NAME: &str = "performances.json";

/// Metadata key used to group performances by training round.
pub const ROUND_METADATA_KEY: &str = "round_idx";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceEntry {
    pub compute_task_key: String,
    pub identifier: String,
    pub function_key: String,
    pub worker: String,
    pub rank: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round_idx: Option<String>,
    pub performance: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Performances {
    pub compute_plan_key: String,
    pub entries: Vec<PerformanceEntry>,
}

/// Every performance recorded so far on the plan's tasks, in rank order.
pub fn collect_performances(
    store: &InMemoryAssetStore,
    compute_plan_key: &str,
) -> Result<Performances> {
    let tasks: Vec<Task> = store.list(
        &filters([("compute_plan_key", vec![compute_plan_key])]),
        Some("rank"),
        true,
    )?;

    let entries = tasks
        .iter()
        .flat_map(|task| {
            task.outputs.iter().filter_map(move |(identifier, output)| {
                match output.value {
                    Some(OutputValue::Performance(performance)) => Some(PerformanceEntry {
                        compute_task_key: task.key.clone(),
                        identifier: identifier.clone(),
                        function_key: task.function_key.clone(),
                        worker: task.worker.clone(),
                        rank: task.rank,
                        round_idx: task.metadata.get(ROUND_METADATA_KEY).cloned(),
                        performance,
                    }),
                    _ => None,
                }
            })
        })
        .collect();

    Ok(Performances {
        compute_plan_key: compute_plan_key.to_string(),
        entries,
    })
}

pub fn snapshot_path(worker_dir: &Path, compute_plan_key: &str) -> PathBuf {
    worker_dir
        .join(LIVE_PERFORMANCES_DIR)
        .join(compute_plan_key)
        .join(PERFORMANCES_FILE_NAME)
}

/// Overwrite the plan's snapshot file. The write goes through a temporary
/// file so readers never see a partial document.
pub fn write_snapshot(worker_dir: &Path, performances: &Performances) -> Result<PathBuf> {
    let path = snapshot_path(worker_dir, &performances.compute_plan_key);
    let dir = path
        .parent()
        .context("performance snapshot path has no parent")?;
    fs::create_dir_all(dir).with_context(|| format!("creating dir {:?}", dir))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("creating temp file in {:?}", dir))?;
    tmp.write_all(serde_json::to_string_pretty(performances)?.as_bytes())?;
    tmp.persist(&path)
        .map_err(|e| anyhow::anyhow!("writing {:?}: {}", path, e.error))?;

    debug!(
        compute_plan = %performances.compute_plan_key,
        entries = performances.entries.len(),
        "wrote live performances"
    );
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_overwritten_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let mut perfs = Performances {
            compute_plan_key: "cp1".into(),
            entries: vec![],
        };
        let path = write_snapshot(dir.path(), &perfs).unwrap();
        assert_eq!(path, snapshot_path(dir.path(), "cp1"));

        perfs.entries.push(PerformanceEntry {
            compute_task_key: "t1".into(),
            identifier: "performance".into(),
            function_key: "f1".into(),
            worker: "org".into(),
            rank: 1,
            round_idx: Some("0".into()),
            performance: 0.75,
        });
        write_snapshot(dir.path(), &perfs).unwrap();

        let read: Performances =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(read, perfs);
    }
}
