// src/dag/builder.rs

//! Expansion of compute plan batches into a ranked dependency graph.

use std::collections::BTreeMap;

use tracing::debug;

use crate::dag::rank::{DependencyGraph, compute_ranks};
use crate::errors::{FedplanError, Result};
use crate::models::task::parent_keys;
use crate::schemas::{ComputePlanBatches, TaskRequest};

/// Dependency graph of one plan submission plus the task requests it was
/// built from, keyed by task id.
#[derive(Debug, Clone)]
pub struct PlanGraph {
    pub graph: DependencyGraph<String>,
    pub tasks: BTreeMap<String, TaskRequest>,
    /// Task ids in batch order (train, aggregate, composite, predict, test).
    order: Vec<String>,
}

impl PlanGraph {
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Builds [`PlanGraph`]s for a given compute plan.
///
/// When the plan already holds tasks, their ranks are passed with
/// [`ComputePlanBuilder::with_existing_ranks`] so new tasks may depend on them.
#[derive(Debug, Clone)]
pub struct ComputePlanBuilder {
    compute_plan_key: String,
    existing_ranks: BTreeMap<String, u32>,
}

impl ComputePlanBuilder {
    pub fn new(compute_plan_key: impl Into<String>) -> Self {
        Self {
            compute_plan_key: compute_plan_key.into(),
            existing_ranks: BTreeMap::new(),
        }
    }

    pub fn with_existing_ranks(mut self, ranks: BTreeMap<String, u32>) -> Self {
        self.existing_ranks = ranks;
        self
    }

    /// Build the graph: each task's parents are the distinct
    /// `parent_task_key`s of its inputs.
    pub fn build(&self, batches: &ComputePlanBatches) -> Result<PlanGraph> {
        let mut graph: DependencyGraph<String> = BTreeMap::new();
        let mut tasks: BTreeMap<String, TaskRequest> = BTreeMap::new();
        let mut order = Vec::with_capacity(batches.len());

        for (category, entry) in batches.iter() {
            let id = entry.task_id.clone();

            if self.existing_ranks.contains_key(&id) {
                return Err(FedplanError::InvalidRequest(format!(
                    "task '{id}' already belongs to compute plan '{}'",
                    self.compute_plan_key
                )));
            }
            if graph.contains_key(&id) {
                return Err(FedplanError::InvalidRequest(format!(
                    "duplicate task id '{id}' in compute plan '{}'",
                    self.compute_plan_key
                )));
            }

            for input in &entry.inputs {
                input.source()?;
            }

            let parents: Vec<String> = parent_keys(&entry.inputs)
                .into_iter()
                .map(str::to_string)
                .collect();

            debug!(task = %id, ?category, ?parents, "adding task to compute plan graph");

            graph.insert(id.clone(), parents);
            tasks.insert(
                id.clone(),
                entry
                    .clone()
                    .into_task_request(category, &self.compute_plan_key),
            );
            order.push(id);
        }

        Ok(PlanGraph {
            graph,
            tasks,
            order,
        })
    }

    /// Assign ranks and return the task requests in execution order
    /// (ascending rank, batch order among equal ranks).
    pub fn rank(&self, plan: PlanGraph) -> Result<Vec<TaskRequest>> {
        let ranks = compute_ranks(&plan.graph, Some(&self.existing_ranks))?;

        let PlanGraph {
            mut tasks, order, ..
        } = plan;

        let mut ranked: Vec<TaskRequest> = Vec::with_capacity(order.len());
        for id in order {
            let mut request = tasks.remove(&id).ok_or_else(|| {
                FedplanError::Other(anyhow::anyhow!("task '{id}' missing from plan lookup"))
            })?;
            request.rank = ranks.get(&id).copied();
            ranked.push(request);
        }
        ranked.sort_by_key(|t| t.rank.unwrap_or(0));

        Ok(ranked)
    }

    /// `build` followed by `rank`.
    pub fn build_ranked(&self, batches: &ComputePlanBatches) -> Result<Vec<TaskRequest>> {
        let plan = self.build(batches)?;
        self.rank(plan)
    }
}
