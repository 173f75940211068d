// src/dag/rank.rs

//! Topological rank assignment over a task dependency graph.
//!
//! `rank(t) = 0` when `t` has no parents, otherwise
//! `1 + max(rank(p) for p in parents(t))`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;

use tracing::debug;

use crate::errors::{FedplanError, Result};

/// Graph as `task -> parents`.
pub type DependencyGraph<K> = BTreeMap<K, Vec<K>>;

/// Compute the rank of every task in `graph`.
///
/// `visited` pre-seeds ranks that are already known (tasks committed to an
/// existing compute plan); those ids may be referenced as parents without
/// being keys of `graph`. The returned map only holds the keys of `graph`.
///
/// Fails with [`FedplanError::InvalidRequest`] when a cycle or a parent that
/// is neither in `graph` nor in `visited` is found.
pub fn compute_ranks<K>(
    graph: &DependencyGraph<K>,
    visited: Option<&BTreeMap<K, u32>>,
) -> Result<BTreeMap<K, u32>>
where
    K: Ord + Clone + Display,
{
    let mut ranks: BTreeMap<K, u32> = visited.cloned().unwrap_or_default();

    for root in graph.keys() {
        if ranks.contains_key(root) {
            continue;
        }
        // Edges walked during this traversal; seeing one twice means a cycle.
        let mut edges: BTreeSet<(K, K)> = BTreeSet::new();
        rank_of(root, graph, &mut ranks, &mut edges)?;
    }

    debug!(tasks = graph.len(), "computed task ranks");

    Ok(graph
        .keys()
        .filter_map(|k| ranks.get(k).map(|r| (k.clone(), *r)))
        .collect())
}

fn rank_of<K>(
    node: &K,
    graph: &DependencyGraph<K>,
    ranks: &mut BTreeMap<K, u32>,
    edges: &mut BTreeSet<(K, K)>,
) -> Result<u32>
where
    K: Ord + Clone + Display,
{
    if let Some(rank) = ranks.get(node) {
        return Ok(*rank);
    }

    let parents = graph.get(node).ok_or_else(|| {
        FedplanError::InvalidRequest(format!(
            "dependency ordering problem: task '{node}' is referenced as a parent but is not part of the compute plan"
        ))
    })?;

    let mut unique: Vec<&K> = Vec::with_capacity(parents.len());
    for parent in parents {
        if !unique.contains(&parent) {
            unique.push(parent);
        }
    }

    let mut rank = 0;
    for parent in unique {
        if !edges.insert((node.clone(), parent.clone())) {
            return Err(FedplanError::InvalidRequest(format!(
                "dependency ordering problem: cycle detected involving task '{node}'"
            )));
        }
        let parent_rank = rank_of(parent, graph, ranks, edges)?;
        rank = rank.max(parent_rank + 1);
    }

    ranks.insert(node.clone(), rank);
    Ok(rank)
}

/// Order tasks for execution: ascending rank, ties kept in map order.
pub fn execution_order<K: Clone>(ranks: &BTreeMap<K, u32>) -> Vec<(K, u32)> {
    let mut ordered: Vec<(K, u32)> = ranks.iter().map(|(k, r)| (k.clone(), *r)).collect();
    ordered.sort_by_key(|(_, rank)| *rank);
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: Vec<(u32, Vec<u32>)>) -> DependencyGraph<u32> {
        edges.into_iter().collect()
    }

    #[test]
    fn roots_have_rank_zero() {
        let g = graph(vec![(0, vec![]), (1, vec![])]);
        let ranks = compute_ranks(&g, None).unwrap();
        assert_eq!(ranks[&0], 0);
        assert_eq!(ranks[&1], 0);
    }

    #[test]
    fn diamond_takes_longest_path() {
        let g = graph(vec![(0, vec![]), (1, vec![0]), (2, vec![1]), (3, vec![0, 2])]);
        let ranks = compute_ranks(&g, None).unwrap();
        assert_eq!(ranks[&3], 3);
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let g = graph(vec![(0, vec![0])]);
        let err = compute_ranks(&g, None).unwrap_err();
        assert!(err.to_string().contains("dependency ordering problem"));
    }

    #[test]
    fn duplicate_parent_is_not_a_cycle() {
        let g = graph(vec![(0, vec![]), (1, vec![0, 0])]);
        let ranks = compute_ranks(&g, None).unwrap();
        assert_eq!(ranks[&1], 1);
    }

    #[test]
    fn missing_parent_is_invalid() {
        let g = graph(vec![(1, vec![7])]);
        let err = compute_ranks(&g, None).unwrap_err();
        assert!(matches!(err, FedplanError::InvalidRequest(_)));
    }

    #[test]
    fn execution_order_is_by_rank() {
        let ranks: BTreeMap<&str, u32> = [("a", 2), ("b", 0), ("c", 1), ("d", 0)].into();
        let order: Vec<&str> = execution_order(&ranks).into_iter().map(|(k, _)| k).collect();
        assert_eq!(order, vec!["b", "d", "c", "a"]);
    }
}
