// src/dag/mod.rs

//! Compute plan dependency graph.
//!
//! - [`rank`] assigns a topological rank to every task and detects cycles.
//! - [`builder`] turns compute plan batches into a graph plus a lookup of
//!   task requests, and orders them for execution.

pub mod builder;
pub mod rank;

pub use builder::{ComputePlanBuilder, PlanGraph};
pub use rank::{DependencyGraph, compute_ranks, execution_order};
