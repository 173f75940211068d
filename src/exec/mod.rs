// src/exec/mod.rs

//! Task execution layer.
//!
//! - [`worker`] runs one task end to end against the shared store.
//! - [`spawner`] defines the `Spawner` trait the worker drives, plus the
//!   volume placeholder and argument-file conventions.
//! - [`subprocess`] and [`docker`] are the two production spawners.
//! - [`archive`] unpacks function archives and parses their descriptor.
//! - [`staging`] links and copies files into task volumes.
//! - [`performance`] maintains the per-plan live performance snapshot.

pub mod archive;
pub mod docker;
pub mod performance;
pub mod spawner;
pub mod staging;
pub mod subprocess;
pub mod worker;

pub use docker::DockerSpawner;
pub use spawner::{SpawnRequest, Spawner, Volumes};
pub use subprocess::SubprocessSpawner;
pub use worker::Worker;
