// src/config/mod.rs

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{apply_env_overrides, default_config_path, load_and_validate, load_from_path};
pub use model::{
    ClientSection, ComputePlanSection, DataSampleEntry, DatasetEntry, FunctionEntry,
    RawWorkspaceFile, TaskEntry, TaskInputEntry, WorkspaceFile,
};
