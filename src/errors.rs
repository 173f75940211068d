// src/errors.rs

//! Crate-wide error type and result alias.
//!
//! Variants follow the error kinds callers are expected to branch on:
//! missing keys, duplicate keys (store-level and remote), malformed requests
//! (including dependency ordering problems), spawner build/execution
//! failures and remote transport failures.

use thiserror::Error;

use crate::models::AssetKind;

#[derive(Error, Debug)]
pub enum FedplanError {
    #[error("Not found: {0}")]
    NotFound(String),

    /// Returned by the remote backend on HTTP 409. Carries the keys the
    /// backend reported as already present.
    #[error("Asset(s) already exist: {keys:?}")]
    AlreadyExists { keys: Vec<String> },

    /// Duplicate key on `add` into the local asset store.
    #[error("Key already exists in store: {kind} '{key}'")]
    KeyAlreadyExists { kind: AssetKind, key: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Build error for '{name}': {message}")]
    BuildError { name: String, message: String },

    #[error("Execution error for '{name}' (exit code {exit_code:?}):\n{logs}")]
    ExecutionError {
        name: String,
        exit_code: Option<i32>,
        logs: String,
    },

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    /// A timed-out submission whose confirmation polling also gave up.
    #[error("Timed out after {waited_secs}s waiting for '{key}' to be created")]
    RequestTimeout { key: String, waited_secs: u64 },

    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FedplanError {
    /// Whether this error came out of the spawner (build or execution).
    pub fn is_spawner_error(&self) -> bool {
        matches!(
            self,
            FedplanError::BuildError { .. } | FedplanError::ExecutionError { .. }
        )
    }
}

impl From<reqwest::Error> for FedplanError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FedplanError::Timeout(err.to_string())
        } else if err.is_connect() {
            FedplanError::ConnectionError(err.to_string())
        } else if let Some(status) = err.status() {
            FedplanError::HttpError {
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else {
            FedplanError::Other(anyhow::Error::from(err))
        }
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, FedplanError>;
