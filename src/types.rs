use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Which backend a client talks to.
///
/// - `Subprocess`: local store, functions run as plain processes (default).
/// - `Docker`: local store, functions built and run as containers.
/// - `Remote`: every call goes to the REST backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    #[default]
    Subprocess,
    Docker,
    Remote,
}

impl BackendType {
    pub fn is_local(self) -> bool {
        !matches!(self, BackendType::Remote)
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendType::Subprocess => "subprocess",
            BackendType::Docker => "docker",
            BackendType::Remote => "remote",
        })
    }
}

impl FromStr for BackendType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "subprocess" => Ok(BackendType::Subprocess),
            "docker" => Ok(BackendType::Docker),
            "remote" => Ok(BackendType::Remote),
            other => Err(format!(
                "invalid backend: {other} (expected \"subprocess\", \"docker\" or \"remote\")"
            )),
        }
    }
}
