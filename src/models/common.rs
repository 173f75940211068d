// src/models/common.rs

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{FedplanError, Result};

/// Free-form string metadata attached to assets.
pub type Metadata = BTreeMap<String, String>;

pub const METADATA_KEY_MAX_LEN: usize = 50;
pub const METADATA_VALUE_MAX_LEN: usize = 100;

/// Who may use an asset or a task output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    pub public: bool,
    #[serde(default)]
    pub authorized_ids: Vec<String>,
}

impl Permissions {
    pub fn public() -> Self {
        Self {
            public: true,
            authorized_ids: Vec::new(),
        }
    }

    pub fn restricted_to<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            public: false,
            authorized_ids: ids.into_iter().map(Into::into).collect(),
        }
    }
}

impl Default for Permissions {
    fn default() -> Self {
        Permissions::public()
    }
}

/// Where a file-backed asset lives, plus its content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Addressable {
    pub storage_address: String,
    pub checksum: String,
}

/// A participant of the network. Locally these are the distinct owners and
/// workers seen in the store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Organization {
    pub id: String,
    #[serde(default)]
    pub is_current: bool,
}

/// Validate a metadata map.
///
/// Keys are at most 50 characters and may not contain `__` (reserved by the
/// remote filter syntax); values are 1 to 100 characters.
pub fn validate_metadata(metadata: &Metadata) -> Result<()> {
    for (key, value) in metadata {
        if key.chars().count() > METADATA_KEY_MAX_LEN {
            return Err(FedplanError::InvalidRequest(format!(
                "metadata key '{key}' is longer than {METADATA_KEY_MAX_LEN} characters"
            )));
        }
        if key.contains("__") {
            return Err(FedplanError::InvalidRequest(format!(
                "metadata key '{key}' must not contain '__'"
            )));
        }
        let len = value.chars().count();
        if len == 0 || len > METADATA_VALUE_MAX_LEN {
            return Err(FedplanError::InvalidRequest(format!(
                "metadata value for '{key}' must be 1 to {METADATA_VALUE_MAX_LEN} characters (got {len})"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(pairs: &[(&str, &str)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn accepts_regular_metadata() {
        assert!(validate_metadata(&meta(&[("epoch", "3"), ("lr", "0.01")])).is_ok());
    }

    #[test]
    fn rejects_double_underscore_keys() {
        let err = validate_metadata(&meta(&[("a__b", "x")])).unwrap_err();
        assert!(matches!(err, FedplanError::InvalidRequest(_)));
    }

    #[test]
    fn rejects_empty_and_oversized_values() {
        assert!(validate_metadata(&meta(&[("k", "")])).is_err());
        let long = "v".repeat(METADATA_VALUE_MAX_LEN + 1);
        assert!(validate_metadata(&meta(&[("k", long.as_str())])).is_err());
    }

    #[test]
    fn rejects_long_keys() {
        let key = "k".repeat(METADATA_KEY_MAX_LEN + 1);
        assert!(validate_metadata(&meta(&[(key.as_str(), "v")])).is_err());
    }
}
