//! Storage pointers: which backend holds a blob, and under which key.

use std::fmt::{self, Display};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Remote,
    Local,
}

impl StorageBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageBackend::Remote => "remote",
            StorageBackend::Local => "local",
        }
    }
}

impl Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageBackend {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "remote" => Ok(StorageBackend::Remote),
            "local" => Ok(StorageBackend::Local),
            other => Err(ModelError::InvalidField {
                field: "storage_backend",
                reason: format!("unknown storage backend: {other}"),
            }),
        }
    }
}

/// Backend tag plus opaque key; everything needed to find a blob again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePointer {
    pub backend: StorageBackend,
    pub key: String,
}

impl StoragePointer {
    pub fn remote(key: impl Into<String>) -> Self {
        Self { backend: StorageBackend::Remote, key: key.into() }
    }

    pub fn local(key: impl Into<String>) -> Self {
        Self { backend: StorageBackend::Local, key: key.into() }
    }
}
