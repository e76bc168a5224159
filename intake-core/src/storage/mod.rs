//! Blob storage: remote S3-compatible backend with local-disk fallback.
//!
//! Writes try the remote backend first and fall back to disk on failure;
//! the resulting [`StoragePointer`] records which backend owns the blob
//! so reads dispatch by tag. Keys are globally unique by construction,
//! so no locking is needed.

mod local;
mod remote;
mod sigv4;
mod token;

pub use local::LocalDiskStore;
pub use remote::RemoteObjectStore;
pub use token::{MemoryTokenStore, RedisTokenStore, UrlTokenStore};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use intake_model::{StorageBackend, StoragePointer};
use tracing::warn;

use crate::error::{CoreError, Result};

/// HTTP verb a signed URL authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlMethod {
    Get,
    Put,
}

impl UrlMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            UrlMethod::Get => "GET",
            UrlMethod::Put => "PUT",
        }
    }
}

/// Store and retrieve opaque blobs by key.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn backend(&self) -> StorageBackend;

    /// Idempotent on key (overwrite semantics).
    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        media_type: &str,
    ) -> Result<StoragePointer>;

    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Absent keys return success.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// A URL usable by an unauthenticated HTTP client until expiry.
    async fn signed_url(
        &self,
        key: &str,
        ttl: Duration,
        method: UrlMethod,
    ) -> Result<String>;
}

/// Front door over the configured backends.
///
/// `put` attempts remote first and tags the pointer with whichever backend
/// accepted the bytes. A put that fails on both backends surfaces an
/// error; the caller must then treat the blob as unwritten.
#[derive(Clone)]
pub struct BlobStorage {
    remote: Option<Arc<RemoteObjectStore>>,
    local: Option<Arc<LocalDiskStore>>,
}

impl BlobStorage {
    pub fn new(
        remote: Option<Arc<RemoteObjectStore>>,
        local: Option<Arc<LocalDiskStore>>,
    ) -> Self {
        Self { remote, local }
    }

    pub fn local_store(&self) -> Option<&Arc<LocalDiskStore>> {
        self.local.as_ref()
    }

    pub async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        media_type: &str,
    ) -> Result<StoragePointer> {
        if let Some(remote) = &self.remote {
            match remote.put(key, bytes, media_type).await {
                Ok(pointer) => return Ok(pointer),
                Err(e) => {
                    warn!(key, error = %e, "remote store put failed, trying local fallback");
                }
            }
        }

        if let Some(local) = &self.local {
            return local.put(key, bytes, media_type).await;
        }

        Err(CoreError::Storage(format!(
            "no backend accepted blob: {key}"
        )))
    }

    pub async fn get(&self, pointer: &StoragePointer) -> Result<Vec<u8>> {
        self.store_for(pointer.backend)?.get(&pointer.key).await
    }

    pub async fn delete(&self, pointer: &StoragePointer) -> Result<bool> {
        self.store_for(pointer.backend)?.delete(&pointer.key).await
    }

    pub async fn signed_url(
        &self,
        pointer: &StoragePointer,
        ttl: Duration,
        method: UrlMethod,
    ) -> Result<String> {
        self.store_for(pointer.backend)?
            .signed_url(&pointer.key, ttl, method)
            .await
    }

    fn store_for(&self, backend: StorageBackend) -> Result<&dyn ObjectStore> {
        match backend {
            StorageBackend::Remote => self
                .remote
                .as_deref()
                .map(|s| s as &dyn ObjectStore)
                .ok_or_else(|| {
                    CoreError::Storage("remote backend not configured".into())
                }),
            StorageBackend::Local => self
                .local
                .as_deref()
                .map(|s| s as &dyn ObjectStore)
                .ok_or_else(|| {
                    CoreError::Storage("local backend not configured".into())
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_without_backends_errors() {
        let storage = BlobStorage::new(None, None);
        let err = storage.put("a/b", b"x", "text/plain").await.unwrap_err();
        assert!(matches!(err, CoreError::Storage(_)));
    }

    #[tokio::test]
    async fn read_dispatches_by_pointer_tag() {
        let dir = tempfile::tempdir().unwrap();
        let local = Arc::new(LocalDiskStore::new(
            dir.path().to_path_buf(),
            "http://localhost:8500".into(),
            Arc::new(MemoryTokenStore::new()),
        ));
        let storage = BlobStorage::new(None, Some(local));

        let pointer =
            storage.put("emails/raw/env/x.eml", b"mail", "message/rfc822").await.unwrap();
        assert_eq!(pointer.backend, StorageBackend::Local);
        assert_eq!(storage.get(&pointer).await.unwrap(), b"mail");

        let remote_pointer = StoragePointer::remote("emails/raw/env/x.eml");
        assert!(storage.get(&remote_pointer).await.is_err());
    }
}
