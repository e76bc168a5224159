//! Local-disk fallback backend.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use intake_model::{StorageBackend, StoragePointer};
use tracing::debug;

use super::token::{UrlTokenStore, mint_token};
use super::{ObjectStore, UrlMethod};
use crate::error::{CoreError, Result};

pub struct LocalDiskStore {
    base_path: PathBuf,
    public_url: String,
    tokens: Arc<dyn UrlTokenStore>,
}

impl LocalDiskStore {
    pub fn new(
        base_path: PathBuf,
        public_url: String,
        tokens: Arc<dyn UrlTokenStore>,
    ) -> Self {
        Self {
            base_path,
            public_url: public_url.trim_end_matches('/').to_owned(),
            tokens,
        }
    }

    /// Map a storage key onto a path under the base directory, rejecting
    /// traversal.
    fn file_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(CoreError::Storage(format!(
                "unsafe storage key: {key}"
            )));
        }
        Ok(self.base_path.join(relative))
    }

    /// Validate a signed-URL token; returns the key it authorizes.
    pub async fn authorize_token(
        &self,
        token: &str,
        key: &str,
    ) -> Result<bool> {
        Ok(self
            .tokens
            .lookup(token)
            .await?
            .is_some_and(|granted| granted == key))
    }
}

#[async_trait]
impl ObjectStore for LocalDiskStore {
    fn backend(&self) -> StorageBackend {
        StorageBackend::Local
    }

    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        _media_type: &str,
    ) -> Result<StoragePointer> {
        let path = self.file_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        debug!(key, size = bytes.len(), "local store put");
        Ok(StoragePointer::local(key))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.file_path(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CoreError::NotFound(key.to_owned()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let path = self.file_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    async fn signed_url(
        &self,
        key: &str,
        ttl: Duration,
        _method: UrlMethod,
    ) -> Result<String> {
        let token = mint_token();
        self.tokens.put(&token, key, ttl).await?;
        let encoded: String = key
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        Ok(format!(
            "{}/storage/local/{encoded}?token={token}",
            self.public_url
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::super::token::MemoryTokenStore;
    use super::*;

    fn store(dir: &tempfile::TempDir) -> LocalDiskStore {
        LocalDiskStore::new(
            dir.path().to_path_buf(),
            "http://localhost:8500".into(),
            Arc::new(MemoryTokenStore::new()),
        )
    }

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        let pointer = store
            .put("emails/raw/env/2025-05-02/a.eml", b"raw", "message/rfc822")
            .await
            .unwrap();
        assert_eq!(pointer.backend, StorageBackend::Local);
        assert_eq!(
            store.get("emails/raw/env/2025-05-02/a.eml").await.unwrap(),
            b"raw"
        );

        assert!(store.delete("emails/raw/env/2025-05-02/a.eml").await.unwrap());
        // Absent keys still report success.
        assert!(store.delete("emails/raw/env/2025-05-02/a.eml").await.unwrap());
        assert!(matches!(
            store.get("emails/raw/env/2025-05-02/a.eml").await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn traversal_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        assert!(store.put("../escape", b"x", "text/plain").await.is_err());
        assert!(store.get("a/../../b").await.is_err());
    }

    #[tokio::test]
    async fn signed_url_tokens_authorize_exactly_one_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.put("a/b.bin", b"x", "application/octet-stream").await.unwrap();

        let url = store
            .signed_url("a/b.bin", Duration::from_secs(60), UrlMethod::Get)
            .await
            .unwrap();
        let token = url.split("token=").nth(1).unwrap();
        assert!(store.authorize_token(token, "a/b.bin").await.unwrap());
        assert!(!store.authorize_token(token, "a/other.bin").await.unwrap());
        assert!(!store.authorize_token("bogus", "a/b.bin").await.unwrap());
    }
}
