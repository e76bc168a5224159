//! S3-compatible remote object store over plain HTTP.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use intake_config::RemoteStoreConfig;
use intake_model::{StorageBackend, StoragePointer};
use tracing::debug;

use super::sigv4::{self, SigningKey};
use super::{ObjectStore, UrlMethod};
use crate::error::{CoreError, Result};

pub struct RemoteObjectStore {
    client: reqwest::Client,
    config: RemoteStoreConfig,
    host: String,
}

impl RemoteObjectStore {
    pub fn new(config: RemoteStoreConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| CoreError::Storage(e.to_string()))?;

        let url = url::Url::parse(&config.endpoint)
            .map_err(|e| CoreError::Storage(format!("bad endpoint: {e}")))?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(CoreError::Storage(
                    "endpoint has no host".into(),
                ));
            }
        };

        Ok(Self { client, config, host })
    }

    fn path(&self, key: &str) -> String {
        format!("/{}/{}", self.config.bucket, key.trim_start_matches('/'))
    }

    fn url(&self, key: &str) -> String {
        format!(
            "{}{}",
            self.config.endpoint.trim_end_matches('/'),
            sigv4::canonical_uri(&self.path(key)),
        )
    }

    fn signing_key(&self) -> SigningKey<'_> {
        SigningKey {
            access_key: &self.config.access_key,
            secret_key: &self.config.secret_key,
            region: &self.config.region,
        }
    }

    fn signed_request(
        &self,
        method: reqwest::Method,
        key: &str,
        payload_hash: &str,
    ) -> reqwest::RequestBuilder {
        let (authorization, timestamp) = sigv4::sign_headers(
            &self.signing_key(),
            method.as_str(),
            &self.host,
            &self.path(key),
            payload_hash,
            Utc::now(),
        );
        self.client
            .request(method, self.url(key))
            .header("authorization", authorization)
            .header("x-amz-date", timestamp)
            .header("x-amz-content-sha256", payload_hash.to_owned())
    }
}

#[async_trait]
impl ObjectStore for RemoteObjectStore {
    fn backend(&self) -> StorageBackend {
        StorageBackend::Remote
    }

    async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        media_type: &str,
    ) -> Result<StoragePointer> {
        let payload_hash = sigv4::sha256_hex(bytes);
        let response = self
            .signed_request(reqwest::Method::PUT, key, &payload_hash)
            .header("content-type", media_type.to_owned())
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| CoreError::Storage(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CoreError::Storage(format!(
                "remote put {key} returned {}",
                response.status()
            )));
        }

        debug!(key, size = bytes.len(), "remote store put");
        Ok(StoragePointer::remote(key))
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let payload_hash = sigv4::sha256_hex(b"");
        let response = self
            .signed_request(reqwest::Method::GET, key, &payload_hash)
            .send()
            .await
            .map_err(|e| CoreError::Storage(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CoreError::NotFound(key.to_owned()));
        }
        if !response.status().is_success() {
            return Err(CoreError::Storage(format!(
                "remote get {key} returned {}",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| CoreError::Storage(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let payload_hash = sigv4::sha256_hex(b"");
        let response = self
            .signed_request(reqwest::Method::DELETE, key, &payload_hash)
            .send()
            .await
            .map_err(|e| CoreError::Storage(e.to_string()))?;

        // S3 deletes report success for absent keys as well.
        if response.status().is_success()
            || response.status() == reqwest::StatusCode::NOT_FOUND
        {
            return Ok(true);
        }
        Err(CoreError::Storage(format!(
            "remote delete {key} returned {}",
            response.status()
        )))
    }

    async fn signed_url(
        &self,
        key: &str,
        ttl: Duration,
        method: UrlMethod,
    ) -> Result<String> {
        let query = sigv4::presign_query(
            &self.signing_key(),
            method.as_str(),
            &self.host,
            &self.path(key),
            ttl.as_secs().max(1),
            Utc::now(),
        );
        Ok(format!("{}?{query}", self.url(key)))
    }
}
