//! Object storage for avatars and task attachments.

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, instrument};

use super::{StoreError, StoreResult};

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Store `bytes` under `bucket/path` and return the object's public URL.
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> StoreResult<String>;
}

/// Supabase Storage REST client.
#[derive(Clone)]
pub struct SupabaseStorage {
    client: Client,
    base_url: String,
    service_key: String,
}

impl SupabaseStorage {
    pub fn new(base_url: &str, service_key: &str, timeout_seconds: u64) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .context("Failed to create HTTP client")?;

        tracing::info!(base_url = base_url, "Object storage client initialized");

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key: service_key.to_string(),
        })
    }

    pub fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("{}/storage/v1/object/public/{}/{}", self.base_url, bucket, path)
    }
}

#[async_trait]
impl ObjectStorage for SupabaseStorage {
    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> StoreResult<String> {
        let url = format!("{}/storage/v1/object/{}/{}", self.base_url, bucket, path);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.service_key)
            .header("apikey", &self.service_key)
            .header("Content-Type", content_type)
            .header("x-upsert", "true")
            .body(bytes)
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(format!("upload request failed: {e}")))?;

        match response.status() {
            status if status.is_success() => {
                debug!(bucket = bucket, path = path, "Object uploaded");
                Ok(self.public_url(bucket, path))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(StoreError::Denied(
                "object storage rejected the credentials".to_string(),
            )),
            StatusCode::CONFLICT => Err(StoreError::Conflict(format!("object {bucket}/{path} exists"))),
            status if status.is_server_error() => Err(StoreError::Unavailable(format!(
                "object storage returned {status}"
            ))),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(StoreError::Backend(anyhow::anyhow!(
                    "object storage returned {status}: {body}"
                )))
            }
        }
    }
}

/// Keeps uploads in memory; URLs use the `memory://` scheme.
#[derive(Default)]
pub struct MemoryObjectStorage {
    objects: Mutex<HashMap<String, (String, Vec<u8>)>>,
}

impl MemoryObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, url: &str) -> Option<(String, Vec<u8>)> {
        self.objects.lock().get(url).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStorage for MemoryObjectStorage {
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> StoreResult<String> {
        let url = format!("memory://{bucket}/{path}");
        self.objects
            .lock()
            .insert(url.clone(), (content_type.to_string(), bytes));
        Ok(url)
    }
}
