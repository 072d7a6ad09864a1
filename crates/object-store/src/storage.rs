//! `object_store` backed storage.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use tracing::debug;

use crate::error::{ObjectStoreError, Result};
use crate::RemoteObject;

/// Which `object_store` implementation backs a [`Storage`].
#[derive(Debug, Clone)]
pub enum ObjectStoreConfig {
    /// S3-compatible service (AWS, MinIO, R2, ...)
    S3 {
        endpoint: String,
        access_key: Option<String>,
        secret_key: Option<String>,
        bucket: String,
        region: Option<String>,
    },
    /// Plain directory on the local filesystem
    Local { path: PathBuf },
    /// Process-local store, lost when dropped
    Memory,
}

/// A bucket reachable through `object_store`.
#[derive(Clone)]
pub struct Storage {
    inner: Arc<dyn ObjectStore>,
    config: ObjectStoreConfig,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.config {
            ObjectStoreConfig::S3 {
                endpoint, bucket, ..
            } => format!("s3({endpoint}/{bucket})"),
            ObjectStoreConfig::Local { path } => format!("local({})", path.display()),
            ObjectStoreConfig::Memory => "memory".to_string(),
        };
        f.debug_struct("Storage").field("kind", &kind).finish()
    }
}

impl Storage {
    /// Build the store described by `config`.
    pub fn new(config: ObjectStoreConfig) -> Result<Self> {
        let inner: Arc<dyn ObjectStore> = match &config {
            ObjectStoreConfig::S3 {
                endpoint,
                access_key,
                secret_key,
                bucket,
                region,
            } => {
                let mut builder = AmazonS3Builder::from_env()
                    .with_endpoint(endpoint)
                    .with_bucket_name(bucket)
                    .with_allow_http(endpoint.starts_with("http://"))
                    .with_virtual_hosted_style_request(false)
                    .with_region(region.as_deref().unwrap_or("us-east-1"));
                if let Some(access_key) = access_key {
                    builder = builder.with_access_key_id(access_key);
                }
                if let Some(secret_key) = secret_key {
                    builder = builder.with_secret_access_key(secret_key);
                }
                Arc::new(builder.build()?)
            }
            ObjectStoreConfig::Local { path } => {
                std::fs::create_dir_all(path)?;
                Arc::new(LocalFileSystem::new_with_prefix(path)?)
            }
            ObjectStoreConfig::Memory => Arc::new(InMemory::new()),
        };

        Ok(Self { inner, config })
    }

    /// Fully in-memory storage, mostly for tests.
    pub fn memory() -> Self {
        Self {
            inner: Arc::new(InMemory::new()),
            config: ObjectStoreConfig::Memory,
        }
    }

    pub fn config(&self) -> &ObjectStoreConfig {
        &self.config
    }

    pub async fn put_data(&self, key: &str, data: Bytes) -> Result<RemoteObject> {
        let size = data.len() as u64;
        debug!(key = %key, size, "putting object");
        self.inner
            .put(&ObjectPath::from(key), PutPayload::from(data))
            .await?;
        Ok(RemoteObject {
            key: key.to_string(),
            size,
        })
    }

    pub async fn get_data(&self, key: &str) -> Result<Bytes> {
        let location = ObjectPath::from(key);
        match self.inner.get(&location).await {
            Ok(result) => Ok(result.bytes().await?),
            Err(object_store::Error::NotFound { .. }) => {
                Err(ObjectStoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn delete_data(&self, key: &str) -> Result<()> {
        match self.inner.delete(&ObjectPath::from(key)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn rename_data(&self, from: &str, to: &str) -> Result<()> {
        match self
            .inner
            .rename(&ObjectPath::from(from), &ObjectPath::from(to))
            .await
        {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => {
                Err(ObjectStoreError::NotFound(from.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Every object whose key starts with `prefix`.
    pub async fn list_data(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
        let prefix = prefix.trim_end_matches('/');
        let location = (!prefix.is_empty()).then(|| ObjectPath::from(prefix));
        let objects: Vec<_> = self.inner.list(location.as_ref()).try_collect().await?;
        Ok(objects
            .into_iter()
            .map(|meta| RemoteObject {
                key: meta.location.to_string(),
                size: meta.size as u64,
            })
            .collect())
    }

    /// One cheap listing call; fails when the bucket or service is unreachable.
    pub async fn check_reachable(&self) -> Result<()> {
        self.inner
            .list_with_delimiter(None)
            .await
            .map(|_| ())
            .map_err(|e| ObjectStoreError::Unreachable(e.to_string()))
    }
}
