use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::info;

use crate::backend::{RemoteObject, TransferBackend};
use crate::error::{ObjectStoreError, Result};

/// Backend that pretends every mutation succeeded.
///
/// Puts and deletes are logged and dropped. Reads are forwarded
/// to the wrapped backend when there is one, so content already offloaded
/// by an earlier run stays readable.
#[derive(Debug, Clone, Default)]
pub struct DryRunBackend {
    reads: Option<Arc<dyn TransferBackend>>,
}

impl DryRunBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reads_from(backend: Arc<dyn TransferBackend>) -> Self {
        Self {
            reads: Some(backend),
        }
    }
}

#[async_trait]
impl TransferBackend for DryRunBackend {
    fn name(&self) -> &'static str {
        "dry-run"
    }

    async fn check_reachable(&self) -> Result<()> {
        Ok(())
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<RemoteObject> {
        info!(key = %key, size = data.len(), "dry-run: skipping upload");
        Ok(RemoteObject {
            key: key.to_string(),
            size: data.len() as u64,
        })
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        match &self.reads {
            Some(backend) => backend.get(key).await,
            None => Err(ObjectStoreError::NotFound(key.to_string())),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
        match &self.reads {
            Some(backend) => backend.list(prefix).await,
            None => Ok(Vec::new()),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        info!(key = %key, "dry-run: skipping delete");
        Ok(())
    }

    // No native move: a skipped rename would strand the object under its old
    // key, so callers fall back to fetch + put, and only the put is skipped.
    fn supports_move(&self) -> bool {
        false
    }
}
