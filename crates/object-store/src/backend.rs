use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{ObjectStoreError, Result};
use crate::rclone::RcloneBackend;
use crate::storage::{ObjectStoreConfig, Storage};
use crate::target::{Credentials, RemoteTarget};

/// An object as seen by a backend listing or returned from a put.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    /// Full object key, including the target prefix
    pub key: String,
    pub size: u64,
}

/// Pluggable remote storage driven by the transfer scheduler.
///
/// Implementations must be idempotent for `delete` (deleting a missing
/// object succeeds) and must report a missing object on `get` through
/// [`ObjectStoreError::is_not_found`].
#[async_trait]
pub trait TransferBackend: std::fmt::Debug + Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Cheap reachability check, used when a rule is imported.
    async fn check_reachable(&self) -> Result<()>;

    async fn put(&self, key: &str, data: Bytes) -> Result<RemoteObject>;

    async fn get(&self, key: &str) -> Result<Bytes>;

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Whether [`TransferBackend::rename`] moves objects without a round trip
    /// through the agent.
    fn supports_move(&self) -> bool {
        false
    }

    async fn rename(&self, _from: &str, _to: &str) -> Result<()> {
        Err(ObjectStoreError::Unsupported {
            backend: self.name(),
            operation: "rename",
        })
    }
}

#[async_trait]
impl TransferBackend for Storage {
    fn name(&self) -> &'static str {
        match self.config() {
            ObjectStoreConfig::S3 { .. } => "s3",
            ObjectStoreConfig::Local { .. } => "local",
            ObjectStoreConfig::Memory => "memory",
        }
    }

    async fn check_reachable(&self) -> Result<()> {
        Storage::check_reachable(self).await
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<RemoteObject> {
        self.put_data(key, data).await
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        self.get_data(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
        self.list_data(prefix).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.delete_data(key).await
    }

    fn supports_move(&self) -> bool {
        true
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.rename_data(from, to).await
    }
}

/// Build the backend a [`RemoteTarget`] points at.
pub fn connect(
    target: &RemoteTarget,
    credentials: Option<&Credentials>,
) -> Result<Arc<dyn TransferBackend>> {
    connect_with(target, credentials, None)
}

/// Like [`connect`], with `rclone://` targets reading remotes from
/// `rclone_config` instead of rclone's default config file.
pub fn connect_with(
    target: &RemoteTarget,
    credentials: Option<&Credentials>,
    rclone_config: Option<&Path>,
) -> Result<Arc<dyn TransferBackend>> {
    let scheme = target.scheme().ok_or_else(|| {
        ObjectStoreError::InvalidConfig(format!("endpoint has no scheme: {}", target.endpoint))
    })?;

    let rest = &target.endpoint[scheme.len() + "://".len()..];
    let backend: Arc<dyn TransferBackend> = match scheme.as_str() {
        "http" | "https" => Arc::new(Storage::new(ObjectStoreConfig::S3 {
            endpoint: target.endpoint.clone(),
            access_key: credentials.map(|c| c.access_key.clone()),
            secret_key: credentials.map(|c| c.secret_key.clone()),
            bucket: target.bucket.clone(),
            region: credentials.and_then(|c| c.region.clone()),
        })?),
        "file" => Arc::new(Storage::new(ObjectStoreConfig::Local {
            path: Path::new(rest).join(&target.bucket),
        })?),
        "memory" => Arc::new(Storage::new(ObjectStoreConfig::Memory)?),
        "rclone" => Arc::new(rclone(rest, &target.bucket, rclone_config)),
        other => {
            return Err(ObjectStoreError::InvalidConfig(format!(
                "unsupported endpoint scheme: {other}"
            )))
        }
    };
    Ok(backend)
}

fn rclone(remote: &str, bucket: &str, config: Option<&Path>) -> RcloneBackend {
    let backend = RcloneBackend::new(remote, bucket);
    match config {
        Some(path) => backend.with_config(path),
        None => backend,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(endpoint: &str) -> RemoteTarget {
        RemoteTarget {
            endpoint: endpoint.to_string(),
            bucket: "bucket".to_string(),
            prefix: "loft".to_string(),
            credentials_ref: None,
        }
    }

    #[test]
    fn test_connect_selects_backend_by_scheme() {
        let dir = tempfile::tempdir().unwrap();
        let file = format!("file://{}", dir.path().display());

        assert_eq!(connect(&target("memory://"), None).unwrap().name(), "memory");
        assert_eq!(connect(&target(&file), None).unwrap().name(), "local");
        assert_eq!(
            connect(&target("rclone://remote"), None).unwrap().name(),
            "rclone"
        );
        assert!(dir.path().join("bucket").is_dir());
    }

    #[test]
    fn test_rclone_targets_use_the_given_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("rclone.conf");

        let backend = connect_with(&target("rclone://minio"), None, Some(&config)).unwrap();
        assert_eq!(backend.name(), "rclone");

        let cmd = rclone("minio", "bucket", Some(&config)).command("lsjson");
        let args: Vec<_> = cmd.as_std().get_args().collect();
        assert_eq!(args[0], "--config");
        assert_eq!(args[1], config.as_os_str());

        let cmd = rclone("minio", "bucket", None).command("lsjson");
        assert_eq!(cmd.as_std().get_args().count(), 1);
    }

    #[test]
    fn test_connect_rejects_unknown_scheme() {
        assert!(matches!(
            connect(&target("ftp://host"), None),
            Err(ObjectStoreError::InvalidConfig(_))
        ));
        assert!(matches!(
            connect(&target("localhost:9000"), None),
            Err(ObjectStoreError::InvalidConfig(_))
        ));
    }
}
