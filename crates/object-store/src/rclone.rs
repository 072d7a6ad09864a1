//! Backend driving an external `rclone` binary.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::backend::{RemoteObject, TransferBackend};
use crate::error::{ObjectStoreError, Result};

/// rclone remotes by name, each a set of `key = value` options.
pub type RcloneSections = BTreeMap<String, BTreeMap<String, String>>;

/// Render `sections` in rclone's INI config format.
pub fn render_config(sections: &RcloneSections) -> String {
    let mut out = String::new();
    for (name, options) in sections {
        if !out.is_empty() {
            out.push('\n');
        }
        let _ = writeln!(out, "[{name}]");
        for (key, value) in options {
            let _ = writeln!(out, "{key} = {value}");
        }
    }
    out
}

/// One entry of `rclone lsjson` output.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LsEntry {
    path: String,
    size: i64,
    is_dir: bool,
}

/// Transfers through `rclone <verb> <remote>:<bucket>/<key>`.
#[derive(Debug, Clone)]
pub struct RcloneBackend {
    binary: PathBuf,
    config: Option<PathBuf>,
    remote: String,
    bucket: String,
}

impl RcloneBackend {
    pub fn new(remote: &str, bucket: &str) -> Self {
        Self {
            binary: PathBuf::from("rclone"),
            config: None,
            remote: remote.trim_end_matches(':').to_string(),
            bucket: bucket.trim_matches('/').to_string(),
        }
    }

    /// Use a specific rclone executable.
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Point rclone at a config file instead of its default one.
    pub fn with_config(mut self, config: impl Into<PathBuf>) -> Self {
        self.config = Some(config.into());
        self
    }

    fn location(&self, key: &str) -> String {
        format!("{}:{}/{}", self.remote, self.bucket, key.trim_start_matches('/'))
    }

    pub(crate) fn command(&self, verb: &str) -> Command {
        let mut cmd = Command::new(&self.binary);
        if let Some(config) = &self.config {
            cmd.arg("--config").arg(config);
        }
        cmd.arg(verb);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(&self, verb: &str, mut cmd: Command) -> Result<Vec<u8>> {
        debug!(verb, remote = %self.remote, "running rclone");
        let output = cmd.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ObjectStoreError::InvalidConfig(format!(
                    "rclone binary not found: {}",
                    self.binary.display()
                ))
            } else {
                e.into()
            }
        })?;
        if output.status.success() {
            return Ok(output.stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains("not found") || stderr.contains("doesn't exist") {
            return Err(ObjectStoreError::NotFound(stderr));
        }
        Err(ObjectStoreError::Command {
            command: verb.to_string(),
            stderr,
        })
    }
}

#[async_trait]
impl TransferBackend for RcloneBackend {
    fn name(&self) -> &'static str {
        "rclone"
    }

    async fn check_reachable(&self) -> Result<()> {
        let mut cmd = self.command("lsjson");
        cmd.arg("--max-depth").arg("1").arg(self.location(""));
        self.run("lsjson", cmd)
            .await
            .map(|_| ())
            .map_err(|e| ObjectStoreError::Unreachable(e.to_string()))
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<RemoteObject> {
        let mut cmd = self.command("rcat");
        cmd.arg(self.location(key)).stdin(Stdio::piped());
        let mut child = cmd.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&data).await?;
            stdin.shutdown().await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(ObjectStoreError::Command {
                command: "rcat".to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(RemoteObject {
            key: key.to_string(),
            size: data.len() as u64,
        })
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let mut cmd = self.command("cat");
        cmd.arg(self.location(key));
        self.run("cat", cmd).await.map(Bytes::from)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
        let prefix = prefix.trim_end_matches('/');
        let mut cmd = self.command("lsjson");
        cmd.arg("--recursive").arg("--files-only").arg(self.location(prefix));
        let stdout = match self.run("lsjson", cmd).await {
            Ok(stdout) => stdout,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let entries: Vec<LsEntry> = serde_json::from_slice(&stdout)?;
        Ok(entries
            .into_iter()
            .filter(|entry| !entry.is_dir)
            .map(|entry| RemoteObject {
                key: format!("{prefix}/{}", entry.path),
                size: entry.size.max(0) as u64,
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut cmd = self.command("deletefile");
        cmd.arg(self.location(key));
        match self.run("deletefile", cmd).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn supports_move(&self) -> bool {
        true
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut cmd = self.command("moveto");
        cmd.arg(self.location(from)).arg(self.location(to));
        self.run("moveto", cmd).await.map(|_| ())
    }
}
