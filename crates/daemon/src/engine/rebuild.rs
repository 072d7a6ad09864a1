//! Metadata rebuild from the remote listing and the local cache.
//!
//! Never moves file content between local and remote. It only decides,
//! per path, which side is authoritative and rewrites the rule's node rows
//! (and stub files) to match.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::str::FromStr;

use serde::Serialize;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::database::models::Node;
use crate::database::Database;
use crate::engine::RuleRuntime;
use crate::error::EngineError;
use crate::registry::relative_path;

/// Which side wins when a path exists both locally and remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bias {
    TrustRemote,
    TrustLocal,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid bias {0:?}: expected 0/remote/trust-remote or 1/local/trust-local")]
pub struct ParseBiasError(String);

impl FromStr for Bias {
    type Err = ParseBiasError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "0" | "remote" | "trust-remote" => Ok(Bias::TrustRemote),
            "1" | "local" | "trust-local" => Ok(Bias::TrustLocal),
            _ => Err(ParseBiasError(s.to_string())),
        }
    }
}

impl std::fmt::Display for Bias {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Bias::TrustRemote => write!(f, "trust-remote"),
            Bias::TrustLocal => write!(f, "trust-local"),
        }
    }
}

/// What a rebuild found and wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RebuildStats {
    /// Objects listed under the rule's prefix
    pub remote: usize,
    /// Files found in the cache directory
    pub local: usize,
    /// Rows written as stubs
    pub evicted: usize,
    /// Rows written as local
    pub resident: usize,
    /// Previous rows with neither a file nor an object
    pub removed: usize,
}

impl std::fmt::Display for RebuildStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} remote, {} local: {} evicted, {} resident, {} removed",
            self.remote, self.local, self.evicted, self.resident, self.removed
        )
    }
}

/// Rebuild the node rows of one rule.
///
/// Restores the rule row first if the store lost it. All rows of the rule
/// are replaced in a single transaction.
pub async fn rebuild(
    db: &Database,
    runtime: &RuleRuntime,
    bias: Bias,
) -> Result<RebuildStats, EngineError> {
    let rule = &runtime.rule;
    if db.get_rule(&rule.id).await?.is_none() {
        info!(rule = %rule.id, "restoring missing rule row");
        db.insert_rule(rule).await?;
    }

    let prefix = rule.object_prefix();
    let remote: BTreeMap<String, u64> = runtime
        .backend
        .list(&prefix)
        .await
        .map_err(|source| EngineError::BackendUnreachable {
            target: format!(
                "{}/{}",
                rule.remote_target.endpoint, rule.remote_target.bucket
            ),
            source,
        })?
        .into_iter()
        .filter_map(|object| {
            let relative = object
                .key
                .strip_prefix(&prefix)?
                .trim_start_matches('/')
                .to_string();
            (!relative.is_empty()).then_some((relative, object.size))
        })
        .collect();

    tokio::fs::create_dir_all(&runtime.cache_dir).await?;
    let cache_dir = runtime.cache_dir.clone();
    let local = tokio::task::spawn_blocking(move || scan_cache(&cache_dir))
        .await
        .map_err(|e| EngineError::Io(std::io::Error::other(e)))??;

    let previous: BTreeSet<String> = db
        .list_nodes(&rule.id)
        .await?
        .into_iter()
        .map(|node| node.path)
        .collect();

    let mut stats = RebuildStats {
        remote: remote.len(),
        local: local.len(),
        ..RebuildStats::default()
    };

    let paths: BTreeSet<&String> = remote.keys().chain(local.keys()).collect();
    let mut nodes = Vec::with_capacity(paths.len());
    for path in paths {
        let key = runtime.key(path);
        let node = match (local.get(path), remote.get(path)) {
            (Some(&local_size), Some(&remote_size)) => {
                // A zero-length file next to a remote object is a stub,
                // including for an empty object.
                if local_size == 0 || bias == Bias::TrustRemote {
                    if local_size > 0 {
                        debug!(path = %path, "discarding local copy in favour of remote");
                        truncate(&runtime.cache_path(path)).await?;
                    }
                    Node::evicted(&key, remote_size)
                } else {
                    Node::resident(&key, local_size)
                }
            }
            (Some(&local_size), None) => Node::resident(&key, local_size),
            (None, Some(&remote_size)) => {
                create_stub(&runtime.cache_path(path)).await?;
                Node::evicted(&key, remote_size)
            }
            (None, None) => continue,
        };

        if node.is_stub() {
            stats.evicted += 1;
        } else {
            stats.resident += 1;
        }
        nodes.push(node);
    }

    stats.removed = previous
        .iter()
        .filter(|path| !local.contains_key(*path) && !remote.contains_key(*path))
        .count();

    db.replace_nodes(&rule.id, &nodes).await?;
    info!(rule = %rule.id, %bias, %stats, "rebuild complete");
    Ok(stats)
}

/// Relative path and size of every regular file under `dir`.
pub(crate) fn scan_cache(dir: &Path) -> Result<HashMap<String, u64>, EngineError> {
    let mut files = HashMap::new();
    for entry in WalkDir::new(dir).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| EngineError::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(relative) = entry
            .path()
            .strip_prefix(dir)
            .ok()
            .and_then(relative_path)
        else {
            continue;
        };
        files.insert(relative, entry.metadata().map_err(|e| EngineError::Io(e.into()))?.len());
    }
    Ok(files)
}

async fn truncate(path: &Path) -> Result<(), EngineError> {
    let file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
    file.set_len(0).await?;
    Ok(())
}

async fn create_stub(path: &Path) -> Result<(), EngineError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::File::create(path).await?;
    Ok(())
}
