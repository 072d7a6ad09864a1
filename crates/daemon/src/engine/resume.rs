//! Startup reconciliation of the cache directories with the store.

use std::path::Path;

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::database::models::Node;
use crate::engine::rebuild::scan_cache;
use crate::engine::{Engine, RuleRuntime};
use crate::error::EngineError;

/// What a resume pass scheduled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResumeStats {
    /// Local nodes handed back to the tracker
    pub requeued: usize,
    /// Nodes whose file is gone; remote delete re-scheduled
    pub deleted: usize,
    /// Cache files that had no node
    pub adopted: usize,
}

/// Pick up where the last run stopped.
///
/// - every local node goes back to the tracker (uploads are idempotent)
/// - a node whose cache file is gone gets its remote delete scheduled again
/// - a cache file without a node gets one with its true size
/// - a stub whose file has content again is treated as a local write
pub async fn resume(engine: &Engine) -> Result<ResumeStats, EngineError> {
    let mut stats = ResumeStats::default();

    for runtime in engine.runtimes() {
        let rule_id = runtime.id();
        if !runtime.cache_dir.is_dir() {
            warn!(rule = %rule_id, dir = %runtime.cache_dir.display(), "cache directory missing; run a rebuild");
            continue;
        }

        let cache_dir = runtime.cache_dir.clone();
        let mut files = tokio::task::spawn_blocking(move || scan_cache(&cache_dir))
            .await
            .map_err(|e| EngineError::Io(std::io::Error::other(e)))??;

        for node in engine.db().list_nodes(&rule_id).await? {
            let key = node.key();
            match files.remove(&node.path) {
                None => {
                    let slot = engine.paths().slot(&key);
                    let generation = slot.generation();
                    if engine.mode().drops_rows_eagerly() {
                        let io = slot.lock_io().await;
                        engine.remove_node(&key, &io).await?;
                    }
                    engine
                        .jobs()
                        .delete(slot, generation, engine.mode().evicts())?;
                    stats.deleted += 1;
                }
                Some(len) if node.is_stub() && len > 0 => {
                    let slot = engine.paths().slot(&key);
                    {
                        let io = slot.lock_io().await;
                        engine.commit(&Node::resident(&key, len), &io).await?;
                    }
                    slot.bump();
                    engine.tracker().touched(key);
                    stats.requeued += 1;
                }
                Some(_) if !node.is_stub() => {
                    engine.tracker().touched(key);
                    stats.requeued += 1;
                }
                Some(_) => {}
            }
        }

        for (path, len) in files {
            let key = runtime.key(&path);
            let slot = engine.paths().slot(&key);
            {
                let io = slot.lock_io().await;
                engine.commit(&Node::resident(&key, len), &io).await?;
            }
            debug!(node = %key, size = len, "tracking untracked cache file");
            engine.tracker().touched(key);
            stats.adopted += 1;
        }
    }

    info!(
        requeued = stats.requeued,
        deleted = stats.deleted,
        adopted = stats.adopted,
        "resumed"
    );
    Ok(stats)
}

/// Move content already sitting in a rule's `local_root` into its cache
/// directory, so the mount does not hide it. Returns the number of files moved.
pub async fn adopt_existing(runtime: &RuleRuntime) -> Result<usize, EngineError> {
    let root = runtime.rule.local_root.clone();
    let cache_dir = runtime.cache_dir.clone();
    tokio::task::spawn_blocking(move || move_tree(&root, &cache_dir))
        .await
        .map_err(|e| EngineError::Io(std::io::Error::other(e)))?
}

fn move_tree(root: &Path, cache_dir: &Path) -> Result<usize, EngineError> {
    if !root.is_dir() {
        std::fs::create_dir_all(root)?;
        return Ok(0);
    }

    let mut moved = 0;
    // Children before parents, so emptied directories can be removed.
    for entry in WalkDir::new(root).min_depth(1).contents_first(true) {
        let entry = entry.map_err(|e| EngineError::Io(e.into()))?;
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let target = cache_dir.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
            std::fs::remove_dir(entry.path())?;
            continue;
        }
        if !entry.file_type().is_file() {
            debug!(path = %entry.path().display(), "skipping non-regular file");
            continue;
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if std::fs::rename(entry.path(), &target).is_err() {
            // Cache on another filesystem.
            std::fs::copy(entry.path(), &target)?;
            std::fs::remove_file(entry.path())?;
        }
        moved += 1;
    }

    if moved > 0 {
        info!(root = %root.display(), files = moved, "adopted existing content");
    }
    Ok(moved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_move_tree_empties_root() {
        let root = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("docs/old")).unwrap();
        std::fs::write(root.path().join("docs/old/a.txt"), b"abc").unwrap();
        std::fs::write(root.path().join("b.txt"), b"hello").unwrap();

        let moved = move_tree(root.path(), cache.path()).unwrap();
        assert_eq!(moved, 2);
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
        assert_eq!(
            std::fs::read(cache.path().join("docs/old/a.txt")).unwrap(),
            b"abc"
        );
        assert_eq!(std::fs::read(cache.path().join("b.txt")).unwrap(), b"hello");
    }

    #[test]
    fn test_move_tree_creates_missing_root() {
        let parent = tempfile::tempdir().unwrap();
        let root = parent.path().join("mnt");
        assert_eq!(move_tree(&root, parent.path()).unwrap(), 0);
        assert!(root.is_dir());
    }
}
