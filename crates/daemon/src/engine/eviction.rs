//! Eviction: replace confirmed-uploaded content with a zero-length stub.
//!
//! Metadata is committed before the bytes are dropped. A crash in between
//! leaves a stub record over a full file, which resume treats as a local
//! write.

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::EvictionPolicy;
use crate::database::models::{Node, NodeKey};
use crate::engine::paths::{IoGuard, PathSlot, SlotHandle};
use crate::engine::{Engine, RuleRuntime};
use crate::error::EngineError;

/// Commit the result of a confirmed upload of `size` bytes taken at `generation`.
///
/// Called with the transfer lock held. If the path was written since the
/// upload read it, nothing is committed: the newer write is already queued.
pub(crate) async fn after_upload(
    engine: &Engine,
    runtime: &Arc<RuleRuntime>,
    slot: &PathSlot,
    key: &NodeKey,
    generation: u64,
    size: u64,
) -> Result<(), EngineError> {
    let io = slot.lock_io().await;
    if slot.generation() != generation {
        debug!(node = %key, "written during upload; keeping local copy");
        return Ok(());
    }

    if engine.mode().evicts() {
        evict_locked(engine, runtime, key, size, &io).await
    } else {
        engine.commit(&Node::resident(key, size), &io).await
    }
}

/// Evict a hydrated file that has not been written since.
pub(crate) async fn evict_clean(
    engine: &Engine,
    slot: &SlotHandle,
    generation: u64,
) -> Result<(), EngineError> {
    if !engine.mode().evicts() {
        return Ok(());
    }
    let key = slot.key();
    let runtime = engine.runtime_for(key)?.clone();
    let _transfer = slot.lock_transfer().await;
    let io = slot.lock_io().await;

    if slot.generation() != generation {
        debug!(node = %key, "written since hydration; upload will follow");
        return Ok(());
    }
    let Some(node) = engine.node_locked(key, &io).await? else {
        return Ok(());
    };
    if node.is_stub() {
        return Ok(());
    }

    let age = tokio::fs::metadata(runtime.cache_path(&key.path))
        .await?
        .modified()
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .unwrap_or_default();
    if !runtime.policy.admits(node.size, age) {
        debug!(node = %key, policy = %runtime.policy, "kept local by policy");
        if may_admit_later(&runtime.policy) {
            engine.tracker().clean(key.clone());
        }
        return Ok(());
    }

    evict_locked(engine, &runtime, key, node.size, &io).await
}

async fn evict_locked(
    engine: &Engine,
    runtime: &RuleRuntime,
    key: &NodeKey,
    size: u64,
    io: &IoGuard<'_>,
) -> Result<(), EngineError> {
    engine.commit(&Node::evicted(key, size), io).await?;

    // Truncate in place: open handles keep pointing at the same inode.
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(runtime.cache_path(&key.path))
        .await?;
    file.set_len(0).await?;

    info!(node = %key, size, "evicted");
    Ok(())
}

/// Whether a file the policy declines today could be admitted later
/// without being written again.
pub(crate) fn may_admit_later(policy: &EvictionPolicy) -> bool {
    matches!(policy, EvictionPolicy::OlderThan(_))
}
