//! Transfer worker pool.
//!
//! Each worker pulls jobs (downloads first), takes the path's transfer lock
//! and talks to the rule's backend. Backend calls are retried with
//! exponential backoff and raced against the path's generation and the
//! engine's shutdown signal, so a superseded upload is dropped mid-flight.

use std::future::Future;
use std::time::SystemTime;

use bytes::Bytes;
use object_store::ObjectStoreError;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::engine::jobs::{JobReceiver, TransferJob};
use crate::engine::paths::{PathSlot, SlotHandle};
use crate::engine::{eviction, hydration, Engine};
use crate::error::EngineError;

pub(crate) async fn run(
    engine: Engine,
    jobs: JobReceiver,
    mut shutdown: watch::Receiver<bool>,
    id: usize,
) {
    debug!(worker = id, "transfer worker started");
    loop {
        let job = tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => break,
            job = jobs.next() => match job {
                Some(job) => job,
                None => break,
            },
        };

        trace!(worker = id, node = %job.key(), kind = job.kind(), "picked up job");
        match job {
            TransferJob::Upload { slot, generation } => upload(&engine, slot, generation).await,
            TransferJob::Evict { slot, generation } => {
                if let Err(e) = eviction::evict_clean(&engine, &slot, generation).await {
                    warn!(node = %slot.key(), error = %e, "eviction failed");
                }
            }
            TransferJob::Delete {
                slot,
                generation,
                drop_row,
            } => delete(&engine, slot, generation, drop_row).await,
            TransferJob::Download { key, reply } => {
                let result = hydration::download(&engine, &key)
                    .await
                    .map_err(|e| e.to_string());
                if let Err(e) = &result {
                    warn!(node = %key, error = %e, "download failed");
                }
                // The reader may have given up.
                let _ = reply.send(result);
            }
        }
    }

    let refused = jobs.refuse_downloads();
    if refused > 0 {
        debug!(worker = id, refused, "refused queued downloads");
    }
    debug!(worker = id, "transfer worker stopped");
}

/// How a retried backend call ended.
#[derive(Debug)]
pub(crate) enum Outcome<T> {
    Done(T),
    /// The path changed while the call was in flight
    Superseded,
    Shutdown,
    Failed {
        attempts: u32,
        source: ObjectStoreError,
    },
}

/// Run `call` until it succeeds, fails permanently or runs out of attempts.
///
/// With `generation` set, a bump of the path's generation abandons the call
/// (dropping the request) at once.
pub(crate) async fn with_retries<T, F, Fut>(
    engine: &Engine,
    slot: &PathSlot,
    generation: Option<u64>,
    mut call: F,
) -> Outcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ObjectStoreError>>,
{
    let config = engine.config();
    let mut shutdown = engine.shutdown_signal();
    let superseded = || async move {
        match generation {
            Some(seen) => slot.superseded(seen).await,
            None => std::future::pending().await,
        }
    };

    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => return Outcome::Shutdown,
            _ = superseded() => return Outcome::Superseded,
            result = call() => result,
        };

        let source = match result {
            Ok(value) => return Outcome::Done(value),
            Err(e) if !e.is_retryable() || attempt >= config.max_attempts => {
                return Outcome::Failed {
                    attempts: attempt,
                    source: e,
                }
            }
            Err(e) => e,
        };

        let delay = config.backoff(attempt);
        debug!(attempt, ?delay, error = %source, "backend call failed; retrying");
        tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => return Outcome::Shutdown,
            _ = superseded() => return Outcome::Superseded,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// What the upload read under the I/O lock.
struct Snapshot {
    bytes: Bytes,
    modified: Option<SystemTime>,
}

async fn upload(engine: &Engine, slot: SlotHandle, generation: u64) {
    let key = slot.key().clone();
    let Some(runtime) = engine.runtime(&key.rule_id).cloned() else {
        warn!(node = %key, "upload for unknown rule");
        return;
    };
    let _transfer = slot.lock_transfer().await;

    let snapshot = {
        let io = slot.lock_io().await;
        if slot.generation() != generation {
            debug!(node = %key, "written since it went stable; skipping upload");
            return;
        }
        match engine.node_locked(&key, &io).await {
            Ok(Some(node)) if node.is_stub() => {
                debug!(node = %key, "already offloaded");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(node = %key, error = %e, "cannot read node; requeueing");
                engine.tracker().requeue(key);
                return;
            }
        }

        let path = runtime.cache_path(&key.path);
        let read = async {
            let modified = tokio::fs::metadata(&path).await?.modified().ok();
            let bytes = tokio::fs::read(&path).await?;
            Ok::<_, std::io::Error>(Snapshot {
                bytes: Bytes::from(bytes),
                modified,
            })
        };
        match read.await {
            Ok(snapshot) => snapshot,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(node = %key, "file vanished before upload");
                return;
            }
            Err(e) => {
                warn!(node = %key, error = %e, "cannot read file; requeueing");
                engine.tracker().requeue(key);
                return;
            }
        }
    };

    let size = snapshot.bytes.len() as u64;
    let age = snapshot
        .modified
        .and_then(|modified| modified.elapsed().ok())
        .unwrap_or_default();
    if !runtime.policy.admits(size, age) {
        debug!(node = %key, size, policy = %runtime.policy, "kept local by policy");
        if eviction::may_admit_later(&runtime.policy) {
            engine.tracker().requeue(key);
        }
        return;
    }

    let object_key = runtime.object_key(&key.path);
    let outcome = with_retries(engine, &slot, Some(generation), || {
        let backend = runtime.backend.clone();
        let object_key = object_key.clone();
        let bytes = snapshot.bytes.clone();
        async move { backend.put(&object_key, bytes).await }
    })
    .await;

    match outcome {
        Outcome::Done(_) => {
            info!(node = %key, size, object = %object_key, "uploaded");
            if let Err(e) = eviction::after_upload(engine, &runtime, &slot, &key, generation, size).await
            {
                warn!(node = %key, error = %e, "post-upload commit failed; requeueing");
                engine.tracker().requeue(key);
            }
        }
        Outcome::Superseded => debug!(node = %key, "upload superseded by a newer write"),
        Outcome::Shutdown => debug!(node = %key, "upload interrupted by shutdown"),
        Outcome::Failed { attempts, source } => {
            let err = EngineError::TransferFailed {
                path: key.to_string(),
                attempts,
                source,
            };
            error!(node = %key, error = %err, "upload gave up; file stays local");
            engine.tracker().requeue(key);
        }
    }
}

async fn delete(engine: &Engine, slot: SlotHandle, generation: u64, drop_row: bool) {
    let key = slot.key();
    let Some(runtime) = engine.runtime(&key.rule_id).cloned() else {
        warn!(node = %key, "delete for unknown rule");
        return;
    };

    let _transfer = slot.lock_transfer().await;
    if slot.generation() != generation {
        debug!(node = %key, "path recreated; skipping remote delete");
        return;
    }

    let object_key = runtime.object_key(&key.path);
    let outcome = with_retries(engine, &slot, Some(generation), || {
        let backend = runtime.backend.clone();
        let object_key = object_key.clone();
        async move {
            match backend.delete(&object_key).await {
                Err(e) if e.is_not_found() => Ok(()),
                other => other,
            }
        }
    })
    .await;

    match outcome {
        Outcome::Done(()) => {
            info!(node = %key, object = %object_key, "remote copy deleted");
            if drop_row {
                let io = slot.lock_io().await;
                if slot.generation() == generation {
                    if let Err(e) = engine.remove_node(key, &io).await {
                        warn!(node = %key, error = %e, "cannot drop node row");
                    }
                }
            }
        }
        Outcome::Superseded => debug!(node = %key, "delete superseded by a new file"),
        Outcome::Shutdown => debug!(node = %key, "delete interrupted by shutdown"),
        Outcome::Failed { attempts, source } => {
            // The row stays; the next start finds the cache file gone and retries.
            let err = EngineError::TransferFailed {
                path: key.to_string(),
                attempts,
                source,
            };
            error!(node = %key, error = %err, "remote delete gave up");
        }
    }
}
