//! Hydration: bring a stub's content back from the remote.
//!
//! Readers of the same stub share one download: the first caller queues a
//! download job and every later caller awaits the same shared future until
//! the worker answers.

use std::collections::HashMap;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::database::models::{Node, NodeKey};
use crate::engine::jobs::JobDispatcher;
use crate::engine::worker::{with_retries, Outcome};
use crate::engine::Engine;
use crate::error::EngineError;

type Download = Shared<BoxFuture<'static, Result<u64, String>>>;

#[derive(Default)]
pub(crate) struct Hydrator {
    inflight: parking_lot::Mutex<HashMap<NodeKey, Download>>,
}

impl Hydrator {
    pub async fn hydrate(&self, jobs: &JobDispatcher, key: &NodeKey) -> Result<u64, String> {
        let download = {
            let mut inflight = self.inflight.lock();
            inflight
                .entry(key.clone())
                .or_insert_with(|| {
                    debug!(node = %key, "starting hydration");
                    let jobs = jobs.clone();
                    let key = key.clone();
                    async move { jobs.download(key).await }.boxed().shared()
                })
                .clone()
        };

        let result = download.clone().await;

        let mut inflight = self.inflight.lock();
        if inflight
            .get(key)
            .is_some_and(|current| current.ptr_eq(&download))
        {
            inflight.remove(key);
        }
        result
    }

    #[cfg(test)]
    pub fn in_flight(&self) -> usize {
        self.inflight.lock().len()
    }
}

/// Worker side of a download job. Returns the hydrated size.
pub(crate) async fn download(engine: &Engine, key: &NodeKey) -> Result<u64, EngineError> {
    let runtime = engine.runtime_for(key)?.clone();
    let slot = engine.paths().slot(key);
    let _transfer = slot.lock_transfer().await;
    let path = runtime.cache_path(&key.path);

    {
        let io = slot.lock_io().await;
        let node = engine
            .node_locked(key, &io)
            .await?
            .ok_or_else(|| EngineError::NotFound(key.path.clone()))?;
        if !node.is_stub() {
            debug!(node = %key, "already local");
            return Ok(tokio::fs::metadata(&path).await?.len());
        }
    }

    let object_key = runtime.object_key(&key.path);
    let outcome = with_retries(engine, &slot, None, || {
        let backend = runtime.backend.clone();
        let object_key = object_key.clone();
        async move { backend.get(&object_key).await }
    })
    .await;
    let bytes = match outcome {
        Outcome::Done(bytes) => bytes,
        Outcome::Failed { attempts, source } => {
            return Err(EngineError::hydration(
                &key.path,
                format!("{source} (after {attempts} attempts)"),
            ))
        }
        Outcome::Superseded | Outcome::Shutdown => return Err(EngineError::ShuttingDown),
    };

    let io = slot.lock_io().await;
    // Truncating a stub to zero converts it without the transfer lock.
    match engine.node_locked(key, &io).await? {
        None => return Err(EngineError::NotFound(key.path.clone())),
        Some(node) if !node.is_stub() => return Ok(tokio::fs::metadata(&path).await?.len()),
        Some(_) => {}
    }

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .await?;
    file.write_all(&bytes).await?;
    file.set_len(bytes.len() as u64).await?;
    file.sync_data().await?;

    let size = bytes.len() as u64;
    engine.commit(&Node::resident(key, size), &io).await?;
    drop(io);

    if engine.mode().evicts() {
        engine.tracker().clean(key.clone());
    }
    info!(node = %key, size, "hydrated");
    Ok(size)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use uuid::Uuid;

    use super::*;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_download() {
        let (jobs, receiver) = JobDispatcher::new();
        let hydrator = Arc::new(Hydrator::default());
        let key = NodeKey::new(Uuid::nil(), "a.txt");

        let readers: Vec<_> = (0..3)
            .map(|_| {
                let hydrator = hydrator.clone();
                let jobs = jobs.clone();
                let key = key.clone();
                tokio::spawn(async move { hydrator.hydrate(&jobs, &key).await })
            })
            .collect();

        let job = receiver.next().await.unwrap();
        // Give the other readers time to join before answering.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(receiver.try_next().is_none());
        assert_eq!(hydrator.in_flight(), 1);

        match job {
            crate::engine::jobs::TransferJob::Download { reply, .. } => {
                reply.send(Ok(11)).unwrap();
            }
            other => panic!("unexpected job {}", other.kind()),
        }
        for reader in readers {
            assert_eq!(reader.await.unwrap(), Ok(11));
        }
        assert_eq!(hydrator.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failure_is_shared_and_not_cached() {
        let (jobs, receiver) = JobDispatcher::new();
        let hydrator = Hydrator::default();
        let key = NodeKey::new(Uuid::nil(), "a.txt");

        let answer = async {
            match receiver.next().await.unwrap() {
                crate::engine::jobs::TransferJob::Download { reply, .. } => {
                    reply.send(Err("offline".to_string())).unwrap();
                }
                other => panic!("unexpected job {}", other.kind()),
            }
        };
        let (result, ()) = tokio::join!(hydrator.hydrate(&jobs, &key), answer);
        assert_eq!(result, Err("offline".to_string()));
        assert_eq!(hydrator.in_flight(), 0);
    }
}
