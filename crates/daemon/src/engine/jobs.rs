//! Transfer job queues
//!
//! Two flume channels feed the worker pool: downloads (hydrations, which a
//! reader is blocked on) and everything else. Workers always drain the
//! download queue first.

use tokio::sync::oneshot;

use crate::database::models::NodeKey;
use crate::engine::paths::SlotHandle;
use crate::error::EngineError;

/// Work for the transfer pool.
#[derive(Debug)]
pub(crate) enum TransferJob {
    /// Upload a stable file, then evict it when the mode allows
    Upload {
        slot: SlotHandle,
        /// Generation observed when the path became stable
        generation: u64,
    },
    /// Evict a file whose remote copy is known current (hydrated, unmodified)
    Evict { slot: SlotHandle, generation: u64 },
    /// Remove the remote object of a locally deleted or renamed file
    Delete {
        slot: SlotHandle,
        generation: u64,
        /// Also drop the node row once the remote acknowledges
        drop_row: bool,
    },
    /// Fetch a stub's content into the cache
    Download {
        key: NodeKey,
        reply: oneshot::Sender<Result<u64, String>>,
    },
}

impl TransferJob {
    pub fn key(&self) -> &NodeKey {
        match self {
            TransferJob::Upload { slot, .. }
            | TransferJob::Evict { slot, .. }
            | TransferJob::Delete { slot, .. } => slot.key(),
            TransferJob::Download { key, .. } => key,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TransferJob::Upload { .. } => "upload",
            TransferJob::Evict { .. } => "evict",
            TransferJob::Delete { .. } => "delete",
            TransferJob::Download { .. } => "download",
        }
    }
}

/// Cloneable handle for queueing transfer jobs.
#[derive(Debug, Clone)]
pub(crate) struct JobDispatcher {
    uploads: flume::Sender<TransferJob>,
    downloads: flume::Sender<TransferJob>,
}

impl JobDispatcher {
    /// Create a dispatcher and the receiver shared by the workers.
    pub fn new() -> (Self, JobReceiver) {
        let (uploads_tx, uploads_rx) = flume::unbounded();
        let (downloads_tx, downloads_rx) = flume::unbounded();
        (
            Self {
                uploads: uploads_tx,
                downloads: downloads_tx,
            },
            JobReceiver {
                uploads: uploads_rx,
                downloads: downloads_rx,
            },
        )
    }

    pub fn dispatch(&self, job: TransferJob) -> Result<(), EngineError> {
        let queue = match job {
            TransferJob::Download { .. } => &self.downloads,
            _ => &self.uploads,
        };
        queue.send(job).map_err(|_| EngineError::ShuttingDown)
    }

    pub fn upload(&self, slot: SlotHandle, generation: u64) -> Result<(), EngineError> {
        self.dispatch(TransferJob::Upload { slot, generation })
    }

    pub fn evict(&self, slot: SlotHandle, generation: u64) -> Result<(), EngineError> {
        self.dispatch(TransferJob::Evict { slot, generation })
    }

    pub fn delete(&self, slot: SlotHandle, generation: u64, drop_row: bool) -> Result<(), EngineError> {
        self.dispatch(TransferJob::Delete {
            slot,
            generation,
            drop_row,
        })
    }

    /// Queue a download and wait for the worker's answer.
    pub async fn download(&self, key: NodeKey) -> Result<u64, String> {
        let (reply, answer) = oneshot::channel();
        self.dispatch(TransferJob::Download { key, reply })
            .map_err(|e| e.to_string())?;
        answer
            .await
            .unwrap_or_else(|_| Err(EngineError::ShuttingDown.to_string()))
    }

    /// Jobs waiting in both queues.
    pub fn queued(&self) -> usize {
        self.uploads.len() + self.downloads.len()
    }
}

/// Receiving side, cloned into every worker.
#[derive(Debug, Clone)]
pub(crate) struct JobReceiver {
    uploads: flume::Receiver<TransferJob>,
    downloads: flume::Receiver<TransferJob>,
}

impl JobReceiver {
    /// Next job, downloads first. `None` once every dispatcher is gone.
    pub async fn next(&self) -> Option<TransferJob> {
        if let Ok(job) = self.downloads.try_recv() {
            return Some(job);
        }

        tokio::select! {
            biased;
            Ok(job) = self.downloads.recv_async() => Some(job),
            Ok(job) = self.uploads.recv_async() => Some(job),
            else => None,
        }
    }

    /// Try to receive a job without waiting.
    pub fn try_next(&self) -> Option<TransferJob> {
        self.downloads
            .try_recv()
            .or_else(|_| self.uploads.try_recv())
            .ok()
    }

    /// Answer every queued download with `ShuttingDown`. Returns how many
    /// readers were released.
    pub fn refuse_downloads(&self) -> usize {
        let mut refused = 0;
        for job in self.downloads.drain() {
            if let TransferJob::Download { reply, .. } = job {
                let _ = reply.send(Err(EngineError::ShuttingDown.to_string()));
                refused += 1;
            }
        }
        refused
    }
}
