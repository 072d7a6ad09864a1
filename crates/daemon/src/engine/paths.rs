//! Per-path coordination state.
//!
//! Each tracked path gets a [`PathSlot`] holding:
//!
//! - a **generation**, bumped by every mutation made through the mount;
//!   transfers snapshot it and treat any change as cancellation
//! - an **I/O lock** serializing byte access and metadata commits
//! - a **transfer lock** serializing uploads, evictions, hydrations and
//!   remote deletes of the path
//!
//! Locks are always taken transfer first, then I/O. The table's own map
//! lock is only held to look a slot up or drop one, never across path
//! operations. Queued jobs hold a [`SlotHandle`], so a path's generation
//! stays put until its job has run.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex, MutexGuard};

use crate::database::models::NodeKey;

type Slots = Arc<parking_lot::Mutex<HashMap<NodeKey, Arc<PathSlot>>>>;

/// Live slots, one per path that someone currently holds.
///
/// A slot disappears when its last [`SlotHandle`] is dropped, so the table
/// only ever holds paths with an operation or a queued job in flight.
#[derive(Debug, Default)]
pub(crate) struct PathTable {
    slots: Slots,
    // Shared so that a dropped and recreated slot never reuses a generation.
    clock: Arc<AtomicU64>,
}

impl PathTable {
    pub fn slot(&self, key: &NodeKey) -> SlotHandle {
        let slot = self
            .slots
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(PathSlot::new(self.clock.clone())))
            .clone();
        SlotHandle {
            key: key.clone(),
            slot,
            slots: self.slots.clone(),
        }
    }

    /// Generation of a live slot, without creating one.
    pub fn current_generation(&self, key: &NodeKey) -> Option<u64> {
        self.slots.lock().get(key).map(|slot| slot.generation())
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

/// Shared ownership of one path's slot; the last handle removes it from
/// the table.
pub(crate) struct SlotHandle {
    key: NodeKey,
    slot: Arc<PathSlot>,
    slots: Slots,
}

impl SlotHandle {
    pub fn key(&self) -> &NodeKey {
        &self.key
    }
}

impl Deref for SlotHandle {
    type Target = PathSlot;

    fn deref(&self) -> &PathSlot {
        &self.slot
    }
}

impl Clone for SlotHandle {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            slot: self.slot.clone(),
            slots: self.slots.clone(),
        }
    }
}

impl std::fmt::Debug for SlotHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotHandle")
            .field("key", &self.key)
            .field("generation", &self.slot.generation())
            .finish()
    }
}

impl Drop for SlotHandle {
    fn drop(&mut self) {
        let mut slots = self.slots.lock();
        // New handles are only minted under this lock, so two owners
        // means the table and this handle.
        if Arc::strong_count(&self.slot) == 2
            && slots
                .get(&self.key)
                .is_some_and(|slot| Arc::ptr_eq(slot, &self.slot))
        {
            slots.remove(&self.key);
        }
    }
}

#[derive(Debug)]
pub(crate) struct PathSlot {
    generation: watch::Sender<u64>,
    clock: Arc<AtomicU64>,
    io: Mutex<()>,
    transfer: Mutex<()>,
}

/// Proof that the path's I/O lock is held.
pub(crate) struct IoGuard<'a>(#[allow(dead_code)] MutexGuard<'a, ()>);

/// Proof that the path's transfer lock is held.
pub(crate) struct TransferGuard<'a>(#[allow(dead_code)] MutexGuard<'a, ()>);

impl PathSlot {
    fn new(clock: Arc<AtomicU64>) -> Self {
        let start = clock.fetch_add(1, Ordering::SeqCst) + 1;
        let (generation, _) = watch::channel(start);
        Self {
            generation,
            clock,
            io: Mutex::new(()),
            transfer: Mutex::new(()),
        }
    }

    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    /// Record a mutation; in-flight transfers holding an older snapshot give up.
    pub fn bump(&self) -> u64 {
        let next = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        self.generation.send_replace(next);
        next
    }

    /// Resolves once the generation differs from `seen`.
    pub async fn superseded(&self, seen: u64) {
        let mut rx = self.generation.subscribe();
        let _ = rx.wait_for(|current| *current != seen).await;
    }

    pub async fn lock_io(&self) -> IoGuard<'_> {
        IoGuard(self.io.lock().await)
    }

    pub async fn lock_transfer(&self) -> TransferGuard<'_> {
        TransferGuard(self.transfer.lock().await)
    }
}
