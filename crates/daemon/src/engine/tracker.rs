//! Change tracker and debouncer.
//!
//! The mount adapter produces [`ChangeEvent`]s; a single actor task owns
//! all debounce state and consumes them in order. A periodic sweep hands
//! every path that has been quiet for the configured period to the
//! transfer pool.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::database::models::NodeKey;
use crate::engine::{Engine, Mode};

/// Events the tracker consumes.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    /// A file was created or written
    Touched(NodeKey),
    /// A file was hydrated and is identical to its remote copy
    Clean(NodeKey),
    /// A transfer gave up or was declined; try again after a quiet period
    Requeue(NodeKey),
    /// The file is gone (deleted or renamed away)
    Forget(NodeKey),
}

/// Sending half, handed to the mount adapter and the workers.
#[derive(Debug, Clone)]
pub struct TrackerHandle {
    tx: flume::Sender<ChangeEvent>,
}

impl TrackerHandle {
    pub fn new() -> (Self, flume::Receiver<ChangeEvent>) {
        let (tx, rx) = flume::unbounded();
        (Self { tx }, rx)
    }

    pub fn send(&self, event: ChangeEvent) {
        if self.tx.send(event).is_err() {
            debug!("change tracker stopped; dropping event");
        }
    }

    pub fn touched(&self, key: NodeKey) {
        self.send(ChangeEvent::Touched(key));
    }

    pub fn clean(&self, key: NodeKey) {
        self.send(ChangeEvent::Clean(key));
    }

    pub fn requeue(&self, key: NodeKey) {
        self.send(ChangeEvent::Requeue(key));
    }

    pub fn forget(&self, key: NodeKey) {
        self.send(ChangeEvent::Forget(key));
    }
}

/// What a path that went quiet needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Written since its last upload
    Upload,
    /// Hydrated and untouched; the remote copy is current
    Evict,
}

#[derive(Debug, Clone, Copy)]
struct Tracked {
    last_modified: Instant,
    dirty: bool,
}

/// Quiet-period bookkeeping, free of any I/O.
#[derive(Debug)]
pub struct Debouncer {
    quiet_period: Duration,
    entries: HashMap<NodeKey, Tracked>,
}

impl Debouncer {
    pub fn new(quiet_period: Duration) -> Self {
        Self {
            quiet_period,
            entries: HashMap::new(),
        }
    }

    /// The path was written at `now`: restart its timer and mark it dirty.
    pub fn touch(&mut self, key: NodeKey, now: Instant) {
        self.entries.insert(
            key,
            Tracked {
                last_modified: now,
                dirty: true,
            },
        );
    }

    /// The path was hydrated at `now`. A pending write keeps precedence.
    pub fn clean(&mut self, key: NodeKey, now: Instant) {
        self.entries.entry(key).or_insert(Tracked {
            last_modified: now,
            dirty: false,
        });
    }

    pub fn forget(&mut self, key: &NodeKey) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_tracked(&self, key: &NodeKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Remove and return every path quiet for at least the quiet period.
    pub fn drain_stable(&mut self, now: Instant) -> Vec<(NodeKey, Readiness)> {
        let quiet_period = self.quiet_period;
        let mut stable: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, tracked)| now.saturating_duration_since(tracked.last_modified) >= quiet_period)
            .map(|(key, tracked)| {
                let readiness = if tracked.dirty {
                    Readiness::Upload
                } else {
                    Readiness::Evict
                };
                (key.clone(), readiness)
            })
            .collect();
        stable.sort_by(|a, b| a.0.cmp(&b.0));

        for (key, _) in &stable {
            self.entries.remove(key);
        }
        stable
    }
}

/// Actor loop: apply events, sweep on every tick, stop on shutdown.
pub(crate) async fn run(
    engine: Engine,
    events: flume::Receiver<ChangeEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let config = engine.config().clone();
    let mut debouncer = Debouncer::new(config.quiet_period);
    // Direct mode: last generation sent per path, so a burst of events for
    // the same write queues one upload.
    // Entries go once their job is done and the path's slot is gone.
    let mut dispatched: HashMap<NodeKey, u64> = HashMap::new();

    let mut ticker = tokio::time::interval(config.sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            event = events.recv_async() => match event {
                Ok(event) => apply(&engine, &mut debouncer, &mut dispatched, event),
                Err(_) => break,
            },
            _ = ticker.tick() => {
                sweep(&engine, &mut debouncer);
                dispatched.retain(|key, generation| {
                    engine.paths().current_generation(key) == Some(*generation)
                });
            }
        }
    }

    debug!(pending = debouncer.len(), "change tracker stopped");
}

fn apply(
    engine: &Engine,
    debouncer: &mut Debouncer,
    dispatched: &mut HashMap<NodeKey, u64>,
    event: ChangeEvent,
) {
    let now = Instant::now();
    match event {
        ChangeEvent::Touched(key) => {
            let Some(runtime) = engine.runtime(&key.rule_id) else {
                debug!(node = %key, "event for an unknown rule");
                return;
            };
            if runtime.is_excluded(&key.path) {
                trace!(node = %key, "excluded from offload");
                return;
            }

            if engine.mode() == Mode::Direct {
                let slot = engine.paths().slot(&key);
                let generation = slot.generation();
                if dispatched.get(&key) == Some(&generation) {
                    return;
                }
                dispatched.insert(key, generation);
                if let Err(e) = engine.jobs().upload(slot, generation) {
                    debug!(error = %e, "dropping direct upload");
                }
            } else {
                trace!(node = %key, "touched");
                debouncer.touch(key, now);
            }
        }
        ChangeEvent::Clean(key) => {
            if engine.mode().evicts() {
                debouncer.clean(key, now);
            }
        }
        ChangeEvent::Requeue(key) => debouncer.touch(key, now),
        ChangeEvent::Forget(key) => {
            debouncer.forget(&key);
            dispatched.remove(&key);
        }
    }
}

fn sweep(engine: &Engine, debouncer: &mut Debouncer) {
    if debouncer.is_empty() {
        return;
    }

    for (key, readiness) in debouncer.drain_stable(Instant::now()) {
        let slot = engine.paths().slot(&key);
        let generation = slot.generation();
        debug!(node = %key, ?readiness, generation, "path is stable");
        let queued = match readiness {
            Readiness::Upload => engine.jobs().upload(slot, generation),
            Readiness::Evict => engine.jobs().evict(slot, generation),
        };
        if let Err(e) = queued {
            debug!(error = %e, "transfer queue closed");
            return;
        }
    }
}
