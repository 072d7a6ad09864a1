//! The sync engine.
//!
//! One [`Engine`] owns everything a running agent needs: the metadata
//! store, the rule registry with a runtime (cache directory, backend,
//! policy) per rule, the per-path coordination table, the change tracker
//! actor and the transfer worker pool. It is cheap to clone and is threaded
//! explicitly through the mount adapter, the workers and the CLI, so several
//! engines can live in one process (tests do this).

pub mod cache;
pub mod eviction;
pub mod hydration;
pub(crate) mod jobs;
pub(crate) mod paths;
pub mod rebuild;
pub mod resume;
pub mod tracker;
mod worker;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use object_store::TransferBackend;
use regex::RegexSet;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{EngineSettings, EvictionPolicy};
use crate::database::models::{Node, NodeKey, Rule};
use crate::database::Database;
use crate::error::EngineError;
use crate::registry::RuleRegistry;

pub use cache::{CacheStats, NodeCache, NodeCacheConfig};
pub use rebuild::{rebuild, Bias, RebuildStats};
pub use resume::{adopt_existing, resume, ResumeStats};
pub use tracker::{ChangeEvent, TrackerHandle};

use hydration::Hydrator;
use jobs::JobDispatcher;
use paths::{IoGuard, PathTable};

/// How the engine treats stable files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Debounce, upload, evict
    #[default]
    Sync,
    /// Upload every write immediately; keep local copies
    Direct,
    /// Run the pipeline against a backend whose mutations are no-ops
    DryRun,
}

impl Mode {
    /// Whether confirmed uploads are followed by eviction.
    pub fn evicts(self) -> bool {
        matches!(self, Mode::Sync)
    }

    /// Whether a deleted file's row goes away before the remote acknowledges.
    pub fn drops_rows_eagerly(self) -> bool {
        !self.evicts()
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Sync => write!(f, "sync"),
            Mode::Direct => write!(f, "direct"),
            Mode::DryRun => write!(f, "dry-run"),
        }
    }
}

/// Engine tuning, resolved from [`EngineSettings`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub quiet_period: Duration,
    pub sweep_interval: Duration,
    pub workers: usize,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub shutdown_grace: Duration,
    pub node_cache: NodeCacheConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&EngineSettings::default())
    }
}

impl From<&EngineSettings> for EngineConfig {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            quiet_period: Duration::from_millis(settings.quiet_period_ms),
            sweep_interval: Duration::from_millis(settings.sweep_interval_ms.max(1)),
            workers: settings.workers.max(1),
            max_attempts: settings.max_attempts.max(1),
            backoff_base: Duration::from_millis(settings.backoff_base_ms),
            backoff_max: Duration::from_millis(settings.backoff_max_ms),
            shutdown_grace: Duration::from_millis(settings.shutdown_grace_ms),
            node_cache: NodeCacheConfig {
                max_entries: settings.node_cache_entries,
                ttl_secs: settings.node_cache_ttl_secs,
            },
        }
    }
}

impl EngineConfig {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_max)
    }
}

/// Everything the engine needs to serve one rule.
#[derive(Debug, Clone)]
pub struct RuleRuntime {
    pub rule: Arc<Rule>,
    /// Where the mount keeps its bytes (and zero-length stubs)
    pub cache_dir: PathBuf,
    pub backend: Arc<dyn TransferBackend>,
    pub excludes: RegexSet,
    pub policy: EvictionPolicy,
}

impl RuleRuntime {
    pub fn new(rule: Rule, cache_dir: PathBuf, backend: Arc<dyn TransferBackend>) -> Self {
        Self {
            rule: Arc::new(rule),
            cache_dir,
            backend,
            excludes: RegexSet::empty(),
            policy: EvictionPolicy::default(),
        }
    }

    pub fn with_excludes(mut self, excludes: RegexSet) -> Self {
        self.excludes = excludes;
        self
    }

    pub fn with_policy(mut self, policy: EvictionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn id(&self) -> Uuid {
        self.rule.id
    }

    pub fn key(&self, relative: &str) -> NodeKey {
        NodeKey::new(self.rule.id, relative)
    }

    /// Backing file of `relative` inside the cache directory.
    pub fn cache_path(&self, relative: &str) -> PathBuf {
        if relative.is_empty() {
            self.cache_dir.clone()
        } else {
            self.cache_dir.join(relative)
        }
    }

    pub fn object_key(&self, relative: &str) -> String {
        self.rule.object_key(relative)
    }

    pub fn is_excluded(&self, relative: &str) -> bool {
        self.excludes.is_match(relative)
    }
}

/// Cheaply cloneable handle to a running engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    mode: Mode,
    config: EngineConfig,
    db: Database,
    registry: RuleRegistry,
    runtimes: HashMap<Uuid, Arc<RuleRuntime>>,
    paths: PathTable,
    nodes: NodeCache,
    tracker: TrackerHandle,
    jobs: JobDispatcher,
    hydrator: Hydrator,
    shutdown: watch::Sender<bool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("mode", &self.inner.mode)
            .field("rules", &self.inner.runtimes.len())
            .field("queued", &self.inner.jobs.queued())
            .finish()
    }
}

impl Engine {
    pub fn builder(db: Database) -> EngineBuilder {
        EngineBuilder::new(db)
    }

    pub fn mode(&self) -> Mode {
        self.inner.mode
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn db(&self) -> &Database {
        &self.inner.db
    }

    pub fn registry(&self) -> &RuleRegistry {
        &self.inner.registry
    }

    pub fn runtime(&self, rule_id: &Uuid) -> Option<&Arc<RuleRuntime>> {
        self.inner.runtimes.get(rule_id)
    }

    pub fn runtime_for(&self, key: &NodeKey) -> Result<&Arc<RuleRuntime>, EngineError> {
        self.runtime(&key.rule_id)
            .ok_or(EngineError::UnknownRule(key.rule_id))
    }

    pub fn runtimes(&self) -> impl Iterator<Item = &Arc<RuleRuntime>> {
        self.inner.runtimes.values()
    }

    pub fn tracker(&self) -> &TrackerHandle {
        &self.inner.tracker
    }

    pub(crate) fn jobs(&self) -> &JobDispatcher {
        &self.inner.jobs
    }

    pub(crate) fn paths(&self) -> &PathTable {
        &self.inner.paths
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.nodes.stats()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.inner.shutdown.subscribe()
    }

    /// Paths with an operation or a queued transfer in flight.
    pub fn live_paths(&self) -> usize {
        self.inner.paths.len()
    }

    /// Look a node up without taking its lock. The result may be stale by
    /// the time the caller acts on it.
    pub async fn node(&self, key: &NodeKey) -> Result<Option<Node>, EngineError> {
        if let Some(node) = self.inner.nodes.get(key) {
            return Ok(Some(node));
        }
        Ok(self.inner.db.get_node(key).await?)
    }

    /// Look a node up while holding its I/O lock, warming the cache.
    pub(crate) async fn node_locked(
        &self,
        key: &NodeKey,
        _io: &IoGuard<'_>,
    ) -> Result<Option<Node>, EngineError> {
        if let Some(node) = self.inner.nodes.get(key) {
            return Ok(Some(node));
        }
        let node = self.inner.db.get_node(key).await?;
        if let Some(node) = &node {
            self.inner.nodes.put(node);
        }
        Ok(node)
    }

    /// Persist a node. Store first, then cache.
    pub(crate) async fn commit(&self, node: &Node, _io: &IoGuard<'_>) -> Result<(), EngineError> {
        self.inner.db.upsert_node(node).await?;
        self.inner.nodes.put(node);
        Ok(())
    }

    pub(crate) async fn remove_node(
        &self,
        key: &NodeKey,
        _io: &IoGuard<'_>,
    ) -> Result<bool, EngineError> {
        let removed = self.inner.db.delete_node(key).await?;
        self.inner.nodes.invalidate(key);
        Ok(removed)
    }

    /// Move a node row, with both paths' I/O locks held.
    pub(crate) async fn move_node(
        &self,
        from: &NodeKey,
        to: &NodeKey,
        _from_io: &IoGuard<'_>,
        _to_io: &IoGuard<'_>,
    ) -> Result<bool, EngineError> {
        let moved = self.inner.db.rename_node(from, to).await?;
        self.inner.nodes.invalidate(from);
        self.inner.nodes.invalidate(to);
        Ok(moved)
    }

    /// Fetch a stub's content, joining any hydration already in flight.
    pub async fn hydrate(&self, key: &NodeKey) -> Result<u64, EngineError> {
        let mut shutdown = self.shutdown_signal();
        tokio::select! {
            result = self.inner.hydrator.hydrate(&self.inner.jobs, key) => {
                result.map_err(|reason| EngineError::hydration(&key.path, reason))
            }
            _ = shutdown.wait_for(|stop| *stop) => Err(EngineError::ShuttingDown),
        }
    }

    /// Stop the tracker and the workers.
    ///
    /// In-flight transfers are cancelled; tasks get the configured grace
    /// period to finish their metadata commits before they are aborted.
    /// The store stays open for the caller to close.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        let tasks: Vec<_> = std::mem::take(&mut *self.inner.tasks.lock());
        info!(tasks = tasks.len(), "engine shutting down");

        let grace = self.inner.config.shutdown_grace;
        let deadline = tokio::time::Instant::now() + grace;
        for mut task in tasks {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => warn!(error = %e, "engine task panicked"),
                Err(_) => {
                    warn!(?grace, "engine task did not stop in time; aborting");
                    task.abort();
                }
            }
        }
        let cache = self.cache_stats();
        debug!(cached_nodes = cache.entries, "engine stopped");
    }
}

/// Assembles an [`Engine`] and starts its background tasks.
pub struct EngineBuilder {
    db: Database,
    mode: Mode,
    config: EngineConfig,
    runtimes: Vec<RuleRuntime>,
}

impl EngineBuilder {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            mode: Mode::default(),
            config: EngineConfig::default(),
            runtimes: Vec::new(),
        }
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn rule(mut self, runtime: RuleRuntime) -> Self {
        self.runtimes.push(runtime);
        self
    }

    /// Create the cache directories and spawn the tracker and workers.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn build(self) -> Result<Engine, EngineError> {
        for runtime in &self.runtimes {
            tokio::fs::create_dir_all(&runtime.cache_dir).await?;
        }

        let registry = RuleRegistry::new(
            self.runtimes
                .iter()
                .map(|runtime| runtime.rule.as_ref().clone()),
        );
        let runtimes = self
            .runtimes
            .into_iter()
            .map(|runtime| (runtime.rule.id, Arc::new(runtime)))
            .collect();

        let (tracker, events) = TrackerHandle::new();
        let (jobs, receiver) = JobDispatcher::new();
        let (shutdown, _) = watch::channel(false);
        let workers = self.config.workers;

        let engine = Engine {
            inner: Arc::new(EngineInner {
                mode: self.mode,
                nodes: NodeCache::new(self.config.node_cache.clone()),
                config: self.config,
                db: self.db,
                registry,
                runtimes,
                paths: PathTable::default(),
                tracker,
                jobs,
                hydrator: Hydrator::default(),
                shutdown,
                tasks: parking_lot::Mutex::new(Vec::new()),
            }),
        };

        let mut tasks = Vec::with_capacity(workers + 1);
        tasks.push(tokio::spawn(tracker::run(
            engine.clone(),
            events,
            engine.shutdown_signal(),
        )));
        for id in 0..workers {
            tasks.push(tokio::spawn(worker::run(
                engine.clone(),
                receiver.clone(),
                engine.shutdown_signal(),
                id,
            )));
        }
        *engine.inner.tasks.lock() = tasks;

        info!(mode = %engine.mode(), rules = engine.inner.runtimes.len(), workers, "engine started");
        Ok(engine)
    }
}
