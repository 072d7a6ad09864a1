//! Shared fixtures for the engine integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use object_store::{ObjectStoreError, RemoteObject, RemoteTarget, Storage, TransferBackend};
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::watch;

use loft_daemon::engine::NodeCacheConfig;
use loft_daemon::{
    Database, Engine, EngineConfig, EvictionPolicy, Mode, MountView, Pending, Rule, RuleRuntime,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("loft_daemon=debug")
        .with_test_writer()
        .try_init();
}

/// Poll `check` until it holds, panicking after [`TIMEOUT`].
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Blocks callers while closed.
#[derive(Debug)]
pub struct Gate(watch::Sender<bool>);

impl Gate {
    fn new() -> Self {
        Self(watch::channel(true).0)
    }

    pub fn open(&self) {
        self.0.send_replace(true);
    }

    pub fn close(&self) {
        self.0.send_replace(false);
    }

    async fn pass(&self) {
        let mut rx = self.0.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }
}

/// In-memory backend that counts calls, can hold them at a gate and can
/// be told to fail.
#[derive(Debug)]
pub struct TestBackend {
    inner: Storage,
    pub put_gate: Gate,
    pub get_gate: Gate,
    fail_puts: AtomicBool,
    fail_gets: AtomicBool,
    puts_started: AtomicUsize,
    puts: AtomicUsize,
    gets: AtomicUsize,
    deletes: AtomicUsize,
    /// Content of every completed put, in order
    history: Mutex<Vec<(String, Bytes)>>,
}

impl TestBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Storage::memory(),
            put_gate: Gate::new(),
            get_gate: Gate::new(),
            fail_puts: AtomicBool::new(false),
            fail_gets: AtomicBool::new(false),
            puts_started: AtomicUsize::new(0),
            puts: AtomicUsize::new(0),
            gets: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            history: Mutex::new(Vec::new()),
        })
    }

    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub fn fail_gets(&self, fail: bool) {
        self.fail_gets.store(fail, Ordering::SeqCst);
    }

    /// Puts that reached the backend, including failed and gated ones.
    pub fn puts_started(&self) -> usize {
        self.puts_started.load(Ordering::SeqCst)
    }

    /// Completed puts
    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn history(&self) -> Vec<(String, Bytes)> {
        self.history.lock().clone()
    }

    /// Current content of `key`, bypassing the counters.
    pub async fn object(&self, key: &str) -> Option<Bytes> {
        self.inner.get_data(key).await.ok()
    }

    /// Seed an object without counting a put.
    pub async fn seed(&self, key: &str, data: &[u8]) {
        self.inner
            .put_data(key, Bytes::copy_from_slice(data))
            .await
            .unwrap();
    }
}

#[async_trait]
impl TransferBackend for TestBackend {
    fn name(&self) -> &'static str {
        "test"
    }

    async fn check_reachable(&self) -> object_store::Result<()> {
        Ok(())
    }

    async fn put(&self, key: &str, data: Bytes) -> object_store::Result<RemoteObject> {
        self.puts_started.fetch_add(1, Ordering::SeqCst);
        self.put_gate.pass().await;
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(ObjectStoreError::Unreachable("puts disabled".into()));
        }
        let object = self.inner.put_data(key, data.clone()).await?;
        self.history.lock().push((key.to_string(), data));
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(object)
    }

    async fn get(&self, key: &str) -> object_store::Result<Bytes> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.get_gate.pass().await;
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(ObjectStoreError::Unreachable("gets disabled".into()));
        }
        self.inner.get_data(key).await
    }

    async fn list(&self, prefix: &str) -> object_store::Result<Vec<RemoteObject>> {
        self.inner.list_data(prefix).await
    }

    async fn delete(&self, key: &str) -> object_store::Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete_data(key).await
    }

    fn supports_move(&self) -> bool {
        true
    }

    async fn rename(&self, from: &str, to: &str) -> object_store::Result<()> {
        self.inner.rename_data(from, to).await
    }
}

/// Engine settings scaled down for tests.
pub fn test_config(quiet_period: Duration) -> EngineConfig {
    EngineConfig {
        quiet_period,
        sweep_interval: Duration::from_millis(10),
        workers: 2,
        max_attempts: 2,
        backoff_base: Duration::from_millis(5),
        backoff_max: Duration::from_millis(20),
        shutdown_grace: Duration::from_secs(1),
        node_cache: NodeCacheConfig::default(),
    }
}

pub fn test_target() -> RemoteTarget {
    RemoteTarget {
        endpoint: "memory://".to_string(),
        bucket: "test".to_string(),
        prefix: "loft".to_string(),
        credentials_ref: None,
    }
}

/// One rule served by an engine over temp directories and an in-memory store.
pub struct TestEnv {
    pub engine: Engine,
    pub view: MountView,
    pub backend: Arc<TestBackend>,
    pub db: Database,
    pub rule: Rule,
    pub mode: Mode,
    pub policy: EvictionPolicy,
    dir: TempDir,
}

impl TestEnv {
    pub async fn new(mode: Mode) -> Self {
        Self::with(mode, Duration::from_millis(150), EvictionPolicy::Replicate).await
    }

    pub async fn with(mode: Mode, quiet_period: Duration, policy: EvictionPolicy) -> Self {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let db = Database::in_memory().await.unwrap();
        let rule = Rule::new(dir.path().join("root"), test_target());
        db.insert_rule(&rule).await.unwrap();
        let backend = TestBackend::new();

        let engine = start(&db, &rule, &dir, mode, quiet_period, policy, &backend).await;
        let view = MountView::new(engine.clone(), rule.id).unwrap();
        Self {
            engine,
            view,
            backend,
            db,
            rule,
            mode,
            policy,
            dir,
        }
    }

    /// Stop the engine and start a fresh one over the same store, cache
    /// and backend.
    pub async fn restart(&mut self, quiet_period: Duration) {
        self.engine.shutdown().await;
        self.engine = start(
            &self.db,
            &self.rule,
            &self.dir,
            self.mode,
            quiet_period,
            self.policy,
            &self.backend,
        )
        .await;
        self.view = MountView::new(self.engine.clone(), self.rule.id).unwrap();
    }

    pub fn cache_path(&self, relative: &str) -> PathBuf {
        self.view.cache_dir().join(relative)
    }

    pub fn object_key(&self, relative: &str) -> String {
        self.rule.object_key(relative)
    }

    /// Create `relative` and write `data` from offset 0.
    pub async fn write_file(&self, relative: &str, data: &[u8]) {
        self.view.create(relative, 0o644).await.unwrap();
        self.view.truncate(relative, 0).await.unwrap();
        self.view.write(relative, 0, data).await.unwrap();
    }

    pub async fn read_file(&self, relative: &str) -> Vec<u8> {
        self.view.read(relative, 0, 1 << 20).await.unwrap()
    }

    /// `(size, local, pending)` of the stored node.
    pub async fn state(&self, relative: &str) -> Option<(u64, bool, Pending)> {
        self.db
            .get_node(&self.rule_key(relative))
            .await
            .unwrap()
            .map(|node| node.state())
    }

    pub fn rule_key(&self, relative: &str) -> loft_daemon::NodeKey {
        loft_daemon::NodeKey::new(self.rule.id, relative)
    }

    /// Wait until the stored node of `relative` is `expected`.
    pub async fn wait_for_state(&self, relative: &str, expected: Option<(u64, bool, Pending)>) {
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        loop {
            let state = self.state(relative).await;
            if state == expected {
                return;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("{relative}: expected {expected:?}, still {state:?}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until the remote copy of `relative` is `expected`.
    pub async fn wait_for_object(&self, relative: &str, expected: Option<&[u8]>) {
        let key = self.object_key(relative);
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        loop {
            let object = self.backend.object(&key).await;
            if object.as_deref() == expected {
                return;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("{key}: expected {expected:?}, still {object:?}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn shutdown(self) {
        self.engine.shutdown().await;
        assert!(self.engine.is_shutting_down());
        self.db.close().await;
    }
}

async fn start(
    db: &Database,
    rule: &Rule,
    dir: &TempDir,
    mode: Mode,
    quiet_period: Duration,
    policy: EvictionPolicy,
    backend: &Arc<TestBackend>,
) -> Engine {
    let backend: Arc<dyn TransferBackend> = match mode {
        Mode::DryRun => Arc::new(object_store::DryRunBackend::with_reads_from(backend.clone())),
        _ => backend.clone(),
    };
    let runtime = RuleRuntime::new(rule.clone(), dir.path().join("cache"), backend)
        .with_policy(policy);
    Engine::builder(db.clone())
        .mode(mode)
        .config(test_config(quiet_period))
        .rule(runtime)
        .build()
        .await
        .unwrap()
}

/// Bytes keyed by object key, for assertions over a whole prefix.
pub async fn objects(backend: &TestBackend, prefix: &str) -> HashMap<String, u64> {
    backend
        .list(prefix)
        .await
        .unwrap()
        .into_iter()
        .map(|object| (object.key, object.size))
        .collect()
}
