//! End-to-end engine behaviour through the mount view, against an
//! in-memory backend.

mod common;

use std::time::Duration;

use common::{eventually, test_config, test_target, TestBackend, TestEnv};
use loft_daemon::engine::resume;
use loft_daemon::{
    Database, Engine, EngineError, EvictionPolicy, Mode, MountView, NodeKey, Pending, Rule,
    RuleRuntime,
};
use tempfile::TempDir;

const HELLO: &[u8] = b"Hello world";

#[tokio::test]
async fn test_offload_then_hydrate_on_read() {
    let env = TestEnv::new(Mode::Sync).await;

    env.write_file("a.txt", HELLO).await;
    assert_eq!(env.state("a.txt").await, Some((0, true, Pending::None)));

    env.wait_for_state("a.txt", Some((11, false, Pending::Remote)))
        .await;
    assert_eq!(
        env.backend.object(&env.object_key("a.txt")).await.as_deref(),
        Some(HELLO)
    );
    // Evicted to a zero-length stub that still reports its real size.
    assert_eq!(std::fs::metadata(env.cache_path("a.txt")).unwrap().len(), 0);
    let attr = env.view.getattr("a.txt").await.unwrap();
    assert_eq!(attr.size, 11);
    assert!(attr.stub);

    assert_eq!(env.read_file("a.txt").await, HELLO);
    assert_eq!(env.state("a.txt").await, Some((11, true, Pending::None)));
    assert_eq!(std::fs::read(env.cache_path("a.txt")).unwrap(), HELLO);

    env.shutdown().await;
}

#[tokio::test]
async fn test_hydrated_file_is_evicted_again_without_upload() {
    let env = TestEnv::new(Mode::Sync).await;

    env.write_file("a.txt", HELLO).await;
    env.wait_for_state("a.txt", Some((11, false, Pending::Remote)))
        .await;
    assert_eq!(env.read_file("a.txt").await, HELLO);

    env.wait_for_state("a.txt", Some((11, false, Pending::Remote)))
        .await;
    assert_eq!(env.backend.puts(), 1);
    assert_eq!(std::fs::metadata(env.cache_path("a.txt")).unwrap().len(), 0);

    env.shutdown().await;
}

#[tokio::test]
async fn test_write_after_hydration_uploads_again() {
    let env = TestEnv::new(Mode::Sync).await;

    env.write_file("a.txt", HELLO).await;
    env.wait_for_state("a.txt", Some((11, false, Pending::Remote)))
        .await;

    env.view.write("a.txt", 6, b"loft!").await.unwrap();
    assert_eq!(env.state("a.txt").await, Some((11, true, Pending::None)));

    env.wait_for_object("a.txt", Some(b"Hello loft!")).await;
    env.wait_for_state("a.txt", Some((11, false, Pending::Remote)))
        .await;
    assert_eq!(env.backend.puts(), 2);

    env.shutdown().await;
}

#[tokio::test]
async fn test_overwrite_before_quiet_period_uploads_once() {
    let env = TestEnv::with(
        Mode::Sync,
        Duration::from_millis(300),
        EvictionPolicy::Replicate,
    )
    .await;

    env.write_file("a.txt", b"first draft").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    env.write_file("a.txt", b"final").await;

    env.wait_for_state("a.txt", Some((5, false, Pending::Remote)))
        .await;
    let history = env.backend.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].1.as_ref(), b"final");

    env.shutdown().await;
}

#[tokio::test]
async fn test_overwrite_mid_upload_never_leaves_stale_content() {
    let env = TestEnv::new(Mode::Sync).await;
    env.backend.put_gate.close();

    env.write_file("a.txt", b"old bytes").await;
    eventually("first upload to start", || env.backend.puts_started() == 1).await;

    env.write_file("a.txt", b"new").await;
    env.backend.put_gate.open();

    env.wait_for_state("a.txt", Some((3, false, Pending::Remote)))
        .await;
    assert_eq!(
        env.backend.object(&env.object_key("a.txt")).await.as_deref(),
        Some(&b"new"[..])
    );
    assert!(env
        .backend
        .history()
        .iter()
        .all(|(_, data)| data.as_ref() == b"new"));

    env.shutdown().await;
}

#[tokio::test]
async fn test_direct_mode_uploads_immediately_and_keeps_file() {
    // A quiet period far beyond the test timeout proves nothing waits on it.
    let env = TestEnv::with(
        Mode::Direct,
        Duration::from_secs(3600),
        EvictionPolicy::Replicate,
    )
    .await;

    env.write_file("a.txt", HELLO).await;
    env.wait_for_object("a.txt", Some(HELLO)).await;
    env.wait_for_state("a.txt", Some((11, true, Pending::None)))
        .await;
    assert_eq!(std::fs::read(env.cache_path("a.txt")).unwrap(), HELLO);

    env.shutdown().await;
}

#[tokio::test]
async fn test_dry_run_touches_nothing_remote() {
    let env = TestEnv::new(Mode::DryRun).await;

    env.write_file("a.txt", HELLO).await;
    env.wait_for_state("a.txt", Some((11, true, Pending::None)))
        .await;
    assert_eq!(env.backend.puts_started(), 0);
    assert!(env.backend.object(&env.object_key("a.txt")).await.is_none());
    assert_eq!(std::fs::read(env.cache_path("a.txt")).unwrap(), HELLO);

    env.view.unlink("a.txt").await.unwrap();
    assert_eq!(env.state("a.txt").await, None);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(env.backend.deletes(), 0);

    env.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_reads_share_one_download() {
    let env = TestEnv::new(Mode::Sync).await;

    env.write_file("a.txt", HELLO).await;
    env.wait_for_state("a.txt", Some((11, false, Pending::Remote)))
        .await;

    env.backend.get_gate.close();
    let readers: Vec<_> = (0..3)
        .map(|_| {
            let view = env.view.clone();
            tokio::spawn(async move { view.read("a.txt", 0, 64).await })
        })
        .collect();
    eventually("the download to start", || env.backend.gets() == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    env.backend.get_gate.open();

    for reader in readers {
        assert_eq!(reader.await.unwrap().unwrap(), HELLO);
    }
    assert_eq!(env.backend.gets(), 1);
    assert_eq!(env.state("a.txt").await, Some((11, true, Pending::None)));

    env.shutdown().await;
}

#[tokio::test]
async fn test_failed_hydration_leaves_stub() {
    let env = TestEnv::new(Mode::Sync).await;

    env.write_file("a.txt", HELLO).await;
    env.wait_for_state("a.txt", Some((11, false, Pending::Remote)))
        .await;

    env.backend.fail_gets(true);
    let err = env.view.read("a.txt", 0, 64).await.unwrap_err();
    assert!(matches!(err, EngineError::HydrationFailed { .. }), "{err}");
    assert_eq!(env.state("a.txt").await, Some((11, false, Pending::Remote)));
    assert_eq!(std::fs::metadata(env.cache_path("a.txt")).unwrap().len(), 0);

    env.backend.fail_gets(false);
    assert_eq!(env.read_file("a.txt").await, HELLO);

    env.shutdown().await;
}

#[tokio::test]
async fn test_failed_upload_stays_local_and_retries() {
    let env = TestEnv::new(Mode::Sync).await;
    env.backend.fail_puts(true);

    env.write_file("a.txt", HELLO).await;
    eventually("upload attempts to run out", || {
        env.backend.puts_started() >= 2
    })
    .await;
    assert_eq!(env.state("a.txt").await, Some((0, true, Pending::None)));
    assert_eq!(std::fs::read(env.cache_path("a.txt")).unwrap(), HELLO);

    env.backend.fail_puts(false);
    env.wait_for_state("a.txt", Some((11, false, Pending::Remote)))
        .await;
    assert_eq!(env.backend.puts(), 1);

    env.shutdown().await;
}

#[tokio::test]
async fn test_unlink_deletes_remote_copy() {
    let env = TestEnv::new(Mode::Sync).await;

    env.write_file("a.txt", HELLO).await;
    env.wait_for_state("a.txt", Some((11, false, Pending::Remote)))
        .await;

    env.view.unlink("a.txt").await.unwrap();
    env.wait_for_object("a.txt", None).await;
    env.wait_for_state("a.txt", None).await;
    assert!(!env.cache_path("a.txt").exists());

    env.shutdown().await;
}

#[tokio::test]
async fn test_unlink_before_upload_uploads_nothing() {
    let env = TestEnv::new(Mode::Sync).await;

    env.write_file("a.txt", HELLO).await;
    env.view.unlink("a.txt").await.unwrap();

    env.wait_for_state("a.txt", None).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(env.backend.puts_started(), 0);

    env.shutdown().await;
}

#[tokio::test]
async fn test_recreate_after_unlink_keeps_new_content() {
    let env = TestEnv::new(Mode::Sync).await;

    env.write_file("a.txt", HELLO).await;
    env.wait_for_state("a.txt", Some((11, false, Pending::Remote)))
        .await;

    env.view.unlink("a.txt").await.unwrap();
    env.write_file("a.txt", b"again").await;

    env.wait_for_state("a.txt", Some((5, false, Pending::Remote)))
        .await;
    env.wait_for_object("a.txt", Some(b"again")).await;

    env.shutdown().await;
}

#[tokio::test]
async fn test_rename_local_file_moves_upload() {
    let env = TestEnv::new(Mode::Sync).await;

    env.write_file("a.txt", HELLO).await;
    env.view.rename("a.txt", "docs/b.txt").await.unwrap();

    env.wait_for_state("docs/b.txt", Some((11, false, Pending::Remote)))
        .await;
    assert_eq!(env.state("a.txt").await, None);
    assert!(env.backend.object(&env.object_key("a.txt")).await.is_none());
    env.wait_for_object("docs/b.txt", Some(HELLO)).await;

    env.shutdown().await;
}

#[tokio::test]
async fn test_rename_stub_moves_remote_object() {
    let env = TestEnv::new(Mode::Sync).await;

    env.write_file("a.txt", HELLO).await;
    env.wait_for_state("a.txt", Some((11, false, Pending::Remote)))
        .await;

    env.view.rename("a.txt", "b.txt").await.unwrap();
    assert_eq!(env.state("b.txt").await, Some((11, false, Pending::Remote)));
    assert_eq!(env.state("a.txt").await, None);
    assert!(env.backend.object(&env.object_key("a.txt")).await.is_none());
    assert_eq!(
        env.backend.object(&env.object_key("b.txt")).await.as_deref(),
        Some(HELLO)
    );
    assert_eq!(env.backend.gets(), 0);

    assert_eq!(env.read_file("b.txt").await, HELLO);

    env.shutdown().await;
}

#[tokio::test]
async fn test_policy_keeps_small_files_local() {
    let env = TestEnv::with(
        Mode::Sync,
        Duration::from_millis(100),
        EvictionPolicy::LargerThan(100),
    )
    .await;

    env.write_file("small.txt", HELLO).await;
    env.write_file("large.bin", &[7u8; 512]).await;

    env.wait_for_state("large.bin", Some((512, false, Pending::Remote)))
        .await;
    assert_eq!(env.state("small.txt").await, Some((0, true, Pending::None)));
    assert_eq!(env.backend.puts_started(), 1);

    env.shutdown().await;
}

#[tokio::test]
async fn test_resume_uploads_what_the_last_run_left() {
    let mut env = TestEnv::with(
        Mode::Sync,
        Duration::from_secs(3600),
        EvictionPolicy::Replicate,
    )
    .await;

    env.write_file("a.txt", HELLO).await;
    // Written behind the agent's back while it was down.
    std::fs::write(env.cache_path("b.txt"), b"adopted").unwrap();
    env.restart(Duration::from_millis(100)).await;

    let stats = resume(&env.engine).await.unwrap();
    assert_eq!(stats.requeued, 1);
    assert_eq!(stats.adopted, 1);

    env.wait_for_state("a.txt", Some((11, false, Pending::Remote)))
        .await;
    env.wait_for_state("b.txt", Some((7, false, Pending::Remote)))
        .await;
    assert_eq!(env.backend.puts(), 2);

    env.shutdown().await;
}

#[tokio::test]
async fn test_resume_finishes_interrupted_delete() {
    let mut env = TestEnv::new(Mode::Sync).await;

    env.write_file("a.txt", HELLO).await;
    env.wait_for_state("a.txt", Some((11, false, Pending::Remote)))
        .await;

    // The cache file vanished while the agent was down.
    env.engine.shutdown().await;
    std::fs::remove_file(env.cache_path("a.txt")).unwrap();
    env.restart(Duration::from_millis(100)).await;

    let stats = resume(&env.engine).await.unwrap();
    assert_eq!(stats.deleted, 1);
    env.wait_for_object("a.txt", None).await;
    env.wait_for_state("a.txt", None).await;

    env.shutdown().await;
}

#[tokio::test]
async fn test_nested_rule_roots_keep_their_own_files() {
    common::init_tracing();
    let dir = TempDir::new().unwrap();
    let db = Database::in_memory().await.unwrap();
    let outer = Rule::new(dir.path().join("data"), test_target());
    let inner = Rule::new(dir.path().join("data/photos"), test_target());
    db.insert_rules(&[outer.clone(), inner.clone()]).await.unwrap();
    let backend = TestBackend::new();

    let engine = Engine::builder(db.clone())
        .config(test_config(Duration::from_millis(50)))
        .rule(RuleRuntime::new(
            outer.clone(),
            dir.path().join("cache-outer"),
            backend.clone(),
        ))
        .rule(RuleRuntime::new(
            inner.clone(),
            dir.path().join("cache-inner"),
            backend.clone(),
        ))
        .build()
        .await
        .unwrap();
    let view = MountView::new(engine.clone(), outer.id).unwrap();

    view.mkdir("photos", 0o755).await.unwrap();
    view.create("photos/x.txt", 0o644).await.unwrap();
    view.write("photos/x.txt", 0, b"hello").await.unwrap();

    let key = NodeKey::new(outer.id, "photos/x.txt");
    let deadline = tokio::time::Instant::now() + common::TIMEOUT;
    loop {
        let state = db.get_node(&key).await.unwrap().map(|node| node.state());
        if state == Some((5, false, Pending::Remote)) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "still {state:?}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(db
        .get_node(&NodeKey::new(inner.id, "x.txt"))
        .await
        .unwrap()
        .is_none());
    assert_eq!(
        backend.object(&outer.object_key("photos/x.txt")).await.as_deref(),
        Some(&b"hello"[..])
    );
    assert_eq!(backend.puts(), 1);

    engine.shutdown().await;
    db.close().await;
}

#[tokio::test]
async fn test_settled_paths_release_their_slots() {
    let env = TestEnv::with(Mode::Sync, Duration::from_millis(50), EvictionPolicy::Replicate).await;

    for i in 0..20 {
        env.write_file(&format!("f{i}.txt"), HELLO).await;
    }
    for i in 0..20 {
        env.wait_for_state(&format!("f{i}.txt"), Some((11, false, Pending::Remote)))
            .await;
    }
    eventually("path slots to drain", || env.engine.live_paths() == 0).await;

    // Hydrating and re-evicting leaves nothing behind either.
    assert_eq!(env.read_file("f0.txt").await, HELLO);
    env.wait_for_state("f0.txt", Some((11, false, Pending::Remote)))
        .await;
    eventually("path slots to drain", || env.engine.live_paths() == 0).await;

    env.shutdown().await;
}

#[tokio::test]
async fn test_direct_mode_releases_slots_after_upload() {
    let env = TestEnv::new(Mode::Direct).await;

    for i in 0..10 {
        env.write_file(&format!("f{i}.txt"), HELLO).await;
    }
    for i in 0..10 {
        env.wait_for_object(&format!("f{i}.txt"), Some(HELLO)).await;
    }
    eventually("path slots to drain", || env.engine.live_paths() == 0).await;

    env.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_cancels_inflight_upload() {
    let env = TestEnv::with(Mode::Sync, Duration::from_millis(50), EvictionPolicy::Replicate).await;
    env.backend.put_gate.close();

    env.write_file("a.txt", HELLO).await;
    let backend = env.backend.clone();
    eventually("upload to start", || backend.puts_started() == 1).await;

    let grace = env.engine.config().shutdown_grace;
    tokio::time::timeout(grace, env.engine.shutdown())
        .await
        .expect("shutdown within the grace period");

    assert_eq!(env.state("a.txt").await, Some((0, true, Pending::None)));
    assert!(env.backend.object(&env.object_key("a.txt")).await.is_none());
    assert_eq!(std::fs::read(env.cache_path("a.txt")).unwrap(), HELLO);

    env.shutdown().await;
}

#[tokio::test]
async fn test_read_of_stub_after_shutdown_fails_fast() {
    let env = TestEnv::new(Mode::Sync).await;

    env.write_file("a.txt", HELLO).await;
    env.wait_for_state("a.txt", Some((11, false, Pending::Remote)))
        .await;
    env.engine.shutdown().await;

    let read = tokio::time::timeout(Duration::from_secs(1), env.view.read("a.txt", 0, 64))
        .await
        .expect("read must not hang after shutdown");
    assert!(read.is_err());
    assert_eq!(env.state("a.txt").await, Some((11, false, Pending::Remote)));

    env.shutdown().await;
}
