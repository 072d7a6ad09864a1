//! FUSE shim operations that may hydrate run off the session thread.

#![cfg(feature = "fuse")]

mod common;

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;

use common::{eventually, TestEnv};
use loft_daemon::fuse::{InodeTable, LoftFs};
use loft_daemon::{EvictionPolicy, Mode, Pending};

const HELLO: &[u8] = b"Hello world";

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_truncating_a_stub_does_not_block_other_lookups() {
    let env = TestEnv::new(Mode::Sync).await;
    env.write_file("a.txt", HELLO).await;
    env.write_file("b.txt", b"other").await;
    env.wait_for_state("a.txt", Some((11, false, Pending::Remote)))
        .await;
    env.backend.get_gate.close();

    let fs = Arc::new(LoftFs::new(
        env.view.clone(),
        tokio::runtime::Handle::current(),
    ));

    // The blocking pool stands in for the FUSE session thread.
    let (truncate, other) = tokio::task::spawn_blocking({
        let fs = fs.clone();
        move || {
            let a = fs
                .lookup_entry(InodeTable::ROOT_INODE, OsStr::new("a.txt"))
                .unwrap();
            let b = fs
                .lookup_entry(InodeTable::ROOT_INODE, OsStr::new("b.txt"))
                .unwrap();
            let truncate = fs.spawn_setattr(a.ino, Some(5), None);
            (truncate, fs.attr(b.ino))
        }
    })
    .await
    .unwrap();
    assert_eq!(other.unwrap().size, 5);

    let backend = env.backend.clone();
    eventually("download to start", || backend.gets() == 1).await;
    assert!(!truncate.is_finished());

    env.backend.get_gate.open();
    let attr = truncate.await.unwrap().unwrap();
    assert_eq!(attr.size, 5);
    assert_eq!(std::fs::read(env.cache_path("a.txt")).unwrap(), b"Hello");

    env.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rename_moves_inode_after_the_view() {
    let env = TestEnv::with(Mode::Sync, Duration::from_secs(3600), EvictionPolicy::Replicate).await;
    env.write_file("a.txt", HELLO).await;

    let fs = Arc::new(LoftFs::new(
        env.view.clone(),
        tokio::runtime::Handle::current(),
    ));
    let (ino, rename) = tokio::task::spawn_blocking({
        let fs = fs.clone();
        move || {
            let a = fs
                .lookup_entry(InodeTable::ROOT_INODE, OsStr::new("a.txt"))
                .unwrap();
            let rename = fs.spawn_rename(
                InodeTable::ROOT_INODE,
                OsStr::new("a.txt"),
                InodeTable::ROOT_INODE,
                OsStr::new("b.txt"),
            );
            (a.ino, rename)
        }
    })
    .await
    .unwrap();
    rename.await.unwrap().unwrap();

    let renamed = tokio::task::spawn_blocking({
        let fs = fs.clone();
        move || fs.attr(ino)
    })
    .await
    .unwrap()
    .unwrap();
    assert_eq!(renamed.size, 11);
    assert!(env.state("a.txt").await.is_none());
    assert_eq!(env.state("b.txt").await, Some((0, true, Pending::None)));

    env.shutdown().await;
}
