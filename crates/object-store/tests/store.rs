//! Backends driven through the `TransferBackend` trait, as the agent uses them.

use std::sync::Arc;

use bytes::Bytes;
use loft_object_store::{connect, DryRunBackend, RemoteTarget, TransferBackend};

fn file_target(dir: &std::path::Path) -> RemoteTarget {
    RemoteTarget {
        endpoint: format!("file://{}", dir.display()),
        bucket: "bucket".to_string(),
        prefix: "loft".to_string(),
        credentials_ref: None,
    }
}

#[tokio::test]
async fn test_file_backend_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let target = file_target(dir.path());
    let backend = connect(&target, None).unwrap();
    backend.check_reachable().await.unwrap();

    let key = target.object_key("rule", "docs/a.txt");
    assert_eq!(key, "loft/rule/docs/a.txt");
    backend
        .put(&key, Bytes::from_static(b"Hello world"))
        .await
        .unwrap();
    assert!(dir.path().join("bucket/loft/rule/docs/a.txt").is_file());

    let listed = backend.list(&target.scope_prefix("rule")).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!((listed[0].key.as_str(), listed[0].size), (key.as_str(), 11));

    assert!(backend.supports_move());
    let moved = target.object_key("rule", "b.txt");
    backend.rename(&key, &moved).await.unwrap();
    assert!(backend.get(&key).await.unwrap_err().is_not_found());
    assert_eq!(backend.get(&moved).await.unwrap().as_ref(), b"Hello world");

    backend.delete(&moved).await.unwrap();
    backend.delete(&moved).await.unwrap();
    assert!(backend
        .list(&target.scope_prefix("rule"))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_dry_run_over_file_backend() {
    let dir = tempfile::tempdir().unwrap();
    let target = file_target(dir.path());
    let real = connect(&target, None).unwrap();
    let key = target.object_key("rule", "a.txt");
    real.put(&key, Bytes::from_static(b"offloaded")).await.unwrap();

    let dry = DryRunBackend::with_reads_from(Arc::clone(&real));
    dry.put(&target.object_key("rule", "new.txt"), Bytes::from_static(b"x"))
        .await
        .unwrap();
    dry.delete(&key).await.unwrap();

    // Reads still reach the real store; mutations never did.
    assert_eq!(dry.get(&key).await.unwrap().as_ref(), b"offloaded");
    let keys: Vec<_> = real
        .list(&target.scope_prefix("rule"))
        .await
        .unwrap()
        .into_iter()
        .map(|object| object.key)
        .collect();
    assert_eq!(keys, vec![key]);
}
