use std::collections::HashSet;

use bytes::Bytes;
use tempfile::tempdir;

use super::*;

#[tokio::test]
async fn put_then_get_round_trips() {
    let dir = tempdir().unwrap();
    let store = LocalCas::new(dir.path()).unwrap();

    let digest = store.put(Bytes::from_static(b"hello")).await.unwrap();
    let bytes = store.get(digest).await.unwrap();
    assert_eq!(bytes, Some(Bytes::from_static(b"hello")));
}

#[tokio::test]
async fn get_of_absent_digest_is_none() {
    let dir = tempdir().unwrap();
    let store = LocalCas::new(dir.path()).unwrap();
    let digest = hashing::hash_bytes(b"never written");
    assert_eq!(store.get(digest).await.unwrap(), None);
}

#[tokio::test]
async fn duplicate_put_is_idempotent() {
    let dir = tempdir().unwrap();
    let store = LocalCas::new(dir.path()).unwrap();

    let d1 = store.put(Bytes::from_static(b"same bytes")).await.unwrap();
    let d2 = store.put(Bytes::from_static(b"same bytes")).await.unwrap();
    assert_eq!(d1, d2);
    assert_eq!(store.total_bytes(), d1.size_bytes as u64);
}

#[tokio::test]
async fn has_reflects_presence() {
    let dir = tempdir().unwrap();
    let store = LocalCas::new(dir.path()).unwrap();
    let digest = store.put(Bytes::from_static(b"present")).await.unwrap();
    assert!(store.has(digest).await.unwrap());

    let absent = hashing::hash_bytes(b"absent");
    assert!(!store.has(absent).await.unwrap());
}

#[tokio::test]
async fn link_materializes_a_read_only_file() {
    let dir = tempdir().unwrap();
    let store = LocalCas::new(dir.path()).unwrap();
    let digest = store.put(Bytes::from_static(b"payload")).await.unwrap();

    let dest_dir = tempdir().unwrap();
    let dest = dest_dir.path().join("out.txt");
    store.link(digest, &dest).await.unwrap();

    let contents = std::fs::read(&dest).unwrap();
    assert_eq!(contents, b"payload");
    assert!(std::fs::metadata(&dest).unwrap().permissions().readonly());
}

#[tokio::test]
async fn blob_layout_uses_two_hex_char_shard_prefix() {
    let dir = tempdir().unwrap();
    let store = LocalCas::new(dir.path()).unwrap();
    let digest = store.put(Bytes::from_static(b"shard me")).await.unwrap();

    let hex = digest.hash.to_hex();
    let expected = dir.path().join(&hex[0..2]).join(&hex[2..]);
    assert!(expected.is_file());
}

#[tokio::test]
async fn evict_removes_least_recently_used_first() {
    let dir = tempdir().unwrap();
    let store = LocalCas::new(dir.path()).unwrap();

    let old = store.put(Bytes::from_static(b"old blob contents")).await.unwrap();
    // Touch `old`'s neighbor later so `old` is the oldest by access time.
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let new = store.put(Bytes::from_static(b"new blob contents")).await.unwrap();

    let summary = store.evict(new.size_bytes as u64, &HashSet::new()).unwrap();
    assert_eq!(summary.evicted_count, 1);
    assert!(!store.has(old).await.unwrap());
    assert!(store.has(new).await.unwrap());
}

#[tokio::test]
async fn evict_skips_pinned_digests() {
    let dir = tempdir().unwrap();
    let store = LocalCas::new(dir.path()).unwrap();

    let a = store.put(Bytes::from_static(b"pinned contents")).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let _b = store.put(Bytes::from_static(b"also present")).await.unwrap();

    let mut pinned = HashSet::new();
    pinned.insert(a);

    let summary = store.evict(0, &pinned).unwrap();
    assert!(store.has(a).await.unwrap(), "pinned digest must survive eviction");
    assert_eq!(summary.remaining_bytes, a.size_bytes as u64);
}

#[tokio::test]
async fn reopening_a_store_rebuilds_the_ledger_from_disk() {
    let dir = tempdir().unwrap();
    let digest = {
        let store = LocalCas::new(dir.path()).unwrap();
        store.put(Bytes::from_static(b"persisted")).await.unwrap()
    };

    let reopened = LocalCas::new(dir.path()).unwrap();
    assert!(reopened.has(digest).await.unwrap());
    assert_eq!(reopened.total_bytes(), digest.size_bytes as u64);
}
