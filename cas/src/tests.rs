use bytes::Bytes;
use tempfile::tempdir;

use crate::{ContentAddressableStore, LocalCas};

#[tokio::test]
async fn digest_of_bytes_is_stable_regardless_of_store_instance() {
    let dir_a = tempdir().unwrap();
    let dir_b = tempdir().unwrap();
    let store_a = LocalCas::new(dir_a.path()).unwrap();
    let store_b = LocalCas::new(dir_b.path()).unwrap();

    let digest_a = store_a.put(Bytes::from_static(b"cross process")).await.unwrap();
    let digest_b = store_b.put(Bytes::from_static(b"cross process")).await.unwrap();
    assert_eq!(digest_a, digest_b);
}

#[tokio::test]
async fn trait_object_round_trip() {
    let dir = tempdir().unwrap();
    let store: Box<dyn ContentAddressableStore> = Box::new(LocalCas::new(dir.path()).unwrap());

    let digest = store.put(Bytes::from_static(b"via trait object")).await.unwrap();
    assert_eq!(
        store.get(digest).await.unwrap(),
        Some(Bytes::from_static(b"via trait object"))
    );
}

#[tokio::test]
async fn concurrent_put_of_identical_bytes_is_safe() {
    let dir = tempdir().unwrap();
    let store = std::sync::Arc::new(LocalCas::new(dir.path()).unwrap());

    let mut handles = Vec::new();
    for _ in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.put(Bytes::from_static(b"racing writers")).await.unwrap()
        }));
    }
    let mut digests = Vec::new();
    for h in handles {
        digests.push(h.await.unwrap());
    }
    assert!(digests.iter().all(|d| *d == digests[0]));
    assert!(store.get(digests[0]).await.unwrap().is_some());
}
