use std::collections::HashMap;
use std::time::Duration;

use tempfile::tempdir;

use hashing::{hash_bytes, Fingerprint};

use crate::{ActionCache, Entry, LeaseOutcome};

fn fp(seed: &str) -> Fingerprint {
    hash_bytes(seed.as_bytes()).hash
}

fn sample_entry() -> Entry {
    let stdout = hash_bytes(b"stdout");
    let stderr = hash_bytes(b"stderr");
    let mut outputs = HashMap::new();
    outputs.insert("out.txt".to_string(), hash_bytes(b"out contents"));
    Entry {
        outputs,
        stdout_digest: stdout,
        stderr_digest: stderr,
        exit_code: 0,
        duration: Duration::from_millis(42),
    }
}

async fn new_cache(root: &std::path::Path) -> ActionCache {
    ActionCache::new(
        root.to_path_buf(),
        16 * 1024 * 1024,
        task_executor::Executor::new(),
        Duration::from_secs(60 * 60),
        16,
    )
    .unwrap()
}

#[tokio::test]
async fn lookup_of_unrecorded_fingerprint_is_none() {
    let dir = tempdir().unwrap();
    let cache = new_cache(dir.path()).await;
    assert_eq!(cache.lookup(fp("never built")).await.unwrap(), None);
}

#[tokio::test]
async fn record_then_lookup_round_trips() {
    let dir = tempdir().unwrap();
    let cache = new_cache(dir.path()).await;
    let key = fp("build me");
    let entry = sample_entry();

    cache.record(key, entry.clone()).await.unwrap();
    assert_eq!(cache.lookup(key).await.unwrap(), Some(entry));
}

#[tokio::test]
async fn record_overwrites_an_existing_entry() {
    let dir = tempdir().unwrap();
    let cache = new_cache(dir.path()).await;
    let key = fp("rebuilt");

    let mut first = sample_entry();
    first.exit_code = 1;
    cache.record(key, first).await.unwrap();

    let mut second = sample_entry();
    second.exit_code = 0;
    cache.record(key, second.clone()).await.unwrap();

    assert_eq!(cache.lookup(key).await.unwrap(), Some(second));
}

#[tokio::test]
async fn acquire_build_lease_on_a_miss_grants_a_build_lease() {
    let dir = tempdir().unwrap();
    let cache = new_cache(dir.path()).await;
    let key = fp("fresh");

    match cache.acquire_build_lease(key).await.unwrap() {
        LeaseOutcome::Build(lease) => assert_eq!(lease.fingerprint(), key),
        LeaseOutcome::CacheHit(_) => panic!("expected a build lease on first acquisition"),
    }
}

#[tokio::test]
async fn acquire_build_lease_on_a_populated_fingerprint_is_a_cache_hit() {
    let dir = tempdir().unwrap();
    let cache = new_cache(dir.path()).await;
    let key = fp("already built");
    let entry = sample_entry();
    cache.record(key, entry.clone()).await.unwrap();

    match cache.acquire_build_lease(key).await.unwrap() {
        LeaseOutcome::CacheHit(hit) => assert_eq!(hit, entry),
        LeaseOutcome::Build(_) => panic!("expected a cache hit"),
    }
}

#[tokio::test]
async fn a_second_acquirer_waits_until_the_first_records_then_observes_the_hit() {
    let dir = tempdir().unwrap();
    let cache = new_cache(dir.path()).await;
    let key = fp("contended");

    let lease = match cache.acquire_build_lease(key).await.unwrap() {
        LeaseOutcome::Build(lease) => lease,
        LeaseOutcome::CacheHit(_) => panic!("expected a build lease"),
    };

    let cache2 = cache.clone();
    let waiter = tokio::spawn(async move { cache2.acquire_build_lease(key).await.unwrap() });

    // Give the waiter a chance to observe the miss and queue behind the lease
    // before the leaseholder records a result.
    tokio::task::yield_now().await;
    tokio::time::sleep(Duration::from_millis(10)).await;

    let entry = sample_entry();
    lease.record(entry.clone()).await.unwrap();

    match waiter.await.unwrap() {
        LeaseOutcome::CacheHit(hit) => assert_eq!(hit, entry),
        LeaseOutcome::Build(_) => panic!("waiter should have observed the recorded hit"),
    }
}

#[tokio::test]
async fn releasing_without_recording_lets_the_next_contender_acquire_the_lease() {
    let dir = tempdir().unwrap();
    let cache = new_cache(dir.path()).await;
    let key = fp("builder failed");

    let lease = match cache.acquire_build_lease(key).await.unwrap() {
        LeaseOutcome::Build(lease) => lease,
        LeaseOutcome::CacheHit(_) => panic!("expected a build lease"),
    };

    let cache2 = cache.clone();
    let waiter = tokio::spawn(async move { cache2.acquire_build_lease(key).await.unwrap() });

    tokio::task::yield_now().await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    lease.release();

    match waiter.await.unwrap() {
        LeaseOutcome::Build(new_lease) => assert_eq!(new_lease.fingerprint(), key),
        LeaseOutcome::CacheHit(_) => panic!("nothing was ever recorded"),
    }
}

#[tokio::test]
async fn dropping_a_lease_without_recording_also_releases_it() {
    let dir = tempdir().unwrap();
    let cache = new_cache(dir.path()).await;
    let key = fp("dropped");

    {
        let lease = match cache.acquire_build_lease(key).await.unwrap() {
            LeaseOutcome::Build(lease) => lease,
            LeaseOutcome::CacheHit(_) => panic!("expected a build lease"),
        };
        drop(lease);
    }

    match cache.acquire_build_lease(key).await.unwrap() {
        LeaseOutcome::Build(_) => (),
        LeaseOutcome::CacheHit(_) => panic!("nothing was ever recorded"),
    }
}

#[tokio::test]
async fn independent_fingerprints_do_not_contend_for_each_others_leases() {
    let dir = tempdir().unwrap();
    let cache = new_cache(dir.path()).await;

    let a = match cache.acquire_build_lease(fp("a")).await.unwrap() {
        LeaseOutcome::Build(lease) => lease,
        LeaseOutcome::CacheHit(_) => panic!("expected a build lease"),
    };
    let b = match cache.acquire_build_lease(fp("b")).await.unwrap() {
        LeaseOutcome::Build(lease) => lease,
        LeaseOutcome::CacheHit(_) => panic!("expected a build lease"),
    };
    assert_ne!(a.fingerprint(), b.fingerprint());
}
