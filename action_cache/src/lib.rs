// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
#![allow(clippy::match_ref_pats)]
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
#![allow(clippy::mutex_atomic)]

//! Fingerprint-keyed memoization of action results, with an at-most-one
//! concurrent build guarantee per fingerprint (see [`ActionCache::acquire_build_lease`]).
//!
//! The recorded mapping itself is persisted in a [`sharded_lmdb::ShardedLmdb`],
//! the same keyed store the content-addressable layer could be backed by.
//! The build lease is a separate, purely in-process concern: it serializes
//! builders racing on the same fingerprint, not the bytes they produce.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use async_latch::AsyncLatch;
use errors::{BuildError, ErrorKind};
use hashing::{Digest, Fingerprint};
use sharded_lmdb::ShardedLmdb;

#[cfg(test)]
mod tests;

/// Schema version for [`Entry`]'s bincode encoding. Bump whenever the
/// struct's fields change shape, so a cache populated by an older binary
/// is never misread as a newer one.
const ENTRY_SCHEMA_VERSION: u8 = 1;

/// Number of independent lock/latch shards the in-process build-lease
/// table is split into. Mirrors the Scheduler's own sharding scheme so
/// that lease contention is bounded the same way ready-queue contention
/// is: a fixed, power-of-two fan-out rather than one lock for every
/// fingerprint in flight.
const LEASE_SHARD_COUNT: usize = 16;

/// What got recorded for one successful (or intentionally-cached-failure)
/// action execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub outputs: HashMap<String, Digest>,
    pub stdout_digest: Digest,
    pub stderr_digest: Digest,
    pub exit_code: i32,
    pub duration: Duration,
}

#[derive(Serialize, Deserialize)]
struct VersionedEntry {
    schema_version: u8,
    entry: Entry,
}

/// Fingerprint-keyed store mapping an Action Fingerprint to its [`Entry`],
/// plus the in-process build-lease table that keeps concurrent builders of
/// the same fingerprint from racing each other.
#[derive(Clone)]
pub struct ActionCache {
    inner: Arc<Inner>,
}

struct Inner {
    store: ShardedLmdb,
    lease_shards: Vec<Mutex<HashMap<Fingerprint, Arc<AsyncLatch>>>>,
}

/// The result of [`ActionCache::acquire_build_lease`]: either the action was
/// already cached by the time the lease was requested, or this caller is now
/// the sole builder for the fingerprint and holds a [`BuildLease`].
pub enum LeaseOutcome {
    CacheHit(Entry),
    Build(BuildLease),
}

/// Ownership of the right to build one fingerprint. Dropping this without
/// calling [`BuildLease::record`] releases the lease without recording a
/// result, exactly as if the builder had failed: the next waiter (if any)
/// becomes the new leaseholder.
pub struct BuildLease {
    cache: ActionCache,
    fingerprint: Fingerprint,
    released: bool,
}

impl ActionCache {
    /// Open (creating if necessary) an action cache backed by a sharded LMDB
    /// environment rooted at `root`.
    pub fn new(
        root: PathBuf,
        max_size_bytes: usize,
        executor: task_executor::Executor,
        lease_time: Duration,
        shard_count: u8,
    ) -> Result<ActionCache, BuildError> {
        let store = ShardedLmdb::new(root, max_size_bytes, executor, lease_time, shard_count)
            .map_err(|e| BuildError::new(ErrorKind::CacheIoFailed, e))?;

        let lease_shards = (0..LEASE_SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect();

        Ok(ActionCache {
            inner: Arc::new(Inner { store, lease_shards }),
        })
    }

    /// Pure read: does this fingerprint have a recorded result?
    pub async fn lookup(&self, fp: Fingerprint) -> Result<Option<Entry>, BuildError> {
        let versioned: Option<VersionedEntry> = self
            .inner
            .store
            .load_bytes_with(fp, |bytes| {
                bincode::deserialize(bytes).map_err(|e| format!("corrupt action cache entry: {e}"))
            })
            .await
            .map_err(|e| BuildError::new(ErrorKind::CacheIoFailed, e))?;

        match versioned {
            Some(v) if v.schema_version == ENTRY_SCHEMA_VERSION => Ok(Some(v.entry)),
            // A schema bump or genuinely corrupt record both look like a miss:
            // the caller will rebuild and `record` will overwrite it.
            Some(_) | None => Ok(None),
        }
    }

    /// Persist `entry` under `fp`. Crash-safety comes from the underlying
    /// LMDB environment's atomic transaction commit.
    pub async fn record(&self, fp: Fingerprint, entry: Entry) -> Result<(), BuildError> {
        let versioned = VersionedEntry {
            schema_version: ENTRY_SCHEMA_VERSION,
            entry,
        };
        let bytes = bincode::serialize(&versioned)
            .map_err(|e| BuildError::new(ErrorKind::Internal, format!("failed to encode action cache entry: {e}")))?;

        // A `record` for a fingerprint that's already present (e.g. a retried
        // build that both raced a lease and still computed a result) simply
        // overwrites; LMDB's NO_OVERWRITE in `store_bytes` would reject a
        // second write, so we remove any stale entry first.
        let _ = self.inner.store.remove(fp).await;
        self.inner
            .store
            .store_bytes(fp, bytes.into(), false)
            .await
            .map(|_| ())
            .map_err(|e| BuildError::new(ErrorKind::CacheIoFailed, e))
    }

    /// Acquire the at-most-one-concurrent-build lease for `fp`.
    ///
    /// If another caller is already building this fingerprint, this call
    /// waits for that build to either record a result (returned here as a
    /// [`LeaseOutcome::CacheHit`]) or release without recording, in which
    /// case this caller becomes the new leaseholder and retries the lookup
    /// loop until it either observes a hit or wins the lease itself.
    pub async fn acquire_build_lease(&self, fp: Fingerprint) -> Result<LeaseOutcome, BuildError> {
        loop {
            if let Some(entry) = self.lookup(fp).await? {
                return Ok(LeaseOutcome::CacheHit(entry));
            }

            let shard = self.lease_shard(fp);
            let existing = {
                let mut table = shard.lock();
                if let Some(latch) = table.get(&fp) {
                    Some(latch.clone())
                } else {
                    table.insert(fp, Arc::new(AsyncLatch::new()));
                    None
                }
            };

            match existing {
                Some(latch) => latch.triggered().await,
                None => {
                    return Ok(LeaseOutcome::Build(BuildLease {
                        cache: self.clone(),
                        fingerprint: fp,
                        released: false,
                    }));
                }
            }
        }
    }

    fn lease_shard(&self, fp: Fingerprint) -> &Mutex<HashMap<Fingerprint, Arc<AsyncLatch>>> {
        let idx = fp.0[0] as usize % LEASE_SHARD_COUNT;
        &self.inner.lease_shards[idx]
    }

    /// Remove the lease-table entry for `fp` and wake anyone waiting on it.
    fn release_lease(&self, fp: Fingerprint) {
        let shard = self.lease_shard(fp);
        let latch = shard.lock().remove(&fp);
        if let Some(latch) = latch {
            latch.trigger();
        }
    }
}

impl BuildLease {
    /// Record `entry` under this lease's fingerprint and release the lease.
    /// Waiters that were blocked on this fingerprint wake and observe the
    /// newly-recorded hit.
    pub async fn record(mut self, entry: Entry) -> Result<(), BuildError> {
        let result = self.cache.record(self.fingerprint, entry).await;
        self.cache.release_lease(self.fingerprint);
        self.released = true;
        result
    }

    /// Release without recording a result, e.g. because the action failed.
    /// The next waiter (if any) becomes the new leaseholder.
    pub fn release(mut self) {
        self.cache.release_lease(self.fingerprint);
        self.released = true;
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }
}

impl Drop for BuildLease {
    fn drop(&mut self) {
        if !self.released {
            self.cache.release_lease(self.fingerprint);
        }
    }
}
