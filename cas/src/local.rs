// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use hashing::{Digest, Fingerprint};
use log::debug;
use parking_lot::Mutex;

use errors::{BuildError, ErrorKind};

use crate::ContentAddressableStore;

/// Tracks when each locally-present digest was last read or written, so
/// [`LocalCas::evict`] can implement LRU without re-`stat`-ing the whole
/// tree on every call. Rebuilt from a directory walk at construction time.
struct Ledger {
    last_access: HashMap<Fingerprint, Instant>,
    sizes: HashMap<Fingerprint, u64>,
    total_bytes: u64,
}

impl Ledger {
    fn touch(&mut self, fp: Fingerprint, size: u64) {
        self.last_access.insert(fp, Instant::now());
        if self.sizes.insert(fp, size).is_none() {
            self.total_bytes += size;
        }
    }

    fn forget(&mut self, fp: Fingerprint) {
        self.last_access.remove(&fp);
        if let Some(size) = self.sizes.remove(&fp) {
            self.total_bytes -= size;
        }
    }
}

/// A local, filesystem-backed content-addressable store.
///
/// Blobs live at `root/<first-two-hex>/<rest-of-hex>`, matching the
/// persisted-state layout external tooling expects to be able to read
/// directly. Writes land in `root/tmp/<uuid>` first and are renamed into
/// place, so a reader never observes a partially-written blob and a
/// crash mid-write leaves no corrupt entry at the final path.
pub struct LocalCas {
    root: PathBuf,
    ledger: Mutex<Ledger>,
}

/// What an [`LocalCas::evict`] call actually did, so callers (and tests)
/// can assert on it rather than re-deriving it from before/after disk
/// scans.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionSummary {
    pub evicted_count: usize,
    pub evicted_bytes: u64,
    pub remaining_bytes: u64,
}

impl LocalCas {
    /// Open (creating if necessary) a store rooted at `root`. Walks the
    /// existing tree once to seed the LRU ledger from file metadata.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, BuildError> {
        let root = root.into();
        std::fs::create_dir_all(root.join("tmp")).map_err(|e| {
            BuildError::new(
                ErrorKind::CacheIoFailed,
                format!("failed to create CAS root {}: {e}", root.display()),
            )
            .with_source(e)
        })?;

        let mut last_access = HashMap::new();
        let mut sizes = HashMap::new();
        let mut total_bytes = 0u64;
        for entry in walkdir::WalkDir::new(&root)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(Result::ok)
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(fp) = fingerprint_from_path(&root, entry.path()) else {
                continue;
            };
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            let accessed = meta
                .accessed()
                .or_else(|_| meta.modified())
                .unwrap_or_else(|_| SystemTime::now());
            let age = accessed.elapsed().unwrap_or_default();
            last_access.insert(fp, Instant::now().checked_sub(age).unwrap_or_else(Instant::now));
            sizes.insert(fp, meta.len());
            total_bytes += meta.len();
        }

        Ok(LocalCas {
            root,
            ledger: Mutex::new(Ledger {
                last_access,
                sizes,
                total_bytes,
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn shard_dir(&self, fp: &Fingerprint) -> PathBuf {
        let hex = fp.to_hex();
        self.root.join(&hex[0..2])
    }

    fn blob_path(&self, fp: &Fingerprint) -> PathBuf {
        let hex = fp.to_hex();
        self.shard_dir(fp).join(&hex[2..])
    }

    /// Current size of all locally-present blobs, according to the ledger
    /// (not a fresh disk scan).
    pub fn total_bytes(&self) -> u64 {
        self.ledger.lock().total_bytes
    }

    /// Evict least-recently-used blobs until the store's total size is at
    /// or below `goal_bytes`, skipping any digest in `pinned` (e.g. ones
    /// referenced by a live action-cache entry). Never interrupts an
    /// in-flight reader: `get` always reads a blob's full contents before
    /// returning, so an unlink here can only race a reader that already
    /// holds the bytes it needs.
    pub fn evict(
        &self,
        goal_bytes: u64,
        pinned: &std::collections::HashSet<Digest>,
    ) -> Result<EvictionSummary, BuildError> {
        let pinned_fps: std::collections::HashSet<Fingerprint> =
            pinned.iter().map(|d| d.hash).collect();

        let mut ledger = self.ledger.lock();
        if ledger.total_bytes <= goal_bytes {
            return Ok(EvictionSummary {
                remaining_bytes: ledger.total_bytes,
                ..Default::default()
            });
        }

        let mut candidates: Vec<(Fingerprint, Instant)> = ledger
            .last_access
            .iter()
            .filter(|(fp, _)| !pinned_fps.contains(fp))
            .map(|(fp, t)| (*fp, *t))
            .collect();
        candidates.sort_by_key(|(_, t)| *t);

        let mut evicted_count = 0;
        let mut evicted_bytes = 0u64;
        for (fp, _) in candidates {
            if ledger.total_bytes <= goal_bytes {
                break;
            }
            let path = self.blob_path(&fp);
            let size = ledger.sizes.get(&fp).copied().unwrap_or(0);
            if std::fs::remove_file(&path).is_ok() {
                ledger.forget(fp);
                evicted_count += 1;
                evicted_bytes += size;
            }
        }
        debug!(
            "evicted {evicted_count} blob(s) ({evicted_bytes} bytes) to reach goal of {goal_bytes} bytes"
        );

        Ok(EvictionSummary {
            evicted_count,
            evicted_bytes,
            remaining_bytes: ledger.total_bytes,
        })
    }
}

fn fingerprint_from_path(root: &Path, path: &Path) -> Option<Fingerprint> {
    let rel = path.strip_prefix(root).ok()?;
    let mut components = rel.components();
    let shard = components.next()?.as_os_str().to_str()?;
    let rest = components.next()?.as_os_str().to_str()?;
    if components.next().is_some() {
        return None;
    }
    Fingerprint::from_hex_string(&format!("{shard}{rest}")).ok()
}

#[async_trait]
impl ContentAddressableStore for LocalCas {
    async fn put(&self, bytes: Bytes) -> Result<Digest, BuildError> {
        let digest = hashing::hash_bytes(&bytes);
        let dest = self.blob_path(&digest.hash);

        if dest.exists() {
            self.ledger.lock().touch(digest.hash, digest.size_bytes as u64);
            return Ok(digest);
        }

        let shard_dir = self.shard_dir(&digest.hash);
        tokio::fs::create_dir_all(&shard_dir).await.map_err(|e| {
            BuildError::new(ErrorKind::CacheIoFailed, format!("failed to create {}: {e}", shard_dir.display()))
                .with_source(e)
        })?;

        let tmp_path = self.root.join("tmp").join(uuid::Uuid::new_v4().to_string());
        tokio::fs::write(&tmp_path, &bytes).await.map_err(|e| {
            BuildError::new(
                ErrorKind::CacheIoFailed,
                format!("failed to write temp blob {}: {e}", tmp_path.display()),
            )
            .with_source(e)
        })?;

        match tokio::fs::rename(&tmp_path, &dest).await {
            Ok(()) => {}
            // Another writer raced us to the same digest; since content is
            // immutable and identical by construction, the existing file
            // wins and our temp copy is simply discarded.
            Err(_) if dest.exists() => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(BuildError::new(
                    ErrorKind::CacheIoFailed,
                    format!("failed to commit blob {}: {e}", dest.display()),
                )
                .with_source(e));
            }
        }

        self.ledger.lock().touch(digest.hash, digest.size_bytes as u64);
        Ok(digest)
    }

    async fn get(&self, digest: Digest) -> Result<Option<Bytes>, BuildError> {
        let path = self.blob_path(&digest.hash);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                self.ledger.lock().touch(digest.hash, digest.size_bytes as u64);
                Ok(Some(Bytes::from(bytes)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BuildError::new(
                ErrorKind::CacheIoFailed,
                format!("failed to read blob {}: {e}", path.display()),
            )
            .with_source(e)),
        }
    }

    async fn has(&self, digest: Digest) -> Result<bool, BuildError> {
        Ok(tokio::fs::try_exists(self.blob_path(&digest.hash))
            .await
            .unwrap_or(false))
    }

    async fn link(&self, digest: Digest, dest_path: &Path) -> Result<(), BuildError> {
        let src = self.blob_path(&digest.hash);
        if !src.exists() {
            return Err(BuildError::new(
                ErrorKind::CacheIoFailed,
                format!("cannot link {}: not present in the store", digest.hash),
            ));
        }
        if let Some(parent) = dest_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                BuildError::new(ErrorKind::CacheIoFailed, format!("failed to create {}: {e}", parent.display()))
                    .with_source(e)
            })?;
        }
        let _ = tokio::fs::remove_file(dest_path).await;

        let src_owned = src.clone();
        let dest_owned = dest_path.to_owned();
        let linked = tokio::task::spawn_blocking(move || std::fs::hard_link(&src_owned, &dest_owned))
            .await
            .map_err(|e| BuildError::new(ErrorKind::Internal, format!("link task panicked: {e}")))?;

        if linked.is_err() {
            // Cross-device or filesystem without hard-link support: fall back to a copy.
            tokio::fs::copy(&src, dest_path).await.map_err(|e| {
                BuildError::new(
                    ErrorKind::CacheIoFailed,
                    format!("failed to materialize {} at {}: {e}", digest.hash, dest_path.display()),
                )
                .with_source(e)
            })?;
        }

        let mut perms = tokio::fs::metadata(dest_path)
            .await
            .map_err(|e| BuildError::new(ErrorKind::CacheIoFailed, e.to_string()).with_source(e))?
            .permissions();
        perms.set_readonly(true);
        tokio::fs::set_permissions(dest_path, perms)
            .await
            .map_err(|e| BuildError::new(ErrorKind::CacheIoFailed, e.to_string()).with_source(e))?;

        self.ledger.lock().touch(digest.hash, digest.size_bytes as u64);
        Ok(())
    }
}

#[cfg(test)]
mod local_tests;
