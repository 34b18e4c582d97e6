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

//! Materializes external sources (HTTP archives, git revisions, and local
//! development paths) as read-only trees on disk, keyed by a stable
//! `@name` reference, and records a fingerprint of each materialized tree
//! in the content-addressable store.
//!
//! HTTP sources are integrity-verified against a digest declared up
//! front; git sources are pinned to an exact commit or a verified tag;
//! local sources are trusted as-is (development-only) but still
//! fingerprinted so callers can detect when they've changed.

mod extract;
mod fetch;
mod reference;
mod snapshot;
#[cfg(test)]
mod tests;

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use cas::ContentAddressableStore;
use errors::{BuildError, ErrorKind};
use hashing::{Digest, Fingerprint};
use sharded_lmdb::ShardedLmdb;

pub use reference::Reference;

/// Schema version for the persisted [`RootRecord`]'s bincode encoding.
const ROOT_SCHEMA_VERSION: u8 = 1;

const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);
const DEFAULT_MAX_ATTEMPTS: usize = 5;

/// Where one external repository's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// A downloadable archive, verified against a declared digest before
    /// its contents are trusted.
    Http { url: url::Url, integrity: Digest },
    /// A git repository, pinned to an exact commit SHA or a verified tag.
    Git { url: String, rev: String },
    /// A path already on local disk. Weaker than the other two: nothing
    /// is fetched or verified, which is why this variant is development-only.
    Local { path: PathBuf },
}

impl Source {
    fn kind_str(&self) -> &'static str {
        match self {
            Source::Http { .. } => "http",
            Source::Git { .. } => "git",
            Source::Local { .. } => "local",
        }
    }

    /// A string identifying exactly what this source resolves to, so a
    /// later `resolve` of the same name can detect whether the
    /// declaration changed (and needs re-fetching) or didn't.
    fn identity(&self) -> String {
        match self {
            Source::Http { url, integrity } => format!("{url}#{}", integrity.hash.to_hex()),
            Source::Git { url, rev } => format!("{url}@{rev}"),
            Source::Local { path } => path.display().to_string(),
        }
    }
}

/// A named external repository declaration, as it would appear in build
/// configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoSpec {
    pub name: String,
    pub source: Source,
    /// A single leading path component to strip from every entry of an
    /// extracted archive (e.g. the `myrepo-abcdef1/` wrapper directory
    /// GitHub generates for source archives). Only meaningful for
    /// [`Source::Http`].
    pub strip_prefix: Option<String>,
}

/// The materialized result of resolving one [`RepoSpec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalRoot {
    pub path: PathBuf,
    pub root_digest: Digest,
}

#[derive(Serialize, Deserialize)]
struct RootRecord {
    schema_version: u8,
    kind: String,
    identity: String,
    local_path: String,
    root_digest: Digest,
}

/// Resolves named external repositories into local, read-only trees.
pub struct RepositoryResolver {
    roots_dir: PathBuf,
    mapping: ShardedLmdb,
    cas: Arc<dyn ContentAddressableStore>,
    http_client: reqwest::Client,
}

impl RepositoryResolver {
    /// `roots_dir` holds one subdirectory per resolved repository, named
    /// after its `@name`; `mapping` persists the `(name) -> root digest`
    /// index so that `root_of` and repeat `resolve` calls survive a
    /// process restart without re-fetching.
    pub fn new(
        roots_dir: PathBuf,
        mapping_root: PathBuf,
        mapping_max_size_bytes: usize,
        executor: task_executor::Executor,
        cas: Arc<dyn ContentAddressableStore>,
        http_client: reqwest::Client,
    ) -> Result<RepositoryResolver, BuildError> {
        let mapping = ShardedLmdb::new(mapping_root, mapping_max_size_bytes, executor, Duration::from_secs(0), 1)
            .map_err(|e| BuildError::new(ErrorKind::CacheIoFailed, e))?;

        Ok(RepositoryResolver {
            roots_dir,
            mapping,
            cas,
            http_client,
        })
    }

    fn name_fingerprint(name: &str) -> Fingerprint {
        hashing::hash_bytes(name.as_bytes()).hash
    }

    async fn load_record(&self, fp: Fingerprint) -> Result<Option<RootRecord>, BuildError> {
        let versioned: Option<RootRecord> = self
            .mapping
            .load_bytes_with(fp, |bytes| {
                bincode::deserialize(bytes).map_err(|e| format!("corrupt repository root record: {e}"))
            })
            .await
            .map_err(|e| BuildError::new(ErrorKind::CacheIoFailed, e))?;

        Ok(versioned.filter(|record| record.schema_version == ROOT_SCHEMA_VERSION))
    }

    async fn store_record(&self, fp: Fingerprint, record: &RootRecord) -> Result<(), BuildError> {
        let bytes = bincode::serialize(record)
            .map_err(|e| BuildError::new(ErrorKind::Internal, format!("failed to encode repository root record: {e}")))?;
        let _ = self.mapping.remove(fp).await;
        self.mapping
            .store_bytes(fp, bytes.into(), false)
            .await
            .map(|_| ())
            .map_err(|e| BuildError::new(ErrorKind::CacheIoFailed, e))
    }

    /// Resolve `spec`, fetching and verifying it if it hasn't already been
    /// resolved with this exact declaration.
    pub async fn resolve(&self, spec: &RepoSpec) -> Result<LocalRoot, BuildError> {
        if spec.name.is_empty() {
            return Err(BuildError::new(ErrorKind::ConfigInvalid, "repository name must not be empty"));
        }

        let fp = Self::name_fingerprint(&spec.name);
        let identity = spec.source.identity();

        if let Some(record) = self.load_record(fp).await? {
            if record.kind == spec.source.kind_str() && record.identity == identity {
                let path = PathBuf::from(&record.local_path);
                if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    return Ok(LocalRoot {
                        path,
                        root_digest: record.root_digest,
                    });
                }
            }
        }

        let final_path = self.roots_dir.join(&spec.name);

        let local_root = match &spec.source {
            Source::Http { url, integrity } => {
                self.resolve_http(url, *integrity, spec.strip_prefix.as_deref(), &final_path).await?
            }
            Source::Git { url, rev } => self.resolve_git(url, rev, &final_path).await?,
            Source::Local { path } => self.resolve_local(path).await?,
        };

        let record = RootRecord {
            schema_version: ROOT_SCHEMA_VERSION,
            kind: spec.source.kind_str().to_string(),
            identity,
            local_path: local_root.path.display().to_string(),
            root_digest: local_root.root_digest,
        };
        self.store_record(fp, &record).await?;

        Ok(local_root)
    }

    async fn resolve_http(
        &self,
        url: &url::Url,
        integrity: Digest,
        strip_prefix: Option<&str>,
        final_path: &PathBuf,
    ) -> Result<LocalRoot, BuildError> {
        let bytes = fetch::fetch_http(
            &self.http_client,
            url,
            integrity,
            DEFAULT_BASE_DELAY,
            NonZeroUsize::new(DEFAULT_MAX_ATTEMPTS).expect("nonzero literal"),
        )
        .await?;

        let staging = self.staging_dir().await?;
        let outcome: Result<Digest, BuildError> = async {
            extract::extract_tar_gz(bytes, staging.clone(), strip_prefix.map(str::to_string)).await?;
            self.finalize_root(&staging, final_path).await?;
            snapshot::snapshot_tree(final_path.clone(), self.cas.as_ref()).await
        }
        .await;

        let root_digest = match outcome {
            Ok(digest) => digest,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&staging).await;
                return Err(e);
            }
        };

        Ok(LocalRoot {
            path: final_path.clone(),
            root_digest,
        })
    }

    async fn resolve_git(&self, url: &str, rev: &str, final_path: &PathBuf) -> Result<LocalRoot, BuildError> {
        let staging = self.staging_dir().await?;

        let outcome: Result<Digest, BuildError> = async {
            fetch::fetch_git(url, rev, &staging, DEFAULT_BASE_DELAY, NonZeroUsize::new(DEFAULT_MAX_ATTEMPTS).expect("nonzero literal"))
                .await?;
            self.finalize_root(&staging, final_path).await?;
            snapshot::snapshot_tree(final_path.clone(), self.cas.as_ref()).await
        }
        .await;

        let root_digest = match outcome {
            Ok(digest) => digest,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&staging).await;
                return Err(e);
            }
        };

        Ok(LocalRoot {
            path: final_path.clone(),
            root_digest,
        })
    }

    async fn resolve_local(&self, path: &std::path::Path) -> Result<LocalRoot, BuildError> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(BuildError::new(
                ErrorKind::ConfigInvalid,
                format!("local repository path {} does not exist", path.display()),
            ));
        }

        let root_digest = snapshot::snapshot_tree(path.to_path_buf(), self.cas.as_ref()).await?;
        Ok(LocalRoot {
            path: path.to_path_buf(),
            root_digest,
        })
    }

    async fn staging_dir(&self) -> Result<PathBuf, BuildError> {
        let staging = self.roots_dir.join(".staging").join(uuid::Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|e| BuildError::new(ErrorKind::CacheIoFailed, format!("creating staging dir {}: {e}", staging.display())).with_source(e))?;
        Ok(staging)
    }

    async fn finalize_root(&self, staging: &std::path::Path, final_path: &std::path::Path) -> Result<(), BuildError> {
        match tokio::fs::remove_dir_all(final_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(BuildError::new(ErrorKind::CacheIoFailed, format!("clearing previous root {}: {e}", final_path.display()))
                    .with_source(e));
            }
        }
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                BuildError::new(ErrorKind::CacheIoFailed, format!("creating {}: {e}", parent.display())).with_source(e)
            })?;
        }
        tokio::fs::rename(staging, final_path)
            .await
            .map_err(|e| BuildError::new(ErrorKind::CacheIoFailed, format!("finalizing root {}: {e}", final_path.display())).with_source(e))
    }

    /// Return the stable local path a previously-resolved repository was
    /// materialized at.
    pub async fn root_of(&self, name: &str) -> Result<PathBuf, BuildError> {
        let fp = Self::name_fingerprint(name);
        let record = self
            .load_record(fp)
            .await?
            .ok_or_else(|| BuildError::new(ErrorKind::TargetNotFound, format!("repository '{name}' has not been resolved")))?;

        let path = PathBuf::from(record.local_path);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(BuildError::new(
                ErrorKind::TargetNotFound,
                format!("repository '{name}' was resolved but its root at {} is missing", path.display()),
            ));
        }
        Ok(path)
    }
}
