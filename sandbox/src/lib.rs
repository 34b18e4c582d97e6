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

//! Hermetic execution of one [`Action`] at a time: materializes a private
//! working tree from the content-addressable store, runs the action's
//! command with a cleared and whitelisted environment under whatever
//! process isolation the host supports, enforces its declared timeout, and
//! ingests its declared outputs back into the store.

mod child;
mod exec;
mod isolation;
mod semaphore;
mod workspace;

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;

use build_graph::Action;
use cas::ContentAddressableStore;
use errors::{BuildError, ErrorKind};
use hashing::Digest;

use semaphore::CapacitySemaphore;

/// What running one action produced.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub exit_code: i32,
    pub stdout_digest: Digest,
    pub stderr_digest: Digest,
    pub outputs: BTreeMap<PathBuf, Digest>,
    pub duration: Duration,
    pub timed_out: bool,
}

/// The result of running one action `N` times in independent sandboxes and
/// comparing output digests, per-path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeterminismReport {
    pub deterministic: bool,
    /// The first output path whose digest differed between runs, if any.
    pub first_mismatch: Option<PathBuf>,
}

/// Executes one action with hermetic guarantees. Implemented by
/// [`LocalSandbox`]; kept as a trait so the Scheduler can be written
/// against the interface rather than the concrete executor.
#[async_trait::async_trait]
pub trait SandboxExecutor: Send + Sync {
    async fn execute(&self, action: &Action, cas: &dyn ContentAddressableStore) -> Result<ExecutionOutcome, BuildError>;
}

/// Runs actions as plain child processes of this host, under whatever
/// namespace isolation `isolation::try_unshare` can obtain.
pub struct LocalSandbox {
    work_dir_base: PathBuf,
    capacity: CapacitySemaphore,
}

impl LocalSandbox {
    /// `work_dir_base` holds one subdirectory per concurrently-executing
    /// action; `total_cpu` bounds how many of their declared `max_cpu`
    /// weights may be outstanding at once.
    pub fn new(work_dir_base: PathBuf, total_cpu: u32) -> Self {
        LocalSandbox {
            work_dir_base,
            capacity: CapacitySemaphore::new(total_cpu),
        }
    }

    /// Run `action` `attempts` times in independent sandboxes and compare
    /// output digests across runs. Intended for actions suspected of
    /// nondeterminism; not part of the normal dispatch path.
    pub async fn run_deterministic(
        &self,
        action: &Action,
        cas: &dyn ContentAddressableStore,
        attempts: usize,
    ) -> Result<DeterminismReport, BuildError> {
        assert!(attempts >= 1, "run_deterministic requires at least one attempt");

        let baseline = self.execute(action, cas).await?;
        for _ in 1..attempts {
            let outcome = self.execute(action, cas).await?;
            if let Some(path) = first_mismatch(&baseline.outputs, &outcome.outputs) {
                return Ok(DeterminismReport {
                    deterministic: false,
                    first_mismatch: Some(path),
                });
            }
        }
        Ok(DeterminismReport {
            deterministic: true,
            first_mismatch: None,
        })
    }
}

fn first_mismatch(a: &BTreeMap<PathBuf, Digest>, b: &BTreeMap<PathBuf, Digest>) -> Option<PathBuf> {
    for (path, digest) in a {
        match b.get(path) {
            Some(other) if other == digest => continue,
            _ => return Some(path.clone()),
        }
    }
    b.keys().find(|path| !a.contains_key(*path)).cloned()
}

#[async_trait::async_trait]
impl SandboxExecutor for LocalSandbox {
    async fn execute(&self, action: &Action, cas: &dyn ContentAddressableStore) -> Result<ExecutionOutcome, BuildError> {
        let _permit = self.capacity.acquire(action.capabilities.max_cpu).await?;

        let work_dir = self.work_dir_base.join(uuid::Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&work_dir).await.map_err(|e| {
            BuildError::new(ErrorKind::CacheIoFailed, format!("creating sandbox dir {}: {e}", work_dir.display())).with_source(e)
        })?;

        let result = self.execute_in(action, cas, &work_dir).await;
        workspace::cleanup(&work_dir).await;
        result
    }
}

impl LocalSandbox {
    async fn execute_in(
        &self,
        action: &Action,
        cas: &dyn ContentAddressableStore,
        work_dir: &std::path::Path,
    ) -> Result<ExecutionOutcome, BuildError> {
        workspace::materialize_inputs(work_dir, action, cas).await?;
        let env = workspace::sandboxed_env(action, work_dir);

        let raw = exec::run(action, work_dir, &env).await?;

        let outputs = if raw.exit_code == 0 && !raw.timed_out {
            workspace::capture_outputs(work_dir, action, cas).await?
        } else {
            BTreeMap::new()
        };

        let stdout_digest = cas.put(Bytes::from(raw.stdout)).await?;
        let stderr_digest = cas.put(Bytes::from(raw.stderr)).await?;

        Ok(ExecutionOutcome {
            exit_code: raw.exit_code,
            stdout_digest,
            stderr_digest,
            outputs,
            duration: raw.duration,
            timed_out: raw.timed_out,
        })
    }
}
