// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![allow(clippy::len_without_is_empty, clippy::too_many_arguments)]

//! Fixtures shared across this workspace's component tests: a throwaway
//! on-disk CAS, a minimal two/three-action graph builder, and a
//! deterministic, scriptable stand-in for a Sandbox executor. Centralized
//! here so individual crates' tests build small graphs and fake workers the
//! same way instead of re-deriving the boilerplate per crate.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use build_graph::{Action, CapabilitySet, Priority};
use cas::{ContentAddressableStore, LocalCas};
use errors::BuildError;
use hashing::EMPTY_DIGEST;
use sandbox::{ExecutionOutcome, SandboxExecutor};

/// An on-disk CAS rooted in a temp directory that is deleted when the
/// returned guard is dropped. Keeping the `TempDir` alive for the duration
/// of a test is the caller's responsibility (that's why it's returned
/// alongside the store, rather than leaked).
pub fn throwaway_cas() -> (tempfile::TempDir, Arc<dyn ContentAddressableStore>) {
    let dir = tempfile::tempdir().expect("failed to create temp dir for CAS");
    let cas = LocalCas::new(dir.path()).expect("failed to open throwaway CAS");
    (dir, Arc::new(cas))
}

/// A minimal action with a deterministic id and no real inputs/outputs,
/// suitable for graph-shape tests that don't care about the command
/// actually doing anything.
pub fn trivial_action(id: &str) -> Action {
    Action {
        id: id.to_string(),
        argv: vec!["true".to_string()],
        env: BTreeMap::new(),
        inputs: BTreeMap::new(),
        output_paths: BTreeSet::new(),
        tool_digest: EMPTY_DIGEST,
        platform: "x86_64-unknown-linux-gnu".to_string(),
        priority: Priority::Normal,
        capabilities: CapabilitySet::default(),
    }
}

pub fn trivial_action_with_priority(id: &str, priority: Priority) -> Action {
    Action {
        priority,
        ..trivial_action(id)
    }
}

/// Build the canonical `A -> B -> C` linear chain used across this
/// workspace's scheduler/cache tests (see e.g. the cached-rebuild and
/// source-perturbation scenarios): each node depends on the one before it.
pub fn linear_chain(graph: &build_graph::BuildGraph, ids: &[&str]) {
    for id in ids {
        graph.add_node(trivial_action(id)).expect("trivial actions always validate");
    }
    for pair in ids.windows(2) {
        graph.add_edge(pair[0], pair[1]).expect("linear_chain ids must be unique and acyclic");
    }
}

/// What a [`ScriptedSandbox`] should do the next time it's asked to
/// execute a particular action id.
#[derive(Clone, Debug)]
pub enum ScriptedOutcome {
    Succeed,
    Fail,
    Timeout,
    /// Returns `Err` from `execute` itself (e.g. a transient worker error),
    /// rather than a completed-but-failed [`ExecutionOutcome`].
    Error(errors::ErrorKind),
}

/// A [`SandboxExecutor`] whose result for each action id is decided ahead
/// of time by the test, instead of actually spawning a process. Counts how
/// many times each action was asked to execute, so tests can assert on the
/// at-most-one-concurrent-build and cache-hit invariants without racing a
/// real subprocess.
pub struct ScriptedSandbox {
    scripts: std::collections::HashMap<String, ScriptedOutcome>,
    default: ScriptedOutcome,
    executions: Arc<AtomicUsize>,
}

impl ScriptedSandbox {
    pub fn new(default: ScriptedOutcome) -> Self {
        ScriptedSandbox {
            scripts: std::collections::HashMap::new(),
            default,
            executions: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_script(mut self, id: &str, outcome: ScriptedOutcome) -> Self {
        self.scripts.insert(id.to_string(), outcome);
        self
    }

    /// Total number of times any action was actually executed (i.e. this
    /// excludes cache hits, since those never call `execute`).
    pub fn execution_count(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxExecutor for ScriptedSandbox {
    async fn execute(&self, action: &Action, cas: &dyn ContentAddressableStore) -> Result<ExecutionOutcome, BuildError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let outcome = self.scripts.get(&action.id).cloned().unwrap_or_else(|| self.default.clone());

        match outcome {
            ScriptedOutcome::Succeed => {
                let stdout_digest = cas.put(bytes::Bytes::new()).await?;
                let stderr_digest = stdout_digest;
                Ok(ExecutionOutcome {
                    exit_code: 0,
                    stdout_digest,
                    stderr_digest,
                    outputs: BTreeMap::new(),
                    duration: Duration::from_millis(1),
                    timed_out: false,
                })
            }
            ScriptedOutcome::Fail => {
                let stdout_digest = cas.put(bytes::Bytes::new()).await?;
                Ok(ExecutionOutcome {
                    exit_code: 1,
                    stdout_digest,
                    stderr_digest: stdout_digest,
                    outputs: BTreeMap::new(),
                    duration: Duration::from_millis(1),
                    timed_out: false,
                })
            }
            ScriptedOutcome::Timeout => {
                let stdout_digest = cas.put(bytes::Bytes::new()).await?;
                Ok(ExecutionOutcome {
                    exit_code: -1,
                    stdout_digest,
                    stderr_digest: stdout_digest,
                    outputs: BTreeMap::new(),
                    duration: action.capabilities.timeout,
                    timed_out: true,
                })
            }
            ScriptedOutcome::Error(kind) => Err(BuildError::new(kind, format!("scripted failure for {}", action.id))),
        }
    }
}

/// A deterministic, monotonically-advancing clock for tests that need
/// reproducible timestamps (e.g. peer staleness in the `distributed`
/// crate) without depending on wall-clock timing.
#[derive(Clone)]
pub struct DeterministicClock {
    now: Arc<std::sync::atomic::AtomicU64>,
}

impl DeterministicClock {
    pub fn new() -> Self {
        DeterministicClock {
            now: Arc::new(std::sync::atomic::AtomicU64::new(0)),
        }
    }

    pub fn now(&self) -> Duration {
        Duration::from_millis(self.now.load(Ordering::SeqCst))
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Default for DeterministicClock {
    fn default() -> Self {
        Self::new()
    }
}

/// A throwaway action cache rooted in a temp directory.
pub fn throwaway_action_cache(executor: task_executor::Executor) -> (tempfile::TempDir, action_cache::ActionCache) {
    let dir = tempfile::tempdir().expect("failed to create temp dir for action cache");
    let cache = action_cache::ActionCache::new(
        dir.path().to_path_buf(),
        64 * 1024 * 1024,
        executor,
        Duration::from_secs(30),
        1,
    )
    .expect("failed to open throwaway action cache");
    (dir, cache)
}

pub fn repo_root() -> PathBuf {
    std::env::temp_dir()
}
