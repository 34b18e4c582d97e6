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

//! Drives a [`BuildGraph`] to completion: dequeues ready actions from a
//! sharded priority queue, checks the [`ActionCache`] before dispatching
//! to a [`WorkerPool`], and feeds completions and failures back into the
//! graph until every action is Completed, Failed, or (transitively)
//! skipped.
//!
//! The ready queue is sharded the same way the action cache's build-lease
//! table is (a fixed, power-of-two shard count, `hash(id) mod N`) so that
//! enqueue/dequeue contention is bounded independently of how many actions
//! are in flight. Sharding only gives approximate global priority
//! ordering; see [`shard`] for the two-pass dequeue that mitigates this.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use action_cache::{ActionCache, Entry, LeaseOutcome};
use build_graph::{fingerprint_action, BuildGraph, FailOutcome, Priority};
use workunit_store::{Metric, ObservationMetric, WorkunitStore};

mod shard;
mod worker;

#[cfg(test)]
mod tests;

pub use worker::{LocalWorkerPool, WorkerPool};

use shard::{shard_count_for, shard_index, ReadyItem, Shard};

/// The outcome of driving one [`BuildGraph`] to completion: every action
/// ends up in exactly one of these buckets (skipped actions are never
/// double-counted even if more than one failing ancestor would otherwise
/// have propagated failure onto them).
#[derive(Debug, Clone, Default)]
pub struct BuildSummary {
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
    pub cache_hits: usize,
    pub executed: usize,
}

#[derive(Default)]
struct SchedulerState {
    succeeded: HashSet<String>,
    failed: HashSet<String>,
    skipped: HashSet<String>,
    cache_hits: usize,
    executed: usize,
}

impl SchedulerState {
    fn resolved(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.skipped.len()
    }
}

/// Sharded, priority-aware dispatcher for one [`BuildGraph`]. Construct one
/// per build; a `Scheduler` has no notion of "done, reset, run again" — a
/// finished graph should be discarded along with its `Scheduler`.
pub struct Scheduler {
    graph: Arc<BuildGraph>,
    cache: ActionCache,
    workers: Arc<dyn WorkerPool>,
    shards: Vec<Shard>,
    shard_count: usize,
    tick: AtomicU64,
    state: Mutex<SchedulerState>,
    notify: Notify,
    concurrency: Arc<Semaphore>,
    workunits: Option<WorkunitStore>,
    depths: fnv::FnvHashMap<String, u32>,
}

impl Scheduler {
    /// `shard_count_hint` and `max_concurrency` are typically both derived
    /// from the host's CPU count; see `EngineOptions::scheduler_shards` and
    /// the sandbox's own CPU-based capacity semaphore for the same idea
    /// applied to process execution rather than dispatch.
    pub fn new(
        graph: Arc<BuildGraph>,
        cache: ActionCache,
        workers: Arc<dyn WorkerPool>,
        shard_count_hint: usize,
        max_concurrency: usize,
        workunits: Option<WorkunitStore>,
    ) -> Arc<Scheduler> {
        let shard_count = shard_count_for(shard_count_hint);
        let shards = (0..shard_count).map(|_| Shard::default()).collect();
        let depths = compute_depths(&graph);
        Arc::new(Scheduler {
            graph,
            cache,
            workers,
            shards,
            shard_count,
            tick: AtomicU64::new(0),
            state: Mutex::new(SchedulerState::default()),
            notify: Notify::new(),
            concurrency: Arc::new(Semaphore::new(max_concurrency.max(1))),
            workunits,
            depths,
        })
    }

    /// Run until every action in the graph is resolved. Equivalent to
    /// `run_cancellable` with a token that is never triggered.
    pub async fn run(self: &Arc<Self>) -> BuildSummary {
        self.run_cancellable(CancellationToken::new()).await
    }

    /// Run until every action in the graph is resolved, or `cancel` fires.
    /// On cancellation, in-flight dispatches are allowed to finish (so a
    /// worker never has its action yanked out from under it mid-execution)
    /// but no new work is dequeued.
    pub async fn run_cancellable(self: &Arc<Self>, cancel: CancellationToken) -> BuildSummary {
        let total = self.graph.node_ids().len();

        for id in self.graph.ready_nodes() {
            self.push_ready(&id);
        }

        let mut in_flight = JoinSet::new();

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let mut made_progress = false;
            while let Ok(permit) = Arc::clone(&self.concurrency).try_acquire_owned() {
                let Some(item) = self.try_dequeue() else {
                    drop(permit);
                    break;
                };
                made_progress = true;
                let this = Arc::clone(self);
                in_flight.spawn(async move {
                    this.process_one(item.id).await;
                    drop(permit);
                });
            }

            if self.state.lock().resolved() >= total {
                break;
            }

            if !made_progress && in_flight.is_empty() {
                log::warn!(
                    "scheduler has no ready actions and nothing in flight, but {}/{} actions remain unresolved; stopping to avoid a hang",
                    total - self.state.lock().resolved(),
                    total
                );
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = in_flight.join_next(), if !in_flight.is_empty() => {}
                _ = self.notify.notified(), if in_flight.is_empty() => {}
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
        }

        in_flight.shutdown().await;
        self.state.lock().clone_summary()
    }

    fn push_ready(&self, id: &str) {
        let Some(action) = self.graph.action(id) else {
            return;
        };
        let depth = self.depths.get(id).copied().unwrap_or(0);
        let tick = self.tick.fetch_add(1, Ordering::Relaxed);
        let idx = shard_index(id, self.shard_count);
        self.shards[idx].push(ReadyItem {
            id: id.to_string(),
            priority: action.priority,
            depth,
            tick,
        });
        self.notify.notify_one();
    }

    /// Two-pass dequeue, per the scheduler's sharded dispatch scheme: a
    /// first pass considers only High/Critical work across every shard
    /// (starting from a randomized index so no single shard is favored),
    /// then a second pass takes whatever is available. This approximates
    /// global priority ordering without a global lock.
    fn try_dequeue(&self) -> Option<ReadyItem> {
        let start = rand::thread_rng().gen_range(0..self.shard_count);

        for offset in 0..self.shard_count {
            let idx = (start + offset) % self.shard_count;
            if let Some(item) = self.shards[idx].pop_if_at_least(Priority::High) {
                return Some(item);
            }
        }
        for offset in 0..self.shard_count {
            let idx = (start + offset) % self.shard_count;
            if let Some(item) = self.shards[idx].pop() {
                return Some(item);
            }
        }
        None
    }

    async fn process_one(self: &Arc<Self>, id: String) {
        let Some(action) = self.graph.action(&id) else {
            return;
        };

        let fp = fingerprint_action(&action).hash;

        let workunit = self
            .workunits
            .as_ref()
            .map(|store| store.start_workunit("scheduler::dispatch", log::Level::Debug, None));

        let lease = match self.cache.acquire_build_lease(fp).await {
            Ok(outcome) => outcome,
            Err(e) => {
                log::error!("action cache lookup failed for {id}: {e}");
                if let Some(w) = workunit {
                    w.complete(workunit_store::WorkunitOutcome::Failure, Default::default());
                }
                self.handle_failure(&id, true);
                return;
            }
        };

        match lease {
            LeaseOutcome::CacheHit(_entry) => {
                if let Err(e) = self.graph.transition_to_scheduled(&id) {
                    log::warn!("{id} was not Ready when its cache hit resolved: {e}");
                }
                let newly_ready = self.graph.complete(&id).unwrap_or_default();
                {
                    let mut state = self.state.lock();
                    state.succeeded.insert(id.clone());
                    state.cache_hits += 1;
                }
                if let Some(w) = workunit {
                    let mut metadata = std::collections::HashMap::new();
                    metadata.insert("metric", Metric::ActionCacheHits.as_str().to_string());
                    w.complete(workunit_store::WorkunitOutcome::Success, metadata);
                }
                for ready_id in newly_ready {
                    self.push_ready(&ready_id);
                }
            }
            LeaseOutcome::Build(build_lease) => {
                if let Err(e) = self.graph.transition_to_scheduled(&id) {
                    log::error!("cannot dispatch {id}: {e}");
                    build_lease.release();
                    if let Some(w) = workunit {
                        w.complete(workunit_store::WorkunitOutcome::Failure, Default::default());
                    }
                    return;
                }
                if let Err(e) = self.graph.transition_to_executing(&id) {
                    log::error!("cannot execute {id}: {e}");
                    build_lease.release();
                    if let Some(w) = workunit {
                        w.complete(workunit_store::WorkunitOutcome::Failure, Default::default());
                    }
                    return;
                }

                let start = std::time::Instant::now();
                let result = self.workers.dispatch(action).await;
                let elapsed_micros = start.elapsed().as_micros() as i64;

                match result {
                    Ok(outcome) if outcome.exit_code == 0 && !outcome.timed_out => {
                        let entry = Entry {
                            outputs: outcome
                                .outputs
                                .iter()
                                .map(|(path, digest)| (path.to_string_lossy().into_owned(), *digest))
                                .collect(),
                            stdout_digest: outcome.stdout_digest,
                            stderr_digest: outcome.stderr_digest,
                            exit_code: outcome.exit_code,
                            duration: outcome.duration,
                        };
                        if let Err(e) = build_lease.record(entry).await {
                            log::error!("failed to record action cache entry for {id}: {e}");
                        }
                        let newly_ready = self.graph.complete(&id).unwrap_or_default();
                        {
                            let mut state = self.state.lock();
                            state.succeeded.insert(id.clone());
                            state.executed += 1;
                        }
                        if let Some(w) = workunit {
                            let mut metadata = std::collections::HashMap::new();
                            metadata.insert(
                                ObservationMetric::LocalExecutionTimeMicros.as_str(),
                                elapsed_micros.to_string(),
                            );
                            w.complete(workunit_store::WorkunitOutcome::Success, metadata);
                        }
                        for ready_id in newly_ready {
                            self.push_ready(&ready_id);
                        }
                    }
                    Ok(outcome) => {
                        // Ran to completion but failed or overran its deadline:
                        // a timeout is worth retrying (the host may simply have
                        // been under load), a nonzero exit is not.
                        build_lease.release();
                        if let Some(w) = workunit {
                            w.complete(workunit_store::WorkunitOutcome::Failure, Default::default());
                        }
                        self.handle_failure(&id, outcome.timed_out);
                    }
                    Err(e) => {
                        build_lease.release();
                        let transient = e.is_transient();
                        log::warn!("{id} failed to execute: {e}");
                        if let Some(w) = workunit {
                            w.complete(workunit_store::WorkunitOutcome::Failure, Default::default());
                        }
                        self.handle_failure(&id, transient);
                    }
                }
            }
        }
    }

    fn handle_failure(&self, id: &str, transient: bool) {
        match self.graph.fail(id, transient) {
            Ok(FailOutcome::Requeued) => self.push_ready(id),
            Ok(FailOutcome::Failed(propagated)) => {
                let mut state = self.state.lock();
                state.failed.insert(id.to_string());
                for dependent in propagated {
                    if !state.succeeded.contains(&dependent) && !state.failed.contains(&dependent) {
                        state.skipped.insert(dependent);
                    }
                }
            }
            Err(e) => log::error!("failed to record failure for {id}: {e}"),
        }
    }

    /// Track a result from the `distributed` crate's worker registry: the
    /// work assigned to a peer that has gone stale returns to Ready (or
    /// Failed, once retries are exhausted) exactly as a local failure
    /// would. Called from `distributed::coordinator` when it evicts a
    /// dead peer; kept on `Scheduler` (rather than duplicated there) so
    /// the retry/propagation rules live in exactly one place.
    pub fn reassign_dead_worker(&self, assigned_ids: &[String]) {
        let failed = self.graph.reassign_from_dead_worker(assigned_ids);
        // `reassign_from_dead_worker` only reports ids that ended up Failed;
        // everything else in `assigned_ids` was requeued and is Ready again.
        for id in assigned_ids {
            if !failed.contains(id) {
                self.push_ready(id);
            }
        }
        let mut state = self.state.lock();
        for id in failed {
            if !state.succeeded.contains(&id) {
                state.failed.insert(id);
            }
        }
    }

    pub fn cache(&self) -> &ActionCache {
        &self.cache
    }

    pub fn graph(&self) -> &Arc<BuildGraph> {
        &self.graph
    }
}

impl SchedulerState {
    fn clone_summary(&self) -> BuildSummary {
        BuildSummary {
            succeeded: self.succeeded.iter().cloned().collect(),
            failed: self.failed.iter().cloned().collect(),
            skipped: self.skipped.iter().cloned().collect(),
            cache_hits: self.cache_hits,
            executed: self.executed,
        }
    }
}

/// `depth[v] = 1 + max(depth[dep] for dep in direct_dependencies(v))`,
/// computed once per run in topological order so each ready-queue entry
/// can be scored without a graph walk on every push.
fn compute_depths(graph: &BuildGraph) -> fnv::FnvHashMap<String, u32> {
    let mut depths: fnv::FnvHashMap<String, u32> = fnv::FnvHashMap::default();
    for id in graph.topological_order() {
        let depth = graph
            .direct_dependencies(&id)
            .iter()
            .map(|dep| depths.get(dep).copied().unwrap_or(0) + 1)
            .max()
            .unwrap_or(0);
        depths.insert(id, depth);
    }
    depths
}
