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

//! Opt-in telemetry: hierarchical "workunits" (named spans with a start/end
//! time, an outcome, and a handful of metrics) recorded for graph builds,
//! cache lookups, sandbox executions, and RPCs. Completed workunits drain
//! into a bounded in-memory ring buffer that a CLI collaborator can read
//! back out; this is deliberately not a UI, just a recorder.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

pub use log::Level;
pub use metrics::{Metric, ObservationMetric};
use parking_lot::Mutex;
use rand::Rng;
use tokio::task_local;

mod metrics;
#[cfg(test)]
mod tests;

/// Identifies a single run of the engine; not comparable across processes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RunId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct SpanId(u64);

impl SpanId {
    pub fn new() -> SpanId {
        SpanId(rand::thread_rng().gen())
    }
}

impl std::fmt::Display for SpanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkunitState {
    Started,
    Completed { result: WorkunitOutcome },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkunitOutcome {
    Success,
    Failure,
}

/// A single named span: when it started, how long it ran (once complete),
/// and the metrics attached to it.
#[derive(Clone, Debug)]
pub struct Workunit {
    pub span_id: SpanId,
    pub parent_id: Option<SpanId>,
    pub name: &'static str,
    pub level: Level,
    pub start_time: SystemTime,
    pub duration: Option<Duration>,
    pub state: WorkunitState,
    pub metadata: HashMap<&'static str, String>,
}

struct StoreInner {
    running: HashMap<SpanId, Workunit>,
    completed: VecDeque<Workunit>,
    capacity: usize,
}

/// The store backing a single engine process. Cheaply `Clone`-able; all
/// clones share the same underlying buffer.
#[derive(Clone)]
pub struct WorkunitStore {
    inner: Arc<Mutex<StoreInner>>,
    run_id: RunId,
}

impl WorkunitStore {
    pub fn new(run_id: RunId, capacity: usize) -> WorkunitStore {
        WorkunitStore {
            inner: Arc::new(Mutex::new(StoreInner {
                running: HashMap::new(),
                completed: VecDeque::with_capacity(capacity.min(4096)),
                capacity,
            })),
            run_id,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Start a new workunit and return a handle to complete it.
    pub fn start_workunit(
        &self,
        name: &'static str,
        level: Level,
        parent_id: Option<SpanId>,
    ) -> RunningWorkunit {
        let span_id = SpanId::new();
        let workunit = Workunit {
            span_id,
            parent_id,
            name,
            level,
            start_time: SystemTime::now(),
            duration: None,
            state: WorkunitState::Started,
            metadata: HashMap::new(),
        };
        self.inner.lock().running.insert(span_id, workunit);
        RunningWorkunit {
            store: self.clone(),
            span_id,
        }
    }

    fn complete(&self, span_id: SpanId, outcome: WorkunitOutcome, metadata: HashMap<&'static str, String>) {
        let mut inner = self.inner.lock();
        let Some(mut workunit) = inner.running.remove(&span_id) else {
            return;
        };
        workunit.duration = SystemTime::now().duration_since(workunit.start_time).ok();
        workunit.state = WorkunitState::Completed { result: outcome };
        workunit.metadata.extend(metadata);
        if inner.completed.len() >= inner.capacity {
            inner.completed.pop_front();
        }
        inner.completed.push_back(workunit);
    }

    /// Snapshot of every workunit the ring buffer currently retains, oldest
    /// first.
    pub fn completed_workunits(&self) -> Vec<Workunit> {
        self.inner.lock().completed.iter().cloned().collect()
    }

    pub fn running_workunits(&self) -> Vec<Workunit> {
        self.inner.lock().running.values().cloned().collect()
    }
}

/// A workunit that has been started but not yet completed. Complete it
/// explicitly with [`Self::complete`]; dropping it without completing marks
/// it as failed, so a panicking or early-returning caller never leaves a
/// phantom "still running" entry behind.
pub struct RunningWorkunit {
    store: WorkunitStore,
    span_id: SpanId,
}

impl RunningWorkunit {
    pub fn span_id(&self) -> SpanId {
        self.span_id
    }

    pub fn complete(self, outcome: WorkunitOutcome, metadata: HashMap<&'static str, String>) {
        self.store.complete(self.span_id, outcome, metadata);
        std::mem::forget(self);
    }
}

impl Drop for RunningWorkunit {
    fn drop(&mut self) {
        self.store
            .complete(self.span_id, WorkunitOutcome::Failure, HashMap::new());
    }
}

task_local! {
    static WORKUNIT_STORE_HANDLE: Option<(WorkunitStore, Option<SpanId>)>;
}

thread_local! {
    static BLOCKING_WORKUNIT_STORE_HANDLE: std::cell::RefCell<Option<(WorkunitStore, Option<SpanId>)>> =
        const { std::cell::RefCell::new(None) };
}

/// Handle carried across a `task_executor::Executor::spawn` boundary so a
/// workunit opened inside the spawned future nests under the right parent.
pub type WorkunitStoreHandle = Option<(WorkunitStore, Option<SpanId>)>;

pub fn get_workunit_store_handle() -> WorkunitStoreHandle {
    WORKUNIT_STORE_HANDLE
        .try_with(|handle| handle.clone())
        .unwrap_or_else(|_| BLOCKING_WORKUNIT_STORE_HANDLE.with(|h| h.borrow().clone()))
}

/// Set the handle for the current (blocking) thread. Used by
/// `task_executor::Executor::spawn_blocking`, whose closures run on a
/// dedicated thread outside of any tokio task-local scope.
pub fn set_thread_workunit_store_handle(handle: WorkunitStoreHandle) {
    BLOCKING_WORKUNIT_STORE_HANDLE.with(|h| *h.borrow_mut() = handle);
}

pub async fn scope_task_workunit_store_handle<F: std::future::Future>(
    handle: WorkunitStoreHandle,
    f: F,
) -> F::Output {
    WORKUNIT_STORE_HANDLE.scope(handle, f).await
}
