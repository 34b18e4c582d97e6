// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The coordinator's view of its workers: who's registered, how loaded they
//! are, and which ones have gone quiet long enough to be declared dead.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::proto;

/// Default staleness threshold: a worker that hasn't heartbeat in this long
/// is presumed dead and its in-flight actions are reassigned.
pub const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct WorkerInfo {
    pub address: String,
    pub capabilities: proto::Capabilities,
    pub queue_depth: u32,
    pub load_factor: f32,
    pub assigned: HashSet<String>,
    last_heartbeat: Instant,
}

/// Fine-grained reader-writer lock over a lookup-heavy index, per the
/// concurrency model's guidance for peer registries.
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, WorkerInfo>>,
    stale_threshold: Duration,
}

impl WorkerRegistry {
    pub fn new(stale_threshold: Duration) -> Self {
        WorkerRegistry {
            workers: RwLock::new(HashMap::new()),
            stale_threshold,
        }
    }

    pub fn register(&self, worker_id: String, address: String, capabilities: proto::Capabilities) {
        self.workers.write().insert(
            worker_id,
            WorkerInfo {
                address,
                capabilities,
                queue_depth: 0,
                load_factor: 0.0,
                assigned: HashSet::new(),
                last_heartbeat: Instant::now(),
            },
        );
    }

    pub fn heartbeat(&self, worker_id: &str, queue_depth: u32, load_factor: f32) -> bool {
        let mut workers = self.workers.write();
        match workers.get_mut(worker_id) {
            Some(info) => {
                info.queue_depth = queue_depth;
                info.load_factor = load_factor;
                info.last_heartbeat = Instant::now();
                true
            }
            None => false,
        }
    }

    /// The least-loaded currently-registered worker, or `None` if there are
    /// no workers to dispatch to.
    pub fn pick_worker(&self) -> Option<String> {
        self.workers
            .read()
            .iter()
            .min_by(|(_, a), (_, b)| {
                a.queue_depth
                    .cmp(&b.queue_depth)
                    .then_with(|| a.load_factor.partial_cmp(&b.load_factor).unwrap_or(std::cmp::Ordering::Equal))
            })
            .map(|(id, _)| id.clone())
    }

    pub fn record_assignment(&self, worker_id: &str, action_id: &str) {
        if let Some(info) = self.workers.write().get_mut(worker_id) {
            info.assigned.insert(action_id.to_string());
        }
    }

    pub fn record_completion(&self, worker_id: &str, action_id: &str) {
        if let Some(info) = self.workers.write().get_mut(worker_id) {
            info.assigned.remove(action_id);
        }
    }

    /// Workers whose last heartbeat is older than the stale threshold.
    /// Evicts them from the registry and returns `(worker_id, assigned_ids)`
    /// for each so the caller can reassign their in-flight work.
    pub fn evict_stale(&self) -> Vec<(String, Vec<String>)> {
        let now = Instant::now();
        let mut workers = self.workers.write();
        let stale: Vec<String> = workers
            .iter()
            .filter(|(_, info)| now.duration_since(info.last_heartbeat) > self.stale_threshold)
            .map(|(id, _)| id.clone())
            .collect();

        stale
            .into_iter()
            .map(|id| {
                let info = workers.remove(&id).expect("id came from this same map");
                (id, info.assigned.into_iter().collect())
            })
            .collect()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.read().len()
    }
}
