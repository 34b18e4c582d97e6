// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![allow(clippy::len_without_is_empty, clippy::too_many_arguments)]

//! The build graph: a DAG of [`Action`]s plus the state machine each node
//! moves through as the Scheduler dispatches it.
//!
//! Structurally this mirrors the adjacency-list-over-`petgraph` shape used
//! elsewhere in this codebase for dependency graphs: node identity lives in
//! an id→index map, the graph itself only ever speaks in indices, and a
//! single lock guards both. Dependents/ancestors are graph walks rather than
//! duplicated bookkeeping.

use std::collections::{BTreeSet, HashSet};

use fnv::FnvHashMap;
use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;

use errors::{BuildError, ErrorKind};

mod action;
mod state;

pub use action::{fingerprint_action, Action, CapabilitySet, Priority};
pub use state::{ActionState, NodeState, MAX_RETRIES};

#[cfg(test)]
mod tests;

struct Node {
    action: Action,
    state: NodeState,
}

/// What a failure/retry caused to happen, so callers (the Scheduler) can
/// react without re-deriving it from separate state reads.
#[derive(Debug)]
pub enum FailOutcome {
    /// Retried locally; back in the Ready state.
    Requeued,
    /// Retries exhausted (or the error was permanent): this action and every
    /// id in the returned list transitioned to `Failed` and will never run.
    Failed(Vec<String>),
}

type PGraph = DiGraph<Node, (), u32>;

struct Inner {
    nodes: FnvHashMap<String, NodeIndex<u32>>,
    pg: PGraph,
}

/// A directed acyclic graph of actions with scheduler-facing state
/// transitions. All mutation goes through a single `RwLock`; the graph
/// itself is not sharded (the Scheduler shards *dispatch*, not graph
/// topology — see the `scheduler` crate).
pub struct BuildGraph {
    inner: parking_lot::RwLock<Inner>,
}

impl Default for BuildGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildGraph {
    pub fn new() -> Self {
        BuildGraph {
            inner: parking_lot::RwLock::new(Inner {
                nodes: FnvHashMap::default(),
                pg: DiGraph::default(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().nodes.len()
    }

    /// Insert a node. Idempotent: inserting the same id twice is equivalent
    /// to inserting it once (invariant 9). The action payload of the first
    /// insertion wins. Rejected at submission (leaving the graph
    /// unchanged) if the action declares an output path that escapes the
    /// sandbox work tree.
    pub fn add_node(&self, action: Action) -> Result<(), BuildError> {
        action.validate()?;
        let mut inner = self.inner.write();
        if inner.nodes.contains_key(&action.id) {
            return Ok(());
        }
        let id = action.id.clone();
        let idx = inner.pg.add_node(Node {
            action,
            state: NodeState::new(0),
        });
        inner.nodes.insert(id, idx);
        Ok(())
    }

    /// Record that `v` consumes an output of `u`. Rejects the edge (and
    /// leaves the graph unchanged) if it would create a cycle.
    pub fn add_edge(&self, u: &str, v: &str) -> Result<(), BuildError> {
        let mut inner = self.inner.write();
        let u_idx = *inner.nodes.get(u).ok_or_else(|| {
            BuildError::new(ErrorKind::TargetNotFound, format!("no such action: {u}"))
        })?;
        let v_idx = *inner.nodes.get(v).ok_or_else(|| {
            BuildError::new(ErrorKind::TargetNotFound, format!("no such action: {v}"))
        })?;

        if u_idx == v_idx {
            return Err(BuildError::new(
                ErrorKind::CircularDependency,
                format!("action {u} cannot depend on itself"),
            ));
        }
        // An edge u -> v would close a cycle exactly when v can already
        // reach u: that existing path plus the new edge would form a loop.
        if has_path_connecting(&inner.pg, v_idx, u_idx, None) {
            return Err(BuildError::new(
                ErrorKind::CircularDependency,
                format!("adding {u} -> {v} would create a cycle"),
            ));
        }

        inner.pg.add_edge(u_idx, v_idx, ());
        let v_node = &inner.pg[v_idx];
        if v_node.state.get() == ActionState::Ready {
            // v just gained its first dependency; it is no longer ready to
            // dispatch until that dependency completes.
            v_node.state.set(ActionState::Pending);
        }
        v_node.state.increment_remaining_deps();
        Ok(())
    }

    /// Remove a node and all of its edges. Returns the removed action, if
    /// any existed.
    pub fn remove_node(&self, id: &str) -> Option<Action> {
        let mut inner = self.inner.write();
        let idx = inner.nodes.remove(id)?;
        let last_idx = NodeIndex::new(inner.pg.node_count() - 1);
        let removed = inner.pg.remove_node(idx).map(|n| n.action);
        if idx != last_idx {
            // petgraph's remove_node swap-removes: whatever used to be the
            // last node is now at `idx`. Fix up its id -> index mapping.
            if let Some(moved) = inner.pg.node_weight(idx) {
                inner.nodes.insert(moved.action.id.clone(), idx);
            }
        }
        removed
    }

    pub fn state_of(&self, id: &str) -> Option<ActionState> {
        let inner = self.inner.read();
        inner.nodes.get(id).map(|idx| inner.pg[*idx].state.get())
    }

    pub fn action(&self, id: &str) -> Option<Action> {
        let inner = self.inner.read();
        inner.nodes.get(id).map(|idx| inner.pg[*idx].action.clone())
    }

    /// Every id currently in the graph, in no particular order. Used by the
    /// Scheduler to size its bookkeeping up front.
    pub fn node_ids(&self) -> Vec<String> {
        let inner = self.inner.read();
        inner.pg.node_weights().map(|n| n.action.id.clone()).collect()
    }

    /// Every id currently in the `Ready` state. The Scheduler calls this
    /// once, at the start of a build, to seed its ready queues; subsequent
    /// readiness changes arrive via `complete`'s return value instead.
    pub fn ready_nodes(&self) -> Vec<String> {
        let inner = self.inner.read();
        inner
            .pg
            .node_weights()
            .filter(|n| n.state.get() == ActionState::Ready)
            .map(|n| n.action.id.clone())
            .collect()
    }

    /// All ids `id` directly depends on (incoming edges). The complement of
    /// `dependents_of`; used to compute each node's depth in the graph.
    pub fn direct_dependencies(&self, id: &str) -> Vec<String> {
        let inner = self.inner.read();
        let Some(idx) = inner.nodes.get(id) else {
            return Vec::new();
        };
        inner
            .pg
            .neighbors_directed(*idx, Direction::Incoming)
            .map(|n| inner.pg[n].action.id.clone())
            .collect()
    }

    /// All ids directly depending on `id` (outgoing edges).
    pub fn dependents_of(&self, id: &str) -> Vec<String> {
        let inner = self.inner.read();
        let Some(idx) = inner.nodes.get(id) else {
            return Vec::new();
        };
        inner
            .pg
            .neighbors_directed(*idx, Direction::Outgoing)
            .map(|n| inner.pg[n].action.id.clone())
            .collect()
    }

    /// All ids `id` transitively depends on (ancestors via incoming edges).
    pub fn all_dependencies(&self, id: &str) -> Vec<String> {
        let inner = self.inner.read();
        let Some(&start) = inner.nodes.get(id) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        let mut stack = vec![start];
        let mut out = BTreeSet::new();
        while let Some(idx) = stack.pop() {
            for parent in inner.pg.neighbors_directed(idx, Direction::Incoming) {
                if seen.insert(parent) {
                    out.insert(inner.pg[parent].action.id.clone());
                    stack.push(parent);
                }
            }
        }
        out.into_iter().collect()
    }

    /// All transitive dependents of `id` (the set that would be Skipped if
    /// `id` failed), not including `id` itself.
    pub fn all_dependents(&self, id: &str) -> Vec<String> {
        let inner = self.inner.read();
        let Some(&start) = inner.nodes.get(id) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        let mut stack = vec![start];
        let mut out = BTreeSet::new();
        while let Some(idx) = stack.pop() {
            for child in inner.pg.neighbors_directed(idx, Direction::Outgoing) {
                if seen.insert(child) {
                    out.insert(inner.pg[child].action.id.clone());
                    stack.push(child);
                }
            }
        }
        out.into_iter().collect()
    }

    /// A topological order over all nodes, stable given the same graph
    /// (ties broken by id) so diagnostic output is reproducible.
    pub fn topological_order(&self) -> Vec<String> {
        let inner = self.inner.read();
        let mut in_degree: FnvHashMap<NodeIndex<u32>, usize> = FnvHashMap::default();
        for idx in inner.pg.node_indices() {
            in_degree.insert(
                idx,
                inner.pg.neighbors_directed(idx, Direction::Incoming).count(),
            );
        }
        let mut frontier: BTreeSet<(String, NodeIndex<u32>)> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&idx, _)| (inner.pg[idx].action.id.clone(), idx))
            .collect();

        let mut order = Vec::with_capacity(inner.pg.node_count());
        while let Some(next) = frontier.iter().next().cloned() {
            let (id, idx) = next;
            frontier.remove(&(id.clone(), idx));
            order.push(id);
            for child in inner.pg.neighbors_directed(idx, Direction::Outgoing) {
                let deg = in_degree.get_mut(&child).unwrap();
                *deg -= 1;
                if *deg == 0 {
                    frontier.insert((inner.pg[child].action.id.clone(), child));
                }
            }
        }
        order
    }

    /// Transition `id` from Ready to Scheduled.
    pub fn transition_to_scheduled(&self, id: &str) -> Result<(), BuildError> {
        self.expect_transition(id, ActionState::Ready, ActionState::Scheduled)
    }

    /// Transition `id` from Scheduled to Executing.
    pub fn transition_to_executing(&self, id: &str) -> Result<(), BuildError> {
        self.expect_transition(id, ActionState::Scheduled, ActionState::Executing)
    }

    fn expect_transition(
        &self,
        id: &str,
        expected: ActionState,
        next: ActionState,
    ) -> Result<(), BuildError> {
        let inner = self.inner.read();
        let idx = *inner.nodes.get(id).ok_or_else(|| {
            BuildError::new(ErrorKind::TargetNotFound, format!("no such action: {id}"))
        })?;
        let node = &inner.pg[idx];
        let current = node.state.get();
        if current != expected {
            return Err(BuildError::new(
                ErrorKind::Internal,
                format!("cannot move {id} from {current:?} to {next:?}: expected {expected:?}"),
            ));
        }
        node.state.set(next);
        Ok(())
    }

    /// Mark `id` Completed, decrement each dependent's `remaining_deps`, and
    /// return the ids that became Ready as a result.
    pub fn complete(&self, id: &str) -> Result<Vec<String>, BuildError> {
        let inner = self.inner.read();
        let idx = *inner.nodes.get(id).ok_or_else(|| {
            BuildError::new(ErrorKind::TargetNotFound, format!("no such action: {id}"))
        })?;
        inner.pg[idx].state.set(ActionState::Completed);

        let mut newly_ready = Vec::new();
        for dep_idx in inner.pg.neighbors_directed(idx, Direction::Outgoing) {
            let dep = &inner.pg[dep_idx];
            if dep.state.get().is_terminal() {
                continue;
            }
            if dep.state.decrement_remaining_deps() {
                dep.state.set(ActionState::Ready);
                newly_ready.push(dep.action.id.clone());
            }
        }
        Ok(newly_ready)
    }

    /// Report a failure for `id`. If `transient` and retries remain, `id`
    /// returns to Ready with its retry counter incremented. Otherwise `id`
    /// and every transitive dependent become Failed.
    pub fn fail(&self, id: &str, transient: bool) -> Result<FailOutcome, BuildError> {
        {
            let inner = self.inner.read();
            let idx = *inner.nodes.get(id).ok_or_else(|| {
                BuildError::new(ErrorKind::TargetNotFound, format!("no such action: {id}"))
            })?;
            let node = &inner.pg[idx];
            if transient && node.state.retries() < MAX_RETRIES {
                node.state.increment_retries();
                node.state.set(ActionState::Ready);
                return Ok(FailOutcome::Requeued);
            }
            node.state.set(ActionState::Failed);
        }
        let propagated = self.propagate_failure(id);
        Ok(FailOutcome::Failed(propagated))
    }

    fn propagate_failure(&self, id: &str) -> Vec<String> {
        let inner = self.inner.read();
        let Some(&start) = inner.nodes.get(id) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut stack = vec![start];
        let mut seen = HashSet::new();
        while let Some(idx) = stack.pop() {
            for child in inner.pg.neighbors_directed(idx, Direction::Outgoing) {
                if seen.insert(child) {
                    let node = &inner.pg[child];
                    if !node.state.get().is_terminal() {
                        node.state.set(ActionState::Failed);
                    }
                    out.push(node.action.id.clone());
                    stack.push(child);
                }
            }
        }
        out
    }

    /// All actions currently assigned to a dead worker return to Ready with
    /// retries incremented; any that exceed the retry cap become Failed
    /// (and propagate). Returns the combined list of newly Failed ids.
    pub fn reassign_from_dead_worker(&self, assigned_ids: &[String]) -> Vec<String> {
        let mut failed = Vec::new();
        for id in assigned_ids {
            if let Ok(FailOutcome::Failed(mut propagated)) = self.fail(id, true) {
                failed.push(id.clone());
                failed.append(&mut propagated);
            }
        }
        failed
    }
}
