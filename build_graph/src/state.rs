use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// A node's position in the Action State Machine. See `BuildGraph` for the
/// transitions this type participates in.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ActionState {
    Pending,
    Ready,
    Scheduled,
    Executing,
    Completed,
    Failed,
}

impl ActionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ActionState::Completed | ActionState::Failed)
    }
}

/// Maximum number of times a transiently-failed action is retried before it
/// is converted to a permanent `Failed` state.
pub const MAX_RETRIES: u32 = 3;

/// Per-node bookkeeping the graph mutates as actions progress. `state` is
/// guarded by the owning `BuildGraph`'s lock; the counters are atomics
/// purely so that the Scheduler (which shares a read guard across many
/// dependents) can decrement them without escalating to a write lock.
pub struct NodeState {
    state: std::sync::Mutex<ActionState>,
    remaining_deps: AtomicUsize,
    retries: AtomicU32,
}

impl NodeState {
    pub fn new(incoming_edges: usize) -> Self {
        let initial = if incoming_edges == 0 {
            ActionState::Ready
        } else {
            ActionState::Pending
        };
        NodeState {
            state: std::sync::Mutex::new(initial),
            remaining_deps: AtomicUsize::new(incoming_edges),
            retries: AtomicU32::new(0),
        }
    }

    pub fn get(&self) -> ActionState {
        *self.state.lock().unwrap()
    }

    pub fn set(&self, new_state: ActionState) {
        *self.state.lock().unwrap() = new_state;
    }

    pub fn remaining_deps(&self) -> usize {
        self.remaining_deps.load(Ordering::SeqCst)
    }

    /// Record a newly added incoming edge.
    pub fn increment_remaining_deps(&self) {
        self.remaining_deps.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrement the dependency counter, returning `true` if this was the
    /// transition to zero (the caller should move the node to `Ready`).
    pub fn decrement_remaining_deps(&self) -> bool {
        let prev = self.remaining_deps.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "remaining_deps underflow");
        prev == 1
    }

    pub fn retries(&self) -> u32 {
        self.retries.load(Ordering::SeqCst)
    }

    /// Increment the retry counter, returning the new value.
    pub fn increment_retries(&self) -> u32 {
        self.retries.fetch_add(1, Ordering::SeqCst) + 1
    }
}
