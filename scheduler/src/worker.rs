// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use async_trait::async_trait;

use build_graph::Action;
use cas::ContentAddressableStore;
use errors::BuildError;
use sandbox::{ExecutionOutcome, SandboxExecutor};

/// Where the Scheduler sends an action once it has a worker slot for it.
/// Implemented locally by [`LocalWorkerPool`]; the `distributed` crate
/// implements this trait over the network to hand actions to remote
/// workers, so the Scheduler itself never needs to know which it's talking
/// to.
#[async_trait]
pub trait WorkerPool: Send + Sync {
    async fn dispatch(&self, action: Action) -> Result<ExecutionOutcome, BuildError>;
}

/// Runs every dispatched action in a local sandbox on this host.
pub struct LocalWorkerPool {
    sandbox: Arc<dyn SandboxExecutor>,
    cas: Arc<dyn ContentAddressableStore>,
}

impl LocalWorkerPool {
    pub fn new(sandbox: Arc<dyn SandboxExecutor>, cas: Arc<dyn ContentAddressableStore>) -> Self {
        LocalWorkerPool { sandbox, cas }
    }
}

#[async_trait]
impl WorkerPool for LocalWorkerPool {
    async fn dispatch(&self, action: Action) -> Result<ExecutionOutcome, BuildError> {
        self.sandbox.execute(&action, self.cas.as_ref()).await
    }
}
