// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! A concurrency bound keyed off each action's declared CPU capability,
//! independent of however many actions the Scheduler believes are currently
//! dispatchable. The Scheduler schedules against its own view of worker
//! slots; this is the last line of defense against over-subscribing the
//! host this sandbox actually runs on.

use std::sync::Arc;

use errors::{BuildError, ErrorKind};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub struct CapacitySemaphore {
    semaphore: Arc<Semaphore>,
    total_cpu: u32,
}

/// Held for the lifetime of one action's execution. Dropping it returns its
/// weight to the semaphore.
pub struct CapacityPermit(#[allow(dead_code)] OwnedSemaphorePermit);

impl CapacitySemaphore {
    pub fn new(total_cpu: u32) -> Self {
        CapacitySemaphore {
            semaphore: Arc::new(Semaphore::new(total_cpu.max(1) as usize)),
            total_cpu: total_cpu.max(1),
        }
    }

    /// Acquire `weight` units of CPU capacity, clamped to the host total so
    /// that a single action declaring more cores than the host has doesn't
    /// deadlock every other action behind it.
    pub async fn acquire(&self, weight: Option<u32>) -> Result<CapacityPermit, BuildError> {
        let weight = weight.unwrap_or(1).clamp(1, self.total_cpu);
        let permit = self
            .semaphore
            .clone()
            .acquire_many_owned(weight)
            .await
            .map_err(|e| BuildError::new(ErrorKind::Internal, format!("sandbox capacity semaphore closed: {e}")))?;
        Ok(CapacityPermit(permit))
    }
}
