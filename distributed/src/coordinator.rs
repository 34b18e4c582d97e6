// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The coordinator side of the distributed layer: a gRPC server workers
//! Register with, send Heartbeats to, and report Results to, plus a
//! [`scheduler::WorkerPool`] implementation ([`RemoteWorkerPool`]) that lets
//! an ordinary [`scheduler::Scheduler`] dispatch across the registered
//! fleet exactly as it would to a [`scheduler::LocalWorkerPool`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use build_graph::Action;
use cas::ContentAddressableStore;
use errors::{BuildError, ErrorKind};
use sandbox::ExecutionOutcome;
use scheduler::WorkerPool;
use workunit_store::{WorkunitOutcome, WorkunitStore};

use crate::protocol;
use crate::proto;
use crate::registry::WorkerRegistry;

/// Assignment streams are bounded so a worker that stops pulling messages
/// (e.g. it died but hasn't been reaped yet) applies backpressure rather
/// than letting the coordinator's send buffer grow without limit.
const ASSIGNMENT_CHANNEL_CAPACITY: usize = 64;

/// Shared state backing both the gRPC service and the [`RemoteWorkerPool`].
/// Kept separate from the tonic-generated service struct so a caller that
/// only wants to dispatch (and serves the gRPC endpoint elsewhere, or not
/// at all, e.g. in a test) can hold just this.
pub struct CoordinatorState {
    registry: WorkerRegistry,
    cas: Arc<dyn ContentAddressableStore>,
    pending: Mutex<HashMap<String, oneshot::Sender<Result<ExecutionOutcome, BuildError>>>>,
    assignment_channels: RwLock<HashMap<String, mpsc::Sender<Result<proto::AssignMessage, Status>>>>,
    workunits: Option<WorkunitStore>,
}

impl CoordinatorState {
    pub fn new(cas: Arc<dyn ContentAddressableStore>, stale_threshold: Duration, workunits: Option<WorkunitStore>) -> Arc<CoordinatorState> {
        Arc::new(CoordinatorState {
            registry: WorkerRegistry::new(stale_threshold),
            cas,
            pending: Mutex::new(HashMap::new()),
            assignment_channels: RwLock::new(HashMap::new()),
            workunits,
        })
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// Assign `action` to the least-loaded registered worker and await its
    /// result, up to the action's own declared timeout plus a fixed grace
    /// period for network overhead. Forms the body of
    /// [`RemoteWorkerPool::dispatch`].
    pub async fn dispatch(&self, action: Action) -> Result<ExecutionOutcome, BuildError> {
        let workunit = self
            .workunits
            .as_ref()
            .map(|store| store.start_workunit("distributed::dispatch", log::Level::Debug, None));

        let result = self.dispatch_inner(action).await;

        if let Some(w) = workunit {
            let outcome = if result.is_ok() { WorkunitOutcome::Success } else { WorkunitOutcome::Failure };
            w.complete(outcome, HashMap::new());
        }
        result
    }

    async fn dispatch_inner(&self, action: Action) -> Result<ExecutionOutcome, BuildError> {
        let worker_id = self
            .registry
            .pick_worker()
            .ok_or_else(|| BuildError::new(ErrorKind::WorkerUnreachable, "no workers are registered with the coordinator"))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(action.id.clone(), tx);
        self.registry.record_assignment(&worker_id, &action.id);

        let timeout = action.capabilities.timeout + Duration::from_secs(5);
        let assign = proto::AssignMessage {
            action: Some(protocol::action_to_spec(&action)),
            input_refs: Vec::new(),
        };

        let sent = {
            let channels = self.assignment_channels.read();
            match channels.get(&worker_id) {
                Some(channel) => channel.send(Ok(assign)).await.is_ok(),
                None => false,
            }
        };
        if !sent {
            self.pending.lock().remove(&action.id);
            self.registry.record_completion(&worker_id, &action.id);
            return Err(BuildError::new(
                ErrorKind::WorkerUnreachable,
                format!("worker {worker_id} has no open assignment stream"),
            ));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                self.pending.lock().remove(&action.id);
                Err(BuildError::new(
                    ErrorKind::WorkerUnreachable,
                    format!("worker {worker_id} disconnected before reporting a result for {}", action.id),
                ))
            }
            Err(_) => {
                self.pending.lock().remove(&action.id);
                Err(BuildError::new(
                    ErrorKind::ActionTimeout,
                    format!("no result for {} from {worker_id} within {timeout:?}", action.id),
                ))
            }
        }
    }

    fn complete_pending(&self, action_id: &str, result: Result<ExecutionOutcome, BuildError>) {
        if let Some(tx) = self.pending.lock().remove(action_id) {
            let _ = tx.send(result);
        }
    }

    /// Evict workers that have gone stale and unblock any dispatch awaiting
    /// a result from them, so the scheduler's own retry/failure handling
    /// (triggered by the `Err` this produces) takes over without having to
    /// wait out the full per-action timeout. Intended to be called from a
    /// periodic background task; see [`crate::serve_coordinator`].
    pub fn reap_stale_workers(&self) {
        for (worker_id, assigned) in self.registry.evict_stale() {
            log::warn!("worker {worker_id} missed its heartbeat deadline; reassigning {} action(s)", assigned.len());
            for action_id in assigned {
                self.complete_pending(
                    &action_id,
                    Err(BuildError::new(
                        ErrorKind::WorkerUnreachable,
                        format!("worker {worker_id} went stale while executing {action_id}"),
                    )),
                );
            }
        }
    }
}

/// A [`scheduler::WorkerPool`] that dispatches across the coordinator's
/// registered fleet instead of a local sandbox.
pub struct RemoteWorkerPool {
    state: Arc<CoordinatorState>,
}

impl RemoteWorkerPool {
    pub fn new(state: Arc<CoordinatorState>) -> Self {
        RemoteWorkerPool { state }
    }
}

#[async_trait]
impl WorkerPool for RemoteWorkerPool {
    async fn dispatch(&self, action: Action) -> Result<ExecutionOutcome, BuildError> {
        self.state.dispatch(action).await
    }
}

/// The tonic service; thin by design, delegating everything stateful to
/// [`CoordinatorState`].
pub struct CoordinatorService {
    state: Arc<CoordinatorState>,
}

impl CoordinatorService {
    pub fn new(state: Arc<CoordinatorState>) -> Self {
        CoordinatorService { state }
    }
}

#[async_trait]
impl proto::coordinator_server::Coordinator for CoordinatorService {
    type AssignmentsStream = ReceiverStream<Result<proto::AssignMessage, Status>>;

    async fn register(&self, request: Request<proto::RegisterRequest>) -> Result<Response<proto::RegisterResponse>, Status> {
        let req = request.into_inner();
        self.state.registry.register(
            req.worker_id.clone(),
            req.address,
            req.capabilities.unwrap_or_default(),
        );
        log::info!("worker {} registered", req.worker_id);
        Ok(Response::new(proto::RegisterResponse {
            accepted: true,
            stale_threshold_millis: crate::registry::DEFAULT_STALE_THRESHOLD.as_millis() as u64,
        }))
    }

    async fn heartbeat(&self, request: Request<proto::HeartbeatRequest>) -> Result<Response<proto::HeartbeatResponse>, Status> {
        let req = request.into_inner();
        let acknowledged = self.state.registry.heartbeat(&req.worker_id, req.queue_depth, req.load_factor);
        Ok(Response::new(proto::HeartbeatResponse { acknowledged }))
    }

    async fn assignments(
        &self,
        request: Request<proto::RegisterRequest>,
    ) -> Result<Response<Self::AssignmentsStream>, Status> {
        let req = request.into_inner();
        let (tx, rx) = mpsc::channel(ASSIGNMENT_CHANNEL_CAPACITY);
        self.state.assignment_channels.write().insert(req.worker_id.clone(), tx);
        if !self.state.registry.heartbeat(&req.worker_id, 0, 0.0) {
            self.state.registry.register(req.worker_id, req.address, req.capabilities.unwrap_or_default());
        }
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn report_result(&self, request: Request<proto::ResultRequest>) -> Result<Response<proto::ResultResponse>, Status> {
        let req = request.into_inner();
        let result = protocol::outcome_from_proto(req.outcome.unwrap_or_default());
        self.state.registry.record_completion(&req.worker_id, &req.action_id);
        self.state.complete_pending(&req.action_id, result);
        Ok(Response::new(proto::ResultResponse { acknowledged: true }))
    }

    async fn fetch(&self, request: Request<proto::FetchRequest>) -> Result<Response<proto::FetchResponse>, Status> {
        let req = request.into_inner();
        let digest = protocol::digest_from_bytes(&req.digest).map_err(|e| Status::invalid_argument(e.to_string()))?;
        match self.state.cas.get(digest).await {
            Ok(Some(bytes)) => Ok(Response::new(proto::FetchResponse { bytes, found: true })),
            Ok(None) => Ok(Response::new(proto::FetchResponse { bytes: Bytes::new(), found: false })),
            Err(e) => Err(Status::internal(e.to_string())),
        }
    }

    async fn store(&self, request: Request<proto::StoreRequest>) -> Result<Response<proto::StoreResponse>, Status> {
        let req = request.into_inner();
        self.state.cas.put(req.bytes).await.map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(proto::StoreResponse { stored: true }))
    }
}
