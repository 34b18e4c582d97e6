// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The worker side of the distributed layer: connects to a coordinator,
//! pulls action assignments off a server-streamed channel, executes them
//! in a local sandbox, and reports results back. Also runs the peer-to-peer
//! work-stealing loop described in `4.H Distributed Layer`: idle workers
//! announce their load to a small set of known peers and steal from the
//! busiest one rather than waiting on the coordinator to rebalance.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tonic::transport::Channel;
use tonic::{Request, Response, Status};

use cas::ContentAddressableStore;
use sandbox::SandboxExecutor;
use workunit_store::{Metric, WorkunitOutcome, WorkunitStore};

use crate::protocol;
use crate::proto;
use crate::retry::retry_call;
use crate::stealing::{self, PeerStat, StealConfig};

/// How often a worker sends a heartbeat to the coordinator. Must be
/// comfortably under [`crate::registry::DEFAULT_STALE_THRESHOLD`].
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(5);
const STEAL_CHECK_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Address this worker's `Peer` service is reachable at, advertised to
    /// other workers so they can steal from it.
    pub peer_address: String,
    pub coordinator_address: String,
    pub capabilities: proto::Capabilities,
    pub min_local_queue: u32,
    pub steal_config: StealConfig,
}

/// Tracks what a worker knows about its peers from their `Announce` calls,
/// used as the candidate pool for [`stealing::choose_victim`].
#[derive(Default)]
struct PeerTable {
    addresses: HashMap<String, String>,
    stats: HashMap<String, PeerStat>,
}

impl PeerTable {
    fn observe(&mut self, worker_id: String, address: String, queue_depth: u32, load_factor: f32) {
        self.addresses.insert(worker_id.clone(), address);
        self.stats.insert(
            worker_id.clone(),
            PeerStat {
                worker_id,
                queue_depth,
                load_factor,
            },
        );
    }

    fn snapshot(&self) -> Vec<PeerStat> {
        self.stats.values().cloned().collect()
    }

    fn address_of(&self, worker_id: &str) -> Option<String> {
        self.addresses.get(worker_id).cloned()
    }
}

/// A single worker process: owns a local FIFO of pending assignments (fed
/// by the coordinator or by peers stealing *from* it going the other way
/// would be wrong -- this queue only ever grows from the coordinator or
/// shrinks via steals performed *against* it), executes them, and reports
/// results.
pub struct Worker {
    config: WorkerConfig,
    executor: task_executor::Executor,
    sandbox: Arc<dyn SandboxExecutor>,
    cas: Arc<dyn ContentAddressableStore>,
    queue: Arc<Mutex<VecDeque<proto::AssignMessage>>>,
    peers: Arc<Mutex<PeerTable>>,
    load_factor: Arc<AtomicU32>,
    workunits: Option<WorkunitStore>,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        executor: task_executor::Executor,
        sandbox: Arc<dyn SandboxExecutor>,
        cas: Arc<dyn ContentAddressableStore>,
        workunits: Option<WorkunitStore>,
    ) -> Self {
        Worker {
            config,
            executor,
            sandbox,
            cas,
            queue: Arc::new(Mutex::new(VecDeque::new())),
            peers: Arc::new(Mutex::new(PeerTable::default())),
            load_factor: Arc::new(AtomicU32::new(0)),
            workunits,
        }
    }

    fn queue_depth(&self) -> u32 {
        self.queue.lock().len() as u32
    }

    fn load_factor_bits(&self) -> f32 {
        f32::from_bits(self.load_factor.load(Ordering::Relaxed))
    }

    fn set_load_factor(&self, value: f32) {
        self.load_factor.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Runs forever, driving the assignment-consumption loop, the
    /// heartbeat loop, and the steal loop concurrently. Returns only on a
    /// fatal connection failure to the coordinator.
    pub async fn run(self: Arc<Self>) -> Result<(), tonic::transport::Error> {
        let channel = Channel::from_shared(self.config.coordinator_address.clone())
            .expect("coordinator address must be a valid URI")
            .connect()
            .await?;
        let mut client = proto::coordinator_client::CoordinatorClient::new(channel);

        client
            .register(Request::new(proto::RegisterRequest {
                worker_id: self.config.worker_id.clone(),
                address: self.config.peer_address.clone(),
                capabilities: Some(self.config.capabilities.clone()),
            }))
            .await?;
        log::info!("worker {} registered with coordinator {}", self.config.worker_id, self.config.coordinator_address);

        let heartbeats = self.executor.native_spawn(self.clone().heartbeat_loop(client.clone()));
        let announces = self.executor.native_spawn(self.clone().announce_loop());
        let steals = self.executor.native_spawn(self.clone().steal_loop());
        let assignments = self.clone().assignment_loop(client);

        tokio::select! {
            result = assignments => { let _ = result; }
            _ = heartbeats => {}
            _ = announces => {}
            _ = steals => {}
        }
        Ok(())
    }

    async fn assignment_loop(self: Arc<Self>, mut client: proto::coordinator_client::CoordinatorClient<Channel>) {
        let request = proto::RegisterRequest {
            worker_id: self.config.worker_id.clone(),
            address: self.config.peer_address.clone(),
            capabilities: Some(self.config.capabilities.clone()),
        };
        let mut stream = match client.assignments(Request::new(request)).await {
            Ok(response) => response.into_inner(),
            Err(status) => {
                log::error!("failed to open assignment stream: {status}");
                return;
            }
        };

        loop {
            match stream.message().await {
                Ok(Some(assign)) => {
                    self.queue.lock().push_back(assign);
                    self.drain_queue(&mut client).await;
                }
                Ok(None) => {
                    log::warn!("coordinator closed the assignment stream for worker {}", self.config.worker_id);
                    return;
                }
                Err(status) => {
                    log::error!("assignment stream error for worker {}: {status}", self.config.worker_id);
                    return;
                }
            }
        }
    }

    /// Executes every assignment currently queued, reporting each result
    /// back to the coordinator as it completes.
    async fn drain_queue(&self, client: &mut proto::coordinator_client::CoordinatorClient<Channel>) {
        loop {
            let assign = {
                let mut queue = self.queue.lock();
                queue.pop_front()
            };
            let Some(assign) = assign else { break };
            let Some(spec) = assign.action else { continue };
            let action_id = spec.action_id.clone();

            let outcome = match protocol::spec_to_action(spec) {
                Ok(action) => self.sandbox.execute(&action, self.cas.as_ref()).await,
                Err(err) => Err(err),
            };

            let proto_outcome = match &outcome {
                Ok(outcome) => protocol::outcome_to_proto(outcome),
                Err(err) => protocol::failure_to_proto(err),
            };

            let report = proto::ResultRequest {
                worker_id: self.config.worker_id.clone(),
                action_id,
                outcome: Some(proto_outcome),
            };

            let workunit = self
                .workunits
                .as_ref()
                .map(|store| store.start_workunit("distributed::report_result", log::Level::Debug, None));
            let attempts = AtomicU32::new(0);
            let result = retry_call(client.clone(), |mut c| {
                attempts.fetch_add(1, Ordering::Relaxed);
                let report = report.clone();
                async move { c.report_result(Request::new(report)).await }
            })
            .await;

            if let Some(w) = workunit {
                let outcome = if result.is_ok() { WorkunitOutcome::Success } else { WorkunitOutcome::Failure };
                let mut metadata = HashMap::new();
                if attempts.load(Ordering::Relaxed) > 1 {
                    metadata.insert("metric", Metric::DistributedRpcRetries.as_str().to_string());
                }
                w.complete(outcome, metadata);
            }
            if let Err(status) = result {
                log::error!("failed to report result for {}: {status}", report.action_id);
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, mut client: proto::coordinator_client::CoordinatorClient<Channel>) {
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            interval.tick().await;
            let request = proto::HeartbeatRequest {
                worker_id: self.config.worker_id.clone(),
                queue_depth: self.queue_depth(),
                load_factor: self.load_factor_bits(),
            };
            if let Err(status) = client.heartbeat(Request::new(request)).await {
                log::warn!("heartbeat to coordinator failed: {status}");
            }
        }
    }

    /// Periodically tells every known peer this worker's current load, so
    /// that a peer running short on work can pick us as a steal target.
    /// The coordinator never sees this traffic; it flows worker-to-worker.
    async fn announce_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(ANNOUNCE_INTERVAL);
        loop {
            interval.tick().await;
            let addresses: Vec<String> = self.peers.lock().addresses.values().cloned().collect();
            for address in addresses {
                let request = proto::AnnounceRequest {
                    worker_id: self.config.worker_id.clone(),
                    queue_depth: self.queue_depth(),
                    load_factor: self.load_factor_bits(),
                };
                if let Err(status) = self.announce_to(&address, request).await {
                    log::debug!("announce to {address} failed: {status}");
                }
            }
        }
    }

    async fn announce_to(&self, address: &str, request: proto::AnnounceRequest) -> Result<(), Status> {
        let channel = Channel::from_shared(address.to_string())
            .map_err(|e| Status::invalid_argument(e.to_string()))?
            .connect()
            .await
            .map_err(|e| Status::unavailable(e.to_string()))?;
        proto::peer_client::PeerClient::new(channel).announce(Request::new(request)).await?;
        Ok(())
    }

    /// Periodically attempts to steal work from the busiest known peer
    /// when this worker's own queue has run dry. Peer stats come from
    /// whatever peers have `Announce`d to us; a worker with no known peers
    /// simply never steals.
    async fn steal_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(STEAL_CHECK_INTERVAL);
        loop {
            interval.tick().await;
            if self.queue_depth() >= self.config.min_local_queue {
                continue;
            }
            let peers = self.peers.lock().snapshot();
            let Some(victim_id) = stealing::choose_victim(&peers, &self.config.steal_config) else {
                continue;
            };
            let Some(address) = self.peers.lock().address_of(&victim_id) else {
                continue;
            };

            let workunit = self
                .workunits
                .as_ref()
                .map(|store| store.start_workunit("distributed::steal", log::Level::Debug, None));

            match self.try_steal_from(&address).await {
                Ok(stolen) if !stolen.is_empty() => {
                    log::debug!("worker {} stole {} action(s) from {victim_id}", self.config.worker_id, stolen.len());
                    self.queue.lock().extend(stolen);
                    if let Some(w) = workunit {
                        let mut metadata = HashMap::new();
                        metadata.insert("metric", Metric::WorkStealSuccesses.as_str().to_string());
                        w.complete(WorkunitOutcome::Success, metadata);
                    }
                }
                Ok(_) => {
                    if let Some(w) = workunit {
                        let mut metadata = HashMap::new();
                        metadata.insert("metric", Metric::WorkStealAttempts.as_str().to_string());
                        w.complete(WorkunitOutcome::Success, metadata);
                    }
                }
                Err(status) => {
                    log::debug!("steal attempt against {victim_id} failed: {status}");
                    if let Some(w) = workunit {
                        let mut metadata = HashMap::new();
                        metadata.insert("metric", Metric::WorkStealAttempts.as_str().to_string());
                        w.complete(WorkunitOutcome::Failure, metadata);
                    }
                }
            }
        }
    }

    async fn try_steal_from(&self, address: &str) -> Result<Vec<proto::AssignMessage>, Status> {
        let channel = Channel::from_shared(address.to_string())
            .map_err(|e| Status::invalid_argument(e.to_string()))?
            .connect()
            .await
            .map_err(|e| Status::unavailable(e.to_string()))?;
        let mut client = proto::peer_client::PeerClient::new(channel);
        let response = client
            .steal(Request::new(proto::StealRequest {
                thief_worker_id: self.config.worker_id.clone(),
                count: self.config.min_local_queue.max(1),
            }))
            .await?;
        Ok(response.into_inner().stolen)
    }
}

/// The `Peer` gRPC service a worker exposes so others can announce their
/// load to it and steal work from it.
pub struct PeerService {
    worker: Arc<Worker>,
}

impl PeerService {
    pub fn new(worker: Arc<Worker>) -> Self {
        PeerService { worker }
    }
}

#[async_trait]
impl proto::peer_server::Peer for PeerService {
    async fn announce(&self, request: Request<proto::AnnounceRequest>) -> Result<Response<proto::AnnounceResponse>, Status> {
        let req = request.into_inner();
        // The announcing peer's own listen address isn't carried on this
        // message; it must already be known from a prior coordinator
        // `Register`-driven introduction, or from having stolen from it
        // previously. Workers that have never been introduced are ignored.
        let mut peers = self.worker.peers.lock();
        if let Some(existing) = peers.address_of(&req.worker_id) {
            peers.observe(req.worker_id, existing, req.queue_depth, req.load_factor);
        }
        Ok(Response::new(proto::AnnounceResponse { acknowledged: true }))
    }

    async fn steal(&self, request: Request<proto::StealRequest>) -> Result<Response<proto::StealResponse>, Status> {
        let req = request.into_inner();
        let mut queue = self.worker.queue.lock();
        let count = (req.count as usize).min(queue.len());
        let stolen: Vec<proto::AssignMessage> = queue.drain(..count).collect();
        log::debug!("worker {} yielded {} action(s) to {}", self.worker.config.worker_id, stolen.len(), req.thief_worker_id);
        Ok(Response::new(proto::StealResponse { stolen }))
    }
}

/// Introduce a peer by address so this worker can later steal from (or be
/// announced to by) it. The coordinator's registry is the source of truth
/// for who is in the fleet; a caller typically polls it and calls this for
/// every peer it doesn't already know about.
pub fn introduce_peer(worker: &Worker, worker_id: String, address: String) {
    let mut peers = worker.peers.lock();
    if peers.address_of(&worker_id).is_none() {
        peers.observe(worker_id, address, 0, 0.0);
    }
}

pub fn set_load_factor(worker: &Worker, value: f32) {
    worker.set_load_factor(value);
}
