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

//! Work-stealing distributed execution: a coordinator that a fleet of
//! workers register with, plus the peer-to-peer stealing layer workers use
//! to rebalance load amongst themselves without round-tripping through the
//! coordinator on every idle tick.
//!
//! The wire protocol is a first-party gRPC schema (`proto/distributed.proto`)
//! rather than the bazel remote-execution API: this engine's action and
//! cache model already diverges enough from REAPI (see `cas` and
//! `action_cache`) that reusing its wire types would mean translating
//! through an impedance mismatch on every call, for no actual
//! interoperability benefit since neither endpoint is ever a REAPI peer.

pub mod proto {
    #![allow(clippy::all)]
    tonic::include_proto!("build_engine.distributed.v1");
}

mod coordinator;
mod protocol;
mod registry;
mod retry;
mod stealing;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use tonic::transport::Server;

pub use coordinator::{CoordinatorService, CoordinatorState, RemoteWorkerPool};
pub use registry::{WorkerInfo, WorkerRegistry, DEFAULT_STALE_THRESHOLD};
pub use stealing::{choose_victim, PeerStat, StealConfig};
pub use worker::{introduce_peer, set_load_factor, PeerService, Worker, WorkerConfig};

/// How often the coordinator sweeps its registry for workers that have
/// missed their heartbeat deadline.
const REAP_INTERVAL: Duration = Duration::from_secs(5);

/// Binds and serves the `Coordinator` gRPC service at `addr`, and spawns
/// the background task that periodically reaps stale workers. Runs until
/// the server future resolves (normally only on a fatal transport error,
/// since `serve` otherwise runs forever).
pub async fn serve_coordinator(
    addr: std::net::SocketAddr,
    state: Arc<CoordinatorState>,
    executor: task_executor::Executor,
) -> Result<(), tonic::transport::Error> {
    let reaper_state = state.clone();
    executor.native_spawn(async move {
        let mut interval = tokio::time::interval(REAP_INTERVAL);
        loop {
            interval.tick().await;
            reaper_state.reap_stale_workers();
        }
    });

    Server::builder()
        .add_service(proto::coordinator_server::CoordinatorServer::new(CoordinatorService::new(state)))
        .serve(addr)
        .await
}

/// Binds and serves the `Peer` gRPC service at `addr` so other workers can
/// announce their load to, and steal from, this one. Run this alongside
/// [`Worker::run`], typically on a spawned task.
pub async fn serve_peer(addr: std::net::SocketAddr, worker: Arc<Worker>) -> Result<(), tonic::transport::Error> {
    Server::builder()
        .add_service(proto::peer_server::PeerServer::new(PeerService::new(worker)))
        .serve(addr)
        .await
}
