// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Named counters attached to workunit metadata. These are not a metrics
//! system of their own (see the Non-goals); they're just stable keys so a
//! CLI collaborator reading the workunit ring buffer can aggregate by name
//! without guessing at string literals scattered across crates.

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Metric {
    CasRequests,
    CasHits,
    CasMisses,
    CasReadErrors,
    CasWriteErrors,
    ActionCacheRequests,
    ActionCacheHits,
    ActionCacheMisses,
    ActionCacheLeaseWaits,
    LocalExecutionRequests,
    LocalExecutionTimeouts,
    RepoResolverFetches,
    RepoResolverFetchFailures,
    DistributedRpcRetries,
    WorkStealAttempts,
    WorkStealSuccesses,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        use Metric::*;

        match *self {
            CasRequests => "cas_requests",
            CasHits => "cas_hits",
            CasMisses => "cas_misses",
            CasReadErrors => "cas_read_errors",
            CasWriteErrors => "cas_write_errors",
            ActionCacheRequests => "action_cache_requests",
            ActionCacheHits => "action_cache_hits",
            ActionCacheMisses => "action_cache_misses",
            ActionCacheLeaseWaits => "action_cache_lease_waits",
            LocalExecutionRequests => "local_execution_requests",
            LocalExecutionTimeouts => "local_execution_timeouts",
            RepoResolverFetches => "repo_resolver_fetches",
            RepoResolverFetchFailures => "repo_resolver_fetch_failures",
            DistributedRpcRetries => "distributed_rpc_retries",
            WorkStealAttempts => "work_steal_attempts",
            WorkStealSuccesses => "work_steal_successes",
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ObservationMetric {
    LocalExecutionTimeMicros,
    CasFetchTimeMicros,
}

impl ObservationMetric {
    pub fn as_str(&self) -> &'static str {
        use ObservationMetric::*;

        match *self {
            LocalExecutionTimeMicros => "local_execution_time_micros",
            CasFetchTimeMicros => "cas_fetch_time_micros",
        }
    }
}
