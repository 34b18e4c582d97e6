// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::Arc;

use build_graph::BuildGraph;

use crate::worker::LocalWorkerPool;
use crate::Scheduler;

use testutil::{linear_chain, throwaway_action_cache, throwaway_cas, ScriptedOutcome, ScriptedSandbox};

#[tokio::test(flavor = "multi_thread")]
async fn a_linear_chain_runs_every_action_exactly_once() {
    let executor = task_executor::Executor::new();
    let (_cache_dir, cache) = throwaway_action_cache(executor);
    let (_cas_dir, cas) = throwaway_cas();

    let graph = Arc::new(BuildGraph::new());
    linear_chain(&graph, &["//a", "//b", "//c"]);

    let sandbox = Arc::new(ScriptedSandbox::new(ScriptedOutcome::Succeed));
    let workers = Arc::new(LocalWorkerPool::new(sandbox, cas));

    let scheduler = Scheduler::new(graph, cache, workers, 4, 4, None);
    let summary = scheduler.run().await;

    let mut succeeded = summary.succeeded.clone();
    succeeded.sort();
    assert_eq!(succeeded, vec!["//a".to_string(), "//b".to_string(), "//c".to_string()]);
    assert!(summary.failed.is_empty());
    assert!(summary.skipped.is_empty());
    assert_eq!(summary.executed, 3);
    assert_eq!(summary.cache_hits, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn a_cached_rebuild_dispatches_nothing() {
    let executor = task_executor::Executor::new();
    let (_cache_dir, cache) = throwaway_action_cache(executor);
    let (_cas_dir, cas) = throwaway_cas();
    let sandbox = Arc::new(ScriptedSandbox::new(ScriptedOutcome::Succeed));
    let workers = Arc::new(LocalWorkerPool::new(sandbox, cas));

    let first_graph = Arc::new(BuildGraph::new());
    linear_chain(&first_graph, &["//a", "//b", "//c"]);
    let first = Scheduler::new(first_graph, cache.clone(), workers.clone(), 4, 4, None);
    let first_summary = first.run().await;
    assert_eq!(first_summary.executed, 3);

    // A second, freshly-built graph of the *same* actions should be served
    // entirely out of the action cache: identical argv/env/inputs fingerprint
    // identically, regardless of which BuildGraph instance produced them.
    let second_graph = Arc::new(BuildGraph::new());
    linear_chain(&second_graph, &["//a", "//b", "//c"]);
    let second = Scheduler::new(second_graph, cache, workers, 4, 4, None);
    let second_summary = second.run().await;

    assert_eq!(second_summary.executed, 0);
    assert_eq!(second_summary.cache_hits, 3);
    assert_eq!(second_summary.succeeded.len(), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn a_permanently_failing_action_skips_its_dependents_but_not_its_dependencies() {
    let executor = task_executor::Executor::new();
    let (_cache_dir, cache) = throwaway_action_cache(executor);
    let (_cas_dir, cas) = throwaway_cas();

    let graph = Arc::new(BuildGraph::new());
    linear_chain(&graph, &["//a", "//b", "//c"]);

    let sandbox = Arc::new(ScriptedSandbox::new(ScriptedOutcome::Succeed).with_script("//b", ScriptedOutcome::Fail));
    let workers = Arc::new(LocalWorkerPool::new(sandbox, cas));

    let scheduler = Scheduler::new(graph, cache, workers, 4, 4, None);
    let summary = scheduler.run().await;

    assert_eq!(summary.succeeded, vec!["//a".to_string()]);
    assert_eq!(summary.failed, vec!["//b".to_string()]);
    assert_eq!(summary.skipped, vec!["//c".to_string()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn a_transient_failure_that_never_recovers_exhausts_its_retries() {
    let executor = task_executor::Executor::new();
    let (_cache_dir, cache) = throwaway_action_cache(executor);
    let (_cas_dir, cas) = throwaway_cas();

    let graph = Arc::new(BuildGraph::new());
    graph.add_node(testutil::trivial_action("//flaky")).unwrap();

    let sandbox = Arc::new(ScriptedSandbox::new(ScriptedOutcome::Error(errors::ErrorKind::WorkerUnreachable)));
    let workers = Arc::new(LocalWorkerPool::new(sandbox, cas));

    let scheduler = Scheduler::new(graph, cache, workers, 4, 4, None);
    let summary = scheduler.run().await;

    assert_eq!(summary.failed, vec!["//flaky".to_string()]);
    assert!(summary.succeeded.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_duplicate_fingerprints_execute_only_once() {
    // Two independent actions that happen to produce the same fingerprint
    // (identical argv/env/inputs/tool_digest) should still only run the
    // underlying command once: the second dispatch observes the first's
    // lease and then its cache entry, rather than racing it.
    let executor = task_executor::Executor::new();
    let (_cache_dir, cache) = throwaway_action_cache(executor);
    let (_cas_dir, cas) = throwaway_cas();

    let graph = Arc::new(BuildGraph::new());
    graph.add_node(testutil::trivial_action("//dup-a")).unwrap();
    graph.add_node(testutil::trivial_action("//dup-b")).unwrap();

    let sandbox = Arc::new(ScriptedSandbox::new(ScriptedOutcome::Succeed));
    let workers = Arc::new(LocalWorkerPool::new(sandbox.clone(), cas));

    let scheduler = Scheduler::new(graph, cache, workers, 4, 4, None);
    let summary = scheduler.run().await;

    assert_eq!(summary.succeeded.len(), 2);
    // Both ids fingerprint identically (same argv/env/inputs), so the second
    // dispatch should have been served by the cache rather than executing.
    assert_eq!(sandbox.execution_count(), 1);
    assert_eq!(summary.cache_hits, 1);
}
