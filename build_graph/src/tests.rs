use std::collections::BTreeMap;

use hashing::EMPTY_DIGEST;

use super::*;

fn action(id: &str) -> Action {
    Action {
        id: id.to_string(),
        argv: vec!["true".to_string()],
        env: BTreeMap::new(),
        inputs: BTreeMap::new(),
        output_paths: BTreeSet::new(),
        tool_digest: EMPTY_DIGEST,
        platform: "x86_64-unknown-linux-gnu".to_string(),
        priority: Priority::Normal,
        capabilities: CapabilitySet::default(),
    }
}

#[test]
fn add_node_is_idempotent() {
    let g = BuildGraph::new();
    g.add_node(action("//a")).unwrap();
    g.add_node(action("//a")).unwrap();
    assert_eq!(g.len(), 1);
}

#[test]
fn a_node_with_no_dependencies_starts_ready() {
    let g = BuildGraph::new();
    g.add_node(action("//a")).unwrap();
    assert_eq!(g.state_of("//a"), Some(ActionState::Ready));
}

#[test]
fn adding_a_dependency_moves_the_dependent_to_pending() {
    let g = BuildGraph::new();
    g.add_node(action("//a")).unwrap();
    g.add_node(action("//b")).unwrap();
    g.add_edge("//a", "//b").unwrap();
    assert_eq!(g.state_of("//b"), Some(ActionState::Pending));
    assert_eq!(g.state_of("//a"), Some(ActionState::Ready));
}

#[test]
fn self_edges_are_rejected() {
    let g = BuildGraph::new();
    g.add_node(action("//a")).unwrap();
    assert!(g.add_edge("//a", "//a").is_err());
}

#[test]
fn an_edge_that_would_close_a_cycle_is_rejected() {
    let g = BuildGraph::new();
    g.add_node(action("//a")).unwrap();
    g.add_node(action("//b")).unwrap();
    g.add_node(action("//c")).unwrap();
    g.add_edge("//a", "//b").unwrap();
    g.add_edge("//b", "//c").unwrap();

    let err = g.add_edge("//c", "//a").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CircularDependency);
    // the rejected edge must not have mutated the graph
    assert_eq!(g.dependents_of("//c"), Vec::<String>::new());
}

#[test]
fn topological_order_respects_edges_and_is_deterministic() {
    let g = BuildGraph::new();
    for id in ["//c", "//a", "//b"] {
        g.add_node(action(id)).unwrap();
    }
    g.add_edge("//a", "//b").unwrap();
    g.add_edge("//b", "//c").unwrap();

    let order = g.topological_order();
    let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
    assert!(pos("//a") < pos("//b"));
    assert!(pos("//b") < pos("//c"));

    // running it again on the same graph gives the same answer
    assert_eq!(order, g.topological_order());
}

#[test]
fn completing_a_node_readies_a_dependent_whose_other_deps_are_done() {
    let g = BuildGraph::new();
    g.add_node(action("//a")).unwrap();
    g.add_node(action("//b")).unwrap();
    g.add_node(action("//c")).unwrap();
    g.add_edge("//a", "//c").unwrap();
    g.add_edge("//b", "//c").unwrap();

    g.transition_to_scheduled("//a").unwrap();
    g.transition_to_executing("//a").unwrap();
    let ready = g.complete("//a").unwrap();
    assert!(ready.is_empty(), "c still waits on b");
    assert_eq!(g.state_of("//c"), Some(ActionState::Pending));

    g.transition_to_scheduled("//b").unwrap();
    g.transition_to_executing("//b").unwrap();
    let ready = g.complete("//b").unwrap();
    assert_eq!(ready, vec!["//c".to_string()]);
    assert_eq!(g.state_of("//c"), Some(ActionState::Ready));
}

#[test]
fn a_transient_failure_is_retried_until_the_cap_then_fails() {
    let g = BuildGraph::new();
    g.add_node(action("//a")).unwrap();

    for _ in 0..MAX_RETRIES {
        g.transition_to_scheduled("//a").unwrap();
        g.transition_to_executing("//a").unwrap();
        match g.fail("//a", true).unwrap() {
            FailOutcome::Requeued => {}
            FailOutcome::Failed(_) => panic!("failed before exhausting retries"),
        }
        assert_eq!(g.state_of("//a"), Some(ActionState::Ready));
    }

    g.transition_to_scheduled("//a").unwrap();
    g.transition_to_executing("//a").unwrap();
    match g.fail("//a", true).unwrap() {
        FailOutcome::Failed(_) => {}
        FailOutcome::Requeued => panic!("should have exhausted retries"),
    }
    assert_eq!(g.state_of("//a"), Some(ActionState::Failed));
}

#[test]
fn a_permanent_failure_propagates_to_transitive_dependents() {
    let g = BuildGraph::new();
    g.add_node(action("//a")).unwrap();
    g.add_node(action("//b")).unwrap();
    g.add_node(action("//c")).unwrap();
    g.add_edge("//a", "//b").unwrap();
    g.add_edge("//b", "//c").unwrap();

    g.transition_to_scheduled("//a").unwrap();
    g.transition_to_executing("//a").unwrap();
    let outcome = g.fail("//a", false).unwrap();
    let propagated = match outcome {
        FailOutcome::Failed(ids) => ids,
        FailOutcome::Requeued => panic!("permanent failure must not requeue"),
    };
    assert_eq!(propagated.len(), 2);
    assert!(propagated.contains(&"//b".to_string()));
    assert!(propagated.contains(&"//c".to_string()));
    assert_eq!(g.state_of("//a"), Some(ActionState::Failed));
    assert_eq!(g.state_of("//b"), Some(ActionState::Failed));
    assert_eq!(g.state_of("//c"), Some(ActionState::Failed));
}

#[test]
fn reassigning_from_a_dead_worker_requeues_in_flight_work() {
    let g = BuildGraph::new();
    g.add_node(action("//a")).unwrap();
    g.add_node(action("//b")).unwrap();
    g.transition_to_scheduled("//a").unwrap();
    g.transition_to_executing("//a").unwrap();
    g.transition_to_scheduled("//b").unwrap();
    g.transition_to_executing("//b").unwrap();

    let failed = g.reassign_from_dead_worker(&["//a".to_string(), "//b".to_string()]);
    assert!(failed.is_empty());
    assert_eq!(g.state_of("//a"), Some(ActionState::Ready));
    assert_eq!(g.state_of("//b"), Some(ActionState::Ready));
}

#[test]
fn remove_node_drops_it_and_fixes_up_the_swapped_index() {
    let g = BuildGraph::new();
    g.add_node(action("//a")).unwrap();
    g.add_node(action("//b")).unwrap();
    g.add_node(action("//c")).unwrap();
    g.add_edge("//a", "//c").unwrap();

    assert!(g.remove_node("//a").is_some());
    assert_eq!(g.len(), 2);
    assert!(g.action("//b").is_some());
    assert!(g.action("//c").is_some());
    assert_eq!(g.dependents_of("//b"), Vec::<String>::new());
}

#[test]
fn ready_nodes_reflects_only_actions_with_no_outstanding_deps() {
    let g = BuildGraph::new();
    g.add_node(action("//a")).unwrap();
    g.add_node(action("//b")).unwrap();
    g.add_edge("//a", "//b").unwrap();

    let mut ready = g.ready_nodes();
    ready.sort();
    assert_eq!(ready, vec!["//a".to_string()]);

    g.transition_to_scheduled("//a").unwrap();
    g.transition_to_executing("//a").unwrap();
    g.complete("//a").unwrap();
    assert_eq!(g.ready_nodes(), vec!["//b".to_string()]);
}

#[test]
fn direct_dependencies_is_the_complement_of_dependents_of() {
    let g = BuildGraph::new();
    g.add_node(action("//a")).unwrap();
    g.add_node(action("//b")).unwrap();
    g.add_node(action("//c")).unwrap();
    g.add_edge("//a", "//c").unwrap();
    g.add_edge("//b", "//c").unwrap();

    let mut deps = g.direct_dependencies("//c");
    deps.sort();
    assert_eq!(deps, vec!["//a".to_string(), "//b".to_string()]);
    assert_eq!(g.direct_dependencies("//a"), Vec::<String>::new());
}

#[test]
fn node_ids_lists_every_action_regardless_of_state() {
    let g = BuildGraph::new();
    g.add_node(action("//a")).unwrap();
    g.add_node(action("//b")).unwrap();
    let mut ids = g.node_ids();
    ids.sort();
    assert_eq!(ids, vec!["//a".to_string(), "//b".to_string()]);
}

#[test]
fn all_dependencies_and_dependents_are_transitive() {
    let g = BuildGraph::new();
    g.add_node(action("//a")).unwrap();
    g.add_node(action("//b")).unwrap();
    g.add_node(action("//c")).unwrap();
    g.add_edge("//a", "//b").unwrap();
    g.add_edge("//b", "//c").unwrap();

    assert_eq!(g.all_dependencies("//c"), vec!["//a".to_string(), "//b".to_string()]);
    assert_eq!(g.all_dependents("//a"), vec!["//b".to_string(), "//c".to_string()]);
}

#[test]
fn an_action_with_an_escaping_output_path_is_rejected_at_submission() {
    let g = BuildGraph::new();
    let mut a = action("//a");
    a.output_paths.insert(std::path::PathBuf::from("../../etc/passwd"));

    let err = g.add_node(a).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidOutputPath);
    assert_eq!(g.len(), 0);
}
