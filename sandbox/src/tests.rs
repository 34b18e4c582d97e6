use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use tempfile::tempdir;

use build_graph::{Action, CapabilitySet, Priority};
use cas::{ContentAddressableStore, LocalCas};

use crate::{LocalSandbox, SandboxExecutor};

fn base_action(argv: Vec<&str>) -> Action {
    Action {
        id: "test-action".to_string(),
        argv: argv.into_iter().map(str::to_string).collect(),
        env: BTreeMap::new(),
        inputs: BTreeMap::new(),
        output_paths: BTreeSet::new(),
        tool_digest: hashing::hash_bytes(b"tool"),
        platform: "linux_x86_64".to_string(),
        priority: Priority::Normal,
        capabilities: CapabilitySet::default(),
    }
}

fn sandbox_and_cas(tmp: &std::path::Path) -> (LocalSandbox, LocalCas) {
    let sandbox = LocalSandbox::new(tmp.join("sandboxes"), 4);
    let cas = LocalCas::new(tmp.join("cas")).unwrap();
    (sandbox, cas)
}

#[tokio::test]
async fn a_successful_command_produces_exit_zero_and_captures_stdout() {
    let tmp = tempdir().unwrap();
    let (sandbox, cas) = sandbox_and_cas(tmp.path());
    let action = base_action(vec!["/bin/sh", "-c", "echo hello"]);

    let outcome = sandbox.execute(&action, &cas).await.unwrap();
    assert_eq!(outcome.exit_code, 0);
    assert!(!outcome.timed_out);

    let stdout = cas.get(outcome.stdout_digest).await.unwrap().unwrap();
    assert_eq!(&stdout[..], b"hello\n");
}

#[tokio::test]
async fn a_failing_command_reports_its_exit_code() {
    let tmp = tempdir().unwrap();
    let (sandbox, cas) = sandbox_and_cas(tmp.path());
    let action = base_action(vec!["/bin/sh", "-c", "exit 7"]);

    let outcome = sandbox.execute(&action, &cas).await.unwrap();
    assert_eq!(outcome.exit_code, 7);
}

#[tokio::test]
async fn declared_outputs_are_ingested_into_the_cas() {
    let tmp = tempdir().unwrap();
    let (sandbox, cas) = sandbox_and_cas(tmp.path());
    let mut action = base_action(vec!["/bin/sh", "-c", "echo contents > out.txt"]);
    action.output_paths.insert(PathBuf::from("out.txt"));

    let outcome = sandbox.execute(&action, &cas).await.unwrap();
    assert_eq!(outcome.exit_code, 0);

    let digest = outcome.outputs.get(&PathBuf::from("out.txt")).expect("output recorded");
    let bytes = cas.get(*digest).await.unwrap().unwrap();
    assert_eq!(&bytes[..], b"contents\n");
}

#[tokio::test]
async fn a_missing_declared_output_is_a_failure() {
    let tmp = tempdir().unwrap();
    let (sandbox, cas) = sandbox_and_cas(tmp.path());
    let mut action = base_action(vec!["/bin/sh", "-c", "true"]);
    action.output_paths.insert(PathBuf::from("never-written.txt"));

    let err = sandbox.execute(&action, &cas).await.unwrap_err();
    assert_eq!(err.kind(), errors::ErrorKind::OutputMissing);
}

#[tokio::test]
async fn inputs_are_materialized_before_the_command_runs() {
    let tmp = tempdir().unwrap();
    let (sandbox, cas) = sandbox_and_cas(tmp.path());
    let input_digest = cas.put(bytes::Bytes::from_static(b"input data")).await.unwrap();

    let mut action = base_action(vec!["/bin/sh", "-c", "cat in.txt > out.txt"]);
    action.inputs.insert(PathBuf::from("in.txt"), input_digest);
    action.output_paths.insert(PathBuf::from("out.txt"));

    let outcome = sandbox.execute(&action, &cas).await.unwrap();
    assert_eq!(outcome.exit_code, 0);
    let digest = outcome.outputs.get(&PathBuf::from("out.txt")).unwrap();
    assert_eq!(&cas.get(*digest).await.unwrap().unwrap()[..], b"input data");
}

#[tokio::test]
async fn a_command_exceeding_its_timeout_is_killed() {
    let tmp = tempdir().unwrap();
    let (sandbox, cas) = sandbox_and_cas(tmp.path());
    let mut action = base_action(vec!["/bin/sh", "-c", "sleep 5"]);
    action.capabilities.timeout = Duration::from_millis(100);

    let outcome = sandbox.execute(&action, &cas).await.unwrap();
    assert!(outcome.timed_out);
    assert!(outcome.duration < Duration::from_secs(5));

    let stderr = cas.get(outcome.stderr_digest).await.unwrap().unwrap();
    assert!(String::from_utf8_lossy(&stderr).contains("exceeded timeout"));
}

#[tokio::test]
async fn run_deterministic_reports_deterministic_for_a_pure_command() {
    let tmp = tempdir().unwrap();
    let (sandbox, cas) = sandbox_and_cas(tmp.path());
    let mut action = base_action(vec!["/bin/sh", "-c", "echo fixed > out.txt"]);
    action.output_paths.insert(PathBuf::from("out.txt"));

    let report = sandbox.run_deterministic(&action, &cas, 3).await.unwrap();
    assert!(report.deterministic);
    assert_eq!(report.first_mismatch, None);
}

#[tokio::test]
async fn run_deterministic_reports_the_first_mismatching_path() {
    let tmp = tempdir().unwrap();
    let (sandbox, cas) = sandbox_and_cas(tmp.path());
    let mut action = base_action(vec!["/bin/sh", "-c", "date +%N > out.txt"]);
    action.output_paths.insert(PathBuf::from("out.txt"));

    let report = sandbox.run_deterministic(&action, &cas, 3).await.unwrap();
    assert!(!report.deterministic);
    assert_eq!(report.first_mismatch, Some(PathBuf::from("out.txt")));
}
