// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Conversions between this workspace's native types ([`Action`],
//! [`ExecutionOutcome`], [`Digest`]) and the generated protobuf messages in
//! [`crate::proto`]. Kept in one place so a wire format change never means
//! hunting through `coordinator.rs` and `worker.rs` for scattered
//! `From`/`TryFrom` impls.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;

use build_graph::{Action, CapabilitySet, Priority};
use errors::{BuildError, ErrorKind};
use hashing::{Digest, Fingerprint, FINGERPRINT_SIZE};
use sandbox::ExecutionOutcome;

use crate::proto;

/// A [`Digest`]'s wire encoding: the 32-byte fingerprint followed by an
/// 8-byte big-endian size. `bytes` fields in the proto carry exactly this.
pub fn digest_to_bytes(digest: Digest) -> Bytes {
    let mut buf = Vec::with_capacity(FINGERPRINT_SIZE + 8);
    buf.extend_from_slice(digest.hash.as_bytes());
    buf.extend_from_slice(&(digest.size_bytes as u64).to_be_bytes());
    Bytes::from(buf)
}

pub fn digest_from_bytes(bytes: &[u8]) -> Result<Digest, BuildError> {
    if bytes.len() != FINGERPRINT_SIZE + 8 {
        return Err(BuildError::new(
            ErrorKind::InvalidFingerprintInput,
            format!("expected a {}-byte digest, got {}", FINGERPRINT_SIZE + 8, bytes.len()),
        ));
    }
    let hash = Fingerprint::from_bytes_unsafe(&bytes[..FINGERPRINT_SIZE]);
    let size_bytes = u64::from_be_bytes(bytes[FINGERPRINT_SIZE..].try_into().unwrap()) as usize;
    Ok(Digest { hash, size_bytes })
}

fn priority_to_i32(priority: Priority) -> i32 {
    match priority {
        Priority::Low => 0,
        Priority::Normal => 1,
        Priority::High => 2,
        Priority::Critical => 3,
    }
}

fn priority_from_i32(value: i32) -> Priority {
    match value {
        0 => Priority::Low,
        2 => Priority::High,
        3 => Priority::Critical,
        _ => Priority::Normal,
    }
}

pub fn action_to_spec(action: &Action) -> proto::ActionSpec {
    proto::ActionSpec {
        action_id: action.id.clone(),
        argv: action.argv.clone(),
        env: action.env.clone().into_iter().collect(),
        input_digests: action
            .inputs
            .iter()
            .map(|(path, digest)| (path.to_string_lossy().into_owned(), digest_to_bytes(*digest)))
            .collect(),
        output_paths: action.output_paths.iter().map(|p| p.to_string_lossy().into_owned()).collect(),
        tool_digest: digest_to_bytes(action.tool_digest),
        platform: action.platform.clone(),
        priority: priority_to_i32(action.priority),
        capability_network: action.capabilities.network,
        capability_read_paths: action
            .capabilities
            .read_paths
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect(),
        capability_write_paths: action
            .capabilities
            .write_paths
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect(),
        capability_max_cpu: action.capabilities.max_cpu.unwrap_or(0),
        capability_max_memory: action.capabilities.max_memory.unwrap_or(0),
        capability_timeout_millis: action.capabilities.timeout.as_millis() as u64,
    }
}

pub fn spec_to_action(spec: proto::ActionSpec) -> Result<Action, BuildError> {
    let mut inputs = BTreeMap::new();
    for (path, digest_bytes) in spec.input_digests {
        inputs.insert(PathBuf::from(path), digest_from_bytes(&digest_bytes)?);
    }

    Ok(Action {
        id: spec.action_id,
        argv: spec.argv,
        env: spec.env.into_iter().collect(),
        inputs,
        output_paths: spec.output_paths.into_iter().map(PathBuf::from).collect(),
        tool_digest: digest_from_bytes(&spec.tool_digest)?,
        platform: spec.platform,
        priority: priority_from_i32(spec.priority),
        capabilities: CapabilitySet {
            network: spec.capability_network,
            read_paths: spec.capability_read_paths.into_iter().map(PathBuf::from).collect(),
            write_paths: spec.capability_write_paths.into_iter().map(PathBuf::from).collect(),
            max_cpu: (spec.capability_max_cpu > 0).then_some(spec.capability_max_cpu),
            max_memory: (spec.capability_max_memory > 0).then_some(spec.capability_max_memory),
            timeout: Duration::from_millis(spec.capability_timeout_millis),
        },
    })
}

/// A worker reports every completed execution through this conversion,
/// whether it ran to a clean exit or not: only a zero exit code that didn't
/// time out becomes `Success`, matching the scheduler's own test for a
/// cacheable result.
pub fn outcome_to_proto(outcome: &ExecutionOutcome) -> proto::Outcome {
    if outcome.exit_code == 0 && !outcome.timed_out {
        proto::Outcome {
            outcome: Some(proto::outcome::Outcome::Success(proto::Success {
                outputs: outcome
                    .outputs
                    .iter()
                    .map(|(path, digest)| (path.to_string_lossy().into_owned(), digest_to_bytes(*digest)))
                    .collect(),
                stdout_digest: digest_to_bytes(outcome.stdout_digest),
                stderr_digest: digest_to_bytes(outcome.stderr_digest),
                duration_millis: outcome.duration.as_millis() as u64,
            })),
        }
    } else if outcome.timed_out {
        proto::Outcome {
            outcome: Some(proto::outcome::Outcome::Failure(proto::Failure {
                kind: ErrorKind::ActionTimeout.as_str().to_string(),
                message: "action exceeded its declared timeout".to_string(),
            })),
        }
    } else {
        proto::Outcome {
            outcome: Some(proto::outcome::Outcome::Failure(proto::Failure {
                kind: ErrorKind::BuildFailed.as_str().to_string(),
                message: format!("action exited with code {}", outcome.exit_code),
            })),
        }
    }
}

pub fn failure_to_proto(err: &BuildError) -> proto::Outcome {
    proto::Outcome {
        outcome: Some(proto::outcome::Outcome::Failure(proto::Failure {
            kind: err.kind().as_str().to_string(),
            message: err.message().to_string(),
        })),
    }
}

fn error_kind_from_str(s: &str) -> ErrorKind {
    match s {
        "BUILD_FAILED" => ErrorKind::BuildFailed,
        "OUTPUT_MISSING" => ErrorKind::OutputMissing,
        "ACTION_TIMEOUT" => ErrorKind::ActionTimeout,
        "FETCH_TIMEOUT" => ErrorKind::FetchTimeout,
        "CACHE_IO_FAILED" => ErrorKind::CacheIoFailed,
        "NETWORK_UNAVAILABLE" => ErrorKind::NetworkUnavailable,
        "WORKER_UNREACHABLE" => ErrorKind::WorkerUnreachable,
        "TARGET_NOT_FOUND" => ErrorKind::TargetNotFound,
        "CIRCULAR_DEPENDENCY" => ErrorKind::CircularDependency,
        "INVALID_FINGERPRINT_INPUT" => ErrorKind::InvalidFingerprintInput,
        "INVALID_OUTPUT_PATH" => ErrorKind::InvalidOutputPath,
        "CONFIG_INVALID" => ErrorKind::ConfigInvalid,
        "INTEGRITY_MISMATCH" => ErrorKind::IntegrityMismatch,
        "CAS_CORRUPTION" => ErrorKind::CasCorruption,
        "OUT_OF_MEMORY" => ErrorKind::OutOfMemory,
        "WORKER_UNREACHABLE_EXHAUSTED" => ErrorKind::WorkerUnreachableExhausted,
        _ => ErrorKind::Internal,
    }
}

/// The coordinator's inverse of [`outcome_to_proto`]/[`failure_to_proto`]:
/// turns a worker's reported `Outcome` back into the `Result` shape the
/// scheduler expects from a `WorkerPool::dispatch` call.
pub fn outcome_from_proto(outcome: proto::Outcome) -> Result<ExecutionOutcome, BuildError> {
    match outcome.outcome {
        Some(proto::outcome::Outcome::Success(success)) => {
            let mut outputs = BTreeMap::new();
            for (path, digest_bytes) in success.outputs {
                outputs.insert(PathBuf::from(path), digest_from_bytes(&digest_bytes)?);
            }
            Ok(ExecutionOutcome {
                exit_code: 0,
                stdout_digest: digest_from_bytes(&success.stdout_digest)?,
                stderr_digest: digest_from_bytes(&success.stderr_digest)?,
                outputs,
                duration: Duration::from_millis(success.duration_millis),
                timed_out: false,
            })
        }
        Some(proto::outcome::Outcome::Failure(failure)) => {
            Err(BuildError::new(error_kind_from_str(&failure.kind), failure.message))
        }
        None => Err(BuildError::new(ErrorKind::Internal, "worker reported neither success nor failure")),
    }
}
