use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, PathBuf};
use std::time::Duration;

use hashing::Digest;

use errors::{BuildError, ErrorKind};

/// Dispatch priority. Critical actions preempt Normal/Low ones in the
/// Scheduler's ready queue; see the `scheduler` crate.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

/// Resource limits and sandbox policy for a single action, handed unchanged
/// to the `sandbox` crate at execution time and included in the action
/// fingerprint so that two actions that differ only in e.g. network
/// allowance are never conflated.
#[derive(Clone, Debug, PartialEq)]
pub struct CapabilitySet {
    pub network: bool,
    pub read_paths: Vec<PathBuf>,
    pub write_paths: Vec<PathBuf>,
    pub max_cpu: Option<u32>,
    pub max_memory: Option<u64>,
    pub timeout: Duration,
}

impl Default for CapabilitySet {
    fn default() -> Self {
        CapabilitySet {
            network: false,
            read_paths: Vec::new(),
            write_paths: Vec::new(),
            max_cpu: None,
            max_memory: None,
            timeout: Duration::from_secs(15 * 60),
        }
    }
}

/// A single unit of scheduled work: a command to run over a set of input
/// blobs, plus the metadata needed to fingerprint and dispatch it.
#[derive(Clone, Debug, PartialEq)]
pub struct Action {
    pub id: String,
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub inputs: BTreeMap<PathBuf, Digest>,
    pub output_paths: BTreeSet<PathBuf>,
    pub tool_digest: Digest,
    pub platform: String,
    pub priority: Priority,
    pub capabilities: CapabilitySet,
}

impl Action {
    /// Reject declared output paths that could write outside the sandbox's
    /// private working tree: absolute paths, and any path with a `..`
    /// component. Called at graph submission (`BuildGraph::add_node`)
    /// rather than at execution time, so a malformed action never occupies
    /// a scheduler slot.
    pub fn validate(&self) -> Result<(), BuildError> {
        for path in &self.output_paths {
            let escapes = path.is_absolute()
                || path.components().any(|c| matches!(c, Component::ParentDir));
            if escapes {
                return Err(BuildError::new(
                    ErrorKind::InvalidOutputPath,
                    format!(
                        "action {}: output path {} escapes the sandbox work tree",
                        self.id,
                        path.display()
                    ),
                ));
            }
        }
        Ok(())
    }
}

/// Bumped whenever the canonical encoding below changes shape, so that an
/// algorithmic change invalidates every previously recorded action-cache
/// entry rather than silently reusing a result computed under different
/// rules.
const FINGERPRINT_SCHEMA_VERSION: u8 = 1;

/// Compute the Action Fingerprint: a digest over a canonical serialization
/// of everything that determines the action's required result. Two actions
/// with identical canonical inputs always fingerprint identically,
/// regardless of process, machine, or the order fields were constructed in
/// (inputs/env are stored in `BTreeMap`s, so iteration is already sorted).
pub fn fingerprint_action(action: &Action) -> Digest {
    let mut buf = Vec::new();
    buf.push(FINGERPRINT_SCHEMA_VERSION);

    write_len(&mut buf, action.argv.len());
    for arg in &action.argv {
        write_str(&mut buf, arg);
    }

    write_len(&mut buf, action.env.len());
    for (k, v) in &action.env {
        write_str(&mut buf, k);
        write_str(&mut buf, v);
    }

    write_len(&mut buf, action.inputs.len());
    for (path, digest) in &action.inputs {
        write_str(&mut buf, &path.to_string_lossy());
        buf.extend_from_slice(digest.hash.as_bytes());
        buf.extend_from_slice(&(digest.size_bytes as u64).to_le_bytes());
    }

    write_len(&mut buf, action.output_paths.len());
    for path in &action.output_paths {
        write_str(&mut buf, &path.to_string_lossy());
    }

    buf.extend_from_slice(action.tool_digest.hash.as_bytes());
    buf.extend_from_slice(&(action.tool_digest.size_bytes as u64).to_le_bytes());

    write_str(&mut buf, &action.platform);

    buf.push(priority_tag(action.priority));

    write_capabilities(&mut buf, &action.capabilities);

    hashing::hash_bytes(&buf)
}

fn priority_tag(priority: Priority) -> u8 {
    match priority {
        Priority::Low => 0,
        Priority::Normal => 1,
        Priority::High => 2,
        Priority::Critical => 3,
    }
}

fn write_len(buf: &mut Vec<u8>, len: usize) {
    buf.extend_from_slice(&(len as u64).to_le_bytes());
}

fn write_str(buf: &mut Vec<u8>, s: &str) {
    write_len(buf, s.len());
    buf.extend_from_slice(s.as_bytes());
}

fn write_capabilities(buf: &mut Vec<u8>, caps: &CapabilitySet) {
    buf.push(caps.network as u8);

    write_len(buf, caps.read_paths.len());
    for p in &caps.read_paths {
        write_str(buf, &p.to_string_lossy());
    }
    write_len(buf, caps.write_paths.len());
    for p in &caps.write_paths {
        write_str(buf, &p.to_string_lossy());
    }

    buf.push(caps.max_cpu.is_some() as u8);
    buf.extend_from_slice(&caps.max_cpu.unwrap_or(0).to_le_bytes());

    buf.push(caps.max_memory.is_some() as u8);
    buf.extend_from_slice(&caps.max_memory.unwrap_or(0).to_le_bytes());

    buf.extend_from_slice(&(caps.timeout.as_millis() as u64).to_le_bytes());
}

#[cfg(test)]
mod action_tests;
