// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Builds and tears down the private working tree an action executes in,
//! and ingests its declared outputs back into the content-addressable
//! store once it exits.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use bytes::Bytes;

use build_graph::Action;
use cas::ContentAddressableStore;
use errors::{BuildError, ErrorKind};
use hashing::Digest;

/// Fixed so that two runs of a deterministic action never differ solely
/// because of when they happened to execute.
pub const SOURCE_DATE_EPOCH: &str = "0";
pub const DETERMINISTIC_RANDOM_SEED: &str = "0";

/// Materialize a private working tree at `root` containing only `action`'s
/// declared inputs, linked read-only from `cas`.
pub async fn materialize_inputs(
    root: &Path,
    action: &Action,
    cas: &dyn ContentAddressableStore,
) -> Result<(), BuildError> {
    for (path, digest) in &action.inputs {
        let dest = root.join(path);
        cas.link(*digest, &dest)
            .await
            .map_err(|e| e.context(format!("materializing input {}", path.display())))?;
    }
    Ok(())
}

/// The environment an action's command actually runs with: the host
/// environment is not inherited at all (`env_clear`); only the action's
/// declared whitelist plus fixed deterministic variables are present.
pub fn sandboxed_env(action: &Action, work_dir: &Path) -> BTreeMap<String, String> {
    let mut env = action.env.clone();
    env.insert("SOURCE_DATE_EPOCH".to_string(), SOURCE_DATE_EPOCH.to_string());
    env.insert("PYTHONHASHSEED".to_string(), DETERMINISTIC_RANDOM_SEED.to_string());
    env.insert("TMPDIR".to_string(), work_dir.display().to_string());
    env
}

/// Verify each of `action`'s declared output paths exists under `root` as a
/// regular file or symlink, then ingest its contents into `cas`. Declared
/// outputs that are missing are reported as a single `OutputMissing` error
/// naming every path that failed, so a caller doesn't have to re-run to
/// discover the second missing output.
pub async fn capture_outputs(
    root: &Path,
    action: &Action,
    cas: &dyn ContentAddressableStore,
) -> Result<BTreeMap<PathBuf, Digest>, BuildError> {
    let mut outputs = BTreeMap::new();
    let mut missing = Vec::new();

    for rel_path in &action.output_paths {
        let abs_path = root.join(rel_path);
        let meta = match tokio::fs::symlink_metadata(&abs_path).await {
            Ok(meta) => meta,
            Err(_) => {
                missing.push(rel_path.display().to_string());
                continue;
            }
        };
        if !(meta.is_file() || meta.is_symlink()) {
            missing.push(rel_path.display().to_string());
            continue;
        }

        let bytes = tokio::fs::read(&abs_path)
            .await
            .map_err(|e| BuildError::new(ErrorKind::CacheIoFailed, format!("reading output {}: {e}", abs_path.display())).with_source(e))?;
        let digest = cas.put(Bytes::from(bytes)).await?;
        outputs.insert(rel_path.clone(), digest);
    }

    if !missing.is_empty() {
        return Err(BuildError::new(
            ErrorKind::OutputMissing,
            format!("declared output(s) not produced: {}", missing.join(", ")),
        ));
    }

    Ok(outputs)
}

/// Remove the sandbox's working tree. Best-effort: a failure here is logged
/// rather than propagated, since the action's result has already been
/// captured by the time this runs.
pub async fn cleanup(root: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(root).await {
        log::debug!("failed to remove sandbox working directory {}: {e}", root.display());
    }
}
