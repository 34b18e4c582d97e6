// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Packs a materialized directory tree into a single deterministic tar
//! archive and stores it as one blob in the content-addressable store, so
//! a repository root has exactly one digest identifying its whole
//! contents rather than one per file.

use std::path::{Path, PathBuf};

use bytes::Bytes;

use cas::ContentAddressableStore;
use errors::{BuildError, ErrorKind};
use hashing::Digest;

/// Tar up every file and directory under `root`, in sorted order with
/// deterministic tar headers (`tar::HeaderMode::Deterministic` clears
/// mtimes, uids and gids), then store the resulting archive in `cas`.
pub async fn snapshot_tree(root: PathBuf, cas: &dyn ContentAddressableStore) -> Result<Digest, BuildError> {
    let archive = tokio::task::spawn_blocking(move || build_deterministic_tar(&root))
        .await
        .map_err(|e| BuildError::new(ErrorKind::Internal, format!("snapshot task panicked: {e}")))??;
    cas.put(Bytes::from(archive)).await
}

fn build_deterministic_tar(root: &Path) -> Result<Vec<u8>, BuildError> {
    let mut relative_paths: Vec<PathBuf> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path() != root)
        .map(|entry| {
            entry
                .path()
                .strip_prefix(root)
                .expect("walkdir always yields children of root")
                .to_path_buf()
        })
        .collect();
    relative_paths.sort();

    let mut builder = tar::Builder::new(Vec::new());
    builder.mode(tar::HeaderMode::Deterministic);

    for relative in &relative_paths {
        let absolute = root.join(relative);
        let metadata = std::fs::symlink_metadata(&absolute)
            .map_err(|e| BuildError::new(ErrorKind::CacheIoFailed, format!("reading {}: {e}", absolute.display())).with_source(e))?;

        if metadata.is_dir() {
            builder
                .append_dir(relative, &absolute)
                .map_err(|e| BuildError::new(ErrorKind::CacheIoFailed, format!("taring {}: {e}", absolute.display())).with_source(e))?;
        } else {
            let mut file = std::fs::File::open(&absolute)
                .map_err(|e| BuildError::new(ErrorKind::CacheIoFailed, format!("opening {}: {e}", absolute.display())).with_source(e))?;
            builder
                .append_file(relative, &mut file)
                .map_err(|e| BuildError::new(ErrorKind::CacheIoFailed, format!("taring {}: {e}", absolute.display())).with_source(e))?;
        }
    }

    builder
        .into_inner()
        .map_err(|e| BuildError::new(ErrorKind::Internal, format!("finalizing tar archive: {e}")).with_source(e))
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use cas::LocalCas;

    use super::snapshot_tree;

    #[tokio::test]
    async fn snapshotting_the_same_tree_twice_is_idempotent() {
        let src = tempdir().unwrap();
        std::fs::write(src.path().join("a.txt"), b"a").unwrap();
        std::fs::create_dir(src.path().join("sub")).unwrap();
        std::fs::write(src.path().join("sub/b.txt"), b"b").unwrap();

        let cas_dir = tempdir().unwrap();
        let cas = LocalCas::new(cas_dir.path().to_path_buf()).unwrap();

        let first = snapshot_tree(src.path().to_path_buf(), &cas).await.unwrap();
        let second = snapshot_tree(src.path().to_path_buf(), &cas).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn differing_trees_snapshot_to_different_digests() {
        let a = tempdir().unwrap();
        std::fs::write(a.path().join("a.txt"), b"a").unwrap();
        let b = tempdir().unwrap();
        std::fs::write(b.path().join("a.txt"), b"different").unwrap();

        let cas_dir = tempdir().unwrap();
        let cas = LocalCas::new(cas_dir.path().to_path_buf()).unwrap();

        let digest_a = snapshot_tree(a.path().to_path_buf(), &cas).await.unwrap();
        let digest_b = snapshot_tree(b.path().to_path_buf(), &cas).await.unwrap();
        assert_ne!(digest_a, digest_b);
    }
}
