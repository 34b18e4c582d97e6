// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Unpacks a downloaded `.tar.gz` archive into a staging directory,
//! optionally stripping a leading path component (the common shape for
//! GitHub-style source archives, which wrap their contents in a single
//! `<repo>-<rev>/` directory).

use std::path::{Path, PathBuf};

use errors::{BuildError, ErrorKind};
use flate2::read::GzDecoder;

/// Extract `bytes` (a gzipped tar stream) into `dest`, which must already
/// exist. When `strip_prefix` is set, only entries under that path are
/// unpacked, with the prefix itself removed from their destination path;
/// entries outside of it are silently skipped.
pub async fn extract_tar_gz(
    bytes: bytes::Bytes,
    dest: PathBuf,
    strip_prefix: Option<String>,
) -> Result<(), BuildError> {
    tokio::task::spawn_blocking(move || extract_sync(&bytes, &dest, strip_prefix.as_deref()))
        .await
        .map_err(|e| BuildError::new(ErrorKind::Internal, format!("extraction task panicked: {e}")))?
}

fn extract_sync(bytes: &[u8], dest: &Path, strip_prefix: Option<&str>) -> Result<(), BuildError> {
    let decoder = GzDecoder::new(bytes);
    let mut archive = tar::Archive::new(decoder);

    let entries = archive
        .entries()
        .map_err(|e| BuildError::new(ErrorKind::ConfigInvalid, format!("not a valid gzipped tar archive: {e}")))?;

    for entry in entries {
        let mut entry = entry
            .map_err(|e| BuildError::new(ErrorKind::ConfigInvalid, format!("corrupt archive entry: {e}")))?;
        let path = entry
            .path()
            .map_err(|e| BuildError::new(ErrorKind::ConfigInvalid, format!("invalid archive entry path: {e}")))?
            .into_owned();

        let relative = match strip_prefix {
            Some(prefix) => match path.strip_prefix(prefix) {
                Ok(stripped) if stripped.as_os_str().is_empty() => continue,
                Ok(stripped) => stripped.to_path_buf(),
                Err(_) => continue,
            },
            None => path,
        };

        let target = dest.join(&relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BuildError::new(ErrorKind::CacheIoFailed, format!("creating {}: {e}", parent.display())).with_source(e))?;
        }
        entry
            .unpack(&target)
            .map_err(|e| BuildError::new(ErrorKind::CacheIoFailed, format!("unpacking {}: {e}", target.display())).with_source(e))?;
    }

    Ok(())
}
