// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Downloads one external source into memory (HTTP) or onto disk (git),
//! with exponential-backoff retries on transient errors. Digest
//! verification for HTTP sources happens streamingly, so a corrupt
//! download never has to be fully buffered twice.

use std::fmt;
use std::io::{self, Write};
use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use futures::TryFutureExt;
use futures::stream::StreamExt;
use tokio_retry2::strategy::ExponentialFactorBackoff;
use tokio_retry2::{Retry, RetryError};

use errors::{BuildError, ErrorKind};
use hashing::{Digest, WriterHasher};

#[derive(Debug)]
enum FetchError {
    Retryable(String),
    Permanent(String),
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Retryable(msg) => write!(f, "{msg} (retryable)"),
            FetchError::Permanent(msg) => write!(f, "{msg} (unretryable)"),
        }
    }
}

impl std::error::Error for FetchError {}

/// Scales a backoff duration by a random factor in `[0, 1)`, so that many
/// callers retrying the same flaky host don't all wake up in lockstep.
fn jitter(duration: Duration) -> Duration {
    duration.mul_f64(rand::random::<f64>())
}

struct SizeLimiter<W: io::Write> {
    writer: W,
    written: usize,
    limit: usize,
}

impl<W: io::Write> io::Write for SizeLimiter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let new_size = self.written + buf.len();
        if new_size > self.limit {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "downloaded file was larger than its declared digest",
            ));
        }
        self.written = new_size;
        self.writer.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

async fn attempt_download(
    http_client: &reqwest::Client,
    url: &url::Url,
    expected: Digest,
) -> Result<(Digest, Bytes), FetchError> {
    let response = http_client
        .get(url.clone())
        .send()
        .await
        .map_err(|e| FetchError::Retryable(format!("error fetching {url}: {e}")))
        .and_then(|res| {
            if res.status().is_server_error() {
                Err(FetchError::Retryable(format!(
                    "server error ({}) fetching {url}",
                    res.status().as_str()
                )))
            } else if res.status().is_client_error() {
                Err(FetchError::Permanent(format!(
                    "client error ({}) fetching {url}",
                    res.status().as_str()
                )))
            } else {
                Ok(res)
            }
        })?;

    let mut stream = response.bytes_stream();
    let mut hasher = WriterHasher::new(SizeLimiter {
        writer: BytesMut::with_capacity(expected.size_bytes).writer(),
        written: 0,
        limit: expected.size_bytes,
    });

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| FetchError::Retryable(format!("error reading body of {url}: {e}")))?;
        hasher
            .write_all(&chunk)
            .map_err(|e| FetchError::Retryable(format!("error buffering body of {url}: {e}")))?;
    }

    let (digest, limiter) = hasher.finish();
    Ok((digest, limiter.writer.into_inner().freeze()))
}

/// Fetch `url`, retrying transient failures with jittered exponential
/// backoff, and fail with `IntegrityMismatch` if the downloaded bytes
/// don't hash to `expected`. Never returns a partially-downloaded buffer:
/// either the whole body matched and is returned, or nothing is.
pub async fn fetch_http(
    http_client: &reqwest::Client,
    url: &url::Url,
    expected: Digest,
    base_delay: Duration,
    max_attempts: NonZeroUsize,
) -> Result<Bytes, BuildError> {
    let mut attempt_number = 0usize;
    let strategy = ExponentialFactorBackoff::from_millis(base_delay.as_millis() as u64, 2.0)
        .map(jitter)
        .take(max_attempts.get().saturating_sub(1));

    let (actual, bytes) = Retry::spawn(strategy, || {
        attempt_number += 1;
        log::debug!("fetching {url} (attempt #{attempt_number})");
        attempt_download(http_client, url, expected).map_err(|err| {
            log::debug!("fetch of {url} failed: {err}");
            match err {
                FetchError::Retryable(msg) => RetryError::transient(msg),
                FetchError::Permanent(msg) => RetryError::permanent(msg),
            }
        })
    })
    .await
    .map_err(|e| BuildError::new(ErrorKind::FetchTimeout, e.to_string()))?;

    if actual != expected {
        return Err(BuildError::new(
            ErrorKind::IntegrityMismatch,
            format!("fetched {url}: expected digest {expected:?}, got {actual:?}"),
        ));
    }

    Ok(bytes)
}

fn is_full_sha(rev: &str) -> bool {
    rev.len() == 40 && rev.chars().all(|c| c.is_ascii_hexdigit())
}

async fn run_git(args: &[&str], cwd: &Path) -> Result<String, FetchError> {
    let output = tokio::process::Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .await
        .map_err(|e| FetchError::Retryable(format!("failed to spawn git {args:?}: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let msg = format!("git {} failed: {stderr}", args.join(" "));
        return if stderr.contains("Could not resolve host") || stderr.contains("Connection refused") {
            Err(FetchError::Retryable(msg))
        } else {
            Err(FetchError::Permanent(msg))
        };
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Shallow-clone `url` at `rev` into `dest`, which must already exist and be
/// empty. `rev` must be a full 40-character commit SHA or a tag name; tag
/// names are verified (`git tag --verify`) before being trusted, since an
/// unverified tag can be force-moved by anyone with push access.
pub async fn fetch_git(
    url: &str,
    rev: &str,
    dest: &Path,
    base_delay: Duration,
    max_attempts: NonZeroUsize,
) -> Result<(), BuildError> {
    let mut attempt_number = 0usize;
    let strategy = ExponentialFactorBackoff::from_millis(base_delay.as_millis() as u64, 2.0)
        .map(jitter)
        .take(max_attempts.get().saturating_sub(1));

    Retry::spawn(strategy, || {
        attempt_number += 1;
        log::debug!("cloning {url}@{rev} (attempt #{attempt_number})");
        clone_at_rev(url, rev, dest).map_err(|err| {
            log::debug!("clone of {url}@{rev} failed: {err}");
            match err {
                FetchError::Retryable(msg) => RetryError::transient(msg),
                FetchError::Permanent(msg) => RetryError::permanent(msg),
            }
        })
    })
    .await
    .map_err(|e| BuildError::new(ErrorKind::FetchTimeout, e.to_string()))?;

    Ok(())
}

async fn clone_at_rev(url: &str, rev: &str, dest: &Path) -> Result<(), FetchError> {
    run_git(&["init", "--quiet"], dest).await?;
    run_git(&["remote", "add", "origin", url], dest).await?;

    if is_full_sha(rev) {
        run_git(&["fetch", "--quiet", "--depth", "1", "origin", rev], dest).await?;
        run_git(&["checkout", "--quiet", "FETCH_HEAD"], dest).await?;
        let head = run_git(&["rev-parse", "HEAD"], dest).await?;
        if head != rev {
            return Err(FetchError::Permanent(format!(
                "checked out HEAD {head} does not match declared commit {rev}"
            )));
        }
    } else {
        run_git(&["fetch", "--quiet", "--depth", "1", "origin", "tag", rev], dest).await?;
        run_git(&["tag", "--verify", rev], dest)
            .await
            .map_err(|_| {
                FetchError::Permanent(format!(
                    "tag '{rev}' could not be verified; pin an exact commit SHA instead"
                ))
            })?;
        run_git(&["checkout", "--quiet", rev], dest).await?;
    }

    Ok(())
}
