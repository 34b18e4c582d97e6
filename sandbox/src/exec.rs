// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Spawns one action's command inside its prepared working tree, enforces
//! its declared timeout with a soft-then-hard signal, and collects its
//! stdout/stderr.

use std::process::Stdio;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use futures::TryStreamExt;
use tokio::process::Command;
use tokio_util::codec::{BytesCodec, FramedRead};

use build_graph::Action;
use errors::{BuildError, ErrorKind};

use crate::child::ManagedChild;
use crate::isolation;

/// How long a process is given to exit on its own after the soft signal
/// before the hard signal is sent.
const GRACE_PERIOD: Duration = Duration::from_secs(5);

pub struct RawOutcome {
    pub exit_code: i32,
    pub stdout: Bytes,
    pub stderr: Bytes,
    pub duration: Duration,
    pub timed_out: bool,
}

/// Run `action`'s command with `work_dir` as its current directory and
/// `env` as its complete environment (already cleared and whitelisted by
/// the caller).
pub async fn run(
    action: &Action,
    work_dir: &std::path::Path,
    env: &std::collections::BTreeMap<String, String>,
) -> Result<RawOutcome, BuildError> {
    let argv = &action.argv;
    let program = argv.first().ok_or_else(|| {
        BuildError::new(ErrorKind::Internal, format!("action {} has an empty argv", action.id))
    })?;

    isolation::warn_if_non_hermetic(&action.id, work_dir);

    let mut command = Command::new(program);
    command
        .args(&argv[1..])
        .current_dir(work_dir)
        .env_clear()
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    // SAFETY: only async-signal-safe work (an `unshare` syscall) happens in
    // this closure, which tokio runs between fork and exec.
    unsafe {
        command.pre_exec(|| {
            isolation::try_unshare();
            Ok(())
        });
    }

    let mut child = ManagedChild::spawn(command)
        .map_err(|e| BuildError::new(ErrorKind::CacheIoFailed, format!("failed to spawn {}: {e}", action.id)))?;

    let stdout_pipe = child.inner_mut().stdout.take().expect("stdout was piped");
    let stderr_pipe = child.inner_mut().stderr.take().expect("stderr was piped");

    let stdout_task = tokio::spawn(collect(stdout_pipe));
    let stderr_task = tokio::spawn(collect(stderr_pipe));

    let start = Instant::now();
    let timeout = action.capabilities.timeout;
    let timed_out = tokio::select! {
        _ = child.inner_mut().wait() => false,
        _ = tokio::time::sleep(timeout) => {
            child.terminate_with_grace_period(GRACE_PERIOD).await;
            true
        }
    };
    let duration = start.elapsed();

    let exit_code = if timed_out {
        -libc::SIGTERM
    } else {
        child
            .inner_mut()
            .wait()
            .await
            .map_err(|e| BuildError::new(ErrorKind::CacheIoFailed, format!("failed to reap {}: {e}", action.id)).with_source(e))?
            .code()
            .unwrap_or(-1)
    };

    let stdout = stdout_task
        .await
        .map_err(|e| BuildError::new(ErrorKind::Internal, format!("stdout capture task panicked: {e}")))?;
    let stderr = stderr_task
        .await
        .map_err(|e| BuildError::new(ErrorKind::Internal, format!("stderr capture task panicked: {e}")))?;

    let stderr = if timed_out {
        let mut stderr = BytesMut::from(&stderr[..]);
        stderr.extend_from_slice(
            format!("\n\nexceeded timeout of {:.1}s executing {}\n", timeout.as_secs_f32(), action.id).as_bytes(),
        );
        stderr.freeze()
    } else {
        stderr
    };

    Ok(RawOutcome {
        exit_code,
        stdout,
        stderr,
        duration,
        timed_out,
    })
}

async fn collect(pipe: impl tokio::io::AsyncRead + Unpin) -> Bytes {
    let mut buf = BytesMut::with_capacity(8192);
    let mut stream = FramedRead::new(pipe, BytesCodec::new());
    while let Ok(Some(chunk)) = stream.try_next().await {
        buf.extend_from_slice(&chunk);
    }
    buf.freeze()
}
