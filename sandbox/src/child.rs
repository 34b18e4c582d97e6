// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! A child process running in its own process group, so the soft/hard
//! timeout signals in [`crate::exec`] reach every descendant it spawns, not
//! just the immediate child.

use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::{getpgid, Pid};
use tokio::process::{Child, Command};
use tokio::time::sleep;

pub struct ManagedChild {
    child: Child,
}

impl ManagedChild {
    /// Spawn `command`, first arranging for it to become its own process
    /// group leader (`setsid`) so that signalling the group later reaches
    /// children it has itself spawned.
    pub fn spawn(mut command: Command) -> Result<Self, String> {
        command.kill_on_drop(true);

        // SAFETY: `pre_exec` runs after fork and before exec, in the child;
        // `setsid` is async-signal-safe.
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setsid()
                    .map(|_| ())
                    .map_err(|e| std::io::Error::other(format!("could not create new pgid: {e}")))
            });
        }

        let child = command
            .spawn()
            .map_err(|e| format!("failed to spawn process: {e}"))?;
        Ok(ManagedChild { child })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn inner_mut(&mut self) -> &mut Child {
        &mut self.child
    }

    fn pgid(&self) -> Result<Pid, String> {
        let pid = self.id().ok_or_else(|| "process has no pid".to_string())?;
        getpgid(Some(Pid::from_raw(pid as i32))).map_err(|e| format!("could not get pgid: {e}"))
    }

    /// Send `signal` to every process in this child's process group.
    fn signal_group(&self, signal: Signal) -> Result<(), String> {
        let pgid = self.pgid()?;
        signal::kill(Pid::from_raw(-pgid.as_raw()), signal)
            .map_err(|e| format!("failed to signal process group: {e}"))
    }

    /// Soft-then-hard timeout enforcement: send `SIGTERM` to the whole
    /// process group, wait up to `grace_period` for the child to exit on
    /// its own, then send `SIGKILL`.
    pub async fn terminate_with_grace_period(&mut self, grace_period: Duration) {
        if let Err(e) = self.signal_group(Signal::SIGTERM) {
            log::debug!("SIGTERM to sandboxed process group failed (may have already exited): {e}");
        }

        let waited = tokio::select! {
            _ = self.child.wait() => true,
            _ = sleep(grace_period) => false,
        };

        if !waited {
            if let Err(e) = self.signal_group(Signal::SIGKILL) {
                log::debug!("SIGKILL to sandboxed process group failed (may have already exited): {e}");
            }
            let _ = self.child.wait().await;
        }
    }
}
