// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Per-OS attempt at hermetic process isolation.
//!
//! On Linux, a fresh user/mount/pid namespace is requested via `unshare`
//! before the action's command is exec'd. Everywhere else — and on Linux
//! when unprivileged user namespaces are unavailable — execution falls back
//! to the private, input-only working directory built in `workspace.rs`,
//! and a non-hermetic warning is logged once per action.

use std::path::Path;

#[cfg(target_os = "linux")]
pub fn namespaces_available() -> bool {
    // Debian-derived kernels expose this knob; its absence elsewhere means
    // unprivileged user namespaces are unconditionally enabled.
    std::fs::read_to_string("/proc/sys/kernel/unprivileged_userns_clone")
        .map(|s| s.trim() == "1")
        .unwrap_or(true)
}

#[cfg(not(target_os = "linux"))]
pub fn namespaces_available() -> bool {
    false
}

pub fn warn_if_non_hermetic(description: &str, work_dir: &Path) {
    if !namespaces_available() {
        log::warn!(
            "no user/mount/pid namespace isolation available for {description}; running in the \
             plain working directory {} without namespace isolation",
            work_dir.display()
        );
    }
}

/// SAFETY: must only be called from within `Command::pre_exec`, strictly
/// after fork and before exec. Failure is swallowed rather than logged,
/// because logging is not async-signal-safe in that context; the preflight
/// check in `warn_if_non_hermetic` is what surfaces the fallback.
#[cfg(target_os = "linux")]
pub fn try_unshare() {
    use nix::sched::{unshare, CloneFlags};
    let _ = unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWPID);
}

#[cfg(not(target_os = "linux"))]
pub fn try_unshare() {}
