//! Processes left behind inside a sandbox.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use super::sys;

/// PIDs under `proc_dir` whose root directory is `rootfs`.
pub fn rooted_at(proc_dir: &Path, rootfs: &Path) -> Result<Vec<libc::pid_t>> {
    let entries = fs::read_dir(proc_dir)
        .with_context(|| format!("Failed to list '{}'", proc_dir.display()))?;

    let mut pids = Vec::new();
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<libc::pid_t>().ok())
        else {
            continue;
        };
        // Processes exit while we scan; unreadable entries are skipped.
        let Ok(root) = fs::read_link(entry.path().join("root")) else {
            continue;
        };
        if root == rootfs {
            pids.push(pid);
        }
    }
    pids.sort_unstable();
    Ok(pids)
}

/// SIGKILL every process rooted at `rootfs`. Returns how many were signalled.
pub fn kill_rooted_at(proc_dir: &Path, rootfs: &Path) -> Result<usize> {
    let pids = rooted_at(proc_dir, rootfs)?;
    let mut killed = 0;
    for pid in pids {
        match sys::kill(pid, libc::SIGKILL) {
            Ok(()) => killed += 1,
            Err(err) if err.raw_os_error() == Some(libc::ESRCH) => {}
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to kill process {}", pid));
            }
        }
    }
    if killed > 0 {
        tracing::info!(rootfs = %rootfs.display(), killed, "killed leftover sandbox processes");
    }
    Ok(killed)
}
