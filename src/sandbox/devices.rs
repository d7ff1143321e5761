//! Minimal `/dev` for the sandbox.

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::Path;

use super::sys;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharDevice {
    pub name: &'static str,
    pub major: u32,
    pub minor: u32,
    pub mode: u32,
}

const fn chr(name: &'static str, major: u32, minor: u32, mode: u32) -> CharDevice {
    CharDevice {
        name,
        major,
        minor,
        mode,
    }
}

pub const DEVICES: &[CharDevice] = &[
    chr("console", 5, 1, 0o640),
    chr("full", 1, 7, 0o666),
    chr("null", 1, 3, 0o666),
    chr("random", 1, 8, 0o666),
    chr("tty", 5, 0, 0o666),
    chr("urandom", 1, 9, 0o666),
    chr("zero", 1, 5, 0o666),
];

/// (link name, target) under `/dev`.
pub const LINKS: &[(&str, &str)] = &[
    ("fd", "/proc/self/fd"),
    ("stdin", "/proc/self/fd/0"),
    ("stdout", "/proc/self/fd/1"),
    ("stderr", "/proc/self/fd/2"),
    ("ptmx", "pts/ptmx"),
];

/// Create the device nodes and standard links in `dev`.
pub fn populate(dev: &Path) -> Result<()> {
    for device in DEVICES {
        let path = dev.join(device.name);
        if path.exists() {
            continue;
        }
        sys::mknod(&path, libc::S_IFCHR | device.mode, device.major, device.minor)
            .with_context(|| format!("Failed to create device '{}'", path.display()))?;
        // mknod applies the umask
        fs::set_permissions(&path, fs::Permissions::from_mode(device.mode))
            .with_context(|| format!("Failed to chmod '{}'", path.display()))?;
    }

    for (name, target) in LINKS {
        let link = dev.join(name);
        if fs::symlink_metadata(&link).is_ok() {
            continue;
        }
        symlink(target, &link)
            .with_context(|| format!("Failed to link '{}' to '{}'", link.display(), target))?;
    }

    let shm = dev.join("shm");
    if shm.is_dir() {
        fs::set_permissions(&shm, fs::Permissions::from_mode(0o1777))
            .with_context(|| format!("Failed to chmod '{}'", shm.display()))?;
    }

    Ok(())
}
