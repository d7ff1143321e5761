//! Preflight checks for build validation.
//!
//! Validates that the host has the tools a build shells out to before any
//! mount is made. A missing `sgdisk` discovered after the rootfs is already
//! chrooted leaves far more to clean up.
//!
//! # Example
//!
//! ```rust
//! use rootfs_builder::preflight::{check_required_tools, command_exists};
//!
//! if !command_exists("sgdisk") {
//!     println!("gdisk not installed");
//! }
//!
//! let tools = &[("losetup", "util-linux"), ("blkid", "util-linux")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::{bail, Result};

use crate::definition::RootFilesystem;
use crate::filter::TargetType;

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Tools every build needs. Each tuple is (command_name, package_name).
pub const BASE_TOOLS: &[(&str, &str)] = &[
    ("mount", "util-linux"),
    ("umount", "util-linux"),
    ("rsync", "rsync"),
];

/// Extra tools for VM disk images.
pub const VM_TOOLS: &[(&str, &str)] = &[
    ("losetup", "util-linux"),
    ("sgdisk", "gdisk"),
    ("mkfs.vfat", "dosfstools"),
    ("blkid", "util-linux"),
    ("udevadm", "udev"),
    ("mountpoint", "util-linux"),
    ("lsblk", "util-linux"),
];

/// Tools for a build of `target_type` with the given VM root filesystem.
pub fn required_tools(
    target_type: TargetType,
    filesystem: RootFilesystem,
) -> Vec<(&'static str, &'static str)> {
    let mut tools = BASE_TOOLS.to_vec();
    if target_type == TargetType::Vm {
        tools.extend_from_slice(VM_TOOLS);
        match filesystem {
            RootFilesystem::Ext4 => tools.push(("mkfs.ext4", "e2fsprogs")),
            RootFilesystem::Btrfs => {
                tools.push(("mkfs.btrfs", "btrfs-progs"));
                tools.push(("btrfs", "btrfs-progs"));
            }
        }
    }
    tools
}

/// Check that specific tools are available.
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` with list of missing tools and their packages
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Check the host for a build of `target_type`.
pub fn check_host_tools(target_type: TargetType, filesystem: RootFilesystem) -> Result<()> {
    check_required_tools(&required_tools(target_type, filesystem))
}
