//! Partitioned VM disk image behind a loop device.
//!
//! Layout: partition 1 is a 100 MiB EFI system partition (vfat, label
//! `UEFI`), partition 2 fills the rest and holds the root filesystem (label
//! `rootfs`). Partition nodes are `<loop>p1` and `<loop>p2`.
//!
//! Every external tool goes through the injected [`CommandRunner`].

use anyhow::{bail, Context, Result};
use std::fs::{self, File};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::definition::{RootFilesystem, DEFAULT_VM_SIZE};
use crate::process::{Cmd, CommandResult, CommandRunner};
use crate::sandbox::{sys, MountSpec};
use crate::teardown::{ignore_missing, Teardown};

const EXT4_MOUNT_OPTIONS: &str = "discard,nobarrier,commit=300,noatime,data=writeback";
const BTRFS_MOUNT_OPTIONS: &str = "defaults,discard,nobarrier,commit=300,noatime,subvol=/@";

pub struct VmDisk<'r> {
    runner: &'r dyn CommandRunner,
    image_file: PathBuf,
    size: u64,
    filesystem: RootFilesystem,
    rootfs_dir: PathBuf,
    loop_device: Option<String>,
    /// Partition nodes we created ourselves and must remove on detach.
    created_nodes: Vec<PathBuf>,
}

impl<'r> VmDisk<'r> {
    /// `size` of zero means the 4 GiB default.
    pub fn new(
        runner: &'r dyn CommandRunner,
        image_file: impl Into<PathBuf>,
        size: u64,
        filesystem: RootFilesystem,
        rootfs_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            image_file: image_file.into(),
            size: if size == 0 { DEFAULT_VM_SIZE } else { size },
            filesystem,
            rootfs_dir: rootfs_dir.into(),
            loop_device: None,
            created_nodes: Vec::new(),
        }
    }

    pub fn rootfs_dir(&self) -> &Path {
        &self.rootfs_dir
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn loop_device(&self) -> Option<&str> {
        self.loop_device.as_deref()
    }

    fn attached(&self) -> Result<&str> {
        self.loop_device
            .as_deref()
            .context("VM disk has no loop device attached")
    }

    pub fn uefi_partition(&self) -> Result<String> {
        Ok(partition_device(self.attached()?, 1))
    }

    pub fn root_partition(&self) -> Result<String> {
        Ok(partition_device(self.attached()?, 2))
    }

    /// Create the disk, partition, format and mount it at `rootfs_dir`.
    pub fn build(&mut self) -> Result<()> {
        self.create_empty_disk_image()?;
        self.create_partitions()?;
        self.attach_loop_device()?;
        self.create_uefi_filesystem()?;
        self.create_root_filesystem()?;
        self.mount_root_partition()?;
        self.mount_uefi_partition()?;
        Ok(())
    }

    /// Sparse image file of `size` bytes, mode 0600.
    pub fn create_empty_disk_image(&self) -> Result<()> {
        let file = File::create(&self.image_file).with_context(|| {
            format!("Failed to create disk image '{}'", self.image_file.display())
        })?;
        file.set_permissions(fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to chmod '{}'", self.image_file.display()))?;
        file.set_len(self.size).with_context(|| {
            format!(
                "Failed to resize '{}' to {} bytes",
                self.image_file.display(),
                self.size
            )
        })?;
        tracing::info!(image = %self.image_file.display(), size = self.size, "created disk image");
        Ok(())
    }

    pub fn create_partitions(&self) -> Result<()> {
        let steps: [&[&str]; 3] = [
            &["--zap-all"],
            &["--new=1::+100M", "--typecode=1:EF00"],
            &["--new=2::", "--typecode=2:8300"],
        ];
        for args in steps {
            self.run(
                Cmd::new("sgdisk")
                    .arg_path(&self.image_file)
                    .args(args)
                    .error_msg(format!(
                        "Failed to partition '{}'",
                        self.image_file.display()
                    )),
            )?;
        }
        Ok(())
    }

    /// Attach the image with partition scanning. No-op when already attached.
    pub fn attach_loop_device(&mut self) -> Result<&str> {
        if self.loop_device.is_none() {
            let out = self.run(
                Cmd::new("losetup")
                    .args(["-P", "-f", "--show"])
                    .arg_path(&self.image_file)
                    .error_msg(format!(
                        "Failed to attach '{}' to a loop device",
                        self.image_file.display()
                    )),
            )?;
            let device = out.stdout_trimmed().to_string();
            if device.is_empty() {
                bail!("losetup printed no device for '{}'", self.image_file.display());
            }
            tracing::info!(device = %device, "attached loop device");
            self.loop_device = Some(device.clone());

            self.run(Cmd::new("udevadm").arg("settle").allow_fail())?;
            self.ensure_partition_nodes(&device)?;
        }
        self.attached()
    }

    /// Create missing `p1`/`p2` nodes from `lsblk` numbers.
    fn ensure_partition_nodes(&mut self, device: &str) -> Result<()> {
        let nodes = [partition_device(device, 1), partition_device(device, 2)];
        if nodes.iter().all(|n| Path::new(n).exists()) {
            return Ok(());
        }

        let out = self.run(
            Cmd::new("lsblk")
                .args(["--raw", "--output", "MAJ:MIN", "--noheadings", device])
                .error_msg(format!("Failed to list partitions of '{}'", device)),
        )?;
        let numbers = parse_lsblk(&out.stdout)?;

        for (node, (major, minor)) in nodes.iter().zip(numbers) {
            let path = PathBuf::from(node);
            if path.exists() {
                continue;
            }
            sys::mknod(&path, libc::S_IFBLK | 0o660, major, minor)
                .with_context(|| format!("Failed to create block device '{}'", node))?;
            tracing::debug!(device = %node, major, minor, "created partition node");
            self.created_nodes.push(path);
        }
        Ok(())
    }

    pub fn create_root_filesystem(&self) -> Result<()> {
        let device = self.root_partition()?;
        match self.filesystem {
            RootFilesystem::Ext4 => {
                self.run(
                    Cmd::new("mkfs.ext4")
                        .args(["-F", "-b", "4096", "-i", "8192", "-m", "0", "-L", "rootfs"])
                        .args(["-E", "resize=536870912"])
                        .arg(&device)
                        .error_msg(format!("Failed to create ext4 filesystem on '{}'", device)),
                )?;
            }
            RootFilesystem::Btrfs => {
                self.run(
                    Cmd::new("mkfs.btrfs")
                        .args(["-f", "-L", "rootfs"])
                        .arg(&device)
                        .error_msg(format!("Failed to create btrfs filesystem on '{}'", device)),
                )?;
                self.create_btrfs_subvolume(&device)?;
            }
        }
        Ok(())
    }

    /// Mount once, create the `@` subvolume, unmount again.
    fn create_btrfs_subvolume(&self, device: &str) -> Result<()> {
        fs::create_dir_all(&self.rootfs_dir)
            .with_context(|| format!("Failed to create '{}'", self.rootfs_dir.display()))?;
        self.run(
            Cmd::new("mount")
                .args(["-t", "btrfs", device])
                .arg_path(&self.rootfs_dir)
                .error_msg(format!("Failed to mount '{}'", device)),
        )?;

        let created = self.run(
            Cmd::new("btrfs")
                .args(["subvolume", "create"])
                .arg_path(&self.rootfs_dir.join("@"))
                .error_msg("Failed to create btrfs subvolume '@'"),
        );
        let unmounted = self.run(
            Cmd::new("umount")
                .arg_path(&self.rootfs_dir)
                .error_msg(format!("Failed to unmount '{}'", self.rootfs_dir.display())),
        );
        created?;
        unmounted?;
        Ok(())
    }

    pub fn create_uefi_filesystem(&self) -> Result<()> {
        let device = self.uefi_partition()?;
        self.run(
            Cmd::new("mkfs.vfat")
                .args(["-F", "32", "-n", "UEFI"])
                .arg(&device)
                .error_msg(format!("Failed to create vfat filesystem on '{}'", device)),
        )?;
        Ok(())
    }

    pub fn mount_root_partition(&self) -> Result<()> {
        let device = self.root_partition()?;
        let options = match self.filesystem {
            RootFilesystem::Ext4 => EXT4_MOUNT_OPTIONS,
            RootFilesystem::Btrfs => BTRFS_MOUNT_OPTIONS,
        };
        fs::create_dir_all(&self.rootfs_dir)
            .with_context(|| format!("Failed to create '{}'", self.rootfs_dir.display()))?;
        self.run(
            Cmd::new("mount")
                .args(["-t", self.filesystem.as_str(), device.as_str()])
                .arg_path(&self.rootfs_dir)
                .args(["-o", options])
                .error_msg(format!(
                    "Failed to mount '{}' at '{}'",
                    device,
                    self.rootfs_dir.display()
                )),
        )?;
        Ok(())
    }

    pub fn mount_uefi_partition(&self) -> Result<()> {
        let device = self.uefi_partition()?;
        let target = self.uefi_dir();
        fs::create_dir_all(&target)
            .with_context(|| format!("Failed to create '{}'", target.display()))?;
        self.run(
            Cmd::new("mount")
                .args(["-t", "vfat", device.as_str()])
                .arg_path(&target)
                .args(["-o", "discard"])
                .error_msg(format!(
                    "Failed to mount '{}' at '{}'",
                    device,
                    target.display()
                )),
        )?;
        Ok(())
    }

    fn uefi_dir(&self) -> PathBuf {
        self.rootfs_dir.join("boot/efi")
    }

    /// Filesystem UUID of `device`, for fstab and the kernel command line.
    pub fn find_partition_uuid(&self, device: &str) -> Result<String> {
        let out = self.run(
            Cmd::new("blkid")
                .args(["-o", "export", device])
                .error_msg(format!("Failed to query '{}'", device)),
        )?;
        out.stdout
            .lines()
            .find_map(|line| line.strip_prefix("UUID="))
            .map(|uuid| uuid.trim().to_string())
            .with_context(|| format!("No UUID reported for '{}'", device))
    }

    pub fn unmount_uefi_partition(&self) -> Result<()> {
        self.unmount(&self.uefi_dir())
    }

    pub fn unmount_root_partition(&self) -> Result<()> {
        self.unmount(&self.rootfs_dir)
    }

    fn unmount(&self, dir: &Path) -> Result<()> {
        let probe = self.run(Cmd::new("mountpoint").arg("-q").arg_path(dir).allow_fail())?;
        if !probe.success() {
            return Ok(());
        }
        self.run(
            Cmd::new("umount")
                .arg("-R")
                .arg_path(dir)
                .error_msg(format!("Failed to unmount '{}'", dir.display())),
        )?;
        Ok(())
    }

    pub fn detach_loop_device(&mut self) -> Result<()> {
        let Some(device) = self.loop_device.clone() else {
            return Ok(());
        };
        self.run(
            Cmd::new("losetup")
                .args(["-d", device.as_str()])
                .error_msg(format!("Failed to detach '{}'", device)),
        )?;
        self.loop_device = None;

        for node in self.created_nodes.drain(..) {
            if let Err(err) = ignore_missing(fs::remove_file(&node)) {
                tracing::warn!(device = %node.display(), "{:#}", err);
            }
        }
        tracing::info!(device = %device, "detached loop device");
        Ok(())
    }

    /// Unmount UEFI, unmount root, detach the loop device. Every step runs.
    pub fn teardown(&mut self) -> Result<()> {
        let mut td = Teardown::new("VM disk teardown");
        td.step("Failed to unmount UEFI partition", self.unmount_uefi_partition());
        td.step("Failed to unmount root partition", self.unmount_root_partition());
        td.step("Failed to detach loop device", self.detach_loop_device());
        td.finish()
    }

    /// Mounts that expose the disk inside the sandbox: the loop device and
    /// both partition nodes under `/dev`, and the UEFI partition at
    /// `/boot/efi`.
    pub fn sandbox_mounts(&self) -> Result<Vec<MountSpec>> {
        let device = self.attached()?;
        let uefi = self.uefi_partition()?;
        let root = self.root_partition()?;

        let mut mounts: Vec<MountSpec> = [device, root.as_str(), uefi.as_str()]
            .iter()
            .map(|dev| MountSpec::bind_file(dev, dev_target(dev)))
            .collect();
        mounts.push(MountSpec::filesystem("vfat", &uefi, "/boot/efi", ""));
        Ok(mounts)
    }

    fn run(&self, cmd: Cmd) -> Result<CommandResult> {
        self.runner.run(&cmd)
    }
}

pub fn partition_device(loop_device: &str, index: u32) -> String {
    format!("{}p{}", loop_device, index)
}

fn dev_target(device: &str) -> PathBuf {
    let name = Path::new(device)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| device.to_string());
    Path::new("/dev").join(name)
}

/// `(major, minor)` of partitions 1 and 2 from `lsblk --raw --output MAJ:MIN`.
///
/// The first line is the loop device itself.
pub fn parse_lsblk(output: &str) -> Result<[(u32, u32); 2]> {
    let lines: Vec<&str> = output.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    if lines.len() != 3 {
        bail!(
            "expected the loop device and two partitions from lsblk, got {} line(s)",
            lines.len()
        );
    }

    let parse = |line: &str| -> Result<(u32, u32)> {
        let (major, minor) = line
            .split_once(':')
            .with_context(|| format!("malformed lsblk line '{}'", line))?;
        Ok((
            major.parse().with_context(|| format!("bad major in '{}'", line))?,
            minor.parse().with_context(|| format!("bad minor in '{}'", line))?,
        ))
    };

    Ok([parse(lines[1])?, parse(lines[2])?])
}
