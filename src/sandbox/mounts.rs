//! Mount list, staging and relocation.
//!
//! Mounts are first made under `<rootfs>/.distrobuilder/<index>` while still
//! outside the chroot, then moved to their final targets from inside it, so
//! symlinked targets such as `/etc/resolv.conf` resolve against the image
//! rather than the host.

use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Component, Path, PathBuf};

use super::sys;

/// Holding directory for staged mounts, relative to the rootfs.
pub const STAGING_DIR: &str = ".distrobuilder";

/// Symlink hops followed while resolving a mount target.
const MAX_SYMLINK_HOPS: usize = 40;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub source: String,
    /// Absolute path inside the sandbox.
    pub target: PathBuf,
    pub fs_type: String,
    pub flags: sys::c_ulong,
    pub data: String,
    /// Mount point is a directory (false for bind-mounted files and devices).
    pub is_dir: bool,
}

impl MountSpec {
    pub fn filesystem(fs_type: &str, source: &str, target: &str, data: &str) -> Self {
        Self {
            source: source.to_string(),
            target: PathBuf::from(target),
            fs_type: fs_type.to_string(),
            flags: 0,
            data: data.to_string(),
            is_dir: true,
        }
    }

    pub fn tmpfs(target: &str, data: &str) -> Self {
        Self::filesystem("tmpfs", "tmpfs", target, data)
    }

    /// Bind a single host file or device node onto a file inside the sandbox.
    pub fn bind_file(source: impl AsRef<Path>, target: impl AsRef<Path>) -> Self {
        Self {
            source: source.as_ref().to_string_lossy().into_owned(),
            target: target.as_ref().to_path_buf(),
            fs_type: String::new(),
            flags: sys::MS_BIND,
            data: String::new(),
            is_dir: false,
        }
    }
}

/// Fixed system mounts, in mount order.
pub fn system_mounts() -> Vec<MountSpec> {
    vec![
        MountSpec::filesystem("proc", "proc", "/proc", ""),
        MountSpec::filesystem("sysfs", "sysfs", "/sys", ""),
        MountSpec::tmpfs("/run", ""),
        MountSpec::tmpfs("/tmp", ""),
        MountSpec::tmpfs("/dev", "mode=0755"),
        MountSpec::tmpfs("/dev/shm", ""),
        MountSpec::filesystem(
            "devpts",
            "devpts",
            "/dev/pts",
            "newinstance,ptmxmode=0666,mode=0620",
        ),
        MountSpec::bind_file("/etc/resolv.conf", "/etc/resolv.conf"),
    ]
}

/// System mounts followed by `extra`, dropping file binds whose host source is
/// missing.
pub fn mount_plan(extra: &[MountSpec]) -> Vec<MountSpec> {
    system_mounts()
        .into_iter()
        .chain(extra.iter().cloned())
        .filter(|m| {
            let keep = m.is_dir || m.flags & sys::MS_BIND == 0 || Path::new(&m.source).exists();
            if !keep {
                tracing::warn!(source = %m.source, "bind source missing, skipping mount");
            }
            keep
        })
        .collect()
}

pub fn staging_path(rootfs: &Path, index: usize) -> PathBuf {
    rootfs.join(STAGING_DIR).join(index.to_string())
}

/// Mount every entry at its staging path under `rootfs`.
pub fn stage(rootfs: &Path, mounts: &[MountSpec]) -> Result<()> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(rootfs.join(STAGING_DIR))
        .with_context(|| format!("Failed to create staging directory in '{}'", rootfs.display()))?;

    for (index, mount) in mounts.iter().enumerate() {
        let holding = staging_path(rootfs, index);
        create_mount_point(&holding, mount.is_dir)?;
        sys::mount(&mount.source, &holding, &mount.fs_type, mount.flags, &mount.data)
            .with_context(|| {
                format!(
                    "Failed to mount '{}' for '{}'",
                    mount.source,
                    mount.target.display()
                )
            })?;
    }

    Ok(())
}

/// Move staged mounts into place. `root` is the sandbox root as seen by the
/// current process, `/` once inside the chroot.
pub fn relocate(root: &Path, mounts: &[MountSpec]) -> Result<()> {
    for (index, mount) in mounts.iter().enumerate() {
        let holding = staging_path(root, index);
        let target = resolve_target(root, &mount.target);
        create_mount_point(&target, mount.is_dir)?;
        sys::mount(&holding.to_string_lossy(), &target, "", sys::MS_MOVE, "").with_context(
            || format!("Failed to move mount into '{}'", mount.target.display()),
        )?;
    }

    let staging = root.join(STAGING_DIR);
    fs::remove_dir_all(&staging)
        .with_context(|| format!("Failed to remove '{}'", staging.display()))
}

fn create_mount_point(path: &Path, is_dir: bool) -> Result<()> {
    if is_dir {
        fs::create_dir_all(path)
            .with_context(|| format!("Failed to create mount point '{}'", path.display()))?;
        return Ok(());
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create '{}'", parent.display()))?;
    }
    OpenOptions::new()
        .write(true)
        .create(true)
        .open(path)
        .with_context(|| format!("Failed to create mount point '{}'", path.display()))?;
    Ok(())
}

enum Step {
    Parent,
    Name(OsString),
}

fn steps(path: &Path) -> impl Iterator<Item = Step> + '_ {
    path.components().filter_map(|c| match c {
        Component::ParentDir => Some(Step::Parent),
        Component::Normal(name) => Some(Step::Name(name.to_os_string())),
        _ => None,
    })
}

/// Resolve `target` against `root`, following symlinks in every component
/// without ever escaping `root`.
///
/// Missing components are taken literally. Absolute link targets restart at
/// `root`; relative ones continue from the link's directory.
pub fn resolve_target(root: &Path, target: &Path) -> PathBuf {
    let mut resolved = PathBuf::new();
    let mut pending: VecDeque<Step> = steps(target).collect();
    let mut hops = 0;

    while let Some(step) = pending.pop_front() {
        let name = match step {
            Step::Parent => {
                resolved.pop();
                continue;
            }
            Step::Name(name) => name,
        };

        let candidate = resolved.join(&name);
        let on_disk = root.join(&candidate);

        let is_link = fs::symlink_metadata(&on_disk)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        if !is_link || hops >= MAX_SYMLINK_HOPS {
            resolved = candidate;
            continue;
        }

        let Ok(link) = fs::read_link(&on_disk) else {
            resolved = candidate;
            continue;
        };
        hops += 1;

        if link.is_absolute() {
            resolved = PathBuf::new();
        }
        for step in steps(&link).collect::<Vec<_>>().into_iter().rev() {
            pending.push_front(step);
        }
    }

    root.join(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    #[test]
    fn test_system_mount_order() {
        let targets: Vec<_> = system_mounts()
            .iter()
            .map(|m| m.target.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            targets,
            [
                "/proc",
                "/sys",
                "/run",
                "/tmp",
                "/dev",
                "/dev/shm",
                "/dev/pts",
                "/etc/resolv.conf"
            ]
        );
        let resolv = system_mounts().pop().unwrap();
        assert!(!resolv.is_dir);
        assert_eq!(resolv.flags, sys::MS_BIND);
    }

    #[test]
    fn test_mount_plan_appends_extras_and_skips_missing_binds() {
        let extra = vec![
            MountSpec::bind_file("/nonexistent/loop0p2", "/dev/loop0p2"),
            MountSpec::filesystem("vfat", "/dev/loop0p1", "/boot/efi", ""),
        ];
        let plan = mount_plan(&extra);
        assert_eq!(plan.last().unwrap().target, PathBuf::from("/boot/efi"));
        assert!(plan.iter().all(|m| m.source != "/nonexistent/loop0p2"));
        assert_eq!(plan[0].target, PathBuf::from("/proc"));
    }

    #[test]
    fn test_staging_path() {
        assert_eq!(
            staging_path(Path::new("/build/rootfs"), 3),
            PathBuf::from("/build/rootfs/.distrobuilder/3")
        );
    }

    #[test]
    fn test_resolve_plain_path() {
        let root = TempDir::new().unwrap();
        assert_eq!(
            resolve_target(root.path(), Path::new("/proc")),
            root.path().join("proc")
        );
    }

    #[test]
    fn test_resolve_relative_file_link() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("etc")).unwrap();
        symlink(
            "../run/systemd/resolve/stub-resolv.conf",
            root.path().join("etc/resolv.conf"),
        )
        .unwrap();

        assert_eq!(
            resolve_target(root.path(), Path::new("/etc/resolv.conf")),
            root.path().join("run/systemd/resolve/stub-resolv.conf")
        );
    }

    #[test]
    fn test_resolve_absolute_link_stays_in_root() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("dev")).unwrap();
        symlink("/run/shm", root.path().join("dev/shm")).unwrap();

        assert_eq!(
            resolve_target(root.path(), Path::new("/dev/shm")),
            root.path().join("run/shm")
        );
    }

    #[test]
    fn test_resolve_linked_parent_directory() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("usr/lib")).unwrap();
        symlink("usr/lib", root.path().join("lib")).unwrap();

        assert_eq!(
            resolve_target(root.path(), Path::new("/lib/modules")),
            root.path().join("usr/lib/modules")
        );
    }

    #[test]
    fn test_resolve_cannot_escape_root() {
        let root = TempDir::new().unwrap();
        symlink("../../../../etc", root.path().join("etc")).unwrap();

        assert_eq!(
            resolve_target(root.path(), Path::new("/etc/resolv.conf")),
            root.path().join("etc/resolv.conf")
        );
    }

    #[test]
    fn test_resolve_symlink_loop_terminates() {
        let root = TempDir::new().unwrap();
        symlink("b", root.path().join("a")).unwrap();
        symlink("a", root.path().join("b")).unwrap();

        let resolved = resolve_target(root.path(), Path::new("/a"));
        assert!(resolved.starts_with(root.path()));
    }
}
