//! Privileged chroot sandbox around a rootfs directory.
//!
//! [`enter`] bind-mounts the rootfs onto itself, stages the system mounts,
//! chroots into it and prepares `/dev`, the environment and a `policy-rc.d`
//! override. It returns a [`SandboxLease`]; [`SandboxLease::exit`] (or drop)
//! reverses all of it.
//!
//! chroot and the working directory are process-wide, so only one lease can
//! be outstanding per process. A lock file next to the rootfs keeps other
//! processes from entering the same tree at the same time.

pub mod devices;
pub mod env;
pub mod mounts;
pub mod procs;
pub mod sys;

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use std::fs::{self, File};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::teardown::{ignore_missing, Teardown};

pub use env::EnvironmentSet;
pub use mounts::MountSpec;

const POLICY_RC_DIR: &str = "/usr/sbin";
const POLICY_RC_PATH: &str = "/usr/sbin/policy-rc.d";
const POLICY_RC_SCRIPT: &str = "#!/bin/sh\nexit 101\n";

static ACTIVE: Mutex<Option<PathBuf>> = Mutex::new(None);

/// Rootfs of the lease currently held by this process, if any.
pub fn active_rootfs() -> Option<PathBuf> {
    ACTIVE.lock().unwrap_or_else(|e| e.into_inner()).clone()
}

/// Process-wide claim released on drop.
#[derive(Debug)]
struct ActiveGuard;

impl ActiveGuard {
    fn acquire(rootfs: &Path) -> Result<Self> {
        let mut active = ACTIVE.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = active.as_ref() {
            bail!(
                "Cannot enter '{}': sandbox for '{}' is still active",
                rootfs.display(),
                current.display()
            );
        }
        *active = Some(rootfs.to_path_buf());
        Ok(ActiveGuard)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        *ACTIVE.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

fn lock_path(rootfs: &Path) -> PathBuf {
    let name = rootfs
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "rootfs".to_string());
    rootfs
        .parent()
        .unwrap_or(Path::new("/"))
        .join(format!(".{}.sandbox.lock", name))
}

/// Exclusive lock file beside the rootfs, removed again on drop.
#[derive(Debug)]
struct RootfsLock {
    path: PathBuf,
    _file: File,
}

impl Drop for RootfsLock {
    fn drop(&mut self) {
        if let Err(err) = ignore_missing(fs::remove_file(&self.path)) {
            tracing::warn!(path = %self.path.display(), "{:#}", err);
        }
    }
}

fn lock_rootfs(rootfs: &Path) -> Result<RootfsLock> {
    let path = lock_path(rootfs);
    let file = File::create(&path)
        .with_context(|| format!("Failed to create lock file '{}'", path.display()))?;
    file.try_lock_exclusive().with_context(|| {
        format!("'{}' is in use by another build process", rootfs.display())
    })?;
    Ok(RootfsLock { path, _file: file })
}

/// An entered sandbox. Dropping it exits the sandbox.
#[derive(Debug)]
pub struct SandboxLease {
    rootfs: PathBuf,
    host_root: File,
    host_cwd: PathBuf,
    saved_env: Option<EnvironmentSet>,
    policy_rc_installed: bool,
    inside: bool,
    _lock: RootfsLock,
    _guard: ActiveGuard,
}

/// Enter a sandbox rooted at `rootfs`.
///
/// `extra_mounts` are mounted after the system mounts, in order. On success the
/// process is chrooted into `rootfs` with `environment` applied.
pub fn enter(
    rootfs: &Path,
    environment: &EnvironmentSet,
    extra_mounts: &[MountSpec],
) -> Result<SandboxLease> {
    let rootfs = rootfs
        .canonicalize()
        .with_context(|| format!("Failed to resolve rootfs '{}'", rootfs.display()))?;
    if !rootfs.is_dir() {
        bail!("rootfs '{}' is not a directory", rootfs.display());
    }

    let guard = ActiveGuard::acquire(&rootfs)?;
    let lock = lock_rootfs(&rootfs)?;

    tracing::info!(rootfs = %rootfs.display(), "entering sandbox");

    let plan = mounts::mount_plan(extra_mounts);
    prepare_host_side(&rootfs, &plan).map_err(|err| {
        undo_host_side(&rootfs);
        err
    })?;

    let host_root = File::open("/").context("Failed to open host root")?;
    let host_cwd = std::env::current_dir().context("Failed to read working directory")?;

    if let Err(err) = sys::chroot(&rootfs) {
        undo_host_side(&rootfs);
        return Err(err).with_context(|| format!("Failed to chroot into '{}'", rootfs.display()));
    }

    let mut lease = SandboxLease {
        rootfs,
        host_root,
        host_cwd,
        saved_env: None,
        policy_rc_installed: false,
        inside: true,
        _lock: lock,
        _guard: guard,
    };

    if let Err(err) = lease.finish_setup(&plan, environment) {
        if let Err(cleanup) = lease.teardown() {
            tracing::warn!("{:#}", cleanup);
        }
        return Err(err);
    }

    Ok(lease)
}

/// Bind the rootfs onto itself, make it private and stage the mounts.
fn prepare_host_side(rootfs: &Path, plan: &[MountSpec]) -> Result<()> {
    let source = rootfs.to_string_lossy();
    sys::mount(&source, rootfs, "", sys::MS_BIND, "")
        .with_context(|| format!("Failed to bind-mount '{}'", rootfs.display()))?;
    sys::mount("none", rootfs, "", sys::MS_REC | sys::MS_PRIVATE, "")
        .with_context(|| format!("Failed to make '{}' private", rootfs.display()))?;
    mounts::stage(rootfs, plan)
}

/// Best-effort undo for a failure before chroot.
fn undo_host_side(rootfs: &Path) {
    if let Err(err) = sys::umount2(rootfs, sys::MNT_DETACH) {
        tracing::warn!(rootfs = %rootfs.display(), %err, "Failed to detach rootfs");
    }
    let staging = rootfs.join(mounts::STAGING_DIR);
    if let Err(err) = ignore_missing(fs::remove_dir_all(&staging)) {
        tracing::warn!(path = %staging.display(), "{:#}", err);
    }
}

impl SandboxLease {
    pub fn rootfs(&self) -> &Path {
        &self.rootfs
    }

    fn finish_setup(&mut self, plan: &[MountSpec], environment: &EnvironmentSet) -> Result<()> {
        let root = Path::new("/");
        std::env::set_current_dir(root).context("Failed to chdir into sandbox")?;
        mounts::relocate(root, plan)?;
        devices::populate(&root.join("dev"))?;

        self.saved_env = Some(environment.apply());

        if Path::new(POLICY_RC_DIR).is_dir() && !Path::new(POLICY_RC_PATH).exists() {
            fs::write(POLICY_RC_PATH, POLICY_RC_SCRIPT)
                .with_context(|| format!("Failed to write '{}'", POLICY_RC_PATH))?;
            self.policy_rc_installed = true;
            fs::set_permissions(POLICY_RC_PATH, fs::Permissions::from_mode(0o755))
                .with_context(|| format!("Failed to chmod '{}'", POLICY_RC_PATH))?;
        }

        Ok(())
    }

    /// Leave the sandbox and release it.
    pub fn exit(mut self) -> Result<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<()> {
        if !self.inside {
            return Ok(());
        }
        self.inside = false;

        tracing::info!(rootfs = %self.rootfs.display(), "exiting sandbox");
        let mut td = Teardown::new("sandbox exit");

        if self.policy_rc_installed {
            td.step(
                "Failed to remove policy-rc.d",
                ignore_missing(fs::remove_file(POLICY_RC_PATH)),
            );
        }

        if let Some(previous) = self.saved_env.take() {
            previous.apply();
        }

        let escaped = self.leave_chroot();
        let escaped_ok = escaped.is_ok();
        td.step("Failed to leave chroot", escaped);
        if !escaped_ok {
            // Host paths below are meaningless while still chrooted.
            return td.finish();
        }

        let host_proc = self.rootfs.join("proc");
        let proc_dir = if host_proc.join("self").exists() {
            host_proc
        } else {
            PathBuf::from("/proc")
        };
        td.step(
            "Failed to kill sandbox processes",
            procs::kill_rooted_at(&proc_dir, &self.rootfs).map(|_| ()),
        );

        td.step(
            "Failed to unmount rootfs",
            sys::umount2(&self.rootfs, sys::MNT_DETACH)
                .with_context(|| self.rootfs.display().to_string()),
        );

        let staging = self.rootfs.join(mounts::STAGING_DIR);
        td.step(
            "Failed to remove staging directory",
            ignore_missing(fs::remove_dir_all(&staging)),
        );

        td.step("Failed to reset dev", reset_dev(&self.rootfs));

        td.finish()
    }

    fn leave_chroot(&self) -> Result<()> {
        sys::fchdir(&self.host_root).context("fchdir to host root")?;
        sys::chroot(Path::new(".")).context("chroot to host root")?;
        std::env::set_current_dir(&self.host_cwd)
            .with_context(|| format!("chdir to '{}'", self.host_cwd.display()))
    }
}

impl Drop for SandboxLease {
    fn drop(&mut self) {
        if let Err(err) = self.teardown() {
            tracing::error!("{:#}", err);
        }
    }
}

/// Replace `<rootfs>/dev` with an empty directory.
fn reset_dev(rootfs: &Path) -> Result<()> {
    let dev = rootfs.join("dev");
    ignore_missing(fs::remove_dir_all(&dev))
        .with_context(|| format!("Failed to remove '{}'", dev.display()))?;
    fs::DirBuilder::new()
        .mode(0o755)
        .create(&dev)
        .with_context(|| format!("Failed to create '{}'", dev.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::os::unix::fs::{FileTypeExt, MetadataExt};
    use tempfile::TempDir;

    #[test]
    #[serial]
    fn test_second_guard_is_refused() {
        let first = ActiveGuard::acquire(Path::new("/build/a")).unwrap();
        let err = ActiveGuard::acquire(Path::new("/build/b")).unwrap_err();
        assert!(err.to_string().contains("/build/a"));
        assert_eq!(active_rootfs(), Some(PathBuf::from("/build/a")));

        drop(first);
        assert_eq!(active_rootfs(), None);
        drop(ActiveGuard::acquire(Path::new("/build/b")).unwrap());
    }

    #[test]
    fn test_lock_path_is_beside_rootfs() {
        assert_eq!(
            lock_path(Path::new("/var/cache/build/rootfs")),
            PathBuf::from("/var/cache/build/.rootfs.sandbox.lock")
        );
    }

    #[test]
    fn test_rootfs_lock_is_exclusive() {
        let temp = TempDir::new().unwrap();
        let rootfs = temp.path().join("rootfs");
        fs::create_dir(&rootfs).unwrap();

        let held = lock_rootfs(&rootfs).unwrap();
        assert!(lock_rootfs(&rootfs).is_err());
        drop(held);
        assert!(lock_rootfs(&rootfs).is_ok());
    }

    #[test]
    fn test_rootfs_lock_file_removed_on_release() {
        let temp = TempDir::new().unwrap();
        let rootfs = temp.path().join("rootfs");
        fs::create_dir(&rootfs).unwrap();

        let held = lock_rootfs(&rootfs).unwrap();
        assert!(lock_path(&rootfs).exists());
        drop(held);
        assert!(!lock_path(&rootfs).exists());
    }

    #[test]
    fn test_reset_dev_leaves_empty_dir() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("dev/pts")).unwrap();
        fs::write(temp.path().join("dev/leftover"), "x").unwrap();

        reset_dev(temp.path()).unwrap();
        let dev = temp.path().join("dev");
        assert!(dev.is_dir());
        assert_eq!(fs::read_dir(&dev).unwrap().count(), 0);
    }

    #[test]
    #[serial]
    fn test_enter_missing_rootfs_fails_without_claiming() {
        let err = enter(
            Path::new("/nonexistent/rootfs-builder"),
            &EnvironmentSet::new(),
            &[],
        )
        .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/rootfs-builder"));
        assert_eq!(active_rootfs(), None);
    }

    fn minimal_rootfs() -> TempDir {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join("rootfs")).unwrap();
        for dir in ["etc", "usr/sbin", "proc", "sys", "dev", "run", "tmp"] {
            fs::create_dir_all(temp.path().join("rootfs").join(dir)).unwrap();
        }
        temp
    }

    fn mounts_under(path: &Path) -> Vec<String> {
        let prefix = path.to_string_lossy().into_owned();
        fs::read_to_string("/proc/self/mountinfo")
            .unwrap()
            .lines()
            .filter_map(|line| line.split_whitespace().nth(4).map(str::to_string))
            .filter(|mount_point| mount_point.starts_with(&prefix))
            .collect()
    }

    #[test]
    #[serial]
    #[ignore = "requires root"]
    fn test_enter_exit_round_trip() {
        let temp = minimal_rootfs();
        let rootfs = temp.path().join("rootfs").canonicalize().unwrap();

        let lease = enter(&rootfs, &EnvironmentSet::defaults(), &[]).unwrap();
        assert_eq!(active_rootfs(), Some(rootfs.clone()));
        assert!(Path::new(POLICY_RC_PATH).exists());
        assert!(!Path::new("/").join(mounts::STAGING_DIR).exists());
        lease.exit().unwrap();

        assert!(mounts_under(&rootfs).is_empty());
        assert!(!lock_path(&rootfs).exists());
        assert!(!rootfs.join("usr/sbin/policy-rc.d").exists());
        assert_eq!(fs::read_dir(rootfs.join("dev")).unwrap().count(), 0);
        assert_eq!(active_rootfs(), None);
    }

    #[test]
    #[serial]
    #[ignore = "requires root"]
    fn test_devices_inside_sandbox() {
        let temp = minimal_rootfs();
        let rootfs = temp.path().join("rootfs");

        let lease = enter(&rootfs, &EnvironmentSet::defaults(), &[]).unwrap();
        let expected = [("null", 1, 3), ("zero", 1, 5), ("urandom", 1, 9)];
        let found: Vec<_> = expected
            .iter()
            .map(|(name, _, _)| fs::metadata(Path::new("/dev").join(name)).unwrap())
            .collect();
        let shm_mode = fs::metadata("/dev/shm").unwrap().mode() & 0o7777;
        let path_var = std::env::var("PATH").unwrap();
        lease.exit().unwrap();

        for ((_, major, minor), meta) in expected.iter().zip(found) {
            assert!(meta.file_type().is_char_device());
            assert_eq!(meta.rdev(), libc::makedev(*major, *minor));
            assert_eq!(meta.mode() & 0o7777, 0o666);
        }
        assert_eq!(shm_mode, 0o1777);
        assert_eq!(path_var, env::DEFAULT_PATH);
    }

    #[test]
    #[serial]
    #[ignore = "requires root"]
    fn test_dropping_lease_exits() {
        let temp = minimal_rootfs();
        let rootfs = temp.path().join("rootfs").canonicalize().unwrap();

        drop(enter(&rootfs, &EnvironmentSet::new(), &[]).unwrap());
        assert!(mounts_under(&rootfs).is_empty());
        assert_eq!(active_rootfs(), None);
    }
}
