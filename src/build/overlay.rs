//! Scratch copy of the source rootfs that a build mutates.
//!
//! The source tree is never written to. By default it becomes the lower layer
//! of an overlay mounted at `<cache>/overlay`, with `upper` and `work` beside
//! it. On xfs or zfs, when the overlay mount fails, or with overlays disabled,
//! the source is copied into `<cache>/overlay` instead.

use anyhow::{bail, Context, Result};
use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use super::copy_tree;
use crate::process::CommandRunner;
use crate::sandbox::sys;
use crate::teardown::{ignore_missing, Teardown};

const XFS_SUPER_MAGIC: i64 = 0x5846_5342;
const ZFS_SUPER_MAGIC: i64 = 0x2fc1_2fc1;

/// Name of a filesystem overlayfs cannot sit on, by statfs magic.
pub fn unsupported_filesystem(magic: i64) -> Option<&'static str> {
    match magic {
        XFS_SUPER_MAGIC => Some("xfs"),
        ZFS_SUPER_MAGIC => Some("zfs"),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkTreeKind {
    Overlay,
    Copy,
}

#[derive(Debug)]
pub struct WorkTree {
    kind: WorkTreeKind,
    merged: PathBuf,
    upper: PathBuf,
    work: PathBuf,
    released: bool,
}

impl WorkTree {
    /// Prepare a work tree for `source` under `cache_dir`.
    pub fn create(
        runner: &dyn CommandRunner,
        cache_dir: &Path,
        source: &Path,
        disable_overlay: bool,
    ) -> Result<Self> {
        fs::create_dir_all(cache_dir).with_context(|| {
            format!("Failed to create cache directory '{}'", cache_dir.display())
        })?;

        if !disable_overlay {
            match Self::mount_overlay(cache_dir, source) {
                Ok(tree) => return Ok(tree),
                Err(err) => tracing::warn!("Failed to create overlay, copying instead: {:#}", err),
            }
        }
        Self::copy(runner, cache_dir, source)
    }

    fn new(kind: WorkTreeKind, cache_dir: &Path) -> Self {
        Self {
            kind,
            merged: cache_dir.join("overlay"),
            upper: cache_dir.join("upper"),
            work: cache_dir.join("work"),
            released: false,
        }
    }

    fn mount_overlay(cache_dir: &Path, source: &Path) -> Result<Self> {
        for dir in [cache_dir, source] {
            let magic = sys::statfs_magic(dir)
                .with_context(|| format!("Failed to stat filesystem of '{}'", dir.display()))?;
            if let Some(name) = unsupported_filesystem(magic) {
                bail!("overlay not supported on {} ('{}')", name, dir.display());
            }
        }

        let mut tree = Self::new(WorkTreeKind::Overlay, cache_dir);
        for dir in [&tree.upper, &tree.merged, &tree.work] {
            fs::DirBuilder::new()
                .mode(0o755)
                .create(dir)
                .with_context(|| format!("Failed to create directory '{}'", dir.display()))?;
        }

        let options = format!(
            "lowerdir={},upperdir={},workdir={}",
            source.display(),
            tree.upper.display(),
            tree.work.display()
        );
        if let Err(err) = sys::mount("overlay", &tree.merged, "overlay", 0, &options) {
            tree.remove_layers(&mut Teardown::new("overlay setup"));
            tree.released = true;
            return Err(err).context("Failed to mount overlay");
        }

        tracing::info!(dir = %tree.merged.display(), "mounted overlay");
        Ok(tree)
    }

    fn copy(runner: &dyn CommandRunner, cache_dir: &Path, source: &Path) -> Result<Self> {
        let tree = Self::new(WorkTreeKind::Copy, cache_dir);
        fs::create_dir_all(&tree.merged)
            .with_context(|| format!("Failed to create '{}'", tree.merged.display()))?;
        copy_tree(runner, source, &tree.merged)?;
        Ok(tree)
    }

    pub fn kind(&self) -> WorkTreeKind {
        self.kind
    }

    /// Directory the sandbox runs in.
    pub fn path(&self) -> &Path {
        &self.merged
    }

    /// Copy the finished tree to `target`.
    pub fn export(&self, runner: &dyn CommandRunner, target: &Path) -> Result<()> {
        fs::create_dir_all(target)
            .with_context(|| format!("Failed to create '{}'", target.display()))?;
        copy_tree(runner, &self.merged, target)
    }

    /// Unmount and delete the work tree. Every step runs.
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let mut td = Teardown::new("work tree cleanup");
        match self.kind {
            WorkTreeKind::Overlay => {
                sys::sync();
                td.step(
                    "Failed to unmount overlay directory",
                    sys::umount2(&self.merged, 0)
                        .with_context(|| self.merged.display().to_string()),
                );
                self.remove_layers(&mut td);
            }
            WorkTreeKind::Copy => td.step(
                "Failed to remove copied tree",
                ignore_missing(fs::remove_dir_all(&self.merged)),
            ),
        }
        td.finish()
    }

    /// `merged` is only ever removed when empty, so a still-mounted overlay
    /// never exposes the source to deletion.
    fn remove_layers(&self, td: &mut Teardown) {
        td.step(
            "Failed to remove upper directory",
            ignore_missing(fs::remove_dir_all(&self.upper)),
        );
        td.step(
            "Failed to remove work directory",
            ignore_missing(fs::remove_dir_all(&self.work)),
        );
        td.step(
            "Failed to remove overlay directory",
            ignore_missing(fs::remove_dir(&self.merged)),
        );
    }
}

impl Drop for WorkTree {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            tracing::warn!("{:#}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::RecordingRunner;
    use tempfile::TempDir;

    #[test]
    fn test_unsupported_filesystems() {
        assert_eq!(unsupported_filesystem(XFS_SUPER_MAGIC), Some("xfs"));
        assert_eq!(unsupported_filesystem(ZFS_SUPER_MAGIC), Some("zfs"));
        // ext4
        assert_eq!(unsupported_filesystem(0xef53), None);
    }

    #[test]
    fn test_disabled_overlay_copies_source() {
        let temp = TempDir::new().unwrap();
        let cache = temp.path().join("cache");
        let source = temp.path().join("rootfs");
        fs::create_dir(&source).unwrap();
        let runner = RecordingRunner::new();

        let mut tree = WorkTree::create(&runner, &cache, &source, true).unwrap();
        assert_eq!(tree.kind(), WorkTreeKind::Copy);
        assert_eq!(tree.path(), cache.join("overlay"));
        assert!(tree.path().is_dir());
        assert_eq!(
            runner.lines(),
            [format!(
                "rsync -aHAX --numeric-ids {}/ {}",
                source.display(),
                cache.join("overlay").display()
            )]
        );

        tree.release().unwrap();
        assert!(!cache.join("overlay").exists());
        assert!(tree.release().is_ok());
    }

    #[test]
    fn test_export_copies_tree_to_target() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("rootfs");
        fs::create_dir(&source).unwrap();
        let runner = RecordingRunner::new();
        let tree = WorkTree::create(&runner, &temp.path().join("cache"), &source, true).unwrap();
        runner.calls.borrow_mut().clear();

        let target = temp.path().join("out");
        tree.export(&runner, &target).unwrap();
        assert!(target.is_dir());
        assert_eq!(
            runner.lines(),
            [format!(
                "rsync -aHAX --numeric-ids {}/ {}",
                tree.path().display(),
                target.display()
            )]
        );
    }

    #[test]
    fn test_release_leaves_cache_clean() {
        let temp = TempDir::new().unwrap();
        let cache = temp.path().join("cache");
        let source = temp.path().join("rootfs");
        fs::create_dir(&source).unwrap();
        let runner = RecordingRunner::new();

        // Without root the overlay mount fails and the copy fallback is used.
        let tree = WorkTree::create(&runner, &cache, &source, false).unwrap();
        drop(tree);
        for dir in ["overlay", "upper", "work"] {
            assert!(!cache.join(dir).exists(), "{} left behind", dir);
        }
    }

    #[test]
    #[ignore = "requires root"]
    fn test_overlay_keeps_source_untouched() {
        let temp = TempDir::new().unwrap();
        let cache = temp.path().join("cache");
        let source = temp.path().join("rootfs");
        fs::create_dir_all(source.join("etc")).unwrap();
        fs::write(source.join("etc/hostname"), "source\n").unwrap();

        let mut tree =
            WorkTree::create(&crate::process::SystemRunner, &cache, &source, false).unwrap();
        assert_eq!(tree.kind(), WorkTreeKind::Overlay);
        fs::write(tree.path().join("etc/hostname"), "changed\n").unwrap();
        fs::write(tree.path().join("new-file"), "x").unwrap();
        tree.release().unwrap();

        assert_eq!(fs::read_to_string(source.join("etc/hostname")).unwrap(), "source\n");
        assert!(!source.join("new-file").exists());
        for dir in ["overlay", "upper", "work"] {
            assert!(!cache.join(dir).exists());
        }
    }
}
