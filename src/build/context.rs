//! Runtime options for a build.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::definition::Definition;
use crate::filter::TargetType;

/// Fallback when the user has no cache directory.
pub const SYSTEM_CACHE_DIR: &str = "/var/cache/rootfs-builder";

pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|dir| dir.join("rootfs-builder"))
        .unwrap_or_else(|| PathBuf::from(SYSTEM_CACHE_DIR))
}

/// `<target>/<name>.raw`, named after the image or its distribution,
/// release and architecture.
pub fn vm_image_path(definition: &Definition, target: &Path) -> PathBuf {
    let image = &definition.image;
    let name = if image.name.is_empty() {
        format!("{}-{}-{}", image.distribution, image.release, image.architecture)
    } else {
        image.name.clone()
    };
    target.join(format!("{}.raw", name))
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub target_type: TargetType,
    /// Holds the work tree and the VM disk mount point.
    pub cache_dir: PathBuf,
    /// Copy the source instead of mounting an overlay over it.
    pub disable_overlay: bool,
    /// Set to abort between build steps.
    pub cancel: Arc<AtomicBool>,
}

impl BuildOptions {
    pub fn new(target_type: TargetType, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            target_type,
            cache_dir: cache_dir.into(),
            disable_overlay: false,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn vm_rootfs_dir(&self) -> PathBuf {
        self.cache_dir.join("vm-rootfs")
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_paths() {
        let mut def = Definition::parse(
            "[image]\ndistribution = \"ubuntu\"\nrelease = \"bionic\"\narchitecture = \"amd64\"\n",
        )
        .unwrap();
        let options = BuildOptions::new(TargetType::Vm, "/var/cache/rb");
        let target = Path::new("/srv/images");
        assert_eq!(
            vm_image_path(&def, target),
            PathBuf::from("/srv/images/ubuntu-bionic-amd64.raw")
        );
        def.image.name = "custom".into();
        assert_eq!(vm_image_path(&def, target), PathBuf::from("/srv/images/custom.raw"));
        assert_eq!(options.vm_rootfs_dir(), PathBuf::from("/var/cache/rb/vm-rootfs"));
    }

    #[test]
    fn test_default_cache_dir_is_named() {
        assert!(default_cache_dir().ends_with("rootfs-builder"));
    }
}
