//! Image definition loaded from TOML.
//!
//! The definition describes the image (distribution, release, architecture),
//! the environment inside the sandbox, package sets and repositories for the
//! package manager, and shell actions triggered at fixed points of a build.
//! Every list entry carries filter fields evaluated by [`crate::filter`].

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

use crate::filter::{BuildSelector, ImageTarget, TargetType};
use crate::impl_filterable;
use crate::managers::Backend;

/// Default VM disk size: 4 GiB.
pub const DEFAULT_VM_SIZE: u64 = 4 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Definition {
    pub image: Image,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    #[serde(default)]
    pub targets: Targets,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub packages: Packages,
    #[serde(default)]
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Image {
    pub distribution: String,
    pub release: String,
    #[serde(default = "host_architecture")]
    pub architecture: String,
    #[serde(default = "default_variant")]
    pub variant: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Where the rootfs tree comes from. Consumed by downloaders, not by the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Source {
    pub downloader: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Targets {
    #[serde(default, rename = "type")]
    pub kind: TargetType,
    #[serde(default)]
    pub vm: VmTarget,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VmTarget {
    #[serde(default = "default_vm_size")]
    pub size: u64,
    #[serde(default)]
    pub filesystem: RootFilesystem,
}

impl Default for VmTarget {
    fn default() -> Self {
        Self {
            size: DEFAULT_VM_SIZE,
            filesystem: RootFilesystem::default(),
        }
    }
}

/// Filesystem used for the VM root partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RootFilesystem {
    #[default]
    Ext4,
    Btrfs,
}

impl RootFilesystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            RootFilesystem::Ext4 => "ext4",
            RootFilesystem::Btrfs => "btrfs",
        }
    }
}

impl fmt::Display for RootFilesystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Environment {
    #[serde(default)]
    pub clear_defaults: bool,
    #[serde(default)]
    pub variables: Vec<EnvVariable>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvVariable {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub releases: Vec<String>,
    #[serde(default)]
    pub architectures: Vec<String>,
    #[serde(default)]
    pub variants: Vec<String>,
    #[serde(default)]
    pub types: Vec<TargetType>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Packages {
    #[serde(default)]
    pub manager: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_manager: Option<CustomManager>,
    #[serde(default)]
    pub update: bool,
    #[serde(default)]
    pub cleanup: bool,
    #[serde(default)]
    pub sets: Vec<PackageSet>,
    #[serde(default)]
    pub repositories: Vec<Repository>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageAction {
    Install,
    Remove,
}

impl fmt::Display for PackageAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PackageAction::Install => f.write_str("install"),
            PackageAction::Remove => f.write_str("remove"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageSet {
    pub action: PackageAction,
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub releases: Vec<String>,
    #[serde(default)]
    pub architectures: Vec<String>,
    #[serde(default)]
    pub variants: Vec<String>,
    #[serde(default)]
    pub types: Vec<TargetType>,
}

impl PackageSet {
    pub fn new(action: PackageAction, packages: &[&str]) -> Self {
        Self {
            action,
            packages: packages.iter().map(|p| p.to_string()).collect(),
            flags: Vec::new(),
            releases: Vec::new(),
            architectures: Vec::new(),
            variants: Vec::new(),
            types: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Repository {
    pub name: String,
    /// Repository URL, or the full repository file content for file-based managers.
    pub url: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub releases: Vec<String>,
    #[serde(default)]
    pub architectures: Vec<String>,
    #[serde(default)]
    pub variants: Vec<String>,
    #[serde(default)]
    pub types: Vec<TargetType>,
}

/// One command plus its flags for a custom package manager verb.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CustomManagerCmd {
    pub command: String,
    #[serde(default)]
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CustomManager {
    #[serde(default)]
    pub clean: CustomManagerCmd,
    pub install: CustomManagerCmd,
    pub remove: CustomManagerCmd,
    #[serde(default)]
    pub refresh: CustomManagerCmd,
    #[serde(default)]
    pub update: CustomManagerCmd,
    /// Flags passed to every verb.
    #[serde(default)]
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Trigger {
    PostUnpack,
    PostUpdate,
    PostPackages,
    PostFiles,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Trigger::PostUnpack => "post-unpack",
            Trigger::PostUpdate => "post-update",
            Trigger::PostPackages => "post-packages",
            Trigger::PostFiles => "post-files",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Action {
    pub trigger: Trigger,
    pub action: String,
    /// Render `action` as a template before running it.
    #[serde(default)]
    pub template: bool,
    #[serde(default)]
    pub releases: Vec<String>,
    #[serde(default)]
    pub architectures: Vec<String>,
    #[serde(default)]
    pub variants: Vec<String>,
    #[serde(default)]
    pub types: Vec<TargetType>,
}

impl_filterable!(EnvVariable, PackageSet, Repository, Action);

impl Definition {
    /// Read, parse and validate a definition file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading definition '{}'", path.display()))?;
        let definition = Self::parse(&content)
            .with_context(|| format!("parsing definition '{}'", path.display()))?;
        definition
            .validate()
            .with_context(|| format!("invalid definition '{}'", path.display()))?;
        Ok(definition)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.image.distribution.trim().is_empty() {
            bail!("image.distribution must not be empty");
        }
        if self.image.release.trim().is_empty() {
            bail!("image.release must not be empty");
        }

        let has_packages = !self.packages.sets.is_empty()
            || !self.packages.repositories.is_empty()
            || self.packages.update
            || self.packages.cleanup;
        if has_packages || !self.packages.manager.is_empty() {
            Backend::from_definition(&self.packages)?;
        }

        for repo in &self.packages.repositories {
            if repo.name.trim().is_empty() {
                bail!("packages.repositories: repository name must not be empty");
            }
        }

        if self.actions.iter().any(|a| a.trigger == Trigger::PostFiles) {
            bail!("actions: post-files actions need file generators, which this builder does not run");
        }

        for var in &self.environment.variables {
            if var.key.is_empty() || var.key.contains('=') {
                bail!("environment.variables: invalid key '{}'", var.key);
            }
        }

        if self.targets.vm.size == 0 {
            bail!("targets.vm.size must be greater than zero");
        }

        Ok(())
    }

    /// Selector for this definition's image values and the given build kind.
    pub fn selector(&self, target_type: TargetType) -> BuildSelector<'_> {
        BuildSelector {
            release: &self.image.release,
            architecture: &self.image.architecture,
            variant: &self.image.variant,
            target_type,
        }
    }

    /// Actions for `trigger` that apply to the current build, in declaration order.
    pub fn runnable_actions(&self, trigger: Trigger, accepted: ImageTarget) -> Vec<&Action> {
        let selector = self.selector(self.targets.kind);
        self.actions
            .iter()
            .filter(|a| a.trigger == trigger && selector.accepts(*a, accepted))
            .collect()
    }
}

fn host_architecture() -> String {
    std::env::consts::ARCH.to_string()
}

fn default_variant() -> String {
    "default".to_string()
}

fn default_vm_size() -> u64 {
    DEFAULT_VM_SIZE
}
