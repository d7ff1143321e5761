//! Package manager backends.
//!
//! A [`Backend`] names the manager a definition uses and yields the
//! [`ManagerSpec`] table of commands and flags for each verb. [`Manager`]
//! runs those verbs through a [`CommandRunner`] against a root directory,
//! which is `/` inside the sandbox.

pub mod pipeline;
mod repos;

use anyhow::{bail, Context, Result};
use std::fmt;
use std::fs;
use std::path::PathBuf;

use crate::definition::{CustomManager, CustomManagerCmd, Packages, Repository};
use crate::process::{Cmd, CommandRunner};
use crate::teardown::ignore_missing;

/// The verbs the pipeline drives.
pub trait PackageManager {
    fn refresh(&self) -> Result<()>;
    fn update(&self) -> Result<()>;
    fn install(&self, packages: &[String], flags: &[String]) -> Result<()>;
    fn remove(&self, packages: &[String], flags: &[String]) -> Result<()>;
    fn clean(&self) -> Result<()>;
    fn manage_repository(&self, repo: &Repository) -> Result<()>;
}

#[derive(Debug, Clone)]
pub enum Backend {
    Apt,
    Apk,
    Dnf,
    Yum,
    Pacman,
    Zypper,
    Xbps,
    Opkg,
    Custom(CustomManager),
}

impl Backend {
    /// Backend for the `[packages]` table.
    ///
    /// An empty manager name with a `[packages.custom_manager]` table selects
    /// the custom backend.
    pub fn from_definition(packages: &Packages) -> Result<Backend> {
        let custom = || {
            packages.custom_manager.clone().map(Backend::Custom).context(
                "package manager 'custom' requires a [packages.custom_manager] table",
            )
        };

        match packages.manager.as_str() {
            "apt" => Ok(Backend::Apt),
            "apk" => Ok(Backend::Apk),
            "dnf" => Ok(Backend::Dnf),
            "yum" => Ok(Backend::Yum),
            "pacman" => Ok(Backend::Pacman),
            "zypper" => Ok(Backend::Zypper),
            "xbps" => Ok(Backend::Xbps),
            "opkg" => Ok(Backend::Opkg),
            "custom" => custom(),
            "" if packages.custom_manager.is_some() => custom(),
            "" => bail!("no package manager configured"),
            other => bail!("unknown package manager '{}'", other),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Backend::Apt => "apt",
            Backend::Apk => "apk",
            Backend::Dnf => "dnf",
            Backend::Yum => "yum",
            Backend::Pacman => "pacman",
            Backend::Zypper => "zypper",
            Backend::Xbps => "xbps",
            Backend::Opkg => "opkg",
            Backend::Custom(_) => "custom",
        }
    }

    pub fn spec(&self) -> ManagerSpec {
        match self {
            Backend::Apt => ManagerSpec::single(
                "apt-get",
                &["-y"],
                [
                    &["install", "--no-install-recommends"],
                    &["remove", "--auto-remove"],
                    &["update"],
                    &["upgrade"],
                    &["clean"],
                ],
            ),
            Backend::Apk => ManagerSpec::single(
                "apk",
                &["--no-cache"],
                [&["add"], &["del", "--rdepends"], &["update"], &["upgrade"], &[]],
            ),
            Backend::Dnf | Backend::Yum => ManagerSpec::single(
                self.name(),
                &["-y"],
                [&["install"], &["remove"], &["makecache"], &["upgrade"], &["clean", "all"]],
            ),
            Backend::Pacman => ManagerSpec::single(
                "pacman",
                &["--noconfirm"],
                [&["-S", "--needed"], &["-Rcs"], &["-Syy"], &["-Su"], &["-Sc"]],
            ),
            Backend::Zypper => ManagerSpec::single(
                "zypper",
                &["--non-interactive", "--gpg-auto-import-keys"],
                [&["install"], &["remove"], &["refresh"], &["update"], &["clean", "-a"]],
            ),
            Backend::Xbps => ManagerSpec {
                global: Vec::new(),
                install: VerbCommand::new("xbps-install", &["--yes"]),
                remove: VerbCommand::new(
                    "xbps-remove",
                    &["--yes", "--recursive", "--remove-orphans"],
                ),
                refresh: VerbCommand::new("xbps-install", &["--sync"]),
                update: VerbCommand::new(
                    "sh",
                    &["-c", "xbps-install --yes --update && xbps-install --yes --update"],
                ),
                clean: VerbCommand::new("xbps-remove", &["--yes", "--clean-cache"]),
                flagless_verbs: false,
            },
            Backend::Opkg => ManagerSpec {
                global: Vec::new(),
                install: VerbCommand::new("opkg", &["install"]),
                remove: VerbCommand::new("opkg", &["remove"]),
                refresh: VerbCommand::new("opkg", &["update"]),
                update: VerbCommand::default(),
                clean: VerbCommand::new("rm", &["-rf", "/tmp/opkg-lists/"]),
                flagless_verbs: false,
            },
            Backend::Custom(custom) => ManagerSpec {
                global: custom.flags.clone(),
                install: VerbCommand::from(&custom.install),
                remove: VerbCommand::from(&custom.remove),
                refresh: VerbCommand::from(&custom.refresh),
                update: VerbCommand::from(&custom.update),
                clean: VerbCommand::from(&custom.clean),
                flagless_verbs: true,
            },
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerbCommand {
    pub command: String,
    pub flags: Vec<String>,
}

impl VerbCommand {
    pub fn new(command: &str, flags: &[&str]) -> Self {
        Self {
            command: command.to_string(),
            flags: flags.iter().map(|f| f.to_string()).collect(),
        }
    }
}

impl From<&CustomManagerCmd> for VerbCommand {
    fn from(cmd: &CustomManagerCmd) -> Self {
        Self {
            command: cmd.command.clone(),
            flags: cmd.flags.clone(),
        }
    }
}

/// Commands and flags for every verb of one manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerSpec {
    pub global: Vec<String>,
    pub install: VerbCommand,
    pub remove: VerbCommand,
    pub refresh: VerbCommand,
    pub update: VerbCommand,
    pub clean: VerbCommand,
    /// Run a verb that has a command but no flags. Only custom managers do.
    pub flagless_verbs: bool,
}

impl ManagerSpec {
    /// One binary for every verb. Flag order: install, remove, refresh,
    /// update, clean.
    fn single(command: &str, global: &[&str], verbs: [&[&str]; 5]) -> Self {
        let [install, remove, refresh, update, clean] = verbs.map(|f| VerbCommand::new(command, f));
        Self {
            global: global.iter().map(|f| f.to_string()).collect(),
            install,
            remove,
            refresh,
            update,
            clean,
            flagless_verbs: false,
        }
    }

    fn enabled(&self, verb: &VerbCommand) -> bool {
        !verb.command.is_empty() && (self.flagless_verbs || !verb.flags.is_empty())
    }

    /// Command line for `verb`, or `None` when the verb does nothing.
    pub fn command(&self, verb: &VerbCommand, set_flags: &[String], packages: &[String]) -> Option<Cmd> {
        if !self.enabled(verb) {
            return None;
        }
        Some(
            Cmd::new(&verb.command)
                .args(&self.global)
                .args(&verb.flags)
                .args(set_flags)
                .args(packages),
        )
    }
}

/// A backend bound to a runner and a root directory.
pub struct Manager<'r> {
    backend: Backend,
    spec: ManagerSpec,
    runner: &'r dyn CommandRunner,
    root: PathBuf,
    architecture: String,
}

impl<'r> Manager<'r> {
    pub fn new(backend: Backend, runner: &'r dyn CommandRunner) -> Self {
        Self {
            spec: backend.spec(),
            backend,
            runner,
            root: PathBuf::from("/"),
            architecture: std::env::consts::ARCH.to_string(),
        }
    }

    /// Resolve manager files under `root` instead of `/`.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// Image architecture, used to pick mirrors and keyrings.
    pub fn with_architecture(mut self, architecture: impl Into<String>) -> Self {
        self.architecture = architecture.into();
        self
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn spec(&self) -> &ManagerSpec {
        &self.spec
    }

    pub(crate) fn runner(&self) -> &dyn CommandRunner {
        self.runner
    }

    /// `path` (absolute inside the image) under the manager root.
    pub(crate) fn path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    /// One-time preparation before the first verb runs.
    pub fn load(&self) -> Result<()> {
        if let Backend::Pacman = self.backend {
            self.write_pacman_mirrorlist()
                .context("Failed to set mirrorlist")?;
            self.setup_pacman_keys()
                .context("Failed to setup trusted keys")?;
        }
        Ok(())
    }

    fn is_arm(&self) -> bool {
        matches!(
            self.architecture.as_str(),
            "arm" | "armhf" | "armv7h" | "armv7l" | "aarch64" | "arm64"
        )
    }

    fn write_pacman_mirrorlist(&self) -> Result<()> {
        let mirror = if self.is_arm() {
            "Server = http://mirror.archlinuxarm.org/$arch/$repo"
        } else if self.architecture == "riscv64" {
            "Server = https://archriscv.felixc.at/repo/$repo"
        } else {
            "Server = http://mirrors.kernel.org/archlinux/$repo/os/$arch"
        };
        repos::write_file(&self.path("/etc/pacman.d/mirrorlist"), &format!("{}\n", mirror))
    }

    fn setup_pacman_keys(&self) -> Result<()> {
        if self.path("/etc/pacman.d/gnupg").exists() {
            return Ok(());
        }
        let keyring = if self.is_arm() {
            "archlinuxarm"
        } else {
            "archlinux"
        };
        self.runner.run(
            &Cmd::new("pacman-key")
                .arg("--init")
                .error_msg("Error initializing with pacman-key"),
        )?;
        self.runner.run(
            &Cmd::new("pacman-key")
                .args(["--populate", keyring])
                .error_msg("Error populating with pacman-key"),
        )?;
        Ok(())
    }

    /// Remove everything in the pacman package cache.
    fn wipe_pacman_cache(&self) -> Result<()> {
        let cache = self.path("/var/cache/pacman/pkg");
        let entries = match fs::read_dir(&cache) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to list '{}'", cache.display()))
            }
        };
        for entry in entries {
            let path = entry?.path();
            let removed = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            ignore_missing(removed).with_context(|| format!("Failed to remove '{}'", path.display()))?;
        }
        Ok(())
    }

    fn run_verb(&self, what: &str, verb: &VerbCommand, flags: &[String], packages: &[String]) -> Result<()> {
        let Some(cmd) = self.spec.command(verb, flags, packages) else {
            tracing::debug!(manager = %self.backend, verb = what, "verb not supported, skipping");
            return Ok(());
        };
        self.runner.run(&cmd.error_msg(format!("{} {} failed", self.backend, what)))?;
        Ok(())
    }
}

impl PackageManager for Manager<'_> {
    fn refresh(&self) -> Result<()> {
        self.run_verb("refresh", &self.spec.refresh, &[], &[])
    }

    fn update(&self) -> Result<()> {
        self.run_verb("update", &self.spec.update, &[], &[])
    }

    fn install(&self, packages: &[String], flags: &[String]) -> Result<()> {
        if packages.is_empty() {
            return Ok(());
        }
        self.run_verb("install", &self.spec.install, flags, packages)
    }

    fn remove(&self, packages: &[String], flags: &[String]) -> Result<()> {
        if packages.is_empty() {
            return Ok(());
        }
        self.run_verb("remove", &self.spec.remove, flags, packages)
    }

    fn clean(&self) -> Result<()> {
        self.run_verb("clean", &self.spec.clean, &[], &[])?;
        if let Backend::Pacman = self.backend {
            self.wipe_pacman_cache()?;
        }
        Ok(())
    }

    fn manage_repository(&self, repo: &Repository) -> Result<()> {
        repos::manage(self, repo)
    }
}
