//! Repository and package actions driven against a [`PackageManager`].

use anyhow::{bail, Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};

use super::PackageManager;
use crate::definition::{Definition, PackageAction, PackageSet, Repository};
use crate::filter::ImageTarget;
use crate::template;

/// Merge runs of adjacent sets that share `(action, flags)`.
///
/// Relative order of packages and of differing groups is preserved, so the
/// merged sequence installs and removes exactly what the input would.
pub fn optimize_package_sets<'a, I>(sets: I) -> Vec<PackageSet>
where
    I: IntoIterator<Item = &'a PackageSet>,
{
    let mut groups: Vec<PackageSet> = Vec::new();
    for set in sets {
        match groups.last_mut() {
            Some(last) if last.action == set.action && last.flags == set.flags => {
                last.packages.extend(set.packages.iter().cloned());
            }
            _ => {
                let mut group = PackageSet::new(set.action, &[]);
                group.packages = set.packages.clone();
                group.flags = set.flags.clone();
                groups.push(group);
            }
        }
    }
    groups
}

pub struct Pipeline<'a> {
    definition: &'a Definition,
    manager: &'a dyn PackageManager,
    accepted: ImageTarget,
    cancel: Option<&'a AtomicBool>,
}

impl<'a> Pipeline<'a> {
    pub fn new(definition: &'a Definition, manager: &'a dyn PackageManager, accepted: ImageTarget) -> Self {
        Self {
            definition,
            manager,
            accepted,
            cancel: None,
        }
    }

    /// Abort between steps once `flag` is set.
    pub fn with_cancel(mut self, flag: &'a AtomicBool) -> Self {
        self.cancel = Some(flag);
        self
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
            bail!("Build cancelled");
        }
        Ok(())
    }

    pub fn valid_sets(&self) -> Vec<&'a PackageSet> {
        let selector = self.definition.selector(self.definition.targets.kind);
        self.definition
            .packages
            .sets
            .iter()
            .filter(|set| selector.accepts(*set, self.accepted))
            .collect()
    }

    pub fn valid_repositories(&self) -> Vec<&'a Repository> {
        let selector = self.definition.selector(self.definition.targets.kind);
        self.definition
            .packages
            .repositories
            .iter()
            .filter(|repo| selector.accepts(*repo, self.accepted))
            .collect()
    }

    /// Configure every applicable repository, rendering `url` and `key`.
    pub fn manage_repositories(&self) -> Result<()> {
        let repos = self.valid_repositories();
        if repos.is_empty() {
            return Ok(());
        }
        let ctx = template::context_for(self.definition)?;

        for repo in repos {
            self.check_cancelled()?;
            let mut rendered = repo.clone();
            rendered.url = template::render(&repo.url, &ctx)
                .with_context(|| format!("Failed to render url of repository '{}'", repo.name))?;
            rendered.key = template::render(&repo.key, &ctx)
                .with_context(|| format!("Failed to render key of repository '{}'", repo.name))?;

            tracing::info!(repository = %repo.name, "managing repository");
            self.manager
                .manage_repository(&rendered)
                .with_context(|| format!("Error for repository '{}'", repo.name))?;
        }
        Ok(())
    }

    /// Refresh, optionally update, apply the package sets, optionally clean.
    ///
    /// `post_update` runs right after a successful update.
    pub fn manage_packages(&self, post_update: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        let packages = &self.definition.packages;
        let valid = self.valid_sets();

        if valid.is_empty() && !packages.update {
            tracing::debug!("no package work for this build");
            return Ok(());
        }

        self.check_cancelled()?;
        self.manager.refresh().context("Failed to refresh")?;

        if packages.update {
            self.check_cancelled()?;
            self.manager.update().context("Failed to update")?;
            post_update().context("Failed to run post-update hooks")?;
        }

        for group in optimize_package_sets(valid) {
            self.check_cancelled()?;
            tracing::info!(action = %group.action, packages = ?group.packages, "managing packages");
            let result = match group.action {
                PackageAction::Install => self.manager.install(&group.packages, &group.flags),
                PackageAction::Remove => self.manager.remove(&group.packages, &group.flags),
            };
            result.with_context(|| {
                format!("Failed to {} packages {:?}", group.action, group.packages)
            })?;
        }

        if packages.cleanup {
            self.check_cancelled()?;
            self.manager.clean().context("Failed to clean")?;
        }

        Ok(())
    }
}
