//! Process environment inside the sandbox.

use std::collections::BTreeMap;
use std::env;

use crate::definition::Environment;
use crate::filter::{BuildSelector, ImageTarget};

pub const DEFAULT_PATH: &str = "/sbin:/bin:/usr/sbin:/usr/bin:/usr/local/sbin:/usr/local/bin";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvValue {
    pub value: String,
    /// False means the variable is removed from the environment.
    pub set: bool,
}

/// Variable name to value, applied over the current process environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentSet {
    vars: BTreeMap<String, EnvValue>,
}

impl EnvironmentSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// PATH, SHELL, TERM and DEBIAN_FRONTEND for a non-interactive build.
    pub fn defaults() -> Self {
        let mut set = Self::new();
        set.set("PATH", DEFAULT_PATH);
        set.set("SHELL", "/bin/sh");
        set.set("TERM", "xterm");
        set.set("DEBIAN_FRONTEND", "noninteractive");
        set
    }

    /// Effective environment for a build: defaults unless cleared, then every
    /// variable whose filter accepts the build.
    pub fn for_build(config: &Environment, selector: &BuildSelector<'_>, accepted: ImageTarget) -> Self {
        let mut set = if config.clear_defaults {
            Self::new()
        } else {
            Self::defaults()
        };
        for var in &config.variables {
            if selector.accepts(var, accepted) {
                set.set(&var.key, &var.value);
            }
        }
        set
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(
            key.into(),
            EnvValue {
                value: value.into(),
                set: true,
            },
        );
    }

    pub fn unset(&mut self, key: impl Into<String>) {
        self.vars.insert(
            key.into(),
            EnvValue {
                value: String::new(),
                set: false,
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<&EnvValue> {
        self.vars.get(key)
    }

    /// Apply to the process environment and return what it replaced.
    pub fn apply(&self) -> EnvironmentSet {
        let mut previous = EnvironmentSet::new();
        for (key, entry) in &self.vars {
            match env::var(key) {
                Ok(old) => previous.set(key.clone(), old),
                Err(_) => previous.unset(key.clone()),
            }
            if entry.set {
                env::set_var(key, &entry.value);
            } else {
                env::remove_var(key);
            }
        }
        previous
    }
}
