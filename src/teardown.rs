//! Best-effort cleanup sequences.
//!
//! Teardown must run every step even when an earlier one failed: a skipped
//! unmount or loop detach leaks kernel state into the next build.

use anyhow::{anyhow, Error, Result};

/// Collects failures from a sequence of cleanup steps.
#[derive(Debug)]
pub struct Teardown {
    what: &'static str,
    failures: Vec<Error>,
}

impl Teardown {
    pub fn new(what: &'static str) -> Self {
        Self {
            what,
            failures: Vec::new(),
        }
    }

    /// Record the outcome of one step. Failures are logged and kept.
    pub fn step<E>(&mut self, name: &str, result: std::result::Result<(), E>)
    where
        E: Into<Error>,
    {
        if let Err(err) = result {
            let err: Error = err.into();
            let err = err.context(name.to_string());
            tracing::warn!(teardown = self.what, "{:#}", err);
            self.failures.push(err);
        }
    }

    /// First failure, annotated with how many others followed it.
    pub fn finish(self) -> Result<()> {
        let mut failures = self.failures.into_iter();
        let Some(first) = failures.next() else {
            return Ok(());
        };
        let rest = failures.count();
        if rest == 0 {
            Err(first.context(format!("{} incomplete", self.what)))
        } else {
            Err(first.context(format!(
                "{} incomplete ({} further failure(s) logged)",
                self.what, rest
            )))
        }
    }
}

/// Convert a step result that only matters when it fails.
pub fn ignore_missing(result: std::io::Result<()>) -> Result<()> {
    match result {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other.map_err(|e| anyhow!(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_all_steps_ok() {
        let mut td = Teardown::new("disk teardown");
        td.step("a", Ok::<(), Error>(()));
        td.step("b", Ok::<(), io::Error>(()));
        assert!(td.finish().is_ok());
    }

    #[test]
    fn test_first_failure_wins_and_rest_are_counted() {
        let mut td = Teardown::new("disk teardown");
        td.step("unmount uefi", Err(anyhow!("busy")));
        td.step("unmount root", Ok::<(), Error>(()));
        td.step("detach loop", Err(io::Error::new(io::ErrorKind::Other, "gone")));

        let msg = format!("{:#}", td.finish().unwrap_err());
        assert!(msg.contains("disk teardown incomplete (1 further failure(s) logged)"));
        assert!(msg.contains("unmount uefi"));
        assert!(msg.contains("busy"));
        assert!(!msg.contains("gone"));
    }

    #[test]
    fn test_ignore_missing() {
        assert!(ignore_missing(Err(io::Error::from(io::ErrorKind::NotFound))).is_ok());
        assert!(ignore_missing(Err(io::Error::from(io::ErrorKind::PermissionDenied))).is_err());
    }
}
