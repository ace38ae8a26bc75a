use std::{path::PathBuf, process::Command};

use anyhow::{Context, Error};
use strum_macros::IntoStaticStr;

/// External binaries the updater shells out to. Centralizing them here keeps
/// path resolution and error messages uniform.
#[derive(Debug, Clone, Copy, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Dependency {
    Docker,
    Systemctl,
    Sh,
    // Test dependencies
    #[cfg(test)]
    Echo,
    #[cfg(test)]
    DoesNotExist,
}

impl std::fmt::Display for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.into())
    }
}

impl Dependency {
    pub fn name(&self) -> &'static str {
        self.into()
    }

    pub fn exists(&self) -> bool {
        self.path().is_ok()
    }

    /// Resolve the dependency on $PATH.
    pub fn path(&self) -> Result<PathBuf, Error> {
        which::which(self.name()).context(format!("Failed to find dependency '{self}'"))
    }

    /// Build a `std::process::Command` for the resolved binary.
    pub fn cmd(&self) -> Result<Command, Error> {
        Ok(Command::new(self.path()?))
    }
}

#[cfg(test)]
mod tests {
    use crate::exe::RunAndCheck;

    use super::*;

    #[test]
    fn test_resolution() {
        assert!(Dependency::Echo.exists());
        assert!(!Dependency::DoesNotExist.exists());
        Dependency::DoesNotExist.cmd().unwrap_err();
    }

    #[test]
    fn test_cmd_runs() {
        let out = Dependency::Echo
            .cmd()
            .unwrap()
            .arg("hello")
            .output_and_check()
            .unwrap();
        assert_eq!(out, "hello\n");
    }

    #[test]
    fn test_names() {
        assert_eq!(Dependency::Docker.name(), "docker");
        assert_eq!(Dependency::Systemctl.name(), "systemctl");
        assert_eq!(Dependency::Sh.name(), "sh");
    }
}
