use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
};

use anyhow::{Context, Error};
use nix::fcntl::{Flock, FlockArg};

use crate::files::create_dirs;

/// An exclusive advisory lock on a file. The lock is held for the lifetime
/// of the value and released when it is dropped.
pub struct LockFile {
    _flock: Flock<File>,
    path: PathBuf,
}

impl LockFile {
    /// Try to take the lock without blocking. Returns `None` when another
    /// process already holds it.
    pub fn try_exclusive(path: &Path) -> Result<Option<Self>, Error> {
        if let Some(parent) = path.parent() {
            create_dirs(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .context(format!("Failed to open lock file {}", path.display()))?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => Ok(Some(Self {
                _flock: flock,
                path: path.to_path_buf(),
            })),
            Err((_, nix::errno::Errno::EWOULDBLOCK)) => Ok(None),
            Err((_, errno)) => {
                Err(Error::from(errno).context(format!("Failed to lock {}", path.display())))
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
