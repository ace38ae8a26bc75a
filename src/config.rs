use std::{env, path::PathBuf};

use anyhow::{Context, Error};
use log::warn;

use updater_api::constants::{
    self, BASE_DIR_ENV, DEFAULT_BASE_DIR, DEFAULT_HTTP_PORT, DEFAULT_JOB_LOG_CAP, HTTP_PORT_ENV,
};

/// Local configuration of this updater instance, resolved once at startup
/// from the environment and passed explicitly into every component.
#[derive(Debug, Clone)]
pub struct LocalConfig {
    /// Base directory holding state, backups, uploads and staged trees.
    pub base_dir: PathBuf,
    /// Port of the job service.
    pub http_port: u16,
    /// Bound of the per-job log ring.
    pub job_log_cap: usize,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from(DEFAULT_BASE_DIR),
            http_port: DEFAULT_HTTP_PORT,
            job_log_cap: DEFAULT_JOB_LOG_CAP,
        }
    }
}

impl LocalConfig {
    /// Resolve the configuration from `UPDATER_BASE_DIR` / `UPDATER_HTTP_PORT`,
    /// falling back to the defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(base) = env::var(BASE_DIR_ENV) {
            if !base.trim().is_empty() {
                config.base_dir = PathBuf::from(base);
            }
        }
        if let Ok(port) = env::var(HTTP_PORT_ENV) {
            match port.parse() {
                Ok(port) => config.http_port = port,
                Err(_) => warn!("Ignoring invalid {HTTP_PORT_ENV}='{port}'"),
            }
        }
        config
    }

    pub fn with_base_dir(mut self, base_dir: impl Into<PathBuf>) -> Self {
        self.base_dir = base_dir.into();
        self
    }

    pub fn state_dir(&self) -> PathBuf {
        self.base_dir.join(constants::STATE_DIR)
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.base_dir.join(constants::JOBS_DIR)
    }

    pub fn lock_file(&self) -> PathBuf {
        self.base_dir.join(constants::LOCK_FILE)
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.base_dir.join(constants::BACKUPS_DIR)
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.base_dir.join(constants::UPLOADS_DIR)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.base_dir.join(constants::TMP_DIR)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join(constants::LOGS_DIR)
    }

    pub fn engines_dir(&self) -> PathBuf {
        self.base_dir.join(constants::ENGINES_DIR)
    }

    pub fn current_engine_link(&self) -> PathBuf {
        self.base_dir.join(constants::CURRENT_ENGINE_LINK)
    }

    /// Directory for one installed engine version.
    pub fn engine_version_dir(&self, version: &str) -> PathBuf {
        self.engines_dir().join(format!("v{version}"))
    }

    /// Create the full on-disk layout under the base directory.
    pub fn ensure_layout(&self) -> Result<(), Error> {
        for dir in [
            self.state_dir(),
            self.jobs_dir(),
            self.backups_dir(),
            self.uploads_dir(),
            self.tmp_dir(),
            self.logs_dir(),
            self.engines_dir(),
        ] {
            hostutils::files::create_dirs(&dir).context(format!(
                "Failed to create layout under {}",
                self.base_dir.display()
            ))?;
        }
        Ok(())
    }
}
