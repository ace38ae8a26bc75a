//! On-disk layout and defaults shared by the bootstrap, the engine and the
//! job service.

/// Default base directory for all updater state.
pub const DEFAULT_BASE_DIR: &str = "/opt/updater";

/// Environment variable overriding the base directory.
pub const BASE_DIR_ENV: &str = "UPDATER_BASE_DIR";

/// Environment variable overriding the job service port.
pub const HTTP_PORT_ENV: &str = "UPDATER_HTTP_PORT";

pub const DEFAULT_HTTP_PORT: u16 = 8123;

// Subdirectories of the base directory.
pub const STATE_DIR: &str = "state";
pub const JOBS_DIR: &str = "state/jobs";
pub const LOCK_FILE: &str = "state/.lock";
pub const BACKUPS_DIR: &str = "backups";
pub const UPLOADS_DIR: &str = "uploads";
pub const TMP_DIR: &str = "tmp";
pub const LOGS_DIR: &str = "logs";
pub const ENGINES_DIR: &str = "update-engines";
pub const CURRENT_ENGINE_LINK: &str = "update-engines/current";

// Well-known files inside a staged package.
pub const MANIFEST_FILE: &str = "manifest.yml";
pub const CHECKSUMS_FILE: &str = "checksums.md5";
pub const BUNDLED_ENGINE_DIR: &str = "update_engine";
pub const BUNDLED_ENGINE_CHECKSUM: &str = "CHECKSUM";

/// Name of the bootstrap binary, both installed and bundled in packages.
pub const BOOTSTRAP_BIN: &str = "update-bootstrap";

/// Version marker written next to each installed engine.
pub const ENGINE_VERSION_FILE: &str = "VERSION";

/// Default bound of the per-job log ring.
pub const DEFAULT_JOB_LOG_CAP: usize = 1000;

/// Capacity of each per-subscriber progress buffer. A subscriber that falls
/// further behind than this is disconnected.
pub const PROGRESS_BUFFER_CAP: usize = 256;

/// Process exit codes of the `update-bootstrap` CLI.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const USAGE: i32 = 2;
    pub const ENGINE_TOO_OLD: i32 = 3;
    pub const INTEGRITY: i32 = 4;
    pub const JOB_FAILED: i32 = 5;
    pub const ROLLBACK_FAILED: i32 = 6;
    pub const BUSY: i32 = 7;
}
