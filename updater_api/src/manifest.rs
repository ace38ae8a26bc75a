use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{is_default, version::EngineVersion};

/// The update manifest: checks, actions, rollback and cleanup policy for one
/// update. Immutable for the duration of a job.
///
/// Unknown top-level keys are ignored for forward compatibility; an unknown
/// `type` in any check or action spec is a parse error.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Manifest {
    pub description: String,
    #[serde(default)]
    pub date: String,
    pub required_engine_version: EngineVersion,

    #[serde(default)]
    pub pre_checks: Vec<CheckSpec>,
    #[serde(default)]
    pub post_checks: Vec<CheckSpec>,
    #[serde(default)]
    pub actions: Vec<ActionSpec>,

    #[serde(default)]
    pub rollback: RollbackPolicy,
    #[serde(default)]
    pub cleanup: CleanupPolicy,
}

impl Manifest {
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }
}

/// Minimal parse of a manifest, used by the bootstrap to decide the engine
/// version handshake before committing to a full parse.
#[derive(Deserialize, Debug)]
pub struct ManifestProbe {
    pub required_engine_version: EngineVersion,
}

impl ManifestProbe {
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }
}

/// One side-effecting unit of the manifest, dispatched by `type`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ActionSpec {
    /// Optional operator-facing name; defaults to the action type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Log and continue instead of failing the job when this action errors.
    #[serde(default, skip_serializing_if = "is_default")]
    pub continue_on_error: bool,

    #[serde(flatten)]
    pub kind: ActionKind,
}

impl ActionSpec {
    /// Display name used in progress events and logs.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or_else(|| self.kind.type_name())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    /// Run a shell-interpreted command on the host.
    Command {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<PathBuf>,
        /// Seconds before the command is terminated.
        #[serde(default = "default_command_timeout")]
        timeout: u64,
    },

    /// Snapshot the given absolute paths into the backup store.
    Backup {
        sources: Vec<PathBuf>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },

    /// Restore a previously taken backup. `latest` selects the most recent
    /// backup regardless of which job created it.
    RestoreBackup { backup_name: String },

    DockerComposeDown {
        compose_file: PathBuf,
        #[serde(default, skip_serializing_if = "is_default")]
        remove_orphans: bool,
    },

    DockerComposeUp {
        compose_file: PathBuf,
        #[serde(default = "default_true")]
        detach: bool,
        #[serde(default, skip_serializing_if = "is_default")]
        build: bool,
    },

    /// Load a container image tarball shipped in the package.
    DockerLoad { image_tar: PathBuf },

    DockerPrune {
        #[serde(default, skip_serializing_if = "is_default")]
        all: bool,
        #[serde(default, skip_serializing_if = "is_default")]
        force: bool,
    },

    /// Copy a single file out of the staged package, atomically per file.
    FileCopy {
        source: PathBuf,
        destination: PathBuf,
        /// Expected MD5 of the staged source, verified before writing.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checksum: Option<String>,
    },

    /// Synchronize a directory tree out of the staged package.
    FileSync {
        source: PathBuf,
        destination: PathBuf,
        mode: SyncMode,
    },

    /// Merge `KEY=VALUE` configuration from the staged package into an
    /// existing file on the host.
    FileMerge {
        source: PathBuf,
        destination: PathBuf,
        strategy: MergeStrategy,
    },

    /// Install the engine bundled in the package as the current engine.
    InstallEngine {
        #[serde(default = "default_engine_source")]
        source: PathBuf,
        version: EngineVersion,
    },
}

impl ActionKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ActionKind::Command { .. } => "command",
            ActionKind::Backup { .. } => "backup",
            ActionKind::RestoreBackup { .. } => "restore_backup",
            ActionKind::DockerComposeDown { .. } => "docker_compose_down",
            ActionKind::DockerComposeUp { .. } => "docker_compose_up",
            ActionKind::DockerLoad { .. } => "docker_load",
            ActionKind::DockerPrune { .. } => "docker_prune",
            ActionKind::FileCopy { .. } => "file_copy",
            ActionKind::FileSync { .. } => "file_sync",
            ActionKind::FileMerge { .. } => "file_merge",
            ActionKind::InstallEngine { .. } => "install_engine",
        }
    }
}

#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Destination becomes a bit-copy of the source; extraneous files are
    /// removed.
    Mirror,
    /// Copy files missing at the destination; never overwrite.
    AddOnly,
    /// Copy everything, overwriting existing files; keep extraneous files.
    OverwriteExisting,
}

#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Destination keys win; source contributes only new keys.
    KeepExisting,
    /// Source keys win; destination contributes only keys absent from the
    /// source.
    OverwriteAll,
    /// Union of both, destination wins on conflict.
    MergeKeys,
}

/// A side-effect-light probe asserting a host property.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct CheckSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(flatten)]
    pub kind: CheckKind,
}

impl CheckSpec {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or_else(|| self.kind.type_name())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckKind {
    /// Passes when the shell command exits zero.
    Command {
        command: String,
        #[serde(default = "default_check_timeout")]
        timeout: u64,
    },

    /// Probe an HTTP endpoint, retrying before giving up.
    HttpCheck {
        url: String,
        #[serde(default = "default_expect_status")]
        expect_status: u16,
        #[serde(default = "default_retries")]
        retries: u32,
        /// Seconds between attempts.
        #[serde(default = "default_retry_delay")]
        delay: u64,
    },

    ServiceRunning { service: String },

    DockerHealth { container: String },

    FileExists { path: PathBuf },

    FreeDiskSpace { path: PathBuf, min_bytes: u64 },
}

impl CheckKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            CheckKind::Command { .. } => "command",
            CheckKind::HttpCheck { .. } => "http_check",
            CheckKind::ServiceRunning { .. } => "service_running",
            CheckKind::DockerHealth { .. } => "docker_health",
            CheckKind::FileExists { .. } => "file_exists",
            CheckKind::FreeDiskSpace { .. } => "free_disk_space",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct RollbackPolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub auto_on_failure: bool,
    /// Explicit rollback steps. When absent the default policy restores the
    /// most recent backup created by the failing job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<ActionSpec>>,
}

impl Default for RollbackPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_on_failure: true,
            steps: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct CleanupPolicy {
    #[serde(default)]
    pub remove_old_backups: bool,
    /// Number of backups to retain, newest first. Zero keeps all.
    #[serde(default)]
    pub keep_last_n: usize,
    #[serde(default)]
    pub remove_temp_files: bool,
    #[serde(default)]
    pub remove_old_images: bool,
}

fn default_true() -> bool {
    true
}

fn default_command_timeout() -> u64 {
    300
}

fn default_check_timeout() -> u64 {
    60
}

fn default_expect_status() -> u16 {
    200
}

fn default_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    2
}

fn default_engine_source() -> PathBuf {
    PathBuf::from(crate::constants::BUNDLED_ENGINE_DIR)
}
