//! The bootstrap: stages a package, verifies its integrity, and decides
//! which engine executes it. A package carrying a newer engine is handed off
//! to that engine, re-executed against the same staged tree.

use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use log::{error, info, warn};
use tempfile::TempDir;

use hostutils::{archive, checksum, lock::LockFile};
use updater_api::{
    constants::{
        exit_code, BOOTSTRAP_BIN, BUNDLED_ENGINE_CHECKSUM, BUNDLED_ENGINE_DIR, CHECKSUMS_FILE,
        MANIFEST_FILE,
    },
    error::{BootstrapError, InternalError, ReportError, StateError, UpdaterError},
    job::{FailureKind, Job, JobStatus},
    manifest::{Manifest, ManifestProbe},
    version::EngineVersion,
};

use crate::{
    adapters::HostAdapters,
    backup::BackupManager,
    bus::{ProgressBus, UpdateEvent},
    config::LocalConfig,
    datastore::Datastore,
    engine::{self, EngineContext},
    installed_engine_version,
};

/// An extracted, integrity-verified package tree. When staged by this
/// process the temp directory is owned here and removed on drop; in
/// `--staged` mode the parent bootstrap owns it.
pub struct StagedPackage {
    pub root: PathBuf,
    _tempdir: Option<TempDir>,
}

/// A package ready to execute with the engine in this binary.
pub struct EngineRun {
    staged: StagedPackage,
    manifest: Manifest,
    job: Job,
    datastore: Datastore,
    backups: BackupManager,
    _lock: LockFile,
}

impl EngineRun {
    pub fn job_id(&self) -> &str {
        &self.job.job_id
    }
}

/// A package requiring a newer engine than this binary; the bundled engine
/// takes over. The tracking job mirrors the child's exit status.
pub struct HandoffRun {
    staged: StagedPackage,
    required: EngineVersion,
    job: Job,
}

impl HandoffRun {
    pub fn job_id(&self) -> &str {
        &self.job.job_id
    }
}

pub enum Prepared {
    Engine(Box<EngineRun>),
    Handoff(Box<HandoffRun>),
}

impl Prepared {
    pub fn job_id(&self) -> &str {
        match self {
            Prepared::Engine(run) => run.job_id(),
            Prepared::Handoff(run) => run.job_id(),
        }
    }
}

/// The lock and stores every engine invocation needs, opened in one place.
struct StateHandles {
    lock: LockFile,
    datastore: Datastore,
    backups: BackupManager,
}

/// Create the layout, take the one-job-at-a-time lock and settle anything a
/// previous crash left behind.
fn open_state(config: &LocalConfig) -> Result<StateHandles, UpdaterError> {
    config
        .ensure_layout()
        .structured(StateError::CreateLayout {
            base: config.base_dir.display().to_string(),
        })?;

    let lock = LockFile::try_exclusive(&config.lock_file())
        .structured(InternalError::Internal("failed to open state lock"))?
        .ok_or_else(|| UpdaterError::new(StateError::Busy))?;

    let datastore = Datastore::open(config.jobs_dir())
        .structured(InternalError::Internal("failed to open state store"))?;
    let backups = BackupManager::open(config.backups_dir())
        .structured(InternalError::Internal("failed to open backup store"))?;
    engine::recover_interrupted(&datastore, &backups)
        .structured(InternalError::Internal("startup recovery failed"))?;

    Ok(StateHandles {
        lock,
        datastore,
        backups,
    })
}

/// Stage a package and decide how it runs. On success the caller owns a
/// [`Prepared`] value; every error path leaves no job record behind.
pub fn prepare(package: &Path, config: &LocalConfig) -> Result<Prepared, UpdaterError> {
    let StateHandles {
        lock,
        datastore,
        backups,
    } = open_state(config)?;
    sweep_stale_staging(config);

    let staged = stage(package, config)?;
    let required = probe_required_version(&staged.root)?;
    let installed = installed_engine_version();

    if required > installed {
        let bundled = staged.root.join(BUNDLED_ENGINE_DIR);
        if bundled.is_dir() {
            verify_bundled_engine(&bundled)?;
            info!(
                "Package requires engine {required} (installed: {installed}); \
                 handing off to the bundled engine"
            );
            // The child engine takes the lock itself.
            drop(lock);
            let job = Job::new(format!("self-update handoff to engine {required}"), 0, false);
            return Ok(Prepared::Handoff(Box::new(HandoffRun {
                staged,
                required,
                job,
            })));
        }
        return Err(UpdaterError::new(BootstrapError::EngineTooOld {
            required: required.to_string(),
            installed: installed.to_string(),
        }));
    }

    let manifest = parse_manifest(&staged.root)?;
    let auto_rollback = manifest.rollback.enabled && manifest.rollback.auto_on_failure;
    let job = Job::new(manifest.description.clone(), manifest.actions.len(), auto_rollback);
    datastore.save_job(&job).structured(StateError::WriteJob {
        job_id: job.job_id.clone(),
    })?;

    Ok(Prepared::Engine(Box::new(EngineRun {
        staged,
        manifest,
        job,
        datastore,
        backups,
        _lock: lock,
    })))
}

/// Execute a prepared package and return the process exit code.
pub fn execute(
    prepared: Prepared,
    config: &LocalConfig,
    bus: &ProgressBus,
    adapters: HostAdapters,
) -> i32 {
    match prepared {
        Prepared::Engine(run) => execute_engine(*run, config, bus, adapters),
        Prepared::Handoff(run) => execute_handoff(*run, config, bus),
    }
}

/// Stage-and-run for the CLI: prepare, execute, map refusals to exit codes.
pub fn run_package(
    package: &Path,
    config: &LocalConfig,
    bus: &ProgressBus,
    adapters: HostAdapters,
) -> i32 {
    match prepare(package, config) {
        Ok(prepared) => execute(prepared, config, bus, adapters),
        Err(e) => {
            error!("{e:?}");
            e.exit_code()
        }
    }
}

/// Entry point of `--staged` mode: this process was handed an already
/// staged and verified tree by an older bootstrap. No further handoff is
/// attempted; if even this engine is too old the manifest is wrong.
pub fn run_staged(
    root: &Path,
    config: &LocalConfig,
    bus: &ProgressBus,
    adapters: HostAdapters,
) -> i32 {
    match prepare_staged(root, config) {
        Ok(run) => execute_engine(*run, config, bus, adapters),
        Err(e) => {
            error!("{e:?}");
            e.exit_code()
        }
    }
}

fn prepare_staged(root: &Path, config: &LocalConfig) -> Result<Box<EngineRun>, UpdaterError> {
    let StateHandles {
        lock,
        datastore,
        backups,
    } = open_state(config)?;

    let required = probe_required_version(root)?;
    let installed = installed_engine_version();
    if required > installed {
        return Err(UpdaterError::new(BootstrapError::EngineTooOld {
            required: required.to_string(),
            installed: installed.to_string(),
        }));
    }

    let manifest = parse_manifest(root)?;
    let auto_rollback = manifest.rollback.enabled && manifest.rollback.auto_on_failure;
    let job = Job::new(manifest.description.clone(), manifest.actions.len(), auto_rollback);
    datastore.save_job(&job).structured(StateError::WriteJob {
        job_id: job.job_id.clone(),
    })?;

    Ok(Box::new(EngineRun {
        staged: StagedPackage {
            root: root.to_path_buf(),
            _tempdir: None,
        },
        manifest,
        job,
        datastore,
        backups,
        _lock: lock,
    }))
}

fn execute_engine(
    run: EngineRun,
    config: &LocalConfig,
    bus: &ProgressBus,
    adapters: HostAdapters,
) -> i32 {
    let EngineRun {
        staged,
        manifest,
        job,
        datastore,
        backups,
        _lock,
    } = run;

    let job_id = job.job_id.clone();
    let publisher = bus.publisher(&job_id);
    let mut ctx = EngineContext::new(
        config.clone(),
        staged.root.clone(),
        job,
        backups,
        datastore,
        adapters,
        publisher,
    );

    let code = match engine::run(&manifest, &mut ctx) {
        Ok(_) => engine::exit_code_for(&ctx.job),
        Err(e) => {
            error!("State store failure, job cannot be checkpointed: {e:?}");
            e.exit_code()
        }
    };
    bus.retire(&job_id);
    code
}

fn execute_handoff(run: HandoffRun, config: &LocalConfig, bus: &ProgressBus) -> i32 {
    let HandoffRun {
        staged,
        required,
        mut job,
    } = run;

    let publisher = bus.publisher(&job.job_id);
    let datastore = match Datastore::open(config.jobs_dir()) {
        Ok(datastore) => datastore,
        Err(e) => {
            error!("Failed to open state store for handoff tracking: {e:#}");
            return exit_code::JOB_FAILED;
        }
    };

    job.status = JobStatus::Running;
    job.push_log(
        format!("Re-executing with bundled engine {required}"),
        config.job_log_cap,
    );
    let _ = datastore.save_job(&job);
    let _ = publisher.send(UpdateEvent::Status(Box::new(job.clone())));

    let engine_bin = staged.root.join(BUNDLED_ENGINE_DIR).join(BOOTSTRAP_BIN);
    let status = Command::new(&engine_bin)
        .arg("--staged")
        .arg(&staged.root)
        .arg("--base-dir")
        .arg(&config.base_dir)
        .status();

    let code = match status {
        Ok(status) => status.code().unwrap_or(exit_code::JOB_FAILED),
        Err(e) => {
            error!(
                "Failed to execute bundled engine {}: {e}",
                engine_bin.display()
            );
            let handoff_error = UpdaterError::new(BootstrapError::Handoff);
            job.fail(handoff_error.failure_kind(), handoff_error.message(), None);
            exit_code::JOB_FAILED
        }
    };

    if code == exit_code::SUCCESS {
        job.status = JobStatus::Completed;
        job.current_phase = updater_api::job::Phase::Done;
    } else {
        job.status = JobStatus::Failed;
        if job.error.is_none() {
            job.fail(
                failure_kind_for_exit(code),
                format!("bundled engine exited with status {code}"),
                None,
            );
        }
    }
    job.ended_at = Some(chrono::Utc::now());
    let _ = datastore.save_job(&job);
    let _ = publisher.send(UpdateEvent::Complete(Box::new(job.clone())));
    bus.retire(&job.job_id);
    code
}

fn failure_kind_for_exit(code: i32) -> FailureKind {
    match code {
        exit_code::ENGINE_TOO_OLD => FailureKind::EngineTooOld,
        exit_code::INTEGRITY => FailureKind::Integrity,
        exit_code::ROLLBACK_FAILED => FailureKind::RollbackFailed,
        exit_code::BUSY => FailureKind::Busy,
        _ => FailureKind::ActionFailed,
    }
}

/// Remove staging trees a previous crash left under `<base>/tmp`. Only
/// called while holding the state lock and before this run stages anything,
/// so every entry is stale. Never called in `--staged` mode, where the tree
/// belongs to the parent bootstrap.
fn sweep_stale_staging(config: &LocalConfig) {
    let Ok(entries) = fs::read_dir(config.tmp_dir()) else {
        return;
    };
    for entry in entries.flatten() {
        warn!("Removing stale staging entry {}", entry.path().display());
        if let Err(e) = hostutils::files::remove_path_if_exists(&entry.path()) {
            warn!("Failed to remove {}: {e:#}", entry.path().display());
        }
    }
}

/// Extract the archive into a fresh staging directory under `<base>/tmp` and
/// verify every file listed in `checksums.md5`.
fn stage(package: &Path, config: &LocalConfig) -> Result<StagedPackage, UpdaterError> {
    let tempdir = tempfile::Builder::new()
        .prefix("staged-")
        .tempdir_in(config.tmp_dir())
        .structured(BootstrapError::Extract)?;
    archive::extract_tar_gz(package, tempdir.path()).structured(BootstrapError::Extract)?;

    verify_package(tempdir.path())?;
    info!(
        "Staged package {} at {}",
        package.display(),
        tempdir.path().display()
    );

    Ok(StagedPackage {
        root: tempdir.path().to_path_buf(),
        _tempdir: Some(tempdir),
    })
}

fn verify_package(root: &Path) -> Result<(), UpdaterError> {
    let digest_path = root.join(CHECKSUMS_FILE);
    if !digest_path.is_file() {
        return Err(UpdaterError::new(BootstrapError::ChecksumsMissing));
    }
    let contents =
        fs::read_to_string(&digest_path).structured(BootstrapError::ChecksumsInvalid)?;
    let entries =
        checksum::parse_digest_file(&contents).structured(BootstrapError::ChecksumsInvalid)?;
    verify_digest(root, &entries)
}

fn verify_digest(
    root: &Path,
    entries: &[checksum::DigestEntry],
) -> Result<(), UpdaterError> {
    match checksum::verify_tree(root, entries) {
        Ok(()) => Ok(()),
        Err(checksum::DigestError::Missing { path }) => {
            Err(UpdaterError::new(BootstrapError::FileMissing { path }))
        }
        Err(checksum::DigestError::Mismatch { path, .. }) => {
            Err(UpdaterError::new(BootstrapError::ChecksumMismatch { path }))
        }
    }
}

/// Verify the bundled engine against its own `CHECKSUM` digest file.
fn verify_bundled_engine(bundled: &Path) -> Result<(), UpdaterError> {
    let digest_path = bundled.join(BUNDLED_ENGINE_CHECKSUM);
    let contents = fs::read_to_string(&digest_path)
        .structured(BootstrapError::BundledEngineIntegrity)?;
    let entries = checksum::parse_digest_file(&contents)
        .structured(BootstrapError::BundledEngineIntegrity)?;
    checksum::verify_tree(bundled, &entries).map_err(|e| {
        warn!("Bundled engine verification failed: {e}");
        UpdaterError::new(BootstrapError::BundledEngineIntegrity)
    })
}

fn probe_required_version(root: &Path) -> Result<EngineVersion, UpdaterError> {
    let text = fs::read_to_string(root.join(MANIFEST_FILE))
        .structured(BootstrapError::ManifestParse)?;
    Ok(ManifestProbe::from_yaml(&text)
        .structured(BootstrapError::ManifestParse)?
        .required_engine_version)
}

fn parse_manifest(root: &Path) -> Result<Manifest, UpdaterError> {
    let text = fs::read_to_string(root.join(MANIFEST_FILE))
        .structured(BootstrapError::ManifestParse)?;
    Manifest::from_yaml(&text).structured(BootstrapError::ManifestParse)
}
