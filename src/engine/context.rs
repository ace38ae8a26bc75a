use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use log::info;
use tokio::sync::broadcast;

use updater_api::{
    error::{ReportError, StateError, UpdaterError},
    job::Job,
};

use crate::{
    adapters::HostAdapters,
    backup::BackupManager,
    bus::UpdateEvent,
    config::LocalConfig,
    datastore::Datastore,
};

/// Cooperative cancellation flag checked at every blocking point of a job.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything a running job owns: the staged tree, its record, the backup
/// store, the state store, the host adapters and the progress stream. Created
/// at engine start, passed explicitly into every handler, destroyed at engine
/// exit.
pub struct EngineContext {
    pub config: LocalConfig,
    pub staged_root: PathBuf,
    pub job: Job,
    pub backups: BackupManager,
    pub datastore: Datastore,
    pub adapters: HostAdapters,
    pub cancel: CancelToken,
    publisher: broadcast::Sender<UpdateEvent>,
}

impl EngineContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: LocalConfig,
        staged_root: PathBuf,
        job: Job,
        backups: BackupManager,
        datastore: Datastore,
        adapters: HostAdapters,
        publisher: broadcast::Sender<UpdateEvent>,
    ) -> Self {
        Self {
            config,
            staged_root,
            job,
            backups,
            datastore,
            adapters,
            cancel: CancelToken::new(),
            publisher,
        }
    }

    /// Resolve a package-relative path against the staged tree. Absolute
    /// paths are re-rooted: every path labelled package-relative in the
    /// manifest stays inside the staged tree.
    pub fn staged(&self, relative: &Path) -> PathBuf {
        hostutils::path::join_relative(&self.staged_root, relative)
    }

    /// Resolve a path that may name either a host file (absolute) or a file
    /// shipped in the package (relative).
    pub fn host_or_staged(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.staged_root.join(path)
        }
    }

    /// Append a line to the job log ring, the operator console and the
    /// progress stream.
    pub fn log(&mut self, line: impl Into<String>) {
        let line = line.into();
        self.job.push_log(line.clone(), self.config.job_log_cap);
        info!("[{}] {line}", self.job.job_id);
        let _ = self.publisher.send(UpdateEvent::Log(line));
    }

    /// Broadcast a fresh snapshot of the job.
    pub fn emit_status(&self) {
        let _ = self
            .publisher
            .send(UpdateEvent::Status(Box::new(self.job.clone())));
    }

    /// Broadcast the final snapshot of the job.
    pub fn emit_complete(&self) {
        let _ = self
            .publisher
            .send(UpdateEvent::Complete(Box::new(self.job.clone())));
    }

    /// Persist the job record and broadcast the new snapshot. After this
    /// returns, a crash replays from the step boundary just written.
    pub fn checkpoint(&mut self) -> Result<(), UpdaterError> {
        self.datastore
            .save_job(&self.job)
            .structured(StateError::WriteJob {
                job_id: self.job.job_id.clone(),
            })?;
        self.emit_status();
        Ok(())
    }
}
