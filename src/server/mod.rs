//! The job service: a thin HTTP+SSE boundary over the engine, the state
//! store and the progress bus. Uploads land in `<base>/uploads`; applying an
//! update runs the bootstrap on a dedicated thread inside this process so
//! stream subscribers see the live bus.

use std::{
    net::SocketAddr,
    path::{Path as StdPath, PathBuf},
    pin::Pin,
    sync::Arc,
};

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, KeepAliveStream, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::{Stream, StreamExt};

use updater_api::job::{FailureKind, JobStatus};

use crate::{
    adapters::HostAdapters,
    backup::BackupManager,
    bootstrap,
    bus::{ProgressBus, UpdateEvent},
    config::LocalConfig,
    datastore::Datastore,
};

/// Uploaded packages are bounded to keep a runaway client from filling the
/// disk through the service.
const MAX_UPLOAD_BYTES: usize = 1024 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub config: LocalConfig,
    pub bus: Arc<ProgressBus>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/system-info", get(system_info))
        .route("/api/backups", get(list_backups))
        .route(
            "/api/upload-update",
            post(upload_update).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/api/apply-update", post(apply_update))
        .route("/api/update-stream/{job_id}", get(update_stream))
        .route("/api/rollback/{job_id}", post(rollback_job))
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn serve(config: LocalConfig) -> anyhow::Result<()> {
    config.ensure_layout()?;
    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let state = AppState {
        config,
        bus: ProgressBus::new(),
    };
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Job service listening on {addr}");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// JSON error body with a stable kind, mirroring the engine's taxonomy.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: String,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            kind: kind.into(),
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "error": self.kind, "message": self.message })),
        )
            .into_response()
    }
}

impl From<updater_api::error::UpdaterError> for ApiError {
    fn from(e: updater_api::error::UpdaterError) -> Self {
        let kind = e.failure_kind();
        let status = match kind {
            FailureKind::Busy => StatusCode::CONFLICT,
            FailureKind::Integrity
            | FailureKind::ManifestParse
            | FailureKind::EngineTooOld => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, kind.as_str(), e.message())
    }
}

#[derive(Serialize)]
struct SystemInfo {
    hostname: String,
    disk_usage: DiskUsage,
    memory: MemoryUsage,
}

#[derive(Serialize)]
struct DiskUsage {
    percent: f64,
    free: u64,
}

#[derive(Serialize)]
struct MemoryUsage {
    percent: f64,
    available: u64,
}

async fn system_info(State(state): State<AppState>) -> Result<Json<SystemInfo>, ApiError> {
    let base_dir = state.config.base_dir.clone();
    let info = tokio::task::spawn_blocking(move || collect_system_info(&base_dir))
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    Ok(Json(info))
}

fn collect_system_info(base_dir: &StdPath) -> SystemInfo {
    use sysinfo::{Disks, System};

    let mut sys = System::new();
    sys.refresh_memory();
    let total_memory = sys.total_memory();
    let available_memory = sys.available_memory();
    let memory_percent = if total_memory == 0 {
        0.0
    } else {
        (total_memory - available_memory) as f64 * 100.0 / total_memory as f64
    };

    // The disk holding the base directory: longest matching mount point.
    let disks = Disks::new_with_refreshed_list();
    let disk = disks
        .iter()
        .filter(|disk| base_dir.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len());
    let (disk_percent, disk_free) = match disk {
        Some(disk) if disk.total_space() > 0 => (
            (disk.total_space() - disk.available_space()) as f64 * 100.0
                / disk.total_space() as f64,
            disk.available_space(),
        ),
        _ => (0.0, 0),
    };

    SystemInfo {
        hostname: System::host_name().unwrap_or_else(|| "unknown".into()),
        disk_usage: DiskUsage {
            percent: disk_percent,
            free: disk_free,
        },
        memory: MemoryUsage {
            percent: memory_percent,
            available: available_memory,
        },
    }
}

#[derive(Serialize)]
struct BackupSummary {
    name: String,
    created_at: chrono::DateTime<chrono::Utc>,
    sources: Vec<PathBuf>,
}

async fn list_backups(
    State(state): State<AppState>,
) -> Result<Json<Vec<BackupSummary>>, ApiError> {
    let backups_dir = state.config.backups_dir();
    let records = tokio::task::spawn_blocking(move || {
        BackupManager::open(backups_dir)?.list()
    })
    .await
    .map_err(|e| ApiError::internal(e.to_string()))?
    .map_err(|e| ApiError::internal(format!("{e:#}")))?;

    Ok(Json(
        records
            .into_iter()
            .map(|record| BackupSummary {
                name: record.name,
                created_at: record.created_at,
                sources: record.sources,
            })
            .collect(),
    ))
}

#[derive(Serialize)]
struct Uploaded {
    filename: String,
}

async fn upload_update(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Uploaded>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, "upload", e.to_string()))?
    {
        let Some(filename) = field.file_name().map(sanitize_filename) else {
            continue;
        };
        if filename.is_empty() {
            return Err(ApiError::new(
                StatusCode::BAD_REQUEST,
                "upload",
                "upload has no usable filename",
            ));
        }
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, "upload", e.to_string()))?;

        let target = state.config.uploads_dir().join(&filename);
        tokio::task::spawn_blocking(move || hostutils::files::atomic_write(&target, &bytes))
            .await
            .map_err(|e| ApiError::internal(e.to_string()))?
            .map_err(|e| ApiError::internal(format!("{e:#}")))?;

        info!("Received upload '{filename}'");
        return Ok(Json(Uploaded { filename }));
    }
    Err(ApiError::new(
        StatusCode::BAD_REQUEST,
        "upload",
        "multipart body contained no file",
    ))
}

/// Strip any path components from a client-supplied filename.
fn sanitize_filename(name: &str) -> String {
    StdPath::new(name)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[derive(Deserialize)]
struct ApplyParams {
    filename: String,
}

#[derive(Serialize)]
struct Applied {
    job_id: String,
}

async fn apply_update(
    State(state): State<AppState>,
    Query(params): Query<ApplyParams>,
) -> Result<Json<Applied>, ApiError> {
    let filename = sanitize_filename(&params.filename);
    let package = state.config.uploads_dir().join(&filename);
    if !package.is_file() {
        return Err(ApiError::not_found(format!(
            "no uploaded package named '{filename}'"
        )));
    }

    let config = state.config.clone();
    let prepared = tokio::task::spawn_blocking(move || bootstrap::prepare(&package, &config))
        .await
        .map_err(|e| ApiError::internal(e.to_string()))??;

    let job_id = prepared.job_id().to_string();
    let config = state.config.clone();
    let bus = state.bus.clone();
    std::thread::spawn(move || {
        let code = bootstrap::execute(prepared, &config, &bus, HostAdapters::host());
        info!("Update job finished with exit code {code}");
    });

    Ok(Json(Applied { job_id }))
}

type EventStream = Pin<Box<dyn Stream<Item = Result<Event, std::convert::Infallible>> + Send>>;

async fn update_stream(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Sse<KeepAliveStream<EventStream>>, ApiError> {
    if let Some(receiver) = state.bus.subscribe(&job_id) {
        let stream = tokio_stream::wrappers::BroadcastStream::new(receiver)
            .take_while(|event| {
                // A lagging subscriber is disconnected rather than fed stale
                // data; the UI reconnects and fetches a fresh snapshot.
                if event.is_err() {
                    warn!("Dropping lagging update-stream subscriber");
                }
                event.is_ok()
            })
            .filter_map(|event| event.ok())
            .map(|event| Ok(Event::default().event(event.name()).data(event.payload())));
        return Ok(Sse::new(Box::pin(stream) as EventStream).keep_alive(KeepAlive::default()));
    }

    // No live stream; a terminal job still gets its final snapshot.
    let jobs_dir = state.config.jobs_dir();
    let lookup_id = job_id.clone();
    let job = tokio::task::spawn_blocking(move || {
        Datastore::open(jobs_dir)?.load_job(&lookup_id)
    })
    .await
    .map_err(|e| ApiError::internal(e.to_string()))?
    .map_err(|_| ApiError::not_found(format!("no job '{job_id}'")))?;

    let event = UpdateEvent::Complete(Box::new(job));
    let stream = tokio_stream::once(Ok(
        Event::default().event(event.name()).data(event.payload())
    ));
    Ok(Sse::new(Box::pin(stream) as EventStream).keep_alive(KeepAlive::default()))
}

#[derive(Serialize)]
struct RollbackResponse {
    message: String,
}

/// Manual rollback of a failed job: restore its most recent backup. The job
/// record is terminal and stays `failed`; the response carries the outcome.
async fn rollback_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<RollbackResponse>, ApiError> {
    let jobs_dir = state.config.jobs_dir();
    let backups_dir = state.config.backups_dir();
    let lookup_id = job_id.clone();

    let message = tokio::task::spawn_blocking(move || -> Result<String, ApiError> {
        let datastore = Datastore::open(jobs_dir)
            .map_err(|e| ApiError::internal(format!("{e:#}")))?;
        let job = datastore
            .load_job(&lookup_id)
            .map_err(|_| ApiError::not_found(format!("no job '{lookup_id}'")))?;

        if job.status != JobStatus::Failed {
            return Err(ApiError::new(
                StatusCode::CONFLICT,
                "not_eligible",
                format!("job '{lookup_id}' is {:?}, not failed", job.status),
            ));
        }
        let Some(backup_id) = job.backups_created.last() else {
            return Err(ApiError::new(
                StatusCode::CONFLICT,
                "not_eligible",
                format!("job '{lookup_id}' created no backups"),
            ));
        };

        let backups = BackupManager::open(backups_dir)
            .map_err(|e| ApiError::internal(format!("{e:#}")))?;
        let record = backups
            .find(backup_id)
            .map_err(|e| ApiError::internal(format!("{e:#}")))?
            .ok_or_else(|| {
                ApiError::not_found(format!("backup '{backup_id}' is no longer in the store"))
            })?;
        backups.restore(&record).map_err(|e| {
            error!("Manual rollback of '{lookup_id}' failed: {e:#}");
            ApiError::internal(format!("{e:#}"))
        })?;
        Ok(format!("restored backup '{}'", record.id))
    })
    .await
    .map_err(|e| ApiError::internal(e.to_string()))??;

    Ok(Json(RollbackResponse { message }))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;
    use updater_api::job::Job;

    use super::*;

    fn test_state(dir: &TempDir) -> AppState {
        let config = LocalConfig::default().with_base_dir(dir.path().join("updater"));
        config.ensure_layout().unwrap();
        AppState {
            config,
            bus: ProgressBus::new(),
        }
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("update.tar.gz"), "update.tar.gz");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("dir/pkg.tar.gz"), "pkg.tar.gz");
        assert_eq!(sanitize_filename(""), "");
    }

    #[tokio::test]
    async fn test_list_backups_maps_records() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);

        let source = dir.path().join("f.conf");
        fs::write(&source, "x").unwrap();
        BackupManager::open(state.config.backups_dir())
            .unwrap()
            .create("job-1", "nightly", &[source.clone()])
            .unwrap();

        let Json(backups) = list_backups(State(state)).await.unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].name, "nightly");
        assert_eq!(backups[0].sources, vec![source]);
    }

    #[tokio::test]
    async fn test_apply_update_unknown_file_is_404() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);

        let err = apply_update(
            State(state),
            Query(ApplyParams {
                filename: "ghost.tar.gz".into(),
            }),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_update_stream_unknown_job_is_404() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);

        let err = update_stream(State(state), Path("job-nope".into()))
            .await
            .err()
            .unwrap();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_update_stream_replays_terminal_job() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);

        let mut job = Job::new("done earlier", 0, false);
        job.status = JobStatus::Completed;
        Datastore::open(state.config.jobs_dir())
            .unwrap()
            .save_job(&job)
            .unwrap();

        // A terminal job without a live topic still answers with a stream.
        update_stream(State(state), Path(job.job_id.clone()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rollback_requires_failed_job_with_backups() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let datastore = Datastore::open(state.config.jobs_dir()).unwrap();

        // Completed job: not eligible.
        let mut done = Job::new("done", 0, false);
        done.status = JobStatus::Completed;
        datastore.save_job(&done).unwrap();
        let err = rollback_job(State(state.clone()), Path(done.job_id.clone()))
            .await
            .err()
            .unwrap();
        assert_eq!(err.status, StatusCode::CONFLICT);

        // Failed job without backups: not eligible either.
        let mut failed = Job::new("failed", 1, true);
        failed.status = JobStatus::Failed;
        datastore.save_job(&failed).unwrap();
        let err = rollback_job(State(state.clone()), Path(failed.job_id.clone()))
            .await
            .err()
            .unwrap();
        assert_eq!(err.status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_rollback_restores_and_leaves_record_terminal() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let datastore = Datastore::open(state.config.jobs_dir()).unwrap();
        let backups = BackupManager::open(state.config.backups_dir()).unwrap();

        let target = dir.path().join("app.conf");
        fs::write(&target, "v1\n").unwrap();

        let mut job = Job::new("failed rollout", 1, true);
        let record = backups.create(&job.job_id, "pre", &[target.clone()]).unwrap();
        job.backups_created.push(record.id.clone());
        job.status = JobStatus::Failed;
        job.fail(FailureKind::ActionFailed, "boom", Some(0));
        datastore.save_job(&job).unwrap();

        fs::write(&target, "broken\n").unwrap();

        let Json(response) = rollback_job(State(state), Path(job.job_id.clone()))
            .await
            .unwrap();
        assert!(response.message.contains(&record.id));
        assert_eq!(fs::read_to_string(&target).unwrap(), "v1\n");

        // The stored record is still terminal `failed`.
        assert_eq!(
            datastore.load_job(&job.job_id).unwrap().status,
            JobStatus::Failed
        );
    }
}
