use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::IntoStaticStr;

use crate::is_default;

/// Lifecycle of a job. `Completed`, `Failed` and `RolledBack` are terminal:
/// once a job reaches one of them its record is never mutated again.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    RollingBack,
    RolledBack,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::RolledBack
        )
    }
}

/// Phase of the engine's phase machine the job is currently in.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    PreCheck,
    Action,
    PostCheck,
    Rollback,
    Done,
}

/// Stable failure classification surfaced to the operator.
#[derive(
    Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq, IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    Integrity,
    EngineTooOld,
    ManifestParse,
    PrecheckFailed,
    ActionFailed,
    PostcheckFailed,
    RollbackFailed,
    Interrupted,
    Busy,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    /// Process exit code reported for this failure when it decides the
    /// outcome of an `update-bootstrap` invocation.
    pub fn exit_code(&self) -> i32 {
        use crate::constants::exit_code;
        match self {
            FailureKind::Integrity => exit_code::INTEGRITY,
            FailureKind::EngineTooOld => exit_code::ENGINE_TOO_OLD,
            FailureKind::Busy => exit_code::BUSY,
            FailureKind::RollbackFailed => exit_code::ROLLBACK_FAILED,
            _ => exit_code::JOB_FAILED,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct JobError {
    pub kind: FailureKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_index: Option<usize>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Progress {
    pub total_actions: usize,
    pub completed_actions: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_action_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_action_name: Option<String>,
}

/// Persisted record of one update job. Doubles as the checkpoint: it is
/// rewritten atomically after every state-changing step, so after a crash the
/// on-disk record is consistent with the step boundary it last passed.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Job {
    pub job_id: String,
    pub status: JobStatus,
    pub description: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub progress: Progress,
    pub current_phase: Phase,
    /// Whether the manifest permitted automatic rollback. Captured at job
    /// creation so startup recovery can decide without the manifest.
    #[serde(default, skip_serializing_if = "is_default")]
    pub auto_rollback: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backups_created: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

static JOB_SEQ: AtomicU64 = AtomicU64::new(0);

impl Job {
    pub fn new(description: impl Into<String>, total_actions: usize, auto_rollback: bool) -> Self {
        Self {
            job_id: next_job_id(),
            status: JobStatus::Pending,
            description: description.into(),
            started_at: Utc::now(),
            ended_at: None,
            progress: Progress {
                total_actions,
                ..Default::default()
            },
            current_phase: Phase::PreCheck,
            auto_rollback,
            backups_created: Vec::new(),
            logs: Vec::new(),
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Progress percentage. With zero declared actions the job reports 100%
    /// only once it has passed its post-checks.
    pub fn percent(&self) -> u8 {
        if self.progress.total_actions == 0 {
            return match (self.current_phase, self.status) {
                (Phase::Done, JobStatus::Completed) => 100,
                _ => 0,
            };
        }
        (self.progress.completed_actions * 100 / self.progress.total_actions) as u8
    }

    /// Append a line to the bounded log ring, dropping the oldest line once
    /// `cap` is reached.
    pub fn push_log(&mut self, line: impl Into<String>, cap: usize) {
        self.logs.push(line.into());
        if self.logs.len() > cap {
            let excess = self.logs.len() - cap;
            self.logs.drain(..excess);
        }
    }

    pub fn fail(&mut self, kind: FailureKind, message: impl Into<String>, action_index: Option<usize>) {
        self.error = Some(JobError {
            kind,
            message: message.into(),
            action_index,
        });
    }
}

/// Time-ordered job id, unique for the lifetime of this process.
fn next_job_id() -> String {
    format!(
        "job-{}-{}",
        Utc::now().format("%Y%m%dT%H%M%SZ"),
        JOB_SEQ.fetch_add(1, Ordering::Relaxed)
    )
}
