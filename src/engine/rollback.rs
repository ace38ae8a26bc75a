use anyhow::{Context, Error};
use chrono::Utc;

use updater_api::{
    error::{InternalError, ReportError, ServicingError, UpdaterError},
    job::{JobStatus, Phase},
    manifest::{ActionSpec, Manifest},
};

use crate::actions;

use super::{finalize, EngineContext};

/// Enter the rollback phase after a failed action or post-check. The job's
/// error is already recorded; this decides whether rollback runs, executes
/// it, and settles the terminal status:
///
/// - rollback disabled or not automatic: `failed`, host left as-is;
/// - rollback ran to completion: `rolled_back`;
/// - rollback itself failed: `failed` with the error reclassified as a
///   rollback failure (the host may be inconsistent).
pub fn enter(manifest: &Manifest, ctx: &mut EngineContext) -> Result<JobStatus, UpdaterError> {
    let policy = &manifest.rollback;
    if !policy.enabled || !policy.auto_on_failure {
        ctx.log("Rollback is disabled for this manifest; leaving the host as-is");
        return finalize(ctx, JobStatus::Failed);
    }

    ctx.job.status = JobStatus::RollingBack;
    ctx.job.current_phase = Phase::Rollback;
    ctx.checkpoint()?;
    ctx.log("Rolling back");

    let result = match &policy.steps {
        Some(steps) => run_steps(steps, ctx),
        None => restore_latest_backup(ctx),
    };

    match result {
        Ok(()) => {
            ctx.log("Rollback finished; host restored to its prior state");
            finalize(ctx, JobStatus::RolledBack)
        }
        Err(e) => {
            ctx.log(format!("Rollback failed: {}", e.message()));
            // The original failure stays in the message; the kind becomes a
            // rollback failure because the host may now be inconsistent.
            let original = ctx.job.error.take();
            let action_index = original.as_ref().and_then(|err| err.action_index);
            let mut message = e.message();
            if let Some(original) = original {
                message.push_str(&format!(" (while recovering from: {})", original.message));
            }
            ctx.job.fail(e.failure_kind(), message, action_index);
            finalize(ctx, JobStatus::Failed)
        }
    }
}

/// Execute explicit rollback steps as a mini action list. The list is not
/// itself rollback-capable: the first failure aborts it.
fn run_steps(steps: &[ActionSpec], ctx: &mut EngineContext) -> Result<(), UpdaterError> {
    for (index, step) in steps.iter().enumerate() {
        ctx.log(format!("Rollback step #{index} '{}'", step.display_name()));
        match actions::run_action(step, ctx) {
            Ok(()) => {}
            Err(e) if step.continue_on_error => {
                ctx.log(format!(
                    "Rollback step #{index} failed (continuing): {e:#}"
                ));
            }
            Err(e) => {
                return Err(UpdaterError::with_source(
                    ServicingError::RollbackStepFailed { index },
                    e,
                ));
            }
        }
    }
    Ok(())
}

/// Default policy: restore the most recent backup created by this job.
fn restore_latest_backup(ctx: &mut EngineContext) -> Result<(), UpdaterError> {
    let record = ctx
        .backups
        .latest_for_job(&ctx.job.job_id)
        .structured(InternalError::Internal("backup store unavailable"))?;
    let Some(record) = record else {
        return Err(UpdaterError::new(ServicingError::NoBackupForRollback));
    };
    ctx.log(format!("Restoring backup '{}'", record.id));
    ctx.backups
        .restore(&record)
        .structured(ServicingError::RestoreFailed {
            backup: record.id.clone(),
        })
}

/// Rollback for a job found non-terminal at startup. Runs without the
/// manifest: eligibility was captured on the job record at creation.
pub fn recover(
    job: &mut updater_api::job::Job,
    backups: &crate::backup::BackupManager,
) -> Result<(), Error> {
    let Some(backup_id) = job.backups_created.last() else {
        anyhow::bail!("interrupted job has no backups");
    };
    let record = backups
        .find(backup_id)?
        .with_context(|| format!("backup '{backup_id}' is missing from the store"))?;
    backups.restore(&record)?;
    job.push_log(
        format!("Restored backup '{}' after interruption", record.id),
        updater_api::constants::DEFAULT_JOB_LOG_CAP,
    );
    job.ended_at = Some(Utc::now());
    Ok(())
}
