//! The update engine: a deterministic, resumable executor driving
//! pre-checks, the declared action sequence and post-checks, with integrated
//! rollback and a checkpoint after every state-changing step.

use std::fs;

use chrono::Utc;
use log::{info, warn};

use updater_api::{
    constants::exit_code,
    error::{ServicingError, UpdaterError},
    job::{FailureKind, Job, JobStatus, Phase},
    manifest::Manifest,
};

use crate::{actions, backup::BackupManager, checks, datastore::Datastore};

mod context;
pub mod rollback;

pub use context::{CancelToken, EngineContext};

/// Drive one job through the phase machine:
///
/// ```text
/// pending -> pre_check -> action(0..N) -> post_check -> done (completed)
///                       \ any failure ---> rollback ---> rolled_back | failed
/// ```
///
/// The outcome is encoded on the job record; `Err` is reserved for the state
/// store itself failing, in which case no checkpoint discipline can hold.
pub fn run(manifest: &Manifest, ctx: &mut EngineContext) -> Result<JobStatus, UpdaterError> {
    info!(
        "Starting job '{}': {}",
        ctx.job.job_id, ctx.job.description
    );
    ctx.job.status = JobStatus::Running;
    ctx.checkpoint()?;

    // Pre-checks. A failure aborts without rollback: nothing has mutated yet.
    ctx.job.current_phase = Phase::PreCheck;
    for spec in &manifest.pre_checks {
        ctx.log(format!("Running pre-check '{}'", spec.display_name()));
        let outcome = checks::run_check(spec, ctx);
        if !outcome.ok {
            let error = UpdaterError::new(ServicingError::PrecheckFailed {
                name: spec.display_name().to_string(),
                diagnostic: outcome.diagnostic,
            });
            ctx.log(error.message());
            ctx.job.fail(error.failure_kind(), error.message(), None);
            return finalize(ctx, JobStatus::Failed);
        }
    }

    // Actions, in declared order.
    ctx.job.current_phase = Phase::Action;
    for (index, spec) in manifest.actions.iter().enumerate() {
        ctx.job.progress.current_action_index = Some(index);
        ctx.job.progress.current_action_name = Some(spec.display_name().to_string());
        ctx.emit_status();
        ctx.log(format!("Starting action #{index} '{}'", spec.display_name()));

        match actions::run_action(spec, ctx) {
            Ok(()) => {
                ctx.job.progress.completed_actions += 1;
                ctx.checkpoint()?;
                ctx.log(format!(
                    "Completed action #{index} '{}'",
                    spec.display_name()
                ));
            }
            Err(e) if spec.continue_on_error => {
                ctx.log(format!(
                    "Action #{index} '{}' failed (continue_on_error): {e:#}",
                    spec.display_name()
                ));
            }
            Err(e) => {
                let error = UpdaterError::with_source(
                    ServicingError::ActionFailed {
                        index,
                        name: spec.display_name().to_string(),
                    },
                    e,
                );
                ctx.log(error.message());
                ctx.job.fail(error.failure_kind(), error.message(), Some(index));
                return rollback::enter(manifest, ctx);
            }
        }
    }

    // Post-checks. A failure takes the same path as a failed action.
    ctx.job.current_phase = Phase::PostCheck;
    ctx.job.progress.current_action_index = None;
    ctx.job.progress.current_action_name = None;
    ctx.checkpoint()?;
    for spec in &manifest.post_checks {
        ctx.log(format!("Running post-check '{}'", spec.display_name()));
        let outcome = checks::run_check(spec, ctx);
        if !outcome.ok {
            let error = UpdaterError::new(ServicingError::PostcheckFailed {
                name: spec.display_name().to_string(),
                diagnostic: outcome.diagnostic,
            });
            ctx.log(error.message());
            ctx.job.fail(error.failure_kind(), error.message(), None);
            return rollback::enter(manifest, ctx);
        }
    }

    // Success. Cleanup runs before the terminal checkpoint and can only log.
    ctx.job.current_phase = Phase::Done;
    cleanup(manifest, ctx);
    finalize(ctx, JobStatus::Completed)
}

/// Write the terminal checkpoint and broadcast the final snapshot.
pub(crate) fn finalize(
    ctx: &mut EngineContext,
    status: JobStatus,
) -> Result<JobStatus, UpdaterError> {
    ctx.job.status = status;
    ctx.job.ended_at = Some(Utc::now());
    ctx.checkpoint()?;
    ctx.emit_complete();
    info!(
        "Job '{}' finished: {status:?} ({}%)",
        ctx.job.job_id,
        ctx.job.percent()
    );
    Ok(status)
}

/// Post-success cleanup. Not transactional: every failure is logged and
/// swallowed.
fn cleanup(manifest: &Manifest, ctx: &mut EngineContext) {
    let policy = &manifest.cleanup;

    if policy.remove_old_backups {
        match ctx.backups.prune(policy.keep_last_n) {
            Ok(removed) if !removed.is_empty() => {
                ctx.log(format!("Cleanup: removed {} old backups", removed.len()));
            }
            Ok(_) => {}
            Err(e) => ctx.log(format!("Cleanup: failed to prune backups: {e:#}")),
        }
    }

    if policy.remove_temp_files {
        if let Err(e) = sweep_tmp(ctx) {
            ctx.log(format!("Cleanup: failed to sweep temp files: {e:#}"));
        }
    }

    if policy.remove_old_images {
        match ctx.adapters.runtime.prune_images(false, true) {
            Ok(_) => ctx.log("Cleanup: pruned unused container images".to_string()),
            Err(e) => ctx.log(format!("Cleanup: failed to prune images: {e:#}")),
        }
    }
}

/// Remove staging leftovers under `<base>/tmp` other than the tree of the
/// running job.
fn sweep_tmp(ctx: &mut EngineContext) -> anyhow::Result<()> {
    let tmp = ctx.config.tmp_dir();
    let mut swept = 0usize;
    for entry in fs::read_dir(&tmp)? {
        let path = entry?.path();
        if ctx.staged_root.starts_with(&path) {
            continue;
        }
        hostutils::files::remove_path_if_exists(&path)?;
        swept += 1;
    }
    if swept > 0 {
        ctx.log(format!("Cleanup: removed {swept} stale staging entries"));
    }
    Ok(())
}

/// Startup recovery: any job found non-terminal was interrupted by a crash
/// or power loss. The engine never resumes mid-action; it classifies the job
/// as interrupted and, when the manifest had permitted automatic rollback
/// and backups exist, restores the job's most recent backup.
pub fn recover_interrupted(
    datastore: &Datastore,
    backups: &BackupManager,
) -> anyhow::Result<()> {
    for mut job in datastore.non_terminal_jobs()? {
        warn!(
            "Job '{}' was interrupted before reaching a terminal state",
            job.job_id
        );
        job.fail(
            FailureKind::Interrupted,
            "engine restarted before the job reached a terminal state",
            None,
        );

        if job.auto_rollback && !job.backups_created.is_empty() {
            job.status = JobStatus::RollingBack;
            job.current_phase = Phase::Rollback;
            datastore.save_job(&job)?;

            match rollback::recover(&mut job, backups) {
                Ok(()) => job.status = JobStatus::RolledBack,
                Err(e) => {
                    warn!("Rollback of interrupted job '{}' failed: {e:#}", job.job_id);
                    if let Some(error) = job.error.as_mut() {
                        error.kind = FailureKind::RollbackFailed;
                        error.message = format!("{e:#} (after interruption)");
                    }
                    job.status = JobStatus::Failed;
                }
            }
        } else {
            job.status = JobStatus::Failed;
        }

        job.ended_at = Some(Utc::now());
        datastore.save_job(&job)?;
    }
    Ok(())
}

/// Exit code of an `update-bootstrap` invocation whose job reached the given
/// record state.
pub fn exit_code_for(job: &Job) -> i32 {
    match job.status {
        JobStatus::Completed => exit_code::SUCCESS,
        JobStatus::RolledBack => exit_code::JOB_FAILED,
        _ => job
            .error
            .as_ref()
            .map(|error| error.kind.exit_code())
            .unwrap_or(exit_code::JOB_FAILED),
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::{path::PathBuf, sync::Arc};

    use tempfile::TempDir;
    use updater_api::job::Job;

    use crate::{
        adapters::testutil::{fake_adapters, FakeRuntime},
        bus::ProgressBus,
        config::LocalConfig,
    };

    use super::*;

    /// A complete engine context over a throwaway base directory, wired to
    /// fake host adapters.
    pub(crate) struct TestFixture {
        pub ctx: EngineContext,
        pub runtime: Arc<FakeRuntime>,
        pub bus: Arc<ProgressBus>,
        /// A directory standing in for host paths the job mutates.
        pub host_dir: PathBuf,
        _base: TempDir,
    }

    pub(crate) fn test_context() -> TestFixture {
        let base = TempDir::new().unwrap();
        let config = LocalConfig::default().with_base_dir(base.path().join("updater"));
        config.ensure_layout().unwrap();

        let staged_root = config.tmp_dir().join("staged");
        hostutils::files::create_dirs(&staged_root).unwrap();
        let host_dir = base.path().join("host");
        hostutils::files::create_dirs(&host_dir).unwrap();

        let datastore = Datastore::open(config.jobs_dir()).unwrap();
        let backups = BackupManager::open(config.backups_dir()).unwrap();
        let (adapters, runtime) = fake_adapters();
        let bus = ProgressBus::new();

        let job = Job::new("test job", 0, true);
        let publisher = bus.publisher(&job.job_id);

        TestFixture {
            ctx: EngineContext::new(
                config,
                staged_root,
                job,
                backups,
                datastore,
                adapters,
                publisher,
            ),
            runtime,
            bus,
            host_dir,
            _base: base,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use updater_api::manifest::{
        ActionKind, ActionSpec, CheckKind, CheckSpec, CleanupPolicy, Manifest, RollbackPolicy,
    };
    use updater_api::version::EngineVersion;

    use crate::bus::UpdateEvent;

    use super::{testutil::test_context, *};

    fn action(kind: ActionKind) -> ActionSpec {
        ActionSpec {
            name: None,
            continue_on_error: false,
            kind,
        }
    }

    fn check(kind: CheckKind) -> CheckSpec {
        CheckSpec { name: None, kind }
    }

    fn shell_check(command: &str) -> CheckSpec {
        check(CheckKind::Command {
            command: command.into(),
            timeout: 10,
        })
    }

    fn manifest(actions: Vec<ActionSpec>) -> Manifest {
        Manifest {
            description: "test".into(),
            date: String::new(),
            required_engine_version: EngineVersion::new(1, 0, 0),
            pre_checks: Vec::new(),
            post_checks: Vec::new(),
            actions,
            rollback: RollbackPolicy::default(),
            cleanup: CleanupPolicy::default(),
        }
    }

    /// Point the fixture's job at the manifest's action count.
    fn arm(fx: &mut super::testutil::TestFixture, manifest: &Manifest) {
        fx.ctx.job.progress.total_actions = manifest.actions.len();
        fx.ctx.job.auto_rollback =
            manifest.rollback.enabled && manifest.rollback.auto_on_failure;
    }

    #[test]
    fn test_happy_path_backup_then_file_copy() {
        let mut fx = test_context();

        let conf = fx.host_dir.join("app.conf");
        fs::write(&conf, "v1\n").unwrap();
        fs::write(fx.ctx.staged_root.join("app.conf"), "v2\n").unwrap();

        let mut m = manifest(vec![
            action(ActionKind::Backup {
                sources: vec![conf.clone()],
                name: None,
            }),
            action(ActionKind::FileCopy {
                source: PathBuf::from("app.conf"),
                destination: conf.clone(),
                checksum: Some("e30260020baeb0398ff07b37dd33ed16".into()),
            }),
        ]);
        m.post_checks = vec![shell_check(&format!(
            "test \"$(cat {})\" = v2",
            conf.display()
        ))];
        arm(&mut fx, &m);

        let status = run(&m, &mut fx.ctx).unwrap();
        assert_eq!(status, JobStatus::Completed);
        assert_eq!(fs::read_to_string(&conf).unwrap(), "v2\n");
        assert_eq!(fx.ctx.job.percent(), 100);
        assert_eq!(fx.ctx.job.current_phase, Phase::Done);
        assert!(fx.ctx.job.error.is_none());
        assert_eq!(exit_code_for(&fx.ctx.job), 0);

        // Backup retained, job record persisted.
        assert_eq!(fx.ctx.backups.list().unwrap().len(), 1);
        let persisted = fx.ctx.datastore.load_job(&fx.ctx.job.job_id).unwrap();
        assert_eq!(persisted.status, JobStatus::Completed);
    }

    #[test]
    fn test_failing_postcheck_triggers_rollback() {
        let mut fx = test_context();

        let conf = fx.host_dir.join("app.conf");
        fs::write(&conf, "v1\n").unwrap();
        fs::write(fx.ctx.staged_root.join("app.conf"), "v2\n").unwrap();

        let mut m = manifest(vec![
            action(ActionKind::Backup {
                sources: vec![conf.clone()],
                name: None,
            }),
            action(ActionKind::FileCopy {
                source: PathBuf::from("app.conf"),
                destination: conf.clone(),
                checksum: None,
            }),
        ]);
        m.post_checks = vec![shell_check("false")];
        arm(&mut fx, &m);

        let status = run(&m, &mut fx.ctx).unwrap();
        assert_eq!(status, JobStatus::RolledBack);

        // The file is back to its pre-run contents.
        assert_eq!(fs::read_to_string(&conf).unwrap(), "v1\n");
        let error = fx.ctx.job.error.as_ref().unwrap();
        assert_eq!(error.kind, FailureKind::PostcheckFailed);
        assert_eq!(exit_code_for(&fx.ctx.job), 5);
    }

    #[test]
    fn test_failing_action_without_auto_rollback() {
        let mut fx = test_context();

        let conf = fx.host_dir.join("app.conf");
        fs::write(&conf, "v1\n").unwrap();

        let mut m = manifest(vec![
            action(ActionKind::Backup {
                sources: vec![conf.clone()],
                name: None,
            }),
            action(ActionKind::Command {
                command: "exit 3".into(),
                cwd: None,
                timeout: 10,
            }),
        ]);
        m.rollback = RollbackPolicy {
            enabled: true,
            auto_on_failure: false,
            steps: None,
        };
        arm(&mut fx, &m);

        let status = run(&m, &mut fx.ctx).unwrap();
        assert_eq!(status, JobStatus::Failed);

        // No restore happened, the backup is retained.
        assert_eq!(fs::read_to_string(&conf).unwrap(), "v1\n");
        assert_eq!(fx.ctx.backups.list().unwrap().len(), 1);
        let error = fx.ctx.job.error.as_ref().unwrap();
        assert_eq!(error.kind, FailureKind::ActionFailed);
        assert_eq!(error.action_index, Some(1));
        assert_eq!(exit_code_for(&fx.ctx.job), 5);
    }

    #[test]
    fn test_rollback_without_backup_is_fatal() {
        let mut fx = test_context();
        let m = manifest(vec![action(ActionKind::Command {
            command: "false".into(),
            cwd: None,
            timeout: 10,
        })]);
        arm(&mut fx, &m);

        let status = run(&m, &mut fx.ctx).unwrap();
        assert_eq!(status, JobStatus::Failed);
        assert_eq!(
            fx.ctx.job.error.as_ref().unwrap().kind,
            FailureKind::RollbackFailed
        );
        assert_eq!(exit_code_for(&fx.ctx.job), 6);
    }

    #[test]
    fn test_explicit_rollback_steps_run_in_order() {
        let mut fx = test_context();
        let marker = fx.host_dir.join("rolled-back");

        let mut m = manifest(vec![action(ActionKind::Command {
            command: "false".into(),
            cwd: None,
            timeout: 10,
        })]);
        m.rollback = RollbackPolicy {
            enabled: true,
            auto_on_failure: true,
            steps: Some(vec![action(ActionKind::Command {
                command: format!("touch {}", marker.display()),
                cwd: None,
                timeout: 10,
            })]),
        };
        arm(&mut fx, &m);

        let status = run(&m, &mut fx.ctx).unwrap();
        assert_eq!(status, JobStatus::RolledBack);
        assert!(marker.exists());
    }

    #[test]
    fn test_continue_on_error_keeps_going() {
        let mut fx = test_context();
        let mut m = manifest(vec![
            ActionSpec {
                name: Some("allowed to fail".into()),
                continue_on_error: true,
                kind: ActionKind::Command {
                    command: "false".into(),
                    cwd: None,
                    timeout: 10,
                },
            },
            action(ActionKind::Command {
                command: "true".into(),
                cwd: None,
                timeout: 10,
            }),
        ]);
        m.post_checks = vec![shell_check("true")];
        arm(&mut fx, &m);

        let status = run(&m, &mut fx.ctx).unwrap();
        assert_eq!(status, JobStatus::Completed);
        // Only the successful action counts.
        assert_eq!(fx.ctx.job.progress.completed_actions, 1);
    }

    #[test]
    fn test_empty_actions_with_passing_checks_completes() {
        let mut fx = test_context();
        let mut m = manifest(Vec::new());
        m.pre_checks = vec![shell_check("true")];
        m.post_checks = vec![shell_check("true")];
        arm(&mut fx, &m);

        let status = run(&m, &mut fx.ctx).unwrap();
        assert_eq!(status, JobStatus::Completed);
        assert_eq!(fx.ctx.job.percent(), 100);
    }

    #[test]
    fn test_precheck_failure_skips_actions_and_rollback() {
        let mut fx = test_context();
        let marker = fx.host_dir.join("must-not-exist");
        let mut m = manifest(vec![action(ActionKind::Command {
            command: format!("touch {}", marker.display()),
            cwd: None,
            timeout: 10,
        })]);
        m.pre_checks = vec![shell_check("false")];
        arm(&mut fx, &m);

        let status = run(&m, &mut fx.ctx).unwrap();
        assert_eq!(status, JobStatus::Failed);
        assert!(!marker.exists());
        assert_eq!(
            fx.ctx.job.error.as_ref().unwrap().kind,
            FailureKind::PrecheckFailed
        );
        assert_eq!(fx.ctx.job.progress.completed_actions, 0);
    }

    #[test]
    fn test_cleanup_applies_retention() {
        let mut fx = test_context();

        let conf = fx.host_dir.join("f");
        fs::write(&conf, "x").unwrap();
        for i in 0..3 {
            fx.ctx
                .backups
                .create("old-job", &format!("old-{i}"), &[conf.clone()])
                .unwrap();
        }

        let mut m = manifest(Vec::new());
        m.cleanup = CleanupPolicy {
            remove_old_backups: true,
            keep_last_n: 1,
            remove_temp_files: false,
            remove_old_images: true,
        };
        arm(&mut fx, &m);

        let status = run(&m, &mut fx.ctx).unwrap();
        assert_eq!(status, JobStatus::Completed);
        assert_eq!(fx.ctx.backups.list().unwrap().len(), 1);
        assert!(fx
            .runtime
            .recorded()
            .iter()
            .any(|call| call.starts_with("prune_images")));
    }

    #[test]
    fn test_progress_events_reach_subscribers_in_order() {
        let mut fx = test_context();
        let mut subscriber = fx.bus.subscribe(&fx.ctx.job.job_id).unwrap();

        let m = manifest(vec![action(ActionKind::Command {
            command: "echo working".into(),
            cwd: None,
            timeout: 10,
        })]);
        arm(&mut fx, &m);
        run(&m, &mut fx.ctx).unwrap();

        let mut saw_running = false;
        let mut saw_log = false;
        let mut completed_at_end = false;
        while let Ok(event) = subscriber.try_recv() {
            completed_at_end = false;
            match event {
                UpdateEvent::Status(job) => {
                    if job.status == JobStatus::Running {
                        saw_running = true;
                    }
                }
                UpdateEvent::Log(line) => {
                    if line.contains("working") {
                        saw_log = true;
                    }
                }
                UpdateEvent::Complete(job) => {
                    assert_eq!(job.status, JobStatus::Completed);
                    completed_at_end = true;
                }
            }
        }
        assert!(saw_running);
        assert!(saw_log);
        assert!(completed_at_end, "complete must be the final event");
    }

    #[test]
    fn test_recover_interrupted_rolls_back() {
        let fx = test_context();

        // A job crashed mid-action after taking a backup.
        let conf = fx.host_dir.join("app.conf");
        fs::write(&conf, "v1\n").unwrap();
        let mut job = Job::new("crashed mid-action", 2, true);
        let record = fx
            .ctx
            .backups
            .create(&job.job_id, "pre", &[conf.clone()])
            .unwrap();
        job.backups_created.push(record.id);
        job.status = JobStatus::Running;
        job.progress.completed_actions = 1;
        fx.ctx.datastore.save_job(&job).unwrap();

        // The crash happened after the copy landed.
        fs::write(&conf, "v2 half-applied\n").unwrap();

        recover_interrupted(&fx.ctx.datastore, &fx.ctx.backups).unwrap();

        let recovered = fx.ctx.datastore.load_job(&job.job_id).unwrap();
        assert_eq!(recovered.status, JobStatus::RolledBack);
        assert_eq!(
            recovered.error.as_ref().unwrap().kind,
            FailureKind::Interrupted
        );
        assert_eq!(fs::read_to_string(&conf).unwrap(), "v1\n");
    }

    #[test]
    fn test_recover_interrupted_without_backup_just_fails() {
        let fx = test_context();

        let mut job = Job::new("crashed early", 2, true);
        job.status = JobStatus::Running;
        fx.ctx.datastore.save_job(&job).unwrap();

        recover_interrupted(&fx.ctx.datastore, &fx.ctx.backups).unwrap();

        let recovered = fx.ctx.datastore.load_job(&job.job_id).unwrap();
        assert_eq!(recovered.status, JobStatus::Failed);
        assert_eq!(
            recovered.error.as_ref().unwrap().kind,
            FailureKind::Interrupted
        );

        // Terminal jobs are untouched by a second recovery pass.
        recover_interrupted(&fx.ctx.datastore, &fx.ctx.backups).unwrap();
        assert_eq!(
            fx.ctx.datastore.load_job(&job.job_id).unwrap(),
            recovered
        );
    }
}
