//! Action handlers. The manifest's action set is a closed enum: dispatch is
//! a match, so an unknown action can only be rejected at parse time, never
//! discovered mid-run.

use std::time::Duration;

use anyhow::Error;

use updater_api::manifest::{ActionKind, ActionSpec};

use crate::engine::EngineContext;

pub mod backup;
pub mod command;
pub mod docker;
pub mod engine_install;
pub mod files;

/// Execute one action against the host. Handlers emit their own fine-grained
/// log lines; the orchestrator wraps this with the coarse started/completed
/// events and failure classification.
pub fn run_action(spec: &ActionSpec, ctx: &mut EngineContext) -> Result<(), Error> {
    match &spec.kind {
        ActionKind::Command {
            command,
            cwd,
            timeout,
        } => command::run(command, cwd.as_deref(), Duration::from_secs(*timeout), ctx),

        ActionKind::Backup { sources, name } => backup::create(sources, name.as_deref(), ctx),

        ActionKind::RestoreBackup { backup_name } => backup::restore(backup_name, ctx),

        ActionKind::DockerComposeDown {
            compose_file,
            remove_orphans,
        } => docker::compose_down(compose_file, *remove_orphans, ctx),

        ActionKind::DockerComposeUp {
            compose_file,
            detach,
            build,
        } => docker::compose_up(compose_file, *detach, *build, ctx),

        ActionKind::DockerLoad { image_tar } => docker::load(image_tar, ctx),

        ActionKind::DockerPrune { all, force } => docker::prune(*all, *force, ctx),

        ActionKind::FileCopy {
            source,
            destination,
            checksum,
        } => files::copy(source, destination, checksum.as_deref(), ctx),

        ActionKind::FileSync {
            source,
            destination,
            mode,
        } => files::sync(source, destination, *mode, ctx),

        ActionKind::FileMerge {
            source,
            destination,
            strategy,
        } => files::merge(source, destination, *strategy, ctx),

        ActionKind::InstallEngine { source, version } => engine_install::run(source, version, ctx),
    }
}
