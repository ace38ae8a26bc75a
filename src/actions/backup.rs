use std::path::PathBuf;

use anyhow::{bail, Error};

use crate::engine::EngineContext;

/// Special backup name selecting the most recent backup across all jobs.
pub const LATEST: &str = "latest";

/// Capture the given host paths into a new backup owned by this job.
pub fn create(
    sources: &[PathBuf],
    name: Option<&str>,
    ctx: &mut EngineContext,
) -> Result<(), Error> {
    let name = match name {
        Some(name) => name.to_string(),
        None => format!(
            "backup_{}_{}",
            ctx.job.job_id,
            ctx.job.backups_created.len()
        ),
    };
    let record = ctx.backups.create(&ctx.job.job_id, &name, sources)?;
    ctx.job.backups_created.push(record.id.clone());
    ctx.log(format!(
        "Captured backup '{}' ({} sources)",
        record.id,
        sources.len()
    ));
    Ok(())
}

/// Restore a backup by name, or the most recent one with the special name
/// `latest`.
pub fn restore(backup_name: &str, ctx: &mut EngineContext) -> Result<(), Error> {
    let record = if backup_name == LATEST {
        ctx.backups.latest()?
    } else {
        ctx.backups.find(backup_name)?
    };
    let Some(record) = record else {
        bail!("No backup matching '{backup_name}' exists");
    };

    if record.job_id != ctx.job.job_id {
        ctx.log(format!(
            "Warning: restoring backup '{}' created by another job ('{}')",
            record.id, record.job_id
        ));
    }
    ctx.backups.restore(&record)?;
    ctx.log(format!("Restored backup '{}'", record.id));
    Ok(())
}
