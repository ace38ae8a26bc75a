use std::{fs, path::Path};

use anyhow::{bail, Context, Error};

use hostutils::files;
use updater_api::{constants::ENGINE_VERSION_FILE, version::EngineVersion};

use crate::engine::EngineContext;

/// Install the engine bundled in the staged package as
/// `update-engines/v<version>/` and atomically repoint the `current` symlink
/// at it. The version directory is assembled next to its final location and
/// renamed into place, so a crash never leaves a half-installed engine
/// addressed by `current`.
pub fn run(source: &Path, version: &EngineVersion, ctx: &mut EngineContext) -> Result<(), Error> {
    let staged = ctx.staged(source);
    if !staged.is_dir() {
        bail!(
            "Package does not bundle an engine at '{}'",
            source.display()
        );
    }

    let version = version.to_string();
    let engines_dir = ctx.config.engines_dir();
    let final_dir = ctx.config.engine_version_dir(&version);
    let staging = engines_dir.join(format!(".tmp-v{version}"));

    files::remove_path_if_exists(&staging)?;
    files::copy_tree(&staged, &staging)?;
    files::atomic_write(&staging.join(ENGINE_VERSION_FILE), version.as_bytes())?;

    files::remove_path_if_exists(&final_dir)?;
    fs::rename(&staging, &final_dir).context("Failed to move engine into place")?;
    files::fsync_dir(&engines_dir)?;

    files::atomic_symlink_swap(
        &ctx.config.current_engine_link(),
        Path::new(&format!("v{version}")),
    )?;

    ctx.log(format!("Installed engine v{version} and swapped 'current'"));
    Ok(())
}
