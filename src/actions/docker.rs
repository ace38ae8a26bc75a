use std::path::Path;

use anyhow::Error;

use crate::engine::EngineContext;

pub fn compose_up(
    compose_file: &Path,
    detach: bool,
    build: bool,
    ctx: &mut EngineContext,
) -> Result<(), Error> {
    let path = ctx.host_or_staged(compose_file);
    ctx.adapters.runtime.compose_up(&path, detach, build)?;
    ctx.log(format!("Compose stack {} is up", compose_file.display()));
    Ok(())
}

pub fn compose_down(
    compose_file: &Path,
    remove_orphans: bool,
    ctx: &mut EngineContext,
) -> Result<(), Error> {
    let path = ctx.host_or_staged(compose_file);
    ctx.adapters.runtime.compose_down(&path, remove_orphans)?;
    ctx.log(format!("Compose stack {} is down", compose_file.display()));
    Ok(())
}

pub fn load(image_tar: &Path, ctx: &mut EngineContext) -> Result<(), Error> {
    let path = ctx.staged(image_tar);
    let output = ctx.adapters.runtime.load_image(&path)?;
    for line in output.lines().filter(|line| !line.trim().is_empty()) {
        ctx.log(line.to_string());
    }
    Ok(())
}

pub fn prune(all: bool, force: bool, ctx: &mut EngineContext) -> Result<(), Error> {
    let output = ctx.adapters.runtime.prune_images(all, force)?;
    for line in output.lines().filter(|line| !line.trim().is_empty()) {
        ctx.log(line.to_string());
    }
    Ok(())
}
