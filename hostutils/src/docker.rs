use std::path::Path;

use anyhow::{Context, Error};

use crate::{
    dependencies::Dependency,
    exe::{OutputChecker, RunAndCheck},
};

/// `docker compose -f <file> up [-d] [--build]`
pub fn compose_up(compose_file: &Path, detach: bool, build: bool) -> Result<(), Error> {
    let mut cmd = Dependency::Docker.cmd()?;
    cmd.arg("compose").arg("-f").arg(compose_file).arg("up");
    if detach {
        cmd.arg("-d");
    }
    if build {
        cmd.arg("--build");
    }
    cmd.run_and_check().context("docker compose up failed")
}

/// `docker compose -f <file> down [--remove-orphans]`
pub fn compose_down(compose_file: &Path, remove_orphans: bool) -> Result<(), Error> {
    let mut cmd = Dependency::Docker.cmd()?;
    cmd.arg("compose").arg("-f").arg(compose_file).arg("down");
    if remove_orphans {
        cmd.arg("--remove-orphans");
    }
    cmd.run_and_check().context("docker compose down failed")
}

/// `docker load -i <tar>`
pub fn load_image(image_tar: &Path) -> Result<String, Error> {
    let mut cmd = Dependency::Docker.cmd()?;
    cmd.arg("load").arg("-i").arg(image_tar);
    cmd.output_and_check().context("docker load failed")
}

/// `docker image prune [-a] [-f]`
pub fn prune_images(all: bool, force: bool) -> Result<String, Error> {
    let mut cmd = Dependency::Docker.cmd()?;
    cmd.arg("image").arg("prune");
    if all {
        cmd.arg("-a");
    }
    if force {
        cmd.arg("-f");
    }
    cmd.output_and_check().context("docker image prune failed")
}

/// Health of a container: the health-check status when the container defines
/// one, otherwise its run state (`running`, `exited`, ...).
pub fn container_health(container: &str) -> Result<String, Error> {
    let mut cmd = Dependency::Docker.cmd()?;
    cmd.arg("inspect")
        .arg("--format")
        .arg("{{if .State.Health}}{{.State.Health.Status}}{{else}}{{.State.Status}}{{end}}")
        .arg(container);
    let output = cmd.output();
    if !output.is_success() {
        anyhow::bail!(
            "Failed to inspect container '{container}': {}",
            output.stderr_text().trim()
        );
    }
    Ok(output.stdout_text().trim().to_string())
}
