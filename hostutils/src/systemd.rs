use anyhow::{Context, Error};

use crate::dependencies::Dependency;

/// Whether a systemd unit is currently active, per `systemctl is-active`.
pub fn service_is_active(service: &str) -> Result<bool, Error> {
    let status = Dependency::Systemctl
        .cmd()?
        .arg("is-active")
        .arg("--quiet")
        .arg(service)
        .status()
        .context(format!("Failed to query service '{service}'"))?;
    Ok(status.success())
}
