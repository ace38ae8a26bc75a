//! Check handlers. Same closed-enum dispatch as actions, but checks return a
//! pass/fail with a diagnostic instead of mutating the host. `command` and
//! `http_check` are the only checks with real side effects.

use std::{path::Path, thread, time::Duration};

use anyhow::Error;
use nix::sys::statvfs::statvfs;

use updater_api::manifest::{CheckKind, CheckSpec};

use crate::{actions, engine::EngineContext};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub ok: bool,
    pub diagnostic: String,
}

impl CheckOutcome {
    fn pass(diagnostic: impl Into<String>) -> Self {
        Self {
            ok: true,
            diagnostic: diagnostic.into(),
        }
    }

    fn fail(diagnostic: impl Into<String>) -> Self {
        Self {
            ok: false,
            diagnostic: diagnostic.into(),
        }
    }
}

/// Run one check. Internal errors (unreachable adapter, broken probe) count
/// as failures and surface through the diagnostic.
pub fn run_check(spec: &CheckSpec, ctx: &mut EngineContext) -> CheckOutcome {
    match evaluate(spec, ctx) {
        Ok(outcome) => outcome,
        Err(e) => CheckOutcome::fail(format!("{e:#}")),
    }
}

fn evaluate(spec: &CheckSpec, ctx: &mut EngineContext) -> Result<CheckOutcome, Error> {
    Ok(match &spec.kind {
        CheckKind::Command { command, timeout } => {
            match actions::command::run(command, None, Duration::from_secs(*timeout), ctx) {
                Ok(()) => CheckOutcome::pass("command exited 0"),
                Err(e) => CheckOutcome::fail(format!("{e:#}")),
            }
        }

        CheckKind::HttpCheck {
            url,
            expect_status,
            retries,
            delay,
        } => http_check(url, *expect_status, *retries, *delay, ctx),

        CheckKind::ServiceRunning { service } => {
            if ctx.adapters.services.is_active(service)? {
                CheckOutcome::pass(format!("service '{service}' is active"))
            } else {
                CheckOutcome::fail(format!("service '{service}' is not active"))
            }
        }

        CheckKind::DockerHealth { container } => {
            let health = ctx.adapters.runtime.container_health(container)?;
            if health == "healthy" || health == "running" {
                CheckOutcome::pass(format!("container '{container}' is {health}"))
            } else {
                CheckOutcome::fail(format!("container '{container}' is {health}"))
            }
        }

        CheckKind::FileExists { path } => {
            if path.exists() {
                CheckOutcome::pass(format!("'{}' exists", path.display()))
            } else {
                CheckOutcome::fail(format!("'{}' does not exist", path.display()))
            }
        }

        CheckKind::FreeDiskSpace { path, min_bytes } => free_disk_space(path, *min_bytes)?,
    })
}

/// Probe the endpoint up to `retries` times with `delay` seconds between
/// attempts, failing only after exhaustion.
fn http_check(
    url: &str,
    expect_status: u16,
    retries: u32,
    delay: u64,
    ctx: &mut EngineContext,
) -> CheckOutcome {
    let attempts = retries.max(1);
    let mut last = String::new();
    for attempt in 1..=attempts {
        if ctx.cancel.is_cancelled() {
            return CheckOutcome::fail("check cancelled");
        }
        match ctx.adapters.http.probe(url) {
            Ok(status) if status == expect_status => {
                return CheckOutcome::pass(format!("{url} returned {status}"));
            }
            Ok(status) => {
                last = format!("{url} returned {status}, expected {expect_status}");
            }
            Err(e) => {
                last = format!("{url} unreachable: {e:#}");
            }
        }
        ctx.log(format!("http_check attempt {attempt}/{attempts}: {last}"));
        if attempt < attempts {
            thread::sleep(Duration::from_secs(delay));
        }
    }
    CheckOutcome::fail(last)
}

fn free_disk_space(path: &Path, min_bytes: u64) -> Result<CheckOutcome, Error> {
    let stat = statvfs(path)?;
    let available = stat.blocks_available() as u64 * stat.fragment_size() as u64;
    Ok(if available >= min_bytes {
        CheckOutcome::pass(format!(
            "{} has {available} bytes free (need {min_bytes})",
            path.display()
        ))
    } else {
        CheckOutcome::fail(format!(
            "{} has only {available} bytes free, need {min_bytes}",
            path.display()
        ))
    })
}
