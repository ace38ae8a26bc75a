use std::{
    io::{BufRead, BufReader},
    path::Path,
    process::{Child, Command, Stdio},
    sync::mpsc,
    thread,
    time::{Duration, Instant},
};

use anyhow::{bail, Context, Error};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use hostutils::dependencies::Dependency;

use crate::engine::EngineContext;

/// Grace period between SIGTERM and SIGKILL when a command overruns its
/// timeout.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Interval after which a silent command emits a heartbeat log line.
const HEARTBEAT: Duration = Duration::from_secs(2);

const POLL: Duration = Duration::from_millis(100);

/// Run a shell-interpreted command, streaming its combined output into the
/// job log and enforcing the timeout. A nonzero exit is an error.
pub fn run(
    command: &str,
    cwd: Option<&Path>,
    timeout: Duration,
    ctx: &mut EngineContext,
) -> Result<(), Error> {
    let mut cmd = Dependency::Sh.cmd()?;
    cmd.arg("-c").arg(command);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .context(format!("Failed to spawn command '{command}'"))?;

    let (tx, rx) = mpsc::channel::<String>();
    spawn_line_reader(child.stdout.take(), tx.clone());
    spawn_line_reader(child.stderr.take(), tx);

    let deadline = Instant::now() + timeout;
    let mut last_line = Instant::now();
    let status = loop {
        while let Ok(line) = rx.try_recv() {
            ctx.log(line);
            last_line = Instant::now();
        }

        if let Some(status) = child.try_wait().context("Failed to poll command")? {
            break status;
        }

        if ctx.cancel.is_cancelled() {
            terminate(&mut child)?;
            bail!("Command '{command}' cancelled");
        }
        if Instant::now() >= deadline {
            terminate(&mut child)?;
            bail!(
                "Command '{command}' timed out after {}s",
                timeout.as_secs()
            );
        }
        if last_line.elapsed() >= HEARTBEAT {
            ctx.log(format!("'{command}' still running..."));
            last_line = Instant::now();
        }
        thread::sleep(POLL);
    };

    // Drain whatever the readers still hold; they end once the pipes close.
    while let Ok(line) = rx.recv_timeout(Duration::from_millis(200)) {
        ctx.log(line);
    }

    if !status.success() {
        match status.code() {
            Some(code) => bail!("Command '{command}' exited with status {code}"),
            None => bail!("Command '{command}' was terminated by a signal"),
        }
    }
    Ok(())
}

fn spawn_line_reader<R: std::io::Read + Send + 'static>(
    stream: Option<R>,
    tx: mpsc::Sender<String>,
) {
    let Some(stream) = stream else { return };
    thread::spawn(move || {
        for line in BufReader::new(stream).lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });
}

/// SIGTERM, then SIGKILL after the grace period.
fn terminate(child: &mut Child) -> Result<(), Error> {
    let pid = Pid::from_raw(child.id() as i32);
    let _ = kill(pid, Signal::SIGTERM);

    let grace_deadline = Instant::now() + KILL_GRACE;
    while Instant::now() < grace_deadline {
        if child.try_wait().context("Failed to poll command")?.is_some() {
            return Ok(());
        }
        thread::sleep(POLL);
    }

    child.kill().context("Failed to kill command")?;
    child.wait().context("Failed to reap command")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::engine::testutil::test_context;

    use super::*;

    #[test]
    fn test_success_streams_output() {
        let mut fx = test_context();
        run(
            "echo line-one && echo line-two 1>&2",
            None,
            Duration::from_secs(10),
            &mut fx.ctx,
        )
        .unwrap();
        let logs = fx.ctx.job.logs.join("\n");
        assert!(logs.contains("line-one"));
        assert!(logs.contains("line-two"));
    }

    #[test]
    fn test_nonzero_exit_fails() {
        let mut fx = test_context();
        let err = run("exit 7", None, Duration::from_secs(10), &mut fx.ctx).unwrap_err();
        assert!(err.to_string().contains("status 7"));
    }

    #[test]
    fn test_cwd_is_honoured() {
        let mut fx = test_context();
        let cwd = fx.ctx.config.base_dir.clone();
        run("pwd", Some(&cwd), Duration::from_secs(10), &mut fx.ctx).unwrap();
        let cwd = cwd.canonicalize().unwrap();
        assert!(fx
            .ctx
            .job
            .logs
            .iter()
            .any(|line| Path::new(line) == cwd));
    }

    #[test]
    fn test_timeout_kills_the_command() {
        let mut fx = test_context();
        let start = Instant::now();
        let err = run("sleep 30", None, Duration::from_millis(300), &mut fx.ctx).unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_cancel_stops_the_command() {
        let mut fx = test_context();
        fx.ctx.cancel.cancel();
        let err = run("sleep 30", None, Duration::from_secs(60), &mut fx.ctx).unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }
}
