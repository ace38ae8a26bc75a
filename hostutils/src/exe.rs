use std::process::{Command, Output};

use anyhow::{anyhow, bail, Error};
use log::trace;

use crate::crate_private::Sealed;

/// Extension for `std::process::Output` to check exit status and extract
/// output as strings. Sealed; not implementable outside this crate.
pub trait OutputChecker: Sealed {
    fn is_success(&self) -> bool;

    fn exit_code(&self) -> Option<i32>;

    fn stdout_text(&self) -> String;

    fn stderr_text(&self) -> String;

    /// All collected output, for reporting.
    fn output_report(&self) -> String {
        let stdout = self.stdout_text();
        let stderr = self.stderr_text();
        let mut report = String::with_capacity(stdout.len() + stderr.len() + 20);
        if !stdout.is_empty() {
            report += &format!("stdout:\n{stdout}\n");
        }
        if !stderr.is_empty() {
            if !report.is_empty() {
                report += "\n";
            }
            report += &format!("stderr:\n{stderr}\n");
        }
        report
    }

    fn explain_exit(&self) -> String {
        match self.exit_code() {
            Some(code) => format!("process exited with status: {code}"),
            None => "process was terminated by signal".into(),
        }
    }

    fn check(&self) -> Result<(), Error> {
        if self.is_success() {
            return Ok(());
        }
        Err(match self.output_report() {
            report if !report.is_empty() => {
                anyhow!("Process output:\n{report}").context(self.explain_exit())
            }
            _ => anyhow!("(no output was collected)").context(self.explain_exit()),
        })
    }

    fn check_output(&self) -> Result<String, Error> {
        self.check()?;
        Ok(self.stdout_text())
    }
}

impl Sealed for Output {}

impl OutputChecker for Output {
    fn is_success(&self) -> bool {
        self.status.success()
    }

    fn exit_code(&self) -> Option<i32> {
        self.status.code()
    }

    fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into()
    }

    fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into()
    }
}

impl Sealed for Result<Output, std::io::Error> {}

impl OutputChecker for Result<Output, std::io::Error> {
    fn is_success(&self) -> bool {
        self.as_ref().map(|o| o.is_success()).unwrap_or(false)
    }

    fn exit_code(&self) -> Option<i32> {
        self.as_ref().ok().and_then(|o| o.exit_code())
    }

    fn stdout_text(&self) -> String {
        self.as_ref().map(|o| o.stdout_text()).unwrap_or_default()
    }

    fn stderr_text(&self) -> String {
        self.as_ref().map(|o| o.stderr_text()).unwrap_or_default()
    }

    fn check(&self) -> Result<(), Error> {
        match self {
            Ok(output) => output.check(),
            Err(e) => bail!("Failed to execute process: {e}"),
        }
    }
}

/// Run a command to completion, tracing the rendered command line and
/// failing with the collected output on a nonzero exit.
pub trait RunAndCheck: Sealed {
    fn run_and_check(&mut self) -> Result<(), Error>;
    fn output_and_check(&mut self) -> Result<String, Error>;
    fn render_command(&self) -> String;
}

impl Sealed for Command {}

impl RunAndCheck for Command {
    fn run_and_check(&mut self) -> Result<(), Error> {
        let rendered = self.render_command();
        trace!("Executing '{rendered}'");
        let result = self.output();
        trace!("Executed '{rendered}': {}", result.explain_exit());
        result
            .check()
            .map_err(|e| e.context(format!("Error when running: {rendered}")))
    }

    fn output_and_check(&mut self) -> Result<String, Error> {
        let rendered = self.render_command();
        trace!("Executing '{rendered}'");
        let result = self.output();
        trace!("Executed '{rendered}': {}", result.explain_exit());
        result
            .check_output()
            .map_err(|e| e.context(format!("Error when running: {rendered}")))
    }

    fn render_command(&self) -> String {
        let mut rendered = self.get_program().to_string_lossy().into_owned();
        for arg in self.get_args() {
            let arg = arg.to_string_lossy();
            rendered.push(' ');
            if arg.contains(' ') {
                rendered.push_str(&format!("'{arg}'"));
            } else {
                rendered.push_str(&arg);
            }
        }
        rendered
    }
}
