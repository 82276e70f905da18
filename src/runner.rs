//! External command execution.
//!
//! Every provisioning engine and cloud CLI the range controller talks to is
//! an external binary. Drivers never spawn processes directly; they go
//! through [`CommandRunner`] so tests can script outcomes without touching
//! real infrastructure.

use std::ffi::OsString;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::process::{Command, Stdio};
use std::thread;

use camino::{Utf8Path, Utf8PathBuf};
use shell_escape::unix::escape;
use thiserror::Error;

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }

    /// Human readable exit status used in error messages.
    #[must_use]
    pub fn status_text(&self) -> String {
        self.code
            .map_or_else(|| String::from("unknown"), |code| code.to_string())
    }
}

/// Errors raised when a command cannot be executed at all.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RunnerError {
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the output streams of a running command cannot be read.
    #[error("failed to collect output of {program}: {message}")]
    Output {
        /// Command whose output could not be read.
        program: String,
        /// Operating system error string.
        message: String,
    },
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner {
    /// Runs `program` with `args` inside `dir`, capturing stdout and stderr.
    ///
    /// A non-zero exit status is not an error at this layer; callers decide
    /// what a failure means for their operation.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Spawn`] if the command cannot be started.
    fn run(
        &self,
        program: &str,
        args: &[OsString],
        dir: &Utf8Path,
    ) -> Result<CommandOutput, RunnerError>;
}

/// Runner that captures output silently. Used for short inventory queries.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(
        &self,
        program: &str,
        args: &[OsString],
        dir: &Utf8Path,
    ) -> Result<CommandOutput, RunnerError> {
        tracing::debug!(command = %render_command(program, args), %dir, "running");
        let output = Command::new(program)
            .args(args)
            .current_dir(dir)
            .output()
            .map_err(|err| RunnerError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Runner that forwards output line by line to stderr while also capturing
/// it, keeping stdout free for command results.
///
/// Terraform applies and packer builds run for many minutes; operators need
/// to see progress as it happens.
#[derive(Clone, Debug, Default)]
pub struct StreamingCommandRunner;

impl CommandRunner for StreamingCommandRunner {
    fn run(
        &self,
        program: &str,
        args: &[OsString],
        dir: &Utf8Path,
    ) -> Result<CommandOutput, RunnerError> {
        tracing::debug!(command = %render_command(program, args), %dir, "running");
        let spawn_error = |err: io::Error| RunnerError::Spawn {
            program: program.to_owned(),
            message: err.to_string(),
        };
        let mut child = Command::new(program)
            .args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_error)?;

        let output_error = |message: &str| RunnerError::Output {
            program: program.to_owned(),
            message: message.to_owned(),
        };
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| output_error("stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| output_error("stderr was not captured"))?;

        let stdout_thread = thread::spawn(move || tee(stdout, io::stderr()));
        let stderr_thread = thread::spawn(move || tee(stderr, io::stderr()));

        let status = child.wait().map_err(spawn_error)?;
        let captured_stdout = join_tee(stdout_thread).map_err(|err| output_error(&err))?;
        let captured_stderr = join_tee(stderr_thread).map_err(|err| output_error(&err))?;

        Ok(CommandOutput {
            code: status.code(),
            stdout: captured_stdout,
            stderr: captured_stderr,
        })
    }
}

fn tee(source: impl Read, mut sink: impl Write) -> io::Result<String> {
    let mut captured = String::new();
    let mut reader = BufReader::new(source);
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        sink.write_all(line.as_bytes())?;
        sink.flush()?;
        captured.push_str(&line);
    }
    Ok(captured)
}

fn join_tee(handle: thread::JoinHandle<io::Result<String>>) -> Result<String, String> {
    match handle.join() {
        Ok(Ok(captured)) => Ok(captured),
        Ok(Err(err)) => Err(err.to_string()),
        Err(_) => Err(String::from("output forwarding thread panicked")),
    }
}

/// Renders a program and its arguments as a shell-escaped command line.
///
/// Used for log lines and error messages; never executed through a shell.
#[must_use]
pub fn render_command(program: &str, args: &[OsString]) -> String {
    let mut rendered = String::from(escape(program.into()));
    for arg in args {
        let text = arg.to_string_lossy();
        rendered.push(' ');
        rendered.push_str(escape(text).as_ref());
    }
    rendered
}

/// Converts string-like arguments into the owned form runners accept.
#[must_use]
pub fn args<I, S>(values: I) -> Vec<OsString>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    values.into_iter().map(Into::into).collect()
}
