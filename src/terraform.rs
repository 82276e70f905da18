//! Thin wrapper over the `terraform` CLI used by the cloud drivers.
//!
//! Every range lives in its own terraform workspace named after the range
//! id, so `destroy` can only ever reach resources recorded for that range.

use std::ffi::OsString;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};

use crate::config::RangeConfig;
use crate::error::RangeError;
use crate::runner::{CommandOutput, CommandRunner, args};

/// File terraform loads variables from automatically.
pub const VARS_FILE_NAME: &str = "attack_range.auto.tfvars.json";

/// File holding the partial remote backend block.
pub const BACKEND_FILE_NAME: &str = "backend.tf";

const LOCK_MARKER: &str = "Error acquiring the state lock";

/// Kind of failure a terraform step maps onto.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    /// Creating or converging resources.
    Provision,
    /// Removing resources.
    Teardown,
}

impl Phase {
    /// Error of this phase for `stage`, naming `failed_resources`.
    #[must_use]
    pub const fn failure(
        self,
        stage: String,
        message: String,
        failed_resources: Vec<String>,
    ) -> RangeError {
        match self {
            Self::Provision => RangeError::Provision {
                stage,
                message,
                failed_resources,
            },
            Self::Teardown => RangeError::Teardown {
                stage,
                message,
                failed_resources,
            },
        }
    }
}

/// Terraform bound to one working directory.
#[derive(Clone, Debug)]
pub struct Terraform<'a, R: CommandRunner> {
    runner: &'a R,
    bin: &'a str,
    dir: Utf8PathBuf,
    parallelism: u32,
}

impl<'a, R: CommandRunner> Terraform<'a, R> {
    /// Binds terraform to `dir`.
    #[must_use]
    pub const fn new(runner: &'a R, bin: &'a str, dir: Utf8PathBuf, parallelism: u32) -> Self {
        Self {
            runner,
            bin,
            dir,
            parallelism,
        }
    }

    /// Working directory terraform runs in.
    #[must_use]
    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    /// Initialises providers using whatever backend is already configured.
    ///
    /// # Errors
    ///
    /// Returns a provision or teardown error (per `phase`) when init fails.
    pub fn init(&self, phase: Phase) -> Result<(), RangeError> {
        self.step(phase, "terraform init", args(["init", "-input=false", "-no-color"]))
            .map(drop)
    }

    /// Re-initialises against a remote backend described by `backend_config`.
    ///
    /// Safe to repeat: `-reconfigure` discards the previous backend binding
    /// without migrating state.
    ///
    /// # Errors
    ///
    /// Returns [`RangeError::Provision`] when init fails.
    pub fn init_backend(&self, backend_config: &[(&str, String)]) -> Result<(), RangeError> {
        let mut argv = args(["init", "-input=false", "-no-color", "-reconfigure"]);
        for (key, value) in backend_config {
            argv.push(OsString::from(format!("-backend-config={key}={value}")));
        }
        self.step(Phase::Provision, "terraform init -reconfigure", argv)
            .map(drop)
    }

    /// Selects the workspace of `range_id`, creating it when absent.
    ///
    /// # Errors
    ///
    /// Returns a provision or teardown error (per `phase`) when selection
    /// fails.
    pub fn select_workspace(&self, range_id: &str, phase: Phase) -> Result<(), RangeError> {
        self.step(
            phase,
            "terraform workspace select",
            args(["workspace", "select", "-or-create=true", range_id]),
        )
        .map(drop)
    }

    /// Removes the now-empty workspace of `range_id`.
    ///
    /// # Errors
    ///
    /// Returns [`RangeError::Teardown`] when the workspace cannot be removed.
    pub fn delete_workspace(&self, range_id: &str) -> Result<(), RangeError> {
        self.step(
            Phase::Teardown,
            "terraform workspace select default",
            args(["workspace", "select", "default"]),
        )?;
        self.step(
            Phase::Teardown,
            "terraform workspace delete",
            args(["workspace", "delete", range_id]),
        )
        .map(drop)
    }

    /// Writes the pruned configuration as the auto-loaded variables file.
    ///
    /// # Errors
    ///
    /// Returns [`RangeError::Provision`] when the file cannot be written.
    pub fn write_vars(&self, config: &RangeConfig) -> Result<(), RangeError> {
        let document = config.to_document()?;
        let rendered =
            serde_json::to_string_pretty(&document).map_err(|err| RangeError::Provision {
                stage: String::from("write terraform variables"),
                message: err.to_string(),
                failed_resources: Vec::new(),
            })?;
        write_file(&self.dir, VARS_FILE_NAME, &rendered, Phase::Provision)
    }

    /// Converges every resource of the selected workspace.
    ///
    /// Terraform finishes independent resources before reporting the first
    /// failure, so partial progress is recorded in state and a re-run
    /// resumes from it.
    ///
    /// # Errors
    ///
    /// Returns [`RangeError::Provision`] naming the failed resources, or
    /// [`RangeError::LockConflict`] when the state is locked.
    pub fn apply(&self) -> Result<(), RangeError> {
        let argv = args([
            String::from("apply"),
            String::from("-input=false"),
            String::from("-no-color"),
            String::from("-auto-approve"),
            format!("-parallelism={}", self.parallelism),
        ]);
        self.step(Phase::Provision, "terraform apply", argv)
            .map(drop)
    }

    /// Destroys every resource of the selected workspace.
    ///
    /// # Errors
    ///
    /// Returns [`RangeError::Teardown`] naming the failed resources, or
    /// [`RangeError::LockConflict`] when the state is locked.
    pub fn destroy(&self) -> Result<(), RangeError> {
        let argv = args([
            String::from("destroy"),
            String::from("-input=false"),
            String::from("-no-color"),
            String::from("-auto-approve"),
            format!("-parallelism={}", self.parallelism),
        ]);
        self.step(Phase::Teardown, "terraform destroy", argv)
            .map(drop)
    }

    /// Writes the partial backend block so `init_backend` can bind to it.
    ///
    /// # Errors
    ///
    /// Returns [`RangeError::Provision`] when the file cannot be written.
    pub fn write_backend_block(&self, backend_type: &str) -> Result<(), RangeError> {
        let block = format!("terraform {{\n  backend \"{backend_type}\" {{}}\n}}\n");
        write_file(&self.dir, BACKEND_FILE_NAME, &block, Phase::Provision)
    }

    /// Removes the partial backend block, returning to local state.
    ///
    /// # Errors
    ///
    /// Returns [`RangeError::Teardown`] when the file exists but cannot be
    /// removed.
    pub fn remove_backend_block(&self) -> Result<(), RangeError> {
        let dir = open_dir(&self.dir, Phase::Teardown)?;
        match dir.remove_file(BACKEND_FILE_NAME) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(file_error(
                Phase::Teardown,
                &self.dir.join(BACKEND_FILE_NAME),
                &err,
            )),
        }
    }

    fn step(
        &self,
        phase: Phase,
        stage: &str,
        argv: Vec<OsString>,
    ) -> Result<CommandOutput, RangeError> {
        tracing::info!(stage, dir = %self.dir, "terraform step");
        let output = self.runner.run(self.bin, &argv, &self.dir)?;
        if output.is_success() {
            return Ok(output);
        }
        Err(engine_failure(phase, stage, &output))
    }
}

/// Maps a failed engine step onto the matching [`RangeError`].
#[must_use]
pub fn engine_failure(phase: Phase, stage: &str, output: &CommandOutput) -> RangeError {
    let message = failure_message(output);
    if message.contains(LOCK_MARKER) {
        return RangeError::LockConflict {
            stage: stage.to_owned(),
            message,
        };
    }
    phase.failure(stage.to_owned(), message, failed_resources(&output.stderr))
}

fn failure_message(output: &CommandOutput) -> String {
    let stderr = output.stderr.trim();
    if stderr.is_empty() {
        format!("exited with status {}", output.status_text())
    } else {
        stderr.to_owned()
    }
}

/// Extracts resource addresses from terraform's `with <address>,` lines.
#[must_use]
pub fn failed_resources(stderr: &str) -> Vec<String> {
    let mut resources: Vec<String> = Vec::new();
    for line in stderr.lines() {
        let trimmed = line.trim_start_matches(|ch: char| ch == '│' || ch.is_whitespace());
        let Some(rest) = trimmed.strip_prefix("with ") else {
            continue;
        };
        let address = rest.trim_end_matches(',').trim();
        if !address.is_empty() && !resources.iter().any(|known| known == address) {
            resources.push(address.to_owned());
        }
    }
    resources
}

fn open_dir(path: &Utf8Path, phase: Phase) -> Result<Dir, RangeError> {
    Dir::open_ambient_dir(path, ambient_authority()).map_err(|err| file_error(phase, path, &err))
}

fn write_file(
    dir_path: &Utf8Path,
    file_name: &str,
    contents: &str,
    phase: Phase,
) -> Result<(), RangeError> {
    let dir = open_dir(dir_path, phase)?;
    dir.write(file_name, contents)
        .map_err(|err| file_error(phase, &dir_path.join(file_name), &err))
}

fn file_error(phase: Phase, path: &Utf8Path, err: &std::io::Error) -> RangeError {
    phase.failure(format!("write {path}"), err.to_string(), Vec::new())
}
