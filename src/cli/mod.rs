//! Command-line interface definitions for the `attack-range` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page. It
//! must not depend on the library crate.

use clap::{Args, Parser, Subcommand};

/// Top-level CLI for the `attack-range` binary.
#[derive(Debug, Parser)]
#[command(
    name = "attack-range",
    about = "Build, operate, and tear down attack ranges on AWS, Azure, or Vagrant",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Range configuration file.
    #[arg(
        short = 'c',
        long = "config",
        global = true,
        value_name = "PATH",
        default_value = "attack_range.yml"
    )]
    pub(crate) config: String,
    /// Log external commands and other debug detail.
    #[arg(short = 'v', long = "verbose", global = true)]
    pub(crate) verbose: bool,
    /// Operation to run.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Operations the controller exposes.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Write a starter configuration to the `--config` path.
    #[command(name = "configure")]
    Configure(ConfigureCommand),
    /// Provision or converge the range.
    #[command(name = "build")]
    Build,
    /// Remove every resource of the range.
    #[command(name = "destroy")]
    Destroy,
    /// Stop running machines.
    #[command(name = "stop")]
    Stop,
    /// Start stopped machines.
    #[command(name = "resume")]
    Resume,
    /// Build a golden image.
    #[command(name = "packer")]
    Packer(PackerCommand),
    /// List machines, their state, and how to reach them.
    #[command(name = "show")]
    Show,
    /// Run an adversary emulation against a machine.
    #[command(name = "simulate")]
    Simulate(SimulateCommand),
    /// Export search results to a dump file.
    #[command(name = "dump")]
    Dump(DumpCommand),
    /// Re-ingest a dump file.
    #[command(name = "replay")]
    Replay(ReplayCommand),
    /// Create a remote terraform state backend.
    #[command(name = "create_remote_backend")]
    CreateRemoteBackend(BackendCommand),
    /// Delete a remote terraform state backend.
    #[command(name = "delete_remote_backend")]
    DeleteRemoteBackend(BackendCommand),
    /// Bind terraform to a remote state backend.
    #[command(name = "init_remote_backend")]
    InitRemoteBackend(BackendCommand),
}

/// Arguments for `configure`.
#[derive(Debug, Args)]
pub(crate) struct ConfigureCommand {
    /// Provider the scaffold is written for.
    #[arg(long, value_name = "PROVIDER", default_value = "aws")]
    pub(crate) provider: String,
    /// Overwrite an existing configuration file.
    #[arg(long)]
    pub(crate) force: bool,
}

/// Arguments for `packer`.
#[derive(Debug, Args)]
pub(crate) struct PackerCommand {
    /// Image to build, for example `windows-2019-v3` (`-in`).
    #[arg(long = "image_name", visible_alias = "image-name", value_name = "IMAGE")]
    pub(crate) image_name: String,
}

/// Arguments for `simulate`.
#[derive(Debug, Args)]
pub(crate) struct SimulateCommand {
    /// Emulation engine: ART or PurpleSharp. Defaults to
    /// `general.simulation_engine`.
    #[arg(short = 'e', long = "engine", value_name = "ENGINE")]
    pub(crate) engine: Option<String>,
    /// Machine to run against.
    #[arg(short = 't', long = "target", value_name = "MACHINE")]
    pub(crate) target: String,
    /// Comma separated technique ids (`-te`).
    #[arg(long = "technique", value_name = "IDS", default_value = "")]
    pub(crate) technique: String,
    /// Engine playbook to run instead of individual techniques.
    #[arg(short = 'p', long = "playbook", value_name = "PATH")]
    pub(crate) playbook: Option<String>,
}

/// Arguments for `dump`.
#[derive(Debug, Args)]
pub(crate) struct DumpCommand {
    /// Destination dump file (`-fn`).
    #[arg(long = "file_name", visible_alias = "file-name", value_name = "PATH")]
    pub(crate) file_name: String,
    /// Search to export.
    #[arg(long, value_name = "QUERY")]
    pub(crate) search: String,
    /// Start of the time range, for example `-2h` or `2h`.
    #[arg(long, value_name = "TIME", allow_hyphen_values = true)]
    pub(crate) earliest: String,
    /// End of the time range.
    #[arg(long, value_name = "TIME", default_value = "now", allow_hyphen_values = true)]
    pub(crate) latest: String,
}

/// Arguments for `replay`.
#[derive(Debug, Args)]
pub(crate) struct ReplayCommand {
    /// Dump file to ingest (`-fn`).
    #[arg(long = "file_name", visible_alias = "file-name", value_name = "PATH")]
    pub(crate) file_name: String,
    /// Source stamped on the events.
    #[arg(long, value_name = "SOURCE")]
    pub(crate) source: String,
    /// Sourcetype stamped on the events.
    #[arg(long, value_name = "SOURCETYPE")]
    pub(crate) sourcetype: String,
    /// Destination index.
    #[arg(long, value_name = "INDEX", default_value = "test")]
    pub(crate) index: String,
}

/// Arguments shared by the remote backend commands.
#[derive(Debug, Args)]
pub(crate) struct BackendCommand {
    /// Backend name (`-bn`).
    #[arg(long = "backend_name", visible_alias = "backend-name", value_name = "NAME")]
    pub(crate) backend_name: String,
}
