//! Binary entry point for the attack range controller.

use std::ffi::OsString;
use std::io::{self, Write};
use std::process;

use camino::Utf8PathBuf;
use clap::Parser;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use attack_range::config::{self, Provider, RangeConfig};
use attack_range::configure::{self, ConfigureError};
use attack_range::controller::RangeController;
use attack_range::error::RangeError;
use attack_range::remote_backend::BackendName;
use attack_range::runner::{CommandRunner, ProcessCommandRunner, StreamingCommandRunner};
use attack_range::simulation::SimulationRequest;
use attack_range::telemetry::{DumpRequest, ReplayRequest, SearchPlatform, SplunkClient};
use attack_range::tools::ToolConfig;

mod cli;

use cli::{BackendCommand, Cli, Command};

/// Multi-letter single-dash flags paired with the long flag clap parses.
const LEGACY_FLAGS: [(&str, &str); 4] = [
    ("-in", "--image_name"),
    ("-te", "--technique"),
    ("-fn", "--file_name"),
    ("-bn", "--backend_name"),
];

/// Flags whose next argument is a value, never a flag.
const VALUE_FLAGS: [&str; 16] = [
    "-c",
    "--config",
    "-e",
    "--engine",
    "-t",
    "--target",
    "-p",
    "--playbook",
    "--search",
    "--earliest",
    "--latest",
    "--source",
    "--sourcetype",
    "--index",
    "--technique",
    "--provider",
];

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Configure(#[from] ConfigureError),
    #[error(transparent)]
    Range(#[from] RangeError),
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

/// A command with its arguments already validated.
#[derive(Debug)]
enum Operation {
    Build,
    Destroy,
    Stop,
    Resume,
    Show,
    Packer(String),
    Simulate(SimulationRequest),
    Dump(DumpRequest),
    Replay(ReplayRequest),
    CreateRemoteBackend(BackendName),
    DeleteRemoteBackend(BackendName),
    InitRemoteBackend(BackendName),
}

impl Operation {
    fn parse(command: Command, config: &RangeConfig) -> Result<Self, RangeError> {
        let backend = |args: &BackendCommand| BackendName::parse(&args.backend_name);
        Ok(match command {
            Command::Configure(_) => {
                return Err(RangeError::InvalidArgument(String::from(
                    "configure does not operate on a range",
                )));
            }
            Command::Build => Self::Build,
            Command::Destroy => Self::Destroy,
            Command::Stop => Self::Stop,
            Command::Resume => Self::Resume,
            Command::Show => Self::Show,
            Command::Packer(args) => {
                attack_range::packer::template_for(&args.image_name)?;
                Self::Packer(args.image_name)
            }
            Command::Simulate(args) => {
                let engine = args
                    .engine
                    .unwrap_or_else(|| config.general.simulation_engine.to_string());
                Self::Simulate(SimulationRequest::parse(
                    &engine,
                    &args.target,
                    &args.technique,
                    args.playbook.as_deref(),
                )?)
            }
            Command::Dump(args) => Self::Dump(DumpRequest {
                file_name: Utf8PathBuf::from(args.file_name),
                search: args.search,
                earliest: args.earliest,
                latest: args.latest,
            }),
            Command::Replay(args) => Self::Replay(ReplayRequest {
                file_name: Utf8PathBuf::from(args.file_name),
                index: args.index,
                sourcetype: args.sourcetype,
                source: args.source,
            }),
            Command::CreateRemoteBackend(args) => Self::CreateRemoteBackend(backend(&args)?),
            Command::DeleteRemoteBackend(args) => Self::DeleteRemoteBackend(backend(&args)?),
            Command::InitRemoteBackend(args) => Self::InitRemoteBackend(backend(&args)?),
        })
    }

    /// Long running operations forward engine output as it arrives.
    const fn streams_output(&self) -> bool {
        matches!(
            self,
            Self::Build | Self::Destroy | Self::Packer(_) | Self::Simulate(_)
        )
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse_from(normalize_args(std::env::args_os()));
    init_tracing(cli.verbose);
    let mut stdout = io::stdout();
    let exit_code = match dispatch(cli, &mut stdout).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

/// Rewrites legacy multi-letter single-dash flags to their long form.
///
/// An argument following a value-taking flag is a value and is never
/// rewritten.
fn normalize_args<I>(raw: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    let mut expects_value = false;
    raw.into_iter()
        .map(|arg| {
            let text = arg.to_str();
            let rewritten = text
                .filter(|_| !expects_value)
                .and_then(|flag| LEGACY_FLAGS.iter().find(|(legacy, _)| *legacy == flag))
                .map(|(_, long)| OsString::from(*long));
            expects_value =
                rewritten.is_some() || text.is_some_and(|flag| VALUE_FLAGS.contains(&flag));
            rewritten.unwrap_or(arg)
        })
        .collect()
}

async fn dispatch<W: Write>(cli: Cli, out: &mut W) -> Result<(), CliError> {
    let config_path = Utf8PathBuf::from(cli.config);
    if let Command::Configure(args) = &cli.command {
        let provider: Provider = args.provider.parse().map_err(RangeError::from)?;
        let path = configure::scaffold(&config_path, provider, args.force)?;
        writeln!(out, "configuration written to {path}")?;
        return Ok(());
    }

    let range_config = config::load(&config_path).map_err(RangeError::from)?;
    let operation = Operation::parse(cli.command, &range_config)?;
    let tools = ToolConfig::load_without_cli_args().map_err(RangeError::from)?;
    if operation.streams_output() {
        let controller =
            RangeController::new(range_config, tools, StreamingCommandRunner, SplunkClient);
        execute(&controller, operation, out).await
    } else {
        let controller =
            RangeController::new(range_config, tools, ProcessCommandRunner, SplunkClient);
        execute(&controller, operation, out).await
    }
}

async fn execute<R, S, W>(
    controller: &RangeController<R, S>,
    operation: Operation,
    out: &mut W,
) -> Result<(), CliError>
where
    R: CommandRunner,
    S: SearchPlatform,
    W: Write,
{
    let range_id = controller.config().range_id().to_owned();
    match operation {
        Operation::Build => {
            let inventory = controller.build().await?;
            write!(out, "{}", controller.render(&inventory))?;
        }
        Operation::Destroy => {
            controller.destroy().await?;
            writeln!(out, "attack range {range_id} destroyed")?;
        }
        Operation::Stop => {
            let changed = controller.stop().await?;
            write_power_change(out, "stopped", &changed)?;
        }
        Operation::Resume => {
            let changed = controller.resume().await?;
            write_power_change(out, "resumed", &changed)?;
        }
        Operation::Show => {
            let inventory = controller.show().await?;
            write!(out, "{}", controller.render(&inventory))?;
        }
        Operation::Packer(image_name) => {
            controller.packer(&image_name).await?;
            writeln!(out, "golden image {image_name} built")?;
        }
        Operation::Simulate(request) => {
            controller.simulate(&request).await?;
            writeln!(
                out,
                "{} simulation against {} finished",
                request.engine, request.target
            )?;
        }
        Operation::Dump(request) => {
            let count = controller.dump(&request).await?;
            writeln!(out, "dumped {count} events to {}", request.file_name)?;
        }
        Operation::Replay(request) => {
            let count = controller.replay(&request).await?;
            writeln!(
                out,
                "replayed {count} events from {} into index {}",
                request.file_name,
                request.index.trim()
            )?;
        }
        Operation::CreateRemoteBackend(name) => {
            controller.create_remote_backend(&name).await?;
            writeln!(out, "remote backend {name} created")?;
        }
        Operation::DeleteRemoteBackend(name) => {
            controller.delete_remote_backend(&name).await?;
            writeln!(out, "remote backend {name} deleted")?;
        }
        Operation::InitRemoteBackend(name) => {
            controller.init_remote_backend(&name).await?;
            writeln!(out, "terraform now keeps state in remote backend {name}")?;
        }
    }
    Ok(())
}

fn write_power_change(out: &mut impl Write, verb: &str, changed: &[String]) -> io::Result<()> {
    if changed.is_empty() {
        return writeln!(out, "no machines needed to be {verb}");
    }
    writeln!(out, "{verb}: {}", changed.join(", "))
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "error: {err}").ok();
}
