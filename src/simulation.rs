//! Adversary emulation against a range machine.
//!
//! Both engines are driven through `ansible-playbook`: Atomic Red Team runs
//! the requested technique tests and PurpleSharp runs either a technique
//! list or a JSON playbook on a Windows host.

use std::ffi::OsString;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs::OpenOptions;
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde_json::{Value, json};

use crate::config::SimulationEngine;
use crate::error::RangeError;
use crate::inventory::{Inventory, Machine, MachineRole};
use crate::runner::CommandRunner;
use crate::tools::ToolConfig;

const ART_PLAYBOOK: &str = "ansible/atomic_red_team.yml";
const PURPLESHARP_PLAYBOOK: &str = "ansible/purplesharp.yml";
const SECRET_VARS_PREFIX: &str = "attack-range-vars";

/// Validated arguments of `simulate`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SimulationRequest {
    /// Engine to run.
    pub engine: SimulationEngine,
    /// Name of the machine to run against.
    pub target: String,
    /// Technique identifiers, empty for the engine's default behaviour.
    pub techniques: Vec<String>,
    /// Optional engine playbook.
    pub playbook: Option<Utf8PathBuf>,
}

impl SimulationRequest {
    /// Parses raw operator input without contacting anything.
    ///
    /// `technique` is a comma separated list and may be empty; so may
    /// `playbook`.
    ///
    /// # Errors
    ///
    /// Returns [`RangeError::InvalidArgument`] for an unknown engine, an
    /// empty target, or a malformed technique identifier.
    pub fn parse(
        engine: &str,
        target: &str,
        technique: &str,
        playbook: Option<&str>,
    ) -> Result<Self, RangeError> {
        let parsed_engine: SimulationEngine =
            engine.parse().map_err(RangeError::InvalidArgument)?;
        let target_name = target.trim();
        if target_name.is_empty() {
            return Err(RangeError::InvalidArgument(String::from(
                "--target must name a range machine",
            )));
        }

        let techniques = technique
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(|id| {
                if is_technique_id(id) {
                    Ok(id.to_owned())
                } else {
                    Err(RangeError::InvalidArgument(format!(
                        "'{id}' is not a MITRE ATT&CK technique id such as T1003 or T1003.001"
                    )))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        let playbook_path = playbook
            .map(str::trim)
            .filter(|path| !path.is_empty())
            .map(Utf8PathBuf::from);

        Ok(Self {
            engine: parsed_engine,
            target: target_name.to_owned(),
            techniques,
            playbook: playbook_path,
        })
    }
}

fn is_technique_id(id: &str) -> bool {
    let Some(rest) = id.strip_prefix('T') else {
        return false;
    };
    let (base, sub) = rest.split_once('.').unwrap_or((rest, ""));
    let all_digits = |part: &str| part.chars().all(|ch| ch.is_ascii_digit());
    base.len() == 4
        && all_digits(base)
        && ((sub.is_empty() && !rest.contains('.')) || (sub.len() == 3 && all_digits(sub)))
}

/// Credentials used to reach a target.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Connection {
    /// Remote user.
    pub user: String,
    /// Password for WinRM connections.
    pub password: Option<String>,
    /// SSH private key for Linux connections.
    pub private_key: Option<String>,
}

/// Looks up the simulation target in a freshly queried inventory.
///
/// # Errors
///
/// Returns [`RangeError::TargetNotFound`] when no machine has that name and
/// [`RangeError::TargetNotReady`] when it is not running or has no address.
pub fn resolve_target<'a>(
    inventory: &'a Inventory,
    target: &str,
) -> Result<&'a Machine, RangeError> {
    let machine = inventory
        .find(target)
        .ok_or_else(|| RangeError::TargetNotFound {
            target: target.to_owned(),
            known: inventory.names(),
        })?;
    if !machine.is_running() {
        return Err(RangeError::TargetNotReady {
            target: target.to_owned(),
            reason: format!("machine is {}", machine.status),
        });
    }
    if machine.address.is_none() {
        return Err(RangeError::TargetNotReady {
            target: target.to_owned(),
            reason: String::from("machine has no reachable address"),
        });
    }
    Ok(machine)
}

/// Builds the `ansible-playbook` argument list.
///
/// # Errors
///
/// Returns [`RangeError::InvalidArgument`] when PurpleSharp targets a
/// non-Windows machine, and [`RangeError::TargetNotReady`] when the machine
/// has no address.
pub fn playbook_args(
    request: &SimulationRequest,
    machine: &Machine,
    connection: &Connection,
) -> Result<Vec<OsString>, RangeError> {
    let address = machine
        .address
        .as_deref()
        .ok_or_else(|| RangeError::TargetNotReady {
            target: machine.name.clone(),
            reason: String::from("machine has no reachable address"),
        })?;
    let windows = machine.role == MachineRole::Windows;

    let (playbook, mut vars) = match request.engine {
        SimulationEngine::Art => {
            if request.playbook.is_some() {
                tracing::warn!("Atomic Red Team ignores --playbook");
            }
            (
                ART_PLAYBOOK,
                json!({ "techniques": request.techniques }),
            )
        }
        SimulationEngine::PurpleSharp => {
            if !windows {
                return Err(RangeError::InvalidArgument(format!(
                    "PurpleSharp only runs against Windows machines, '{}' is not one",
                    machine.name
                )));
            }
            (
                PURPLESHARP_PLAYBOOK,
                json!({
                    "techniques": request.techniques.join(","),
                    "playbook": request.playbook.as_ref().map(|p| p.as_str()),
                }),
            )
        }
    };

    if windows {
        vars["ansible_connection"] = json!("winrm");
        vars["ansible_port"] = json!(5985);
        vars["ansible_winrm_server_cert_validation"] = json!("ignore");
    }

    let mut argv = vec![
        OsString::from("-i"),
        OsString::from(format!("{address},")),
        OsString::from("-u"),
        OsString::from(&connection.user),
    ];
    if !windows && let Some(key) = &connection.private_key {
        argv.push(OsString::from("--private-key"));
        argv.push(OsString::from(key));
    }
    argv.push(OsString::from(playbook));
    argv.push(OsString::from("-e"));
    argv.push(OsString::from(vars.to_string()));
    Ok(argv)
}

/// Connection secrets for `machine`, kept off the command line.
///
/// Windows machines and machines reached without a private key log in with
/// the password.
#[must_use]
pub fn secret_vars(machine: &Machine, connection: &Connection) -> Option<Value> {
    let uses_password =
        machine.role == MachineRole::Windows || connection.private_key.is_none();
    connection
        .password
        .as_ref()
        .filter(|_| uses_password)
        .map(|password| json!({ "ansible_password": password }))
}

/// Extra variables file readable only by the operator, removed on drop.
#[derive(Debug)]
struct SecretVarsFile {
    dir: Dir,
    name: String,
    path: Utf8PathBuf,
}

impl SecretVarsFile {
    fn create(dir_path: &Utf8Path, vars: &Value, target: &str) -> Result<Self, RangeError> {
        let simulation_error = |message: String| RangeError::Simulation {
            target: target.to_owned(),
            message: format!("cannot write connection variables: {message}"),
        };
        let dir = Dir::open_ambient_dir(dir_path, ambient_authority())
            .map_err(|err| simulation_error(format!("{dir_path}: {err}")))?;
        let name = format!(
            ".{SECRET_VARS_PREFIX}-{}.json",
            uuid::Uuid::new_v4().simple()
        );
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use cap_std::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let file = dir
            .open_with(&name, &options)
            .map_err(|err| simulation_error(err.to_string()))?;
        let written = serde_json::to_writer(file, vars);
        let path = dir_path.join(&name);
        let secrets = Self { dir, name, path };
        written.map_err(|err| simulation_error(err.to_string()))?;
        Ok(secrets)
    }

    fn argument(&self) -> OsString {
        OsString::from(format!("@{}", self.path))
    }
}

impl Drop for SecretVarsFile {
    fn drop(&mut self) {
        if let Err(err) = self.dir.remove_file(&self.name) {
            tracing::warn!(
                path = %self.path,
                error = %err,
                "could not remove connection variables"
            );
        }
    }
}

fn secrets_dir() -> Result<Utf8PathBuf, RangeError> {
    Utf8PathBuf::from_path_buf(std::env::temp_dir()).map_err(|path| {
        RangeError::InvalidArgument(format!(
            "temporary directory {} is not valid UTF-8",
            path.display()
        ))
    })
}

/// Runs the engine against `machine` from the project root.
///
/// Passwords travel in a private extra variables file that is removed once
/// the playbook finishes, so they never appear in the command line or logs.
///
/// # Errors
///
/// Returns [`RangeError::Simulation`] when the playbook fails.
pub fn run<R: CommandRunner>(
    runner: &R,
    tools: &ToolConfig,
    request: &SimulationRequest,
    machine: &Machine,
    connection: &Connection,
) -> Result<(), RangeError> {
    let mut argv = playbook_args(request, machine, connection)?;
    let secrets = secret_vars(machine, connection)
        .map(|vars| {
            secrets_dir().and_then(|dir| SecretVarsFile::create(&dir, &vars, &machine.name))
        })
        .transpose()?;
    if let Some(file) = &secrets {
        argv.push(OsString::from("-e"));
        argv.push(file.argument());
    }
    tracing::info!(
        engine = %request.engine,
        target = %machine.name,
        techniques = %request.techniques.join(","),
        "running simulation"
    );
    let output = runner.run(&tools.ansible_playbook_bin, &argv, tools.root())?;
    if output.is_success() {
        return Ok(());
    }
    let stderr = output.stderr.trim();
    Err(RangeError::Simulation {
        target: machine.name.clone(),
        message: if stderr.is_empty() {
            format!("ansible-playbook exited with status {}", output.status_text())
        } else {
            stderr.to_owned()
        },
    })
}
