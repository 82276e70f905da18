//! Local driver: a Vagrant project on the operator's machine.
//!
//! Machine names and addresses follow from the fleet description; Vagrant
//! only reports which of them exist and their power state.

use std::collections::BTreeMap;
use std::ffi::OsString;

use camino::Utf8PathBuf;
use cap_std::{ambient_authority, fs_utf8::Dir};

use super::{DriverContext, DriverFuture, RangeDriver};
use crate::config::{FleetSpec, LocalSettings, Provider};
use crate::error::RangeError;
use crate::inventory::{Inventory, Machine, MachineRole, MachineStatus};
use crate::remote_backend::BackendName;
use crate::runner::{CommandOutput, CommandRunner, args};
use crate::simulation::{Connection, SimulationRequest};
use crate::telemetry::{DumpRequest, ReplayRequest, SearchPlatform};
use crate::terraform::{Phase, engine_failure};

/// Manifest the Vagrantfile reads the fleet from.
pub const MANIFEST_FILE_NAME: &str = "range.json";

const VAGRANT_CREDENTIAL: &str = "vagrant";
const MANIFEST_STAGE: &str = "write vagrant manifest";

/// Driver for ranges running under Vagrant.
#[derive(Debug)]
pub struct LocalDriver<R, S> {
    context: DriverContext<R, S>,
    settings: LocalSettings,
}

/// Machine the fleet description expects, before Vagrant reports on it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PlannedMachine {
    /// Vagrant machine name.
    pub name: String,
    /// Host-only network address.
    pub address: String,
}

/// Names and addresses of every machine the fleet describes.
#[must_use]
pub fn planned_machines(
    settings: &LocalSettings,
    range_id: &str,
    fleet: &FleetSpec,
) -> Vec<PlannedMachine> {
    let prefix = &settings.network_prefix;
    let mut planned = vec![PlannedMachine {
        name: format!("ar-splunk-{range_id}"),
        address: settings.splunk_ip.clone(),
    }];
    planned.extend((0..fleet.windows_servers.len()).map(|index| PlannedMachine {
        name: format!("ar-win-{range_id}-{index}"),
        address: format!("{prefix}.{}", 14 + index),
    }));
    planned.extend((0..fleet.linux_servers.len()).map(|index| PlannedMachine {
        name: format!("ar-linux-{range_id}-{index}"),
        address: format!("{prefix}.{}", 21 + index),
    }));
    if fleet.kali_server.enabled {
        planned.push(PlannedMachine {
            name: format!("ar-kali-{range_id}"),
            address: format!("{prefix}.30"),
        });
    }
    planned
}

/// Extracts machine states from `vagrant status --machine-readable`.
///
/// Lines have the shape `timestamp,target,type,data`; only `state` lines
/// are kept.
#[must_use]
pub fn parse_status(output: &str) -> BTreeMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(4, ',');
            let _timestamp = parts.next()?;
            let target = parts.next()?;
            let kind = parts.next()?;
            let data = parts.next()?;
            (kind == "state" && !target.is_empty())
                .then(|| (target.to_owned(), data.trim().to_owned()))
        })
        .collect()
}

fn machine_status(state: &str) -> MachineStatus {
    match state {
        "running" => MachineStatus::Running,
        "poweroff" | "saved" => MachineStatus::Stopped,
        other => MachineStatus::Other(other.to_owned()),
    }
}

impl<R: CommandRunner, S: SearchPlatform> LocalDriver<R, S> {
    /// Binds the driver to its settings.
    #[must_use]
    pub const fn new(context: DriverContext<R, S>, settings: LocalSettings) -> Self {
        Self { context, settings }
    }

    fn project_dir(&self) -> Utf8PathBuf {
        self.context.tools.path("vagrant")
    }

    fn vagrant(&self, argv: &[OsString]) -> Result<CommandOutput, RangeError> {
        Ok(self
            .context
            .runner
            .run(&self.context.tools.vagrant_bin, argv, &self.project_dir())?)
    }

    fn inventory(&self) -> Result<Inventory, RangeError> {
        let output = self.vagrant(&args(["status", "--machine-readable"]))?;
        if !output.is_success() {
            return Err(RangeError::Query {
                what: String::from("vagrant machines"),
                message: output.stderr.trim().to_owned(),
            });
        }
        let states = parse_status(&output.stdout);
        let machines = planned_machines(
            &self.settings,
            self.context.range_id(),
            &self.context.config.fleet,
        )
        .into_iter()
        .filter_map(|planned| {
            let state = states.get(&planned.name)?;
            (state != "not_created").then(|| {
                Machine::new(
                    planned.name.clone(),
                    planned.name,
                    machine_status(state),
                    Some(planned.address),
                )
            })
        })
        .collect();
        Ok(Inventory::new(machines))
    }

    /// Points the Vagrantfile at this range's fleet.
    fn write_manifest(&self, phase: Phase) -> Result<(), RangeError> {
        let dir_path = self.project_dir();
        let manifest_error =
            |message: String| phase.failure(String::from(MANIFEST_STAGE), message, Vec::new());
        let document = self
            .context
            .config
            .to_document()
            .map_err(|err| manifest_error(err.to_string()))?;
        let mut manifest = serde_json::to_string_pretty(&document)
            .map_err(|err| manifest_error(err.to_string()))?;
        manifest.push('\n');
        let dir = Dir::open_ambient_dir(&dir_path, ambient_authority())
            .map_err(|err| manifest_error(format!("{dir_path}: {err}")))?;
        dir.write(MANIFEST_FILE_NAME, manifest).map_err(|err| {
            manifest_error(format!("{}: {err}", dir_path.join(MANIFEST_FILE_NAME)))
        })
    }

    fn machine_names(&self) -> Vec<String> {
        planned_machines(
            &self.settings,
            self.context.range_id(),
            &self.context.config.fleet,
        )
        .into_iter()
        .map(|planned| planned.name)
        .collect()
    }

    fn checked(&self, argv: &[OsString], phase: Phase, stage: &str) -> Result<(), RangeError> {
        let output = self.vagrant(argv)?;
        if output.is_success() {
            return Ok(());
        }
        Err(engine_failure(phase, stage, &output))
    }

    fn unsupported<T>(operation: &'static str) -> Result<T, RangeError> {
        Err(RangeError::Unsupported {
            operation,
            provider: Provider::Local,
        })
    }
}

impl<R: CommandRunner, S: SearchPlatform> RangeDriver for LocalDriver<R, S> {
    fn provider(&self) -> Provider {
        Provider::Local
    }

    fn private_key_path(&self) -> Option<&str> {
        None
    }

    fn build(&self) -> DriverFuture<'_, Inventory> {
        Box::pin(async move {
            tracing::info!(
                action = "build",
                provider = "local",
                range_id = self.context.range_id()
            );
            self.write_manifest(Phase::Provision)?;
            self.checked(&args(["up", "--provision"]), Phase::Provision, "vagrant up")?;
            tracing::info!(range_id = self.context.range_id(), "attack range built");
            self.inventory()
        })
    }

    fn destroy(&self) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            tracing::info!(
                action = "destroy",
                provider = "local",
                range_id = self.context.range_id()
            );
            self.write_manifest(Phase::Teardown)?;
            let mut argv = args(["destroy", "-f"]);
            argv.extend(self.machine_names().into_iter().map(OsString::from));
            self.checked(&argv, Phase::Teardown, "vagrant destroy")?;
            tracing::info!(range_id = self.context.range_id(), "attack range destroyed");
            Ok(())
        })
    }

    fn stop(&self) -> DriverFuture<'_, Vec<String>> {
        Box::pin(async move {
            tracing::info!(action = "stop", provider = "local", range_id = self.context.range_id());
            let inventory = self.inventory()?;
            self.context
                .change_power(&inventory, &MachineStatus::Stopped, |machine| {
                    self.vagrant(&args(["halt", machine.id.as_str()]))
                })
        })
    }

    fn resume(&self) -> DriverFuture<'_, Vec<String>> {
        Box::pin(async move {
            tracing::info!(
                action = "resume",
                provider = "local",
                range_id = self.context.range_id()
            );
            let inventory = self.inventory()?;
            self.context
                .change_power(&inventory, &MachineStatus::Running, |machine| {
                    self.vagrant(&args(["up", machine.id.as_str()]))
                })
        })
    }

    fn show(&self) -> DriverFuture<'_, Inventory> {
        Box::pin(async move { self.inventory() })
    }

    fn packer<'a>(&'a self, _image_name: &'a str) -> DriverFuture<'a, ()> {
        Box::pin(async move { Self::unsupported("packer") })
    }

    fn simulate<'a>(&'a self, request: &'a SimulationRequest) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            let inventory = self.inventory()?;
            self.context.simulate(&inventory, request, |_role: MachineRole| Connection {
                user: VAGRANT_CREDENTIAL.to_owned(),
                password: Some(VAGRANT_CREDENTIAL.to_owned()),
                private_key: None,
            })
        })
    }

    fn dump<'a>(&'a self, request: &'a DumpRequest) -> DriverFuture<'a, usize> {
        Box::pin(async move {
            request.query()?;
            let inventory = self.inventory()?;
            self.context.dump(&inventory, request).await
        })
    }

    fn replay<'a>(&'a self, request: &'a ReplayRequest) -> DriverFuture<'a, usize> {
        Box::pin(async move {
            let inventory = self.inventory()?;
            self.context.replay(&inventory, request).await
        })
    }

    fn create_remote_backend<'a>(&'a self, _name: &'a BackendName) -> DriverFuture<'a, ()> {
        Box::pin(async move { Self::unsupported("create_remote_backend") })
    }

    fn delete_remote_backend<'a>(&'a self, _name: &'a BackendName) -> DriverFuture<'a, ()> {
        Box::pin(async move { Self::unsupported("delete_remote_backend") })
    }

    fn init_remote_backend<'a>(&'a self, _name: &'a BackendName) -> DriverFuture<'a, ()> {
        Box::pin(async move { Self::unsupported("init_remote_backend") })
    }
}
