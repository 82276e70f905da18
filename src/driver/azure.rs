//! Azure driver: terraform for the fleet, the Azure CLI for inventory and
//! power.

use std::ffi::OsString;

use serde::Deserialize;

use super::{DriverContext, DriverFuture, RangeDriver};
use crate::config::{AzureSettings, Provider};
use crate::error::RangeError;
use crate::inventory::{Inventory, Machine, MachineRole, MachineStatus};
use crate::packer;
use crate::remote_backend::{
    AzureStateLocation, AzureStateStore, BackendName, RemoteBackendManager,
};
use crate::runner::{CommandOutput, CommandRunner, args};
use crate::simulation::{Connection, SimulationRequest};
use crate::telemetry::{DumpRequest, ReplayRequest, SearchPlatform};

const MISSING_GROUP_MARKER: &str = "ResourceGroupNotFound";

/// Driver for ranges hosted on Azure.
#[derive(Debug)]
pub struct AzureDriver<R, S> {
    context: DriverContext<R, S>,
    settings: AzureSettings,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VirtualMachine {
    name: String,
    #[serde(default)]
    power_state: Option<String>,
    #[serde(default)]
    public_ips: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Image {
    name: String,
}

/// Resource group holding every resource of `range_id`.
#[must_use]
pub fn resource_group(range_id: &str) -> String {
    format!("ar-rg-{range_id}")
}

fn machine_status(power_state: Option<&str>) -> MachineStatus {
    match power_state {
        Some("VM running") => MachineStatus::Running,
        Some("VM deallocated" | "VM stopped") => MachineStatus::Stopped,
        Some(state @ ("VM starting" | "VM stopping" | "VM deallocating")) => {
            MachineStatus::Pending(state.to_owned())
        }
        Some(state) => MachineStatus::Other(state.to_owned()),
        None => MachineStatus::Other(String::from("unknown")),
    }
}

/// Converts `az vm list -d` output into an inventory.
///
/// # Errors
///
/// Returns [`RangeError::Query`] when the payload is not the expected JSON.
pub fn parse_vms(payload: &str) -> Result<Inventory, RangeError> {
    let vms: Vec<VirtualMachine> =
        serde_json::from_str(payload).map_err(|err| RangeError::Query {
            what: String::from("azure virtual machines"),
            message: err.to_string(),
        })?;
    let machines = vms
        .into_iter()
        .map(|vm| {
            let address = vm.public_ips.filter(|ip| !ip.trim().is_empty());
            Machine::new(
                vm.name.clone(),
                vm.name,
                machine_status(vm.power_state.as_deref()),
                address,
            )
        })
        .collect();
    Ok(Inventory::new(machines))
}

impl<R: CommandRunner, S: SearchPlatform> AzureDriver<R, S> {
    /// Binds the driver to its settings.
    #[must_use]
    pub const fn new(context: DriverContext<R, S>, settings: AzureSettings) -> Self {
        Self { context, settings }
    }

    fn az(&self, argv: &[OsString]) -> Result<CommandOutput, RangeError> {
        Ok(self
            .context
            .runner
            .run(&self.context.tools.az_bin, argv, self.context.tools.root())?)
    }

    fn resource_group(&self) -> String {
        resource_group(self.context.range_id())
    }

    fn inventory(&self) -> Result<Inventory, RangeError> {
        let group = self.resource_group();
        let output = self.az(&args([
            "vm",
            "list",
            "-d",
            "--resource-group",
            group.as_str(),
            "--subscription",
            self.settings.subscription_id.as_str(),
            "--output",
            "json",
        ]))?;
        if output.is_success() {
            return parse_vms(&output.stdout)
                .map(|inventory| inventory.with_fleet_roles(&self.context.config.fleet));
        }
        if output.stderr.contains(MISSING_GROUP_MARKER) {
            tracing::debug!(resource_group = %group, "resource group absent, range not built");
            return Ok(Inventory::default());
        }
        Err(RangeError::Query {
            what: String::from("azure virtual machines"),
            message: output.stderr.trim().to_owned(),
        })
    }

    fn image_available(&self, image: &str) -> Result<bool, RangeError> {
        let output = self.az(&args([
            "image",
            "list",
            "--resource-group",
            self.settings.image_resource_group.as_str(),
            "--subscription",
            self.settings.subscription_id.as_str(),
            "--output",
            "json",
        ]))?;
        let query_error = |message: String| RangeError::Query {
            what: format!("azure image {image}"),
            message,
        };
        if !output.is_success() {
            if output.stderr.contains(MISSING_GROUP_MARKER) {
                return Ok(false);
            }
            return Err(query_error(output.stderr.trim().to_owned()));
        }
        let images: Vec<Image> =
            serde_json::from_str(&output.stdout).map_err(|err| query_error(err.to_string()))?;
        Ok(images.iter().any(|candidate| candidate.name == image))
    }

    fn power(&self, machine: &Machine, action: &str) -> Result<CommandOutput, RangeError> {
        let group = self.resource_group();
        self.az(&args([
            "vm",
            action,
            "--resource-group",
            group.as_str(),
            "--name",
            machine.id.as_str(),
            "--subscription",
            self.settings.subscription_id.as_str(),
        ]))
    }

    fn connection(&self, role: MachineRole) -> Connection {
        let user = match role {
            MachineRole::Windows => "AzureAdmin",
            MachineRole::Kali => "kali",
            _ => "ubuntu",
        };
        Connection {
            user: user.to_owned(),
            password: Some(self.context.config.general.password.clone()),
            private_key: Some(self.settings.private_key_path.clone()),
        }
    }

    fn backend_manager(&self) -> RemoteBackendManager<'_, AzureStateStore<'_, R>, R> {
        let location = AzureStateLocation {
            subscription: self.settings.subscription_id.clone(),
            location: self.settings.region.clone(),
            resource_group: self.settings.state_resource_group.clone(),
        };
        let store = AzureStateStore::new(
            &self.context.runner,
            &self.context.tools.az_bin,
            location,
            self.context.tools.root().to_path_buf(),
        );
        RemoteBackendManager::new(store, self.context.terraform(Provider::Azure))
    }
}

impl<R: CommandRunner, S: SearchPlatform> RangeDriver for AzureDriver<R, S> {
    fn provider(&self) -> Provider {
        Provider::Azure
    }

    fn private_key_path(&self) -> Option<&str> {
        Some(&self.settings.private_key_path)
    }

    fn build(&self) -> DriverFuture<'_, Inventory> {
        Box::pin(async move {
            tracing::info!(
                action = "build",
                provider = "azure",
                range_id = self.context.range_id()
            );
            self.context.ensure_images(|image| self.image_available(image))?;
            self.context.converge(Provider::Azure)?;
            self.inventory()
        })
    }

    fn destroy(&self) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            tracing::info!(
                action = "destroy",
                provider = "azure",
                range_id = self.context.range_id()
            );
            let inventory = self.inventory()?;
            tracing::info!(machines = inventory.machines.len(), "destroying range resources");
            self.context.tear_down(Provider::Azure)
        })
    }

    fn stop(&self) -> DriverFuture<'_, Vec<String>> {
        Box::pin(async move {
            tracing::info!(action = "stop", provider = "azure", range_id = self.context.range_id());
            let inventory = self.inventory()?;
            self.context
                .change_power(&inventory, &MachineStatus::Stopped, |machine| {
                    self.power(machine, "deallocate")
                })
        })
    }

    fn resume(&self) -> DriverFuture<'_, Vec<String>> {
        Box::pin(async move {
            tracing::info!(
                action = "resume",
                provider = "azure",
                range_id = self.context.range_id()
            );
            let inventory = self.inventory()?;
            self.context
                .change_power(&inventory, &MachineStatus::Running, |machine| {
                    self.power(machine, "start")
                })
        })
    }

    fn show(&self) -> DriverFuture<'_, Inventory> {
        Box::pin(async move { self.inventory() })
    }

    fn packer<'a>(&'a self, image_name: &'a str) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            packer::build_image(
                &self.context.runner,
                &self.context.tools,
                &self.context.config,
                image_name,
            )
        })
    }

    fn simulate<'a>(&'a self, request: &'a SimulationRequest) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            let inventory = self.inventory()?;
            self.context
                .simulate(&inventory, request, |role| self.connection(role))
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

    fn create_remote_backend<'a>(&'a self, name: &'a BackendName) -> DriverFuture<'a, ()> {
        Box::pin(async move { self.backend_manager().create(name) })
    }

    fn delete_remote_backend<'a>(&'a self, name: &'a BackendName) -> DriverFuture<'a, ()> {
        Box::pin(async move { self.backend_manager().delete(name) })
    }

    fn init_remote_backend<'a>(&'a self, name: &'a BackendName) -> DriverFuture<'a, ()> {
        Box::pin(async move { self.backend_manager().init(name) })
    }
}
