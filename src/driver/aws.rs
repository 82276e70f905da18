//! AWS driver: terraform for the fleet, the AWS CLI for inventory and power.

use std::ffi::OsString;

use serde::Deserialize;

use super::{DriverContext, DriverFuture, RangeDriver};
use crate::config::{AwsSettings, Provider};
use crate::error::RangeError;
use crate::inventory::{Inventory, Machine, MachineRole, MachineStatus};
use crate::packer;
use crate::remote_backend::{AwsStateStore, BackendName, RemoteBackendManager};
use crate::runner::{CommandOutput, CommandRunner, args};
use crate::simulation::{Connection, SimulationRequest};
use crate::telemetry::{DumpRequest, ReplayRequest, SearchPlatform};

/// Tag every range resource carries with the range id as its value.
pub const RANGE_TAG: &str = "attack_range_name";

/// Driver for ranges hosted on AWS.
#[derive(Debug)]
pub struct AwsDriver<R, S> {
    context: DriverContext<R, S>,
    settings: AwsSettings,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstances {
    #[serde(default)]
    reservations: Vec<Reservation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    #[serde(default)]
    instances: Vec<Instance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Instance {
    instance_id: String,
    state: InstanceState,
    #[serde(default)]
    public_ip_address: Option<String>,
    #[serde(default)]
    tags: Vec<Tag>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceState {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Tag {
    key: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeImages {
    #[serde(default)]
    images: Vec<serde_json::Value>,
}

fn machine_status(state: &str) -> MachineStatus {
    match state {
        "running" => MachineStatus::Running,
        "stopped" => MachineStatus::Stopped,
        "pending" | "stopping" => MachineStatus::Pending(state.to_owned()),
        other => MachineStatus::Other(other.to_owned()),
    }
}

/// Converts `aws ec2 describe-instances` output into an inventory.
///
/// # Errors
///
/// Returns [`RangeError::Query`] when the payload is not the expected JSON.
pub fn parse_instances(payload: &str) -> Result<Inventory, RangeError> {
    let parsed: DescribeInstances =
        serde_json::from_str(payload).map_err(|err| RangeError::Query {
            what: String::from("aws instances"),
            message: err.to_string(),
        })?;
    let machines = parsed
        .reservations
        .into_iter()
        .flat_map(|reservation| reservation.instances)
        .map(|instance| {
            let name = instance
                .tags
                .iter()
                .find(|tag| tag.key == "Name")
                .map_or_else(|| instance.instance_id.clone(), |tag| tag.value.clone());
            Machine::new(
                instance.instance_id,
                name,
                machine_status(&instance.state.name),
                instance.public_ip_address,
            )
        })
        .collect();
    Ok(Inventory::new(machines))
}

impl<R: CommandRunner, S: SearchPlatform> AwsDriver<R, S> {
    /// Binds the driver to its settings.
    #[must_use]
    pub const fn new(context: DriverContext<R, S>, settings: AwsSettings) -> Self {
        Self { context, settings }
    }

    fn aws(&self, argv: &[OsString]) -> Result<CommandOutput, RangeError> {
        Ok(self
            .context
            .runner
            .run(&self.context.tools.aws_bin, argv, self.context.tools.root())?)
    }

    fn inventory(&self) -> Result<Inventory, RangeError> {
        let argv = args([
            String::from("ec2"),
            String::from("describe-instances"),
            String::from("--region"),
            self.settings.region.clone(),
            String::from("--filters"),
            format!("Name=tag:{RANGE_TAG},Values={}", self.context.range_id()),
            String::from("Name=instance-state-name,Values=pending,running,stopping,stopped"),
            String::from("--output"),
            String::from("json"),
        ]);
        let output = self.aws(&argv)?;
        if !output.is_success() {
            return Err(RangeError::Query {
                what: String::from("aws instances"),
                message: output.stderr.trim().to_owned(),
            });
        }
        parse_instances(&output.stdout)
            .map(|inventory| inventory.with_fleet_roles(&self.context.config.fleet))
    }

    fn image_available(&self, image: &str) -> Result<bool, RangeError> {
        let argv = args([
            String::from("ec2"),
            String::from("describe-images"),
            String::from("--owners"),
            String::from("self"),
            String::from("--filters"),
            format!("Name=name,Values={image}"),
            String::from("--region"),
            self.settings.region.clone(),
            String::from("--output"),
            String::from("json"),
        ]);
        let output = self.aws(&argv)?;
        let query_error = |message: String| RangeError::Query {
            what: format!("aws image {image}"),
            message,
        };
        if !output.is_success() {
            return Err(query_error(output.stderr.trim().to_owned()));
        }
        let parsed: DescribeImages =
            serde_json::from_str(&output.stdout).map_err(|err| query_error(err.to_string()))?;
        Ok(!parsed.images.is_empty())
    }

    fn power(&self, machine: &Machine, action: &str) -> Result<CommandOutput, RangeError> {
        self.aws(&args([
            "ec2",
            action,
            "--instance-ids",
            machine.id.as_str(),
            "--region",
            self.settings.region.as_str(),
        ]))
    }

    fn connection(&self, role: MachineRole) -> Connection {
        let user = match role {
            MachineRole::Windows => "Administrator",
            MachineRole::Kali => "kali",
            MachineRole::Phantom => "centos",
            _ => "ubuntu",
        };
        Connection {
            user: user.to_owned(),
            password: Some(self.context.config.general.password.clone()),
            private_key: Some(self.settings.private_key_path.clone()),
        }
    }

    fn backend_manager(&self) -> RemoteBackendManager<'_, AwsStateStore<'_, R>, R> {
        let store = AwsStateStore::new(
            &self.context.runner,
            &self.context.tools.aws_bin,
            self.settings.region.clone(),
            self.context.tools.root().to_path_buf(),
        );
        RemoteBackendManager::new(store, self.context.terraform(Provider::Aws))
    }
}

impl<R: CommandRunner, S: SearchPlatform> RangeDriver for AwsDriver<R, S> {
    fn provider(&self) -> Provider {
        Provider::Aws
    }

    fn private_key_path(&self) -> Option<&str> {
        Some(&self.settings.private_key_path)
    }

    fn build(&self) -> DriverFuture<'_, Inventory> {
        Box::pin(async move {
            tracing::info!(action = "build", provider = "aws", range_id = self.context.range_id());
            self.context.ensure_images(|image| self.image_available(image))?;
            self.context.converge(Provider::Aws)?;
            self.inventory()
        })
    }

    fn destroy(&self) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            tracing::info!(
                action = "destroy",
                provider = "aws",
                range_id = self.context.range_id()
            );
            let inventory = self.inventory()?;
            tracing::info!(machines = inventory.machines.len(), "destroying range resources");
            self.context.tear_down(Provider::Aws)
        })
    }

    fn stop(&self) -> DriverFuture<'_, Vec<String>> {
        Box::pin(async move {
            tracing::info!(action = "stop", provider = "aws", range_id = self.context.range_id());
            let inventory = self.inventory()?;
            self.context
                .change_power(&inventory, &MachineStatus::Stopped, |machine| {
                    self.power(machine, "stop-instances")
                })
        })
    }

    fn resume(&self) -> DriverFuture<'_, Vec<String>> {
        Box::pin(async move {
            tracing::info!(action = "resume", provider = "aws", range_id = self.context.range_id());
            let inventory = self.inventory()?;
            self.context
                .change_power(&inventory, &MachineStatus::Running, |machine| {
                    self.power(machine, "start-instances")
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
