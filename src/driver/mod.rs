//! Backend drivers.
//!
//! [`RangeDriver`] is the capability set every backend implements. The set
//! of backends is closed: [`Driver`] is a sum type with one variant per
//! [`Provider`], chosen once when the controller is constructed.

pub mod aws;
pub mod azure;
pub mod local;

use std::future::Future;
use std::pin::Pin;

use crate::config::{Provider, ProviderSettings, RangeConfig};
use crate::error::RangeError;
use crate::inventory::{Inventory, Machine, MachineRole, MachineStatus};
use crate::packer;
use crate::remote_backend::BackendName;
use crate::runner::{CommandOutput, CommandRunner};
use crate::simulation::{self, Connection, SimulationRequest};
use crate::telemetry::{self, DumpRequest, ReplayRequest, SearchPlatform, SplunkEndpoint};
use crate::terraform::{Phase, Terraform};
use crate::tools::ToolConfig;

pub use aws::AwsDriver;
pub use azure::AzureDriver;
pub use local::LocalDriver;

/// Future returned by driver operations.
pub type DriverFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RangeError>> + 'a>>;

/// Lifecycle operations every backend supports.
///
/// Operations that depend on what is provisioned query the backend afresh;
/// nothing is cached between calls.
pub trait RangeDriver {
    /// Provider this driver talks to.
    fn provider(&self) -> Provider;

    /// Private key operators use for SSH, when the provider has one.
    fn private_key_path(&self) -> Option<&str>;

    /// Provisions or converges every fleet resource and returns the
    /// resulting inventory.
    fn build(&self) -> DriverFuture<'_, Inventory>;

    /// Removes every resource of the range.
    fn destroy(&self) -> DriverFuture<'_, ()>;

    /// Suspends running machines, returning the names that changed.
    fn stop(&self) -> DriverFuture<'_, Vec<String>>;

    /// Restarts stopped machines, returning the names that changed.
    fn resume(&self) -> DriverFuture<'_, Vec<String>>;

    /// Lists machines and their state.
    fn show(&self) -> DriverFuture<'_, Inventory>;

    /// Builds a golden image.
    fn packer<'a>(&'a self, image_name: &'a str) -> DriverFuture<'a, ()>;

    /// Runs an emulation engine against a range machine.
    fn simulate<'a>(&'a self, request: &'a SimulationRequest) -> DriverFuture<'a, ()>;

    /// Exports search results to a dump file, returning the event count.
    fn dump<'a>(&'a self, request: &'a DumpRequest) -> DriverFuture<'a, usize>;

    /// Re-ingests a dump file, returning the event count.
    fn replay<'a>(&'a self, request: &'a ReplayRequest) -> DriverFuture<'a, usize>;

    /// Creates a remote state backend.
    fn create_remote_backend<'a>(&'a self, name: &'a BackendName) -> DriverFuture<'a, ()>;

    /// Deletes a remote state backend.
    fn delete_remote_backend<'a>(&'a self, name: &'a BackendName) -> DriverFuture<'a, ()>;

    /// Binds terraform to a remote state backend.
    fn init_remote_backend<'a>(&'a self, name: &'a BackendName) -> DriverFuture<'a, ()>;
}

/// The driver selected for one invocation.
#[derive(Debug)]
pub enum Driver<R, S> {
    /// AWS driver.
    Aws(AwsDriver<R, S>),
    /// Azure driver.
    Azure(AzureDriver<R, S>),
    /// Local Vagrant driver.
    Local(LocalDriver<R, S>),
}

impl<R: CommandRunner, S: SearchPlatform> Driver<R, S> {
    /// Selects the driver for the configured provider.
    ///
    /// Each driver receives only the settings of its own provider.
    #[must_use]
    pub fn select(context: DriverContext<R, S>) -> Self {
        match context.config.provider.clone() {
            ProviderSettings::Aws(settings) => Self::Aws(AwsDriver::new(context, settings)),
            ProviderSettings::Azure(settings) => Self::Azure(AzureDriver::new(context, settings)),
            ProviderSettings::Local(settings) => Self::Local(LocalDriver::new(context, settings)),
        }
    }

    fn inner(&self) -> &dyn RangeDriver {
        match self {
            Self::Aws(driver) => driver,
            Self::Azure(driver) => driver,
            Self::Local(driver) => driver,
        }
    }
}

impl<R: CommandRunner, S: SearchPlatform> RangeDriver for Driver<R, S> {
    fn provider(&self) -> Provider {
        self.inner().provider()
    }

    fn private_key_path(&self) -> Option<&str> {
        self.inner().private_key_path()
    }

    fn build(&self) -> DriverFuture<'_, Inventory> {
        self.inner().build()
    }

    fn destroy(&self) -> DriverFuture<'_, ()> {
        self.inner().destroy()
    }

    fn stop(&self) -> DriverFuture<'_, Vec<String>> {
        self.inner().stop()
    }

    fn resume(&self) -> DriverFuture<'_, Vec<String>> {
        self.inner().resume()
    }

    fn show(&self) -> DriverFuture<'_, Inventory> {
        self.inner().show()
    }

    fn packer<'a>(&'a self, image_name: &'a str) -> DriverFuture<'a, ()> {
        self.inner().packer(image_name)
    }

    fn simulate<'a>(&'a self, request: &'a SimulationRequest) -> DriverFuture<'a, ()> {
        self.inner().simulate(request)
    }

    fn dump<'a>(&'a self, request: &'a DumpRequest) -> DriverFuture<'a, usize> {
        self.inner().dump(request)
    }

    fn replay<'a>(&'a self, request: &'a ReplayRequest) -> DriverFuture<'a, usize> {
        self.inner().replay(request)
    }

    fn create_remote_backend<'a>(&'a self, name: &'a BackendName) -> DriverFuture<'a, ()> {
        self.inner().create_remote_backend(name)
    }

    fn delete_remote_backend<'a>(&'a self, name: &'a BackendName) -> DriverFuture<'a, ()> {
        self.inner().delete_remote_backend(name)
    }

    fn init_remote_backend<'a>(&'a self, name: &'a BackendName) -> DriverFuture<'a, ()> {
        self.inner().init_remote_backend(name)
    }
}

/// Everything a driver needs besides its provider settings.
#[derive(Debug)]
pub struct DriverContext<R, S> {
    /// Pruned range configuration.
    pub config: RangeConfig,
    /// External tool locations.
    pub tools: ToolConfig,
    /// Runner for external commands.
    pub runner: R,
    /// Search platform used by dump and replay.
    pub platform: S,
}

impl<R: CommandRunner, S: SearchPlatform> DriverContext<R, S> {
    /// Range identifier.
    #[must_use]
    pub fn range_id(&self) -> &str {
        self.config.range_id()
    }

    fn terraform(&self, provider: Provider) -> Terraform<'_, R> {
        let dir = self
            .tools
            .path(&format!("terraform/{}", provider.section_key()));
        Terraform::new(
            &self.runner,
            &self.tools.terraform_bin,
            dir,
            self.tools.terraform_parallelism,
        )
    }

    /// Builds every fleet image the provider does not have yet.
    fn ensure_images<F>(&self, available: F) -> Result<(), RangeError>
    where
        F: Fn(&str) -> Result<bool, RangeError>,
    {
        for image in self.config.fleet.images() {
            if available(&image)? {
                tracing::info!(%image, "golden image available");
                continue;
            }
            tracing::info!(%image, "golden image missing, building it with packer");
            packer::build_image(&self.runner, &self.tools, &self.config, &image)?;
        }
        Ok(())
    }

    /// Converges the range's terraform workspace.
    fn converge(&self, provider: Provider) -> Result<(), RangeError> {
        let terraform = self.terraform(provider);
        terraform.init(Phase::Provision)?;
        terraform.select_workspace(self.range_id(), Phase::Provision)?;
        terraform.write_vars(&self.config)?;
        terraform.apply()?;
        tracing::info!(range_id = self.range_id(), "attack range built");
        Ok(())
    }

    /// Destroys the range's terraform workspace and removes it.
    fn tear_down(&self, provider: Provider) -> Result<(), RangeError> {
        let terraform = self.terraform(provider);
        terraform.init(Phase::Teardown)?;
        terraform.select_workspace(self.range_id(), Phase::Teardown)?;
        terraform.write_vars(&self.config)?;
        terraform.destroy()?;
        terraform.delete_workspace(self.range_id())?;
        tracing::info!(range_id = self.range_id(), "attack range destroyed");
        Ok(())
    }

    /// Moves every machine not yet in `desired` state there.
    ///
    /// Machines already in the desired state are left alone; when all are,
    /// nothing is run. Every machine is attempted before failures are
    /// reported together.
    fn change_power<F>(
        &self,
        inventory: &Inventory,
        desired: &MachineStatus,
        act: F,
    ) -> Result<Vec<String>, RangeError>
    where
        F: Fn(&Machine) -> Result<CommandOutput, RangeError>,
    {
        let (phase, verb) = if *desired == MachineStatus::Stopped {
            (Phase::Teardown, "stop")
        } else {
            (Phase::Provision, "resume")
        };
        let targets = inventory
            .machines
            .iter()
            .filter(|machine| &machine.status != desired)
            .filter(|machine| machine.is_running() || machine.is_stopped())
            .collect::<Vec<_>>();
        if targets.is_empty() {
            tracing::warn!(
                action = verb,
                machines = inventory.machines.len(),
                "nothing to do, every machine is already in the requested state"
            );
            return Ok(Vec::new());
        }

        let mut changed = Vec::new();
        let mut failed = Vec::new();
        let mut messages = Vec::new();
        for machine in targets {
            match act(machine) {
                Ok(output) if output.is_success() => changed.push(machine.name.clone()),
                Ok(output) => {
                    failed.push(machine.name.clone());
                    messages.push(format!("{}: {}", machine.name, output.stderr.trim()));
                }
                Err(err) => {
                    failed.push(machine.name.clone());
                    messages.push(format!("{}: {err}", machine.name));
                }
            }
        }

        if failed.is_empty() {
            tracing::info!(action = verb, machines = ?changed, "power state changed");
            return Ok(changed);
        }
        Err(phase.failure(format!("{verb} machines"), messages.join("; "), failed))
    }

    fn splunk_endpoint(&self, inventory: &Inventory) -> Result<SplunkEndpoint, RangeError> {
        let splunk = inventory
            .first_with_role(MachineRole::Splunk)
            .ok_or_else(|| RangeError::TargetNotFound {
                target: String::from("splunk server"),
                known: inventory.names(),
            })?;
        let address = match (&splunk.status, &splunk.address) {
            (MachineStatus::Running, Some(address)) => address.clone(),
            (status, _) => {
                return Err(RangeError::TargetNotReady {
                    target: splunk.name.clone(),
                    reason: format!("splunk server is {status} or has no address"),
                });
            }
        };
        let server = &self.config.fleet.splunk_server;
        let mut endpoint = SplunkEndpoint::new(address, self.config.general.password.clone());
        endpoint.hec_token.clone_from(&server.hec_token);
        endpoint.verify_tls = server.verify_tls;
        Ok(endpoint)
    }

    async fn dump(
        &self,
        inventory: &Inventory,
        request: &DumpRequest,
    ) -> Result<usize, RangeError> {
        let endpoint = self.splunk_endpoint(inventory)?;
        telemetry::dump(&self.platform, &endpoint, request).await
    }

    async fn replay(
        &self,
        inventory: &Inventory,
        request: &ReplayRequest,
    ) -> Result<usize, RangeError> {
        let endpoint = self.splunk_endpoint(inventory)?;
        telemetry::replay(&self.platform, &endpoint, request).await
    }

    fn simulate<F>(
        &self,
        inventory: &Inventory,
        request: &SimulationRequest,
        connection_for: F,
    ) -> Result<(), RangeError>
    where
        F: Fn(MachineRole) -> Connection,
    {
        let machine = simulation::resolve_target(inventory, &request.target)?;
        let connection = connection_for(machine.role);
        simulation::run(&self.runner, &self.tools, request, machine, &connection)
    }
}

#[cfg(test)]
mod tests;
