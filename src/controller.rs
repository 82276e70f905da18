//! Provider agnostic entry point for every range operation.
//!
//! The controller picks its driver once, from the pruned configuration, and
//! forwards each operation to it. Callers never see which provider they are
//! talking to except through [`RangeController::provider`].

use crate::config::{Provider, RangeConfig};
use crate::driver::{Driver, DriverContext, RangeDriver};
use crate::error::RangeError;
use crate::inventory::Inventory;
use crate::remote_backend::BackendName;
use crate::runner::CommandRunner;
use crate::simulation::SimulationRequest;
use crate::telemetry::{DumpRequest, ReplayRequest, SearchPlatform};
use crate::tools::ToolConfig;

/// Lifecycle controller bound to one range configuration.
#[derive(Debug)]
pub struct RangeController<R, S> {
    config: RangeConfig,
    driver: Driver<R, S>,
}

impl<R: CommandRunner, S: SearchPlatform> RangeController<R, S> {
    /// Selects the driver for `config.general.cloud_provider`.
    #[must_use]
    pub fn new(config: RangeConfig, tools: ToolConfig, runner: R, platform: S) -> Self {
        let driver = Driver::select(DriverContext {
            config: config.clone(),
            tools,
            runner,
            platform,
        });
        Self { config, driver }
    }

    /// Provider the controller was bound to.
    #[must_use]
    pub fn provider(&self) -> Provider {
        self.driver.provider()
    }

    /// Configuration the controller runs with.
    #[must_use]
    pub const fn config(&self) -> &RangeConfig {
        &self.config
    }

    /// Renders an inventory with provider specific access hints.
    #[must_use]
    pub fn render(&self, inventory: &Inventory) -> String {
        inventory.render(&self.config, self.driver.private_key_path())
    }

    /// Provisions or converges the range.
    ///
    /// # Errors
    ///
    /// Returns [`RangeError::Provision`] or [`RangeError::LockConflict`]
    /// when the provisioning engine fails.
    pub async fn build(&self) -> Result<Inventory, RangeError> {
        self.driver.build().await
    }

    /// Removes every resource of the range.
    ///
    /// # Errors
    ///
    /// Returns [`RangeError::Teardown`] or [`RangeError::LockConflict`]
    /// when the provisioning engine fails.
    pub async fn destroy(&self) -> Result<(), RangeError> {
        self.driver.destroy().await
    }

    /// Suspends running machines.
    ///
    /// # Errors
    ///
    /// Returns [`RangeError::Teardown`] naming every machine that could not
    /// be stopped.
    pub async fn stop(&self) -> Result<Vec<String>, RangeError> {
        self.driver.stop().await
    }

    /// Restarts stopped machines.
    ///
    /// # Errors
    ///
    /// Returns [`RangeError::Provision`] naming every machine that could
    /// not be started.
    pub async fn resume(&self) -> Result<Vec<String>, RangeError> {
        self.driver.resume().await
    }

    /// Lists the machines of the range.
    ///
    /// # Errors
    ///
    /// Returns [`RangeError::Query`] when the provider cannot be queried.
    pub async fn show(&self) -> Result<Inventory, RangeError> {
        self.driver.show().await
    }

    /// Builds a golden image.
    ///
    /// # Errors
    ///
    /// Returns [`RangeError::InvalidArgument`] for unknown images and
    /// [`RangeError::Provision`] when the build fails.
    pub async fn packer(&self, image_name: &str) -> Result<(), RangeError> {
        self.driver.packer(image_name).await
    }

    /// Runs an emulation engine against a range machine.
    ///
    /// # Errors
    ///
    /// Returns [`RangeError::TargetNotFound`] or
    /// [`RangeError::TargetNotReady`] when the target cannot be used, and
    /// [`RangeError::Simulation`] when the engine fails.
    pub async fn simulate(&self, request: &SimulationRequest) -> Result<(), RangeError> {
        self.driver.simulate(request).await
    }

    /// Exports search results to a dump file.
    ///
    /// # Errors
    ///
    /// Returns [`RangeError::Search`] or [`RangeError::Export`].
    pub async fn dump(&self, request: &DumpRequest) -> Result<usize, RangeError> {
        self.driver.dump(request).await
    }

    /// Re-ingests a dump file.
    ///
    /// # Errors
    ///
    /// Returns [`RangeError::Format`] or [`RangeError::Ingest`].
    pub async fn replay(&self, request: &ReplayRequest) -> Result<usize, RangeError> {
        self.driver.replay(request).await
    }

    /// Creates a remote state backend.
    ///
    /// # Errors
    ///
    /// Returns [`RangeError::AlreadyExists`] when the store exists.
    pub async fn create_remote_backend(&self, name: &BackendName) -> Result<(), RangeError> {
        self.driver.create_remote_backend(name).await
    }

    /// Deletes a remote state backend.
    ///
    /// # Errors
    ///
    /// Returns [`RangeError::NotFound`] when the store does not exist.
    pub async fn delete_remote_backend(&self, name: &BackendName) -> Result<(), RangeError> {
        self.driver.delete_remote_backend(name).await
    }

    /// Binds terraform to a remote state backend.
    ///
    /// # Errors
    ///
    /// Returns [`RangeError::NotFound`] when the store does not exist.
    pub async fn init_remote_backend(&self, name: &BackendName) -> Result<(), RangeError> {
        self.driver.init_remote_backend(name).await
    }
}
