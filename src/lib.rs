//! Core library for the attack range lifecycle controller.
//!
//! A range is a small fleet (Splunk server, Windows and Linux victims, an
//! optional Kali attacker) provisioned on AWS, Azure, or locally through
//! Vagrant. [`RangeController`] exposes one uniform set of operations and
//! forwards each to the driver selected by the configuration; telemetry can
//! be dumped from a range and replayed into another.

pub mod config;
pub mod configure;
pub mod controller;
pub mod driver;
pub mod error;
pub mod inventory;
pub mod packer;
pub mod remote_backend;
pub mod runner;
pub mod simulation;
pub mod telemetry;
pub mod terraform;
pub mod test_support;
pub mod tools;

pub use config::{ConfigError, Provider, RangeConfig};
pub use controller::RangeController;
pub use driver::{Driver, RangeDriver};
pub use error::RangeError;
pub use inventory::{Inventory, Machine, MachineRole, MachineStatus};
pub use runner::{CommandOutput, CommandRunner, ProcessCommandRunner, StreamingCommandRunner};
pub use telemetry::{DumpEvent, DumpRequest, ReplayRequest, SearchPlatform, SplunkClient};
pub use tools::ToolConfig;
