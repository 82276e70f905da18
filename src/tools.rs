//! Locations of the external engines the controller drives.
//!
//! Values merge defaults, `attack-range.toml`, and `ATTACK_RANGE_*`
//! environment variables via `ortho-config`, the same way every other
//! layered setting in this crate is loaded.

use std::ffi::OsString;

use camino::{Utf8Path, Utf8PathBuf};
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Default parallelism passed to `terraform apply` and `terraform destroy`.
pub const DEFAULT_TERRAFORM_PARALLELISM: u32 = 15;

/// Tool settings loaded via `ortho-config`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "ATTACK_RANGE",
    discovery(
        app_name = "attack-range",
        env_var = "ATTACK_RANGE_TOOLS_PATH",
        config_file_name = "attack-range.toml",
        dotfile_name = ".attack-range.toml",
        project_file_name = "attack-range.toml"
    )
)]
pub struct ToolConfig {
    /// Path to the `terraform` executable.
    #[ortho_config(default = "terraform".to_owned())]
    pub terraform_bin: String,
    /// Path to the `packer` executable.
    #[ortho_config(default = "packer".to_owned())]
    pub packer_bin: String,
    /// Path to the `ansible-playbook` executable.
    #[ortho_config(default = "ansible-playbook".to_owned())]
    pub ansible_playbook_bin: String,
    /// Path to the AWS CLI.
    #[ortho_config(default = "aws".to_owned())]
    pub aws_bin: String,
    /// Path to the Azure CLI.
    #[ortho_config(default = "az".to_owned())]
    pub az_bin: String,
    /// Path to the `vagrant` executable.
    #[ortho_config(default = "vagrant".to_owned())]
    pub vagrant_bin: String,
    /// Directory holding the `terraform/`, `packer/`, `ansible/`, and
    /// `vagrant/` trees.
    #[ortho_config(default = ".".to_owned())]
    pub project_root: String,
    /// Maximum concurrent resource operations terraform may run.
    #[ortho_config(default = 15)]
    pub terraform_parallelism: u32,
}

/// Errors raised when loading or validating tool settings.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ToolConfigError {
    /// Indicates that parsing or merging configuration layers failed.
    #[error("tool configuration parsing failed: {0}")]
    Parse(String),
    /// Raised when a required value is blank.
    #[error("invalid tool configuration: {field} must not be empty")]
    InvalidConfig {
        /// Field that failed validation.
        field: String,
    },
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            terraform_bin: String::from("terraform"),
            packer_bin: String::from("packer"),
            ansible_playbook_bin: String::from("ansible-playbook"),
            aws_bin: String::from("aws"),
            az_bin: String::from("az"),
            vagrant_bin: String::from("vagrant"),
            project_root: String::from("."),
            terraform_parallelism: DEFAULT_TERRAFORM_PARALLELISM,
        }
    }
}

impl ToolConfig {
    /// Loads tool settings without parsing CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ToolConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ToolConfigError> {
        let config = Self::load_from_iter([OsString::from("attack-range")])
            .map_err(|err| ToolConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Ensures every path is present after trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`ToolConfigError::InvalidConfig`] naming the first blank
    /// field.
    pub fn validate(&self) -> Result<(), ToolConfigError> {
        Self::require_value(&self.terraform_bin, "terraform_bin")?;
        Self::require_value(&self.packer_bin, "packer_bin")?;
        Self::require_value(&self.ansible_playbook_bin, "ansible_playbook_bin")?;
        Self::require_value(&self.aws_bin, "aws_bin")?;
        Self::require_value(&self.az_bin, "az_bin")?;
        Self::require_value(&self.vagrant_bin, "vagrant_bin")?;
        Self::require_value(&self.project_root, "project_root")?;
        if self.terraform_parallelism == 0 {
            return Err(ToolConfigError::InvalidConfig {
                field: String::from("terraform_parallelism"),
            });
        }
        Ok(())
    }

    /// Project root as a path.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        Utf8Path::new(&self.project_root)
    }

    /// Joins a path relative to the project root.
    #[must_use]
    pub fn path(&self, relative: &str) -> Utf8PathBuf {
        self.root().join(relative)
    }

    fn require_value(value: &str, field: &str) -> Result<(), ToolConfigError> {
        if value.trim().is_empty() {
            return Err(ToolConfigError::InvalidConfig {
                field: field.to_owned(),
            });
        }
        Ok(())
    }
}
