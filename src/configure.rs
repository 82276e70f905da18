//! Writes a starter range configuration for a provider.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;

use crate::config::{Provider, SUBSCRIPTION_PLACEHOLDER};

/// Errors raised while writing a configuration scaffold.
#[derive(Debug, Error)]
pub enum ConfigureError {
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the destination exists and overwrite is disabled.
    #[error("{path} already exists; rerun with --force to replace it")]
    AlreadyConfigured {
        /// Existing configuration file.
        path: Utf8PathBuf,
    },
}

const GENERAL: &str = "\
# Attack range configuration.
general:
  # aws, azure, or local
  cloud_provider: {provider}
  # Namespaces every resource of this range: lowercase letters, digits, hyphens.
  attack_range_name: ar
  # Splunk admin password and default machine credential. Change it.
  attack_range_password: Pl3ase-k1Ll-me:p
  key_name: attack-range-key
  # ART or PurpleSharp
  simulation_engine: ART
";

const AWS: &str = "
aws:
  region: us-west-2
  private_key_path: ~/.ssh/attack-range-key.pem
";

const AZURE: &str = "
azure:
  # Replace with your subscription id.
  subscription_id: {subscription}
  region: West Europe
  private_key_path: ~/.ssh/id_rsa
  image_resource_group: ar-images
  state_resource_group: ar-tfstate
";

const LOCAL: &str = "
local:
  network_prefix: 192.168.56
  splunk_ip: 192.168.56.12
";

const FLEET: &str = "
splunk_server:
  image: splunk-v1
  install_es: false
  # HTTP Event Collector token used by replay.
  hec_token: 00000000-0000-0000-0000-000000000000

windows_servers:
  - hostname: ar-win-dc
    image: windows-2019-v3

linux_servers: []

kali_server:
  enabled: false
";

/// Renders the scaffold text for `provider`.
#[must_use]
pub fn render(provider: Provider) -> String {
    let section = match provider {
        Provider::Aws => AWS.to_owned(),
        Provider::Azure => AZURE.replace("{subscription}", SUBSCRIPTION_PLACEHOLDER),
        Provider::Local => LOCAL.to_owned(),
    };
    let mut text = GENERAL.replace("{provider}", provider.section_key());
    text.push_str(&section);
    text.push_str(FLEET);
    text
}

/// Writes the scaffold for `provider` to `dest`.
///
/// # Errors
///
/// Returns [`ConfigureError::AlreadyConfigured`] when `dest` exists and
/// `force` is false, and [`ConfigureError::Io`] when the file cannot be
/// written.
pub fn scaffold(
    dest: &Utf8Path,
    provider: Provider,
    force: bool,
) -> Result<Utf8PathBuf, ConfigureError> {
    let io_error = |path: &Utf8Path, err: &io::Error| ConfigureError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    };
    let parent = match dest.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    };
    let file_name = dest.file_name().ok_or_else(|| ConfigureError::Io {
        path: dest.to_path_buf(),
        message: String::from("configuration path is missing a file name"),
    })?;

    let dir =
        Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| io_error(parent, &err))?;
    let exists = dir
        .try_exists(file_name)
        .map_err(|err| io_error(dest, &err))?;
    if exists && !force {
        return Err(ConfigureError::AlreadyConfigured {
            path: dest.to_path_buf(),
        });
    }

    dir.write(file_name, render(provider))
        .map_err(|err| io_error(dest, &err))?;
    tracing::info!(path = %dest, %provider, "configuration written");
    Ok(dest.to_path_buf())
}
