//! Range configuration loading and provider section pruning.
//!
//! A range file may carry settings for every provider at once so operators
//! can switch `general.cloud_provider` without rewriting the file. Loading
//! narrows that document to a [`RangeConfig`] whose provider settings are a
//! sum type: the sections of providers that were not selected are dropped
//! before any driver is constructed.

use std::fmt;
use std::io;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use thiserror::Error;

/// Default path of the range configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "attack_range.yml";

/// Placeholder written by the configuration scaffold for Azure subscriptions.
pub const SUBSCRIPTION_PLACEHOLDER: &str = "xxx";

const GENERAL_SECTION: &str = "general";
const MAX_RANGE_ID_LEN: usize = 32;

/// Errors raised while loading or validating a range configuration.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Raised when the configuration file cannot be read.
    #[error("failed to read {path}: {message}")]
    Io {
        /// Path that could not be read.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the file is not valid YAML or not a mapping.
    #[error("failed to parse configuration: {0}")]
    Parse(String),
    /// Raised when a required key is absent.
    #[error("missing configuration key: {0}")]
    MissingField(String),
    /// Raised when `general.cloud_provider` is not a supported backend.
    #[error("unknown cloud_provider '{0}': expected one of aws, azure, local")]
    UnknownProvider(String),
    /// Raised when the section of the selected provider is missing.
    #[error("cloud_provider is '{0}' but the [{0}] section is missing")]
    MissingSection(String),
    /// Raised when a value is present but unusable.
    #[error("invalid value for {key}: {message}")]
    Invalid {
        /// Dotted key of the offending value.
        key: String,
        /// Human-readable explanation.
        message: String,
    },
}

/// Infrastructure backend a range is provisioned on.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Amazon Web Services.
    Aws,
    /// Microsoft Azure.
    Azure,
    /// Local virtualisation through Vagrant.
    Local,
}

impl Provider {
    /// Every supported provider, in selection-table order.
    pub const ALL: [Self; 3] = [Self::Aws, Self::Azure, Self::Local];

    /// Name of the configuration section holding this provider's settings.
    #[must_use]
    pub const fn section_key(self) -> &'static str {
        match self {
            Self::Aws => "aws",
            Self::Azure => "azure",
            Self::Local => "local",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.section_key())
    }
}

impl FromStr for Provider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|provider| provider.section_key() == value.trim())
            .ok_or_else(|| ConfigError::UnknownProvider(value.trim().to_owned()))
    }
}

/// Adversary emulation engine used by `simulate`.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum SimulationEngine {
    /// Atomic Red Team.
    #[default]
    #[serde(rename = "ART")]
    Art,
    /// PurpleSharp.
    #[serde(rename = "PurpleSharp")]
    PurpleSharp,
}

impl SimulationEngine {
    /// Canonical engine name as accepted on the command line.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Art => "ART",
            Self::PurpleSharp => "PurpleSharp",
        }
    }
}

impl fmt::Display for SimulationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SimulationEngine {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        [Self::Art, Self::PurpleSharp]
            .into_iter()
            .find(|engine| engine.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| {
                format!("unknown simulation engine '{value}': expected ART or PurpleSharp")
            })
    }
}

/// Provider independent settings from the `general` section.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct GeneralSettings {
    /// Selected backend.
    pub cloud_provider: Provider,
    /// Stable identifier used to namespace every provisioned resource.
    #[serde(rename = "attack_range_name")]
    pub range_id: String,
    /// Splunk admin password and default credential for range machines.
    #[serde(rename = "attack_range_password")]
    pub password: String,
    /// Optional SSH key pair name registered with the provider.
    pub key_name: Option<String>,
    /// Engine used by `simulate` when none is given explicitly.
    pub simulation_engine: SimulationEngine,
}

/// Settings for the AWS driver.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct AwsSettings {
    /// Region hosting the range (for example `us-west-2`).
    pub region: String,
    /// Private key used for SSH access to Linux machines.
    pub private_key_path: String,
    /// EC2 key pair name; falls back to `general.key_name`.
    #[serde(default)]
    pub key_name: Option<String>,
}

/// Settings for the Azure driver.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct AzureSettings {
    /// Subscription that owns every range resource.
    pub subscription_id: String,
    /// Azure location (for example `West Europe`).
    pub region: String,
    /// Private key used for SSH access to Linux machines.
    pub private_key_path: String,
    /// Resource group holding golden images.
    #[serde(default = "default_image_resource_group")]
    pub image_resource_group: String,
    /// Resource group holding remote state storage accounts.
    #[serde(default = "default_state_resource_group")]
    pub state_resource_group: String,
}

fn default_image_resource_group() -> String {
    String::from("ar-images")
}

fn default_state_resource_group() -> String {
    String::from("ar-tfstate")
}

/// Settings for the local Vagrant driver.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct LocalSettings {
    /// Host-only network prefix used to address machines.
    #[serde(default = "default_network_prefix")]
    pub network_prefix: String,
    /// Address of the Splunk server on the host-only network.
    #[serde(default = "default_splunk_ip")]
    pub splunk_ip: String,
}

impl Default for LocalSettings {
    fn default() -> Self {
        Self {
            network_prefix: default_network_prefix(),
            splunk_ip: default_splunk_ip(),
        }
    }
}

fn default_network_prefix() -> String {
    String::from("192.168.56")
}

fn default_splunk_ip() -> String {
    String::from("192.168.56.12")
}

/// Settings of the one provider selected by `general.cloud_provider`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProviderSettings {
    /// AWS settings.
    Aws(AwsSettings),
    /// Azure settings.
    Azure(AzureSettings),
    /// Local settings.
    Local(LocalSettings),
}

impl ProviderSettings {
    /// Provider these settings belong to.
    #[must_use]
    pub const fn provider(&self) -> Provider {
        match self {
            Self::Aws(_) => Provider::Aws,
            Self::Azure(_) => Provider::Azure,
            Self::Local(_) => Provider::Local,
        }
    }

    fn to_value(&self) -> Result<Value, ConfigError> {
        match self {
            Self::Aws(settings) => encode(settings),
            Self::Azure(settings) => encode(settings),
            Self::Local(settings) => encode(settings),
        }
    }
}

/// The Splunk server every range carries.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SplunkServer {
    /// Golden image used for the server.
    #[serde(default = "default_splunk_image")]
    pub image: String,
    /// Whether Enterprise Security is installed (switches the web UI to TLS).
    #[serde(default)]
    pub install_es: bool,
    /// HTTP Event Collector token used by `replay`.
    #[serde(default)]
    pub hec_token: Option<String>,
    /// Whether TLS certificates presented by Splunk are verified.
    #[serde(default)]
    pub verify_tls: bool,
}

impl Default for SplunkServer {
    fn default() -> Self {
        Self {
            image: default_splunk_image(),
            install_es: false,
            hec_token: None,
            verify_tls: false,
        }
    }
}

fn default_splunk_image() -> String {
    String::from("splunk-v1")
}

/// A Windows or Linux victim machine.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ServerSpec {
    /// Host name inside the range.
    pub hostname: String,
    /// Golden image used for the machine.
    pub image: String,
}

/// Optional Kali attacker machine.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct KaliServer {
    /// Whether the machine is part of the fleet.
    #[serde(default)]
    pub enabled: bool,
}

/// Machines making up the range.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct FleetSpec {
    /// Splunk server settings.
    #[serde(default)]
    pub splunk_server: SplunkServer,
    /// Windows victims.
    #[serde(default)]
    pub windows_servers: Vec<ServerSpec>,
    /// Linux victims.
    #[serde(default)]
    pub linux_servers: Vec<ServerSpec>,
    /// Kali attacker.
    #[serde(default)]
    pub kali_server: KaliServer,
}

impl FleetSpec {
    /// Every distinct golden image the fleet boots from, in fleet order.
    #[must_use]
    pub fn images(&self) -> Vec<String> {
        let mut images: Vec<String> = Vec::new();
        let all = std::iter::once(&self.splunk_server.image)
            .chain(self.windows_servers.iter().map(|server| &server.image))
            .chain(self.linux_servers.iter().map(|server| &server.image));
        for image in all {
            if !images.contains(image) {
                images.push(image.clone());
            }
        }
        images
    }
}

/// Validated configuration narrowed to the selected provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RangeConfig {
    /// Provider independent settings.
    pub general: GeneralSettings,
    /// Settings of the selected provider only.
    pub provider: ProviderSettings,
    /// Fleet description.
    pub fleet: FleetSpec,
}

impl RangeConfig {
    /// Selected backend.
    #[must_use]
    pub const fn cloud_provider(&self) -> Provider {
        self.general.cloud_provider
    }

    /// Identifier namespacing every resource of this range.
    #[must_use]
    pub fn range_id(&self) -> &str {
        &self.general.range_id
    }

    /// Serialises the pruned view handed to external engines.
    ///
    /// The document carries `general`, the selected provider section, and
    /// the fleet sections. Sections of other providers are never present.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when a section cannot be encoded.
    pub fn to_document(&self) -> Result<Value, ConfigError> {
        let mut document = Mapping::new();
        document.insert(Value::from(GENERAL_SECTION), encode(&self.general)?);
        document.insert(
            Value::from(self.cloud_provider().section_key()),
            self.provider.to_value()?,
        );
        if let Value::Mapping(fleet) = encode(&self.fleet)? {
            for (key, value) in fleet {
                document.insert(key, value);
            }
        }
        Ok(Value::Mapping(document))
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Value, ConfigError> {
    serde_yaml::to_value(value).map_err(|err| ConfigError::Parse(err.to_string()))
}

/// Unvalidated configuration document as read from disk.
#[derive(Clone, Debug, PartialEq)]
pub struct RawConfig {
    root: Mapping,
}

impl RawConfig {
    /// Parses YAML text into a raw document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the text is not a YAML mapping.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let value: Value =
            serde_yaml::from_str(text).map_err(|err| ConfigError::Parse(err.to_string()))?;
        match value {
            Value::Mapping(root) => Ok(Self { root }),
            Value::Null => Ok(Self {
                root: Mapping::new(),
            }),
            _ => Err(ConfigError::Parse(String::from(
                "configuration root must be a mapping",
            ))),
        }
    }

    /// Returns the names of the top-level sections present.
    #[must_use]
    pub fn section_keys(&self) -> Vec<String> {
        self.root
            .keys()
            .filter_map(|key| key.as_str().map(str::to_owned))
            .collect()
    }

    fn section(&self, key: &str) -> Option<&Value> {
        self.root.get(key)
    }

    fn general(&self) -> Result<&Mapping, ConfigError> {
        self.section(GENERAL_SECTION)
            .ok_or_else(|| ConfigError::MissingField(String::from(GENERAL_SECTION)))?
            .as_mapping()
            .ok_or_else(|| ConfigError::Invalid {
                key: String::from(GENERAL_SECTION),
                message: String::from("must be a mapping"),
            })
    }
}

/// Reads, parses, and prunes the configuration file at `path`.
///
/// # Errors
///
/// Returns [`ConfigError`] when the file is missing, unparsable, lacks a
/// required key, names an unknown provider, or omits the selected
/// provider's section.
pub fn load(path: &Utf8Path) -> Result<RangeConfig, ConfigError> {
    let text = read_file(path)?;
    let raw = RawConfig::from_yaml(&text)?;
    let config = prune(&raw)?;
    tracing::debug!(
        %path,
        provider = %config.cloud_provider(),
        range_id = config.range_id(),
        "configuration loaded"
    );
    Ok(config)
}

/// Narrows a raw document to the provider it selects.
///
/// The result never contains settings of a provider other than
/// `general.cloud_provider`, even when the raw document defines all three.
///
/// # Errors
///
/// Returns [`ConfigError`] when required keys are missing or invalid.
pub fn prune(raw: &RawConfig) -> Result<RangeConfig, ConfigError> {
    let general = parse_general(raw.general()?)?;
    let provider = general.cloud_provider;
    let section = raw
        .section(provider.section_key())
        .ok_or_else(|| ConfigError::MissingSection(provider.section_key().to_owned()))?;

    let settings = match provider {
        Provider::Aws => ProviderSettings::Aws(decode_section(section, "aws")?),
        Provider::Azure => {
            let azure: AzureSettings = decode_section(section, "azure")?;
            validate_azure(&azure)?;
            ProviderSettings::Azure(azure)
        }
        Provider::Local => {
            if section.is_null() {
                ProviderSettings::Local(LocalSettings::default())
            } else {
                ProviderSettings::Local(decode_section(section, "local")?)
            }
        }
    };

    Ok(RangeConfig {
        general,
        provider: settings,
        fleet: parse_fleet(raw)?,
    })
}

fn parse_general(general: &Mapping) -> Result<GeneralSettings, ConfigError> {
    let cloud_provider: Provider = required_str(general, "cloud_provider")?.parse()?;
    let range_id = required_str(general, "attack_range_name")?.trim().to_owned();
    validate_range_id(&range_id)?;
    let password = required_str(general, "attack_range_password")?.to_owned();
    let key_name = optional_str(general, "key_name")?.map(str::to_owned);
    let simulation_engine = match optional_str(general, "simulation_engine")? {
        Some(name) => name.parse().map_err(|message| ConfigError::Invalid {
            key: String::from("general.simulation_engine"),
            message,
        })?,
        None => SimulationEngine::default(),
    };

    Ok(GeneralSettings {
        cloud_provider,
        range_id,
        password,
        key_name,
        simulation_engine,
    })
}

fn parse_fleet(raw: &RawConfig) -> Result<FleetSpec, ConfigError> {
    let mut fleet = Mapping::new();
    for key in [
        "splunk_server",
        "windows_servers",
        "linux_servers",
        "kali_server",
    ] {
        if let Some(value) = raw.section(key) {
            fleet.insert(Value::from(key), value.clone());
        }
    }
    decode_section(&Value::Mapping(fleet), "fleet")
}

fn decode_section<T: DeserializeOwned>(value: &Value, section: &str) -> Result<T, ConfigError> {
    serde_yaml::from_value(value.clone()).map_err(|err| {
        let message = err.to_string();
        match missing_field_name(&message) {
            Some(field) => ConfigError::MissingField(format!("{section}.{field}")),
            None => ConfigError::Invalid {
                key: section.to_owned(),
                message,
            },
        }
    })
}

fn missing_field_name(message: &str) -> Option<&str> {
    let rest = message.strip_prefix("missing field `")?;
    rest.split('`').next()
}

fn required_str<'a>(section: &'a Mapping, key: &str) -> Result<&'a str, ConfigError> {
    optional_str(section, key)?
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingField(format!("{GENERAL_SECTION}.{key}")))
}

fn optional_str<'a>(section: &'a Mapping, key: &str) -> Result<Option<&'a str>, ConfigError> {
    match section.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => Ok(Some(text.as_str())),
        Some(_) => Err(ConfigError::Invalid {
            key: format!("{GENERAL_SECTION}.{key}"),
            message: String::from("must be a string"),
        }),
    }
}

fn validate_range_id(range_id: &str) -> Result<(), ConfigError> {
    let valid_chars = range_id
        .chars()
        .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-');
    if range_id.len() > MAX_RANGE_ID_LEN || !valid_chars || range_id.starts_with('-') {
        return Err(ConfigError::Invalid {
            key: String::from("general.attack_range_name"),
            message: format!(
                "'{range_id}' must be 1-{MAX_RANGE_ID_LEN} lowercase letters, digits, or hyphens"
            ),
        });
    }
    Ok(())
}

fn validate_azure(azure: &AzureSettings) -> Result<(), ConfigError> {
    let subscription = azure.subscription_id.trim();
    if subscription.is_empty() || subscription == SUBSCRIPTION_PLACEHOLDER {
        return Err(ConfigError::Invalid {
            key: String::from("azure.subscription_id"),
            message: String::from("replace the placeholder with your Azure subscription id"),
        });
    }
    Ok(())
}

fn read_file(path: &Utf8Path) -> Result<String, ConfigError> {
    let io_error = |target: &Utf8Path, err: &io::Error| ConfigError::Io {
        path: target.to_path_buf(),
        message: err.to_string(),
    };
    let parent = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    };
    let file_name = path.file_name().ok_or_else(|| ConfigError::Io {
        path: path.to_path_buf(),
        message: String::from("configuration path is missing a file name"),
    })?;
    let dir =
        Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| io_error(path, &err))?;
    dir.read_to_string(file_name)
        .map_err(|err| io_error(path, &err))
}
