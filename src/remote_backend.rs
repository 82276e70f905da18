//! Remote terraform state stores.
//!
//! A remote backend is a named, durable store the provisioning engine keeps
//! its state in. [`RemoteBackendManager`] checks existence before acting so
//! that creating a store twice or deleting one that is absent is reported
//! instead of silently ignored.

use std::ffi::OsString;
use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::RangeError;
use crate::runner::{CommandOutput, CommandRunner, args};
use crate::terraform::{Phase, Terraform, engine_failure};

const AWS_STATE_KEY: &str = "attack_range/terraform.tfstate";
const AZURE_STATE_KEY: &str = "attack_range.tfstate";
const AZURE_CONTAINER: &str = "tfstate";
/// Most keys `s3api delete-objects` accepts in one request.
const DELETE_BATCH_SIZE: usize = 1000;

/// Validated remote backend name.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct BackendName(String);

impl BackendName {
    /// Validates a name usable as a bucket, table, or storage account.
    ///
    /// # Errors
    ///
    /// Returns [`RangeError::InvalidArgument`] unless the name is 3 to 63
    /// lowercase letters, digits, or inner hyphens.
    pub fn parse(raw: &str) -> Result<Self, RangeError> {
        let name = raw.trim();
        let valid = (3..=63).contains(&name.len())
            && name
                .chars()
                .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-')
            && !name.starts_with('-')
            && !name.ends_with('-');
        if !valid {
            return Err(RangeError::InvalidArgument(format!(
                "backend name '{raw}' must be 3-63 lowercase letters, digits, or inner hyphens"
            )));
        }
        Ok(Self(name.to_owned()))
    }

    /// The name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Provider specific storage behind a remote backend.
pub trait StateStore {
    /// Terraform backend type written into the backend block.
    fn backend_type(&self) -> &'static str;

    /// Applies provider specific naming rules.
    ///
    /// # Errors
    ///
    /// Returns [`RangeError::InvalidArgument`] when the provider cannot use
    /// the name.
    fn check_name(&self, _name: &BackendName) -> Result<(), RangeError> {
        Ok(())
    }

    /// Reports whether the store exists.
    ///
    /// # Errors
    ///
    /// Returns [`RangeError::Query`] when existence cannot be determined.
    fn exists(&self, name: &BackendName) -> Result<bool, RangeError>;

    /// Creates the store.
    ///
    /// # Errors
    ///
    /// Returns [`RangeError::Provision`] when a creation step fails.
    fn provision(&self, name: &BackendName) -> Result<(), RangeError>;

    /// Deletes the store and everything in it.
    ///
    /// # Errors
    ///
    /// Returns [`RangeError::Teardown`] when a deletion step fails.
    fn remove(&self, name: &BackendName) -> Result<(), RangeError>;

    /// `-backend-config` pairs binding terraform to the store.
    fn backend_config(&self, name: &BackendName) -> Vec<(&'static str, String)>;
}

/// Create, init, and delete with existence guardrails.
#[derive(Debug)]
pub struct RemoteBackendManager<'a, S: StateStore, R: CommandRunner> {
    store: S,
    terraform: Terraform<'a, R>,
}

impl<'a, S: StateStore, R: CommandRunner> RemoteBackendManager<'a, S, R> {
    /// Pairs a store with the terraform directory that uses it.
    #[must_use]
    pub const fn new(store: S, terraform: Terraform<'a, R>) -> Self {
        Self { store, terraform }
    }

    /// Creates the store.
    ///
    /// # Errors
    ///
    /// Returns [`RangeError::AlreadyExists`] when a store of that name is
    /// already provisioned.
    pub fn create(&self, name: &BackendName) -> Result<(), RangeError> {
        self.store.check_name(name)?;
        if self.store.exists(name)? {
            return Err(RangeError::AlreadyExists {
                name: name.to_string(),
            });
        }
        self.store.provision(name)?;
        tracing::info!(backend = %name, "remote backend created");
        Ok(())
    }

    /// Binds terraform to the store. Repeating the call re-applies the same
    /// binding.
    ///
    /// # Errors
    ///
    /// Returns [`RangeError::NotFound`] when the store does not exist.
    pub fn init(&self, name: &BackendName) -> Result<(), RangeError> {
        self.store.check_name(name)?;
        if !self.store.exists(name)? {
            return Err(RangeError::NotFound {
                name: name.to_string(),
            });
        }
        self.terraform
            .write_backend_block(self.store.backend_type())?;
        self.terraform
            .init_backend(&self.store.backend_config(name))?;
        tracing::info!(backend = %name, dir = %self.terraform.dir(), "remote backend initialised");
        Ok(())
    }

    /// Deletes the store and returns terraform to local state.
    ///
    /// # Errors
    ///
    /// Returns [`RangeError::NotFound`] when the store does not exist.
    pub fn delete(&self, name: &BackendName) -> Result<(), RangeError> {
        self.store.check_name(name)?;
        if !self.store.exists(name)? {
            return Err(RangeError::NotFound {
                name: name.to_string(),
            });
        }
        self.store.remove(name)?;
        self.terraform.remove_backend_block()?;
        self.terraform.init_backend(&[])?;
        tracing::info!(backend = %name, "remote backend deleted");
        Ok(())
    }
}

fn query_error(name: &BackendName, output: &CommandOutput) -> RangeError {
    RangeError::Query {
        what: format!("remote backend {name}"),
        message: output.stderr.trim().to_owned(),
    }
}

fn checked<R: CommandRunner>(
    runner: &R,
    bin: &str,
    argv: &[OsString],
    dir: &Utf8Path,
    phase: Phase,
    stage: &str,
) -> Result<(), RangeError> {
    let output = runner.run(bin, argv, dir)?;
    if output.is_success() {
        Ok(())
    } else {
        Err(engine_failure(phase, stage, &output))
    }
}

/// S3 bucket with versioning plus a DynamoDB lock table of the same name.
#[derive(Debug)]
pub struct AwsStateStore<'a, R: CommandRunner> {
    runner: &'a R,
    bin: &'a str,
    region: String,
    dir: Utf8PathBuf,
}

impl<'a, R: CommandRunner> AwsStateStore<'a, R> {
    /// Store in `region`, running the AWS CLI from `dir`.
    #[must_use]
    pub const fn new(runner: &'a R, bin: &'a str, region: String, dir: Utf8PathBuf) -> Self {
        Self {
            runner,
            bin,
            region,
            dir,
        }
    }

    fn step(&self, argv: &[OsString], phase: Phase, stage: &str) -> Result<(), RangeError> {
        checked(self.runner, self.bin, argv, &self.dir, phase, stage)
    }

    fn bucket_exists(&self, name: &BackendName) -> Result<bool, RangeError> {
        let argv = args([
            "s3api",
            "head-bucket",
            "--bucket",
            name.as_str(),
            "--region",
            self.region.as_str(),
        ]);
        let output = self.runner.run(self.bin, &argv, &self.dir)?;
        if output.is_success() {
            return Ok(true);
        }
        if output.stderr.contains("404") || output.stderr.contains("Not Found") {
            return Ok(false);
        }
        Err(query_error(name, &output))
    }

    fn table_exists(&self, name: &BackendName) -> Result<bool, RangeError> {
        let argv = args([
            "dynamodb",
            "describe-table",
            "--table-name",
            name.as_str(),
            "--region",
            self.region.as_str(),
        ]);
        let output = self.runner.run(self.bin, &argv, &self.dir)?;
        if output.is_success() {
            return Ok(true);
        }
        if output.stderr.contains("ResourceNotFoundException") {
            return Ok(false);
        }
        Err(query_error(name, &output))
    }

    fn empty_bucket(&self, name: &BackendName) -> Result<(), RangeError> {
        let stage = "aws s3api list-object-versions";
        let output = self.runner.run(
            self.bin,
            &args([
                "s3api",
                "list-object-versions",
                "--bucket",
                name.as_str(),
                "--output",
                "json",
                "--region",
                self.region.as_str(),
            ]),
            &self.dir,
        )?;
        if !output.is_success() {
            return Err(engine_failure(Phase::Teardown, stage, &output));
        }
        let versions = parse_object_versions(&output.stdout).map_err(|err| {
            Phase::Teardown.failure(
                stage.to_owned(),
                format!("cannot parse object versions: {err}"),
                Vec::new(),
            )
        })?;
        for batch in versions.chunks(DELETE_BATCH_SIZE) {
            let delete = json!({ "Objects": batch, "Quiet": true });
            self.step(
                &args([
                    String::from("s3api"),
                    String::from("delete-objects"),
                    String::from("--bucket"),
                    name.to_string(),
                    String::from("--delete"),
                    delete.to_string(),
                    String::from("--region"),
                    self.region.clone(),
                ]),
                Phase::Teardown,
                "aws s3api delete-objects",
            )?;
        }
        tracing::debug!(backend = %name, versions = versions.len(), "state bucket emptied");
        Ok(())
    }
}

/// Key and version of one stored object or delete marker.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ObjectVersion {
    /// Object key.
    pub key: String,
    /// Version identifier.
    pub version_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ObjectVersionListing {
    versions: Option<Vec<ObjectVersion>>,
    delete_markers: Option<Vec<ObjectVersion>>,
}

/// Extracts every object version and delete marker from
/// `s3api list-object-versions` output. An empty bucket may print nothing.
///
/// # Errors
///
/// Returns the parse error when the output is not the expected JSON.
pub fn parse_object_versions(stdout: &str) -> Result<Vec<ObjectVersion>, serde_json::Error> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    let listing: ObjectVersionListing = serde_json::from_str(stdout)?;
    Ok(listing
        .versions
        .into_iter()
        .chain(listing.delete_markers)
        .flatten()
        .collect())
}

impl<R: CommandRunner> StateStore for AwsStateStore<'_, R> {
    fn backend_type(&self) -> &'static str {
        "s3"
    }

    /// Both the bucket and the lock table must be present; a store with only
    /// one of them is reported rather than treated as present or absent.
    fn exists(&self, name: &BackendName) -> Result<bool, RangeError> {
        let bucket = self.bucket_exists(name)?;
        let table = self.table_exists(name)?;
        if bucket == table {
            return Ok(bucket);
        }
        let missing = if bucket {
            format!("lock table {name} is missing")
        } else {
            format!("state bucket {name} is missing")
        };
        Err(RangeError::Query {
            what: format!("remote backend {name}"),
            message: format!("store is only partly present: {missing}"),
        })
    }

    fn provision(&self, name: &BackendName) -> Result<(), RangeError> {
        let mut create = args([
            "s3api",
            "create-bucket",
            "--bucket",
            name.as_str(),
            "--region",
            self.region.as_str(),
        ]);
        if self.region != "us-east-1" {
            create.push(OsString::from("--create-bucket-configuration"));
            create.push(OsString::from(format!("LocationConstraint={}", self.region)));
        }
        self.step(&create, Phase::Provision, "aws s3api create-bucket")?;
        self.step(
            &args([
                "s3api",
                "put-bucket-versioning",
                "--bucket",
                name.as_str(),
                "--versioning-configuration",
                "Status=Enabled",
                "--region",
                self.region.as_str(),
            ]),
            Phase::Provision,
            "aws s3api put-bucket-versioning",
        )?;
        self.step(
            &args([
                "dynamodb",
                "create-table",
                "--table-name",
                name.as_str(),
                "--attribute-definitions",
                "AttributeName=LockID,AttributeType=S",
                "--key-schema",
                "AttributeName=LockID,KeyType=HASH",
                "--billing-mode",
                "PAY_PER_REQUEST",
                "--region",
                self.region.as_str(),
            ]),
            Phase::Provision,
            "aws dynamodb create-table",
        )
    }

    /// Versioned buckets keep every object version and delete marker, so
    /// those are removed explicitly before the bucket itself.
    fn remove(&self, name: &BackendName) -> Result<(), RangeError> {
        self.empty_bucket(name)?;
        self.step(
            &args([
                "s3api",
                "delete-bucket",
                "--bucket",
                name.as_str(),
                "--region",
                self.region.as_str(),
            ]),
            Phase::Teardown,
            "aws s3api delete-bucket",
        )?;
        self.step(
            &args([
                "dynamodb",
                "delete-table",
                "--table-name",
                name.as_str(),
                "--region",
                self.region.as_str(),
            ]),
            Phase::Teardown,
            "aws dynamodb delete-table",
        )
    }

    fn backend_config(&self, name: &BackendName) -> Vec<(&'static str, String)> {
        vec![
            ("bucket", name.to_string()),
            ("key", String::from(AWS_STATE_KEY)),
            ("region", self.region.clone()),
            ("dynamodb_table", name.to_string()),
        ]
    }
}

/// Storage account with a `tfstate` container in the state resource group.
#[derive(Debug)]
pub struct AzureStateStore<'a, R: CommandRunner> {
    runner: &'a R,
    bin: &'a str,
    subscription: String,
    location: String,
    resource_group: String,
    dir: Utf8PathBuf,
}

/// Location of Azure state storage.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AzureStateLocation {
    /// Subscription owning the storage account.
    pub subscription: String,
    /// Azure location of the resource group and account.
    pub location: String,
    /// Resource group holding state storage accounts.
    pub resource_group: String,
}

impl<'a, R: CommandRunner> AzureStateStore<'a, R> {
    /// Store described by `location`, running the Azure CLI from `dir`.
    #[must_use]
    pub fn new(
        runner: &'a R,
        bin: &'a str,
        location: AzureStateLocation,
        dir: Utf8PathBuf,
    ) -> Self {
        Self {
            runner,
            bin,
            subscription: location.subscription,
            location: location.location,
            resource_group: location.resource_group,
            dir,
        }
    }

    fn step(&self, argv: &[OsString], phase: Phase, stage: &str) -> Result<(), RangeError> {
        checked(self.runner, self.bin, argv, &self.dir, phase, stage)
    }
}

impl<R: CommandRunner> StateStore for AzureStateStore<'_, R> {
    fn backend_type(&self) -> &'static str {
        "azurerm"
    }

    fn check_name(&self, name: &BackendName) -> Result<(), RangeError> {
        if name.as_str().len() > 24 || name.as_str().contains('-') {
            return Err(RangeError::InvalidArgument(format!(
                "Azure storage account name '{name}' must be 3-24 lowercase letters or digits"
            )));
        }
        Ok(())
    }

    fn exists(&self, name: &BackendName) -> Result<bool, RangeError> {
        let argv = args([
            "storage",
            "account",
            "show",
            "--name",
            name.as_str(),
            "--resource-group",
            self.resource_group.as_str(),
            "--subscription",
            self.subscription.as_str(),
            "--output",
            "json",
        ]);
        let output = self.runner.run(self.bin, &argv, &self.dir)?;
        if output.is_success() {
            return Ok(true);
        }
        let absent = ["ResourceNotFound", "ResourceGroupNotFound", "was not found"]
            .iter()
            .any(|marker| output.stderr.contains(marker));
        if absent {
            return Ok(false);
        }
        Err(query_error(name, &output))
    }

    fn provision(&self, name: &BackendName) -> Result<(), RangeError> {
        self.step(
            &args([
                "group",
                "create",
                "--name",
                self.resource_group.as_str(),
                "--location",
                self.location.as_str(),
                "--subscription",
                self.subscription.as_str(),
                "--output",
                "none",
            ]),
            Phase::Provision,
            "az group create",
        )?;
        self.step(
            &args([
                "storage",
                "account",
                "create",
                "--name",
                name.as_str(),
                "--resource-group",
                self.resource_group.as_str(),
                "--location",
                self.location.as_str(),
                "--sku",
                "Standard_LRS",
                "--subscription",
                self.subscription.as_str(),
                "--output",
                "none",
            ]),
            Phase::Provision,
            "az storage account create",
        )?;
        self.step(
            &args([
                "storage",
                "container",
                "create",
                "--name",
                AZURE_CONTAINER,
                "--account-name",
                name.as_str(),
                "--auth-mode",
                "login",
                "--subscription",
                self.subscription.as_str(),
                "--output",
                "none",
            ]),
            Phase::Provision,
            "az storage container create",
        )
    }

    fn remove(&self, name: &BackendName) -> Result<(), RangeError> {
        self.step(
            &args([
                "storage",
                "account",
                "delete",
                "--name",
                name.as_str(),
                "--resource-group",
                self.resource_group.as_str(),
                "--subscription",
                self.subscription.as_str(),
                "--yes",
            ]),
            Phase::Teardown,
            "az storage account delete",
        )
    }

    fn backend_config(&self, name: &BackendName) -> Vec<(&'static str, String)> {
        vec![
            ("resource_group_name", self.resource_group.clone()),
            ("storage_account_name", name.to_string()),
            ("container_name", String::from(AZURE_CONTAINER)),
            ("key", String::from(AZURE_STATE_KEY)),
        ]
    }
}
