//! Golden image builds through `packer`.

use std::ffi::OsString;

use crate::config::{Provider, ProviderSettings, RangeConfig};
use crate::error::RangeError;
use crate::runner::CommandRunner;
use crate::terraform::{Phase, engine_failure};
use crate::tools::ToolConfig;

/// A golden image family packer knows how to build.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ImageTemplate {
    /// Image name prefix that selects this template.
    pub prefix: &'static str,
    /// Template path relative to the project root.
    pub template: &'static str,
    /// Source block name built on AWS.
    pub aws_source: &'static str,
    /// Source block name built on Azure.
    pub azure_source: &'static str,
}

/// Every image family, matched by prefix in order.
pub const IMAGE_TEMPLATES: [ImageTemplate; 7] = [
    ImageTemplate {
        prefix: "splunk",
        template: "packer/splunk_server/splunk-ubuntu.pkr.hcl",
        aws_source: "splunk-ubuntu-18-04",
        azure_source: "splunk-ubuntu-18-04",
    },
    ImageTemplate {
        prefix: "linux",
        template: "packer/linux_server/linux-ubuntu-18-04.pkr.hcl",
        aws_source: "ubuntu-18-04",
        azure_source: "ubuntu-18-04",
    },
    ImageTemplate {
        prefix: "windows-2016",
        template: "packer/windows_server/windows_2016.pkr.hcl",
        aws_source: "windows",
        azure_source: "windows",
    },
    ImageTemplate {
        prefix: "windows-2019",
        template: "packer/windows_server/windows_2019.pkr.hcl",
        aws_source: "windows",
        azure_source: "windows",
    },
    ImageTemplate {
        prefix: "windows-10",
        template: "packer/windows_server/windows_10.pkr.hcl",
        aws_source: "windows",
        azure_source: "windows",
    },
    ImageTemplate {
        prefix: "windows-11",
        template: "packer/windows_server/windows_10.pkr.hcl",
        aws_source: "windows",
        azure_source: "windows",
    },
    ImageTemplate {
        prefix: "nginx",
        template: "packer/nginx_server/nginx_web_proxy.pkr.hcl",
        aws_source: "nginx-web-proxy",
        azure_source: "nginx-web-proxy",
    },
];

/// Finds the template building `image_name`.
///
/// # Errors
///
/// Returns [`RangeError::InvalidArgument`] listing the supported families
/// when no prefix matches.
pub fn template_for(image_name: &str) -> Result<&'static ImageTemplate, RangeError> {
    let name = image_name.trim();
    IMAGE_TEMPLATES
        .iter()
        .find(|template| !name.is_empty() && name.starts_with(template.prefix))
        .ok_or_else(|| {
            let known = IMAGE_TEMPLATES
                .iter()
                .map(|template| template.prefix)
                .collect::<Vec<_>>()
                .join(", ");
            RangeError::InvalidArgument(format!(
                "unknown image '{image_name}': expected a name starting with one of {known}"
            ))
        })
}

/// Builds the `packer build` argument list for `image_name`.
///
/// # Errors
///
/// Returns [`RangeError::InvalidArgument`] for unknown images and
/// [`RangeError::Unsupported`] for the local provider.
pub fn build_args(image_name: &str, config: &RangeConfig) -> Result<Vec<OsString>, RangeError> {
    let template = template_for(image_name)?;
    let (builder, source, variable) = match &config.provider {
        ProviderSettings::Aws(aws) => (
            "amazon-ebs",
            template.aws_source,
            format!("region={}", aws.region),
        ),
        ProviderSettings::Azure(azure) => (
            "azure-arm",
            template.azure_source,
            format!("location_azure={}", azure.region),
        ),
        ProviderSettings::Local(_) => {
            return Err(RangeError::Unsupported {
                operation: "packer",
                provider: Provider::Local,
            });
        }
    };
    Ok(vec![
        OsString::from("build"),
        OsString::from("-force"),
        OsString::from("-var"),
        OsString::from(variable),
        OsString::from(format!("-only={builder}.{source}")),
        OsString::from(template.template),
    ])
}

/// Runs `packer build` for `image_name` from the project root.
///
/// # Errors
///
/// Returns [`RangeError::InvalidArgument`] for unknown images before packer
/// is started, and [`RangeError::Provision`] when the build fails.
pub fn build_image<R: CommandRunner>(
    runner: &R,
    tools: &ToolConfig,
    config: &RangeConfig,
    image_name: &str,
) -> Result<(), RangeError> {
    let argv = build_args(image_name, config)?;
    tracing::info!(
        image = image_name,
        provider = %config.cloud_provider(),
        "building golden image, this can take up to 30 minutes"
    );
    let output = runner.run(&tools.packer_bin, &argv, tools.root())?;
    if output.is_success() {
        tracing::info!(image = image_name, "golden image built");
        return Ok(());
    }
    Err(engine_failure(
        Phase::Provision,
        &format!("packer build {image_name}"),
        &output,
    ))
}
