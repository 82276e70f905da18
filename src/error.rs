//! Failure taxonomy shared by every lifecycle operation.

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::config::{ConfigError, Provider};
use crate::runner::RunnerError;
use crate::tools::ToolConfigError;

/// Tagged failure returned by every controller operation.
///
/// Each variant terminates the invocation; nothing here is retried.
#[derive(Debug, Error)]
pub enum RangeError {
    /// Bad or missing range configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    /// Bad tool settings.
    #[error("configuration error: {0}")]
    Tools(#[from] ToolConfigError),
    /// Bad operator supplied value, detected before contacting anything.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The provisioning engine failed while creating resources.
    #[error("{}", describe_engine_failure("provisioning", stage, message, failed_resources))]
    Provision {
        /// Step that failed (for example `terraform apply`).
        stage: String,
        /// Output reported by the engine.
        message: String,
        /// Resource addresses the engine named in its failure report.
        failed_resources: Vec<String>,
    },
    /// The provisioning engine failed while removing or suspending resources.
    #[error("{}", describe_engine_failure("teardown", stage, message, failed_resources))]
    Teardown {
        /// Step that failed (for example `terraform destroy`).
        stage: String,
        /// Output reported by the engine.
        message: String,
        /// Resource addresses the engine named in its failure report.
        failed_resources: Vec<String>,
    },
    /// The engine reported that another invocation holds the state lock.
    #[error("state lock held by another operation during {stage}: {message}")]
    LockConflict {
        /// Step that observed the lock.
        stage: String,
        /// Lock details reported by the engine.
        message: String,
    },
    /// The inventory of the range could not be read.
    #[error("failed to query {what}: {message}")]
    Query {
        /// What was being queried.
        what: String,
        /// Underlying failure.
        message: String,
    },
    /// `simulate` named a machine that is not part of the range.
    #[error("target '{target}' not found in range inventory (known: {known})")]
    TargetNotFound {
        /// Requested target.
        target: String,
        /// Comma separated machine names currently provisioned.
        known: String,
    },
    /// `simulate` named a machine that cannot currently be reached.
    #[error("target '{target}' is not ready: {reason}")]
    TargetNotReady {
        /// Requested target.
        target: String,
        /// Why the target cannot be used.
        reason: String,
    },
    /// The simulation engine failed on the target.
    #[error("simulation on '{target}' failed: {message}")]
    Simulation {
        /// Machine the engine ran against.
        target: String,
        /// Output reported by the engine.
        message: String,
    },
    /// The search platform rejected or failed the export search.
    #[error("search failed: {0}")]
    Search(String),
    /// The dump file could not be written.
    #[error("failed to write dump {path}: {message}")]
    Export {
        /// Requested dump path.
        path: Utf8PathBuf,
        /// Underlying failure.
        message: String,
    },
    /// The replay file is not a dump produced by this tool.
    #[error("{path}:{line}: not a valid dump record: {message}")]
    Format {
        /// File being replayed.
        path: Utf8PathBuf,
        /// One-based line number of the bad record (zero when unreadable).
        line: usize,
        /// Parser message.
        message: String,
    },
    /// The search platform rejected ingestion.
    #[error("ingest failed: {0}")]
    Ingest(String),
    /// `create_remote_backend` named a store that already exists.
    #[error("remote backend '{name}' already exists")]
    AlreadyExists {
        /// Backend name.
        name: String,
    },
    /// A remote backend operation named a store that does not exist.
    #[error("remote backend '{name}' not found")]
    NotFound {
        /// Backend name.
        name: String,
    },
    /// The operation has no meaning for the selected provider.
    #[error("{operation} is not supported by the {provider} provider")]
    Unsupported {
        /// Operation requested.
        operation: &'static str,
        /// Provider in use.
        provider: Provider,
    },
    /// An external engine could not be executed at all.
    #[error(transparent)]
    Runner(#[from] RunnerError),
}

fn describe_engine_failure(
    kind: &str,
    stage: &str,
    message: &str,
    failed_resources: &[String],
) -> String {
    if failed_resources.is_empty() {
        format!("{kind} failed during {stage}: {message}")
    } else {
        format!(
            "{kind} failed during {stage} for {}: {message}",
            failed_resources.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn provision_error_names_failed_resources() {
        let err = RangeError::Provision {
            stage: String::from("terraform apply"),
            message: String::from("quota exceeded"),
            failed_resources: vec![
                String::from("aws_instance.windows_server[0]"),
                String::from("aws_instance.kali_machine[0]"),
            ],
        };

        assert_eq!(
            err.to_string(),
            "provisioning failed during terraform apply for aws_instance.windows_server[0], \
             aws_instance.kali_machine[0]: quota exceeded"
        );
    }

    #[rstest]
    fn teardown_error_without_resources_omits_the_list() {
        let err = RangeError::Teardown {
            stage: String::from("vagrant halt ar-win"),
            message: String::from("boom"),
            failed_resources: Vec::new(),
        };
        assert_eq!(err.to_string(), "teardown failed during vagrant halt ar-win: boom");
    }
}
