//! BDD step definitions for the remote backend commands.

use attack_range::config::Provider;
use attack_range::remote_backend::BackendName;
use attack_range::terraform::BACKEND_FILE_NAME;
use attack_range::test_support::{FakeSearchPlatform, sample_config_for};
use attack_range::{RangeController, RangeError, ToolConfig};
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;

use super::test_helpers::{BackendContext, BackendFailure, BackendFailureKind, BackendResult};

/// Message the AWS CLI reports for a missing bucket.
const MISSING_BUCKET_STDERR: &str =
    "An error occurred (404) when calling the HeadBucket operation: Not Found";

/// Message the AWS CLI reports for a missing lock table.
const MISSING_TABLE_STDERR: &str =
    "An error occurred (ResourceNotFoundException) when calling the DescribeTable operation";

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[derive(Clone, Copy, Debug)]
enum BackendAction {
    Create,
    Delete,
    Init,
}

#[given("a range workspace for provider \"{provider}\"")]
fn range_workspace(mut backend_context: BackendContext, provider: String) -> BackendContext {
    backend_context.provider = provider
        .parse::<Provider>()
        .unwrap_or_else(|err| panic!("provider {provider}: {err}"));
    backend_context
}

#[given("the state store does not exist")]
fn store_missing(backend_context: BackendContext) -> BackendContext {
    backend_context
        .runner
        .push_failure(254, MISSING_BUCKET_STDERR);
    backend_context
        .runner
        .push_failure(254, MISSING_TABLE_STDERR);
    backend_context
}

#[given("the state store exists")]
fn store_exists(backend_context: BackendContext) -> BackendContext {
    backend_context.runner.push_success();
    backend_context.runner.push_success();
    backend_context
}

#[given("the state bucket exists without its lock table")]
fn store_half_present(backend_context: BackendContext) -> BackendContext {
    backend_context.runner.push_success();
    backend_context
        .runner
        .push_failure(254, MISSING_TABLE_STDERR);
    backend_context
}

#[given("the state bucket holds \"{count}\" object versions")]
fn bucket_versions(backend_context: BackendContext, count: usize) -> BackendContext {
    let versions: Vec<serde_json::Value> = (0..count)
        .map(|index| {
            serde_json::json!({
                "Key": "attack_range/terraform.tfstate",
                "VersionId": format!("v{index}"),
            })
        })
        .collect();
    backend_context
        .runner
        .push_stdout(serde_json::json!({ "Versions": versions }).to_string());
    backend_context
}

#[given("every provisioning step succeeds")]
fn provisioning_succeeds(backend_context: BackendContext) -> BackendContext {
    for _ in 0..4 {
        backend_context.runner.push_success();
    }
    backend_context
}

#[when("I create the remote backend \"{name}\"")]
fn create_backend(
    backend_context: BackendContext,
    name: String,
) -> Result<BackendContext, StepError> {
    run_action(backend_context, BackendAction::Create, &name)
}

#[when("I delete the remote backend \"{name}\"")]
fn delete_backend(
    backend_context: BackendContext,
    name: String,
) -> Result<BackendContext, StepError> {
    run_action(backend_context, BackendAction::Delete, &name)
}

#[when("I initialise the remote backend \"{name}\"")]
fn init_backend(
    backend_context: BackendContext,
    name: String,
) -> Result<BackendContext, StepError> {
    run_action(backend_context, BackendAction::Init, &name)
}

fn run_action(
    mut backend_context: BackendContext,
    action: BackendAction,
    name: &str,
) -> Result<BackendContext, StepError> {
    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    let name = BackendName::parse(name).map_err(|err| StepError::Assertion(err.to_string()))?;
    let tools = ToolConfig {
        project_root: backend_context.root.to_string(),
        ..ToolConfig::default()
    };
    let controller = RangeController::new(
        sample_config_for(backend_context.provider),
        tools,
        backend_context.runner.clone(),
        FakeSearchPlatform::default(),
    );

    let result = runtime.block_on(async {
        match action {
            BackendAction::Create => controller.create_remote_backend(&name).await,
            BackendAction::Delete => controller.delete_remote_backend(&name).await,
            BackendAction::Init => controller.init_remote_backend(&name).await,
        }
    });
    backend_context.outcome = Some(match result {
        Ok(()) => BackendResult::Success,
        Err(err) => BackendResult::Failure(BackendFailure {
            kind: map_failure_kind(&err),
            message: err.to_string(),
        }),
    });
    Ok(backend_context)
}

#[then("the backend result is successful")]
fn backend_success(backend_context: &BackendContext) -> Result<(), StepError> {
    match backend_context.outcome {
        Some(BackendResult::Success) => Ok(()),
        Some(BackendResult::Failure(ref failure)) => Err(StepError::Assertion(format!(
            "expected success, got failure: {}",
            failure.message
        ))),
        None => Err(StepError::Assertion(String::from("missing outcome"))),
    }
}

#[then("the backend error kind is \"{kind}\"")]
fn backend_error_kind(backend_context: &BackendContext, kind: String) -> Result<(), StepError> {
    let expected = parse_failure_kind(&kind)?;
    let Some(BackendResult::Failure(failure)) = &backend_context.outcome else {
        return Err(StepError::Assertion(String::from(
            "expected failure outcome",
        )));
    };
    if failure.kind == expected {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected failure kind {expected:?}, got {:?} ({})",
            failure.kind, failure.message
        )))
    }
}

#[then("the runner ran \"{fragment}\"")]
fn runner_ran(backend_context: &BackendContext, fragment: String) -> Result<(), StepError> {
    let commands = backend_context.runner.commands();
    if commands.iter().any(|command| command.contains(&fragment)) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected a command containing {fragment:?}, got {commands:?}"
        )))
    }
}

#[then("the runner did not run \"{fragment}\"")]
fn runner_skipped(backend_context: &BackendContext, fragment: String) -> Result<(), StepError> {
    let commands = backend_context.runner.commands();
    if commands.iter().any(|command| command.contains(&fragment)) {
        Err(StepError::Assertion(format!(
            "no command should contain {fragment:?}, got {commands:?}"
        )))
    } else {
        Ok(())
    }
}

#[then("terraform was reinitialised \"{count}\" times")]
fn terraform_reinitialised(
    backend_context: &BackendContext,
    count: usize,
) -> Result<(), StepError> {
    let runs = backend_context
        .runner
        .commands()
        .iter()
        .filter(|command| command.contains("init") && command.contains("-reconfigure"))
        .count();
    if runs == count {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} terraform init -reconfigure runs, got {runs}"
        )))
    }
}

#[then("no commands were run")]
fn no_commands(backend_context: &BackendContext) -> Result<(), StepError> {
    let commands = backend_context.runner.commands();
    if commands.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected no commands, got {commands:?}"
        )))
    }
}

#[then("terraform keeps state in the \"{backend_type}\" backend")]
fn terraform_remote_state(
    backend_context: &BackendContext,
    backend_type: String,
) -> Result<(), StepError> {
    let path = backend_context.terraform_dir().join(BACKEND_FILE_NAME);
    let block = std::fs::read_to_string(&path)
        .map_err(|err| StepError::Assertion(format!("read {path}: {err}")))?;
    if block.contains(&format!("backend \"{backend_type}\"")) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected a {backend_type} backend block, got {block:?}"
        )))
    }
}

#[then("terraform keeps local state")]
fn terraform_local_state(backend_context: &BackendContext) -> Result<(), StepError> {
    let path = backend_context.terraform_dir().join(BACKEND_FILE_NAME);
    if path.exists() {
        Err(StepError::Assertion(format!("{path} should not exist")))
    } else {
        Ok(())
    }
}

const fn map_failure_kind(err: &RangeError) -> BackendFailureKind {
    match err {
        RangeError::AlreadyExists { .. } => BackendFailureKind::AlreadyExists,
        RangeError::NotFound { .. } => BackendFailureKind::NotFound,
        RangeError::Unsupported { .. } => BackendFailureKind::Unsupported,
        _ => BackendFailureKind::Other,
    }
}

fn parse_failure_kind(kind: &str) -> Result<BackendFailureKind, StepError> {
    match kind {
        "already_exists" => Ok(BackendFailureKind::AlreadyExists),
        "not_found" => Ok(BackendFailureKind::NotFound),
        "unsupported" => Ok(BackendFailureKind::Unsupported),
        "other" => Ok(BackendFailureKind::Other),
        _ => Err(StepError::Assertion(format!("unknown failure kind: {kind}"))),
    }
}
