//! Shared fixtures for remote backend BDD scenarios.

use std::rc::Rc;

use attack_range::config::Provider;
use attack_range::test_support::ScriptedRunner;
use camino::Utf8PathBuf;
use rstest::fixture;
use tempfile::TempDir;
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct BackendContext {
    pub _workspace: Rc<TempDir>,
    pub root: Utf8PathBuf,
    pub provider: Provider,
    pub runner: ScriptedRunner,
    pub outcome: Option<BackendResult>,
}

impl BackendContext {
    pub fn terraform_dir(&self) -> Utf8PathBuf {
        self.root.join("terraform").join(self.provider.to_string())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BackendFailureKind {
    AlreadyExists,
    NotFound,
    Unsupported,
    Other,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BackendFailure {
    pub kind: BackendFailureKind,
    pub message: String,
}

#[derive(Clone, Debug)]
pub enum BackendResult {
    Success,
    Failure(BackendFailure),
}

#[derive(Clone, Debug, Error)]
pub enum BackendTestError {
    #[error("invalid backend fixture: {0}")]
    Fixture(String),
}

pub type BackendContextResult = Result<BackendContext, BackendTestError>;

#[fixture]
pub fn backend_context_result() -> BackendContextResult {
    build_backend_context()
}

#[fixture]
pub fn backend_context(backend_context_result: BackendContextResult) -> BackendContext {
    backend_context_result
        .unwrap_or_else(|err| panic!("backend context fixture should initialise: {err}"))
}

fn build_backend_context() -> BackendContextResult {
    let workspace =
        TempDir::new().map_err(|err| BackendTestError::Fixture(format!("tempdir: {err}")))?;
    let root = Utf8PathBuf::from_path_buf(workspace.path().to_path_buf())
        .map_err(|path| BackendTestError::Fixture(format!("non UTF-8 path {}", path.display())))?;
    for dir in ["terraform/aws", "terraform/azure", "vagrant"] {
        std::fs::create_dir_all(root.join(dir))
            .map_err(|err| BackendTestError::Fixture(format!("mkdir {dir}: {err}")))?;
    }
    Ok(BackendContext {
        _workspace: Rc::new(workspace),
        root,
        provider: Provider::Aws,
        runner: ScriptedRunner::new(),
        outcome: None,
    })
}
