//! BDD scenarios for the remote backend workflow.

use rstest_bdd_macros::scenario;

use super::test_helpers::{BackendContext, backend_context};

#[scenario(
    path = "tests/features/remote_backend.feature",
    name = "Create a new remote backend"
)]
fn scenario_create_backend(backend_context: BackendContext) {
    drop(backend_context);
}

#[scenario(
    path = "tests/features/remote_backend.feature",
    name = "Refuse to create a backend that already exists"
)]
fn scenario_create_existing_backend(backend_context: BackendContext) {
    drop(backend_context);
}

#[scenario(
    path = "tests/features/remote_backend.feature",
    name = "Refuse to delete a missing backend"
)]
fn scenario_delete_missing_backend(backend_context: BackendContext) {
    drop(backend_context);
}

#[scenario(
    path = "tests/features/remote_backend.feature",
    name = "Delete an existing backend and return to local state"
)]
fn scenario_delete_backend(backend_context: BackendContext) {
    drop(backend_context);
}

#[scenario(
    path = "tests/features/remote_backend.feature",
    name = "Delete a versioned backend"
)]
fn scenario_delete_versioned_backend(backend_context: BackendContext) {
    drop(backend_context);
}

#[scenario(
    path = "tests/features/remote_backend.feature",
    name = "Refuse to act on a half-created backend"
)]
fn scenario_half_created_backend(backend_context: BackendContext) {
    drop(backend_context);
}

#[scenario(
    path = "tests/features/remote_backend.feature",
    name = "Bind terraform to an existing backend"
)]
fn scenario_init_backend(backend_context: BackendContext) {
    drop(backend_context);
}

#[scenario(
    path = "tests/features/remote_backend.feature",
    name = "Binding terraform twice leaves the same state"
)]
fn scenario_init_backend_twice(backend_context: BackendContext) {
    drop(backend_context);
}

#[scenario(
    path = "tests/features/remote_backend.feature",
    name = "Refuse to bind terraform to a missing backend"
)]
fn scenario_init_missing_backend(backend_context: BackendContext) {
    drop(backend_context);
}

#[scenario(
    path = "tests/features/remote_backend.feature",
    name = "Local ranges have no remote backends"
)]
fn scenario_local_unsupported(backend_context: BackendContext) {
    drop(backend_context);
}
