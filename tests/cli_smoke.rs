//! Behavioural smoke tests for the CLI entrypoint.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

#[test]
fn cli_without_arguments_prints_usage() {
    let mut cmd = cargo_bin_cmd!("volplane");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn volume_list_without_backends_prints_empty_array() {
    let mut cmd = cargo_bin_cmd!("volplane");
    cmd.args(["volume", "list"])
        .env_remove("RUST_LOG")
        .env("VOLPLANE_LOG_LEVEL", "off");
    cmd.assert().success().stdout("[]\n");
}

#[test]
fn mutation_without_backend_fails_with_message() {
    let mut cmd = cargo_bin_cmd!("volplane");
    cmd.args(["volume", "create", "--name", "data1", "--size-gib", "4"])
        .env_remove("RUST_LOG")
        .env("VOLPLANE_LOG_LEVEL", "off");
    cmd.assert()
        .code(1)
        .stdout("")
        .stderr(predicate::str::contains("requires an active storage backend"));
}

#[test]
fn invalid_configuration_is_reported() {
    let mut cmd = cargo_bin_cmd!("volplane");
    cmd.args(["volume", "list"])
        .env_remove("RUST_LOG")
        .env("VOLPLANE_MOUNT_ROOT", "relative/path");
    cmd.assert()
        .code(1)
        .stderr(predicate::str::contains("VOLPLANE_MOUNT_ROOT"));
}
