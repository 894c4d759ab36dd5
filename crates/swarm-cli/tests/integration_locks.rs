//! Integration tests for the file-lock subcommands

use assert_cmd::cargo;
use predicates::prelude::*;
use serial_test::serial;
use tempfile::TempDir;

fn cmd_in(root: &TempDir) -> assert_cmd::Command {
    let mut cmd = cargo::cargo_bin_cmd!("claude-swarm");
    cmd.env("CLAUDESWARM_ROOT", root.path());
    cmd
}

#[test]
#[serial]
fn acquire_then_who_has_then_release() {
    let root = TempDir::new().unwrap();

    cmd_in(&root)
        .args(["acquire-file-lock", "src/auth.py", "agent-1", "refactor"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Lock acquired on: src/auth.py"));

    cmd_in(&root)
        .args(["who-has-lock", "src/auth.py"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Held by: agent-1"));

    cmd_in(&root)
        .args(["release-file-lock", "src/auth.py", "agent-1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Lock released on: src/auth.py"));

    cmd_in(&root)
        .args(["who-has-lock", "src/auth.py"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No active lock"));
}

#[test]
#[serial]
fn conflicting_acquire_exits_nonzero() {
    let root = TempDir::new().unwrap();

    cmd_in(&root)
        .args(["acquire-file-lock", "src/auth.py", "agent-1", "refactor"])
        .assert()
        .success();

    cmd_in(&root)
        .args(["acquire-file-lock", "src/auth.py", "agent-2", "also working"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Currently held by: agent-1"));
}

#[test]
#[serial]
fn release_by_wrong_agent_fails() {
    let root = TempDir::new().unwrap();
    cmd_in(&root)
        .args(["acquire-file-lock", "src/auth.py", "agent-1", ""])
        .assert()
        .success();

    cmd_in(&root)
        .args(["release-file-lock", "src/auth.py", "agent-2"])
        .assert()
        .failure()
        .code(1);
}

#[test]
#[serial]
fn list_all_locks_reports_every_entry() {
    let root = TempDir::new().unwrap();
    cmd_in(&root)
        .args(["acquire-file-lock", "a.py", "agent-1", "x"])
        .assert()
        .success();
    cmd_in(&root)
        .args(["acquire-file-lock", "b.py", "agent-2", "y"])
        .assert()
        .success();

    cmd_in(&root)
        .args(["list-all-locks"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Active locks (2)"));
}

#[test]
#[serial]
fn cleanup_stale_locks_reports_zero_when_nothing_stale() {
    let root = TempDir::new().unwrap();
    cmd_in(&root)
        .args(["cleanup-stale-locks"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Cleaned up 0 stale lock(s)"));
}

#[test]
#[serial]
fn invalid_agent_id_is_rejected() {
    let root = TempDir::new().unwrap();
    cmd_in(&root)
        .args(["acquire-file-lock", "a.py", "bad/id", "x"])
        .assert()
        .failure()
        .code(1);
}
