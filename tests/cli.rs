use assert_cmd::Command;
use predicates::prelude::*;
use resilience::backup::BackupOptions;
use resilience::config::BackupConfig;
use resilience::BackupStore;
use std::path::Path;

fn resilience(dir: &Path) -> Command {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("resilience").unwrap();
    cmd.current_dir(dir).env("HOME", dir);
    cmd
}

#[test]
fn test_version() {
    let dir = tempfile::tempdir().unwrap();
    resilience(dir.path())
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("resilience"));
}

#[test]
fn test_help_lists_commands() {
    let dir = tempfile::tempdir().unwrap();
    resilience(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("verify"))
        .stdout(predicate::str::contains("plan"))
        .stdout(predicate::str::contains("rotate-key"));
}

#[test]
fn test_severe_plan_requires_approval() {
    let dir = tempfile::tempdir().unwrap();
    resilience(dir.path())
        .args(["plan", "--corruption", "70", "--affected", "db/state", "--format", "json"])
        .arg("--storage")
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("\"approval_required\": true"))
        .stdout(predicate::str::contains("data_rebuild"));
}

#[test]
fn test_plan_rejects_bad_percentage() {
    let dir = tempfile::tempdir().unwrap();
    resilience(dir.path())
        .args(["plan", "--corruption", "140"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("outside"));
}

#[test]
fn test_empty_store() {
    let dir = tempfile::tempdir().unwrap();
    resilience(dir.path())
        .arg("backups")
        .arg("--storage")
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("No backups"));
    resilience(dir.path())
        .arg("verify")
        .arg("--storage")
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Checked 0 backup(s)"));
}

#[test]
fn test_verify_reports_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let store = BackupStore::open(BackupConfig::at(dir.path())).unwrap();
    let backup = store
        .create_backup(
            "db",
            "state",
            &serde_json::json!({ "rows": 3 }),
            BackupOptions::default(),
        )
        .unwrap();
    std::fs::write(dir.path().join(&backup.location), b"garbage").unwrap();

    resilience(dir.path())
        .arg("verify")
        .arg("--storage")
        .arg(dir.path())
        .assert()
        .code(4)
        .stdout(predicate::str::contains("1 corrupted"));
}

#[test]
fn test_missing_config_file_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    resilience(dir.path())
        .args(["backups", "--config"])
        .arg(dir.path().join("absent.toml"))
        .assert()
        .code(2);
}
