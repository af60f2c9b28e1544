//! End-to-end CLI tests against the built binary.

use assert_cmd::Command;
use std::path::Path;

fn vaultsync(db: &Path) -> Command {
    let mut cmd = Command::cargo_bin("vaultsync").unwrap();
    cmd.env_remove("VAULTSYNC_DB")
        .env_remove("VAULTSYNC_TEST_DB")
        .env_remove("VAULTSYNC_API_URL")
        .env_remove("VAULTSYNC_API_TOKEN")
        .arg("--db")
        .arg(db);
    cmd
}

#[test]
fn version_reports_package_version() {
    let dir = tempfile::tempdir().unwrap();
    let out = vaultsync(&dir.path().join("state.db"))
        .args(["version", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
}

#[test]
fn status_before_init_fails_with_not_initialized() {
    let dir = tempfile::tempdir().unwrap();
    let out = vaultsync(&dir.path().join("state.db"))
        .args(["status", "--json"])
        .assert()
        .failure()
        .code(2)
        .get_output()
        .stderr
        .clone();
    let json: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(json["error"]["code"], "NOT_INITIALIZED");
    assert!(json["error"]["hint"].as_str().unwrap().contains("init"));
}

#[test]
fn init_creates_database_and_is_idempotent_only_with_force() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("state.db");

    vaultsync(&db).arg("init").assert().success();
    assert!(db.exists());

    vaultsync(&db).arg("init").assert().failure().code(2);
    vaultsync(&db).args(["init", "--force"]).assert().success();
}

#[test]
fn status_after_init_reports_empty_store() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("state.db");
    vaultsync(&db).arg("init").assert().success();

    let out = vaultsync(&db)
        .args(["status", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(json["total"], 0);
    assert_eq!(json["dead_letters"], 0);
    assert!(json["last_reconcile_at"].is_null());
}

#[test]
fn deadletter_list_is_empty_after_init() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("state.db");
    vaultsync(&db).arg("init").assert().success();

    let out = vaultsync(&db)
        .args(["deadletter", "list", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(json.as_array().unwrap().len(), 0);
}

#[test]
fn reconcile_requires_vault_root() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("state.db");
    vaultsync(&db).arg("init").assert().success();

    vaultsync(&db)
        .args(["reconcile", "/definitely/not/a/vault", "--api-url", "http://localhost:9"])
        .assert()
        .failure()
        .code(3);
}

#[test]
fn help_lists_all_commands() {
    let dir = tempfile::tempdir().unwrap();
    let out = vaultsync(&dir.path().join("state.db"))
        .arg("--help")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8_lossy(&out);
    for command in ["init", "run", "reconcile", "status", "deadletter", "completions"] {
        assert!(text.contains(command), "help missing `{command}`");
    }
}

#[test]
fn completions_generate_for_bash() {
    let dir = tempfile::tempdir().unwrap();
    let out = vaultsync(&dir.path().join("state.db"))
        .args(["completions", "bash"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert!(String::from_utf8_lossy(&out).contains("vaultsync"));
}
