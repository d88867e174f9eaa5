//! End-to-end tests driving the fleetctl binary against mock services

use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

const FLEET_YAML: &str = r#"
version: "1.0"
name: e2e
settings:
  state_dir: .fleet/state
  log_dir: .fleet/logs
  backup_dir: .fleet/backups
  restart_grace_secs: 0
services:
  database:
    deployment: mock
    env:
      POSTGRES_PASSWORD: "${E2E_DB_PASSWORD}"
    requires:
      secrets: [E2E_DB_PASSWORD]
  api-backend:
    deployment: mock
    dependencies: [database]
  web-frontend:
    deployment: mock
  gateway:
    deployment: external
    endpoint: tcp://127.0.0.1:1
"#;

struct Fleet {
    dir: TempDir,
}

impl Fleet {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("fleet.yaml"), FLEET_YAML).unwrap();
        Self { dir }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn state_file(&self, environment: &str, service: &str) -> PathBuf {
        self.path()
            .join(".fleet/state")
            .join(environment)
            .join(format!("{}.json", service))
    }

    fn run(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_fleetctl"))
            .args(["-e", "e2e"])
            .args(args)
            .current_dir(self.path())
            .env("E2E_DB_PASSWORD", "s3cret")
            .env_remove("RUST_LOG")
            .env_remove("FLEETCTL_CONFIG")
            .output()
            .unwrap()
    }

    fn json(&self, args: &[&str]) -> (Output, Value) {
        let mut full = vec!["--format", "json"];
        full.extend_from_slice(args);
        let output = self.run(&full);
        let value = serde_json::from_slice(&output.stdout).unwrap_or_else(|err| {
            panic!(
                "stdout is not JSON ({}): {}\nstderr: {}",
                err,
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            )
        });
        (output, value)
    }
}

#[test]
fn test_start_check_stop_lifecycle() {
    let fleet = Fleet::new();

    let (output, started) = fleet.json(&["start", "database", "api-backend"]);
    assert!(output.status.success());
    assert_eq!(started["summary"]["total"], 2);
    assert_eq!(started["summary"]["succeeded"], 2);
    assert!(fleet.state_file("e2e", "database").exists());

    let (output, checked) = fleet.json(&["check", "database", "api-backend"]);
    assert!(output.status.success());
    for result in checked["results"].as_array().unwrap() {
        assert_eq!(result["status"], "running");
        assert_eq!(result["details"]["stateVerified"], true);
        assert_eq!(result["details"]["healthStatus"], "healthy");
    }

    let (output, stopped) = fleet.json(&["stop", "database", "api-backend"]);
    assert!(output.status.success());
    assert_eq!(stopped["summary"]["succeeded"], 2);
    assert!(!fleet.state_file("e2e", "database").exists());
}

#[test]
fn test_failures_set_exit_status() {
    let fleet = Fleet::new();

    let (output, started) = fleet.json(&["start", "gateway"]);
    assert_eq!(output.status.code(), Some(1));
    assert_eq!(started["summary"]["failed"], 1);
    assert!(
        started["results"][0]["error"]
            .as_str()
            .unwrap()
            .contains("not reachable")
    );
}

#[test]
fn test_restart_of_external_service_is_refused() {
    let fleet = Fleet::new();

    let output = fleet.run(&["-v", "restart", "--force", "gateway"]);
    assert_eq!(output.status.code(), Some(1));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("not controllable remotely"), "{}", stdout);
    assert!(stdout.contains("hint (gateway)"), "{}", stdout);
}

#[test]
fn test_dry_run_touches_nothing() {
    let fleet = Fleet::new();

    let (output, results) = fleet.json(&["--dry-run", "destroy"]);
    assert!(output.status.success());
    assert_eq!(results["context"]["dryRun"], true);
    assert_eq!(results["summary"]["total"], 4);
    for result in results["results"].as_array().unwrap() {
        assert_eq!(result["status"], "dry-run");
        assert_eq!(result["dryRun"], true);
    }
    assert!(!fleet.path().join(".fleet/state").exists());
}

#[test]
fn test_restore_runs_database_last() {
    let fleet = Fleet::new();

    let (output, results) = fleet.json(&["restore", "database", "api-backend", "web-frontend"]);
    assert!(output.status.success());
    let order: Vec<&str> = results["results"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["service"].as_str().unwrap())
        .collect();
    assert_eq!(order, vec!["web-frontend", "api-backend", "database"]);
}

#[test]
fn test_validate_reports_problems() {
    let fleet = Fleet::new();

    let output = fleet.run(&["validate"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("Configuration valid"));

    let output = Command::new(env!("CARGO_BIN_EXE_fleetctl"))
        .args(["-e", "e2e", "--format", "json", "validate"])
        .current_dir(fleet.path())
        .env_remove("E2E_DB_PASSWORD")
        .env_remove("FLEETCTL_CONFIG")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let report: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["valid"], false);
    let problems: Vec<&str> = report["problems"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p.as_str().unwrap())
        .collect();
    assert!(problems.contains(&"service 'database': required secret E2E_DB_PASSWORD is not set"));
}

#[test]
fn test_unknown_service_is_an_error() {
    let fleet = Fleet::new();

    let output = fleet.run(&["start", "filesystem"]);
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Service 'filesystem' not found"));
}

#[test]
fn test_missing_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let output = Command::new(env!("CARGO_BIN_EXE_fleetctl"))
        .args(["-c", "nope.yaml", "check"])
        .current_dir(dir.path())
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("nope.yaml"));
}
