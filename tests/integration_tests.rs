//! Integration tests for the sandbox-supervisor binary.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn supervisor() -> Command {
    let mut cmd = cargo_bin_cmd!("sandbox-supervisor");
    cmd.env_remove("SANDBOX_SUPERVISOR_CONFIG")
        .env_remove("SANDBOX_SUPERVISOR_PORT")
        .env_remove("SANDBOX_SUPERVISOR_DATA_DIR")
        .env_remove("RUST_LOG");
    cmd
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        supervisor()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("check-config"));
    }

    #[test]
    fn test_version() {
        supervisor()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_unknown_subcommand_fails() {
        supervisor().arg("launch").assert().failure();
    }
}

mod check_config {
    use super::*;

    #[test]
    fn test_defaults_without_config_file() {
        let dir = TempDir::new().unwrap();
        supervisor()
            .current_dir(dir.path())
            .arg("check-config")
            .assert()
            .success()
            .stdout(predicate::str::contains("[container]"))
            .stdout(predicate::str::contains("sleep_after_secs = 600"))
            .stdout(predicate::str::contains("port = 8787"));
    }

    #[test]
    fn test_file_and_flags_are_merged() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("custom.toml");
        fs::write(
            &config,
            r#"
[container]
entrypoint = ["python3", "-m", "http.server", "8080"]
default_port = 8080

[startup]
instance_poll_interval_ms = 100
"#,
        )
        .unwrap();

        supervisor()
            .arg("--config")
            .arg(&config)
            .arg("--port")
            .arg("9911")
            .arg("--data-dir")
            .arg(dir.path().join("state"))
            .arg("check-config")
            .assert()
            .success()
            .stdout(predicate::str::contains("http.server"))
            .stdout(predicate::str::contains("default_port = 8080"))
            .stdout(predicate::str::contains("instance_poll_interval_ms = 100"))
            .stdout(predicate::str::contains("port = 9911"))
            .stdout(predicate::str::contains("state"));
    }

    #[test]
    fn test_invalid_config_is_reported() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("broken.toml");
        fs::write(&config, "[startup]\ninstance_poll_interval_ms = 0\n").unwrap();

        supervisor()
            .arg("--config")
            .arg(&config)
            .arg("check-config")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to load configuration"));
    }
}
