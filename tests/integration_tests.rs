//! Integration tests for the roseram CLI.
//!
//! These exercise argument parsing and the offline commands; anything that
//! talks to GitHub or a sandbox service is covered by the unit tests.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn roseram(home: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("roseram");
    cmd.env("HOME", home.path())
        .env_remove("GITHUB_TOKEN")
        .env_remove("ROSERAM_SANDBOX_TOKEN")
        .env_remove("ROSERAM_LOG");
    cmd
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_help_lists_commands() {
        let home = TempDir::new().unwrap();
        roseram(&home)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("up"))
            .stdout(predicate::str::contains("config"));
    }

    #[test]
    fn test_version() {
        let home = TempDir::new().unwrap();
        roseram(&home)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("roseram"));
    }

    #[test]
    fn test_unknown_command_fails() {
        let home = TempDir::new().unwrap();
        roseram(&home).arg("frobnicate").assert().failure();
    }

    #[test]
    fn test_up_requires_repo() {
        let home = TempDir::new().unwrap();
        roseram(&home)
            .args(["up", "--project", "demo"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("--repo"));
    }
}

mod config_command {
    use super::*;

    #[test]
    fn test_config_init_creates_file() {
        let home = TempDir::new().unwrap();
        let dir = TempDir::new().unwrap();

        roseram(&home)
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created roseram.toml"));

        let path = dir.path().join(".roseram/roseram.toml");
        assert!(path.exists());
        let content = fs::read_to_string(path).unwrap();
        assert!(content.contains("[github]"));
        assert!(content.contains("branch_prefix = \"roseram\""));
    }

    #[test]
    fn test_config_init_twice_keeps_file() {
        let home = TempDir::new().unwrap();
        let dir = TempDir::new().unwrap();
        let config_dir = dir.path().join(".roseram");
        fs::create_dir_all(&config_dir).unwrap();
        fs::write(config_dir.join("roseram.toml"), "[github]\nbranch_prefix = \"ws\"\n").unwrap();

        roseram(&home)
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));

        let content = fs::read_to_string(config_dir.join("roseram.toml")).unwrap();
        assert!(content.contains("branch_prefix = \"ws\""));
    }

    #[test]
    fn test_config_show_defaults() {
        let home = TempDir::new().unwrap();
        let dir = TempDir::new().unwrap();

        roseram(&home)
            .args(["config", "show", "--project-dir"])
            .arg(dir.path())
            .assert()
            .success()
            .stdout(predicate::str::contains("Using default configuration"))
            .stdout(predicate::str::contains("[sandbox]"))
            .stdout(predicate::str::contains("GITHUB_TOKEN = not set"));
    }

    #[test]
    fn test_config_show_reads_file() {
        let home = TempDir::new().unwrap();
        let dir = TempDir::new().unwrap();
        let config_dir = dir.path().join(".roseram");
        fs::create_dir_all(&config_dir).unwrap();
        fs::write(
            config_dir.join("roseram.toml"),
            "[sandbox]\nmax_poll_attempts = 7\non_exhausted = \"assume_ready\"\n",
        )
        .unwrap();

        roseram(&home)
            .current_dir(dir.path())
            .arg("config")
            .assert()
            .success()
            .stdout(predicate::str::contains("max_poll_attempts = 7"))
            .stdout(predicate::str::contains("on_exhausted = \"assume_ready\""));
    }

    #[test]
    fn test_config_show_rejects_invalid_file() {
        let home = TempDir::new().unwrap();
        let dir = TempDir::new().unwrap();
        let config_dir = dir.path().join(".roseram");
        fs::create_dir_all(&config_dir).unwrap();
        fs::write(config_dir.join("roseram.toml"), "[sandbox]\npoll_interval_ms = 0\n").unwrap();

        roseram(&home)
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("poll_interval_ms"));
    }
}

mod up_command {
    use super::*;

    #[test]
    fn test_up_rejects_malformed_repo() {
        let home = TempDir::new().unwrap();
        let dir = TempDir::new().unwrap();

        roseram(&home)
            .current_dir(dir.path())
            .args(["up", "--project", "demo", "--repo", "not-a-repo"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid repository"));
    }

    #[test]
    fn test_up_rejects_blank_project() {
        let home = TempDir::new().unwrap();
        let dir = TempDir::new().unwrap();

        roseram(&home)
            .current_dir(dir.path())
            .args(["up", "--project", "  ", "--repo", "octo/hello"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Project id must not be empty"));
    }
}
