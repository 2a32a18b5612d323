//! Common test utilities and fixtures
//!
//! This module provides shared test infrastructure

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use serde_json::Value;
use tempfile::TempDir;

/// Get the path to the test fixtures directory
pub fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
}

/// Get a path to a specific fixture file
pub fn fixture_path(name: &str) -> PathBuf {
    fixtures_dir().join(name)
}

/// Get the valid config fixture path
pub fn valid_config_fixture() -> PathBuf {
    fixture_path("valid_config.toml")
}

/// Get the invalid config fixture path
pub fn invalid_config_fixture() -> PathBuf {
    fixture_path("invalid_config.toml")
}

/// Get a command for the dataflow-worker binary, isolated from the
/// caller's DATAFLOW_* environment
pub fn worker_cmd() -> Command {
    let mut cmd = Command::cargo_bin("dataflow-worker").unwrap();
    for (key, _) in std::env::vars() {
        if key.starts_with("DATAFLOW_") {
            cmd.env_remove(key);
        }
    }
    cmd
}

/// A scratch worker: config, storage and output all live in a temp dir
pub struct WorkerSandbox {
    pub dir: TempDir,
}

impl WorkerSandbox {
    pub fn new() -> Self {
        Self::with_runtime("")
    }

    /// Extra `[runtime]` lines, e.g. `inline_threshold_bytes = 8`
    pub fn with_runtime(runtime: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path().display().to_string();
        let config = format!(
            r#"
[worker]
id = "sandbox-worker"

[runtime]
stream_poll_interval_ms = 5
stream_wait_timeout_ms = 2000
{runtime}

[storage]
data_dir = "{root}/data"
block_dir = "{root}/blocks"

[logging]
level = "debug"

[packages]
threads = 4
"#
        );
        fs::write(dir.path().join("worker.toml"), config).unwrap();
        Self { dir }
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.path().join("worker.toml")
    }

    pub fn block_dir(&self) -> PathBuf {
        self.dir.path().join("blocks")
    }

    pub fn output_path(&self) -> PathBuf {
        self.dir.path().join("out.jsonl")
    }

    /// `run --config <sandbox> --output <sandbox>/out.jsonl`
    pub fn run_cmd(&self) -> Command {
        let mut cmd = worker_cmd();
        cmd.arg("run")
            .arg("--config")
            .arg(self.config_path())
            .arg("--output")
            .arg(self.output_path());
        cmd
    }

    /// Messages the worker sent, one per line
    pub fn messages(&self) -> Vec<Value> {
        read_messages(&self.output_path())
    }
}

pub fn read_messages(path: &Path) -> Vec<Value> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

/// Messages of one type, in order
pub fn of_type<'a>(messages: &'a [Value], kind: &str) -> Vec<&'a Value> {
    messages.iter().filter(|m| m["type"] == kind).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixtures_dir_exists() {
        assert!(fixtures_dir().exists(), "Fixtures directory should exist");
    }

    #[test]
    fn test_valid_config_exists() {
        assert!(
            valid_config_fixture().exists(),
            "Valid config fixture should exist"
        );
    }

    #[test]
    fn test_invalid_config_exists() {
        assert!(
            invalid_config_fixture().exists(),
            "Invalid config fixture should exist"
        );
    }
}
