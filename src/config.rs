//! Configuration system for the dataflow worker
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (DATAFLOW_* prefix)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Main worker configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker identity
    pub worker: WorkerSettings,

    /// Cooperative runtime tuning
    pub runtime: RuntimeSettings,

    /// Data storage paths
    pub storage: StorageSettings,

    /// Logging configuration
    pub logging: LoggingSettings,

    /// Values answered by `package_lookup`
    pub packages: BTreeMap<String, serde_json::Value>,
}

/// Worker identity settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Unique worker identifier (auto-generated if not set)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Human-readable worker name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Settings consumed by running computations and the host channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Values at or below this size are published inline
    pub inline_threshold_bytes: usize,

    /// Default chunk size for streaming reads
    pub stream_chunk_size: usize,

    /// Poll interval while waiting for a stream to grow
    pub stream_poll_interval_ms: u64,

    /// Upper bound on any single stream wait
    pub stream_wait_timeout_ms: u64,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Maximum log file size in MB before rotation
    pub max_file_size_mb: u64,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

/// Storage path settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Base data directory
    pub data_dir: String,

    /// Directory holding concrete reference blocks
    pub block_dir: String,
}

// Default implementations

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            inline_threshold_bytes: 4096,
            stream_chunk_size: 64 * 1024 * 1024,
            stream_poll_interval_ms: 50,
            stream_wait_timeout_ms: 30_000,
        }
    }
}

impl RuntimeSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.stream_poll_interval_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_wait_timeout_ms)
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_file_size_mb: 100,
            max_files: 5,
            json_format: false,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: "~/.dataflow/worker".to_string(),
            block_dir: "~/.dataflow/worker/blocks".to_string(),
        }
    }
}

impl WorkerConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = Self::find_config_file(config_path)? {
            debug!(path = %path.display(), "Loading configuration file");
            let content = fs::read_to_string(&path).map_err(|source| Error::IoRead {
                path: path.clone(),
                source,
            })?;
            config = toml::from_str(&content).map_err(|e| {
                Error::config_parse(format!("{}: {}", path.display(), e.message()), Some(e))
            })?;
            info!(path = %path.display(), "Configuration loaded from file");
        }

        config.apply_env_overrides();
        config.expand_paths();
        config.validate()?;

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        // An explicit path must exist
        if let Some(path) = explicit_path {
            let path = PathBuf::from(expand_path(path));
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(Error::config_not_found(path));
        }

        let search_paths = [
            PathBuf::from("dataflow-worker.toml"),
            dirs::config_dir()
                .map(|p| p.join("dataflow").join("worker.toml"))
                .unwrap_or_default(),
            dirs::home_dir()
                .map(|p| p.join(".dataflow").join("worker.toml"))
                .unwrap_or_default(),
            PathBuf::from("/etc/dataflow/worker.toml"),
        ];

        for path in &search_paths {
            if !path.as_os_str().is_empty() && path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("DATAFLOW_WORKER_ID") {
            self.worker.id = Some(val);
        }
        if let Ok(val) = std::env::var("DATAFLOW_WORKER_NAME") {
            self.worker.name = Some(val);
        }

        if let Ok(val) = std::env::var("DATAFLOW_INLINE_THRESHOLD") {
            if let Ok(n) = val.parse() {
                self.runtime.inline_threshold_bytes = n;
            }
        }
        if let Ok(val) = std::env::var("DATAFLOW_STREAM_CHUNK_SIZE") {
            if let Ok(n) = val.parse() {
                self.runtime.stream_chunk_size = n;
            }
        }
        if let Ok(val) = std::env::var("DATAFLOW_STREAM_TIMEOUT_MS") {
            if let Ok(n) = val.parse() {
                self.runtime.stream_wait_timeout_ms = n;
            }
        }

        if let Ok(val) = std::env::var("DATAFLOW_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("DATAFLOW_LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Ok(val) = std::env::var("DATAFLOW_LOG_JSON") {
            self.logging.json_format = val.to_lowercase() == "true" || val == "1";
        }

        if let Ok(val) = std::env::var("DATAFLOW_DATA_DIR") {
            self.storage.data_dir = val;
        }
        if let Ok(val) = std::env::var("DATAFLOW_BLOCK_DIR") {
            self.storage.block_dir = val;
        }
    }

    /// Expand ~ and other path variables
    fn expand_paths(&mut self) {
        self.storage.data_dir = expand_path(&self.storage.data_dir);
        self.storage.block_dir = expand_path(&self.storage.block_dir);

        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.level",
                format!(
                    "Invalid log level '{}'. Must be one of: {}",
                    self.logging.level,
                    valid_levels.join(", ")
                ),
            ));
        }

        if self.runtime.stream_chunk_size == 0 {
            return Err(Error::config_field_invalid(
                "runtime.stream_chunk_size",
                "stream_chunk_size must be greater than zero",
            ));
        }

        if self.runtime.stream_poll_interval_ms == 0 {
            return Err(Error::config_field_invalid(
                "runtime.stream_poll_interval_ms",
                "stream_poll_interval_ms must be greater than zero",
            ));
        }

        if self.storage.block_dir.trim().is_empty() {
            return Err(Error::config_field_invalid(
                "storage.block_dir",
                "block_dir cannot be empty",
            ));
        }

        Ok(())
    }

    /// Get the data directory as a PathBuf
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage.data_dir)
    }

    /// Get the block directory as a PathBuf
    pub fn block_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage.block_dir)
    }
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or(std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Initialize a new configuration file
pub fn init_config(path: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".dataflow")
                .join("worker.toml")
        });

    if config_path.exists() && !force {
        return Err(Error::config_validation(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    if let Some(parent) = config_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|source| Error::IoWrite {
                path: parent.to_path_buf(),
                source,
            })?;
        }
    }

    fs::write(&config_path, generate_default_config()).map_err(|source| Error::IoWrite {
        path: config_path.clone(),
        source,
    })?;

    Ok(config_path)
}

/// Generate default configuration content with comments
fn generate_default_config() -> String {
    r#"# Dataflow Worker Configuration

[worker]
# Unique worker identifier (auto-generated if not set)
# id = "worker-abc123"

# Human-readable worker name
# name = "My Worker"

[runtime]
# Values at or below this many bytes are published inline
inline_threshold_bytes = 4096

# Chunk size used when reading a stream that is still being written
stream_chunk_size = 67108864

# Poll interval while waiting for a stream to grow (milliseconds)
stream_poll_interval_ms = 50

# Upper bound on a single stream wait (milliseconds)
stream_wait_timeout_ms = 30000

[storage]
# Base data directory
data_dir = "~/.dataflow/worker"

# Directory holding concrete reference blocks
block_dir = "~/.dataflow/worker/blocks"

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (comment out to disable file logging)
# file = "~/.dataflow/worker/logs/worker.log"

# Maximum log file size in MB before rotation
max_file_size_mb = 100

# Number of rotated log files to keep
max_files = 5

# Enable JSON formatted logging
json_format = false

[packages]
# Values answered to running computations by package_lookup
# threads = 4
"#
    .to_string()
}
