//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub writer: WriterConfig,

    #[serde(default)]
    pub metadata: MetadataConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub streams: Vec<StreamConfig>,
}

/// Segment store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// "file" or "sqlite"
    #[serde(default = "default_backend")]
    pub backend: String,

    /// "lz4" or "none"
    #[serde(default = "default_compression")]
    pub compression: String,

    #[serde(default = "default_sync_writes")]
    pub sync_writes: bool,

    /// Segments kept open for appending by the file backend
    #[serde(default = "default_max_open_segments")]
    pub max_open_segments: usize,
}

fn default_data_dir() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("timebatch").to_string_lossy().to_string())
        .unwrap_or_else(|| "./timebatch_data".to_string())
}

fn default_backend() -> String {
    "file".to_string()
}

fn default_compression() -> String {
    "lz4".to_string()
}

fn default_sync_writes() -> bool {
    true
}

fn default_max_open_segments() -> usize {
    256
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            backend: default_backend(),
            compression: default_compression(),
            sync_writes: default_sync_writes(),
            max_open_segments: default_max_open_segments(),
        }
    }
}

/// Batch cache configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Pending datapoints per stream that form one batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Total pending bytes before inserts are refused; 0 disables the bound
    #[serde(default = "default_max_pending_bytes")]
    pub max_pending_bytes: u64,

    /// Seconds added to a colliding timestamp when restamping
    #[serde(default = "default_restamp_epsilon")]
    pub restamp_epsilon: f64,
}

fn default_batch_size() -> usize {
    250
}

fn default_max_pending_bytes() -> u64 {
    256 * 1024 * 1024 // 256 MB
}

fn default_restamp_epsilon() -> f64 {
    1e-6
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_pending_bytes: default_max_pending_bytes(),
            restamp_epsilon: default_restamp_epsilon(),
        }
    }
}

/// Chunk writer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct WriterConfig {
    /// Batches claimed per poll
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Bound on the forced flush at shutdown
    #[serde(default = "default_flush_timeout")]
    pub flush_timeout_ms: u64,
}

fn default_chunk_size() -> usize {
    5
}

fn default_poll_interval() -> u64 {
    100
}

fn default_retry_backoff() -> u64 {
    200
}

fn default_max_backoff() -> u64 {
    10_000 // 10 seconds
}

fn default_flush_timeout() -> u64 {
    30_000 // 30 seconds
}

impl WriterConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            poll_interval_ms: default_poll_interval(),
            retry_backoff_ms: default_retry_backoff(),
            max_backoff_ms: default_max_backoff(),
            flush_timeout_ms: default_flush_timeout(),
        }
    }
}

/// Metadata cache configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MetadataConfig {
    #[serde(default = "default_metadata_capacity")]
    pub capacity: usize,

    /// Entry lifetime; 0 disables expiry
    #[serde(default = "default_metadata_ttl")]
    pub ttl_secs: u64,
}

fn default_metadata_capacity() -> usize {
    10_000
}

fn default_metadata_ttl() -> u64 {
    60
}

impl MetadataConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            capacity: default_metadata_capacity(),
            ttl_secs: default_metadata_ttl(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,

    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

/// A named stream, as declared in `[[streams]]`
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct StreamConfig {
    /// Path-style name, e.g. "thermostat/temperature"
    pub name: String,
    pub device: i64,
    pub stream: i64,

    /// JSON Schema document as a JSON string
    #[serde(default)]
    pub schema: Option<String>,

    #[serde(default)]
    pub max_device_size: u64,

    #[serde(default)]
    pub max_stream_size: u64,

    #[serde(default)]
    pub restamp: bool,
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("timebatch").join("config.toml")),
            Some(PathBuf::from("/etc/timebatch/config.toml")),
            Some(PathBuf::from("./timebatch.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        // Fall back to environment-only config
        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        // Storage overrides
        if let Ok(data_dir) = std::env::var("TIMEBATCH_DATA_DIR") {
            self.storage.data_dir = data_dir;
        }
        if let Ok(backend) = std::env::var("TIMEBATCH_BACKEND") {
            self.storage.backend = backend;
        }
        if let Ok(compression) = std::env::var("TIMEBATCH_COMPRESSION") {
            self.storage.compression = compression;
        }

        // Cache overrides
        if let Ok(size) = std::env::var("TIMEBATCH_BATCH_SIZE") {
            if let Ok(n) = size.parse() {
                self.cache.batch_size = n;
            }
        }

        // Writer overrides
        if let Ok(chunk) = std::env::var("TIMEBATCH_CHUNK_SIZE") {
            if let Ok(n) = chunk.parse() {
                self.writer.chunk_size = n;
            }
        }

        // Logging overrides
        if let Ok(level) = std::env::var("TIMEBATCH_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("TIMEBATCH_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.storage.backend.as_str() {
            "file" | "sqlite" => {}
            other => {
                return Err(ConfigError::Invalid(format!(
                    "storage.backend must be \"file\" or \"sqlite\", got {:?}",
                    other
                )))
            }
        }
        match self.storage.compression.to_lowercase().as_str() {
            "lz4" | "none" => {}
            other => {
                return Err(ConfigError::Invalid(format!(
                    "storage.compression must be \"lz4\" or \"none\", got {:?}",
                    other
                )))
            }
        }
        if self.cache.batch_size == 0 {
            return Err(ConfigError::Invalid("cache.batch_size must be positive".into()));
        }
        if self.cache.restamp_epsilon.is_nan() || self.cache.restamp_epsilon <= 0.0 {
            return Err(ConfigError::Invalid(
                "cache.restamp_epsilon must be positive".into(),
            ));
        }
        if self.storage.max_open_segments == 0 {
            return Err(ConfigError::Invalid(
                "storage.max_open_segments must be positive".into(),
            ));
        }
        if self.writer.chunk_size == 0 {
            return Err(ConfigError::Invalid("writer.chunk_size must be positive".into()));
        }

        let mut names = HashSet::new();
        let mut ids = HashSet::new();
        for stream in &self.streams {
            if !names.insert(stream.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "stream {:?} declared twice",
                    stream.name
                )));
            }
            if !ids.insert(stream.stream) {
                return Err(ConfigError::Invalid(format!(
                    "stream id {} used by more than one stream",
                    stream.stream
                )));
            }
        }

        Ok(())
    }

    /// Data directory with a leading `~/` expanded
    pub fn data_dir(&self) -> PathBuf {
        match (self.storage.data_dir.strip_prefix("~/"), dirs::home_dir()) {
            (Some(rest), Some(home)) => home.join(rest),
            _ => PathBuf::from(&self.storage.data_dir),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# timebatch configuration
#
# Environment variables override these settings:
# - TIMEBATCH_DATA_DIR
# - TIMEBATCH_BACKEND
# - TIMEBATCH_COMPRESSION
# - TIMEBATCH_BATCH_SIZE
# - TIMEBATCH_CHUNK_SIZE
# - TIMEBATCH_LOG_LEVEL
# - TIMEBATCH_LOG_FORMAT

[storage]
# Directory for segment files
data_dir = "~/.local/share/timebatch"

# Segment backend: file or sqlite
backend = "file"

# Payload compression: lz4 or none
compression = "lz4"

# fsync data and index on every committed batch
sync_writes = true

# Segments kept open for appending (file backend); the least recently
# written one is closed when the limit is reached
max_open_segments = 256

[cache]
# Pending datapoints per stream that form one batch
batch_size = 250

# Refuse inserts once this many bytes are waiting for the writer (0 = no bound)
max_pending_bytes = 268435456

# Seconds added to a colliding timestamp when restamping
restamp_epsilon = 0.000001

[writer]
# Batches committed per poll
chunk_size = 5

# Idle poll interval (ms)
poll_interval_ms = 100

# Backoff after a failed commit, doubling up to max_backoff_ms
retry_backoff_ms = 200
max_backoff_ms = 10000

# Bound on the forced flush at shutdown (ms)
flush_timeout_ms = 30000

[metadata]
# Cached stream definitions
capacity = 10000

# Seconds before a cached definition is re-resolved (0 = never)
ttl_secs = 60

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"

# Optional log file path
# file = "/var/log/timebatch/timebatch.log"

# Named streams
# [[streams]]
# name = "thermostat/temperature"
# device = 1
# stream = 1
# schema = '{"type": "number"}'
# max_device_size = 0
# max_stream_size = 0
# restamp = false
"#
    .to_string()
}
