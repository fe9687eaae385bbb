//! Configuration management for the Tidelog server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::SpillType;

/// Main configuration for a Tidelog process.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Log engine knobs.
    pub log: LogConfig,
    /// Logging configuration.
    pub logging: LoggingConfig,
    /// Restore pipeline sizing, forwarded to the backup tooling.
    pub restore: RestoreConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(crate::Error::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed.
    pub fn parse(content: &str) -> crate::Result<Self> {
        toml::from_str(content).map_err(|e| crate::Error::Config(e.to_string()))
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the TLog endpoints bind to.
    pub bind: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: "127.0.0.1:4789".parse().expect("valid default address") }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding per-group KV stores and disk queues.
    pub data_dir: PathBuf,
    /// Skip pushing commit payloads to the disk queue. Replay after a crash
    /// then starts empty; only for benchmarking.
    pub queue_in_memory_only: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { data_dir: PathBuf::from("data"), queue_in_memory_only: false }
    }
}

/// Knobs governing the log engine: memory caps, spill behavior and
/// commit pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// How messages move to the KV store under memory pressure.
    pub spill_type: SpillType,
    /// Spill once `bytes_input - bytes_durable` exceeds this.
    pub spill_threshold_bytes: u64,
    /// Backpressure commits once `bytes_input - bytes_durable` reaches this.
    pub hard_limit_bytes: u64,
    /// Force a disk-queue commit once this many uncommitted bytes accumulate.
    pub max_queue_commit_bytes: u64,
    /// Allocation size for shared message blocks.
    pub default_block_bytes: usize,
    /// Messages above this size are accepted but flagged.
    pub max_message_size: usize,
    /// Process-wide cap on in-flight peek response memory.
    pub peek_memory_bytes: usize,
    /// Byte target for a single peek reply.
    pub peek_reply_bytes: usize,
    /// Concurrent spilled-data reads served to log routers.
    pub concurrent_log_router_reads: usize,
    /// Hard timeout for KV store and disk queue creation/recovery.
    pub max_create_duration_secs: u64,
    /// Soft warning timer on commit replies, in milliseconds.
    pub warning_timeout_ms: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            spill_type: SpillType::Reference,
            spill_threshold_bytes: 1_500_000_000,
            hard_limit_bytes: 3_000_000_000,
            max_queue_commit_bytes: 15_000_000,
            default_block_bytes: 10_000_000,
            max_message_size: 2_000_000,
            peek_memory_bytes: 2_000_000_000,
            peek_reply_bytes: 150_000,
            concurrent_log_router_reads: 5,
            max_create_duration_secs: 10,
            warning_timeout_ms: 100,
        }
    }
}

impl LogConfig {
    /// KV/disk-queue creation timeout as a [`Duration`].
    #[must_use]
    pub const fn max_create_duration(&self) -> Duration {
        Duration::from_secs(self.max_create_duration_secs)
    }

    /// Commit-reply warning timer as a [`Duration`].
    #[must_use]
    pub const fn warning_timeout(&self) -> Duration {
        Duration::from_millis(self.warning_timeout_ms)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (`error`, `warn`, `info`, `debug`, `trace`).
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

/// Sizing for the backup restore pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    /// Number of loader workers decoding log files.
    pub num_loaders: usize,
    /// Number of applier workers pushing decoded mutations.
    pub num_appliers: usize,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self { num_loaders: 8, num_appliers: 8 }
    }
}
