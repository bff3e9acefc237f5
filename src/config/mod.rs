//! Configuration management for PasteSync
//!
//! This module handles loading, validating, and managing configuration
//! for the PasteSync service.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading config file
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("Failed to parse TOML: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("Failed to serialize TOML: {0}")]
    TomlSer(#[from] toml::ser::Error),

    /// Validation error
    #[error("Config validation failed: {0}")]
    Validation(String),

    /// Config directory could not be determined
    #[error("Could not determine config directory")]
    NoConfigDir,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Device ID (generated if not specified)
    #[serde(default = "generate_device_id")]
    pub device_id: Uuid,

    /// Name advertised for mDNS discovery
    #[serde(default = "default_device_name")]
    pub device_name: String,

    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Security configuration
    #[serde(default)]
    pub security: SecurityConfig,

    /// Sync tuning
    #[serde(default)]
    pub sync: SyncConfig,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Address to bind the HTTP transport on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Statically configured peers (host:port), exempt from expiry
    #[serde(default)]
    pub manual_peers: Vec<SocketAddr>,

    /// Whether to announce/browse over mDNS
    #[serde(default = "default_true")]
    pub enable_mdns: bool,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite record database
    #[serde(default = "default_db_path")]
    pub database: PathBuf,

    /// Directory for content-addressed file blobs
    #[serde(default = "default_blob_dir")]
    pub blob_dir: PathBuf,

    /// Number of non-favorite records to retain
    #[serde(default = "default_retention")]
    pub retention: usize,

    /// Days to keep tombstones before pruning
    #[serde(default = "default_tombstone_days")]
    pub tombstone_days: u32,
}

/// Security configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Path to the Ed25519 identity key (PKCS#8)
    #[serde(default = "default_identity_key")]
    pub identity_key: PathBuf,

    /// Path to the trusted-devices database
    #[serde(default = "default_trust_db")]
    pub trust_db: PathBuf,

    /// Path to the at-rest encryption key for the record store
    #[serde(default = "default_store_key")]
    pub store_key: PathBuf,
}

/// Sync behavior tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Heartbeat interval in seconds
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Consecutive heartbeat misses before a peer is marked disconnected
    #[serde(default = "default_heartbeat_misses")]
    pub max_heartbeat_misses: u32,

    /// Initial reconnect backoff in seconds
    #[serde(default = "default_backoff_initial_secs")]
    pub backoff_initial_secs: u64,

    /// Maximum reconnect backoff in seconds
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,

    /// Chunk size for file blob pulls, in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Maximum retries per chunk before a pull is abandoned
    #[serde(default = "default_chunk_retries")]
    pub chunk_retries: u32,

    /// Maximum record payload size in bytes
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,
}

// Default value functions
fn default_listen_addr() -> SocketAddr {
    "0.0.0.0:13129".parse().expect("static default addr")
}

fn default_device_name() -> String {
    gethostname::gethostname().to_string_lossy().to_string()
}

fn default_db_path() -> PathBuf {
    data_dir().join("records.db")
}

fn default_blob_dir() -> PathBuf {
    data_dir().join("blobs")
}

fn default_retention() -> usize {
    500
}

fn default_tombstone_days() -> u32 {
    30
}

fn default_identity_key() -> PathBuf {
    config_dir().join("identity.p8")
}

fn default_trust_db() -> PathBuf {
    config_dir().join("trusted_devices.json")
}

fn default_store_key() -> PathBuf {
    config_dir().join("store.key")
}

fn default_heartbeat_secs() -> u64 {
    15
}

fn default_heartbeat_misses() -> u32 {
    3
}

fn default_backoff_initial_secs() -> u64 {
    1
}

fn default_backoff_max_secs() -> u64 {
    60
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_chunk_retries() -> u32 {
    3
}

fn default_max_payload() -> usize {
    crate::MAX_PAYLOAD_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn generate_device_id() -> Uuid {
    Uuid::new_v4()
}

fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pastesync")
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pastesync")
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            manual_peers: Vec::new(),
            enable_mdns: true,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_db_path(),
            blob_dir: default_blob_dir(),
            retention: default_retention(),
            tombstone_days: default_tombstone_days(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            identity_key: default_identity_key(),
            trust_db: default_trust_db(),
            store_key: default_store_key(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat_secs(),
            max_heartbeat_misses: default_heartbeat_misses(),
            backoff_initial_secs: default_backoff_initial_secs(),
            backoff_max_secs: default_backoff_max_secs(),
            chunk_size: default_chunk_size(),
            chunk_retries: default_chunk_retries(),
            max_payload: default_max_payload(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_id: generate_device_id(),
            device_name: default_device_name(),
            network: NetworkConfig::default(),
            storage: StorageConfig::default(),
            security: SecurityConfig::default(),
            sync: SyncConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    /// Default config file location
    pub fn default_path() -> PathBuf {
        config_dir().join("config.toml")
    }

    /// Load configuration from the given path, or the default location.
    /// A missing file yields the default configuration.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map(PathBuf::from).unwrap_or_else(Self::default_path);

        if !path.exists() {
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Write this configuration to the given path
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_name.is_empty() {
            return Err(ConfigError::Validation("device_name is empty".into()));
        }
        if self.sync.chunk_size == 0 {
            return Err(ConfigError::Validation("chunk_size must be > 0".into()));
        }
        if self.sync.max_payload == 0 {
            return Err(ConfigError::Validation("max_payload must be > 0".into()));
        }
        if self.sync.backoff_initial_secs > self.sync.backoff_max_secs {
            return Err(ConfigError::Validation(
                "backoff_initial_secs exceeds backoff_max_secs".into(),
            ));
        }
        if self.storage.retention == 0 {
            return Err(ConfigError::Validation("retention must be > 0".into()));
        }
        Ok(())
    }

    /// Heartbeat interval as a Duration
    pub fn heartbeat_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sync.heartbeat_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sync.chunk_size, 64 * 1024);
    }

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nope.toml");
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.storage.retention, 500);
    }

    #[test]
    fn test_save_and_reload() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");

        let mut config = Config::default();
        config.device_name = "desk".to_string();
        config.sync.heartbeat_secs = 5;
        config.save(&path).unwrap();

        let loaded = Config::load(Some(&path)).unwrap();
        assert_eq!(loaded.device_name, "desk");
        assert_eq!(loaded.sync.heartbeat_secs, 5);
        assert_eq!(loaded.device_id, config.device_id);
    }

    #[test]
    fn test_validation_rejects_zero_chunk_size() {
        let mut config = Config::default();
        config.sync.chunk_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_inverted_backoff() {
        let mut config = Config::default();
        config.sync.backoff_initial_secs = 120;
        config.sync.backoff_max_secs = 60;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let toml = r#"
            device_name = "laptop"

            [sync]
            heartbeat_secs = 30
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.device_name, "laptop");
        assert_eq!(config.sync.heartbeat_secs, 30);
        assert_eq!(config.sync.max_heartbeat_misses, 3);
        assert_eq!(config.storage.retention, 500);
    }
}
