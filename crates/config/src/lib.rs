//! Configuration schema and loader for pbtc crawler instances.

use pbtc_common::Chain;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level crawler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerConfig {
    /// Which Bitcoin network to crawl.
    #[serde(default = "default_chain")]
    pub network: Chain,

    /// User agent advertised in the version handshake.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Protocol version offered to peers.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,

    /// Outbound dial attempts per second.
    #[serde(default = "default_connection_rate")]
    pub connection_rate: f64,

    /// Seconds between periodic getaddr/ping rounds on each peer.
    #[serde(default = "default_information_rate_secs")]
    pub information_rate_secs: u64,

    /// Maximum number of simultaneously tracked peers.
    #[serde(default = "default_peer_limit")]
    pub peer_limit: usize,

    /// Node repository settings.
    #[serde(default)]
    pub repository: RepositoryConfig,

    /// Rotating file output. Absent = no file writer.
    #[serde(default)]
    pub file_writer: Option<FileWriterConfig>,

    /// ZeroMQ PUB output. Absent = no socket writer.
    #[serde(default)]
    pub zmq_writer: Option<ZmqWriterConfig>,

    /// Recorder instances; each applies its own filters and writes to
    /// the named writers.
    #[serde(default)]
    pub recorders: Vec<RecorderConfig>,

    /// Optional Prometheus metrics HTTP port.
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// DNS seed hostnames resolved at bootstrap.
    #[serde(default)]
    pub seeds: Vec<String>,

    /// Maximum number of nodes kept in the index.
    #[serde(default = "default_node_limit")]
    pub node_limit: usize,

    /// Path of the persisted node file.
    #[serde(default = "default_backup_path")]
    pub backup_path: PathBuf,

    /// Seconds between background saves of the node index.
    #[serde(default = "default_backup_rate_secs")]
    pub backup_rate_secs: u64,

    /// Whether to restore the node file on startup.
    #[serde(default = "default_true")]
    pub restore: bool,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            node_limit: default_node_limit(),
            backup_path: default_backup_path(),
            backup_rate_secs: default_backup_rate_secs(),
            restore: default_true(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileWriterConfig {
    /// Directory the rotated log files are created in.
    #[serde(default = "default_log_dir")]
    pub path: PathBuf,

    /// Rotate once the current file reaches this many bytes; 0 disables.
    #[serde(default = "default_size_limit")]
    pub size_limit: u64,

    /// Rotate once the current file is this old; 0 disables.
    #[serde(default = "default_age_limit_secs")]
    pub age_limit_secs: u64,

    /// Compression applied to rotated files.
    #[serde(default)]
    pub compression: Compression,
}

impl Default for FileWriterConfig {
    fn default() -> Self {
        Self {
            path: default_log_dir(),
            size_limit: default_size_limit(),
            age_limit_secs: default_age_limit_secs(),
            compression: Compression::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Lz4,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZmqWriterConfig {
    /// TCP port the PUB socket binds on.
    pub port: u16,

    /// Outbound high-water mark (messages buffered per subscriber).
    #[serde(default = "default_zmq_hwm")]
    pub high_water_mark: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Command filter; empty accepts every message type.
    #[serde(default)]
    pub commands: Vec<String>,

    /// Base58 address filter, matched against tx outputs.
    #[serde(default)]
    pub addresses: Vec<String>,

    /// Remote-IP filter.
    #[serde(default)]
    pub ips: Vec<String>,

    /// Output representation pushed to the writers.
    #[serde(default)]
    pub format: RecordFormat,

    /// Which configured writers this recorder feeds.
    pub writers: Vec<WriterKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordFormat {
    #[default]
    Text,
    Binary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriterKind {
    File,
    Zmq,
}

// --- Defaults ---

fn default_chain() -> Chain {
    Chain::Mainnet
}
fn default_user_agent() -> String {
    "/pbtc:0.1.0/".to_string()
}
fn default_protocol_version() -> u32 {
    70013
}
fn default_connection_rate() -> f64 {
    25.0
}
fn default_information_rate_secs() -> u64 {
    10
}
fn default_peer_limit() -> usize {
    1000
}
fn default_node_limit() -> usize {
    100_000
}
fn default_backup_path() -> PathBuf {
    PathBuf::from("nodes.dat")
}
fn default_backup_rate_secs() -> u64 {
    120
}
fn default_true() -> bool {
    true
}
fn default_log_dir() -> PathBuf {
    PathBuf::from("dumps")
}
fn default_size_limit() -> u64 {
    1024 * 1024
}
fn default_age_limit_secs() -> u64 {
    3600
}
fn default_zmq_hwm() -> i32 {
    1000
}

// --- Loading ---

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl CrawlerConfig {
    /// Validate that configuration values are consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection_rate <= 0.0 {
            return Err(ConfigError::Invalid(
                "connection_rate must be > 0".into(),
            ));
        }
        if self.peer_limit == 0 {
            return Err(ConfigError::Invalid("peer_limit must be > 0".into()));
        }
        if self.repository.node_limit == 0 {
            return Err(ConfigError::Invalid(
                "repository.node_limit must be > 0".into(),
            ));
        }
        for (i, rec) in self.recorders.iter().enumerate() {
            if rec.writers.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "recorder {} names no writers",
                    i
                )));
            }
            for w in &rec.writers {
                match w {
                    WriterKind::File if self.file_writer.is_none() => {
                        return Err(ConfigError::Invalid(format!(
                            "recorder {} uses the file writer, but none is configured",
                            i
                        )));
                    }
                    WriterKind::Zmq if self.zmq_writer.is_none() => {
                        return Err(ConfigError::Invalid(format!(
                            "recorder {} uses the zmq writer, but none is configured",
                            i
                        )));
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

/// Load a [`CrawlerConfig`] from a YAML file path.
pub fn load_from_file(path: &std::path::Path) -> Result<CrawlerConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    load_from_str(&contents)
}

/// Load a [`CrawlerConfig`] from a YAML string.
pub fn load_from_str(yaml: &str) -> Result<CrawlerConfig, ConfigError> {
    let config: CrawlerConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}
