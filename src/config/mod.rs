//! Configuration management for shoal
//!
//! This module handles loading and validating configuration from environment variables,
//! files, and command-line arguments.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::store::layout::DEFAULT_ROOT;
use crate::utils::retry::RetryConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Coordination store configuration
    pub store: StoreConfig,

    /// Master configuration
    pub master: MasterConfig,

    /// Node configuration
    pub node: NodeConfig,

    /// Client configuration
    pub client: ClientConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Coordination store configuration, shared by the service and its clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// URL of the `shoal store` service
    pub url: String,

    /// Bind address when running the service
    pub bind_address: SocketAddr,

    /// Root path of this cluster's tree
    pub root_path: String,

    /// Session expiry after this many milliseconds without a heartbeat
    pub session_timeout_ms: u64,

    /// Interval between session heartbeats in milliseconds
    pub heartbeat_interval_ms: u64,

    /// Maximum time an event long-poll is held open in milliseconds
    pub poll_wait_ms: u64,

    /// Number of tree events kept for long-polling watchers
    pub event_log_capacity: usize,
}

/// Master configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Replication level applied when an index does not carry one
    pub default_replication: u32,

    /// First backoff delay of the reconcile loop in milliseconds
    pub retry_base_delay_ms: u64,

    /// Backoff cap of the reconcile loop in milliseconds
    pub retry_max_delay_ms: u64,
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Bind address of the node's query surface
    pub bind_address: SocketAddr,

    /// host:port other processes use to reach this node; derived from the
    /// bind address when unset
    pub advertised_address: Option<String>,

    /// Working directory for fetched shard data
    pub shard_dir: PathBuf,

    /// Interval between health record updates in seconds
    pub health_interval_secs: u64,

    /// Interval between metrics snapshots in milliseconds
    pub metrics_interval_ms: u64,
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Deadline for one fan-out in milliseconds
    pub request_timeout_ms: u64,

    /// Deadline for one detail lookup in milliseconds
    pub detail_timeout_ms: u64,

    /// Time `add-index` waits for deployment in seconds
    pub deploy_timeout_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: String::from("http://127.0.0.1:7700"),
            bind_address: SocketAddr::from(([0, 0, 0, 0], 7700)),
            root_path: String::from(DEFAULT_ROOT),
            session_timeout_ms: 10_000,
            heartbeat_interval_ms: 2_000,
            poll_wait_ms: 5_000,
            event_log_capacity: 8192,
        }
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            default_replication: 1,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 5_000,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 20000)),
            advertised_address: None,
            shard_dir: PathBuf::from("data/shards"),
            health_interval_secs: 5,
            metrics_interval_ms: 1_000,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            detail_timeout_ms: 10_000,
            deploy_timeout_secs: 300,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("SHOAL_STORE_URL") {
            config.store.url = url;
        }
        if let Some(addr) = env_parse("SHOAL_STORE_BIND") {
            config.store.bind_address = addr;
        }
        if let Ok(root) = std::env::var("SHOAL_ROOT_PATH") {
            config.store.root_path = root;
        }
        if let Some(ms) = env_parse("SHOAL_SESSION_TIMEOUT_MS") {
            config.store.session_timeout_ms = ms;
        }
        if let Some(ms) = env_parse("SHOAL_HEARTBEAT_INTERVAL_MS") {
            config.store.heartbeat_interval_ms = ms;
        }

        if let Some(replication) = env_parse("SHOAL_REPLICATION") {
            config.master.default_replication = replication;
        }

        if let Some(addr) = env_parse("SHOAL_NODE_BIND") {
            config.node.bind_address = addr;
        }
        config.node.advertised_address = std::env::var("SHOAL_NODE_ADDRESS").ok();
        if let Ok(dir) = std::env::var("SHOAL_SHARD_DIR") {
            config.node.shard_dir = PathBuf::from(dir);
        }
        if let Some(secs) = env_parse("SHOAL_HEALTH_INTERVAL_SECS") {
            config.node.health_interval_secs = secs;
        }

        if let Some(ms) = env_parse("SHOAL_REQUEST_TIMEOUT_MS") {
            config.client.request_timeout_ms = ms;
        }
        if let Some(secs) = env_parse("SHOAL_DEPLOY_TIMEOUT_SECS") {
            config.client.deploy_timeout_secs = secs;
        }

        if let Ok(level) = std::env::var("SHOAL_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(format) = std::env::var("SHOAL_LOG_FORMAT") {
            config.logging.format = format;
        }

        Ok(config)
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if !self.store.root_path.starts_with('/') || self.store.root_path.len() < 2 {
            anyhow::bail!("root_path must be an absolute path below '/'");
        }

        if self.store.heartbeat_interval_ms == 0 {
            anyhow::bail!("heartbeat_interval_ms must be greater than 0");
        }

        if self.store.heartbeat_interval_ms >= self.store.session_timeout_ms {
            anyhow::bail!("heartbeat_interval_ms must be less than session_timeout_ms");
        }

        if self.store.event_log_capacity == 0 {
            anyhow::bail!("event_log_capacity must be greater than 0");
        }

        if self.master.default_replication == 0 {
            anyhow::bail!("default_replication must be at least 1");
        }

        if self.master.retry_base_delay_ms > self.master.retry_max_delay_ms {
            anyhow::bail!("retry_base_delay_ms must not exceed retry_max_delay_ms");
        }

        if self.node.health_interval_secs == 0 {
            anyhow::bail!("health_interval_secs must be greater than 0");
        }

        if self.node.metrics_interval_ms == 0 {
            anyhow::bail!("metrics_interval_ms must be greater than 0");
        }

        if self.client.request_timeout_ms == 0 {
            anyhow::bail!("request_timeout_ms must be greater than 0");
        }

        Ok(())
    }

    /// Session timeout as Duration
    #[must_use]
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.store.session_timeout_ms)
    }

    /// Session heartbeat interval as Duration
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.store.heartbeat_interval_ms)
    }

    /// Node health interval as Duration
    #[must_use]
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.node.health_interval_secs)
    }

    /// Node metrics interval as Duration
    #[must_use]
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.node.metrics_interval_ms)
    }

    /// Fan-out deadline as Duration
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.client.request_timeout_ms)
    }

    /// Detail lookup deadline as Duration
    #[must_use]
    pub fn detail_timeout(&self) -> Duration {
        Duration::from_millis(self.client.detail_timeout_ms)
    }

    /// Deployment wait as Duration
    #[must_use]
    pub fn deploy_timeout(&self) -> Duration {
        Duration::from_secs(self.client.deploy_timeout_secs)
    }

    /// Unbounded retry policy used for coordination writes
    #[must_use]
    pub fn store_retry(&self) -> RetryConfig {
        RetryConfig::forever(
            self.master.retry_base_delay_ms,
            self.master.retry_max_delay_ms,
        )
        .with_jitter()
    }

    /// host:port under which the node registers itself
    pub fn advertised_node_address(&self) -> String {
        match &self.node.advertised_address {
            Some(addr) => addr.clone(),
            None if self.node.bind_address.ip().is_unspecified() => {
                format!("{}:{}", crate::utils::hostname(), self.node.bind_address.port())
            }
            None => self.node.bind_address.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.store.root_path, "/shoal");
        assert_eq!(config.master.default_replication, 1);
        assert_eq!(config.health_interval(), Duration::from_secs(5));
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_heartbeat_must_be_below_session_timeout() {
        let mut config = Config::default();
        config.store.heartbeat_interval_ms = config.store.session_timeout_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_replication_rejected() {
        let mut config = Config::default();
        config.master.default_replication = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_relative_root_rejected() {
        let mut config = Config::default();
        config.store.root_path = "shoal".to_string();
        assert!(config.validate().is_err());
        config.store.root_path = "/".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[store]\nroot_path = \"/test/cluster\"\n\n[client]\nrequest_timeout_ms = 250"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.store.root_path, "/test/cluster");
        assert_eq!(config.client.request_timeout_ms, 250);
        assert_eq!(config.node.health_interval_secs, 5);
    }

    #[test]
    #[serial_test::serial]
    fn test_from_env_overrides() {
        std::env::set_var("SHOAL_ROOT_PATH", "/env/cluster");
        std::env::set_var("SHOAL_REPLICATION", "3");
        std::env::set_var("SHOAL_NODE_ADDRESS", "search-7:20001");
        std::env::set_var("SHOAL_REQUEST_TIMEOUT_MS", "not-a-number");

        let config = Config::from_env().unwrap();

        std::env::remove_var("SHOAL_ROOT_PATH");
        std::env::remove_var("SHOAL_REPLICATION");
        std::env::remove_var("SHOAL_NODE_ADDRESS");
        std::env::remove_var("SHOAL_REQUEST_TIMEOUT_MS");

        assert_eq!(config.store.root_path, "/env/cluster");
        assert_eq!(config.master.default_replication, 3);
        assert_eq!(config.advertised_node_address(), "search-7:20001");
        // Unparseable values fall back to the default
        assert_eq!(config.client.request_timeout_ms, 10_000);
    }

    #[test]
    #[serial_test::serial]
    fn test_from_env_defaults() {
        std::env::remove_var("SHOAL_NODE_ADDRESS");
        let config = Config::from_env().unwrap();
        assert!(config.node.advertised_address.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_advertised_address() {
        let mut config = Config::default();
        config.node.bind_address = "127.0.0.1:20001".parse().unwrap();
        assert_eq!(config.advertised_node_address(), "127.0.0.1:20001");

        config.node.advertised_address = Some("search-1:20001".to_string());
        assert_eq!(config.advertised_node_address(), "search-1:20001");
    }
}
