//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (RUSTLA_*)
//! - TOML configuration file (`$RUSTLA_CONFIG`, then the default paths)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors found after parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Host and port do not form a socket address.
    #[error("Invalid bind address {0}")]
    InvalidBindAddr(String),

    /// The redis backend was selected without a URL.
    #[error("store.backend = \"redis\" requires store.redis_url")]
    MissingRedisUrl,

    /// The heartbeat would close healthy connections.
    #[error("heartbeat.timeout_ms ({timeout_ms}) must exceed heartbeat.interval_ms ({interval_ms})")]
    HeartbeatTooShort {
        /// Configured ping interval.
        interval_ms: u64,
        /// Configured idle timeout.
        timeout_ms: u64,
    },
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Presence store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Multi-process configuration.
    #[serde(default)]
    pub cluster: ClusterConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections per process.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Ping interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Idle timeout in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

impl HeartbeatConfig {
    /// Ping interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Idle timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Presence store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local maps.
    #[default]
    Memory,
    /// Shared Redis instance.
    Redis,
}

/// Presence store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend to use.
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,

    /// Redis URL for the redis backend.
    #[serde(default = "default_redis_url")]
    pub redis_url: Option<String>,

    /// Key prefix for the redis backend.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

/// Role of this process in a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// One process, no relay.
    #[default]
    Standalone,
    /// Relay hub; holds no viewer sockets.
    Coordinator,
    /// Viewer-facing process linked to a coordinator.
    Worker,
}

/// Multi-process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Role of this process.
    #[serde(default = "default_role")]
    pub role: Role,

    /// Address the coordinator listens on and workers connect to.
    #[serde(default = "default_coordinator_addr")]
    pub coordinator_addr: String,

    /// Name of this process on the relay; generated when absent.
    #[serde(default)]
    pub node_id: Option<String>,
}

// Default value functions
fn default_host() -> String {
    std::env::var("RUSTLA_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("RUSTLA_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(9998)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/stream".to_string()
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_message_size() -> usize {
    16 * 1024 // 16 KB
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_heartbeat_timeout() -> u64 {
    90_000 // 90 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_store_backend() -> StoreBackend {
    match std::env::var("RUSTLA_STORE").as_deref() {
        Ok("redis") => StoreBackend::Redis,
        _ => StoreBackend::Memory,
    }
}

fn default_redis_url() -> Option<String> {
    std::env::var("RUSTLA_REDIS_URL").ok()
}

fn default_key_prefix() -> String {
    "rustla".to_string()
}

fn default_role() -> Role {
    match std::env::var("RUSTLA_ROLE").as_deref() {
        Ok("coordinator") => Role::Coordinator,
        Ok("worker") => Role::Worker,
        _ => Role::Standalone,
    }
}

fn default_coordinator_addr() -> String {
    std::env::var("RUSTLA_COORDINATOR").unwrap_or_else(|_| "127.0.0.1:7400".to_string())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
            store: StoreConfig::default(),
            cluster: ClusterConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            role: default_role(),
            coordinator_addr: default_coordinator_addr(),
            node_id: None,
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed, or
    /// if the result is inconsistent.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var("RUSTLA_CONFIG") {
            let expanded = shellexpand::tilde(&path);
            return Self::from_file(expanded.as_ref());
        }

        let config_paths = [
            "rustla.toml",
            "/etc/rustla/rustla.toml",
            "~/.config/rustla/rustla.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        let config = Self::default();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        Ok(config)
    }

    /// Check settings that depend on each other.
    ///
    /// # Errors
    ///
    /// Returns the first inconsistency found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_addr()?;

        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_none() {
            return Err(ConfigError::MissingRedisUrl);
        }

        if self.heartbeat.timeout_ms <= self.heartbeat.interval_ms {
            return Err(ConfigError::HeartbeatTooShort {
                interval_ms: self.heartbeat.interval_ms,
                timeout_ms: self.heartbeat.timeout_ms,
            });
        }

        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not parse as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.parse().map_err(|_| ConfigError::InvalidBindAddr(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.transport.websocket_path, "/stream");
        assert_eq!(config.store.key_prefix, "rustla");
        assert!(config.heartbeat.timeout() > config.heartbeat.interval());
    }

    #[test]
    fn test_config_bind_addr() {
        let mut config = Config::default();
        config.host = "127.0.0.1".to_string();
        config.port = 8080;
        assert_eq!(config.bind_addr().unwrap().port(), 8080);

        config.host = "not a host".to_string();
        assert!(matches!(
            config.bind_addr(),
            Err(ConfigError::InvalidBindAddr(_))
        ));
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [limits]
            max_connections = 50000

            [store]
            backend = "redis"
            redis_url = "redis://127.0.0.1:6379"

            [cluster]
            role = "worker"
            coordinator_addr = "10.0.0.1:7400"
            node_id = "worker-1"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.limits.max_connections, 50000);
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.cluster.role, Role::Worker);
        assert_eq!(config.cluster.node_id.as_deref(), Some("worker-1"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_redis_backend_requires_url() {
        let toml_str = r#"
            [store]
            backend = "redis"
            redis_url = "redis://localhost"
        "#;
        let mut config: Config = toml::from_str(toml_str).unwrap();
        config.store.redis_url = None;

        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRedisUrl)
        ));
    }

    #[test]
    fn test_heartbeat_must_outlast_interval() {
        let toml_str = r#"
            [heartbeat]
            interval_ms = 10000
            timeout_ms = 5000
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();

        assert!(matches!(
            config.validate(),
            Err(ConfigError::HeartbeatTooShort { .. })
        ));
    }
}
