//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (HUBBUB_*)
//! - TOML configuration file

use anyhow::{ensure, Context, Result};
use hubbub_core::{HubConfig, PumpConfig, RateLimitConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Prefix for the chat routes.
    #[serde(default = "default_base_path")]
    pub base_path: String,

    /// Nickname fragments that may not be posted.
    #[serde(default = "default_banned_nicknames")]
    pub banned_nicknames: Vec<String>,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Hub queues and backpressure.
    #[serde(default)]
    pub hub: HubSection,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Admin login.
    #[serde(default)]
    pub admin: AdminConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for the WebSocket endpoint, relative to `base_path`.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Maximum inbound WebSocket message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Concurrent streaming connections allowed per client address.
    #[serde(default = "default_max_connections_per_ip")]
    pub max_connections_per_ip: usize,

    /// Inbound frames a connection may send in a burst.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,

    /// Sustained inbound frames per second.
    #[serde(default = "default_rate_limit_per_second")]
    pub rate_limit_per_second: f64,
}

/// Hub configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSection {
    /// Capacity of each of the hub's control queues.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Per-connection outbound queue capacity.
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,

    /// How long a broadcast waits on one full outbound queue before evicting
    /// that connection. Zero waits forever.
    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,

    /// Rebroadcast valid events received from peers.
    #[serde(default)]
    pub relay_inbound: bool,
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

    /// Per-write deadline in milliseconds.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
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

/// Admin configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Hex SHA-256 digest of the admin password. Login is disabled without it.
    #[serde(default = "default_admin_digest")]
    pub password_sha256: Option<String>,
}

// Default value functions
fn default_host() -> String {
    std::env::var("HUBBUB_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("HUBBUB_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_base_path() -> String {
    std::env::var("HUBBUB_BASE_PATH").unwrap_or_else(|_| "/chat".to_string())
}

fn default_banned_nicknames() -> Vec<String> {
    std::env::var("HUBBUB_BANNED_NICKNAMES")
        .map(|list| parse_list(&list))
        .unwrap_or_default()
}

fn default_admin_digest() -> Option<String> {
    std::env::var("HUBBUB_ADMIN_PASSWORD_SHA256")
        .ok()
        .filter(|d| !d.is_empty())
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_max_connections_per_ip() -> usize {
    hubbub_core::admission::DEFAULT_MAX_CONNECTIONS_PER_ADDRESS
}

fn default_rate_limit_burst() -> u32 {
    5
}

fn default_rate_limit_per_second() -> f64 {
    1.0
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_outbound_capacity() -> usize {
    hubbub_core::connection::DEFAULT_OUTBOUND_CAPACITY
}

fn default_send_timeout() -> u64 {
    2_000 // 2 seconds
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_heartbeat_timeout() -> u64 {
    60_000 // 60 seconds
}

fn default_write_timeout() -> u64 {
    10_000 // 10 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

/// Split a comma separated list, dropping empty entries.
fn parse_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            base_path: default_base_path(),
            banned_nicknames: default_banned_nicknames(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            hub: HubSection::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
            admin: AdminConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections_per_ip: default_max_connections_per_ip(),
            rate_limit_burst: default_rate_limit_burst(),
            rate_limit_per_second: default_rate_limit_per_second(),
        }
    }
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            outbound_capacity: default_outbound_capacity(),
            send_timeout_ms: default_send_timeout(),
            relay_inbound: false,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
            write_timeout_ms: default_write_timeout(),
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

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            password_sha256: default_admin_digest(),
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed, or if
    /// the resulting configuration is invalid.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "hubbub.toml",
            "/etc/hubbub/hubbub.toml",
            "~/.config/hubbub/hubbub.toml",
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
    /// Returns an error if the file cannot be read, parsed or validated.
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

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.heartbeat.interval_ms < self.heartbeat.timeout_ms,
            "heartbeat.interval_ms ({}) must be shorter than heartbeat.timeout_ms ({})",
            self.heartbeat.interval_ms,
            self.heartbeat.timeout_ms
        );
        ensure!(self.heartbeat.interval_ms > 0, "heartbeat.interval_ms must be positive");
        ensure!(self.hub.queue_capacity > 0, "hub.queue_capacity must be positive");
        ensure!(self.hub.outbound_capacity > 0, "hub.outbound_capacity must be positive");
        ensure!(
            self.limits.rate_limit_per_second >= 0.0,
            "limits.rate_limit_per_second must not be negative"
        );
        ensure!(
            self.base_path.is_empty() || self.base_path.starts_with('/'),
            "base_path must start with '/'"
        );
        ensure!(
            self.transport.websocket_path.starts_with('/'),
            "transport.websocket_path must start with '/'"
        );
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }

    /// Base path without a trailing slash.
    #[must_use]
    pub fn base(&self) -> &str {
        self.base_path.trim_end_matches('/')
    }

    /// Hub settings.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            queue_capacity: self.hub.queue_capacity,
            outbound_capacity: self.hub.outbound_capacity,
            send_timeout: match self.hub.send_timeout_ms {
                0 => None,
                ms => Some(Duration::from_millis(ms)),
            },
        }
    }

    /// Per-connection pump settings.
    #[must_use]
    pub fn pump_config(&self) -> PumpConfig {
        PumpConfig {
            idle_timeout: Duration::from_millis(self.heartbeat.timeout_ms),
            ping_interval: Duration::from_millis(self.heartbeat.interval_ms),
            write_timeout: Duration::from_millis(self.heartbeat.write_timeout_ms),
            relay_inbound: self.hub.relay_inbound,
        }
    }

    /// Per-connection inbound rate.
    #[must_use]
    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            burst: self.limits.rate_limit_burst,
            per_second: self.limits.rate_limit_per_second,
        }
    }
}
