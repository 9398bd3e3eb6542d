//! Configuration management

use crate::address::RemoteAddress;
use crate::tunnel::{TunnelOptions, TunnelSpec};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Worker pool configuration
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Timeouts shared by every tunnel
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Tunnels to run
    #[serde(default)]
    pub tunnels: Vec<TunnelConfig>,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, crate::Error> {
        toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Tunnel specs with their options, validated
    pub fn tunnel_specs(&self) -> Result<Vec<(TunnelSpec, TunnelOptions)>, crate::Error> {
        self.tunnels
            .iter()
            .map(|tunnel| Ok((tunnel.spec()?, tunnel.options(&self.timeouts))))
            .collect()
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker threads of the dedicated tunnel pool
    pub worker_threads: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self { worker_threads: 4 }
    }
}

/// Timeouts in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Bound on one accept attempt
    pub accept_ms: u64,
    /// Bound on one read attempt
    pub read_ms: u64,
    /// Bound on one write attempt
    pub write_ms: u64,
    /// Remote connect timeout (direct transport)
    pub connect_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        let io_ms = crate::DEFAULT_IO_TIMEOUT.as_millis() as u64;
        Self {
            accept_ms: io_ms,
            read_ms: io_ms,
            write_ms: io_ms,
            connect_ms: 10_000,
        }
    }
}

/// One tunnel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Local port to listen on
    pub local_port: u16,
    /// Remote endpoint, e.g. "10.0.0.5:22" or "db.internal:5432"
    pub remote: String,
    /// Local bind address (localhost if unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind: Option<IpAddr>,
    /// Maximum concurrent connections (unlimited if unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,
}

impl TunnelConfig {
    /// Parse the remote endpoint into a spec
    pub fn spec(&self) -> Result<TunnelSpec, crate::Error> {
        let remote: RemoteAddress = self.remote.parse()?;
        Ok(TunnelSpec::new(self.local_port, remote))
    }

    /// Listener options for this tunnel
    pub fn options(&self, timeouts: &TimeoutConfig) -> TunnelOptions {
        let defaults = TunnelOptions::default();
        TunnelOptions {
            bind_host: self.bind.unwrap_or(defaults.bind_host),
            accept_timeout: Duration::from_millis(timeouts.accept_ms),
            read_timeout: Duration::from_millis(timeouts.read_ms),
            write_timeout: Duration::from_millis(timeouts.write_ms),
            max_connections: self.max_connections,
            ..defaults
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        runtime: RuntimeConfig::default(),
        timeouts: TimeoutConfig::default(),
        logging: LoggingConfig::default(),
        tunnels: vec![TunnelConfig {
            local_port: 9000,
            remote: "10.0.0.5:22".to_string(),
            bind: None,
            max_connections: Some(256),
        }],
    }
}
