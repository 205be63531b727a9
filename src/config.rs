//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::api::ApiConfig;
use crate::device::SimulatedCube;
use crate::hub::HubConfig;
use crate::relay::RelayConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// WebSocket server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8765
}

fn default_max_sessions() -> usize {
    1000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_sessions: default_max_sessions(),
        }
    }
}

/// Device side configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_battery_timeout")]
    pub battery_timeout_ms: u64,

    #[serde(default = "default_scan_timeout")]
    pub scan_timeout_ms: u64,

    /// Position notification interval of simulated cubes
    #[serde(default = "default_notify_interval")]
    pub notify_interval_ms: u64,

    /// Ids of the simulated cubes
    #[serde(default = "default_simulated")]
    pub simulated: Vec<String>,
}

fn default_battery_timeout() -> u64 {
    5000
}

fn default_scan_timeout() -> u64 {
    10_000
}

fn default_notify_interval() -> u64 {
    100
}

fn default_simulated() -> Vec<String> {
    vec!["A1".to_string(), "B2".to_string(), "C3".to_string()]
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            battery_timeout_ms: default_battery_timeout(),
            scan_timeout_ms: default_scan_timeout(),
            notify_interval_ms: default_notify_interval(),
            simulated: default_simulated(),
        }
    }
}

impl DeviceConfig {
    /// Virtual cubes for the simulated transport
    ///
    /// Battery levels are spread so cubes are told apart in a battery query.
    pub fn simulated_cubes(&self) -> Vec<SimulatedCube> {
        self.simulated
            .iter()
            .enumerate()
            .map(|(i, id)| SimulatedCube::new(id.clone(), 100u8.saturating_sub((i as u8 % 10) * 7)))
            .collect()
    }

    pub fn notify_interval(&self) -> Duration {
        Duration::from_millis(self.notify_interval_ms.max(1))
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
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
        }
    }
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
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("swarm-relay").join("config.toml")),
            Some(PathBuf::from("/etc/swarm-relay/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                match Self::load_with_env(path) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup
    ///
    /// Values that fail to parse are ignored.
    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        // Server overrides
        if let Some(host) = var("SWARM_RELAY_HOST") {
            self.server.host = host;
        }
        if let Some(port) = var("SWARM_RELAY_PORT").and_then(|s| s.parse().ok()) {
            self.server.port = port;
        }
        if let Some(max) = var("SWARM_RELAY_MAX_SESSIONS").and_then(|s| s.parse().ok()) {
            self.server.max_sessions = max;
        }

        // Device overrides
        if let Some(ms) = var("SWARM_RELAY_BATTERY_TIMEOUT_MS").and_then(|s| s.parse().ok()) {
            self.device.battery_timeout_ms = ms;
        }
        if let Some(ids) = var("SWARM_RELAY_SIM_DEVICES") {
            self.device.simulated = ids
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect();
        }

        // Logging overrides
        if let Some(level) = var("SWARM_RELAY_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("SWARM_RELAY_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Relay settings derived from this config
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            battery_timeout: Duration::from_millis(self.device.battery_timeout_ms),
            scan_timeout: Duration::from_millis(self.device.scan_timeout_ms),
            hub: HubConfig {
                max_connections: self.server.max_sessions,
            },
        }
    }

    /// HTTP server settings derived from this config
    pub fn api_config(&self) -> ApiConfig {
        ApiConfig::new(self.server.host.clone(), self.server.port)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Swarm Relay Configuration
#
# Environment variables override these settings:
# - SWARM_RELAY_HOST
# - SWARM_RELAY_PORT
# - SWARM_RELAY_MAX_SESSIONS
# - SWARM_RELAY_BATTERY_TIMEOUT_MS
# - SWARM_RELAY_SIM_DEVICES (comma-separated)
# - SWARM_RELAY_LOG_LEVEL
# - SWARM_RELAY_LOG_FORMAT

[server]
# WebSocket server host
host = "0.0.0.0"

# WebSocket server port
port = 8765

# Sessions beyond this limit are rejected
max_sessions = 1000

[device]
# Upper bound on a battery read (ms)
battery_timeout_ms = 5000

# Upper bound on a device scan (ms)
scan_timeout_ms = 10000

# Position notification interval of simulated cubes (ms)
notify_interval_ms = 100

# Ids of the simulated cubes
simulated = ["A1", "B2", "C3"]

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}
