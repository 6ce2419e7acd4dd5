//! Server configuration.
//!
//! Loaded from a TOML file; every field has a default so a missing or partial
//! file still yields a runnable configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::rate_limiter::RateLimiterConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the session gateway binds. Port 0 picks a free port.
    pub listen_addr: String,

    /// Path to the SQLite database file.
    pub db_path: PathBuf,

    /// Outbound event queue depth per session. When a slow consumer's queue
    /// fills, it is disconnected and must refetch through the read path.
    pub event_queue_depth: usize,

    /// Maximum concurrent connections; further connections are refused.
    pub max_connections: usize,

    /// Per-connection rate limiting.
    pub rate_limiter: RateLimiterConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:4650".to_string(),
            db_path: default_db_path(),
            event_queue_depth: 256,
            max_connections: 64,
            rate_limiter: RateLimiterConfig::default(),
        }
    }
}

/// Default database location: `<data_dir>/dealgrid/dealgrid.db`, falling back
/// to the working directory when the platform has no data dir.
pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("dealgrid/dealgrid.db"))
        .unwrap_or_else(|| PathBuf::from("dealgrid.db"))
}

/// Error loading a configuration file.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "could not read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "could not parse config file: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl ServerConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&contents).map_err(ConfigError::Parse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.listen_addr, "127.0.0.1:4650");
        assert_eq!(config.event_queue_depth, 256);
        assert_eq!(config.max_connections, 64);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: ServerConfig = toml::from_str(
            r#"
            listen_addr = "0.0.0.0:9000"

            [rate_limiter]
            burst = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:9000");
        assert_eq!(config.rate_limiter.burst, 500);
        // Unspecified fields fall back
        assert_eq!(config.event_queue_depth, 256);
        assert_eq!(config.rate_limiter.per_sec, 50);
    }

    #[test]
    fn test_roundtrip() {
        let config = ServerConfig::default();
        let toml = toml::to_string(&config).unwrap();
        let parsed: ServerConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.listen_addr, config.listen_addr);
        assert_eq!(parsed.db_path, config.db_path);
    }
}
