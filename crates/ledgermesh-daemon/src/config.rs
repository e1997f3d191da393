//! Daemon configuration, loaded from a TOML file with full defaults.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use ledgermesh_core::retry::Retry;

/// Failures loading the daemon configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file '{path}'")]
    Io {
        /// The config file path.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("failed to parse config file '{path}'")]
    Parse {
        /// The config file path.
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub database: DatabaseConfig,
    pub http: HttpConfig,
    pub content_store: ContentStoreConfig,
    pub aggregator: AggregatorConfig,
    pub poller: PollerConfig,
    pub websockets: WebSocketConfig,
}

impl DaemonConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Persistence gateway settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Path of the `SQLite` database file.
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("ledgermesh.db"),
        }
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpConfig {
    /// Address the WebSocket upgrade endpoint listens on.
    pub listen: SocketAddr,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: ([127, 0, 0, 1], 5104).into(),
        }
    }
}

/// Local content-address store settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContentStoreConfig {
    /// Directory payload refs resolve under.
    pub path: PathBuf,
}

impl Default for ContentStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("content"),
        }
    }
}

/// Backoff policy for batch ingestion retries.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AggregatorConfig {
    pub retry_initial_delay_ms: u64,
    pub retry_maximum_delay_ms: u64,
    pub retry_factor: f64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            retry_initial_delay_ms: 100,
            retry_maximum_delay_ms: 30_000,
            retry_factor: 2.0,
        }
    }
}

impl AggregatorConfig {
    /// The retry engine this policy configures.
    #[must_use]
    pub fn retry(&self) -> Retry {
        Retry {
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            maximum_delay: Duration::from_millis(self.retry_maximum_delay_ms),
            factor: self.retry_factor,
        }
    }
}

/// Event poller tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollerConfig {
    /// Maximum events read per scan.
    pub batch_size: u64,
    /// Idle rescan interval in milliseconds.
    pub tick_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            tick_ms: 250,
        }
    }
}

impl PollerConfig {
    #[must_use]
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

/// WebSocket transport tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WebSocketConfig {
    /// Outbound frames buffered per connection before deliveries are
    /// refused with backpressure.
    pub send_queue_length: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            send_queue_length: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_sections() {
        let config: DaemonConfig = toml::from_str("").unwrap();
        assert_eq!(config.poller.batch_size, 50);
        assert_eq!(config.aggregator.retry_factor, 2.0);
        assert_eq!(config.websockets.send_queue_length, 64);
    }

    #[test]
    fn partial_overrides_keep_other_defaults() {
        let config: DaemonConfig = toml::from_str(
            r#"
            [poller]
            batch_size = 10

            [aggregator]
            retry_initial_delay_ms = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.poller.batch_size, 10);
        assert_eq!(config.poller.tick_ms, 250);
        assert_eq!(config.aggregator.retry().initial_delay.as_millis(), 5);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<DaemonConfig>("[poller]\nbogus = 1\n").is_err());
    }
}
