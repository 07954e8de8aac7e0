/// Configuration management for portero
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::auth::Credential;
use crate::proxy::ProxyOptions;

pub use crate::error::ConfigError;

/// Main portero configuration, loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Addresses and per-client limits
    pub proxy: ProxySection,
    /// Upstream pool sizing
    pub pool: PoolSection,
    /// Exchange and idle deadlines
    pub timeouts: TimeoutSection,
    /// Optional upstream credentials (handshake source is `admin`)
    pub auth: Option<AuthSection>,
    /// Logging configuration
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySection {
    /// Address to listen on for client connections
    pub listen_addr: String,
    /// Address of the destination MongoDB server
    pub mongo_addr: String,
    /// Concurrent connections allowed per client IP
    pub max_per_client_connections: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSection {
    /// Upstream pool capacity
    pub max_connections: usize,
    /// Idle upstreams to keep warm
    pub min_idle_connections: usize,
    /// Evict idle upstreams older than this, in seconds
    pub server_idle_timeout_sec: u64,
    /// Concurrency used when draining the pool
    pub server_close_pool_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSection {
    /// Deadline over one forwarded exchange, in milliseconds
    pub message_timeout_ms: u64,
    /// Idle wait for the next client message, in seconds
    pub client_idle_timeout_sec: u64,
    /// Wait for the sticky getLastError follow-up, in milliseconds
    pub get_last_error_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthSection {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy: ProxySection {
                listen_addr: "127.0.0.1:27111".to_string(),
                mongo_addr: "127.0.0.1:27017".to_string(),
                max_per_client_connections: 64,
            },
            pool: PoolSection {
                max_connections: 100,
                min_idle_connections: 5,
                server_idle_timeout_sec: 3600,
                server_close_pool_size: 8,
            },
            timeouts: TimeoutSection {
                message_timeout_ms: 120_000,
                client_idle_timeout_sec: 3600,
                get_last_error_timeout_ms: 150,
            },
            auth: None,
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content =
            fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Write an example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        Config::default().save_to_file(path)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.proxy.listen_addr.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "listen_addr cannot be empty".to_string(),
            ));
        }
        if self.proxy.mongo_addr.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "mongo_addr cannot be empty".to_string(),
            ));
        }
        if self.proxy.max_per_client_connections == 0 {
            return Err(ConfigError::ValidationError(
                "max_per_client_connections must be greater than 0".to_string(),
            ));
        }
        if self.pool.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "max_connections must be greater than 0".to_string(),
            ));
        }
        if self.pool.min_idle_connections > self.pool.max_connections {
            return Err(ConfigError::ValidationError(
                "min_idle_connections cannot exceed max_connections".to_string(),
            ));
        }
        if self.pool.server_idle_timeout_sec == 0 {
            return Err(ConfigError::ValidationError(
                "server_idle_timeout_sec must be greater than 0".to_string(),
            ));
        }
        if self.timeouts.message_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "message_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.timeouts.client_idle_timeout_sec == 0 {
            return Err(ConfigError::ValidationError(
                "client_idle_timeout_sec must be greater than 0".to_string(),
            ));
        }
        if self.timeouts.get_last_error_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "get_last_error_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if let Some(auth) = &self.auth {
            if auth.username.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "auth.username cannot be empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Build the immutable runtime options the proxy starts with.
    pub fn to_proxy_options(&self) -> ProxyOptions {
        ProxyOptions {
            proxy_addr: self.proxy.listen_addr.clone(),
            mongo_addr: self.proxy.mongo_addr.clone(),
            max_connections: self.pool.max_connections,
            max_per_client_connections: self.proxy.max_per_client_connections,
            min_idle_connections: self.pool.min_idle_connections,
            server_idle_timeout: Duration::from_secs(self.pool.server_idle_timeout_sec),
            server_close_pool_size: self.pool.server_close_pool_size,
            message_timeout: Duration::from_millis(self.timeouts.message_timeout_ms),
            client_idle_timeout: Duration::from_secs(self.timeouts.client_idle_timeout_sec),
            get_last_error_timeout: Duration::from_millis(
                self.timeouts.get_last_error_timeout_ms,
            ),
            credentials: self
                .auth
                .as_ref()
                .map(|a| Credential::new(a.username.clone(), a.password.clone())),
        }
    }
}
