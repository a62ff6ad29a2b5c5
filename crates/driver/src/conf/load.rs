//! Load — config loading from file and environment variables.

use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{error, info};

use super::model::DriverConfig;
use super::options::ConfigError;

pub const ENV_CONFIG_FILE: &str = "LOGZIO_DRIVER_CONFIG_FILE";
pub const ENV_LOGS_DRAIN_TIMEOUT: &str = "LOGZIO_DRIVER_LOGS_DRAIN_TIMEOUT";
pub const ENV_CHANNEL_SIZE: &str = "LOGZIO_DRIVER_CHANNEL_SIZE";
pub const ENV_DISK_THRESHOLD: &str = "LOGZIO_DRIVER_DISK_THRESHOLD";
pub const ENV_MAX_MSG_BUFFER_SIZE: &str = "LOGZIO_MAX_MSG_BUFFER_SIZE";
pub const ENV_PARTIAL_BUFFER_DURATION: &str = "LOGZIO_MAX_PARTIAL_BUFFER_DURATION";
pub const ENV_SWEEP_INTERVAL: &str = "LOGZIO_DRIVER_SWEEP_INTERVAL";
pub const ENV_SOCKET: &str = "LOGZIO_DRIVER_SOCKET";
pub const ENV_LOG_ROOT: &str = "LOGZIO_DRIVER_LOG_ROOT";
pub const ENV_RETAINED_STORES: &str = "LOGZIO_DRIVER_RETAINED_STORES";

impl DriverConfig {
    /// Load configuration from file or environment variables
    /// Priority: Environment Variables > Config File > Defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = std::env::var(ENV_CONFIG_FILE)
            .unwrap_or_else(|_| "/etc/logzio/driver.toml".to_string());

        let config = if Path::new(&config_path).exists() {
            info!("Loading configuration from: {}", config_path);
            Self::from_file(&config_path)?
        } else {
            info!("Config file not found at {}, using environment variables", config_path);
            Self::default()
        };

        let config = config.with_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: DriverConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup. Unparseable values keep
    /// the current setting and are logged.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        self.drain_timeout = duration_or(&lookup, ENV_LOGS_DRAIN_TIMEOUT, self.drain_timeout);
        self.channel_size = parse_or(&lookup, ENV_CHANNEL_SIZE, self.channel_size);
        self.disk_threshold = parse_or(&lookup, ENV_DISK_THRESHOLD, self.disk_threshold);
        self.max_msg_buffer_size = parse_or(&lookup, ENV_MAX_MSG_BUFFER_SIZE, self.max_msg_buffer_size);
        self.partial_timeout = duration_or(&lookup, ENV_PARTIAL_BUFFER_DURATION, self.partial_timeout);
        self.sweep_interval = duration_or(&lookup, ENV_SWEEP_INTERVAL, self.sweep_interval);
        self.retained_stores = parse_or(&lookup, ENV_RETAINED_STORES, self.retained_stores);
        if let Some(socket) = lookup(ENV_SOCKET) {
            self.socket_path = socket;
        }
        if let Some(root) = lookup(ENV_LOG_ROOT) {
            self.log_root = root;
        }
        self
    }

    /// Validate that configuration values are sane
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel_size == 0 {
            return Err(ConfigError::Invalid("channel_size must be > 0".to_string()));
        }
        if self.max_msg_buffer_size == 0 {
            return Err(ConfigError::Invalid("max_msg_buffer_size must be > 0".to_string()));
        }
        if self.disk_threshold == 0 || self.disk_threshold > 100 {
            return Err(ConfigError::Invalid("disk_threshold must be within 1..=100".to_string()));
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::Invalid("sweep_interval must be > 0".to_string()));
        }
        if self.socket_path.is_empty() {
            return Err(ConfigError::Invalid("socket_path must not be empty".to_string()));
        }
        Ok(())
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Display,
    T::Err: Display,
{
    match lookup(key) {
        None => default,
        Some(raw) if raw.is_empty() => default,
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(e) => {
                error!("Error parsing {} value {:?}: {}", key, raw, e);
                info!("Using default {} {}", key, default);
                default
            }
        },
    }
}

fn duration_or<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => default,
        Some(raw) if raw.is_empty() => default,
        Some(raw) => match humantime::parse_duration(raw.trim()) {
            Ok(value) => value,
            Err(e) => {
                error!("Error parsing {} duration {:?}: {}", key, raw, e);
                info!("Using default {} {:?}", key, default);
                default
            }
        },
    }
}
