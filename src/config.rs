use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Environment variable naming an optional JSON config file
pub const CONFIG_PATH_VAR: &str = "TICKER_SYNC_CONFIG";

const ENV_PREFIX: &str = "TICKER_SYNC_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {message}")]
    Read { path: String, message: String },

    #[error("Invalid config file {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub broker: BrokerConfig,
    pub room: RoomConfig,
    pub storage: StorageConfig,
    pub cache: CacheConfig,
}

/// Where and how to reach the MQTT broker
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Bound on queued outgoing requests per session
    pub request_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            request_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RoomConfig {
    /// Room topics are `<topic_prefix>/<room name>`
    pub topic_prefix: String,
    /// Events buffered per room subscriber before it lags
    pub event_capacity: usize,
    pub keep_alive_secs: u64,
    /// Reconnect rooms whose session ended without being asked to
    pub auto_reconnect: bool,
    /// First reconnect delay; doubles per failed attempt
    pub reconnect_min_ms: u64,
    pub reconnect_max_ms: u64,
}

impl RoomConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "ticker-sync/rooms".to_string(),
            event_capacity: 256,
            keep_alive_secs: 30,
            auto_reconnect: true,
            reconnect_min_ms: 1_000,
            reconnect_max_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub database_url: String,
    pub store_name: String,
    pub max_connections: u32,
    pub event_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://ticker-sync.db".to_string(),
            store_name: "app-state".to_string(),
            max_connections: 4,
            event_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Maximum number of cached values
    pub limit: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { limit: 128 }
    }
}

impl SyncConfig {
    /// Loads configuration from the process environment
    ///
    /// Starts from defaults, then the JSON file named by `TICKER_SYNC_CONFIG`
    /// if set, then individual `TICKER_SYNC_*` overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = std::env::vars()
            .filter(|(name, _)| name.starts_with(ENV_PREFIX))
            .collect();
        Self::from_vars(&vars)
    }

    /// Same as [`from_env`](Self::from_env) over an explicit variable map
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = match vars.get(CONFIG_PATH_VAR) {
            Some(path) => Self::from_file(Path::new(path))?,
            None => Self::default(),
        };
        config.apply_overrides(vars)?;
        debug!(?config.room, ?config.storage, "Configuration loaded");
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let path_str = path.display().to_string();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path_str.clone(),
            message: e.to_string(),
        })?;
        let config = serde_json::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path_str.clone(),
            message: e.to_string(),
        })?;
        info!(path = %path_str, "Loaded config file");
        Ok(config)
    }

    fn apply_overrides(&mut self, vars: &HashMap<String, String>) -> Result<(), ConfigError> {
        let get = |suffix: &str| vars.get(&format!("{}{}", ENV_PREFIX, suffix)).cloned();

        if let Some(host) = get("BROKER_HOST") {
            self.broker.host = host;
        }
        if let Some(port) = get("BROKER_PORT") {
            self.broker.port = parse("BROKER_PORT", &port)?;
        }
        if let Some(username) = get("BROKER_USERNAME") {
            self.broker.username = Some(username);
        }
        if let Some(password) = get("BROKER_PASSWORD") {
            self.broker.password = Some(password);
        }
        if let Some(prefix) = get("TOPIC_PREFIX") {
            self.room.topic_prefix = prefix;
        }
        if let Some(keep_alive) = get("KEEP_ALIVE_SECS") {
            self.room.keep_alive_secs = parse("KEEP_ALIVE_SECS", &keep_alive)?;
        }
        if let Some(enabled) = get("AUTO_RECONNECT") {
            self.room.auto_reconnect = parse("AUTO_RECONNECT", &enabled)?;
        }
        if let Some(url) = get("DATABASE_URL") {
            self.storage.database_url = url;
        }
        if let Some(store) = get("STORE_NAME") {
            self.storage.store_name = store;
        }
        if let Some(limit) = get("CACHE_LIMIT") {
            self.cache.limit = parse("CACHE_LIMIT", &limit)?;
        }
        Ok(())
    }
}

fn parse<T>(suffix: &str, raw: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            var: format!("{}{}", ENV_PREFIX, suffix),
            message: e.to_string(),
        })
}
