use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub broker: BrokerConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    pub user: String,
    pub password: String,
    /// Requested heartbeat interval, 0 disables heartbeats
    #[serde(default)]
    pub heartbeat_secs: u16,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
}

fn default_vhost() -> String {
    "/".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_rpc_timeout_ms() -> u64 {
    5000
}

impl BrokerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub retry_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Drop a staged record after it was replayed this many times.
    /// Unbounded when absent.
    #[serde(default)]
    pub max_replays: Option<u32>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            retry_backoff_ms: 100,
            max_backoff_ms: 10_000,
            max_replays: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    pub sqlite_cache_size: i32,
    pub sqlite_busy_timeout: i32,
    #[serde(default = "default_synchronous")]
    pub synchronous: String,
}

fn default_synchronous() -> String {
    "FULL".to_string()
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()?;

        settings.try_deserialize()
    }
}
