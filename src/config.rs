//! WolfGraph Configuration
//!
//! This module provides configuration structures for a highly available
//! WolfGraph node: identity, coordination, replication tuning and the
//! local store.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::ha::BranchedDataPolicy;

/// Default port the master protocol listens on
pub const DEFAULT_HA_PORT: u16 = 6361;

/// Default port of the online backup endpoint
pub const DEFAULT_BACKUP_PORT: u16 = 6362;

/// Default cluster name used as the coordination root
pub const DEFAULT_CLUSTER_NAME: &str = "wolfgraph.ha";

/// Main WolfGraph configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WolfGraphConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// High availability configuration
    pub ha: HaConfig,

    /// Local store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique, non-negative machine id within the cluster
    pub server_id: i32,

    /// Store directory
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// How a slave publishes its last committed transaction to the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SlaveUpdateMode {
    /// Publish from a background reporter task
    #[default]
    Async,
    /// Publish inline after every applied response
    Sync,
    /// Never publish
    None,
}

/// High availability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaConfig {
    /// Coordination service endpoints (host:port)
    #[serde(default)]
    pub coordinators: Vec<String>,

    /// Address the master protocol binds to
    #[serde(default = "default_ha_server")]
    pub server: String,

    /// Address other members use to reach this node (defaults to `server`)
    #[serde(default)]
    pub advertise_address: Option<String>,

    /// Cluster name, used as the coordination root
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,

    /// Fixed delay between background update pulls (0 = disabled)
    #[serde(default)]
    pub pull_interval_ms: u64,

    /// Whether this node may create a new cluster when none is found
    #[serde(default = "default_true")]
    pub allow_init_cluster: bool,

    /// Concurrent requests served per slave
    #[serde(default = "default_max_channels")]
    pub max_concurrent_channels_per_slave: usize,

    /// What to do with a local store that diverged from the master
    #[serde(default)]
    pub branched_data_policy: BranchedDataPolicy,

    /// Response timeout for master requests in seconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    /// Response timeout for lock requests in seconds
    #[serde(default = "default_lock_read_timeout")]
    pub lock_read_timeout_secs: u64,

    /// Coordination session timeout in milliseconds
    #[serde(default = "default_coordinator_timeout")]
    pub coordinator_timeout_ms: u64,

    /// How slaves publish their committed transaction
    #[serde(default)]
    pub slave_coordinator_update_mode: SlaveUpdateMode,

    /// Online backup port (0 = disabled)
    #[serde(default = "default_backup_port")]
    pub backup_port: u16,

    /// Time window for joining or initializing a cluster at startup
    #[serde(default = "default_join_timeout")]
    pub join_timeout_secs: u64,

    /// Store copy attempts before giving up
    #[serde(default = "default_copy_attempts")]
    pub copy_store_attempts: u32,

    /// Fixed delay between store copy attempts
    #[serde(default = "default_copy_retry_interval")]
    pub copy_store_retry_interval_ms: u64,
}

/// Local store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Enable LZ4 compression for transaction bodies
    #[serde(default = "default_true")]
    pub compression: bool,

    /// Use fsync for durability (slower but safer)
    #[serde(default = "default_true")]
    pub fsync: bool,

    /// Lock acquisition timeout in seconds
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/wolfgraph")
}

fn default_ha_server() -> String {
    format!("0.0.0.0:{}", DEFAULT_HA_PORT)
}

fn default_cluster_name() -> String {
    DEFAULT_CLUSTER_NAME.to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_channels() -> usize {
    20
}

fn default_read_timeout() -> u64 {
    20
}

fn default_lock_read_timeout() -> u64 {
    40
}

fn default_coordinator_timeout() -> u64 {
    5000
}

fn default_backup_port() -> u16 {
    DEFAULT_BACKUP_PORT
}

fn default_join_timeout() -> u64 {
    60
}

fn default_copy_attempts() -> u32 {
    60
}

fn default_copy_retry_interval() -> u64 {
    1000
}

fn default_lock_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for HaConfig {
    fn default() -> Self {
        Self {
            coordinators: Vec::new(),
            server: default_ha_server(),
            advertise_address: None,
            cluster_name: default_cluster_name(),
            pull_interval_ms: 0,
            allow_init_cluster: true,
            max_concurrent_channels_per_slave: default_max_channels(),
            branched_data_policy: BranchedDataPolicy::default(),
            read_timeout_secs: default_read_timeout(),
            lock_read_timeout_secs: default_lock_read_timeout(),
            coordinator_timeout_ms: default_coordinator_timeout(),
            slave_coordinator_update_mode: SlaveUpdateMode::default(),
            backup_port: default_backup_port(),
            join_timeout_secs: default_join_timeout(),
            copy_store_attempts: default_copy_attempts(),
            copy_store_retry_interval_ms: default_copy_retry_interval(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            compression: true,
            fsync: true,
            lock_timeout_secs: default_lock_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl WolfGraphConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: WolfGraphConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: WolfGraphConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.server_id < 0 {
            return Err(crate::Error::Config(format!(
                "node.server_id needs to be a non-negative integer, not {}",
                self.node.server_id
            )));
        }

        if self.ha.coordinators.is_empty() {
            return Err(crate::Error::Config(
                "ha.coordinators needs to specify at least one server".into(),
            ));
        }

        for coordinator in &self.ha.coordinators {
            if !coordinator.contains(':') {
                return Err(crate::Error::Config(format!(
                    "Invalid coordinator \"{}\" in ha.coordinators",
                    coordinator
                )));
            }
        }

        if !self.ha.server.contains(':') {
            return Err(crate::Error::Config(format!(
                "ha.server must be host:port, not \"{}\"",
                self.ha.server
            )));
        }

        if self.ha.cluster_name.is_empty() || self.ha.cluster_name.contains('/') {
            return Err(crate::Error::Config(
                "ha.cluster_name must be non-empty and must not contain '/'".into(),
            ));
        }

        if self.ha.max_concurrent_channels_per_slave == 0 {
            return Err(crate::Error::Config(
                "ha.max_concurrent_channels_per_slave must be at least 1".into(),
            ));
        }

        if self.ha.copy_store_attempts == 0 {
            return Err(crate::Error::Config(
                "ha.copy_store_attempts must be at least 1".into(),
            ));
        }

        Ok(())
    }

    /// Get the advertised master address (or the bind address if not set)
    pub fn advertise_address(&self) -> &str {
        self.ha
            .advertise_address
            .as_deref()
            .unwrap_or(&self.ha.server)
    }

    /// Get the bind address of the backup endpoint, if enabled
    pub fn backup_address(&self) -> Option<String> {
        if self.ha.backup_port == 0 {
            return None;
        }
        let host = self
            .ha
            .server
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or("0.0.0.0");
        Some(format!("{}:{}", host, self.ha.backup_port))
    }

    /// Get the store directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Get the pull interval, if the background puller is enabled
    pub fn pull_interval(&self) -> Option<Duration> {
        match self.ha.pull_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Get the coordination session timeout as Duration
    pub fn coordinator_timeout(&self) -> Duration {
        Duration::from_millis(self.ha.coordinator_timeout_ms)
    }

    /// Get the master request timeout as Duration
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.ha.read_timeout_secs)
    }

    /// Get the lock request timeout as Duration
    pub fn lock_read_timeout(&self) -> Duration {
        Duration::from_secs(self.ha.lock_read_timeout_secs)
    }

    /// Get the startup join window as Duration
    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.ha.join_timeout_secs)
    }

    /// Get the delay between store copy attempts as Duration
    pub fn copy_store_retry_interval(&self) -> Duration {
        Duration::from_millis(self.ha.copy_store_retry_interval_ms)
    }

    /// Get the master-side lock timeout as Duration
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.store.lock_timeout_secs)
    }
}
