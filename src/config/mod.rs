//! Configuration management for the nephele services
//!
//! This module handles loading and validating configuration from environment
//! variables, TOML files, and command-line arguments. Ports are role-specific
//! and fixed per deployment; they are a config concern, not a protocol one.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Geospatial grid index configuration
    pub grid: GridConfig,

    /// Resource manager (broker) configuration
    pub broker: BrokerConfig,

    /// Job scheduler configuration
    pub scheduler: SchedulerConfig,

    /// Node agent configuration
    pub agent: AgentConfig,

    /// Durable node-fact storage configuration
    pub storage: StorageConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Grid index bounds and resolution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    /// Cells per axis
    pub k: usize,

    pub min_latitude: f64,
    pub max_latitude: f64,
    pub min_longitude: f64,
    pub max_longitude: f64,
}

impl GridConfig {
    /// Build the index described by this config.
    pub fn build(&self) -> crate::grid::GridIndex {
        crate::grid::GridIndex::new(
            self.k,
            self.min_latitude,
            self.max_latitude,
            self.min_longitude,
            self.max_longitude,
        )
    }
}

/// Resource manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Bind address for node heartbeats
    pub node_bind: String,

    /// Bind address for scheduler requests
    pub scheduler_bind: String,

    /// Heartbeat staleness threshold in milliseconds
    pub max_inactive_ms: u64,

    /// Monitor sweep interval in milliseconds
    pub sweep_interval_ms: u64,

    /// Lease overrun tolerance for in-use nodes, in milliseconds
    pub grace_ms: u64,

    /// Maximum concurrent connection handlers per listener
    pub pool_size: usize,

    /// Socket read/write timeout in milliseconds
    pub io_timeout_ms: u64,
}

impl BrokerConfig {
    pub fn max_inactive(&self) -> Duration {
        Duration::from_millis(self.max_inactive_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Scheduler identity sent with every LEASE/RELEASE
    pub name: String,

    /// Job kind this scheduler instance accepts (MOBILE, STREAM, MAPREDUCE)
    pub kind: String,

    /// Resource manager scheduler-port address
    pub resource_manager_addr: String,

    /// Bind address for job SUBMIT/CANCEL requests
    pub job_bind: String,

    /// Bind address for task UPDATE/CANCEL requests
    pub task_bind: String,

    /// Scheduling tick interval in milliseconds
    pub tick_interval_ms: u64,

    /// Lease duration requested per node, in milliseconds
    pub lease_ms: u64,

    /// Lease overrun tolerance for nodes running a task, in milliseconds
    pub grace_ms: u64,

    /// Maximum concurrent connection handlers per listener
    pub pool_size: usize,

    /// Socket read/write timeout in milliseconds
    pub io_timeout_ms: u64,
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

/// Node agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Stable node identity; generated when absent
    pub id: Option<String>,

    /// Advertised IP for task dispatch
    pub ip: String,

    /// Bind address for task RUN/CANCEL requests
    pub task_bind: String,

    /// Resource manager node-port address
    pub broker_addr: String,

    /// Scheduler task-port address for batched status reports
    pub scheduler_addr: String,

    pub latitude: f64,
    pub longitude: f64,

    /// Node kind (COMPUTE, STORAGE, MOBILE)
    pub kind: String,

    /// Heartbeat interval in milliseconds
    pub heartbeat_ms: u64,

    /// Status report interval in milliseconds
    pub report_ms: u64,

    /// Socket read/write timeout in milliseconds
    pub io_timeout_ms: u64,
}

impl AgentConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Record node facts durably on eviction/sign-off
    pub enabled: bool,

    /// SQLite database path
    pub sqlite_path: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(k) = env_parse::<usize>("NEPHELE_GRID_K") {
            config.grid.k = k;
        }
        if let Ok(bind) = std::env::var("NEPHELE_NODE_BIND") {
            config.broker.node_bind = bind;
        }
        if let Ok(bind) = std::env::var("NEPHELE_SCHEDULER_BIND") {
            config.broker.scheduler_bind = bind;
        }
        if let Some(ms) = env_parse::<u64>("NEPHELE_MAX_INACTIVE_MS") {
            config.broker.max_inactive_ms = ms;
        }
        if let Some(ms) = env_parse::<u64>("NEPHELE_GRACE_MS") {
            config.broker.grace_ms = ms;
            config.scheduler.grace_ms = ms;
        }
        if let Ok(name) = std::env::var("NEPHELE_SCHEDULER_NAME") {
            config.scheduler.name = name;
        }
        if let Ok(addr) = std::env::var("NEPHELE_RESOURCE_MANAGER_ADDR") {
            config.scheduler.resource_manager_addr = addr;
        }
        if let Some(ms) = env_parse::<u64>("NEPHELE_LEASE_MS") {
            config.scheduler.lease_ms = ms;
        }
        if let Ok(path) = std::env::var("NEPHELE_SQLITE_PATH") {
            config.storage.sqlite_path = path.into();
            config.storage.enabled = true;
        }
        if let Ok(level) = std::env::var("NEPHELE_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(format) = std::env::var("NEPHELE_LOG_FORMAT") {
            config.logging.format = format;
        }

        Ok(config)
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.grid.k == 0 {
            anyhow::bail!("grid.k must be greater than 0");
        }
        if self.grid.min_latitude >= self.grid.max_latitude {
            anyhow::bail!("grid latitude bounds are inverted or empty");
        }
        if self.grid.min_longitude >= self.grid.max_longitude {
            anyhow::bail!("grid longitude bounds are inverted or empty");
        }
        if self.broker.max_inactive_ms == 0 {
            anyhow::bail!("broker.max_inactive_ms must be greater than 0");
        }
        if self.broker.pool_size == 0 || self.scheduler.pool_size == 0 {
            anyhow::bail!("pool_size must be greater than 0");
        }
        if self.scheduler.lease_ms == 0 {
            anyhow::bail!("scheduler.lease_ms must be greater than 0");
        }
        if self.scheduler.name.is_empty() {
            anyhow::bail!("scheduler.name must not be empty");
        }

        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            grid: GridConfig {
                k: 16,
                min_latitude: -90.0,
                max_latitude: 90.0,
                min_longitude: -180.0,
                max_longitude: 180.0,
            },
            broker: BrokerConfig {
                node_bind: String::from("0.0.0.0:6424"),
                scheduler_bind: String::from("0.0.0.0:6426"),
                max_inactive_ms: 5_000,
                sweep_interval_ms: 3_000,
                grace_ms: 20_000,
                pool_size: 50,
                io_timeout_ms: 2_000,
            },
            scheduler: SchedulerConfig {
                name: String::from("MOBILE"),
                kind: String::from("MOBILE"),
                resource_manager_addr: String::from("127.0.0.1:6426"),
                job_bind: String::from("0.0.0.0:6420"),
                task_bind: String::from("0.0.0.0:6421"),
                tick_interval_ms: 2_000,
                lease_ms: 60_000,
                grace_ms: 20_000,
                pool_size: 20,
                io_timeout_ms: 2_000,
            },
            agent: AgentConfig {
                id: None,
                ip: String::from("127.0.0.1"),
                task_bind: String::from("0.0.0.0:2021"),
                broker_addr: String::from("127.0.0.1:6424"),
                scheduler_addr: String::from("127.0.0.1:6421"),
                latitude: 0.0,
                longitude: 0.0,
                kind: String::from("COMPUTE"),
                heartbeat_ms: 3_000,
                report_ms: 2_000,
                io_timeout_ms: 2_000,
            },
            storage: StorageConfig {
                enabled: false,
                sqlite_path: PathBuf::from("data/nodes.db"),
            },
            logging: LoggingConfig {
                level: String::from("info"),
                format: String::from("text"),
            },
        }
    }
}
