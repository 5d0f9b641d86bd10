//! nephele - Edge/fog resource orchestration
//!
//! A resource-sharing platform for edge nodes: a resource manager tracks
//! node liveness and brokers exclusive leases, schedulers turn submitted
//! jobs into tasks dispatched onto leased nodes, and a node agent runs on
//! every participant.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration management and settings
//! - [`protocol`] - Line-delimited JSON wire protocol
//! - [`grid`] - Geospatial grid index over node coordinates
//! - [`registry`] - Node liveness registry
//! - [`lease`] - Exclusive node leases with grace-period reclamation
//! - [`broker`] - The resource manager service
//! - [`job`] - Job and task data model
//! - [`scheduler`] - Job manager, scheduling loop, and listeners
//! - [`agent`] - Node-side agent (heartbeats, task execution, reports)
//! - [`fetcher`] - Input staging over HTTP
//! - [`storage`] - Durable node-fact recording (SQLite)
//!
//! # Example
//!
//! ```no_run
//! use nephele::broker::ResourceBroker;
//! use nephele::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     config.validate()?;
//!     let broker = ResourceBroker::new(config.grid.build(), config.broker);
//!     let _handle = broker.start().await?;
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod broker;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod grid;
pub mod job;
pub mod lease;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod storage;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::agent::NodeAgent;
    pub use crate::broker::ResourceBroker;
    pub use crate::config::Config;
    pub use crate::error::{Error, ErrorCategory, Result};
    pub use crate::job::{Job, JobKind, Task, TaskStatus};
    pub use crate::registry::{NodeKind, NodeRecord};
    pub use crate::scheduler::{JobManager, SchedulerServer};
}

// Direct re-exports for convenience
pub use job::{Job, JobKind, Task, TaskStatus};
pub use registry::{NodeKind, NodeRecord};
