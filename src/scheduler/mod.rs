//! Job/task scheduling
//!
//! A scheduler instance owns a priority queue of jobs and a set of
//! in-flight tasks. On each tick it leases nodes from the resource
//! manager, dispatches RUN requests directly to the leased nodes, and
//! folds inbound status updates back into its bookkeeping.
//!
//! - [`manager`] - the JobManager: queue, running maps, scheduling tick
//! - [`client`] - resource manager client (GET/LEASE/RELEASE)
//! - [`server`] - job and task request listeners

pub mod client;
pub mod manager;
pub mod server;

pub use client::ResourceClient;
pub use manager::{JobManager, SchedulerStats};
pub use server::{SchedulerError, SchedulerHandle, SchedulerServer};
