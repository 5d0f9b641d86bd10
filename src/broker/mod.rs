//! Resource Manager service
//!
//! The network-facing broker composing the node registry and the lease
//! manager. It runs two TCP listeners: one for node heartbeats (ONLINE,
//! OFFLINE, GET) and one for scheduler requests (GET, LEASE, RELEASE),
//! plus the background liveness and lease-reclamation monitors.

mod server;

pub use server::{BrokerError, BrokerHandle, ResourceBroker};
