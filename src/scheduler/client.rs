//! Resource manager client
//!
//! The scheduler's side of the leasing protocol: GET the annotated node
//! list, LEASE a set of nodes, RELEASE nodes it no longer needs. Every
//! call is one fresh connection, bounded by a timeout; a timeout is
//! treated the same as connection-refused.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::lease::Lease;
use crate::protocol::{self, ProtocolError, SchedulerRequest};
use crate::registry::NodeRecord;

/// Client for the resource manager's scheduler port.
#[derive(Debug, Clone)]
pub struct ResourceClient {
    /// Scheduler identity sent with every request.
    pub scheduler: String,

    addr: String,
    timeout: Duration,
}

impl ResourceClient {
    pub fn new(scheduler: impl Into<String>, addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            scheduler: scheduler.into(),
            addr: addr.into(),
            timeout,
        }
    }

    /// All known node records, `note` annotated with lease status.
    pub async fn get_nodes(&self) -> Result<HashMap<String, NodeRecord>, ProtocolError> {
        let request = SchedulerRequest::Get {
            scheduler: self.scheduler.clone(),
        };
        protocol::call(&self.addr, self.timeout, &request).await
    }

    /// Lease nodes; returns the granted subset. Partial grants are normal
    /// and the caller must reconcile against the returned map.
    pub async fn lease(&self, leases: HashMap<String, Lease>) -> Result<HashMap<String, Lease>, ProtocolError> {
        if leases.is_empty() {
            return Ok(HashMap::new());
        }
        let request = SchedulerRequest::Lease {
            scheduler: self.scheduler.clone(),
            leases,
        };
        protocol::call(&self.addr, self.timeout, &request).await
    }

    /// Best-effort release of nodes held by this scheduler.
    pub async fn release(&self, nodes: HashSet<String>) -> Result<bool, ProtocolError> {
        if nodes.is_empty() {
            return Ok(true);
        }
        let request = SchedulerRequest::Release {
            scheduler: self.scheduler.clone(),
            nodes,
        };
        protocol::call(&self.addr, self.timeout, &request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_lease_skips_network() {
        // no resource manager is listening on this address
        let client = ResourceClient::new("S", "127.0.0.1:1", Duration::from_millis(100));
        assert!(client.lease(HashMap::new()).await.unwrap().is_empty());
        assert!(client.release(HashSet::new()).await.unwrap());
    }

    #[tokio::test]
    async fn test_unreachable_manager_is_transient() {
        let client = ResourceClient::new("S", "127.0.0.1:1", Duration::from_millis(100));
        let err = client.get_nodes().await.unwrap_err();
        assert!(err.is_transient());
    }
}
