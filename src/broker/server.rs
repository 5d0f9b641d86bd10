//! Broker server implementation
//!
//! Each inbound connection carries exactly one request line and one
//! response line. Handlers run on the tokio pool, bounded by a semaphore;
//! shared maps are only locked around the mutation itself, never across
//! socket I/O. A malformed request gets a negative reply and never takes
//! the accept loop down.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

use crate::config::BrokerConfig;
use crate::grid::GridIndex;
use crate::lease::LeaseManager;
use crate::protocol::{self, NodeRequest, SchedulerRequest};
use crate::registry::{NodeRecord, NodeRegistry};
use crate::storage::NodeStore;

// ============================================================================
// Resource Broker
// ============================================================================

/// The resource manager service: registry + lease table + two listeners.
pub struct ResourceBroker {
    registry: Arc<NodeRegistry>,
    leases: Arc<LeaseManager>,
    config: BrokerConfig,
}

/// Handle to a running broker. Aborts its background tasks on drop.
pub struct BrokerHandle {
    /// Address nodes send heartbeats to.
    pub node_addr: SocketAddr,
    /// Address schedulers lease and release through.
    pub scheduler_addr: SocketAddr,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl BrokerHandle {
    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for BrokerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ResourceBroker {
    pub fn new(grid: GridIndex, config: BrokerConfig) -> Self {
        Self::with_parts(grid, config, None)
    }

    /// Broker with durable recording of node facts on eviction and sign-off.
    pub fn with_store(grid: GridIndex, config: BrokerConfig, store: Arc<dyn NodeStore>) -> Self {
        Self::with_parts(grid, config, Some(store))
    }

    fn with_parts(grid: GridIndex, config: BrokerConfig, store: Option<Arc<dyn NodeStore>>) -> Self {
        let mut registry = NodeRegistry::new(grid, config.max_inactive());
        if let Some(store) = store {
            registry = registry.with_store(store);
        }
        Self {
            registry: Arc::new(registry),
            leases: Arc::new(LeaseManager::new(config.grace())),
            config,
        }
    }

    /// Bind both listeners and spawn the accept loops and monitors.
    pub async fn start(&self) -> Result<BrokerHandle, BrokerError> {
        let node_listener = TcpListener::bind(&self.config.node_bind)
            .await
            .map_err(|e| BrokerError::Bind(format!("{}: {e}", self.config.node_bind)))?;
        let scheduler_listener = TcpListener::bind(&self.config.scheduler_bind)
            .await
            .map_err(|e| BrokerError::Bind(format!("{}: {e}", self.config.scheduler_bind)))?;

        let node_addr = node_listener.local_addr().map_err(|e| BrokerError::Bind(e.to_string()))?;
        let scheduler_addr = scheduler_listener
            .local_addr()
            .map_err(|e| BrokerError::Bind(e.to_string()))?;

        tracing::info!(%node_addr, %scheduler_addr, "resource manager listening");

        let io_timeout = self.config.io_timeout();
        let mut tasks = Vec::new();

        // node heartbeat listener
        {
            let registry = self.registry.clone();
            let leases = self.leases.clone();
            let pool = Arc::new(Semaphore::new(self.config.pool_size));
            tasks.push(tokio::spawn(async move {
                loop {
                    let (stream, peer) = match node_listener.accept().await {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!(error = %e, "node listener accept failed");
                            continue;
                        }
                    };
                    let permit = match pool.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    let registry = registry.clone();
                    let leases = leases.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        handle_node_connection(stream, peer, registry, leases, io_timeout).await;
                    });
                }
            }));
        }

        // scheduler listener
        {
            let registry = self.registry.clone();
            let leases = self.leases.clone();
            let pool = Arc::new(Semaphore::new(self.config.pool_size));
            tasks.push(tokio::spawn(async move {
                loop {
                    let (stream, peer) = match scheduler_listener.accept().await {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!(error = %e, "scheduler listener accept failed");
                            continue;
                        }
                    };
                    let permit = match pool.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    let registry = registry.clone();
                    let leases = leases.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        handle_scheduler_connection(stream, peer, registry, leases, io_timeout).await;
                    });
                }
            }));
        }

        // liveness sweep for stale nodes
        tasks.push(
            self.registry
                .clone()
                .start_liveness_monitor(self.config.sweep_interval()),
        );

        // lease reclamation. The broker has no task visibility, so every
        // lease counts as idle here; the owning scheduler's own monitor
        // applies the in-use grace period and releases earlier.
        tasks.push(
            self.leases
                .clone()
                .start_monitor(self.config.sweep_interval(), HashSet::new, |_reclaimed| {}),
        );

        Ok(BrokerHandle {
            node_addr,
            scheduler_addr,
            tasks,
        })
    }
}

// ============================================================================
// Connection Handlers
// ============================================================================

async fn handle_node_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<NodeRegistry>,
    leases: Arc<LeaseManager>,
    io_timeout: Duration,
) {
    let request: NodeRequest = match protocol::recv(&mut stream, io_timeout).await {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(%peer, error = %e, "bad node request");
            let _ = protocol::send(&mut stream, io_timeout, &false).await;
            return;
        }
    };

    let result = match request {
        NodeRequest::Online { node } => {
            let ok = registry.heartbeat_online(node).await;
            protocol::send(&mut stream, io_timeout, &ok).await
        }
        NodeRequest::Offline { node } => {
            // unknown ids are a tolerated no-op
            registry.heartbeat_offline(&node.id).await;
            protocol::send(&mut stream, io_timeout, &true).await
        }
        NodeRequest::Get => {
            let nodes = annotated_nodes(&registry, &leases).await;
            protocol::send(&mut stream, io_timeout, &nodes).await
        }
    };

    if let Err(e) = result {
        tracing::debug!(%peer, error = %e, "failed replying to node");
    }
}

async fn handle_scheduler_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<NodeRegistry>,
    leases: Arc<LeaseManager>,
    io_timeout: Duration,
) {
    let request: SchedulerRequest = match protocol::recv(&mut stream, io_timeout).await {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(%peer, error = %e, "bad scheduler request");
            let _ = protocol::send(&mut stream, io_timeout, &false).await;
            return;
        }
    };

    let result = match request {
        SchedulerRequest::Get { scheduler } => {
            tracing::debug!(%scheduler, "node status request");
            let nodes = annotated_nodes(&registry, &leases).await;
            protocol::send(&mut stream, io_timeout, &nodes).await
        }
        SchedulerRequest::Lease { scheduler, leases: requested } => {
            let mut granted = HashMap::new();
            for (node_id, mut lease) in requested {
                // the connection-level identity is authoritative
                lease.scheduler = scheduler.clone();
                if !registry.contains(&node_id).await {
                    continue;
                }
                if leases.grant(&scheduler, &node_id, lease.clone()).await {
                    granted.insert(node_id, lease);
                }
            }
            tracing::info!(
                %scheduler,
                granted = ?granted.keys().collect::<Vec<_>>(),
                "lease request"
            );
            protocol::send(&mut stream, io_timeout, &granted).await
        }
        SchedulerRequest::Release { scheduler, nodes } => {
            let mut released = Vec::new();
            for node_id in &nodes {
                if leases.release(&scheduler, node_id).await {
                    released.push(node_id.clone());
                }
            }
            tracing::info!(%scheduler, ?released, "release request");
            // best-effort hint: always acknowledged
            protocol::send(&mut stream, io_timeout, &true).await
        }
    };

    if let Err(e) = result {
        tracing::debug!(%peer, error = %e, "failed replying to scheduler");
    }
}

/// Snapshot of all nodes with `note` carrying the lease status: "available"
/// for an unleased node, remaining-lease-millis otherwise.
async fn annotated_nodes(registry: &NodeRegistry, leases: &LeaseManager) -> HashMap<String, NodeRecord> {
    let mut nodes = registry.snapshot().await;
    let table = leases.snapshot().await;
    for (id, record) in nodes.iter_mut() {
        record.note = Some(match table.get(id) {
            Some(lease) => lease.remaining_ms().to_string(),
            None => "available".to_string(),
        });
    }
    nodes
}

// ============================================================================
// Broker Errors
// ============================================================================

/// Broker errors
#[derive(Debug, Clone)]
pub enum BrokerError {
    /// Failed to bind a listener
    Bind(String),
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bind(msg) => write!(f, "Failed to bind: {msg}"),
        }
    }
}

impl std::error::Error for BrokerError {}
