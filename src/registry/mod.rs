//! Node liveness registry
//!
//! Tracks the set of currently-online nodes, keyed by ONLINE/OFFLINE
//! heartbeats, and mirrors every insertion and removal into the geospatial
//! grid index. A background monitor evicts nodes whose heartbeat is older
//! than the configured timeout; with durable storage enabled, the final
//! known facts of an evicted node are persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::grid::GridIndex;
use crate::storage::NodeStore;

/// Current wire-format version for [`NodeRecord`].
pub const NODE_RECORD_VERSION: u32 = 1;

/// Bound on the rolling bandwidth/latency sample windows.
const MAX_SAMPLES: usize = 10;

// ============================================================================
// Node Kind
// ============================================================================

/// What a node offers to the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeKind {
    Compute,
    Storage,
    Mobile,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Compute => write!(f, "COMPUTE"),
            Self::Storage => write!(f, "STORAGE"),
            Self::Mobile => write!(f, "MOBILE"),
        }
    }
}

impl std::str::FromStr for NodeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "COMPUTE" => Ok(Self::Compute),
            "STORAGE" => Ok(Self::Storage),
            "MOBILE" => Ok(Self::Mobile),
            other => Err(format!("unknown node kind: {other}")),
        }
    }
}

// ============================================================================
// Rolling Window
// ============================================================================

/// Bounded window of link-quality observations. Non-positive samples are
/// ignored; the mean is -1 while the window is empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RollingWindow {
    samples: VecDeque<f64>,
}

impl RollingWindow {
    pub fn push(&mut self, sample: f64) {
        if sample <= 0.0 {
            return;
        }
        if self.samples.len() >= MAX_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return -1.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

// ============================================================================
// Node Record
// ============================================================================

/// Compute capacity advertised by a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeResources {
    pub num_cpus: u32,
}

/// Everything the platform knows about one node.
///
/// Owned exclusively by the [`NodeRegistry`]; the grid index holds only the
/// id and coordinate. The free-form `note` is filled in when records are
/// serialized toward a scheduler ("available" or remaining-lease-millis).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Wire format version.
    #[serde(default = "default_version")]
    pub v: u32,

    pub id: String,
    pub ip: String,
    /// Port the node accepts task RUN/CANCEL requests on.
    pub port: u16,
    pub latitude: f64,
    pub longitude: f64,
    pub kind: NodeKind,

    #[serde(default)]
    pub bandwidth: RollingWindow,
    #[serde(default)]
    pub latency: RollingWindow,

    pub last_heartbeat: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<NodeResources>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

fn default_version() -> u32 {
    NODE_RECORD_VERSION
}

impl NodeRecord {
    pub fn new(id: impl Into<String>, ip: impl Into<String>, port: u16, latitude: f64, longitude: f64, kind: NodeKind) -> Self {
        Self {
            v: NODE_RECORD_VERSION,
            id: id.into(),
            ip: ip.into(),
            port,
            latitude,
            longitude,
            kind,
            bandwidth: RollingWindow::default(),
            latency: RollingWindow::default(),
            last_heartbeat: Utc::now(),
            resources: None,
            note: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_heartbeat = Utc::now();
    }

    pub fn add_bandwidth(&mut self, sample: f64) {
        self.bandwidth.push(sample);
    }

    pub fn add_latency(&mut self, sample: f64) {
        self.latency.push(sample);
    }

    pub fn mean_bandwidth(&self) -> f64 {
        self.bandwidth.mean()
    }

    pub fn mean_latency(&self) -> f64 {
        self.latency.mean()
    }

    /// `"ip:port"` of the node's task endpoint.
    pub fn task_addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Age of the last heartbeat in milliseconds.
    pub fn heartbeat_age_ms(&self) -> i64 {
        (Utc::now() - self.last_heartbeat).num_milliseconds()
    }
}

// ============================================================================
// Node Registry
// ============================================================================

struct RegistryInner {
    nodes: HashMap<String, NodeRecord>,
    grid: GridIndex,
}

/// Registry of online nodes plus the grid index that mirrors them.
pub struct NodeRegistry {
    inner: RwLock<RegistryInner>,
    max_inactive: Duration,
    store: Option<Arc<dyn NodeStore>>,
}

impl NodeRegistry {
    pub fn new(grid: GridIndex, max_inactive: Duration) -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                nodes: HashMap::new(),
                grid,
            }),
            max_inactive,
            store: None,
        }
    }

    /// Enable durable recording of node facts.
    pub fn with_store(mut self, store: Arc<dyn NodeStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Handle an ONLINE heartbeat.
    ///
    /// A new id is inserted into both the registry and the grid; a known id
    /// gets its timestamp refreshed and fresh link samples folded into its
    /// rolling windows.
    pub async fn heartbeat_online(&self, mut incoming: NodeRecord) -> bool {
        let is_new = {
            let mut inner = self.inner.write().await;
            match inner.nodes.get_mut(&incoming.id) {
                Some(known) => {
                    known.touch();
                    let bw = incoming.mean_bandwidth();
                    if bw > 0.0 {
                        known.add_bandwidth(bw);
                    }
                    let lt = incoming.mean_latency();
                    if lt > 0.0 {
                        known.add_latency(lt);
                    }
                    false
                }
                None => {
                    incoming.touch();
                    incoming.note = None;
                    inner.grid.insert(&incoming.id, incoming.latitude, incoming.longitude);
                    inner.nodes.insert(incoming.id.clone(), incoming.clone());
                    true
                }
            }
        };

        // a returning node regains its last recorded link stats
        if is_new {
            if let Some(store) = &self.store {
                match store.load_link_stats(&incoming.id, &incoming.kind.to_string()).await {
                    Ok(Some(stats)) => {
                        let mut inner = self.inner.write().await;
                        if let Some(record) = inner.nodes.get_mut(&incoming.id) {
                            record.add_bandwidth(stats.bandwidth);
                            record.add_latency(stats.latency);
                        }
                    }
                    Ok(None) => {
                        if let Err(e) = store.record_node(&incoming).await {
                            tracing::warn!(node_id = %incoming.id, error = %e, "failed persisting new node");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(node_id = %incoming.id, error = %e, "failed loading node link stats");
                    }
                }
            }
            tracing::info!(node_id = %incoming.id, kind = %incoming.kind, "node joined");
        }
        true
    }

    /// Handle an OFFLINE heartbeat: remove the node from the registry and
    /// the grid. Returns the removed record, or `None` for an unknown id.
    pub async fn heartbeat_offline(&self, id: &str) -> Option<NodeRecord> {
        let removed = {
            let mut inner = self.inner.write().await;
            let removed = inner.nodes.remove(id);
            if let Some(record) = &removed {
                inner.grid.remove(id, record.latitude, record.longitude);
            }
            removed
        };

        if let Some(record) = &removed {
            tracing::info!(node_id = %record.id, "node signed off");
            if let Some(store) = &self.store {
                if let Err(e) = store.record_node(record).await {
                    tracing::warn!(node_id = %record.id, error = %e, "failed persisting leaving node");
                }
            }
        }
        removed
    }

    /// Copy of all currently known records.
    pub async fn snapshot(&self) -> HashMap<String, NodeRecord> {
        self.inner.read().await.nodes.clone()
    }

    /// One record by id.
    pub async fn get(&self, id: &str) -> Option<NodeRecord> {
        self.inner.read().await.nodes.get(id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.inner.read().await.nodes.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.nodes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.nodes.is_empty()
    }

    /// Node ids in the 3x3 grid neighborhood around a coordinate.
    pub async fn neighbors_of(&self, latitude: f64, longitude: f64) -> Vec<String> {
        let inner = self.inner.read().await;
        match inner.grid.locate(latitude, longitude) {
            Some(cell_id) => inner.grid.neighbors(&cell_id),
            None => Vec::new(),
        }
    }

    /// Node ids in one grid cell.
    pub async fn nodes_in_cell(&self, cell_id: &str) -> Vec<String> {
        self.inner.read().await.grid.items_in(cell_id)
    }

    /// Evict every node whose heartbeat is older than `max_inactive`,
    /// removing it from both the registry and the grid. Returns the
    /// evicted records.
    pub async fn evict_stale(&self) -> Vec<NodeRecord> {
        let max_ms = self.max_inactive.as_millis() as i64;
        let mut evicted = Vec::new();
        {
            let mut inner = self.inner.write().await;
            let stale: Vec<String> = inner
                .nodes
                .values()
                .filter(|r| r.heartbeat_age_ms() > max_ms)
                .map(|r| r.id.clone())
                .collect();

            for id in stale {
                if let Some(record) = inner.nodes.remove(&id) {
                    inner.grid.remove(&id, record.latitude, record.longitude);
                    evicted.push(record);
                }
            }
        }

        if let Some(store) = &self.store {
            for record in &evicted {
                if let Err(e) = store.record_node(record).await {
                    tracing::warn!(node_id = %record.id, error = %e, "failed persisting evicted node");
                }
            }
        }
        evicted
    }

    /// Spawn the periodic liveness sweep.
    pub fn start_liveness_monitor(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let evicted = self.evict_stale().await;
                if !evicted.is_empty() {
                    tracing::info!(
                        count = evicted.len(),
                        nodes = ?evicted.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
                        "evicted inactive nodes"
                    );
                }
                let active = self.len().await;
                tracing::debug!(active, "liveness sweep complete");
            }
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
