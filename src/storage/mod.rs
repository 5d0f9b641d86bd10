//! Durable node-fact storage
//!
//! Deployments may optionally record the last known facts about a node
//! (bandwidth, latency, coordinates, last-online) when the liveness monitor
//! evicts it or it signs off. The registry talks to storage through the
//! [`NodeStore`] trait; [`SqliteNodeStore`] is the bundled implementation.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::registry::NodeRecord;

// ============================================================================
// Store Trait
// ============================================================================

/// Last-known link quality for a returning node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkStats {
    pub bandwidth: f64,
    pub latency: f64,
}

/// Key-value persistence for node facts.
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Upsert the node's current facts.
    async fn record_node(&self, record: &NodeRecord) -> Result<(), StoreError>;

    /// Fetch the last recorded bandwidth/latency for a node id and kind,
    /// if it has been seen before.
    async fn load_link_stats(&self, id: &str, kind: &str) -> Result<Option<LinkStats>, StoreError>;
}

// ============================================================================
// SQLite Store
// ============================================================================

/// SQLite-backed node store. A single `node` table keyed by (id, type).
pub struct SqliteNodeStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteNodeStore {
    /// Open (or create) the database at `path` and ensure the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|e| StoreError::Open(e.to_string()))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store, handy for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Open(e.to_string()))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS node (
                id         TEXT NOT NULL,
                type       TEXT NOT NULL,
                ip         TEXT NOT NULL,
                latitude   REAL NOT NULL,
                longitude  REAL NOT NULL,
                bandwidth  REAL NOT NULL,
                latency    REAL NOT NULL,
                online     INTEGER NOT NULL,
                PRIMARY KEY (id, type)
            );",
        )
        .map_err(|e| StoreError::Query(e.to_string()))
    }
}

#[async_trait]
impl NodeStore for SqliteNodeStore {
    async fn record_node(&self, record: &NodeRecord) -> Result<(), StoreError> {
        let conn = self.conn.clone();
        let id = record.id.clone();
        let kind = record.kind.to_string();
        let ip = record.ip.clone();
        let (latitude, longitude) = (record.latitude, record.longitude);
        let bandwidth = record.mean_bandwidth();
        let latency = record.mean_latency();
        let online = record.last_heartbeat.timestamp_millis();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|_| StoreError::Poisoned)?;
            conn.execute(
                "INSERT INTO node (id, type, ip, latitude, longitude, bandwidth, latency, online)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT (id, type) DO UPDATE SET
                     ip = excluded.ip,
                     latitude = excluded.latitude,
                     longitude = excluded.longitude,
                     bandwidth = excluded.bandwidth,
                     latency = excluded.latency,
                     online = excluded.online",
                params![id, kind, ip, latitude, longitude, bandwidth, latency, online],
            )
            .map_err(|e| StoreError::Query(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?
    }

    async fn load_link_stats(&self, id: &str, kind: &str) -> Result<Option<LinkStats>, StoreError> {
        let conn = self.conn.clone();
        let id = id.to_string();
        let kind = kind.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|_| StoreError::Poisoned)?;
            conn.query_row(
                "SELECT bandwidth, latency FROM node WHERE id = ?1 AND type = ?2",
                params![id, kind],
                |row| {
                    Ok(LinkStats {
                        bandwidth: row.get(0)?,
                        latency: row.get(1)?,
                    })
                },
            )
            .optional()
            .map_err(|e| StoreError::Query(e.to_string()))
        })
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Storage errors
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Failed to open the database
    Open(String),

    /// Query failed
    Query(String),

    /// Connection mutex poisoned
    Poisoned,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open(msg) => write!(f, "Failed to open node store: {msg}"),
            Self::Query(msg) => write!(f, "Node store query failed: {msg}"),
            Self::Poisoned => write!(f, "Node store connection poisoned"),
        }
    }
}

impl std::error::Error for StoreError {}

// ============================================================================
// Tests
// ============================================================================
