//! Time-bounded exclusive node leases
//!
//! A lease is a scheduler's claim on one node until an expiry instant. The
//! [`LeaseManager`] enforces single ownership (at most one active lease per
//! node) and re-entrancy (the holder may refresh or extend its own lease).
//! A periodic monitor reclaims expired leases, tolerating a bounded overrun
//! for nodes still running a task.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

// ============================================================================
// Lease
// ============================================================================

/// An exclusive, time-bounded claim by one scheduler on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Identity of the scheduler holding the claim.
    pub scheduler: String,

    /// Expiry instant, epoch milliseconds.
    pub expires_at_ms: i64,
}

impl Lease {
    /// Create a lease expiring `duration` from now.
    pub fn new(scheduler: impl Into<String>, duration: Duration) -> Self {
        Self {
            scheduler: scheduler.into(),
            expires_at_ms: Utc::now().timestamp_millis() + duration.as_millis() as i64,
        }
    }

    /// Milliseconds until expiry. Negative once the lease has lapsed;
    /// callers treat `<= 0` as expired.
    pub fn remaining_ms(&self) -> i64 {
        self.expires_at_ms - Utc::now().timestamp_millis()
    }

    /// Push the expiry further out.
    pub fn extend(&mut self, extra: Duration) -> i64 {
        self.expires_at_ms += extra.as_millis() as i64;
        self.expires_at_ms
    }

    /// Whether this lease belongs to the named scheduler.
    pub fn is_held_by(&self, scheduler: &str) -> bool {
        self.scheduler == scheduler
    }
}

// ============================================================================
// Lease Manager
// ============================================================================

/// Tracks which scheduler holds which node and until when.
///
/// Existence of the node itself is the registry's concern; the broker
/// checks it before granting. Releasing a node that is not leased (or that
/// no longer exists) is a no-op, not an error.
pub struct LeaseManager {
    leases: Mutex<HashMap<String, Lease>>,

    /// Non-positive millisecond offset: an in-use lease may overrun its
    /// expiry by up to `-grace_ms` before forced reclamation.
    grace_ms: i64,
}

impl LeaseManager {
    pub fn new(grace: Duration) -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
            grace_ms: -(grace.as_millis() as i64),
        }
    }

    /// The grace offset used by the monitor (non-positive).
    pub fn grace_ms(&self) -> i64 {
        self.grace_ms
    }

    /// Grant or refresh a lease.
    ///
    /// Denied (returns false) when the node is currently held by a
    /// different scheduler. The same scheduler re-leasing its own node
    /// succeeds and replaces the old expiry.
    pub async fn grant(&self, scheduler: &str, node_id: &str, lease: Lease) -> bool {
        let mut leases = self.leases.lock().await;

        if let Some(held) = leases.get(node_id) {
            if !held.is_held_by(scheduler) {
                tracing::debug!(node_id, holder = %held.scheduler, requester = scheduler, "lease denied: node busy");
                return false;
            }
        }

        leases.insert(node_id.to_string(), lease);
        true
    }

    /// Release a node if it is held by `scheduler`. Releasing an unleased
    /// or foreign-leased node returns false and changes nothing.
    pub async fn release(&self, scheduler: &str, node_id: &str) -> bool {
        let mut leases = self.leases.lock().await;
        match leases.get(node_id) {
            Some(held) if held.is_held_by(scheduler) => {
                leases.remove(node_id);
                true
            }
            _ => false,
        }
    }

    /// Remaining time for a node's lease. `None` if unleased.
    pub async fn remaining_ms(&self, node_id: &str) -> Option<i64> {
        self.leases.lock().await.get(node_id).map(Lease::remaining_ms)
    }

    /// The scheduler currently holding a node, if any.
    pub async fn holder(&self, node_id: &str) -> Option<String> {
        self.leases.lock().await.get(node_id).map(|l| l.scheduler.clone())
    }

    /// Extend a lease held by `scheduler`. Returns the new expiry, or
    /// `None` if the node is not held by that scheduler.
    pub async fn extend(&self, scheduler: &str, node_id: &str, extra: Duration) -> Option<i64> {
        let mut leases = self.leases.lock().await;
        match leases.get_mut(node_id) {
            Some(held) if held.is_held_by(scheduler) => Some(held.extend(extra)),
            _ => None,
        }
    }

    /// Copy of the full lease table.
    pub async fn snapshot(&self) -> HashMap<String, Lease> {
        self.leases.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.leases.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.leases.lock().await.is_empty()
    }

    /// Remove and return expired leases in one batch.
    ///
    /// Nodes in `in_use` (currently bound to a running task) are only
    /// reclaimed once `remaining <= grace_ms`; idle nodes are reclaimed as
    /// soon as `remaining <= 0`.
    pub async fn reclaim_expired(&self, in_use: &HashSet<String>) -> Vec<(String, Lease)> {
        let mut leases = self.leases.lock().await;
        let expired: Vec<String> = leases
            .iter()
            .filter(|(node_id, lease)| {
                let remaining = lease.remaining_ms();
                if in_use.contains(*node_id) {
                    remaining <= self.grace_ms
                } else {
                    remaining <= 0
                }
            })
            .map(|(node_id, _)| node_id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|node_id| leases.remove(&node_id).map(|lease| (node_id, lease)))
            .collect()
    }

    /// Spawn the periodic reclamation sweep.
    ///
    /// `in_use` yields the nodes currently bound to running tasks;
    /// `on_reclaim` receives each tick's batch (the broker drops them, a
    /// scheduler sends a RELEASE for them).
    pub fn start_monitor<U, F>(self: Arc<Self>, interval: Duration, in_use: U, on_reclaim: F) -> tokio::task::JoinHandle<()>
    where
        U: Fn() -> HashSet<String> + Send + 'static,
        F: Fn(Vec<(String, Lease)>) + Send + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let reclaimed = self.reclaim_expired(&in_use()).await;
                if !reclaimed.is_empty() {
                    tracing::info!(
                        count = reclaimed.len(),
                        nodes = ?reclaimed.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
                        "reclaimed expired leases"
                    );
                    on_reclaim(reclaimed);
                }
            }
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn lease_for(scheduler: &str, ms: i64) -> Lease {
        Lease {
            scheduler: scheduler.to_string(),
            expires_at_ms: Utc::now().timestamp_millis() + ms,
        }
    }

    #[tokio::test]
    async fn test_grant_and_deny() {
        let mgr = LeaseManager::new(Duration::from_secs(5));

        assert!(mgr.grant("S", "n1", lease_for("S", 10_000)).await);
        // another scheduler is denied
        assert!(!mgr.grant("T", "n1", lease_for("T", 5_000)).await);
        // holder can refresh
        assert!(mgr.grant("S", "n1", lease_for("S", 20_000)).await);
    }

    #[tokio::test]
    async fn test_release_ownership() {
        let mgr = LeaseManager::new(Duration::from_secs(5));
        mgr.grant("S", "n1", lease_for("S", 10_000)).await;

        assert!(!mgr.release("T", "n1").await);
        assert!(mgr.remaining_ms("n1").await.is_some());

        assert!(mgr.release("S", "n1").await);
        assert!(mgr.remaining_ms("n1").await.is_none());

        // releasing an unleased node is a no-op
        assert!(!mgr.release("S", "n1").await);
    }

    #[tokio::test]
    async fn test_release_then_other_scheduler_can_lease() {
        let mgr = LeaseManager::new(Duration::from_secs(5));
        mgr.grant("S", "n1", lease_for("S", 10_000)).await;
        mgr.release("S", "n1").await;
        assert!(mgr.grant("T", "n1", lease_for("T", 5_000)).await);
    }

    #[tokio::test]
    async fn test_extend_requires_holder() {
        let mgr = LeaseManager::new(Duration::from_secs(5));
        mgr.grant("S", "n1", lease_for("S", 1_000)).await;

        assert!(mgr.extend("T", "n1", Duration::from_secs(10)).await.is_none());
        let new_expiry = mgr.extend("S", "n1", Duration::from_secs(10)).await.unwrap();
        assert!(new_expiry > Utc::now().timestamp_millis() + 9_000);
    }

    #[tokio::test]
    async fn test_reclaim_idle_at_expiry() {
        let mgr = LeaseManager::new(Duration::from_secs(5));
        mgr.grant("S", "n1", lease_for("S", -1)).await;
        mgr.grant("S", "n2", lease_for("S", 60_000)).await;

        let reclaimed = mgr.reclaim_expired(&HashSet::new()).await;
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].0, "n1");
        assert!(mgr.remaining_ms("n2").await.is_some());
    }

    #[tokio::test]
    async fn test_grace_period_for_in_use_nodes() {
        let mgr = LeaseManager::new(Duration::from_secs(5));
        // expired 1s ago, but still within the 5s grace
        mgr.grant("S", "n1", lease_for("S", -1_000)).await;

        let in_use: HashSet<String> = ["n1".to_string()].into_iter().collect();
        assert!(mgr.reclaim_expired(&in_use).await.is_empty());

        // past the grace period the lease is yanked even if in use
        mgr.grant("S", "n1", lease_for("S", -6_000)).await;
        let reclaimed = mgr.reclaim_expired(&in_use).await;
        assert_eq!(reclaimed.len(), 1);
    }

    #[tokio::test]
    async fn test_lease_remaining_sign() {
        let expired = lease_for("S", -100);
        assert!(expired.remaining_ms() <= 0);
        let live = lease_for("S", 10_000);
        assert!(live.remaining_ms() > 0);
    }
}
