//! Resource manager integration tests over real sockets

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use nephele::broker::{BrokerHandle, ResourceBroker};
use nephele::config::BrokerConfig;
use nephele::grid::GridIndex;
use nephele::lease::Lease;
use nephele::protocol::{self, NodeRequest, SchedulerRequest};
use nephele::registry::{NodeKind, NodeRecord};

const TIMEOUT: Duration = Duration::from_secs(1);

fn test_grid() -> GridIndex {
    GridIndex::new(8, -90.0, 90.0, -180.0, 180.0)
}

fn test_config(max_inactive_ms: u64, sweep_interval_ms: u64) -> BrokerConfig {
    BrokerConfig {
        node_bind: "127.0.0.1:0".to_string(),
        scheduler_bind: "127.0.0.1:0".to_string(),
        max_inactive_ms,
        sweep_interval_ms,
        grace_ms: 0,
        pool_size: 8,
        io_timeout_ms: 500,
    }
}

async fn start_broker(max_inactive_ms: u64, sweep_interval_ms: u64) -> BrokerHandle {
    let broker = ResourceBroker::new(test_grid(), test_config(max_inactive_ms, sweep_interval_ms));
    broker.start().await.unwrap()
}

fn node(id: &str, latitude: f64, longitude: f64) -> NodeRecord {
    NodeRecord::new(id, "127.0.0.1", 2021, latitude, longitude, NodeKind::Compute)
}

async fn heartbeat(addr: &str, record: NodeRecord) -> bool {
    protocol::call(addr, TIMEOUT, &NodeRequest::Online { node: record })
        .await
        .unwrap()
}

async fn get_nodes(addr: &str, scheduler: &str) -> HashMap<String, NodeRecord> {
    let request = SchedulerRequest::Get {
        scheduler: scheduler.to_string(),
    };
    protocol::call(addr, TIMEOUT, &request).await.unwrap()
}

async fn lease_one(addr: &str, scheduler: &str, node_id: &str) -> HashMap<String, Lease> {
    let mut leases = HashMap::new();
    leases.insert(node_id.to_string(), Lease::new(scheduler, Duration::from_secs(30)));
    let request = SchedulerRequest::Lease {
        scheduler: scheduler.to_string(),
        leases,
    };
    protocol::call(addr, TIMEOUT, &request).await.unwrap()
}

#[tokio::test]
async fn test_heartbeat_then_get_shows_available_node() {
    let handle = start_broker(60_000, 60_000).await;
    let node_addr = handle.node_addr.to_string();
    let scheduler_addr = handle.scheduler_addr.to_string();

    assert!(heartbeat(&node_addr, node("n1", 10.0, 10.0)).await);

    let nodes = get_nodes(&scheduler_addr, "S").await;
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes["n1"].note.as_deref(), Some("available"));
}

#[tokio::test]
async fn test_lease_is_exclusive_and_reentrant() {
    let handle = start_broker(60_000, 60_000).await;
    let node_addr = handle.node_addr.to_string();
    let scheduler_addr = handle.scheduler_addr.to_string();

    heartbeat(&node_addr, node("n1", 10.0, 10.0)).await;

    // S takes the node
    let granted = lease_one(&scheduler_addr, "S", "n1").await;
    assert!(granted.contains_key("n1"));

    // T is refused while S holds it
    let granted = lease_one(&scheduler_addr, "T", "n1").await;
    assert!(granted.is_empty());

    // S may renew its own claim
    let granted = lease_one(&scheduler_addr, "S", "n1").await;
    assert!(granted.contains_key("n1"));

    // everyone now sees remaining millis instead of "available"
    let nodes = get_nodes(&scheduler_addr, "T").await;
    let note = nodes["n1"].note.as_deref().unwrap();
    assert!(note.parse::<i64>().unwrap() > 0, "note was {note}");
}

#[tokio::test]
async fn test_release_frees_the_node_for_others() {
    let handle = start_broker(60_000, 60_000).await;
    let node_addr = handle.node_addr.to_string();
    let scheduler_addr = handle.scheduler_addr.to_string();

    heartbeat(&node_addr, node("n1", 10.0, 10.0)).await;
    assert!(lease_one(&scheduler_addr, "S", "n1").await.contains_key("n1"));

    let request = SchedulerRequest::Release {
        scheduler: "S".to_string(),
        nodes: HashSet::from(["n1".to_string()]),
    };
    let ok: bool = protocol::call(&scheduler_addr, TIMEOUT, &request).await.unwrap();
    assert!(ok);

    assert!(lease_one(&scheduler_addr, "T", "n1").await.contains_key("n1"));
}

#[tokio::test]
async fn test_lease_on_unknown_node_not_granted() {
    let handle = start_broker(60_000, 60_000).await;
    let scheduler_addr = handle.scheduler_addr.to_string();

    let granted = lease_one(&scheduler_addr, "S", "ghost").await;
    assert!(granted.is_empty());
}

#[tokio::test]
async fn test_stale_node_is_evicted() {
    // short staleness threshold and a fast sweep
    let handle = start_broker(200, 100).await;
    let node_addr = handle.node_addr.to_string();
    let scheduler_addr = handle.scheduler_addr.to_string();

    heartbeat(&node_addr, node("n1", 10.0, 10.0)).await;
    assert_eq!(get_nodes(&scheduler_addr, "S").await.len(), 1);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(get_nodes(&scheduler_addr, "S").await.is_empty());
}

#[tokio::test]
async fn test_offline_sign_off_removes_node() {
    let handle = start_broker(60_000, 60_000).await;
    let node_addr = handle.node_addr.to_string();
    let scheduler_addr = handle.scheduler_addr.to_string();

    heartbeat(&node_addr, node("n1", 10.0, 10.0)).await;

    let ok: bool = protocol::call(
        &node_addr,
        TIMEOUT,
        &NodeRequest::Offline {
            node: node("n1", 10.0, 10.0),
        },
    )
    .await
    .unwrap();
    assert!(ok);

    assert!(get_nodes(&scheduler_addr, "S").await.is_empty());
}

#[tokio::test]
async fn test_malformed_request_gets_negative_reply() {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    let handle = start_broker(60_000, 60_000).await;
    let mut stream = tokio::net::TcpStream::connect(handle.node_addr).await.unwrap();
    stream.write_all(b"this is not json\n").await.unwrap();

    let mut line = String::new();
    BufReader::new(stream).read_line(&mut line).await.unwrap();
    assert_eq!(line.trim(), "false");

    // the listener survives and keeps serving
    let node_addr = handle.node_addr.to_string();
    assert!(heartbeat(&node_addr, node("n1", 10.0, 10.0)).await);
}
