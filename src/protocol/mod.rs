//! Wire protocol: one JSON object per line over a fresh TCP connection
//!
//! Every call opens a new connection, writes a single JSON-encoded request
//! line, reads a single response line, and closes. There is no pipelining
//! and no persistent connection state. All socket operations are bounded by
//! a timeout; a timed-out peer is treated the same as connection-refused.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::job::{Job, RunningTask, TaskInfo};
use crate::lease::Lease;
use crate::registry::NodeRecord;

/// Upper bound on a single request/response line.
const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

// ============================================================================
// Request Types
// ============================================================================

/// Requests a node sends to the resource manager's heartbeat port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum NodeRequest {
    /// Liveness report: the node is online.
    Online { node: NodeRecord },
    /// The node is signing off.
    Offline { node: NodeRecord },
    /// Fetch all known node records.
    Get,
}

/// Requests a scheduler sends to the resource manager's scheduler port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum SchedulerRequest {
    /// All known node records, each annotated with its lease status in
    /// `note` ("available" or remaining-lease-millis).
    Get { scheduler: String },
    /// Lease one or more nodes. The granted subset is returned; partial
    /// success is normal.
    Lease {
        scheduler: String,
        leases: HashMap<String, Lease>,
    },
    /// Best-effort release of nodes held by this scheduler.
    Release {
        scheduler: String,
        nodes: HashSet<String>,
    },
}

/// Requests a client sends to a scheduler's job port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum JobRequest {
    Submit { job: Job },
    Cancel { job_id: u64 },
}

/// Requests flowing between a scheduler and a node's task endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum TaskRequest {
    /// Start a task on the node. Response is "OK" or a failure string.
    Run { task: RunningTask },
    /// Stop a task. Best-effort; response is "OK" or a failure string.
    Cancel { task: RunningTask },
    /// Batched status report, one entry per process id.
    Update { statuses: HashMap<String, TaskInfo> },
}

/// Reply sent when a task RUN/CANCEL/UPDATE succeeded.
pub const TASK_OK: &str = "OK";

// ============================================================================
// Codec
// ============================================================================

/// Read one JSON line from the stream and decode it.
pub async fn recv<T: DeserializeOwned>(stream: &mut TcpStream, limit: Duration) -> Result<T, ProtocolError> {
    let (read_half, _) = stream.split();
    let mut reader = BufReader::new(read_half).take(MAX_LINE_BYTES as u64);
    let mut line = String::new();

    let n = timeout(limit, reader.read_line(&mut line))
        .await
        .map_err(|_| ProtocolError::Timeout)?
        .map_err(|e| ProtocolError::Io(e.to_string()))?;

    if n == 0 {
        return Err(ProtocolError::Closed);
    }
    serde_json::from_str(line.trim_end()).map_err(|e| ProtocolError::Parse(e.to_string()))
}

/// Encode a value as one JSON line and write it to the stream.
pub async fn send<T: Serialize + ?Sized>(stream: &mut TcpStream, limit: Duration, value: &T) -> Result<(), ProtocolError> {
    let mut line = serde_json::to_string(value).map_err(|e| ProtocolError::Parse(e.to_string()))?;
    line.push('\n');

    timeout(limit, stream.write_all(line.as_bytes()))
        .await
        .map_err(|_| ProtocolError::Timeout)?
        .map_err(|e| ProtocolError::Io(e.to_string()))
}

/// One round trip: connect, send the request line, read the response line.
pub async fn call<Req, Resp>(addr: &str, limit: Duration, request: &Req) -> Result<Resp, ProtocolError>
where
    Req: Serialize + ?Sized,
    Resp: DeserializeOwned,
{
    let mut stream = timeout(limit, TcpStream::connect(addr))
        .await
        .map_err(|_| ProtocolError::Timeout)?
        .map_err(|e| ProtocolError::Connect(e.to_string()))?;

    send(&mut stream, limit, request).await?;
    recv(&mut stream, limit).await
}

// ============================================================================
// Protocol Errors
// ============================================================================

/// Protocol errors
#[derive(Debug, Clone)]
pub enum ProtocolError {
    /// Failed to connect to the peer
    Connect(String),

    /// The operation did not finish within the timeout
    Timeout,

    /// Socket read/write failed
    Io(String),

    /// Malformed or absent JSON line
    Parse(String),

    /// Peer closed the connection before sending a line
    Closed,
}

impl ProtocolError {
    /// Transient connectivity failures: retry next tick, never crash.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Timeout | Self::Io(_) | Self::Closed)
    }
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect(msg) => write!(f, "Failed to connect: {msg}"),
            Self::Timeout => write!(f, "Operation timed out"),
            Self::Io(msg) => write!(f, "Socket error: {msg}"),
            Self::Parse(msg) => write!(f, "Protocol parse error: {msg}"),
            Self::Closed => write!(f, "Connection closed by peer"),
        }
    }
}

impl std::error::Error for ProtocolError {}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{NodeKind, NodeRecord};
    use tokio::net::TcpListener;

    #[test]
    fn test_request_tags() {
        let record = NodeRecord::new("n1", "10.0.0.1", 2021, 10.0, 10.0, NodeKind::Compute);
        let json = serde_json::to_string(&NodeRequest::Online { node: record }).unwrap();
        assert!(json.contains(r#""type":"ONLINE""#));

        let json = serde_json::to_string(&SchedulerRequest::Get {
            scheduler: "S".to_string(),
        })
        .unwrap();
        assert!(json.contains(r#""type":"GET""#));
    }

    #[test]
    fn test_submit_envelope_preserves_task_ids() {
        use crate::job::{JobKind, Task};

        let mut job = Job::new(0, JobKind::Mobile, "cmd", "exe");
        job.add_task(Task::new(1, 0, JobKind::Mobile, "cmd", "exe"));
        job.add_task(Task::new(2, 0, JobKind::Mobile, "cmd", "exe"));

        // the tagged envelope buffers its content; task ids must survive
        let json = serde_json::to_string(&JobRequest::Submit { job }).unwrap();
        let back: JobRequest = serde_json::from_str(&json).unwrap();
        let JobRequest::Submit { job } = back else {
            panic!("wrong variant");
        };
        assert_eq!(job.tasks.len(), 2);
        assert!(job.tasks.contains_key(&1) && job.tasks.contains_key(&2));
    }

    #[test]
    fn test_transient_classification() {
        assert!(ProtocolError::Timeout.is_transient());
        assert!(ProtocolError::Connect("refused".to_string()).is_transient());
        assert!(!ProtocolError::Parse("bad json".to_string()).is_transient());
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let req: JobRequest = recv(&mut stream, Duration::from_secs(1)).await.unwrap();
            assert!(matches!(req, JobRequest::Cancel { job_id: 7 }));
            send(&mut stream, Duration::from_secs(1), "true").await.unwrap();
        });

        let reply: String = call(&addr, Duration::from_secs(1), &JobRequest::Cancel { job_id: 7 })
            .await
            .unwrap();
        assert_eq!(reply, "true");
    }

    #[tokio::test]
    async fn test_call_connection_refused() {
        // a bound-then-dropped listener leaves a port nothing is accepting on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result: Result<String, _> = call(&addr, Duration::from_millis(300), &JobRequest::Cancel { job_id: 1 }).await;
        assert!(result.unwrap_err().is_transient());
    }
}
