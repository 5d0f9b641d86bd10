//! Node agent
//!
//! Runs on every participating node. The agent keeps the resource manager
//! informed of its liveness, accepts RUN/CANCEL requests from schedulers on
//! its task port, and batches task status reports back to the scheduler.
//! Task execution itself sits behind [`TaskExecutor`] so deployments can
//! plug in their own launcher.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use crate::config::AgentConfig;
use crate::job::{RunningTask, TaskInfo, TaskStatus};
use crate::protocol::{self, NodeRequest, TaskRequest, TASK_OK};
use crate::registry::{NodeKind, NodeRecord};

// ============================================================================
// Task Execution
// ============================================================================

/// Executes one task to completion and reports the terminal status.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &RunningTask) -> TaskStatus;
}

/// Executor that completes every task immediately. Useful for capacity
/// probes and tests; real deployments supply their own launcher.
pub struct InstantExecutor;

#[async_trait]
impl TaskExecutor for InstantExecutor {
    async fn execute(&self, task: &RunningTask) -> TaskStatus {
        tracing::debug!(process_id = %task.process_id(), command = %task.task.command, "instant execution");
        TaskStatus::Completed
    }
}

// ============================================================================
// Agent State
// ============================================================================

struct AgentInner {
    /// process id -> latest status, reported to the scheduler in batches.
    statuses: HashMap<String, TaskInfo>,
    /// process id -> executor task, aborted on CANCEL.
    running: HashMap<String, tokio::task::JoinHandle<()>>,
}

/// The node-side service: task endpoint, heartbeat loop, report loop.
pub struct NodeAgent {
    id: String,
    kind: NodeKind,
    config: AgentConfig,
    executor: Arc<dyn TaskExecutor>,
    inner: Arc<Mutex<AgentInner>>,
}

/// Handle to a running agent. Aborts its background tasks on drop.
pub struct AgentHandle {
    /// Stable node identity used in heartbeats.
    pub node_id: String,
    /// Address the agent accepts RUN/CANCEL on.
    pub task_addr: SocketAddr,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl AgentHandle {
    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for AgentHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl NodeAgent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        Self::with_executor(config, Arc::new(InstantExecutor))
    }

    pub fn with_executor(config: AgentConfig, executor: Arc<dyn TaskExecutor>) -> Result<Self, AgentError> {
        let kind = NodeKind::from_str(&config.kind).map_err(AgentError::Config)?;
        let id = config
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Ok(Self {
            id,
            kind,
            config,
            executor,
            inner: Arc::new(Mutex::new(AgentInner {
                statuses: HashMap::new(),
                running: HashMap::new(),
            })),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Bind the task listener and spawn the accept, heartbeat and report
    /// loops. The advertised port is the bound one, so `task_bind` may use
    /// port 0.
    pub async fn start(&self) -> Result<AgentHandle, AgentError> {
        let listener = TcpListener::bind(&self.config.task_bind)
            .await
            .map_err(|e| AgentError::Bind(format!("{}: {e}", self.config.task_bind)))?;
        let task_addr = listener.local_addr().map_err(|e| AgentError::Bind(e.to_string()))?;

        let record = NodeRecord::new(
            self.id.clone(),
            self.config.ip.clone(),
            task_addr.port(),
            self.config.latitude,
            self.config.longitude,
            self.kind,
        );

        tracing::info!(node_id = %self.id, %task_addr, kind = %self.kind, "node agent starting");

        let io_timeout = self.config.io_timeout();
        let mut tasks = Vec::new();

        // task RUN/CANCEL listener
        {
            let inner = self.inner.clone();
            let executor = self.executor.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let (stream, peer) = match listener.accept().await {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!(error = %e, "task listener accept failed");
                            continue;
                        }
                    };
                    let inner = inner.clone();
                    let executor = executor.clone();
                    tokio::spawn(async move {
                        handle_task_connection(stream, peer, inner, executor, io_timeout).await;
                    });
                }
            }));
        }

        // heartbeat loop, jittered so a fleet booted together does not
        // synchronize against the resource manager
        {
            let broker_addr = self.config.broker_addr.clone();
            let interval = self.config.heartbeat_interval();
            let record = record.clone();
            tasks.push(tokio::spawn(async move {
                let jitter = rand::thread_rng().gen_range(0..250u64);
                tokio::time::sleep(Duration::from_millis(jitter)).await;
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    let mut node = record.clone();
                    node.touch();
                    let request = NodeRequest::Online { node };
                    match protocol::call::<_, bool>(&broker_addr, io_timeout, &request).await {
                        Ok(true) => {}
                        Ok(false) => tracing::warn!("heartbeat rejected by resource manager"),
                        Err(e) => tracing::warn!(error = %e, "heartbeat failed"),
                    }
                }
            }));
        }

        // status report loop
        {
            let scheduler_addr = self.config.scheduler_addr.clone();
            let interval = self.config.report_interval();
            let inner = self.inner.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    report_statuses(&inner, &scheduler_addr, io_timeout).await;
                }
            }));
        }

        Ok(AgentHandle {
            node_id: self.id.clone(),
            task_addr,
            tasks,
        })
    }

    /// Announce departure to the resource manager. Best-effort; the
    /// liveness sweep evicts us anyway once heartbeats stop.
    pub async fn sign_off(&self, task_port: u16) {
        let record = NodeRecord::new(
            self.id.clone(),
            self.config.ip.clone(),
            task_port,
            self.config.latitude,
            self.config.longitude,
            self.kind,
        );
        let request = NodeRequest::Offline { node: record };
        if let Err(e) = protocol::call::<_, bool>(&self.config.broker_addr, self.config.io_timeout(), &request).await {
            tracing::warn!(error = %e, "sign-off failed");
        }
    }

    /// Snapshot of unreported task statuses, for inspection in tests.
    pub async fn statuses(&self) -> HashMap<String, TaskInfo> {
        self.inner.lock().await.statuses.clone()
    }
}

// ============================================================================
// Task Endpoint
// ============================================================================

async fn handle_task_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    inner: Arc<Mutex<AgentInner>>,
    executor: Arc<dyn TaskExecutor>,
    io_timeout: Duration,
) {
    let request: TaskRequest = match protocol::recv(&mut stream, io_timeout).await {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(%peer, error = %e, "bad task request");
            let _ = protocol::send(&mut stream, io_timeout, "bad request").await;
            return;
        }
    };

    let result = match request {
        TaskRequest::Run { task } => {
            let pid = task.process_id();
            tracing::info!(process_id = %pid, "task accepted");

            // the handle goes into the running map while the lock is held:
            // the executor task's first own lock acquisition cannot run
            // before the insert, even for executors that finish instantly
            let mut guard = inner.lock().await;
            guard.statuses.insert(pid.clone(), TaskInfo::new(TaskStatus::Running, 0.0));
            let load = guard.running.len() as f64;

            let handle = {
                let inner = inner.clone();
                let executor = executor.clone();
                let pid = pid.clone();
                tokio::spawn(async move {
                    let status = executor.execute(&task).await;
                    let mut guard = inner.lock().await;
                    guard.running.remove(&pid);
                    guard.statuses.insert(pid.clone(), TaskInfo::new(status, load));
                    tracing::info!(process_id = %pid, %status, "task finished");
                })
            };
            guard.running.insert(pid, handle);
            drop(guard);

            protocol::send(&mut stream, io_timeout, TASK_OK).await
        }
        TaskRequest::Cancel { task } => {
            let pid = task.process_id();
            let mut guard = inner.lock().await;
            if let Some(handle) = guard.running.remove(&pid) {
                handle.abort();
                guard.statuses.insert(pid.clone(), TaskInfo::new(TaskStatus::Cancelled, 0.0));
                tracing::info!(process_id = %pid, "task cancelled");
            } else {
                tracing::debug!(process_id = %pid, "cancel for unknown task ignored");
            }
            drop(guard);
            protocol::send(&mut stream, io_timeout, TASK_OK).await
        }
        TaskRequest::Update { .. } => {
            tracing::warn!(%peer, "UPDATE request on node task port rejected");
            protocol::send(&mut stream, io_timeout, "unsupported request").await
        }
    };

    if let Err(e) = result {
        tracing::debug!(%peer, error = %e, "failed replying on task port");
    }
}

/// Send the accumulated statuses to the scheduler in one batch. Terminal
/// statuses are dropped only after a successful report so nothing is lost
/// while the scheduler is unreachable.
async fn report_statuses(inner: &Arc<Mutex<AgentInner>>, scheduler_addr: &str, io_timeout: Duration) {
    let statuses = {
        let guard = inner.lock().await;
        if guard.statuses.is_empty() {
            return;
        }
        guard.statuses.clone()
    };

    let request = TaskRequest::Update {
        statuses: statuses.clone(),
    };
    match protocol::call::<_, String>(scheduler_addr, io_timeout, &request).await {
        Ok(reply) if reply == TASK_OK => {
            let mut guard = inner.lock().await;
            for (pid, info) in &statuses {
                let terminal = matches!(
                    info.status,
                    TaskStatus::Completed | TaskStatus::Cancelled | TaskStatus::Failed | TaskStatus::Error
                );
                // keep a status that changed since the snapshot was taken
                let unchanged = guard
                    .statuses
                    .get(pid)
                    .map(|current| current.status == info.status)
                    .unwrap_or(false);
                if terminal && unchanged {
                    guard.statuses.remove(pid);
                }
            }
        }
        Ok(reply) => tracing::warn!(%reply, "status report rejected"),
        Err(e) => tracing::debug!(error = %e, "status report failed"),
    }
}

// ============================================================================
// Agent Errors
// ============================================================================

/// Agent errors
#[derive(Debug, Clone)]
pub enum AgentError {
    /// Failed to bind the task listener
    Bind(String),

    /// Invalid agent configuration
    Config(String),
}

impl std::fmt::Display for AgentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bind(msg) => write!(f, "Failed to bind: {msg}"),
            Self::Config(msg) => write!(f, "Invalid agent config: {msg}"),
        }
    }
}

impl std::error::Error for AgentError {}

// ============================================================================
// Tests
// ============================================================================
