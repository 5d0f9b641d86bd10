//! Scheduler server implementation
//!
//! Two listeners front one [`JobManager`]: the job port takes SUBMIT and
//! CANCEL from clients, the task port takes batched UPDATE reports from
//! nodes (and task-level CANCEL requests, which are forwarded to the node
//! running the task). Each connection carries exactly one request line and
//! one response line, same as the resource manager's listeners.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

use crate::config::SchedulerConfig;
use crate::job::{TaskInfo, TaskStatus};
use crate::protocol::{self, JobRequest, TaskRequest, TASK_OK};

use super::manager::{send_task_request, JobManager};

// ============================================================================
// Scheduler Server
// ============================================================================

/// Network front for one scheduler instance.
pub struct SchedulerServer {
    manager: Arc<JobManager>,
    config: SchedulerConfig,
}

/// Handle to a running scheduler. Aborts its background tasks on drop.
pub struct SchedulerHandle {
    /// Address clients submit jobs to.
    pub job_addr: SocketAddr,
    /// Address nodes report task status to.
    pub task_addr: SocketAddr,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl SchedulerServer {
    pub fn new(manager: Arc<JobManager>, config: SchedulerConfig) -> Self {
        Self { manager, config }
    }

    /// Bind both listeners and spawn the accept loops and the scheduling
    /// loop.
    pub async fn start(&self) -> Result<SchedulerHandle, SchedulerError> {
        let job_listener = TcpListener::bind(&self.config.job_bind)
            .await
            .map_err(|e| SchedulerError::Bind(format!("{}: {e}", self.config.job_bind)))?;
        let task_listener = TcpListener::bind(&self.config.task_bind)
            .await
            .map_err(|e| SchedulerError::Bind(format!("{}: {e}", self.config.task_bind)))?;

        let job_addr = job_listener.local_addr().map_err(|e| SchedulerError::Bind(e.to_string()))?;
        let task_addr = task_listener.local_addr().map_err(|e| SchedulerError::Bind(e.to_string()))?;

        tracing::info!(
            scheduler = %self.config.name,
            %job_addr,
            %task_addr,
            "scheduler listening"
        );

        let io_timeout = self.config.io_timeout();
        let mut tasks = Vec::new();

        // job submit/cancel listener
        {
            let manager = self.manager.clone();
            let pool = Arc::new(Semaphore::new(self.config.pool_size));
            tasks.push(tokio::spawn(async move {
                loop {
                    let (stream, peer) = match job_listener.accept().await {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!(error = %e, "job listener accept failed");
                            continue;
                        }
                    };
                    let permit = match pool.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    let manager = manager.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        handle_job_connection(stream, peer, manager, io_timeout).await;
                    });
                }
            }));
        }

        // task status listener
        {
            let manager = self.manager.clone();
            let pool = Arc::new(Semaphore::new(self.config.pool_size));
            tasks.push(tokio::spawn(async move {
                loop {
                    let (stream, peer) = match task_listener.accept().await {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!(error = %e, "task listener accept failed");
                            continue;
                        }
                    };
                    let permit = match pool.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    let manager = manager.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        handle_task_connection(stream, peer, manager, io_timeout).await;
                    });
                }
            }));
        }

        // scheduling loop: node refresh, lease reclamation, dispatch
        tasks.push(self.manager.clone().start());

        Ok(SchedulerHandle {
            job_addr,
            task_addr,
            tasks,
        })
    }
}

// ============================================================================
// Connection Handlers
// ============================================================================

async fn handle_job_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    manager: Arc<JobManager>,
    io_timeout: Duration,
) {
    let request: JobRequest = match protocol::recv(&mut stream, io_timeout).await {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(%peer, error = %e, "bad job request");
            let _ = protocol::send(&mut stream, io_timeout, &false).await;
            return;
        }
    };

    let result = match request {
        // replies are strings: the assigned id, or bool-as-string
        JobRequest::Submit { job } => {
            let id = manager.submit(job).await;
            protocol::send(&mut stream, io_timeout, &id.to_string()).await
        }
        JobRequest::Cancel { job_id } => {
            let ok = manager.cancel(job_id).await;
            protocol::send(&mut stream, io_timeout, &ok.to_string()).await
        }
    };

    if let Err(e) = result {
        tracing::debug!(%peer, error = %e, "failed replying to job client");
    }
}

async fn handle_task_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    manager: Arc<JobManager>,
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
        TaskRequest::Update { statuses } => {
            manager.handle_status_updates(statuses).await;
            protocol::send(&mut stream, io_timeout, TASK_OK).await
        }
        TaskRequest::Cancel { task } => {
            // forward to the node actually running the task, then clear
            // our own bookkeeping regardless of the forward outcome
            let pid = task.process_id();
            if let Some(addr) = manager.node_task_addr(&task.node_id).await {
                send_task_request(&addr, manager.io_timeout(), TaskRequest::Cancel { task }).await;
            }
            let mut statuses = HashMap::new();
            statuses.insert(pid, TaskInfo::new(TaskStatus::Cancelled, 0.0));
            manager.handle_status_updates(statuses).await;
            protocol::send(&mut stream, io_timeout, TASK_OK).await
        }
        TaskRequest::Run { .. } => {
            tracing::warn!(%peer, "RUN request on scheduler task port rejected");
            protocol::send(&mut stream, io_timeout, "unsupported request").await
        }
    };

    if let Err(e) = result {
        tracing::debug!(%peer, error = %e, "failed replying on task port");
    }
}

// ============================================================================
// Scheduler Errors
// ============================================================================

/// Scheduler server errors
#[derive(Debug, Clone)]
pub enum SchedulerError {
    /// Failed to bind a listener
    Bind(String),
}

impl std::fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bind(msg) => write!(f, "Failed to bind: {msg}"),
        }
    }
}

impl std::error::Error for SchedulerError {}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, JobKind, Task};

    fn test_config() -> SchedulerConfig {
        SchedulerConfig {
            name: "S".to_string(),
            kind: "MOBILE".to_string(),
            resource_manager_addr: "127.0.0.1:1".to_string(),
            job_bind: "127.0.0.1:0".to_string(),
            task_bind: "127.0.0.1:0".to_string(),
            tick_interval_ms: 10_000,
            lease_ms: 10_000,
            grace_ms: 0,
            pool_size: 4,
            io_timeout_ms: 500,
        }
    }

    async fn start_server() -> (Arc<JobManager>, SchedulerHandle) {
        let config = test_config();
        let manager = Arc::new(JobManager::new(config.clone()).unwrap());
        let server = SchedulerServer::new(manager.clone(), config);
        let handle = server.start().await.unwrap();
        (manager, handle)
    }

    #[tokio::test]
    async fn test_submit_over_the_wire() {
        let (manager, handle) = start_server().await;
        let addr = handle.job_addr.to_string();

        let mut job = Job::new(0, JobKind::Mobile, "cmd", "exe");
        job.add_task(Task::new(1, 0, JobKind::Mobile, "cmd", "exe"));

        let id: String = protocol::call(&addr, Duration::from_secs(1), &JobRequest::Submit { job })
            .await
            .unwrap();
        assert!(id.parse::<u64>().unwrap() >= 1);
        assert_eq!(manager.stats().await.queued_jobs, 1);
    }

    #[tokio::test]
    async fn test_cancel_unknown_job_is_false() {
        let (_manager, handle) = start_server().await;
        let addr = handle.job_addr.to_string();

        let ok: String = protocol::call(&addr, Duration::from_secs(1), &JobRequest::Cancel { job_id: 99 })
            .await
            .unwrap();
        assert_eq!(ok, "false");
    }

    #[tokio::test]
    async fn test_status_update_over_the_wire() {
        let (_manager, handle) = start_server().await;
        let addr = handle.task_addr.to_string();

        let mut statuses = HashMap::new();
        statuses.insert("1_1".to_string(), TaskInfo::new(TaskStatus::Running, 0.3));

        let reply: String = protocol::call(&addr, Duration::from_secs(1), &TaskRequest::Update { statuses })
            .await
            .unwrap();
        assert_eq!(reply, TASK_OK);
    }

    #[tokio::test]
    async fn test_run_on_task_port_rejected() {
        let (_manager, handle) = start_server().await;
        let addr = handle.task_addr.to_string();

        let task = Task::new(1, 1, JobKind::Mobile, "cmd", "exe").bind("n1");
        let reply: String = protocol::call(&addr, Duration::from_secs(1), &TaskRequest::Run { task })
            .await
            .unwrap();
        assert_ne!(reply, TASK_OK);
    }
}
