//! The JobManager: queue, running maps, and the scheduling tick
//!
//! One JobManager instance drives one scheduler. It owns a priority queue
//! of pending jobs (lower priority value first), the maps of in-flight
//! tasks, and a reschedule map for tasks whose node failed or vanished.
//! The scheduling loop is a single logical task woken either by its
//! periodic timer or by a SUBMIT notification; all network I/O happens
//! outside the state lock.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Notify};

use crate::config::SchedulerConfig;
use crate::error::Error;
use crate::job::{parse_process_id, process_id, Job, JobKind, Task, TaskInfo, TaskStatus};
use crate::lease::Lease;
use crate::protocol::{self, TaskRequest, TASK_OK};
use crate::registry::NodeRecord;

use super::client::ResourceClient;

// ============================================================================
// Queue Ordering
// ============================================================================

/// Heap wrapper ordering jobs by ascending priority value, then id.
struct QueuedJob(Job);

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.0.priority == other.0.priority && self.0.id == other.0.id
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> Ordering {
        // reversed so the binary heap pops the lowest priority value first
        other
            .0
            .priority
            .cmp(&self.0.priority)
            .then_with(|| other.0.id.cmp(&self.0.id))
    }
}

// ============================================================================
// Scheduler State
// ============================================================================

#[derive(Default)]
struct State {
    queue: BinaryHeap<QueuedJob>,

    /// Last refreshed view of online nodes from the resource manager.
    online_nodes: HashMap<String, NodeRecord>,

    /// Client-side mirror of leases this scheduler currently holds.
    leases: HashMap<String, Lease>,

    /// node id -> process id of the task it is running for us.
    used_nodes: HashMap<String, String>,

    /// job id -> task ids currently running.
    running_jobs: HashMap<u64, Vec<u64>>,

    /// process id -> dispatched task.
    running_tasks: HashMap<String, crate::job::RunningTask>,

    /// process id -> latest status snapshot from the node.
    task_statuses: HashMap<String, TaskInfo>,

    /// process id -> task awaiting a new node after failure/departure.
    reschedule: HashMap<String, Task>,

    /// job id -> (completed tasks, total tasks).
    progress: HashMap<u64, (usize, usize)>,

    /// Jobs whose every task reported COMPLETED; consulted for dependency
    /// gating.
    completed_jobs: HashSet<u64>,
}

/// Point-in-time counters for inspection and tests.
#[derive(Debug, Clone)]
pub struct SchedulerStats {
    pub queued_jobs: usize,
    pub running_tasks: usize,
    pub reschedule_tasks: usize,
    pub leased_nodes: usize,
    pub completed_jobs: Vec<u64>,
}

/// A tentative node/task pairing built during a tick, dispatched only if
/// the lease on the node is granted.
struct Assignment {
    node_id: String,
    node_addr: String,
    task: Task,
    from_reschedule: bool,
}

// ============================================================================
// Job Manager
// ============================================================================

/// Owns one scheduler's jobs, tasks, and leases.
pub struct JobManager {
    name: String,
    kind: JobKind,
    client: ResourceClient,
    config: SchedulerConfig,
    state: Mutex<State>,
    wake: Notify,
    next_job_id: AtomicU64,
}

impl JobManager {
    pub fn new(config: SchedulerConfig) -> Result<Self, Error> {
        let kind = JobKind::from_str(&config.kind).map_err(Error::Config)?;
        let client = ResourceClient::new(
            config.name.clone(),
            config.resource_manager_addr.clone(),
            config.io_timeout(),
        );
        Ok(Self {
            name: config.name.clone(),
            kind,
            client,
            config,
            state: Mutex::new(State::default()),
            wake: Notify::new(),
            next_job_id: AtomicU64::new(1),
        })
    }

    /// The job kind this instance accepts.
    pub fn kind(&self) -> JobKind {
        self.kind
    }

    // ------------------------------------------------------------------
    // Inbound requests
    // ------------------------------------------------------------------

    /// Accept a job: assign the next id, stamp it onto the tasks, queue it
    /// and wake the scheduling loop.
    pub async fn submit(&self, mut job: Job) -> u64 {
        let id = self.next_job_id.fetch_add(1, AtomicOrdering::SeqCst);
        job.id = id;
        job.active = true;
        job.complete = false;
        for task in job.tasks.values_mut() {
            task.job_id = id;
            task.kind = job.kind;
        }

        let total = job.num_tasks();
        {
            let mut state = self.state.lock().await;
            state.progress.insert(id, (0, total));
            state.queue.push(QueuedJob(job));
        }
        self.wake.notify_one();
        tracing::info!(scheduler = %self.name, job_id = id, tasks = total, "job submitted");
        id
    }

    /// Cancel a job: pull it from the queue if still pending, and send a
    /// CANCEL to every node running one of its tasks. Succeeds if either
    /// path found something to cancel.
    pub async fn cancel(&self, job_id: u64) -> bool {
        let (queue_removed, to_cancel) = {
            let mut state = self.state.lock().await;

            let before = state.queue.len();
            let remaining: Vec<QueuedJob> = state.queue.drain().filter(|queued| queued.0.id != job_id).collect();
            let queue_removed = remaining.len() < before;
            state.queue = remaining.into_iter().collect();

            let mut to_cancel = Vec::new();
            if let Some(task_ids) = state.running_jobs.remove(&job_id) {
                for task_id in task_ids {
                    let pid = process_id(job_id, task_id);
                    state.reschedule.remove(&pid);
                    state.task_statuses.remove(&pid);
                    if let Some(running) = state.running_tasks.remove(&pid) {
                        state.used_nodes.remove(&running.node_id);
                        let addr = state.online_nodes.get(&running.node_id).map(|r| r.task_addr());
                        to_cancel.push((addr, running));
                    }
                }
            }
            // tasks already awaiting reschedule carry no node to cancel
            state.reschedule.retain(|_, task| task.job_id != job_id);
            state.progress.remove(&job_id);
            (queue_removed, to_cancel)
        };

        let had_running = !to_cancel.is_empty();
        for (addr, task) in to_cancel {
            match addr {
                // cancellation is best-effort: bookkeeping is already clear
                Some(addr) => {
                    send_task_request(&addr, self.config.io_timeout(), TaskRequest::Cancel { task }).await;
                }
                None => {
                    tracing::warn!(process_id = %task.process_id(), "cancelled task's node is unknown, skipping dispatch");
                }
            }
        }

        tracing::info!(scheduler = %self.name, job_id, queue_removed, had_running, "job cancel handled");
        queue_removed || had_running
    }

    /// Fold a batch of `processId -> TaskInfo` reports into the running
    /// maps. Unrecognized status values are logged and ignored.
    pub async fn handle_status_updates(&self, statuses: HashMap<String, TaskInfo>) {
        let mut state = self.state.lock().await;

        for (pid, info) in statuses {
            match info.status {
                TaskStatus::Running => {
                    if state.running_tasks.contains_key(&pid) {
                        state.task_statuses.insert(pid, info);
                    }
                }
                TaskStatus::Error | TaskStatus::Failed => {
                    if let Some(running) = state.running_tasks.remove(&pid) {
                        state.used_nodes.remove(&running.node_id);
                        state.task_statuses.remove(&pid);
                        tracing::warn!(
                            process_id = %pid,
                            node_id = %running.node_id,
                            status = %info.status,
                            "task failed, awaiting reschedule"
                        );
                        state.reschedule.insert(pid, running.unbind());
                    }
                }
                TaskStatus::Cancelled | TaskStatus::Completed => {
                    let completed = info.status == TaskStatus::Completed;
                    if let Some(running) = state.running_tasks.remove(&pid) {
                        state.used_nodes.remove(&running.node_id);
                    }
                    state.task_statuses.remove(&pid);
                    state.reschedule.remove(&pid);

                    if let Some((job_id, task_id)) = parse_process_id(&pid) {
                        if let Some(tasks) = state.running_jobs.get_mut(&job_id) {
                            tasks.retain(|t| *t != task_id);
                            if tasks.is_empty() {
                                state.running_jobs.remove(&job_id);
                            }
                        }
                        if completed {
                            let finished = match state.progress.get_mut(&job_id) {
                                Some(progress) => {
                                    progress.0 += 1;
                                    progress.0 >= progress.1
                                }
                                None => false,
                            };
                            if finished {
                                state.progress.remove(&job_id);
                                state.completed_jobs.insert(job_id);
                                tracing::info!(scheduler = %self.name, job_id, "job complete");
                            }
                        }
                    }
                }
                other => {
                    tracing::warn!(process_id = %pid, status = %other, "unrecognized task status ignored");
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Scheduling loop
    // ------------------------------------------------------------------

    /// Spawn the scheduling loop: wakes on SUBMIT or on the periodic tick,
    /// whichever comes first.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.tick_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = self.wake.notified() => {}
                }
                self.tick().await;
            }
        })
    }

    /// One full scheduling pass. Public so tests (and callers embedding
    /// the manager) can drive it deterministically.
    pub async fn tick(&self) {
        self.refresh_nodes().await;
        self.reclaim_leases().await;
        self.schedule_next().await;
    }

    /// Refresh the online-node view and reconcile departures: a node we
    /// are using that is no longer reported online loses its local lease
    /// record and its task moves to the reschedule map.
    async fn refresh_nodes(&self) {
        let nodes = match self.client.get_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                tracing::warn!(scheduler = %self.name, error = %e, "failed refreshing online nodes");
                return;
            }
        };

        let mut state = self.state.lock().await;
        state.online_nodes = nodes;

        let departed: Vec<(String, String)> = state
            .used_nodes
            .iter()
            .filter(|(node_id, _)| !state.online_nodes.contains_key(*node_id))
            .map(|(node_id, pid)| (node_id.clone(), pid.clone()))
            .collect();

        for (node_id, pid) in departed {
            state.used_nodes.remove(&node_id);
            state.leases.remove(&node_id);
            state.task_statuses.remove(&pid);
            if let Some(running) = state.running_tasks.remove(&pid) {
                tracing::warn!(node_id = %node_id, process_id = %pid, "node departed, task abandoned");
                if let Some((job_id, task_id)) = parse_process_id(&pid) {
                    if let Some(tasks) = state.running_jobs.get_mut(&job_id) {
                        tasks.retain(|t| *t != task_id);
                        if tasks.is_empty() {
                            state.running_jobs.remove(&job_id);
                        }
                    }
                }
                state.reschedule.insert(pid, running.unbind());
            }
        }
    }

    /// Drop expired leases and RELEASE them back to the resource manager
    /// in one batch. A lease on a node still running a task is kept until
    /// it overruns the grace period.
    async fn reclaim_leases(&self) {
        let grace = -(self.config.grace_ms as i64);
        let expired: HashSet<String> = {
            let mut state = self.state.lock().await;
            let expired: Vec<String> = state
                .leases
                .iter()
                .filter(|(node_id, lease)| {
                    let remaining = lease.remaining_ms();
                    if state.used_nodes.contains_key(*node_id) {
                        remaining <= grace
                    } else {
                        remaining <= 0
                    }
                })
                .map(|(node_id, _)| node_id.clone())
                .collect();
            for node_id in &expired {
                state.leases.remove(node_id);
            }
            expired.into_iter().collect()
        };

        if expired.is_empty() {
            return;
        }
        tracing::info!(scheduler = %self.name, nodes = ?expired, "releasing expired leases");
        if let Err(e) = self.client.release(expired).await {
            tracing::warn!(scheduler = %self.name, error = %e, "failed releasing expired leases");
        }
    }

    /// Pop the highest-priority job and try to place its unscheduled tasks
    /// (reschedule-map tasks first) on eligible nodes. Reschedule-map tasks
    /// are attempted every tick, even when no job is queued.
    async fn schedule_next(&self) {
        // phase 1: pick the job and pair tasks to nodes under the lock
        let (mut job, assignments) = {
            let mut state = self.state.lock().await;

            let mut job = match state.queue.pop() {
                Some(QueuedJob(popped)) if popped.kind != self.kind => {
                    tracing::error!(
                        scheduler = %self.name,
                        job_id = popped.id,
                        kind = %popped.kind,
                        "job kind not handled by this scheduler, discarding"
                    );
                    state.progress.remove(&popped.id);
                    None
                }
                Some(QueuedJob(popped))
                    if !popped.dependencies.iter().all(|dep| state.completed_jobs.contains(dep)) =>
                {
                    let mut popped = popped;
                    popped.increase_priority_value();
                    tracing::debug!(job_id = popped.id, "dependencies unmet, requeued");
                    state.queue.push(QueuedJob(popped));
                    None
                }
                Some(QueuedJob(popped)) => Some(popped),
                None => None,
            };

            // previously failed or abandoned tasks are attempted first
            let mut eligible: Vec<(String, Task)> = state
                .reschedule
                .iter()
                .map(|(pid, task)| (pid.clone(), task.clone()))
                .collect();
            if let Some(job) = &job {
                for (task_id, task) in &job.tasks {
                    let pid = process_id(job.id, *task_id);
                    if !state.running_tasks.contains_key(&pid) && !state.reschedule.contains_key(&pid) {
                        eligible.push((pid, task.clone()));
                    }
                }
            }

            if eligible.is_empty() {
                if let Some(job) = job.take() {
                    state.queue.push(QueuedJob(job));
                }
                return;
            }

            let mut assignments: Vec<Assignment> = Vec::new();
            let mut taken: HashSet<String> = HashSet::new();
            for (pid, task) in eligible {
                let found = state.online_nodes.iter().find(|(node_id, record)| {
                    if taken.contains(*node_id) || state.used_nodes.contains_key(*node_id) {
                        return false;
                    }
                    // a node leased by another scheduler is off limits
                    let free = matches!(record.note.as_deref(), Some("available") | Some("0"))
                        || state.leases.contains_key(*node_id);
                    if !free {
                        return false;
                    }
                    task.geo_fence
                        .map_or(true, |fence| fence.contains(record.latitude, record.longitude))
                });

                if let Some((node_id, record)) = found {
                    taken.insert(node_id.clone());
                    assignments.push(Assignment {
                        node_id: node_id.clone(),
                        node_addr: record.task_addr(),
                        task,
                        from_reschedule: state.reschedule.contains_key(&pid),
                    });
                }
            }

            if assignments.is_empty() {
                // no nodes available this tick; the job must not starve
                if let Some(job) = job.take() {
                    tracing::debug!(job_id = job.id, "no eligible nodes, job requeued");
                    state.queue.push(QueuedJob(job));
                }
                return;
            }

            (job, assignments)
        };

        // phase 2: lease the selected nodes; reconcile against the granted
        // subset instead of assuming all-or-nothing
        let mut lease_request = HashMap::new();
        for assignment in &assignments {
            lease_request.insert(
                assignment.node_id.clone(),
                Lease::new(self.name.clone(), self.config.lease_duration()),
            );
        }
        let granted = match self.client.lease(lease_request).await {
            Ok(granted) => granted,
            Err(e) => {
                tracing::warn!(scheduler = %self.name, error = %e, "lease request failed this tick");
                if let Some(job) = job {
                    self.state.lock().await.queue.push(QueuedJob(job));
                }
                return;
            }
        };

        // phase 3: dispatch RUN to each granted node; an I/O failure or a
        // non-OK reply means the task was never started there
        let mut started = Vec::new();
        for assignment in assignments {
            let Some(lease) = granted.get(&assignment.node_id) else {
                tracing::debug!(node_id = %assignment.node_id, "lease not granted, dropping assignment");
                continue;
            };
            let running = assignment.task.clone().bind(assignment.node_id.clone());
            let ok = send_task_request(
                &assignment.node_addr,
                self.config.io_timeout(),
                TaskRequest::Run { task: running.clone() },
            )
            .await;
            if ok {
                started.push((assignment, running, lease.clone()));
            }
        }

        // phase 4: record successes and requeue the job if tasks remain
        let started_count = started.len();
        {
            let mut state = self.state.lock().await;
            for (assignment, running, lease) in started {
                let pid = running.process_id();
                let job_id = running.task.job_id;
                let task_id = running.task.id;

                state.leases.insert(assignment.node_id.clone(), lease);
                state.used_nodes.insert(assignment.node_id.clone(), pid.clone());
                let job_tasks = state.running_jobs.entry(job_id).or_default();
                if !job_tasks.contains(&task_id) {
                    job_tasks.push(task_id);
                }
                state.running_tasks.insert(pid.clone(), running);

                if assignment.from_reschedule {
                    state.reschedule.remove(&pid);
                } else if let Some(job) = job.as_mut() {
                    job.tasks.remove(&task_id);
                }
            }

            if let Some(mut job) = job {
                if job.started_at.is_none() && started_count > 0 {
                    job.started_at = Some(Utc::now());
                }

                if job.tasks.is_empty() {
                    tracing::info!(job_id = job.id, "job fully scheduled");
                } else {
                    // partial progress: push the job toward the back and retry
                    if started_count > 0 {
                        job.increase_priority_value();
                    }
                    tracing::debug!(
                        job_id = job.id,
                        started = started_count,
                        remaining = job.tasks.len(),
                        "job partially scheduled, requeued"
                    );
                    state.queue.push(QueuedJob(job));
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub async fn stats(&self) -> SchedulerStats {
        let state = self.state.lock().await;
        SchedulerStats {
            queued_jobs: state.queue.len(),
            running_tasks: state.running_tasks.len(),
            reschedule_tasks: state.reschedule.len(),
            leased_nodes: state.leases.len(),
            completed_jobs: state.completed_jobs.iter().copied().collect(),
        }
    }

    pub async fn running_process_ids(&self) -> Vec<String> {
        self.state.lock().await.running_tasks.keys().cloned().collect()
    }

    pub async fn is_job_complete(&self, job_id: u64) -> bool {
        self.state.lock().await.completed_jobs.contains(&job_id)
    }

    /// Task endpoint of a node in the current online view.
    pub async fn node_task_addr(&self, node_id: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .online_nodes
            .get(node_id)
            .map(|record| record.task_addr())
    }

    pub(crate) fn io_timeout(&self) -> Duration {
        self.config.io_timeout()
    }
}

// ============================================================================
// Task Dispatch
// ============================================================================

/// One RUN/CANCEL round trip to a node's task endpoint. Anything other
/// than an "OK" reply counts as failure.
pub(crate) async fn send_task_request(addr: &str, timeout: Duration, request: TaskRequest) -> bool {
    match protocol::call::<TaskRequest, String>(addr, timeout, &request).await {
        Ok(reply) if reply == TASK_OK => true,
        Ok(reply) => {
            tracing::warn!(%addr, %reply, "task request rejected by node");
            false
        }
        Err(e) => {
            tracing::warn!(%addr, error = %e, "task request failed");
            false
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::GeoFence;

    fn test_config() -> SchedulerConfig {
        SchedulerConfig {
            name: "S".to_string(),
            kind: "MOBILE".to_string(),
            // nothing listens here: GET fails transiently and the tick
            // proceeds with an empty node view
            resource_manager_addr: "127.0.0.1:1".to_string(),
            job_bind: "127.0.0.1:0".to_string(),
            task_bind: "127.0.0.1:0".to_string(),
            tick_interval_ms: 50,
            lease_ms: 10_000,
            grace_ms: 0,
            pool_size: 4,
            io_timeout_ms: 100,
        }
    }

    fn job_with_tasks(kind: JobKind, n: u64) -> Job {
        let mut job = Job::new(0, kind, "cmd", "exe");
        for task_id in 1..=n {
            job.add_task(Task::new(task_id, 0, kind, "cmd", "exe"));
        }
        job
    }

    #[tokio::test]
    async fn test_submit_assigns_monotonic_ids() {
        let manager = JobManager::new(test_config()).unwrap();
        let first = manager.submit(job_with_tasks(JobKind::Mobile, 1)).await;
        let second = manager.submit(job_with_tasks(JobKind::Mobile, 1)).await;
        assert!(second > first);
        assert_eq!(manager.stats().await.queued_jobs, 2);
    }

    #[tokio::test]
    async fn test_invalid_kind_rejected_at_construction() {
        let mut config = test_config();
        config.kind = "TELEPATHY".to_string();
        assert!(JobManager::new(config).is_err());
    }

    #[tokio::test]
    async fn test_queue_pops_lowest_priority_value_first() {
        let manager = JobManager::new(test_config()).unwrap();
        let mut low_urgency = job_with_tasks(JobKind::Mobile, 1);
        low_urgency.priority = 9;
        let mut high_urgency = job_with_tasks(JobKind::Mobile, 1);
        high_urgency.priority = 1;

        manager.submit(low_urgency).await;
        let urgent_id = manager.submit(high_urgency).await;

        let state = manager.state.lock().await;
        let popped = state.queue.peek().unwrap();
        assert_eq!(popped.0.id, urgent_id);
    }

    #[tokio::test]
    async fn test_cancel_queued_job() {
        let manager = JobManager::new(test_config()).unwrap();
        let id = manager.submit(job_with_tasks(JobKind::Mobile, 2)).await;

        assert!(manager.cancel(id).await);
        assert_eq!(manager.stats().await.queued_jobs, 0);
        // cancelling again finds nothing
        assert!(!manager.cancel(id).await);
    }

    #[tokio::test]
    async fn test_wrong_kind_job_is_discarded() {
        let manager = JobManager::new(test_config()).unwrap();
        manager.submit(job_with_tasks(JobKind::MapReduce, 1)).await;

        manager.tick().await;
        let stats = manager.stats().await;
        assert_eq!(stats.queued_jobs, 0);
        assert_eq!(stats.running_tasks, 0);
    }

    #[tokio::test]
    async fn test_no_nodes_requeues_job() {
        let manager = JobManager::new(test_config()).unwrap();
        manager.submit(job_with_tasks(JobKind::Mobile, 1)).await;

        manager.tick().await;
        // no online nodes: the job must survive the tick
        assert_eq!(manager.stats().await.queued_jobs, 1);
    }

    #[tokio::test]
    async fn test_dependency_gating_requeues() {
        let manager = JobManager::new(test_config()).unwrap();
        let first = manager.submit(job_with_tasks(JobKind::Mobile, 1)).await;

        let mut dependent = job_with_tasks(JobKind::Mobile, 1);
        dependent.priority = 0; // would otherwise be scheduled first
        dependent.add_dependency(first);
        manager.submit(dependent).await;

        manager.tick().await;
        // the dependent job was popped first, gated, and pushed back
        assert_eq!(manager.stats().await.queued_jobs, 2);
    }

    #[tokio::test]
    async fn test_status_update_unknown_status_ignored() {
        let manager = JobManager::new(test_config()).unwrap();
        let mut statuses = HashMap::new();
        statuses.insert("1_1".to_string(), TaskInfo::new(TaskStatus::Unknown, 0.0));
        // must not panic or alter state
        manager.handle_status_updates(statuses).await;
        assert_eq!(manager.stats().await.running_tasks, 0);
    }

    #[tokio::test]
    async fn test_failed_task_moves_to_reschedule() {
        let manager = JobManager::new(test_config()).unwrap();
        let task = Task::new(1, 42, JobKind::Mobile, "cmd", "exe");
        let running = task.bind("n1");
        let pid = running.process_id();

        {
            let mut state = manager.state.lock().await;
            state.used_nodes.insert("n1".to_string(), pid.clone());
            state.running_jobs.insert(42, vec![1]);
            state.running_tasks.insert(pid.clone(), running);
        }

        let mut statuses = HashMap::new();
        statuses.insert(pid.clone(), TaskInfo::new(TaskStatus::Failed, 0.0));
        manager.handle_status_updates(statuses).await;

        let stats = manager.stats().await;
        assert_eq!(stats.running_tasks, 0);
        assert_eq!(stats.reschedule_tasks, 1);
        let state = manager.state.lock().await;
        assert!(!state.used_nodes.contains_key("n1"));
        assert_eq!(state.reschedule[&pid].status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_completed_task_clears_all_maps() {
        let manager = JobManager::new(test_config()).unwrap();
        let id = manager.submit(job_with_tasks(JobKind::Mobile, 1)).await;

        // simulate a dispatched task
        let task = Task::new(1, id, JobKind::Mobile, "cmd", "exe");
        let running = task.clone().bind("n1");
        let pid = running.process_id();
        {
            let mut state = manager.state.lock().await;
            state.queue.clear();
            state.used_nodes.insert("n1".to_string(), pid.clone());
            state.running_jobs.insert(id, vec![1]);
            state.running_tasks.insert(pid.clone(), running);
            state.reschedule.insert(pid.clone(), task);
        }

        let mut statuses = HashMap::new();
        statuses.insert(pid.clone(), TaskInfo::new(TaskStatus::Completed, 0.0));
        manager.handle_status_updates(statuses).await;

        let stats = manager.stats().await;
        assert_eq!(stats.running_tasks, 0);
        assert_eq!(stats.reschedule_tasks, 0);
        assert!(manager.is_job_complete(id).await);
    }

    #[tokio::test]
    async fn test_geo_fence_excludes_distant_nodes() {
        let manager = JobManager::new(test_config()).unwrap();

        let mut job = job_with_tasks(JobKind::Mobile, 0);
        let fence = GeoFence {
            min_latitude: 0.0,
            max_latitude: 5.0,
            min_longitude: 0.0,
            max_longitude: 5.0,
        };
        job.add_task(Task::new(1, 0, JobKind::Mobile, "cmd", "exe").with_geo_fence(fence));
        manager.submit(job).await;

        // the only online node is far outside the fence
        {
            let mut state = manager.state.lock().await;
            let mut record = NodeRecord::new("far", "10.0.0.1", 2021, 60.0, 60.0, crate::registry::NodeKind::Compute);
            record.note = Some("available".to_string());
            state.online_nodes.insert("far".to_string(), record);
        }

        manager.schedule_next().await;
        let stats = manager.stats().await;
        assert_eq!(stats.running_tasks, 0);
        assert_eq!(stats.queued_jobs, 1);
    }
}
