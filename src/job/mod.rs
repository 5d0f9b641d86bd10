//! Job and task data model
//!
//! One canonical schema for jobs and tasks shared by the scheduler, the
//! node agent, and the wire protocol. A job owns a map of tasks; a task
//! bound to a node becomes a [`RunningTask`] identified by its process id
//! `"<jobId>_<taskId>"`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default job priority. Lower values are scheduled first.
pub const DEFAULT_PRIORITY: i32 = 5;

// ============================================================================
// Kinds and Statuses
// ============================================================================

/// The kind of workload a job (and its tasks) carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobKind {
    Mobile,
    Stream,
    MapReduce,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mobile => write!(f, "MOBILE"),
            Self::Stream => write!(f, "STREAM"),
            Self::MapReduce => write!(f, "MAPREDUCE"),
        }
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "MOBILE" => Ok(Self::Mobile),
            "STREAM" => Ok(Self::Stream),
            "MAPREDUCE" => Ok(Self::MapReduce),
            other => Err(format!("unknown job kind: {other}")),
        }
    }
}

/// Lifecycle of a task as reported by the node running it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
    Error,
    /// Any status value this scheduler does not recognize. Logged and
    /// ignored rather than crashing on it.
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
            Self::Failed => "FAILED",
            Self::Error => "ERROR",
            Self::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

// ============================================================================
// Geo-fence
// ============================================================================

/// Optional bounding box restricting which nodes may run a task.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoFence {
    pub min_latitude: f64,
    pub max_latitude: f64,
    pub min_longitude: f64,
    pub max_longitude: f64,
}

impl GeoFence {
    /// Whether a coordinate falls inside the fence.
    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        latitude >= self.min_latitude
            && latitude <= self.max_latitude
            && longitude >= self.min_longitude
            && longitude <= self.max_longitude
    }
}

// ============================================================================
// Task
// ============================================================================

/// A single schedulable unit of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: u64,
    pub job_id: u64,
    pub kind: JobKind,
    pub status: TaskStatus,

    /// Input file staged for this task, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_file: Option<String>,

    pub command: String,
    pub executable: String,

    /// Location restriction for location-aware schedulers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo_fence: Option<GeoFence>,

    pub posted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a pending task for a job.
    pub fn new(id: u64, job_id: u64, kind: JobKind, command: impl Into<String>, executable: impl Into<String>) -> Self {
        Self {
            id,
            job_id,
            kind,
            status: TaskStatus::Pending,
            input_file: None,
            command: command.into(),
            executable: executable.into(),
            geo_fence: None,
            posted_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Attach an input file.
    pub fn with_input_file(mut self, input_file: impl Into<String>) -> Self {
        self.input_file = Some(input_file.into());
        self
    }

    /// Restrict execution to nodes inside the fence.
    pub fn with_geo_fence(mut self, fence: GeoFence) -> Self {
        self.geo_fence = Some(fence);
        self
    }

    /// Bind this task to a node, producing the dispatchable form.
    pub fn bind(mut self, node_id: impl Into<String>) -> RunningTask {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
        RunningTask {
            task: self,
            node_id: node_id.into(),
        }
    }

    /// Process id for this task: `"<jobId>_<taskId>"`.
    pub fn process_id(&self) -> String {
        process_id(self.job_id, self.id)
    }
}

/// A task bound to the node executing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningTask {
    #[serde(flatten)]
    pub task: Task,
    pub node_id: String,
}

impl RunningTask {
    /// Process id of the underlying task.
    pub fn process_id(&self) -> String {
        self.task.process_id()
    }

    /// Detach the node binding, returning a task ready to reschedule.
    pub fn unbind(mut self) -> Task {
        self.task.status = TaskStatus::Pending;
        self.task.started_at = None;
        self.task
    }
}

/// A point-in-time status report for one running task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub status: TaskStatus,
    /// Epoch millis of the report on the node's clock.
    pub updated_at_ms: i64,
    /// Load observed on the node while running the task.
    pub load: f64,
}

impl TaskInfo {
    pub fn new(status: TaskStatus, load: f64) -> Self {
        Self {
            status,
            updated_at_ms: Utc::now().timestamp_millis(),
            load,
        }
    }
}

/// Compose the `"<jobId>_<taskId>"` process id.
pub fn process_id(job_id: u64, task_id: u64) -> String {
    format!("{job_id}_{task_id}")
}

/// Split a process id back into `(jobId, taskId)`.
pub fn parse_process_id(process_id: &str) -> Option<(u64, u64)> {
    let (job, task) = process_id.split_once('_')?;
    Some((job.parse().ok()?, task.parse().ok()?))
}

// ============================================================================
// Job
// ============================================================================

/// A prioritized collection of tasks submitted by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: u64,
    /// Lower value = scheduled first.
    pub priority: i32,
    pub kind: JobKind,
    pub active: bool,
    pub complete: bool,

    /// Job ids that must complete before this job is eligible.
    #[serde(default)]
    pub dependencies: Vec<u64>,

    pub posted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub input_files: Vec<String>,
    pub command: String,
    pub executable: String,

    /// Keyed by task id in memory; carried as a sequence on the wire so
    /// the ids survive serde's content buffering (JSON map keys are
    /// strings, and internally-tagged envelopes do not coerce them back
    /// to integers).
    #[serde(with = "task_seq")]
    pub tasks: HashMap<u64, Task>,
}

mod task_seq {
    use super::Task;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::HashMap;

    pub fn serialize<S: Serializer>(tasks: &HashMap<u64, Task>, serializer: S) -> Result<S::Ok, S::Error> {
        let mut items: Vec<&Task> = tasks.values().collect();
        items.sort_by_key(|task| task.id);
        items.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<HashMap<u64, Task>, D::Error> {
        let items = Vec::<Task>::deserialize(deserializer)?;
        Ok(items.into_iter().map(|task| (task.id, task)).collect())
    }
}

impl Job {
    /// Create an active job with no tasks yet.
    pub fn new(id: u64, kind: JobKind, command: impl Into<String>, executable: impl Into<String>) -> Self {
        Self {
            id,
            priority: DEFAULT_PRIORITY,
            kind,
            active: true,
            complete: false,
            dependencies: Vec::new(),
            posted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            input_files: Vec::new(),
            command: command.into(),
            executable: executable.into(),
            tasks: HashMap::new(),
        }
    }

    /// Add a task, keyed by its id. Returns the new task count.
    pub fn add_task(&mut self, task: Task) -> usize {
        self.tasks.insert(task.id, task);
        self.tasks.len()
    }

    /// Declare a prerequisite job.
    pub fn add_dependency(&mut self, job_id: u64) {
        self.dependencies.push(job_id);
    }

    pub fn num_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Push the job toward the back of the queue after a partial tick.
    pub fn increase_priority_value(&mut self) {
        self.priority += 1;
    }

    /// Mark complete and stamp the completion time.
    pub fn mark_complete(&mut self) {
        self.complete = true;
        self.completed_at = Some(Utc::now());
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_id_round_trip() {
        let pid = process_id(3, 7);
        assert_eq!(pid, "3_7");
        assert_eq!(parse_process_id(&pid), Some((3, 7)));
        assert_eq!(parse_process_id("garbage"), None);
    }

    #[test]
    fn test_task_bind_and_unbind() {
        let task = Task::new(1, 9, JobKind::Mobile, "run", "app.bin");
        let running = task.bind("n1");
        assert_eq!(running.node_id, "n1");
        assert_eq!(running.task.status, TaskStatus::Running);
        assert_eq!(running.process_id(), "9_1");

        let back = running.unbind();
        assert_eq!(back.status, TaskStatus::Pending);
        assert!(back.started_at.is_none());
    }

    #[test]
    fn test_geo_fence_contains() {
        let fence = GeoFence {
            min_latitude: 0.0,
            max_latitude: 10.0,
            min_longitude: 0.0,
            max_longitude: 10.0,
        };
        assert!(fence.contains(5.0, 5.0));
        assert!(fence.contains(10.0, 10.0));
        assert!(!fence.contains(-1.0, 5.0));
    }

    #[test]
    fn test_job_task_count_invariant() {
        let mut job = Job::new(1, JobKind::Stream, "cmd", "exe");
        job.add_task(Task::new(1, 1, JobKind::Stream, "cmd", "exe"));
        job.add_task(Task::new(2, 1, JobKind::Stream, "cmd", "exe"));
        // re-adding the same id replaces, not duplicates
        job.add_task(Task::new(2, 1, JobKind::Stream, "cmd", "exe"));
        assert_eq!(job.num_tasks(), 2);
    }

    #[test]
    fn test_job_tasks_survive_serialization() {
        let mut job = Job::new(7, JobKind::Mobile, "cmd", "exe");
        job.add_task(Task::new(1, 7, JobKind::Mobile, "cmd", "exe"));
        job.add_task(Task::new(2, 7, JobKind::Mobile, "cmd", "exe"));

        let json = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tasks.len(), 2);
        assert_eq!(back.tasks[&1].id, 1);
        assert_eq!(back.tasks[&2].id, 2);
    }

    #[test]
    fn test_unknown_status_deserializes() {
        let info: TaskInfo =
            serde_json::from_str(r#"{"status":"SOMETHING_NEW","updated_at_ms":0,"load":0.5}"#).unwrap();
        assert_eq!(info.status, TaskStatus::Unknown);
    }

    #[test]
    fn test_priority_ordering_direction() {
        let mut job = Job::new(1, JobKind::Mobile, "c", "e");
        let before = job.priority;
        job.increase_priority_value();
        assert!(job.priority > before);
    }
}
