//! Domain types shared across TaskGrid crates.
//!
//! Workers, clusters, tasks, and the performance records that the routing
//! engine consumes. Everything here is plain data; mutation rules live in
//! the crates that own each record.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Unique identifier for a worker (unique across all clusters).
pub type WorkerId = String;

/// Unique identifier for a cluster.
pub type ClusterId = String;

/// Unique identifier for a task.
pub type TaskId = String;

// ── Worker ────────────────────────────────────────────────────────

/// Lifecycle status of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Maintenance,
    Error,
    Offline,
}

impl WorkerStatus {
    /// Whether new work may be routed to a worker in this status.
    pub fn accepts_work(self) -> bool {
        matches!(self, WorkerStatus::Idle | WorkerStatus::Busy)
    }
}

/// Point-in-time resource usage reported for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub memory_bytes: u64,
    /// CPU usage as a percentage (0.0–100.0).
    pub cpu_percent: f64,
}

/// An executable unit owned by exactly one cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub cluster_id: ClusterId,
    /// Capability/specialty tag matched against task requirements.
    pub capability: String,
    /// Capability-table category used to derive defaults.
    pub category: String,
    pub status: WorkerStatus,
    /// In-flight task count. Never exceeds `max_concurrency`.
    pub load: u32,
    pub max_concurrency: u32,
    pub resources: ResourceUsage,
    /// Unix timestamp (milliseconds) when the worker was created.
    pub created_at: u64,
}

impl Worker {
    /// Whether the worker can take one more task right now.
    pub fn has_headroom(&self) -> bool {
        self.load < self.max_concurrency
    }

    /// Idle means no in-flight work and an idle status.
    pub fn is_idle(&self) -> bool {
        self.status == WorkerStatus::Idle && self.load == 0
    }
}

// ── Performance ───────────────────────────────────────────────────

/// Derived health of a worker, recomputed on every metrics update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Failing,
    CircuitOpen,
}

/// Rolling performance statistics for a single worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub worker_id: WorkerId,
    /// Rolling success rate (0.0–1.0).
    pub success_rate: f64,
    /// Rolling average latency in milliseconds.
    pub avg_latency_ms: f64,
    /// Rolling average cost per task.
    pub avg_cost: f64,
    pub total_requests: u64,
    pub error_count: u64,
    /// Unix timestamp (milliseconds) of the last update.
    pub last_updated: u64,
    pub health: HealthStatus,
    /// Set by the circuit breaker while the worker's circuit is open.
    pub circuit_open: bool,
}

impl PerformanceRecord {
    /// A fresh record seeded with baseline latency and cost expectations.
    pub fn new(worker_id: &str, baseline_latency_ms: f64, baseline_cost: f64) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            success_rate: 1.0,
            avg_latency_ms: baseline_latency_ms,
            avg_cost: baseline_cost,
            total_requests: 0,
            error_count: 0,
            last_updated: epoch_millis(),
            health: HealthStatus::Healthy,
            circuit_open: false,
        }
    }
}

// ── Cluster ───────────────────────────────────────────────────────

/// How a cluster picks among its eligible workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    RoundRobin,
    LeastConnections,
    #[default]
    PerformanceBased,
}

/// Aggregated view of a cluster, refreshed on the metrics tick.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ClusterMetrics {
    pub cluster_id: ClusterId,
    pub worker_count: u32,
    pub idle_workers: u32,
    pub total_load: u32,
    pub total_capacity: u32,
    /// In-flight load over total capacity (0.0–1.0).
    pub utilization: f64,
    pub avg_latency_ms: f64,
    /// Errors over requests across all workers (0.0–1.0).
    pub error_rate: f64,
    pub avg_success_rate: f64,
    pub updated_at: u64,
}

impl ClusterMetrics {
    /// Fraction of workers that are idle (0.0 when the cluster is empty).
    pub fn idle_fraction(&self) -> f64 {
        if self.worker_count == 0 {
            0.0
        } else {
            self.idle_workers as f64 / self.worker_count as f64
        }
    }
}

// ── Task ──────────────────────────────────────────────────────────

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Assigned,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Requirements as supplied on submission. Missing fields take defaults
/// from the scheduler configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskRequirements {
    pub capability: Option<String>,
    /// 0 (lowest) to 10 (highest).
    pub priority: Option<u8>,
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    /// Pin the task to a specific cluster.
    pub cluster_id: Option<ClusterId>,
    /// Minimum worker success rate (0.0–1.0).
    pub min_quality: Option<f64>,
    /// Maximum average cost per task.
    pub max_cost: Option<f64>,
}

/// Requirements after defaults have been applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirements {
    pub capability: Option<String>,
    pub priority: u8,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub cluster_id: Option<ClusterId>,
    pub min_quality: Option<f64>,
    pub max_cost: Option<f64>,
}

/// A unit of work as submitted by a caller.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskSubmission {
    /// Caller-chosen ID; generated when absent.
    #[serde(default)]
    pub id: Option<TaskId>,
    pub task_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub requirements: TaskRequirements,
}

/// Where a task was placed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub cluster_id: ClusterId,
    pub worker_id: WorkerId,
    /// Unix timestamp (milliseconds).
    pub assigned_at: u64,
    /// Routing weight of the chosen worker at selection time.
    pub weight: f64,
}

/// Successful execution result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub output: serde_json::Value,
    pub latency_ms: f64,
    pub cost: f64,
    pub tokens: Option<u64>,
}

/// Failure recorded on a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub code: String,
    pub message: String,
    /// Retries consumed when this failure was recorded.
    pub retry_count: u32,
}

/// A task tracked by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: String,
    pub payload: serde_json::Value,
    pub requirements: Requirements,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub assignment: Option<Assignment>,
    pub result: Option<TaskOutput>,
    pub error: Option<TaskFailure>,
    /// Unix timestamp (milliseconds).
    pub submitted_at: u64,
    pub completed_at: Option<u64>,
    /// Earliest instant a retry may be dispatched.
    #[serde(skip)]
    pub not_before: Option<tokio::time::Instant>,
}

impl Task {
    /// Whether the task may be dispatched at `now`.
    pub fn is_ready(&self, now: tokio::time::Instant) -> bool {
        self.not_before.is_none_or(|at| at <= now)
    }
}

/// Current Unix epoch in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
