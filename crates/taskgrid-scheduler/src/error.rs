//! Pool and scheduler error types.

use thiserror::Error;

use crate::adapter::ExecutionRejection;

/// Errors raised by the resource pool manager.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("cluster already exists: {0}")]
    ClusterExists(String),

    #[error("worker not found: {0}")]
    WorkerNotFound(String),

    #[error("worker is not idle: {0}")]
    WorkerBusy(String),

    #[error("scaling bounds for cluster {cluster_id}: {reason}")]
    ScalingBounds { cluster_id: String, reason: String },

    #[error("no worker available in cluster {0}")]
    NoWorkerAvailable(String),
}

pub type PoolResult<T> = Result<T, PoolError>;

/// Errors that can occur during scheduling operations.
///
/// Inside a tick these never propagate: they become the task's `error`
/// field or a re-queue.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid task: {0}")]
    Validation(String),

    #[error("no worker available: {0}")]
    NoWorkerAvailable(String),

    #[error("execution failed [{code}]: {message}")]
    Execution { code: String, message: String },

    #[error("task {task_id} failed after {retry_count} retries: {message}")]
    Failed {
        task_id: String,
        message: String,
        retry_count: u32,
    },

    #[error("circuit open for worker {0}")]
    CircuitOpen(String),

    #[error("cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("worker not found: {0}")]
    WorkerNotFound(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("task {task_id} cannot be cancelled while {status}")]
    NotCancellable { task_id: String, status: String },

    #[error("pool error: {0}")]
    Pool(PoolError),
}

impl SchedulerError {
    /// Stable code recorded in a task's failure.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Validation(_) => "VALIDATION",
            SchedulerError::NoWorkerAvailable(_) => "NO_WORKER_AVAILABLE",
            SchedulerError::Execution { .. } => "EXECUTION_ERROR",
            SchedulerError::Failed { .. } => "FAILED",
            SchedulerError::CircuitOpen(_) => "CIRCUIT_OPEN",
            SchedulerError::ClusterNotFound(_) => "CLUSTER_NOT_FOUND",
            SchedulerError::WorkerNotFound(_) => "WORKER_NOT_FOUND",
            SchedulerError::TaskNotFound(_) => "TASK_NOT_FOUND",
            SchedulerError::NotCancellable { .. } => "NOT_CANCELLABLE",
            SchedulerError::Pool(_) => "POOL_ERROR",
        }
    }

    /// Whether a placement error can never clear on a later tick.
    ///
    /// Fatal errors fail the task without consuming a retry; the rest
    /// re-queue it.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            SchedulerError::NoWorkerAvailable(_) | SchedulerError::CircuitOpen(_)
        )
    }
}

impl From<PoolError> for SchedulerError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::ClusterNotFound(id) => SchedulerError::ClusterNotFound(id),
            PoolError::WorkerNotFound(id) => SchedulerError::WorkerNotFound(id),
            PoolError::NoWorkerAvailable(id) => SchedulerError::NoWorkerAvailable(id),
            other => SchedulerError::Pool(other),
        }
    }
}

impl From<ExecutionRejection> for SchedulerError {
    fn from(rejection: ExecutionRejection) -> Self {
        SchedulerError::Execution {
            code: rejection.code,
            message: rejection.message,
        }
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
