//! taskgrid-scheduler — resource pools and task scheduling for TaskGrid.
//!
//! Owns the clusters and workers work can run on, and the queue of tasks
//! waiting to run on them.
//!
//! # Architecture
//!
//! ```text
//! TaskScheduler
//!   ├── submit()   → validate, default, enqueue (priority 0..=10)
//!   ├── tick()     → sort by priority, take ready tasks up to capacity
//!   │     ├── PoolManager::select_cluster()           (cluster score)
//!   │     ├── PoolManager::select_worker_in_cluster() (Router strategy)
//!   │     ├── PoolManager::acquire() + BreakerRegistry::try_acquire()
//!   │     └── spawn ExecutionAdapter::execute() under the task timeout
//!   └── complete() → release, MetricsStore + breaker feedback,
//!                    then completed / retry with backoff / failed
//!
//! PoolManager
//!   ├── clusters → workers (load, status, capability)
//!   ├── capability table (per-category worker defaults)
//!   └── aggregate ClusterMetrics + per-worker routing weights
//! ```
//!
//! Tasks with no available worker go back to the head of the queue;
//! exhausted retries and unknown clusters end the task as failed.

pub mod adapter;
pub mod capability;
pub mod error;
pub mod pool;
pub mod scheduler;

pub use adapter::{ExecuteFuture, ExecutionAdapter, ExecutionOutput, ExecutionRejection};
pub use capability::{profile_for, CapabilityProfile};
pub use error::{PoolError, PoolResult, SchedulerError, SchedulerResult};
pub use pool::{
    aggregate_metrics, cluster_score, ClusterSnapshot, PoolManager, Selection, TaskProfile,
    WorkerSpec,
};
pub use scheduler::{SchedulerStats, TaskScheduler, TickReport};
