//! Observability events and the broadcast bus that carries them.
//!
//! Producers (scheduler, breaker registry, pool manager, autoscaler) publish
//! without knowing who listens; observers subscribe and receive every event
//! published after they subscribed.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::types::{ClusterId, ClusterMetrics, PerformanceRecord, TaskId, WorkerId};

/// An observable state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum GridEvent {
    WorkerRegistered {
        cluster_id: ClusterId,
        worker_id: WorkerId,
        metrics: PerformanceRecord,
    },
    TaskSubmitted {
        task_id: TaskId,
        priority: u8,
    },
    TaskAssigned {
        task_id: TaskId,
        cluster_id: ClusterId,
        worker_id: WorkerId,
        weight: f64,
    },
    TaskCompleted {
        task_id: TaskId,
        worker_id: WorkerId,
        metrics: Option<PerformanceRecord>,
    },
    TaskFailed {
        task_id: TaskId,
        worker_id: Option<WorkerId>,
        code: String,
        message: String,
        retry_count: u32,
        /// Delay before the next attempt; `None` when the failure is terminal.
        retry_in_ms: Option<u64>,
        metrics: Option<PerformanceRecord>,
    },
    TaskCancelled {
        task_id: TaskId,
    },
    CircuitOpened {
        worker_id: WorkerId,
        failure_count: u32,
        metrics: Option<PerformanceRecord>,
    },
    CircuitClosed {
        worker_id: WorkerId,
        metrics: Option<PerformanceRecord>,
    },
    ClusterScaledUp {
        cluster_id: ClusterId,
        worker_id: WorkerId,
        metrics: ClusterMetrics,
    },
    ClusterScaledDown {
        cluster_id: ClusterId,
        worker_id: WorkerId,
        metrics: ClusterMetrics,
    },
}

impl GridEvent {
    /// Stable event name, matching the serialized tag.
    pub fn name(&self) -> &'static str {
        match self {
            GridEvent::WorkerRegistered { .. } => "worker-registered",
            GridEvent::TaskSubmitted { .. } => "task-submitted",
            GridEvent::TaskAssigned { .. } => "task-assigned",
            GridEvent::TaskCompleted { .. } => "task-completed",
            GridEvent::TaskFailed { .. } => "task-failed",
            GridEvent::TaskCancelled { .. } => "task-cancelled",
            GridEvent::CircuitOpened { .. } => "circuit-opened",
            GridEvent::CircuitClosed { .. } => "circuit-closed",
            GridEvent::ClusterScaledUp { .. } => "cluster-scaled-up",
            GridEvent::ClusterScaledDown { .. } => "cluster-scaled-down",
        }
    }
}

/// Cheaply cloneable publish/subscribe handle.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<GridEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: GridEvent) {
        let name = event.name();
        match self.sender.send(event) {
            Ok(receivers) => trace!(event = name, receivers, "event published"),
            Err(_) => trace!(event = name, "event dropped, no subscribers"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GridEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
