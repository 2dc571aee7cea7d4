//! Autoscaler — utilization-driven worker scaling.
//!
//! Reads a snapshot of each cluster from the pool manager, decides whether
//! it needs one more or one fewer worker, and applies the decision through
//! the pool manager. Failures are logged and never propagate to the caller.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use taskgrid_core::{ClusterId, EventBus, GridEvent, WorkerId};
use taskgrid_scheduler::{ClusterSnapshot, PoolManager, WorkerSpec};

/// A scaling decision for a single cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Add one worker.
    ScaleUp,
    /// Remove this idle worker.
    ScaleDown(WorkerId),
    NoChange,
}

/// Per-cluster cooldown tracking.
#[derive(Debug, Default)]
struct ScaleState {
    last_scale_up: Option<Instant>,
    last_scale_down: Option<Instant>,
}

fn cooled_down(last: Option<Instant>, cooldown_ms: u64, now: Instant) -> bool {
    last.is_none_or(|at| now.saturating_duration_since(at) >= Duration::from_millis(cooldown_ms))
}

pub struct Autoscaler {
    pool: PoolManager,
    events: EventBus,
    scale_states: HashMap<ClusterId, ScaleState>,
}

impl Autoscaler {
    pub fn new(pool: PoolManager, events: EventBus) -> Self {
        Self {
            pool,
            events,
            scale_states: HashMap::new(),
        }
    }

    /// Decide what one cluster needs at `now`.
    ///
    /// A returned `ScaleUp`/`ScaleDown` starts the corresponding cooldown.
    pub fn evaluate(&mut self, snapshot: &ClusterSnapshot, now: Instant) -> ScaleDecision {
        let cluster_id = &snapshot.metrics.cluster_id;
        let scaling = &snapshot.scaling;
        let utilization = snapshot.metrics.utilization;
        let worker_count = snapshot.workers.len() as u32;
        let state = self.scale_states.entry(cluster_id.clone()).or_default();

        if utilization > scaling.scale_up_threshold && worker_count < scaling.max_workers {
            if !cooled_down(state.last_scale_up, scaling.scale_up_cooldown_ms, now) {
                debug!(%cluster_id, utilization, "scale-up suppressed by cooldown");
                return ScaleDecision::NoChange;
            }
            state.last_scale_up = Some(now);
            debug!(
                %cluster_id,
                from = worker_count,
                to = worker_count + 1,
                utilization,
                threshold = scaling.scale_up_threshold,
                "scaling up"
            );
            return ScaleDecision::ScaleUp;
        }

        if utilization < scaling.scale_down_threshold && worker_count > scaling.min_workers {
            if !cooled_down(state.last_scale_down, scaling.scale_down_cooldown_ms, now) {
                debug!(%cluster_id, utilization, "scale-down suppressed by cooldown");
                return ScaleDecision::NoChange;
            }
            let Some(victim) = snapshot
                .workers
                .iter()
                .filter(|w| w.is_idle())
                .min_by_key(|w| w.load)
            else {
                debug!(%cluster_id, utilization, "no idle worker to remove");
                return ScaleDecision::NoChange;
            };
            state.last_scale_down = Some(now);
            debug!(
                %cluster_id,
                from = worker_count,
                to = worker_count - 1,
                worker_id = %victim.id,
                utilization,
                threshold = scaling.scale_down_threshold,
                "scaling down"
            );
            return ScaleDecision::ScaleDown(victim.id.clone());
        }

        ScaleDecision::NoChange
    }

    /// Evaluate every cluster and apply the decisions.
    pub async fn evaluate_all(&mut self) -> Vec<(ClusterId, ScaleDecision)> {
        let now = Instant::now();
        let snapshots = self.pool.snapshots().await;
        let mut decisions = Vec::with_capacity(snapshots.len());

        for snapshot in &snapshots {
            let cluster_id = snapshot.metrics.cluster_id.clone();
            let decision = self.evaluate(snapshot, now);
            let applied = match &decision {
                ScaleDecision::ScaleUp => self.scale_up(&cluster_id).await,
                ScaleDecision::ScaleDown(worker_id) => self.scale_down(&cluster_id, worker_id).await,
                ScaleDecision::NoChange => true,
            };
            decisions.push((
                cluster_id,
                if applied { decision } else { ScaleDecision::NoChange },
            ));
        }

        decisions
    }

    /// Autoscale tick. Returns how many clusters changed size.
    pub async fn tick(&mut self) -> usize {
        self.evaluate_all()
            .await
            .iter()
            .filter(|(_, d)| *d != ScaleDecision::NoChange)
            .count()
    }

    async fn scale_up(&self, cluster_id: &str) -> bool {
        let worker = match self.pool.add_worker(cluster_id, WorkerSpec::default()).await {
            Ok(worker) => worker,
            Err(e) => {
                warn!(%cluster_id, error = %e, "scale-up failed");
                return false;
            }
        };
        match self.pool.cluster_metrics(cluster_id).await {
            Ok(metrics) => {
                info!(
                    %cluster_id,
                    worker_id = %worker.id,
                    workers = metrics.worker_count,
                    "cluster scaled up"
                );
                self.events.publish(GridEvent::ClusterScaledUp {
                    cluster_id: cluster_id.to_string(),
                    worker_id: worker.id,
                    metrics,
                });
            }
            Err(e) => warn!(%cluster_id, error = %e, "cluster vanished after scale-up"),
        }
        true
    }

    async fn scale_down(&self, cluster_id: &str, worker_id: &str) -> bool {
        if let Err(e) = self.pool.remove_worker(cluster_id, worker_id).await {
            warn!(%cluster_id, %worker_id, error = %e, "scale-down failed");
            return false;
        }
        match self.pool.cluster_metrics(cluster_id).await {
            Ok(metrics) => {
                info!(
                    %cluster_id,
                    %worker_id,
                    workers = metrics.worker_count,
                    "cluster scaled down"
                );
                self.events.publish(GridEvent::ClusterScaledDown {
                    cluster_id: cluster_id.to_string(),
                    worker_id: worker_id.to_string(),
                    metrics,
                });
            }
            Err(e) => warn!(%cluster_id, error = %e, "cluster vanished after scale-down"),
        }
        true
    }
}
