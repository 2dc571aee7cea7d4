//! Resource pool manager — clusters and the workers they own.
//!
//! One owning registry holds every cluster, indexed by ID, with each
//! cluster exclusively owning its workers, routing-weight cache, and
//! connection table. All mutation goes through methods that keep the
//! invariants: a worker's load never exceeds its max concurrency, cluster
//! size stays within `[min_workers, max_workers]`, and only idle workers
//! are removed.
//!
//! Lock order is pool → breakers → metrics; the router mutex is only taken
//! while the pool lock is held.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use taskgrid_core::{
    epoch_millis, ClusterConfig, ClusterId, ClusterMetrics, EventBus, GridConfig, GridEvent,
    PerformanceRecord, QualityThresholds, Requirements, ResourceUsage, ScalingConfig, Worker,
    WorkerId, WorkerStatus,
};
use taskgrid_health::BreakerRegistry;
use taskgrid_metrics::MetricsStore;
use taskgrid_placement::{Candidate, RoundRobinBalancer, RouteConstraints, Router};

use crate::capability;
use crate::error::{PoolError, PoolResult};

/// What a task needs from a worker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskProfile {
    pub capability: Option<String>,
    pub min_quality: Option<f64>,
    pub max_cost: Option<f64>,
}

impl From<&Requirements> for TaskProfile {
    fn from(req: &Requirements) -> Self {
        Self {
            capability: req.capability.clone(),
            min_quality: req.min_quality,
            max_cost: req.max_cost,
        }
    }
}

/// Overrides for a new worker; unset fields come from the cluster.
#[derive(Debug, Clone, Default)]
pub struct WorkerSpec {
    pub category: Option<String>,
    pub capability: Option<String>,
    pub max_concurrency: Option<u32>,
}

/// A worker chosen for a task.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub cluster_id: ClusterId,
    pub worker_id: WorkerId,
    pub weight: f64,
    pub rationale: String,
}

/// Point-in-time copy of a cluster, for the autoscaler and observers.
#[derive(Debug, Clone)]
pub struct ClusterSnapshot {
    pub metrics: ClusterMetrics,
    pub scaling: ScalingConfig,
    pub workers: Vec<Worker>,
}

struct ClusterSlot {
    config: ClusterConfig,
    scaling: ScalingConfig,
    workers: BTreeMap<WorkerId, Worker>,
    /// Last routing weight computed per worker.
    weights: HashMap<WorkerId, f64>,
    connections: HashMap<WorkerId, u32>,
    metrics: ClusterMetrics,
    balancer: RoundRobinBalancer,
    next_seq: u32,
}

impl ClusterSlot {
    fn new(config: ClusterConfig, scaling: ScalingConfig) -> Self {
        let metrics = ClusterMetrics {
            cluster_id: config.id.clone(),
            updated_at: epoch_millis(),
            ..Default::default()
        };
        Self {
            config,
            scaling,
            workers: BTreeMap::new(),
            weights: HashMap::new(),
            connections: HashMap::new(),
            metrics,
            balancer: RoundRobinBalancer::new(),
            next_seq: 0,
        }
    }

    fn serves(&self, capability: &str) -> bool {
        self.config.capability == capability
            || self.workers.values().any(|w| w.capability == capability)
    }

    fn worker_ids(&self) -> Vec<WorkerId> {
        self.workers.keys().cloned().collect()
    }
}

#[derive(Default)]
struct PoolState {
    clusters: HashMap<ClusterId, ClusterSlot>,
    /// Cluster IDs in creation order, for stable iteration and tie-breaks.
    order: Vec<ClusterId>,
}

/// Owns every cluster and worker.
#[derive(Clone)]
pub struct PoolManager {
    state: Arc<RwLock<PoolState>>,
    default_scaling: ScalingConfig,
    thresholds: QualityThresholds,
    metrics: MetricsStore,
    breakers: BreakerRegistry,
    router: Arc<Mutex<Router>>,
    events: EventBus,
}

impl PoolManager {
    pub fn new(
        config: &GridConfig,
        metrics: MetricsStore,
        breakers: BreakerRegistry,
        events: EventBus,
    ) -> Self {
        Self {
            state: Arc::new(RwLock::new(PoolState::default())),
            default_scaling: config.scaling.clone(),
            thresholds: config.quality.clone(),
            metrics,
            breakers,
            router: Arc::new(Mutex::new(Router::new(&config.routing))),
            events,
        }
    }

    pub fn metrics(&self) -> &MetricsStore {
        &self.metrics
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Register a cluster, then populate it with `min_workers` workers.
    ///
    /// The cluster exists before any worker references it.
    pub async fn create_cluster(&self, config: &ClusterConfig) -> PoolResult<ClusterMetrics> {
        let scaling = config
            .scaling
            .clone()
            .unwrap_or_else(|| self.default_scaling.clone());

        {
            let mut state = self.state.write().await;
            if state.clusters.contains_key(&config.id) {
                return Err(PoolError::ClusterExists(config.id.clone()));
            }
            state
                .clusters
                .insert(config.id.clone(), ClusterSlot::new(config.clone(), scaling.clone()));
            state.order.push(config.id.clone());
        }

        info!(
            cluster_id = %config.id,
            capability = %config.capability,
            category = %config.category,
            min_workers = scaling.min_workers,
            max_workers = scaling.max_workers,
            "cluster registered"
        );

        for _ in 0..scaling.min_workers {
            self.add_worker(&config.id, WorkerSpec::default()).await?;
        }

        self.cluster_metrics(&config.id).await
    }

    /// Add one worker with defaults from the capability table.
    pub async fn add_worker(&self, cluster_id: &str, spec: WorkerSpec) -> PoolResult<Worker> {
        let mut state = self.state.write().await;
        let slot = state
            .clusters
            .get_mut(cluster_id)
            .ok_or_else(|| PoolError::ClusterNotFound(cluster_id.to_string()))?;

        if slot.workers.len() as u32 >= slot.scaling.max_workers {
            return Err(PoolError::ScalingBounds {
                cluster_id: cluster_id.to_string(),
                reason: format!("already at max_workers ({})", slot.scaling.max_workers),
            });
        }

        let category = spec.category.unwrap_or_else(|| slot.config.category.clone());
        let profile = capability::profile_for(&category);
        slot.next_seq += 1;
        let worker = Worker {
            id: format!("{cluster_id}-w{:03}", slot.next_seq),
            cluster_id: cluster_id.to_string(),
            capability: spec
                .capability
                .unwrap_or_else(|| slot.config.capability.clone()),
            category,
            status: WorkerStatus::Idle,
            load: 0,
            max_concurrency: spec
                .max_concurrency
                .or(slot.config.max_concurrency)
                .unwrap_or(profile.max_concurrency)
                .max(1),
            resources: ResourceUsage::default(),
            created_at: epoch_millis(),
        };

        slot.workers.insert(worker.id.clone(), worker.clone());
        slot.connections.insert(worker.id.clone(), 0);
        let worker_count = slot.workers.len();

        self.breakers.register(&worker.id).await;
        let record = self
            .metrics
            .register(&worker.id, profile.expected_latency_ms, profile.cost_per_task)
            .await;

        info!(
            %cluster_id,
            worker_id = %worker.id,
            capability = %worker.capability,
            max_concurrency = worker.max_concurrency,
            worker_count,
            "worker registered"
        );
        self.events.publish(GridEvent::WorkerRegistered {
            cluster_id: cluster_id.to_string(),
            worker_id: worker.id.clone(),
            metrics: record,
        });

        Ok(worker)
    }

    /// Remove a worker. Fails unless the worker has no in-flight work and
    /// the cluster stays at or above `min_workers`.
    pub async fn remove_worker(&self, cluster_id: &str, worker_id: &str) -> PoolResult<Worker> {
        let removed = {
            let mut state = self.state.write().await;
            let slot = state
                .clusters
                .get_mut(cluster_id)
                .ok_or_else(|| PoolError::ClusterNotFound(cluster_id.to_string()))?;

            let worker = slot
                .workers
                .get(worker_id)
                .ok_or_else(|| PoolError::WorkerNotFound(worker_id.to_string()))?;
            if worker.load > 0 || worker.status == WorkerStatus::Busy {
                return Err(PoolError::WorkerBusy(worker_id.to_string()));
            }
            if slot.workers.len() as u32 <= slot.scaling.min_workers {
                return Err(PoolError::ScalingBounds {
                    cluster_id: cluster_id.to_string(),
                    reason: format!("already at min_workers ({})", slot.scaling.min_workers),
                });
            }

            slot.weights.remove(worker_id);
            slot.connections.remove(worker_id);
            slot.workers
                .remove(worker_id)
                .ok_or_else(|| PoolError::WorkerNotFound(worker_id.to_string()))?
        };

        self.breakers.unregister(worker_id).await;
        self.metrics.unregister(worker_id).await;

        info!(%cluster_id, %worker_id, "worker removed");
        Ok(removed)
    }

    /// Pick the best cluster for a task, or `None` if no cluster can place
    /// it right now.
    ///
    /// A cluster is only scored when at least one of its workers accepts
    /// work, has headroom, matches the capability, and has a dispatchable
    /// circuit. Ties go to the earliest-created cluster.
    pub async fn select_cluster(&self, profile: &TaskProfile) -> Option<ClusterId> {
        let state = self.state.read().await;
        let mut best: Option<(ClusterId, f64)> = None;

        for id in &state.order {
            let Some(slot) = state.clusters.get(id) else {
                continue;
            };
            if let Some(capability) = &profile.capability {
                if !slot.serves(capability) {
                    continue;
                }
            }
            let open: Vec<WorkerId> = slot
                .workers
                .values()
                .filter(|w| w.status.accepts_work() && w.has_headroom())
                .filter(|w| profile.capability.as_ref().is_none_or(|c| &w.capability == c))
                .map(|w| w.id.clone())
                .collect();
            let breakers = self.breakers.snapshots(&open).await;
            if !open
                .iter()
                .any(|w| breakers.get(w).is_none_or(|b| b.dispatchable))
            {
                debug!(cluster_id = %id, "cluster has no placeable worker");
                continue;
            }

            let metrics = self.aggregate(slot).await;
            let score = cluster_score(&metrics, self.thresholds.max_latency_ms);
            debug!(cluster_id = %id, score, utilization = metrics.utilization, "cluster scored");

            if best.as_ref().is_none_or(|(_, s)| score > *s) {
                best = Some((id.clone(), score));
            }
        }

        best.map(|(id, _)| id)
    }

    /// Pick a worker inside a cluster using the cluster's strategy.
    ///
    /// Only workers that accept work, have headroom, and match the
    /// capability are offered to the router.
    pub async fn select_worker_in_cluster(
        &self,
        cluster_id: &str,
        profile: &TaskProfile,
    ) -> PoolResult<Selection> {
        let state = self.state.read().await;
        let slot = state
            .clusters
            .get(cluster_id)
            .ok_or_else(|| PoolError::ClusterNotFound(cluster_id.to_string()))?;

        let eligible: Vec<&Worker> = slot
            .workers
            .values()
            .filter(|w| w.status.accepts_work() && w.has_headroom())
            .filter(|w| profile.capability.as_ref().is_none_or(|c| &w.capability == c))
            .collect();
        if eligible.is_empty() {
            return Err(PoolError::NoWorkerAvailable(cluster_id.to_string()));
        }

        let ids: Vec<WorkerId> = eligible.iter().map(|w| w.id.clone()).collect();
        let breakers = self.breakers.snapshots(&ids).await;
        let records = self.metrics.get_many(&ids).await;

        let candidates: Vec<Candidate> = eligible
            .iter()
            .filter_map(|w| {
                let record = records.get(&w.id)?.clone();
                Some(Candidate {
                    worker_id: w.id.clone(),
                    record,
                    dispatchable: breakers.get(&w.id).is_none_or(|b| b.dispatchable),
                    connections: slot.connections.get(&w.id).copied().unwrap_or(0),
                })
            })
            .collect();

        let constraints = RouteConstraints {
            min_quality: profile.min_quality,
            max_cost: profile.max_cost,
            max_latency_ms: self.thresholds.max_latency_ms,
        };

        let decision = self
            .router
            .lock()
            .await
            .select_with_strategy(slot.config.strategy, &candidates, &constraints, &slot.balancer)
            .ok_or_else(|| PoolError::NoWorkerAvailable(cluster_id.to_string()))?;

        Ok(Selection {
            cluster_id: cluster_id.to_string(),
            worker_id: decision.worker_id,
            weight: decision.weight,
            rationale: decision.rationale,
        })
    }

    /// Claim one slot on a worker: load and connections go up by one.
    pub async fn acquire(&self, cluster_id: &str, worker_id: &str) -> PoolResult<Worker> {
        let mut state = self.state.write().await;
        let slot = state
            .clusters
            .get_mut(cluster_id)
            .ok_or_else(|| PoolError::ClusterNotFound(cluster_id.to_string()))?;
        let worker = slot
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| PoolError::WorkerNotFound(worker_id.to_string()))?;

        if !worker.status.accepts_work() || !worker.has_headroom() {
            return Err(PoolError::NoWorkerAvailable(cluster_id.to_string()));
        }

        worker.load += 1;
        worker.status = WorkerStatus::Busy;
        let load = worker.load;
        let snapshot = worker.clone();
        *slot.connections.entry(worker_id.to_string()).or_insert(0) += 1;

        debug!(%cluster_id, %worker_id, load, "worker slot acquired");
        Ok(snapshot)
    }

    /// Return a slot claimed with [`PoolManager::acquire`].
    pub async fn release(&self, cluster_id: &str, worker_id: &str) -> PoolResult<()> {
        let mut state = self.state.write().await;
        let slot = state
            .clusters
            .get_mut(cluster_id)
            .ok_or_else(|| PoolError::ClusterNotFound(cluster_id.to_string()))?;
        let worker = slot
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| PoolError::WorkerNotFound(worker_id.to_string()))?;

        if worker.load == 0 {
            warn!(%cluster_id, %worker_id, "release without matching acquire");
        }
        worker.load = worker.load.saturating_sub(1);
        if worker.load == 0 && worker.status == WorkerStatus::Busy {
            worker.status = WorkerStatus::Idle;
        }
        let load = worker.load;
        if let Some(count) = slot.connections.get_mut(worker_id) {
            *count = count.saturating_sub(1);
        }

        debug!(%cluster_id, %worker_id, load, "worker slot released");
        Ok(())
    }

    /// Administrative status change (maintenance, offline, back to idle).
    ///
    /// `Idle` and `Busy` are reconciled with the worker's load.
    pub async fn set_worker_status(
        &self,
        cluster_id: &str,
        worker_id: &str,
        status: WorkerStatus,
    ) -> PoolResult<Worker> {
        let mut state = self.state.write().await;
        let worker = worker_mut(&mut state, cluster_id, worker_id)?;

        let previous = worker.status;
        worker.status = match status {
            WorkerStatus::Idle | WorkerStatus::Busy if worker.load > 0 => WorkerStatus::Busy,
            WorkerStatus::Idle | WorkerStatus::Busy => WorkerStatus::Idle,
            other => other,
        };

        info!(%cluster_id, %worker_id, from = ?previous, to = ?worker.status, "worker status set");
        Ok(worker.clone())
    }

    /// Record a resource-usage report for a worker.
    pub async fn update_resources(
        &self,
        cluster_id: &str,
        worker_id: &str,
        usage: ResourceUsage,
    ) -> PoolResult<()> {
        let mut state = self.state.write().await;
        let worker = worker_mut(&mut state, cluster_id, worker_id)?;
        worker.resources = usage;
        debug!(
            %cluster_id,
            %worker_id,
            memory_bytes = usage.memory_bytes,
            cpu_percent = usage.cpu_percent,
            "resource usage updated"
        );
        Ok(())
    }

    /// Current aggregated metrics for one cluster.
    pub async fn cluster_metrics(&self, cluster_id: &str) -> PoolResult<ClusterMetrics> {
        let state = self.state.read().await;
        let slot = state
            .clusters
            .get(cluster_id)
            .ok_or_else(|| PoolError::ClusterNotFound(cluster_id.to_string()))?;
        Ok(self.aggregate(slot).await)
    }

    /// Metrics-collection tick: recompute every cluster's aggregate and the
    /// per-worker routing-weight cache.
    pub async fn refresh_cluster_metrics(&self) -> Vec<ClusterMetrics> {
        let mut state = self.state.write().await;
        let order = state.order.clone();
        let mut refreshed = Vec::with_capacity(order.len());

        for id in &order {
            let Some(slot) = state.clusters.get_mut(id) else {
                continue;
            };
            let ids = slot.worker_ids();
            let breakers = self.breakers.snapshots(&ids).await;
            let records = self.metrics.get_many(&ids).await;

            let candidates: Vec<Candidate> = slot
                .workers
                .values()
                .filter_map(|w| {
                    Some(Candidate {
                        worker_id: w.id.clone(),
                        record: records.get(&w.id)?.clone(),
                        dispatchable: breakers.get(&w.id).is_none_or(|b| b.dispatchable),
                        connections: slot.connections.get(&w.id).copied().unwrap_or(0),
                    })
                })
                .collect();
            let constraints = RouteConstraints {
                max_latency_ms: self.thresholds.max_latency_ms,
                ..Default::default()
            };
            let scored = self.router.lock().await.calculate_weights(&candidates, &constraints);
            slot.weights = scored.into_iter().map(|w| (w.worker_id, w.weight)).collect();

            slot.metrics = aggregate_metrics(id, slot.workers.values(), &records);
            debug!(
                cluster_id = %id,
                workers = slot.metrics.worker_count,
                utilization = slot.metrics.utilization,
                error_rate = slot.metrics.error_rate,
                "cluster metrics refreshed"
            );
            refreshed.push(slot.metrics.clone());
        }

        refreshed
    }

    /// Routing weights from the last metrics refresh.
    ///
    /// Workers whose circuit is no longer dispatchable read as 0 even if the
    /// refresh predates the trip.
    pub async fn worker_weights(&self, cluster_id: &str) -> PoolResult<HashMap<WorkerId, f64>> {
        let state = self.state.read().await;
        let slot = state
            .clusters
            .get(cluster_id)
            .ok_or_else(|| PoolError::ClusterNotFound(cluster_id.to_string()))?;
        let ids: Vec<WorkerId> = slot.weights.keys().cloned().collect();
        let breakers = self.breakers.snapshots(&ids).await;
        Ok(slot
            .weights
            .iter()
            .map(|(id, weight)| {
                let blocked = breakers.get(id).is_some_and(|b| !b.dispatchable);
                (id.clone(), if blocked { 0.0 } else { *weight })
            })
            .collect())
    }

    pub async fn snapshot(&self, cluster_id: &str) -> PoolResult<ClusterSnapshot> {
        let state = self.state.read().await;
        let slot = state
            .clusters
            .get(cluster_id)
            .ok_or_else(|| PoolError::ClusterNotFound(cluster_id.to_string()))?;
        Ok(ClusterSnapshot {
            metrics: self.aggregate(slot).await,
            scaling: slot.scaling.clone(),
            workers: slot.workers.values().cloned().collect(),
        })
    }

    /// Snapshots of every cluster, in creation order.
    pub async fn snapshots(&self) -> Vec<ClusterSnapshot> {
        let state = self.state.read().await;
        let mut snapshots = Vec::with_capacity(state.order.len());
        for id in &state.order {
            if let Some(slot) = state.clusters.get(id) {
                snapshots.push(ClusterSnapshot {
                    metrics: self.aggregate(slot).await,
                    scaling: slot.scaling.clone(),
                    workers: slot.workers.values().cloned().collect(),
                });
            }
        }
        snapshots
    }

    pub async fn cluster_ids(&self) -> Vec<ClusterId> {
        self.state.read().await.order.clone()
    }

    pub async fn workers(&self, cluster_id: &str) -> PoolResult<Vec<Worker>> {
        let state = self.state.read().await;
        let slot = state
            .clusters
            .get(cluster_id)
            .ok_or_else(|| PoolError::ClusterNotFound(cluster_id.to_string()))?;
        Ok(slot.workers.values().cloned().collect())
    }

    pub async fn worker(&self, worker_id: &str) -> Option<Worker> {
        let state = self.state.read().await;
        state
            .clusters
            .values()
            .find_map(|slot| slot.workers.get(worker_id).cloned())
    }

    async fn aggregate(&self, slot: &ClusterSlot) -> ClusterMetrics {
        let records = self.metrics.get_many(&slot.worker_ids()).await;
        aggregate_metrics(&slot.config.id, slot.workers.values(), &records)
    }
}

fn worker_mut<'a>(
    state: &'a mut PoolState,
    cluster_id: &str,
    worker_id: &str,
) -> PoolResult<&'a mut Worker> {
    state
        .clusters
        .get_mut(cluster_id)
        .ok_or_else(|| PoolError::ClusterNotFound(cluster_id.to_string()))?
        .workers
        .get_mut(worker_id)
        .ok_or_else(|| PoolError::WorkerNotFound(worker_id.to_string()))
}

/// Fold a cluster's workers and their performance records into one view.
pub fn aggregate_metrics<'a>(
    cluster_id: &str,
    workers: impl IntoIterator<Item = &'a Worker>,
    records: &HashMap<WorkerId, PerformanceRecord>,
) -> ClusterMetrics {
    let mut metrics = ClusterMetrics {
        cluster_id: cluster_id.to_string(),
        updated_at: epoch_millis(),
        ..Default::default()
    };

    let mut latency_sum = 0.0;
    let mut success_sum = 0.0;
    let mut sampled = 0u32;
    let mut requests = 0u64;
    let mut errors = 0u64;

    for worker in workers {
        metrics.worker_count += 1;
        if worker.is_idle() {
            metrics.idle_workers += 1;
        }
        metrics.total_load += worker.load;
        if worker.status.accepts_work() {
            metrics.total_capacity += worker.max_concurrency;
        }
        if let Some(record) = records.get(&worker.id) {
            latency_sum += record.avg_latency_ms;
            success_sum += record.success_rate;
            requests += record.total_requests;
            errors += record.error_count;
            sampled += 1;
        }
    }

    if metrics.total_capacity > 0 {
        metrics.utilization =
            (metrics.total_load as f64 / metrics.total_capacity as f64).min(1.0);
    }
    if sampled > 0 {
        metrics.avg_latency_ms = latency_sum / sampled as f64;
        metrics.avg_success_rate = success_sum / sampled as f64;
    }
    if requests > 0 {
        metrics.error_rate = errors as f64 / requests as f64;
    }
    metrics
}

/// Cluster preference: idle capacity, low latency, low utilization, and
/// low error rate, weighted 0.4 / 0.3 / 0.2 / 0.1.
pub fn cluster_score(metrics: &ClusterMetrics, max_latency_ms: f64) -> f64 {
    let normalized_latency = if max_latency_ms > 0.0 {
        (metrics.avg_latency_ms / max_latency_ms).clamp(0.0, 1.0)
    } else {
        0.0
    };
    0.4 * metrics.idle_fraction()
        + 0.3 * (1.0 - normalized_latency)
        + 0.2 * (1.0 - metrics.utilization.clamp(0.0, 1.0))
        + 0.1 * (1.0 - metrics.error_rate.clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use taskgrid_core::{CircuitBreakerConfig, RoutingStrategy};
    use taskgrid_metrics::ExecutionSample;

    use super::*;

    fn grid_config() -> GridConfig {
        let mut config = GridConfig::default();
        config.routing.seed = Some(7);
        config.circuit_breaker = CircuitBreakerConfig {
            failure_threshold: 2,
            cooldown_ms: 1000,
            half_open_max_trials: 1,
        };
        config
    }

    fn pool() -> PoolManager {
        let config = grid_config();
        let events = EventBus::new(256);
        let metrics = MetricsStore::new(config.quality.clone());
        let breakers =
            BreakerRegistry::new(config.circuit_breaker.clone(), metrics.clone(), events.clone());
        PoolManager::new(&config, metrics, breakers, events)
    }

    fn cluster(id: &str, min: u32, max: u32) -> ClusterConfig {
        let mut config = ClusterConfig::new(id, "general");
        config.scaling = Some(ScalingConfig {
            min_workers: min,
            max_workers: max,
            ..Default::default()
        });
        config
    }

    #[tokio::test]
    async fn create_cluster_populates_min_workers() {
        let pool = pool();
        let mut rx = pool.events().subscribe();

        let metrics = pool.create_cluster(&cluster("c-a", 2, 4)).await.unwrap();
        assert_eq!(metrics.worker_count, 2);
        assert_eq!(metrics.idle_workers, 2);

        let workers = pool.workers("c-a").await.unwrap();
        assert_eq!(workers[0].id, "c-a-w001");
        assert_eq!(workers[0].max_concurrency, capability::GENERAL.max_concurrency);

        assert_eq!(rx.recv().await.unwrap().name(), "worker-registered");
        assert!(pool.metrics().get_metrics("c-a-w001").await.is_some());
    }

    #[tokio::test]
    async fn duplicate_cluster_rejected() {
        let pool = pool();
        pool.create_cluster(&cluster("c-a", 1, 2)).await.unwrap();
        let err = pool.create_cluster(&cluster("c-a", 1, 2)).await.unwrap_err();
        assert!(matches!(err, PoolError::ClusterExists(_)));
    }

    #[tokio::test]
    async fn category_sets_worker_defaults() {
        let pool = pool();
        let mut config = cluster("c-r", 1, 2);
        config.category = "research".to_string();
        pool.create_cluster(&config).await.unwrap();

        let worker = &pool.workers("c-r").await.unwrap()[0];
        assert_eq!(worker.max_concurrency, 2);
        let record = pool.metrics().get_metrics(&worker.id).await.unwrap();
        assert_eq!(record.avg_latency_ms, 8_000.0);
    }

    #[tokio::test]
    async fn add_worker_respects_max() {
        let pool = pool();
        pool.create_cluster(&cluster("c-a", 1, 2)).await.unwrap();
        pool.add_worker("c-a", WorkerSpec::default()).await.unwrap();

        let err = pool.add_worker("c-a", WorkerSpec::default()).await.unwrap_err();
        assert!(matches!(err, PoolError::ScalingBounds { .. }));
        assert!(matches!(
            pool.add_worker("nope", WorkerSpec::default()).await.unwrap_err(),
            PoolError::ClusterNotFound(_)
        ));
    }

    #[tokio::test]
    async fn remove_only_idle_and_above_min() {
        let pool = pool();
        pool.create_cluster(&cluster("c-a", 1, 3)).await.unwrap();
        let extra = pool.add_worker("c-a", WorkerSpec::default()).await.unwrap();

        pool.acquire("c-a", &extra.id).await.unwrap();
        assert!(matches!(
            pool.remove_worker("c-a", &extra.id).await.unwrap_err(),
            PoolError::WorkerBusy(_)
        ));

        pool.release("c-a", &extra.id).await.unwrap();
        pool.remove_worker("c-a", &extra.id).await.unwrap();
        assert!(pool.metrics().get_metrics(&extra.id).await.is_none());

        let last = pool.workers("c-a").await.unwrap()[0].id.clone();
        assert!(matches!(
            pool.remove_worker("c-a", &last).await.unwrap_err(),
            PoolError::ScalingBounds { .. }
        ));
    }

    #[tokio::test]
    async fn acquire_never_exceeds_max_concurrency() {
        let pool = pool();
        let mut config = cluster("c-a", 1, 1);
        config.max_concurrency = Some(2);
        pool.create_cluster(&config).await.unwrap();
        let id = "c-a-w001";

        pool.acquire("c-a", id).await.unwrap();
        let worker = pool.acquire("c-a", id).await.unwrap();
        assert_eq!(worker.load, 2);
        assert_eq!(worker.status, WorkerStatus::Busy);

        assert!(matches!(
            pool.acquire("c-a", id).await.unwrap_err(),
            PoolError::NoWorkerAvailable(_)
        ));
        assert!(pool
            .select_worker_in_cluster("c-a", &TaskProfile::default())
            .await
            .is_err());

        pool.release("c-a", id).await.unwrap();
        pool.release("c-a", id).await.unwrap();
        let worker = pool.worker(id).await.unwrap();
        assert_eq!(worker.load, 0);
        assert_eq!(worker.status, WorkerStatus::Idle);
    }

    #[tokio::test]
    async fn select_prefers_idle_cluster_and_first_on_tie() {
        let pool = pool();
        pool.create_cluster(&cluster("c-a", 1, 2)).await.unwrap();
        pool.create_cluster(&cluster("c-b", 1, 2)).await.unwrap();

        assert_eq!(
            pool.select_cluster(&TaskProfile::default()).await.as_deref(),
            Some("c-a")
        );

        pool.acquire("c-a", "c-a-w001").await.unwrap();
        assert_eq!(
            pool.select_cluster(&TaskProfile::default()).await.as_deref(),
            Some("c-b")
        );
    }

    #[tokio::test]
    async fn select_cluster_skips_unplaceable_cluster() {
        let pool = pool();
        pool.create_cluster(&cluster("c-open", 1, 1)).await.unwrap();
        pool.create_cluster(&cluster("c-ok", 2, 2)).await.unwrap();
        pool.acquire("c-ok", "c-ok-w001").await.unwrap();

        // Idle but tripped: scores better than the half-busy cluster.
        pool.breakers().record_failure("c-open-w001").await;
        pool.breakers().record_failure("c-open-w001").await;

        let chosen = pool.select_cluster(&TaskProfile::default()).await;
        assert_eq!(chosen.as_deref(), Some("c-ok"));
        let selection = pool
            .select_worker_in_cluster("c-ok", &TaskProfile::default())
            .await
            .unwrap();
        assert_eq!(selection.worker_id, "c-ok-w002");

        // A cluster in maintenance is skipped the same way.
        pool.set_worker_status("c-ok", "c-ok-w002", WorkerStatus::Maintenance)
            .await
            .unwrap();
        pool.release("c-ok", "c-ok-w001").await.unwrap();
        pool.set_worker_status("c-ok", "c-ok-w001", WorkerStatus::Offline)
            .await
            .unwrap();
        assert!(pool.select_cluster(&TaskProfile::default()).await.is_none());
    }

    #[tokio::test]
    async fn cached_weight_drops_to_zero_when_circuit_opens() {
        let pool = pool();
        pool.create_cluster(&cluster("c-a", 2, 2)).await.unwrap();
        pool.refresh_cluster_metrics().await;
        assert!(pool.worker_weights("c-a").await.unwrap()["c-a-w001"] > 0.0);

        pool.breakers().record_failure("c-a-w001").await;
        pool.breakers().record_failure("c-a-w001").await;

        let weights = pool.worker_weights("c-a").await.unwrap();
        assert_eq!(weights["c-a-w001"], 0.0);
        assert!(weights["c-a-w002"] > 0.0);
    }

    #[tokio::test]
    async fn select_cluster_filters_capability() {
        let pool = pool();
        pool.create_cluster(&cluster("c-a", 1, 2)).await.unwrap();
        pool.create_cluster(&ClusterConfig::new("c-code", "code")).await.unwrap();

        let profile = TaskProfile {
            capability: Some("code".to_string()),
            ..Default::default()
        };
        assert_eq!(pool.select_cluster(&profile).await.as_deref(), Some("c-code"));

        let profile = TaskProfile {
            capability: Some("poetry".to_string()),
            ..Default::default()
        };
        assert!(pool.select_cluster(&profile).await.is_none());
    }

    #[tokio::test]
    async fn open_circuit_worker_is_never_selected() {
        let pool = pool();
        pool.create_cluster(&cluster("c-a", 2, 2)).await.unwrap();

        pool.breakers().record_failure("c-a-w001").await;
        pool.breakers().record_failure("c-a-w001").await;

        for _ in 0..50 {
            let selection = pool
                .select_worker_in_cluster("c-a", &TaskProfile::default())
                .await
                .unwrap();
            assert_eq!(selection.worker_id, "c-a-w002");
            assert!(selection.weight > 0.0);
        }

        pool.breakers().record_failure("c-a-w002").await;
        pool.breakers().record_failure("c-a-w002").await;
        assert!(matches!(
            pool.select_worker_in_cluster("c-a", &TaskProfile::default())
                .await
                .unwrap_err(),
            PoolError::NoWorkerAvailable(_)
        ));
    }

    #[tokio::test]
    async fn maintenance_worker_is_skipped() {
        let pool = pool();
        pool.create_cluster(&cluster("c-a", 2, 2)).await.unwrap();
        pool.set_worker_status("c-a", "c-a-w001", WorkerStatus::Maintenance)
            .await
            .unwrap();

        let selection = pool
            .select_worker_in_cluster("c-a", &TaskProfile::default())
            .await
            .unwrap();
        assert_eq!(selection.worker_id, "c-a-w002");

        let worker = pool
            .set_worker_status("c-a", "c-a-w001", WorkerStatus::Idle)
            .await
            .unwrap();
        assert_eq!(worker.status, WorkerStatus::Idle);
    }

    #[tokio::test]
    async fn status_and_resources_follow_load() {
        let pool = pool();
        pool.create_cluster(&cluster("c-a", 1, 1)).await.unwrap();

        let worker = pool
            .set_worker_status("c-a", "c-a-w001", WorkerStatus::Busy)
            .await
            .unwrap();
        assert_eq!(worker.status, WorkerStatus::Idle);

        pool.acquire("c-a", "c-a-w001").await.unwrap();
        let worker = pool
            .set_worker_status("c-a", "c-a-w001", WorkerStatus::Idle)
            .await
            .unwrap();
        assert_eq!(worker.status, WorkerStatus::Busy);

        let usage = ResourceUsage {
            memory_bytes: 512 * 1024 * 1024,
            cpu_percent: 37.5,
        };
        pool.update_resources("c-a", "c-a-w001", usage).await.unwrap();
        assert_eq!(pool.worker("c-a-w001").await.unwrap().resources, usage);
        assert!(matches!(
            pool.update_resources("c-a", "ghost", usage).await,
            Err(PoolError::WorkerNotFound(_))
        ));
    }

    #[tokio::test]
    async fn least_connections_cluster_strategy() {
        let pool = pool();
        let mut config = cluster("c-lc", 2, 2);
        config.strategy = RoutingStrategy::LeastConnections;
        pool.create_cluster(&config).await.unwrap();

        pool.acquire("c-lc", "c-lc-w001").await.unwrap();
        let selection = pool
            .select_worker_in_cluster("c-lc", &TaskProfile::default())
            .await
            .unwrap();
        assert_eq!(selection.worker_id, "c-lc-w002");
    }

    #[tokio::test]
    async fn refresh_aggregates_and_caches_weights() {
        let pool = pool();
        pool.create_cluster(&cluster("c-a", 2, 2)).await.unwrap();
        pool.acquire("c-a", "c-a-w001").await.unwrap();
        pool.metrics()
            .track_execution(
                "c-a-w002",
                ExecutionSample {
                    success: false,
                    duration_ms: 100.0,
                    cost: 0.0,
                },
            )
            .await;

        let refreshed = pool.refresh_cluster_metrics().await;
        assert_eq!(refreshed.len(), 1);
        let metrics = &refreshed[0];
        assert_eq!(metrics.worker_count, 2);
        assert_eq!(metrics.idle_workers, 1);
        assert_eq!(metrics.total_load, 1);
        assert!((metrics.utilization - 0.1).abs() < 1e-9);
        assert_eq!(metrics.error_rate, 1.0);

        let weights = pool.worker_weights("c-a").await.unwrap();
        assert_eq!(weights.len(), 2);
        assert!(weights["c-a-w001"] > weights["c-a-w002"]);
    }

    #[test]
    fn cluster_score_weights() {
        let idle = ClusterMetrics {
            worker_count: 2,
            idle_workers: 2,
            ..Default::default()
        };
        assert!((cluster_score(&idle, 1000.0) - 1.0).abs() < 1e-9);

        let saturated = ClusterMetrics {
            worker_count: 2,
            idle_workers: 0,
            utilization: 1.0,
            avg_latency_ms: 1000.0,
            error_rate: 1.0,
            ..Default::default()
        };
        assert_eq!(cluster_score(&saturated, 1000.0), 0.0);
    }
}
