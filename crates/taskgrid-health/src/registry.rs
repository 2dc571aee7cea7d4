//! Breaker registry — one circuit breaker per worker.
//!
//! Owns every [`CircuitBreaker`], mirrors open/closed transitions into the
//! metrics store, and publishes `circuit-opened` / `circuit-closed` events.
//! The health-check tick calls [`BreakerRegistry::check_cooldowns`] to move
//! cooled-down circuits into half-open.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use taskgrid_core::{CircuitBreakerConfig, EventBus, GridEvent, WorkerId};
use taskgrid_metrics::MetricsStore;

use crate::breaker::{CircuitBreaker, CircuitState};

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub dispatchable: bool,
}

#[derive(Clone)]
pub struct BreakerRegistry {
    breakers: Arc<RwLock<HashMap<WorkerId, CircuitBreaker>>>,
    config: CircuitBreakerConfig,
    metrics: MetricsStore,
    events: EventBus,
}

impl BreakerRegistry {
    pub fn new(config: CircuitBreakerConfig, metrics: MetricsStore, events: EventBus) -> Self {
        Self {
            breakers: Arc::new(RwLock::new(HashMap::new())),
            config,
            metrics,
            events,
        }
    }

    pub async fn register(&self, worker_id: &str) {
        let mut breakers = self.breakers.write().await;
        breakers
            .entry(worker_id.to_string())
            .or_insert_with(|| CircuitBreaker::new(&self.config));
    }

    pub async fn unregister(&self, worker_id: &str) {
        let mut breakers = self.breakers.write().await;
        breakers.remove(worker_id);
    }

    /// Count a failure against the worker's circuit.
    pub async fn record_failure(&self, worker_id: &str) -> Option<CircuitState> {
        let mut breakers = self.breakers.write().await;
        let breaker = breakers.get_mut(worker_id)?;

        let transition = breaker.record_failure(Instant::now());
        let failure_count = breaker.failure_count();
        let state = breaker.state();

        if transition == Some(CircuitState::Open) {
            let metrics = self.metrics.set_circuit_open(worker_id, true).await;
            warn!(%worker_id, failure_count, "circuit opened");
            self.events.publish(GridEvent::CircuitOpened {
                worker_id: worker_id.to_string(),
                failure_count,
                metrics,
            });
        } else {
            debug!(%worker_id, failure_count, %state, "failure recorded");
        }

        Some(state)
    }

    /// Count a success for the worker's circuit.
    pub async fn record_success(&self, worker_id: &str) -> Option<CircuitState> {
        let mut breakers = self.breakers.write().await;
        let breaker = breakers.get_mut(worker_id)?;

        let transition = breaker.record_success(Instant::now());
        let state = breaker.state();

        if transition == Some(CircuitState::Closed) {
            let metrics = self.metrics.set_circuit_open(worker_id, false).await;
            info!(%worker_id, "circuit closed");
            self.events.publish(GridEvent::CircuitClosed {
                worker_id: worker_id.to_string(),
                metrics,
            });
        }

        Some(state)
    }

    /// Health-check tick: move cooled-down circuits to half-open.
    ///
    /// Returns the workers that entered half-open on this call.
    pub async fn check_cooldowns(&self) -> Vec<WorkerId> {
        let now = Instant::now();
        let mut breakers = self.breakers.write().await;
        let mut half_opened = Vec::new();

        for (worker_id, breaker) in breakers.iter_mut() {
            if breaker.state() != CircuitState::Open {
                continue;
            }
            match breaker.attempt_half_open(now) {
                Some(CircuitState::HalfOpen) => {
                    info!(%worker_id, "circuit half-open, allowing trial traffic");
                    half_opened.push(worker_id.clone());
                }
                _ => debug!(%worker_id, "circuit still cooling down"),
            }
        }

        half_opened.sort();
        half_opened
    }

    /// Claim a dispatch slot; consumes a trial when half-open.
    ///
    /// Workers without a breaker are treated as closed.
    pub async fn try_acquire(&self, worker_id: &str) -> bool {
        let mut breakers = self.breakers.write().await;
        match breakers.get_mut(worker_id) {
            Some(breaker) => breaker.try_acquire(),
            None => true,
        }
    }

    pub async fn snapshot(&self, worker_id: &str) -> Option<BreakerSnapshot> {
        let breakers = self.breakers.read().await;
        breakers.get(worker_id).map(snapshot_of)
    }

    /// Snapshots for a set of workers; unknown IDs are skipped.
    pub async fn snapshots(&self, worker_ids: &[WorkerId]) -> HashMap<WorkerId, BreakerSnapshot> {
        let breakers = self.breakers.read().await;
        worker_ids
            .iter()
            .filter_map(|id| breakers.get(id).map(|b| (id.clone(), snapshot_of(b))))
            .collect()
    }

    pub async fn state(&self, worker_id: &str) -> Option<CircuitState> {
        let breakers = self.breakers.read().await;
        breakers.get(worker_id).map(CircuitBreaker::state)
    }

    /// Workers whose circuit is currently not closed.
    pub async fn tripped(&self) -> Vec<(WorkerId, CircuitState)> {
        let breakers = self.breakers.read().await;
        let mut tripped: Vec<_> = breakers
            .iter()
            .filter(|(_, b)| b.state() != CircuitState::Closed)
            .map(|(id, b)| (id.clone(), b.state()))
            .collect();
        tripped.sort_by(|a, b| a.0.cmp(&b.0));
        tripped
    }
}

fn snapshot_of(breaker: &CircuitBreaker) -> BreakerSnapshot {
    BreakerSnapshot {
        state: breaker.state(),
        failure_count: breaker.failure_count(),
        dispatchable: breaker.is_dispatchable(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use taskgrid_core::{HealthStatus, QualityThresholds};

    use super::*;

    async fn setup(threshold: u32, cooldown_ms: u64) -> (BreakerRegistry, MetricsStore, EventBus) {
        let metrics = MetricsStore::new(QualityThresholds::default());
        let events = EventBus::new(64);
        let registry = BreakerRegistry::new(
            CircuitBreakerConfig {
                failure_threshold: threshold,
                cooldown_ms,
                half_open_max_trials: 1,
            },
            metrics.clone(),
            events.clone(),
        );
        metrics.register("w-1", 100.0, 0.01).await;
        registry.register("w-1").await;
        (registry, metrics, events)
    }

    #[tokio::test(start_paused = true)]
    async fn opening_marks_metrics_and_publishes() {
        let (registry, metrics, events) = setup(3, 1000).await;
        let mut rx = events.subscribe();

        for _ in 0..3 {
            registry.record_failure("w-1").await;
        }

        assert_eq!(registry.state("w-1").await, Some(CircuitState::Open));
        let record = metrics.get_metrics("w-1").await.unwrap();
        assert!(record.circuit_open);
        assert_eq!(record.health, HealthStatus::CircuitOpen);

        match rx.recv().await.unwrap() {
            GridEvent::CircuitOpened {
                worker_id,
                failure_count,
                metrics,
            } => {
                assert_eq!(worker_id, "w-1");
                assert_eq!(failure_count, 3);
                assert!(metrics.unwrap().circuit_open);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn full_recovery_cycle() {
        let (registry, metrics, events) = setup(1, 1000).await;
        let mut rx = events.subscribe();

        registry.record_failure("w-1").await;
        assert!(!registry.try_acquire("w-1").await);
        assert!(registry.check_cooldowns().await.is_empty());

        tokio::time::advance(Duration::from_millis(1000)).await;
        assert_eq!(registry.check_cooldowns().await, vec!["w-1".to_string()]);

        let snap = registry.snapshot("w-1").await.unwrap();
        assert_eq!(snap.state, CircuitState::HalfOpen);
        assert!(snap.dispatchable);

        assert!(registry.try_acquire("w-1").await);
        assert!(!registry.snapshot("w-1").await.unwrap().dispatchable);

        registry.record_success("w-1").await;
        assert_eq!(registry.state("w-1").await, Some(CircuitState::Closed));
        assert!(!metrics.get_metrics("w-1").await.unwrap().circuit_open);

        assert_eq!(rx.recv().await.unwrap().name(), "circuit-opened");
        assert_eq!(rx.recv().await.unwrap().name(), "circuit-closed");
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_worker_is_ignored() {
        let (registry, _, _) = setup(1, 1000).await;
        assert_eq!(registry.record_failure("ghost").await, None);
        assert_eq!(registry.record_success("ghost").await, None);
        assert!(registry.try_acquire("ghost").await);
        assert!(registry.snapshot("ghost").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn tripped_lists_non_closed() {
        let (registry, metrics, _) = setup(1, 1000).await;
        metrics.register("w-2", 100.0, 0.01).await;
        registry.register("w-2").await;

        registry.record_failure("w-2").await;
        assert_eq!(
            registry.tripped().await,
            vec![("w-2".to_string(), CircuitState::Open)]
        );

        let snaps = registry
            .snapshots(&["w-1".to_string(), "w-2".to_string()])
            .await;
        assert!(snaps["w-1"].dispatchable);
        assert!(!snaps["w-2"].dispatchable);
    }
}
