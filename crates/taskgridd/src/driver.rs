//! The driving clock.
//!
//! One `tokio::select!` loop owns every periodic timer. Subsystems never
//! start timers of their own; they expose a tick method and the loop calls
//! it. Errors inside a tick are logged by the subsystem and never stop the
//! loop.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use taskgrid_autoscale::Autoscaler;
use taskgrid_core::{EventBus, GridConfig};
use taskgrid_health::BreakerRegistry;
use taskgrid_metrics::{render_prometheus, MetricsStore};
use taskgrid_scheduler::{ExecutionAdapter, PoolManager, TaskScheduler};

/// A fully assembled grid.
pub struct Grid {
    config: GridConfig,
    events: EventBus,
    metrics: MetricsStore,
    breakers: BreakerRegistry,
    pool: PoolManager,
    scheduler: TaskScheduler,
    autoscaler: Autoscaler,
    prometheus_path: Option<PathBuf>,
}

impl Grid {
    /// Wire every subsystem together. Clusters are created by
    /// [`Grid::bootstrap`].
    pub fn new(config: GridConfig, adapter: Arc<dyn ExecutionAdapter>) -> Self {
        let events = EventBus::new(config.events.capacity);
        let metrics = MetricsStore::new(config.quality.clone());
        let breakers =
            BreakerRegistry::new(config.circuit_breaker.clone(), metrics.clone(), events.clone());
        let pool = PoolManager::new(&config, metrics.clone(), breakers.clone(), events.clone());
        let scheduler =
            TaskScheduler::new(config.scheduler.clone(), pool.clone(), adapter, events.clone());
        let autoscaler = Autoscaler::new(pool.clone(), events.clone());

        Self {
            config,
            events,
            metrics,
            breakers,
            pool,
            scheduler,
            autoscaler,
            prometheus_path: None,
        }
    }

    /// Write Prometheus text exposition to `path` on every metrics tick.
    pub fn with_prometheus_file(mut self, path: PathBuf) -> Self {
        self.prometheus_path = Some(path);
        self
    }

    /// Create every cluster listed in the configuration.
    pub async fn bootstrap(&self) -> anyhow::Result<()> {
        for cluster in &self.config.clusters {
            let metrics = self
                .pool
                .create_cluster(cluster)
                .await
                .with_context(|| format!("failed to create cluster {}", cluster.id))?;
            info!(
                cluster_id = %cluster.id,
                workers = metrics.worker_count,
                "cluster ready"
            );
        }
        Ok(())
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn metrics(&self) -> &MetricsStore {
        &self.metrics
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn pool(&self) -> &PoolManager {
        &self.pool
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    /// Run until `shutdown` flips to true.
    pub async fn run(&mut self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        self.drive(shutdown, false).await
    }

    /// Run until shutdown or until nothing is queued or in flight.
    pub async fn run_until_idle(&mut self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        self.drive(shutdown, true).await
    }

    async fn drive(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
        stop_when_idle: bool,
    ) -> anyhow::Result<()> {
        let ticks = self.config.ticks.clone();
        let mut scheduler_tick = ticker(ticks.scheduler_ms);
        let mut health_tick = ticker(ticks.health_check_ms);
        let mut metrics_tick = ticker(ticks.metrics_ms);
        let mut autoscale_tick = ticker(ticks.autoscale_ms);

        info!(
            scheduler_ms = ticks.scheduler_ms,
            health_check_ms = ticks.health_check_ms,
            metrics_ms = ticks.metrics_ms,
            autoscale_ms = ticks.autoscale_ms,
            "grid started"
        );

        loop {
            tokio::select! {
                _ = scheduler_tick.tick() => {
                    self.scheduler.tick().await;
                    if stop_when_idle && self.scheduler.is_idle().await {
                        info!("all tasks settled");
                        break;
                    }
                }
                _ = health_tick.tick() => {
                    let half_opened = self.breakers.check_cooldowns().await;
                    if !half_opened.is_empty() {
                        debug!(workers = ?half_opened, "circuits entered half-open");
                    }
                }
                _ = metrics_tick.tick() => {
                    self.collect_metrics().await;
                }
                _ = autoscale_tick.tick() => {
                    self.autoscaler.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("shutdown signal received");
                        break;
                    }
                }
            }
        }

        self.scheduler.settle().await;
        self.collect_metrics().await;
        let stats = self.scheduler.stats().await;
        info!(
            completed = stats.completed,
            failed = stats.failed,
            cancelled = stats.cancelled,
            queued = stats.queued,
            "grid stopped"
        );
        Ok(())
    }

    async fn collect_metrics(&self) {
        let clusters = self.pool.refresh_cluster_metrics().await;
        let Some(path) = &self.prometheus_path else {
            return;
        };
        let body = render_prometheus(&self.metrics.all().await, &clusters);
        if let Err(e) = tokio::fs::write(path, body).await {
            warn!(path = %path.display(), error = %e, "failed to write metrics file");
        }
    }
}

fn ticker(period_ms: u64) -> tokio::time::Interval {
    let mut ticker = interval(Duration::from_millis(period_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}
