//! taskgridd — the TaskGrid daemon.
//!
//! Assembles every TaskGrid subsystem from one `GridConfig`:
//! - Metrics store
//! - Circuit breaker registry
//! - Resource pool manager (clusters, workers, routing)
//! - Task scheduler
//! - Autoscaler
//!
//! and drives them from a single clock:
//!
//! ```text
//! Grid::run()
//!   └── tokio::select! {
//!         scheduler tick    → TaskScheduler::tick()
//!         health-check tick → BreakerRegistry::check_cooldowns()
//!         metrics tick      → PoolManager::refresh_cluster_metrics() (+ Prometheus file)
//!         autoscale tick    → Autoscaler::tick()
//!         shutdown          → drain in-flight work
//!       }
//! ```

pub mod adapter;
pub mod driver;

pub use adapter::CommandAdapter;
pub use driver::Grid;
