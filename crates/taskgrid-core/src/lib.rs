//! taskgrid-core — shared types, configuration, and events for TaskGrid.
//!
//! TaskGrid decides, continuously and under failure, which worker a unit of
//! work runs on. This crate holds the pieces every other crate agrees on:
//!
//! - **`types`**: workers, clusters, tasks, performance records
//! - **`config`**: the `taskgrid.toml` configuration surface
//! - **`events`**: observability events and the broadcast [`EventBus`]

pub mod config;
pub mod error;
pub mod events;
pub mod types;

pub use config::{
    CircuitBreakerConfig, ClusterConfig, EventsConfig, GridConfig, QualityThresholds,
    RetryPolicy, RoutingConfig, ScalingConfig, SchedulerConfig, TickConfig, MAX_RETRY_DELAY_MS,
};
pub use error::{ConfigError, ConfigResult};
pub use events::{EventBus, GridEvent};
pub use types::*;
