//! taskgrid-autoscale — utilization-driven worker scaling.
//!
//! Reads a `ClusterSnapshot` for each cluster from the pool manager,
//! compares utilization against the cluster's scaling thresholds, and adds
//! or removes one worker per tick.
//!
//! # Scaling Algorithm
//!
//! ```text
//! utilization = total_load / total_capacity   (workers accepting work)
//!
//! if utilization > scale_up_threshold and workers < max_workers:
//!     ScaleUp                     // add one worker
//!
//! if utilization < scale_down_threshold and workers > min_workers:
//!     ScaleDown(worker)           // idle worker with the lowest load
//! ```
//!
//! The gap between the two thresholds gives hysteresis. Cooldown windows
//! (`scale_up_cooldown_ms`, `scale_down_cooldown_ms`) additionally prevent
//! rapid oscillation.

pub mod scaler;

pub use scaler::{Autoscaler, ScaleDecision};
