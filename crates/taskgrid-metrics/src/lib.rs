//! taskgrid-metrics — rolling per-worker performance for TaskGrid.
//!
//! Owns one performance record per worker. Execution outcomes and quality
//! feedback fold into the record incrementally; health is recomputed after
//! every update. Snapshots feed the routing engine and Prometheus.
//!
//! # Architecture
//!
//! ```text
//! MetricsStore
//!   ├── track_execution()        ← called by the scheduler per completion
//!   ├── submit_quality_feedback() ← human / automated / system verdicts
//!   ├── set_circuit_open()        ← called by the breaker registry
//!   └── get_metrics() → PerformanceRecord snapshot
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain
//! ```

pub mod prometheus;
pub mod store;

pub use prometheus::render_prometheus;
pub use store::{ExecutionSample, FeedbackKind, MetricsStore, QualityFeedback};
