//! Grid configuration (`taskgrid.toml`).
//!
//! Every section and field has a default, so an empty file yields a usable
//! configuration. The whole struct is handed to constructors; nothing reads
//! configuration from global state.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::types::RoutingStrategy;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub scheduler: SchedulerConfig,
    pub scaling: ScalingConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub quality: QualityThresholds,
    pub routing: RoutingConfig,
    pub ticks: TickConfig,
    pub events: EventsConfig,
    /// Clusters created at startup by the daemon.
    pub clusters: Vec<ClusterConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_concurrent_tasks: u32,
    /// Upper bound on dispatches within a single tick.
    pub max_dispatch_per_tick: u32,
    pub task_timeout_ms: u64,
    /// Priority applied when a submission omits one.
    pub default_priority: u8,
    /// Terminal tasks retained for lookup before trimming.
    pub history_capacity: usize,
    /// Size the history is trimmed to once it exceeds `history_capacity`.
    pub history_trim_to: usize,
    pub retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 10,
            max_dispatch_per_tick: 10,
            task_timeout_ms: 30_000,
            default_priority: 5,
            history_capacity: 1000,
            history_trim_to: 500,
            retry: RetryPolicy::default(),
        }
    }
}

/// Upper bound on any single retry delay: one day.
pub const MAX_RETRY_DELAY_MS: u64 = 86_400_000;

/// Exponential backoff for failed executions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_multiplier: f64,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_multiplier: 2.0,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry_count` (0-based):
    /// `base_delay * multiplier^retry_count`, capped at `max_delay_ms` and
    /// never above [`MAX_RETRY_DELAY_MS`].
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let millis = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let ceiling = self.max_delay_ms.min(MAX_RETRY_DELAY_MS) as f64;
        let capped = millis.min(ceiling).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// Default worker-count bounds and utilization thresholds for clusters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    pub min_workers: u32,
    pub max_workers: u32,
    /// Utilization (0.0–1.0) above which a worker is added.
    pub scale_up_threshold: f64,
    /// Utilization (0.0–1.0) below which an idle worker is removed.
    pub scale_down_threshold: f64,
    pub scale_up_cooldown_ms: u64,
    pub scale_down_cooldown_ms: u64,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 10,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            scale_up_cooldown_ms: 0,
            scale_down_cooldown_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures needed to open the circuit.
    pub failure_threshold: u32,
    /// Time an open circuit waits before trial traffic.
    pub cooldown_ms: u64,
    /// Trial dispatches allowed while half-open.
    pub half_open_max_trials: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
            half_open_max_trials: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Health thresholds and feedback blending for the metrics store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityThresholds {
    /// Below this success rate a worker is failing.
    pub min_success_rate: f64,
    /// Below this success rate a worker is degraded.
    pub degraded_success_rate: f64,
    /// Average latency above this marks a worker failing.
    pub max_latency_ms: f64,
    /// EMA factor used when blending quality feedback.
    pub feedback_learning_rate: f64,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            min_success_rate: 0.8,
            degraded_success_rate: 0.9,
            max_latency_ms: 30_000.0,
            feedback_learning_rate: 0.3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Seed for the weighted draw. Random when absent.
    pub seed: Option<u64>,
    pub success_weight: f64,
    pub latency_weight: f64,
    pub cost_weight: f64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            seed: None,
            success_weight: 0.7,
            latency_weight: 0.2,
            cost_weight: 0.1,
        }
    }
}

/// Periods of the driving clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TickConfig {
    pub scheduler_ms: u64,
    pub health_check_ms: u64,
    pub metrics_ms: u64,
    pub autoscale_ms: u64,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            scheduler_ms: 1000,
            health_check_ms: 5000,
            metrics_ms: 10_000,
            autoscale_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Broadcast buffer size; slow subscribers lag beyond this.
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

/// Definition of a cluster to create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub id: String,
    /// Capability served by workers of this cluster.
    pub capability: String,
    /// Capability-table category for worker defaults.
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub strategy: RoutingStrategy,
    /// Overrides the category's default per-worker concurrency.
    #[serde(default)]
    pub max_concurrency: Option<u32>,
    /// Overrides the grid-wide `[scaling]` section.
    #[serde(default)]
    pub scaling: Option<ScalingConfig>,
}

fn default_category() -> String {
    "general".to_string()
}

impl ClusterConfig {
    pub fn new(id: &str, capability: &str) -> Self {
        Self {
            id: id.to_string(),
            capability: capability.to_string(),
            category: default_category(),
            strategy: RoutingStrategy::default(),
            max_concurrency: None,
            scaling: None,
        }
    }
}

impl GridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: GridConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject settings that would break the scheduler's invariants.
    pub fn validate(&self) -> ConfigResult<()> {
        let s = &self.scheduler;
        if s.max_concurrent_tasks == 0 {
            return Err(invalid("scheduler.max_concurrent_tasks", "must be at least 1"));
        }
        if s.max_dispatch_per_tick == 0 {
            return Err(invalid("scheduler.max_dispatch_per_tick", "must be at least 1"));
        }
        if s.default_priority > 10 {
            return Err(invalid("scheduler.default_priority", "must be within 0..=10"));
        }
        if s.history_trim_to > s.history_capacity {
            return Err(invalid(
                "scheduler.history_trim_to",
                "must not exceed history_capacity",
            ));
        }
        if s.retry.backoff_multiplier < 1.0 {
            return Err(invalid("scheduler.retry.backoff_multiplier", "must be >= 1.0"));
        }
        if s.retry.max_delay_ms > MAX_RETRY_DELAY_MS {
            return Err(invalid(
                "scheduler.retry.max_delay_ms",
                "must not exceed one day (86400000)",
            ));
        }
        if s.retry.base_delay_ms > s.retry.max_delay_ms {
            return Err(invalid(
                "scheduler.retry.base_delay_ms",
                "must not exceed max_delay_ms",
            ));
        }

        validate_scaling("scaling", &self.scaling)?;

        if self.circuit_breaker.failure_threshold == 0 {
            return Err(invalid("circuit_breaker.failure_threshold", "must be at least 1"));
        }
        if self.circuit_breaker.half_open_max_trials == 0 {
            return Err(invalid(
                "circuit_breaker.half_open_max_trials",
                "must be at least 1",
            ));
        }

        let q = &self.quality;
        for (field, value) in [
            ("quality.min_success_rate", q.min_success_rate),
            ("quality.degraded_success_rate", q.degraded_success_rate),
            ("quality.feedback_learning_rate", q.feedback_learning_rate),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(field, "must be within 0.0..=1.0"));
            }
        }
        if q.min_success_rate > q.degraded_success_rate {
            return Err(invalid(
                "quality.min_success_rate",
                "must not exceed degraded_success_rate",
            ));
        }
        if q.max_latency_ms <= 0.0 {
            return Err(invalid("quality.max_latency_ms", "must be positive"));
        }

        let t = &self.ticks;
        if t.scheduler_ms == 0 || t.health_check_ms == 0 || t.metrics_ms == 0 || t.autoscale_ms == 0
        {
            return Err(invalid("ticks", "every tick period must be positive"));
        }

        if self.events.capacity == 0 {
            return Err(invalid("events.capacity", "must be at least 1"));
        }

        let mut seen = std::collections::HashSet::new();
        for cluster in &self.clusters {
            if cluster.id.trim().is_empty() {
                return Err(invalid("clusters.id", "must not be empty"));
            }
            if !seen.insert(cluster.id.as_str()) {
                return Err(ConfigError::DuplicateCluster(cluster.id.clone()));
            }
            if cluster.max_concurrency == Some(0) {
                return Err(invalid("clusters.max_concurrency", "must be at least 1"));
            }
            if let Some(scaling) = &cluster.scaling {
                validate_scaling(&format!("clusters.{}.scaling", cluster.id), scaling)?;
            }
        }

        Ok(())
    }
}

fn validate_scaling(section: &str, scaling: &ScalingConfig) -> ConfigResult<()> {
    if scaling.max_workers == 0 {
        return Err(invalid(&format!("{section}.max_workers"), "must be at least 1"));
    }
    if scaling.min_workers > scaling.max_workers {
        return Err(invalid(
            &format!("{section}.min_workers"),
            "must not exceed max_workers",
        ));
    }
    for (field, value) in [
        ("scale_up_threshold", scaling.scale_up_threshold),
        ("scale_down_threshold", scaling.scale_down_threshold),
    ] {
        if !(0.0..=1.0).contains(&value) {
            return Err(invalid(&format!("{section}.{field}"), "must be within 0.0..=1.0"));
        }
    }
    if scaling.scale_down_threshold >= scaling.scale_up_threshold {
        return Err(invalid(
            &format!("{section}.scale_down_threshold"),
            "must be below scale_up_threshold",
        ));
    }
    Ok(())
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = GridConfig::from_toml_str("").unwrap();
        assert_eq!(config, GridConfig::default());
        assert_eq!(config.scheduler.max_concurrent_tasks, 10);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
    }

    #[test]
    fn parse_partial_sections() {
        let toml_str = r#"
[scheduler]
max_concurrent_tasks = 4

[scheduler.retry]
max_retries = 5

[[clusters]]
id = "writers"
capability = "generation"
strategy = "least_connections"
"#;
        let config = GridConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.scheduler.max_concurrent_tasks, 4);
        assert_eq!(config.scheduler.task_timeout_ms, 30_000);
        assert_eq!(config.scheduler.retry.max_retries, 5);
        assert_eq!(config.scheduler.retry.base_delay_ms, 1000);
        assert_eq!(config.clusters.len(), 1);
        assert_eq!(config.clusters[0].category, "general");
        assert_eq!(config.clusters[0].strategy, RoutingStrategy::LeastConnections);
    }

    #[test]
    fn roundtrip_through_toml() {
        let mut config = GridConfig::default();
        config.clusters.push(ClusterConfig::new("c-1", "analysis"));
        let toml_str = config.to_toml_string().unwrap();
        let parsed = GridConfig::from_toml_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn retry_delays_grow_exponentially() {
        let policy = RetryPolicy {
            max_retries: 3,
            backoff_multiplier: 2.0,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(4000));
    }

    #[test]
    fn retry_delay_is_capped() {
        let policy = RetryPolicy {
            max_delay_ms: 5000,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(10), Duration::from_millis(5000));
    }

    #[test]
    fn rejects_inverted_scaling_thresholds() {
        let mut config = GridConfig::default();
        config.scaling.scale_down_threshold = 0.9;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field, .. }) if field == "scaling.scale_down_threshold"
        ));
    }

    #[test]
    fn rejects_min_above_max_workers() {
        let mut config = GridConfig::default();
        config.scaling.min_workers = 11;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_duplicate_cluster_ids() {
        let mut config = GridConfig::default();
        config.clusters.push(ClusterConfig::new("c-1", "a"));
        config.clusters.push(ClusterConfig::new("c-1", "b"));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateCluster(id)) if id == "c-1"
        ));
    }

    #[test]
    fn rejects_success_rate_out_of_range() {
        let mut config = GridConfig::default();
        config.quality.min_success_rate = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_shrinking_backoff() {
        let mut config = GridConfig::default();
        config.scheduler.retry.backoff_multiplier = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn retry_delay_is_bounded() {
        let mut config = GridConfig::default();
        config.scheduler.retry.max_delay_ms = u64::MAX;
        assert!(config.validate().is_err());

        config.scheduler.retry.max_delay_ms = 1000;
        config.scheduler.retry.base_delay_ms = 5000;
        assert!(config.validate().is_err());

        let policy = RetryPolicy {
            max_retries: 3,
            backoff_multiplier: 10.0,
            base_delay_ms: u64::MAX / 2,
            max_delay_ms: u64::MAX,
        };
        assert_eq!(
            policy.delay_for(40),
            Duration::from_millis(MAX_RETRY_DELAY_MS)
        );
    }

    #[test]
    fn parse_error_is_reported() {
        let result = GridConfig::from_toml_str("[scheduler\nmax = ");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
