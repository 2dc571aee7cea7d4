//! Metrics store — rolling per-worker performance records.
//!
//! Every update is incremental: averages use `(old * n + new) / (n + 1)`
//! and never retain history. Health is recomputed from fixed thresholds
//! after each update. Quality feedback is blended into the success rate
//! with an exponential moving average so that a human verdict takes effect
//! immediately instead of waiting for statistical volume.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use taskgrid_core::{epoch_millis, HealthStatus, PerformanceRecord, QualityThresholds, WorkerId};

/// Outcome of a single execution, as fed to [`MetricsStore::track_execution`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutionSample {
    pub success: bool,
    pub duration_ms: f64,
    pub cost: f64,
}

/// Who produced a quality verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackKind {
    Human,
    Automated,
    System,
}

impl FeedbackKind {
    /// Weight applied when the feedback does not carry its own.
    pub fn default_weight(self) -> f64 {
        match self {
            FeedbackKind::Human => 1.0,
            FeedbackKind::Automated => 0.8,
            FeedbackKind::System => 0.6,
        }
    }
}

/// An externally supplied quality score for a worker's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityFeedback {
    /// Quality score in 0.0–1.0.
    pub score: f64,
    pub kind: FeedbackKind,
    /// Overrides the kind's default weight.
    #[serde(default)]
    pub weight: Option<f64>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl QualityFeedback {
    pub fn new(score: f64, kind: FeedbackKind) -> Self {
        Self {
            score,
            kind,
            weight: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }

    fn effective_weight(&self) -> f64 {
        self.weight
            .unwrap_or_else(|| self.kind.default_weight())
            .clamp(0.0, 1.0)
    }
}

/// Owns one [`PerformanceRecord`] per registered worker.
///
/// Cloning shares the underlying table.
#[derive(Clone)]
pub struct MetricsStore {
    records: Arc<RwLock<HashMap<WorkerId, PerformanceRecord>>>,
    thresholds: QualityThresholds,
}

impl MetricsStore {
    pub fn new(thresholds: QualityThresholds) -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            thresholds,
        }
    }

    pub fn thresholds(&self) -> &QualityThresholds {
        &self.thresholds
    }

    /// Create the record for a worker. An existing record is kept as is.
    pub async fn register(
        &self,
        worker_id: &str,
        baseline_latency_ms: f64,
        baseline_cost: f64,
    ) -> PerformanceRecord {
        let mut records = self.records.write().await;
        let record = records
            .entry(worker_id.to_string())
            .or_insert_with(|| {
                PerformanceRecord::new(worker_id, baseline_latency_ms, baseline_cost)
            });
        debug!(%worker_id, "registered for performance tracking");
        record.clone()
    }

    /// Drop a worker's record. Only called once the worker is removed.
    pub async fn unregister(&self, worker_id: &str) {
        let mut records = self.records.write().await;
        records.remove(worker_id);
        debug!(%worker_id, "unregistered from performance tracking");
    }

    /// Fold one execution outcome into the worker's rolling statistics.
    ///
    /// Returns the updated record, or `None` for an unknown worker.
    pub async fn track_execution(
        &self,
        worker_id: &str,
        sample: ExecutionSample,
    ) -> Option<PerformanceRecord> {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(worker_id) else {
            warn!(%worker_id, "execution tracked for unknown worker");
            return None;
        };

        let before = record.health;
        apply_execution(record, sample, &self.thresholds, epoch_millis());
        log_health_change(worker_id, before, record.health);
        Some(record.clone())
    }

    /// Blend a quality verdict into the worker's success rate.
    ///
    /// `rate = (1 - a) * rate + a * score * weight`, with `a` the configured
    /// learning rate. Non-finite scores are ignored.
    pub async fn submit_quality_feedback(
        &self,
        worker_id: &str,
        feedback: &QualityFeedback,
    ) -> Option<PerformanceRecord> {
        if !feedback.score.is_finite() {
            warn!(%worker_id, "ignoring non-finite quality score");
            return None;
        }

        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(worker_id) else {
            warn!(%worker_id, "quality feedback for unknown worker");
            return None;
        };

        let before = record.health;
        apply_feedback(record, feedback, &self.thresholds, epoch_millis());
        debug!(
            %worker_id,
            kind = ?feedback.kind,
            score = feedback.score,
            success_rate = record.success_rate,
            "quality feedback applied"
        );
        log_health_change(worker_id, before, record.health);
        Some(record.clone())
    }

    /// Flag or clear the circuit-open marker. Owned by the circuit breaker.
    pub async fn set_circuit_open(&self, worker_id: &str, open: bool) -> Option<PerformanceRecord> {
        let mut records = self.records.write().await;
        let record = records.get_mut(worker_id)?;
        record.circuit_open = open;
        record.health = classify_health(record, &self.thresholds);
        record.last_updated = epoch_millis();
        Some(record.clone())
    }

    /// Immutable snapshot of one worker's record.
    pub async fn get_metrics(&self, worker_id: &str) -> Option<PerformanceRecord> {
        let records = self.records.read().await;
        records.get(worker_id).cloned()
    }

    /// Snapshots for a set of workers; unknown IDs are skipped.
    pub async fn get_many(&self, worker_ids: &[WorkerId]) -> HashMap<WorkerId, PerformanceRecord> {
        let records = self.records.read().await;
        worker_ids
            .iter()
            .filter_map(|id| records.get(id).map(|r| (id.clone(), r.clone())))
            .collect()
    }

    /// All records, sorted by worker ID.
    pub async fn all(&self) -> Vec<PerformanceRecord> {
        let records = self.records.read().await;
        let mut all: Vec<PerformanceRecord> = records.values().cloned().collect();
        all.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        all
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

/// Apply one execution sample to a record in place.
pub fn apply_execution(
    record: &mut PerformanceRecord,
    sample: ExecutionSample,
    thresholds: &QualityThresholds,
    now_ms: u64,
) {
    let n = record.total_requests as f64;
    let outcome = if sample.success { 1.0 } else { 0.0 };

    record.success_rate = ((record.success_rate * n + outcome) / (n + 1.0)).clamp(0.0, 1.0);
    record.avg_latency_ms = (record.avg_latency_ms * n + sample.duration_ms.max(0.0)) / (n + 1.0);
    record.avg_cost = (record.avg_cost * n + sample.cost.max(0.0)) / (n + 1.0);
    record.total_requests += 1;
    if !sample.success {
        record.error_count += 1;
    }
    record.last_updated = now_ms;
    record.health = classify_health(record, thresholds);
}

/// Apply one quality verdict to a record in place.
pub fn apply_feedback(
    record: &mut PerformanceRecord,
    feedback: &QualityFeedback,
    thresholds: &QualityThresholds,
    now_ms: u64,
) {
    let alpha = thresholds.feedback_learning_rate.clamp(0.0, 1.0);
    let score = feedback.score.clamp(0.0, 1.0);
    let blended = (1.0 - alpha) * record.success_rate + alpha * score * feedback.effective_weight();

    record.success_rate = blended.clamp(0.0, 1.0);
    record.last_updated = now_ms;
    record.health = classify_health(record, thresholds);
}

/// Derive health from the record's current statistics.
///
/// An open circuit wins; latency over the cap is failing regardless of
/// success rate.
pub fn classify_health(record: &PerformanceRecord, thresholds: &QualityThresholds) -> HealthStatus {
    if record.circuit_open {
        HealthStatus::CircuitOpen
    } else if record.avg_latency_ms > thresholds.max_latency_ms {
        HealthStatus::Failing
    } else if record.success_rate < thresholds.min_success_rate {
        HealthStatus::Failing
    } else if record.success_rate < thresholds.degraded_success_rate {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

fn log_health_change(worker_id: &str, before: HealthStatus, after: HealthStatus) {
    if before != after {
        info!(%worker_id, from = ?before, to = ?after, "worker health changed");
    }
}
