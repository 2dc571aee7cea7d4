//! Worker weighting for routing decisions.
//!
//! Each candidate gets a weight in 0.0..=1.0 from a weighted combination of:
//! - **Success rate**: rolling success/quality from the metrics store
//! - **Latency**: average latency normalized against the latency cap
//! - **Cost**: average cost against the budget ceiling, if one is set
//!
//! Hard exclusions (open circuit, quality floor, budget ceiling) force the
//! weight to zero so the candidate can never be drawn.

use serde::{Deserialize, Serialize};

use taskgrid_core::{PerformanceRecord, RoutingConfig, WorkerId};

/// A worker offered to the routing engine.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub worker_id: WorkerId,
    /// Metrics snapshot taken when the candidate set was built.
    pub record: PerformanceRecord,
    /// False while the worker's circuit is open or its trial budget is spent.
    pub dispatchable: bool,
    /// Open connections, used by least-connections selection.
    pub connections: u32,
}

/// Per-request hard limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteConstraints {
    /// Minimum success rate a worker must have.
    pub min_quality: Option<f64>,
    /// Maximum average cost a worker may have.
    pub max_cost: Option<f64>,
    /// Latency at which the latency term bottoms out.
    pub max_latency_ms: f64,
}

impl Default for RouteConstraints {
    fn default() -> Self {
        Self {
            min_quality: None,
            max_cost: None,
            max_latency_ms: 30_000.0,
        }
    }
}

/// Weights for the scoring components.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringWeights {
    pub success: f64,
    pub latency: f64,
    pub cost: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            success: 0.7,
            latency: 0.2,
            cost: 0.1,
        }
    }
}

impl From<&RoutingConfig> for ScoringWeights {
    fn from(config: &RoutingConfig) -> Self {
        Self {
            success: config.success_weight,
            latency: config.latency_weight,
            cost: config.cost_weight,
        }
    }
}

/// Why a candidate was forced to zero weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exclusion {
    CircuitOpen,
    BelowQualityFloor,
    OverBudget,
}

/// Individual score components for debugging.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WeightBreakdown {
    pub success: f64,
    pub latency: f64,
    pub cost: f64,
}

/// Scored candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerWeight {
    pub worker_id: WorkerId,
    /// Composite weight, 0.0..=1.0. Zero means never selectable.
    pub weight: f64,
    pub breakdown: WeightBreakdown,
    pub excluded: Option<Exclusion>,
}

impl WorkerWeight {
    pub fn is_selectable(&self) -> bool {
        self.weight > 0.0
    }

    fn excluded(worker_id: &str, reason: Exclusion) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            weight: 0.0,
            breakdown: WeightBreakdown::default(),
            excluded: Some(reason),
        }
    }
}

/// Weight a single candidate.
pub fn score_candidate(
    candidate: &Candidate,
    constraints: &RouteConstraints,
    weights: &ScoringWeights,
) -> WorkerWeight {
    let record = &candidate.record;

    if !candidate.dispatchable {
        return WorkerWeight::excluded(&candidate.worker_id, Exclusion::CircuitOpen);
    }
    if constraints
        .min_quality
        .is_some_and(|floor| record.success_rate < floor)
    {
        return WorkerWeight::excluded(&candidate.worker_id, Exclusion::BelowQualityFloor);
    }
    if constraints
        .max_cost
        .is_some_and(|ceiling| record.avg_cost > ceiling)
    {
        return WorkerWeight::excluded(&candidate.worker_id, Exclusion::OverBudget);
    }

    let success = record.success_rate.clamp(0.0, 1.0);

    let normalized_latency = if constraints.max_latency_ms > 0.0 {
        (record.avg_latency_ms / constraints.max_latency_ms).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let latency = 1.0 - normalized_latency;

    // With a budget, cost scores against the ceiling; without one, cheaper
    // still scores higher but never reaches zero.
    let cost = match constraints.max_cost {
        Some(ceiling) if ceiling > 0.0 => (1.0 - record.avg_cost / ceiling).clamp(0.0, 1.0),
        _ => 1.0 / (1.0 + record.avg_cost.max(0.0)),
    };

    let raw = weights.success * success + weights.latency * latency + weights.cost * cost;
    let weight = if raw.is_finite() {
        raw.clamp(0.0, 1.0)
    } else {
        0.0
    };

    WorkerWeight {
        worker_id: candidate.worker_id.clone(),
        weight,
        breakdown: WeightBreakdown {
            success,
            latency,
            cost,
        },
        excluded: None,
    }
}

/// Weight every candidate, preserving input order.
pub fn calculate_weights(
    candidates: &[Candidate],
    constraints: &RouteConstraints,
    weights: &ScoringWeights,
) -> Vec<WorkerWeight> {
    candidates
        .iter()
        .map(|c| score_candidate(c, constraints, weights))
        .collect()
}

/// Weight every candidate and sort best first. Ties keep input order.
pub fn rank_candidates(
    candidates: &[Candidate],
    constraints: &RouteConstraints,
    weights: &ScoringWeights,
) -> Vec<WorkerWeight> {
    let mut scored = calculate_weights(candidates, constraints, weights);
    scored.sort_by(|a, b| b.weight.partial_cmp(&a.weight).unwrap_or(std::cmp::Ordering::Equal));
    scored
}
