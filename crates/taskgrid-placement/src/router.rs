//! Weighted worker selection.
//!
//! Draws one worker from the nonzero-weight candidates with probability
//! proportional to weight (cumulative-weight sampling). The random source is
//! injected so a seeded [`StdRng`] makes selection reproducible.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use taskgrid_core::{RoutingConfig, RoutingStrategy, WorkerId};

use crate::balancer::{least_connections, RoundRobinBalancer};
use crate::scorer::{calculate_weights, Candidate, RouteConstraints, ScoringWeights, WorkerWeight};

/// Outcome of a selection. Logged, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingDecision {
    pub worker_id: WorkerId,
    pub weight: f64,
    pub rationale: String,
    /// Candidates offered, including excluded ones.
    pub considered: usize,
    /// Candidates with nonzero weight.
    pub eligible: usize,
}

/// Cumulative-weight draw over already-scored candidates.
///
/// Returns `None` when every weight is zero. If floating-point rounding
/// leaves the draw past the last bucket, the highest-weight candidate wins.
pub fn select_weighted<R: Rng + ?Sized>(
    scored: &[WorkerWeight],
    rng: &mut R,
) -> Option<RoutingDecision> {
    let eligible: Vec<&WorkerWeight> = scored.iter().filter(|w| w.is_selectable()).collect();
    let total: f64 = eligible.iter().map(|w| w.weight).sum();
    if eligible.is_empty() || total <= 0.0 {
        return None;
    }

    let draw = rng.gen_range(0.0..total);
    let mut cumulative = 0.0;
    for w in &eligible {
        cumulative += w.weight;
        if draw < cumulative {
            return Some(decision(w, scored.len(), eligible.len(), format!(
                "weighted draw {draw:.4} of {total:.4}"
            )));
        }
    }

    let best = highest_weight(&eligible)?;
    Some(decision(best, scored.len(), eligible.len(), "fallback to highest weight".to_string()))
}

fn highest_weight<'a>(eligible: &[&'a WorkerWeight]) -> Option<&'a WorkerWeight> {
    let mut best: Option<&'a WorkerWeight> = None;
    for &w in eligible {
        if best.is_none_or(|b| w.weight > b.weight) {
            best = Some(w);
        }
    }
    best
}

fn decision(w: &WorkerWeight, considered: usize, eligible: usize, rationale: String) -> RoutingDecision {
    RoutingDecision {
        worker_id: w.worker_id.clone(),
        weight: w.weight,
        rationale,
        considered,
        eligible,
    }
}

/// Routing engine: scoring weights plus the random source for draws.
pub struct Router {
    rng: StdRng,
    weights: ScoringWeights,
}

impl Router {
    /// Seeded when the config carries a seed, otherwise from OS entropy.
    pub fn new(config: &RoutingConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng,
            weights: ScoringWeights::from(config),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            weights: ScoringWeights::default(),
        }
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    pub fn calculate_weights(
        &self,
        candidates: &[Candidate],
        constraints: &RouteConstraints,
    ) -> Vec<WorkerWeight> {
        calculate_weights(candidates, constraints, &self.weights)
    }

    /// Performance-based selection: weighted random draw.
    pub fn select_unit(
        &mut self,
        candidates: &[Candidate],
        constraints: &RouteConstraints,
    ) -> Option<RoutingDecision> {
        let scored = self.calculate_weights(candidates, constraints);
        let picked = select_weighted(&scored, &mut self.rng);
        match &picked {
            Some(d) => debug!(
                worker_id = %d.worker_id,
                weight = d.weight,
                eligible = d.eligible,
                considered = d.considered,
                "worker selected"
            ),
            None => debug!(considered = candidates.len(), "no selectable worker"),
        }
        picked
    }

    /// Select using a cluster's strategy. Every strategy skips zero-weight
    /// candidates; round-robin and least-connections ignore weight otherwise.
    pub fn select_with_strategy(
        &mut self,
        strategy: RoutingStrategy,
        candidates: &[Candidate],
        constraints: &RouteConstraints,
        round_robin: &RoundRobinBalancer,
    ) -> Option<RoutingDecision> {
        match strategy {
            RoutingStrategy::PerformanceBased => self.select_unit(candidates, constraints),
            RoutingStrategy::RoundRobin => {
                let scored = self.calculate_weights(candidates, constraints);
                let eligible: Vec<&WorkerWeight> =
                    scored.iter().filter(|w| w.is_selectable()).collect();
                let ids: Vec<&str> = eligible.iter().map(|w| w.worker_id.as_str()).collect();
                let w = eligible[round_robin.next(&ids)?];
                debug!(worker_id = %w.worker_id, "round-robin selection");
                Some(decision(w, scored.len(), eligible.len(), "round-robin rotation".to_string()))
            }
            RoutingStrategy::LeastConnections => {
                let scored = self.calculate_weights(candidates, constraints);
                let idx = least_connections(candidates, &scored)?;
                let eligible = scored.iter().filter(|w| w.is_selectable()).count();
                let w = &scored[idx];
                debug!(
                    worker_id = %w.worker_id,
                    connections = candidates[idx].connections,
                    "least-connections selection"
                );
                Some(decision(
                    w,
                    scored.len(),
                    eligible,
                    format!("least connections ({})", candidates[idx].connections),
                ))
            }
        }
    }
}
