//! Capability table: per-category worker defaults.
//!
//! A worker's category picks its concurrency limit and the latency/cost
//! baseline its performance record starts from. Unknown categories fall
//! back to `general`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CapabilityProfile {
    pub max_concurrency: u32,
    pub expected_latency_ms: f64,
    pub cost_per_task: f64,
}

pub const GENERAL: CapabilityProfile = CapabilityProfile {
    max_concurrency: 5,
    expected_latency_ms: 2_000.0,
    cost_per_task: 0.01,
};

const TABLE: &[(&str, CapabilityProfile)] = &[
    ("general", GENERAL),
    (
        "analysis",
        CapabilityProfile {
            max_concurrency: 3,
            expected_latency_ms: 5_000.0,
            cost_per_task: 0.03,
        },
    ),
    (
        "generation",
        CapabilityProfile {
            max_concurrency: 4,
            expected_latency_ms: 4_000.0,
            cost_per_task: 0.02,
        },
    ),
    (
        "research",
        CapabilityProfile {
            max_concurrency: 2,
            expected_latency_ms: 8_000.0,
            cost_per_task: 0.05,
        },
    ),
    (
        "review",
        CapabilityProfile {
            max_concurrency: 3,
            expected_latency_ms: 3_000.0,
            cost_per_task: 0.015,
        },
    ),
    (
        "code",
        CapabilityProfile {
            max_concurrency: 3,
            expected_latency_ms: 6_000.0,
            cost_per_task: 0.04,
        },
    ),
];

/// Defaults for a category (case-insensitive).
pub fn profile_for(category: &str) -> CapabilityProfile {
    TABLE
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(category))
        .map(|(_, profile)| *profile)
        .unwrap_or(GENERAL)
}

/// Known category names, in table order.
pub fn categories() -> impl Iterator<Item = &'static str> {
    TABLE.iter().map(|(name, _)| *name)
}
