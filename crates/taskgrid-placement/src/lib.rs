//! taskgrid-placement — the TaskGrid routing engine.
//!
//! Turns a set of candidate workers (metrics snapshot + breaker state) into
//! a single routing decision.
//!
//! # Architecture
//!
//! ```text
//! Router
//!   ├── calculate_weights() → WorkerWeight per candidate
//!   │     └── 0 for open circuit / below quality floor / over budget
//!   ├── select_unit()        → seeded cumulative-weight draw
//!   └── select_with_strategy()
//!         ├── PerformanceBased → select_unit()
//!         ├── RoundRobin       → RoundRobinBalancer over selectable
//!         └── LeastConnections → least_connections() over selectable
//! ```
//!
//! Selection never returns a zero-weight candidate. When nothing is
//! selectable the result is `None`, not an error.

pub mod balancer;
pub mod router;
pub mod scorer;

pub use balancer::{least_connections, RoundRobinBalancer};
pub use router::{select_weighted, Router, RoutingDecision};
pub use scorer::{
    calculate_weights, rank_candidates, score_candidate, Candidate, Exclusion, RouteConstraints,
    ScoringWeights, WeightBreakdown, WorkerWeight,
};
