//! Round-robin and least-connections balancers.
//!
//! Round-robin rotates by worker ID rather than by index, so a worker
//! joining, leaving, or tripping its circuit does not skip or repeat the
//! others.

use std::sync::Mutex;

use taskgrid_core::WorkerId;

use crate::scorer::{Candidate, WorkerWeight};

/// Rotation cursor for one cluster.
///
/// Remembers the last worker handed out and picks the next ID after it in
/// sorted order, wrapping to the smallest.
#[derive(Debug, Default)]
pub struct RoundRobinBalancer {
    last: Mutex<Option<WorkerId>>,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index into `ids` of the next worker in rotation, or `None` if empty.
    pub fn next(&self, ids: &[&str]) -> Option<usize> {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());

        let after = last.as_deref().and_then(|prev| {
            ids.iter()
                .enumerate()
                .filter(|(_, id)| **id > prev)
                .min_by(|a, b| a.1.cmp(b.1))
        });
        let (idx, id) = after.or_else(|| ids.iter().enumerate().min_by(|a, b| a.1.cmp(b.1)))?;

        *last = Some((*id).to_string());
        Some(idx)
    }
}

/// Index of the selectable candidate with the fewest open connections.
///
/// `scored` must be the weights of `candidates`, in the same order. Ties go
/// to the higher weight, then to the earlier candidate.
pub fn least_connections(candidates: &[Candidate], scored: &[WorkerWeight]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (idx, (candidate, weight)) in candidates.iter().zip(scored).enumerate() {
        if !weight.is_selectable() {
            continue;
        }
        let better = match best {
            None => true,
            Some(b) => {
                let current = candidates[b].connections;
                candidate.connections < current
                    || (candidate.connections == current && weight.weight > scored[b].weight)
            }
        };
        if better {
            best = Some(idx);
        }
    }
    best
}
