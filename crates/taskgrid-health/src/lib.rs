//! taskgrid-health — circuit breakers for TaskGrid workers.
//!
//! Isolates persistently failing workers so the router stops sending them
//! work, then lets bounded trial traffic through once a cooldown elapses.
//!
//! # Architecture
//!
//! ```text
//! BreakerRegistry
//!   ├── CircuitBreaker per worker (CLOSED / OPEN / HALF_OPEN)
//!   ├── record_failure() / record_success() ← scheduler completions
//!   ├── check_cooldowns()                   ← health-check tick
//!   ├── try_acquire()                       ← consumes half-open trials
//!   └── MetricsStore::set_circuit_open() + circuit-opened / circuit-closed events
//! ```
//!
//! # Recovery
//!
//! An open circuit moves to half-open only after a quiet cooldown; any
//! failure during the cooldown restarts it. Only a successful trial closes
//! the circuit and resets the failure count.

pub mod breaker;
pub mod registry;

pub use breaker::{CircuitBreaker, CircuitState};
pub use registry::{BreakerRegistry, BreakerSnapshot};
