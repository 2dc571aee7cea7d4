//! Execution adapter contract.
//!
//! The adapter is the only component that actually performs work. The
//! scheduler hands it a worker and a task and awaits the outcome; how the
//! work gets done (a model call, a subprocess, an HTTP request) is the
//! adapter's business.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use taskgrid_core::{Task, Worker};

/// Boxed future alias for adapter results.
pub type ExecuteFuture<'a> =
    Pin<Box<dyn Future<Output = Result<ExecutionOutput, ExecutionRejection>> + Send + 'a>>;

/// What an adapter reports for a completed call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    /// An adapter may complete the call but report an unsuccessful result.
    pub success: bool,
    pub output: serde_json::Value,
    pub latency_ms: f64,
    pub cost: f64,
    pub tokens: Option<u64>,
}

impl ExecutionOutput {
    pub fn ok(output: serde_json::Value, latency_ms: f64, cost: f64) -> Self {
        Self {
            success: true,
            output,
            latency_ms,
            cost,
            tokens: None,
        }
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens = Some(tokens);
        self
    }
}

/// A call the adapter could not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRejection {
    pub code: String,
    pub message: String,
}

impl ExecutionRejection {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        Self::new("TIMEOUT", format!("execution exceeded {timeout_ms}ms"))
    }
}

impl fmt::Display for ExecutionRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ExecutionRejection {}

/// Performs work on behalf of the scheduler.
///
/// The scheduler enforces the task timeout around the returned future and
/// treats an elapsed timeout as an ordinary failure.
pub trait ExecutionAdapter: Send + Sync {
    fn execute<'a>(&'a self, worker: &'a Worker, task: &'a Task) -> ExecuteFuture<'a>;
}
