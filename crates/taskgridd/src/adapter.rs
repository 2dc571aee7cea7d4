//! Process-backed execution adapter.
//!
//! Runs the task's `payload.command` through `sh -c` and reports the exit
//! status, stdout, and stderr. An optional numeric `payload.cost` is passed
//! through as the execution cost.

use std::process::Stdio;

use serde_json::json;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::debug;

use taskgrid_core::{Task, Worker};
use taskgrid_scheduler::{ExecuteFuture, ExecutionAdapter, ExecutionOutput, ExecutionRejection};

const MAX_STDOUT: usize = 50_000;
const MAX_STDERR: usize = 10_000;

#[derive(Debug, Clone)]
pub struct CommandAdapter {
    shell: String,
}

impl CommandAdapter {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }

    pub fn with_shell(shell: &str) -> Self {
        Self {
            shell: shell.to_string(),
        }
    }
}

impl Default for CommandAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionAdapter for CommandAdapter {
    fn execute<'a>(&'a self, worker: &'a Worker, task: &'a Task) -> ExecuteFuture<'a> {
        Box::pin(async move {
            let command = task
                .payload
                .get("command")
                .and_then(|c| c.as_str())
                .ok_or_else(|| {
                    ExecutionRejection::new("INVALID_PAYLOAD", "payload.command must be a string")
                })?;
            let cost = task.payload.get("cost").and_then(|c| c.as_f64()).unwrap_or(0.0);

            debug!(task_id = %task.id, worker_id = %worker.id, %command, "executing command");
            let started = Instant::now();
            // Dropping the future on timeout kills the child.
            let output = Command::new(&self.shell)
                .arg("-c")
                .arg(command)
                .env("TASKGRID_TASK_ID", &task.id)
                .env("TASKGRID_WORKER_ID", &worker.id)
                .env("TASKGRID_CLUSTER_ID", &worker.cluster_id)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|e| ExecutionRejection::new("SPAWN_FAILED", e.to_string()))?;
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);

            if !output.status.success() {
                return Err(ExecutionRejection::new(
                    "EXIT_STATUS",
                    format!(
                        "command exited with {exit_code}: {}",
                        truncate_output(stderr.trim(), 500)
                    ),
                ));
            }

            Ok(ExecutionOutput::ok(
                json!({
                    "exit_code": exit_code,
                    "stdout": truncate_output(&stdout, MAX_STDOUT),
                    "stderr": truncate_output(&stderr, MAX_STDERR),
                }),
                latency_ms,
                cost,
            ))
        })
    }
}

fn truncate_output(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated)", &s[..end])
}

#[cfg(test)]
mod tests {
    use serde_json::Value;
    use taskgrid_core::{Requirements, ResourceUsage, TaskStatus, WorkerStatus};

    use super::*;

    fn worker() -> Worker {
        Worker {
            id: "c-1-w001".to_string(),
            cluster_id: "c-1".to_string(),
            capability: "general".to_string(),
            category: "general".to_string(),
            status: WorkerStatus::Busy,
            load: 1,
            max_concurrency: 1,
            resources: ResourceUsage::default(),
            created_at: 0,
        }
    }

    fn task(payload: Value) -> Task {
        Task {
            id: "task-000001".to_string(),
            task_type: "shell".to_string(),
            payload,
            requirements: Requirements {
                capability: None,
                priority: 5,
                timeout_ms: 5_000,
                max_retries: 0,
                cluster_id: None,
                min_quality: None,
                max_cost: None,
            },
            status: TaskStatus::Processing,
            retry_count: 0,
            assignment: None,
            result: None,
            error: None,
            submitted_at: 0,
            completed_at: None,
            not_before: None,
        }
    }

    #[tokio::test]
    async fn captures_stdout_and_cost() {
        let adapter = CommandAdapter::new();
        let out = adapter
            .execute(&worker(), &task(json!({ "command": "echo $TASKGRID_WORKER_ID", "cost": 0.25 })))
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(out.output["stdout"], "c-1-w001\n");
        assert_eq!(out.output["exit_code"], 0);
        assert_eq!(out.cost, 0.25);
    }

    #[tokio::test]
    async fn nonzero_exit_is_rejected() {
        let adapter = CommandAdapter::with_shell("/bin/sh");
        let err = adapter
            .execute(&worker(), &task(json!({ "command": "echo nope >&2; exit 3" })))
            .await
            .unwrap_err();
        assert_eq!(err.code, "EXIT_STATUS");
        assert!(err.message.contains("exited with 3"));
        assert!(err.message.contains("nope"));
    }

    #[tokio::test]
    async fn missing_command_is_rejected() {
        let adapter = CommandAdapter::new();
        let err = adapter
            .execute(&worker(), &task(json!({ "prompt": "hello" })))
            .await
            .unwrap_err();
        assert_eq!(err.code, "INVALID_PAYLOAD");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_output("short", 10), "short");
        let long = "é".repeat(10);
        let cut = truncate_output(&long, 5);
        assert!(cut.starts_with("éé"));
        assert!(cut.ends_with("(truncated)"));
    }
}
