//! Task scheduler — priority queue, dispatch, retries, and backoff.
//!
//! ```text
//! queued ──▶ assigned ──▶ processing ──▶ completed
//!   │  ▲                       │
//!   │  └──(retry, backoff)─────┤
//!   │                          └──▶ failed (retries exhausted)
//!   └──▶ cancelled
//! ```
//!
//! `tick()` assigns and returns; it never waits on an individual task.
//! Each dispatch runs as its own tokio task and re-enters shared state
//! through [`TaskScheduler::complete`] when the adapter call resolves.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use taskgrid_core::{
    epoch_millis, Assignment, EventBus, GridEvent, PerformanceRecord, Requirements,
    SchedulerConfig, Task, TaskFailure, TaskId, TaskOutput, TaskStatus, TaskSubmission,
};
use taskgrid_metrics::ExecutionSample;

use crate::adapter::{ExecutionAdapter, ExecutionOutput, ExecutionRejection};
use crate::error::{SchedulerError, SchedulerResult};
use crate::pool::{PoolManager, Selection, TaskProfile};

/// Counters plus current queue depth.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub queued: usize,
    pub in_flight: usize,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retried: u64,
    /// Times a task was re-queued because no worker could take it.
    pub no_worker_available: u64,
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub dispatched: Vec<TaskId>,
    pub requeued: Vec<TaskId>,
    pub failed: Vec<TaskId>,
    /// Queued tasks still inside their retry backoff.
    pub deferred: usize,
}

#[derive(Default)]
struct SchedulerState {
    queue: VecDeque<Task>,
    active: HashMap<TaskId, Task>,
    /// Terminal tasks, oldest first.
    history: VecDeque<Task>,
    stats: SchedulerStats,
}

impl SchedulerState {
    fn push_history(&mut self, task: Task, capacity: usize, trim_to: usize) {
        self.history.push_back(task);
        if self.history.len() > capacity {
            let excess = self.history.len() - trim_to;
            self.history.drain(..excess);
            debug!(retained = self.history.len(), "task history trimmed");
        }
    }

    fn contains(&self, task_id: &str) -> bool {
        self.active.contains_key(task_id) || self.queue.iter().any(|t| t.id == task_id)
    }
}

#[derive(Clone)]
pub struct TaskScheduler {
    state: Arc<Mutex<SchedulerState>>,
    inflight: Arc<Mutex<JoinSet<()>>>,
    config: SchedulerConfig,
    pool: PoolManager,
    adapter: Arc<dyn ExecutionAdapter>,
    events: EventBus,
    next_id: Arc<AtomicU64>,
}

impl TaskScheduler {
    pub fn new(
        config: SchedulerConfig,
        pool: PoolManager,
        adapter: Arc<dyn ExecutionAdapter>,
        events: EventBus,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(SchedulerState::default())),
            inflight: Arc::new(Mutex::new(JoinSet::new())),
            config,
            pool,
            adapter,
            events,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn pool(&self) -> &PoolManager {
        &self.pool
    }

    /// Validate a submission, apply requirement defaults, and enqueue it.
    ///
    /// Invalid submissions are rejected here and never enqueued.
    pub async fn submit(&self, submission: TaskSubmission) -> SchedulerResult<Task> {
        let req = &submission.requirements;
        if submission.task_type.trim().is_empty() {
            return Err(SchedulerError::Validation("task_type must not be empty".into()));
        }
        if req.priority.is_some_and(|p| p > 10) {
            return Err(SchedulerError::Validation("priority must be within 0..=10".into()));
        }
        if req.timeout_ms == Some(0) {
            return Err(SchedulerError::Validation("timeout_ms must be positive".into()));
        }
        if req.min_quality.is_some_and(|q| !(0.0..=1.0).contains(&q)) {
            return Err(SchedulerError::Validation("min_quality must be within 0.0..=1.0".into()));
        }
        if req.max_cost.is_some_and(|c| c.is_nan() || c < 0.0) {
            return Err(SchedulerError::Validation("max_cost must not be negative".into()));
        }
        if submission.id.as_deref().is_some_and(|id| id.trim().is_empty()) {
            return Err(SchedulerError::Validation("task id must not be empty".into()));
        }

        let requirements = Requirements {
            capability: req.capability.clone(),
            priority: req.priority.unwrap_or(self.config.default_priority),
            timeout_ms: req.timeout_ms.unwrap_or(self.config.task_timeout_ms),
            max_retries: req.max_retries.unwrap_or(self.config.retry.max_retries),
            cluster_id: req.cluster_id.clone(),
            min_quality: req.min_quality,
            max_cost: req.max_cost,
        };

        let mut state = self.state.lock().await;
        let id = match submission.id {
            Some(id) if state.contains(&id) => {
                return Err(SchedulerError::Validation(format!("task {id} is already pending")));
            }
            Some(id) => id,
            None => format!("task-{:06}", self.next_id.fetch_add(1, Ordering::Relaxed)),
        };

        let task = Task {
            id,
            task_type: submission.task_type,
            payload: submission.payload,
            requirements,
            status: TaskStatus::Queued,
            retry_count: 0,
            assignment: None,
            result: None,
            error: None,
            submitted_at: epoch_millis(),
            completed_at: None,
            not_before: None,
        };

        state.queue.push_back(task.clone());
        state.stats.submitted += 1;
        drop(state);

        info!(
            task_id = %task.id,
            task_type = %task.task_type,
            priority = task.requirements.priority,
            "task submitted"
        );
        self.events.publish(GridEvent::TaskSubmitted {
            task_id: task.id.clone(),
            priority: task.requirements.priority,
        });
        Ok(task)
    }

    /// One scheduling pass.
    ///
    /// Stable-sorts the queue by descending priority, takes up to
    /// `min(max_concurrent_tasks - in_flight, max_dispatch_per_tick)` ready
    /// tasks, and tries to place each. Tasks with no available worker go
    /// back to the head of the queue in their original order.
    pub async fn tick(&self) -> TickReport {
        self.reap().await;

        let now = Instant::now();
        let mut report = TickReport::default();

        let batch: Vec<Task> = {
            let mut state = self.state.lock().await;
            state
                .queue
                .make_contiguous()
                .sort_by(|a, b| b.requirements.priority.cmp(&a.requirements.priority));

            let in_flight = state.active.len() as u32;
            let capacity = self
                .config
                .max_concurrent_tasks
                .saturating_sub(in_flight)
                .min(self.config.max_dispatch_per_tick) as usize;

            let mut batch = Vec::new();
            let mut remaining = VecDeque::with_capacity(state.queue.len());
            while let Some(task) = state.queue.pop_front() {
                if !task.is_ready(now) {
                    report.deferred += 1;
                    remaining.push_back(task);
                } else if batch.len() < capacity {
                    batch.push(task);
                } else {
                    remaining.push_back(task);
                }
            }
            state.queue = remaining;
            batch
        };

        let mut requeue = Vec::new();
        for task in batch {
            let outcome = match self.assign(&task).await {
                Ok(selection) => self.dispatch(&task, selection).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => report.dispatched.push(task.id.clone()),
                Err(e) if e.is_fatal() => {
                    report.failed.push(task.id.clone());
                    self.fail_unassigned(task, e).await;
                }
                Err(e) => {
                    debug!(task_id = %task.id, reason = %e, "no worker available, re-queueing");
                    report.requeued.push(task.id.clone());
                    requeue.push(task);
                }
            }
        }

        if !requeue.is_empty() {
            let mut state = self.state.lock().await;
            state.stats.no_worker_available += requeue.len() as u64;
            for task in requeue.into_iter().rev() {
                state.queue.push_front(task);
            }
        }

        if !report.dispatched.is_empty() || !report.requeued.is_empty() || !report.failed.is_empty() {
            debug!(
                dispatched = report.dispatched.len(),
                requeued = report.requeued.len(),
                failed = report.failed.len(),
                deferred = report.deferred,
                "scheduler tick"
            );
        }
        report
    }

    /// Choose a cluster (explicit or scored) and a worker inside it.
    async fn assign(&self, task: &Task) -> SchedulerResult<Selection> {
        let profile = TaskProfile::from(&task.requirements);
        let cluster_id = match &task.requirements.cluster_id {
            Some(id) => id.clone(),
            None => self.pool.select_cluster(&profile).await.ok_or_else(|| {
                SchedulerError::NoWorkerAvailable(format!("no cluster can place task {}", task.id))
            })?,
        };
        Ok(self.pool.select_worker_in_cluster(&cluster_id, &profile).await?)
    }

    /// Claim the worker and start the adapter call in the background.
    async fn dispatch(&self, task: &Task, selection: Selection) -> SchedulerResult<()> {
        let Selection {
            cluster_id,
            worker_id,
            weight,
            rationale,
        } = selection;

        let worker = self.pool.acquire(&cluster_id, &worker_id).await?;
        if !self.pool.breakers().try_acquire(&worker_id).await {
            self.pool.release(&cluster_id, &worker_id).await?;
            return Err(SchedulerError::CircuitOpen(worker_id));
        }

        let mut running = task.clone();
        running.status = TaskStatus::Assigned;
        running.assignment = Some(Assignment {
            cluster_id: cluster_id.clone(),
            worker_id: worker_id.clone(),
            assigned_at: epoch_millis(),
            weight,
        });
        self.events.publish(GridEvent::TaskAssigned {
            task_id: task.id.clone(),
            cluster_id: cluster_id.clone(),
            worker_id: worker_id.clone(),
            weight,
        });
        info!(
            task_id = %task.id,
            %cluster_id,
            %worker_id,
            weight,
            %rationale,
            retry_count = task.retry_count,
            "task assigned"
        );

        running.status = TaskStatus::Processing;
        {
            let mut state = self.state.lock().await;
            state.active.insert(running.id.clone(), running.clone());
        }

        let scheduler = self.clone();
        let timeout_ms = running.requirements.timeout_ms;
        let mut inflight = self.inflight.lock().await;
        inflight.spawn(async move {
            let started = Instant::now();
            let call = scheduler.adapter.execute(&worker, &running);
            let outcome = match tokio::time::timeout(Duration::from_millis(timeout_ms), call).await {
                Ok(result) => result,
                Err(_) => Err(ExecutionRejection::timeout(timeout_ms)),
            };
            scheduler
                .complete(&running.id, &cluster_id, &worker_id, outcome, started.elapsed())
                .await;
        });
        Ok(())
    }

    /// Completion path: free the worker, feed metrics and the breaker, then
    /// finish, retry, or fail the task.
    pub async fn complete(
        &self,
        task_id: &str,
        cluster_id: &str,
        worker_id: &str,
        outcome: Result<ExecutionOutput, ExecutionRejection>,
        elapsed: Duration,
    ) {
        if let Err(e) = self.pool.release(cluster_id, worker_id).await {
            warn!(%task_id, %worker_id, error = %e, "failed to release worker");
        }

        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        let outcome = match outcome {
            Ok(out) if out.success => Ok(out),
            Ok(out) => {
                let message = format!("adapter reported failure: {}", out.output);
                Err((ExecutionRejection::new("UNSUCCESSFUL", message), out.latency_ms, out.cost))
            }
            Err(rejection) => Err((rejection, elapsed_ms, 0.0)),
        };

        let sample = match &outcome {
            Ok(out) => ExecutionSample {
                success: true,
                duration_ms: out.latency_ms,
                cost: out.cost,
            },
            Err((_, latency_ms, cost)) => ExecutionSample {
                success: false,
                duration_ms: *latency_ms,
                cost: *cost,
            },
        };
        let metrics = self.pool.metrics().track_execution(worker_id, sample).await;

        match outcome {
            Ok(out) => {
                self.pool.breakers().record_success(worker_id).await;
                self.finish(task_id, worker_id, out, metrics).await;
            }
            Err((rejection, _, _)) => {
                self.pool.breakers().record_failure(worker_id).await;
                self.retry_or_fail(task_id, worker_id, rejection, metrics).await;
            }
        }
    }

    async fn finish(
        &self,
        task_id: &str,
        worker_id: &str,
        out: ExecutionOutput,
        metrics: Option<PerformanceRecord>,
    ) {
        let mut state = self.state.lock().await;
        let Some(mut task) = state.active.remove(task_id) else {
            warn!(%task_id, "completion for unknown task");
            return;
        };

        task.status = TaskStatus::Completed;
        task.result = Some(TaskOutput {
            output: out.output,
            latency_ms: out.latency_ms,
            cost: out.cost,
            tokens: out.tokens,
        });
        task.completed_at = Some(epoch_millis());
        state.stats.completed += 1;
        state.push_history(task, self.config.history_capacity, self.config.history_trim_to);
        drop(state);

        info!(%task_id, %worker_id, latency_ms = out.latency_ms, "task completed");
        self.events.publish(GridEvent::TaskCompleted {
            task_id: task_id.to_string(),
            worker_id: worker_id.to_string(),
            metrics,
        });
    }

    async fn retry_or_fail(
        &self,
        task_id: &str,
        worker_id: &str,
        rejection: ExecutionRejection,
        metrics: Option<PerformanceRecord>,
    ) {
        let mut state = self.state.lock().await;
        let Some(mut task) = state.active.remove(task_id) else {
            warn!(%task_id, "failure for unknown task");
            return;
        };

        let retry_in = if task.retry_count < task.requirements.max_retries {
            let delay = self.config.retry.delay_for(task.retry_count);
            task.retry_count += 1;
            task.status = TaskStatus::Queued;
            task.assignment = None;
            task.not_before = Some(Instant::now() + delay);
            Some(delay)
        } else {
            task.status = TaskStatus::Failed;
            task.completed_at = Some(epoch_millis());
            None
        };
        task.error = Some(TaskFailure {
            code: rejection.code.clone(),
            message: rejection.message.clone(),
            retry_count: task.retry_count,
        });
        let retry_count = task.retry_count;

        match retry_in {
            Some(delay) => {
                state.stats.retried += 1;
                state.queue.push_back(task);
                warn!(
                    %task_id,
                    %worker_id,
                    error = %SchedulerError::from(rejection.clone()),
                    retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "task failed, retry scheduled"
                );
            }
            None => {
                state.stats.failed += 1;
                state.push_history(task, self.config.history_capacity, self.config.history_trim_to);
                warn!(
                    %task_id,
                    %worker_id,
                    error = %SchedulerError::from(rejection.clone()),
                    retry_count,
                    "task failed permanently"
                );
            }
        }
        drop(state);

        self.events.publish(GridEvent::TaskFailed {
            task_id: task_id.to_string(),
            worker_id: Some(worker_id.to_string()),
            code: rejection.code,
            message: rejection.message,
            retry_count,
            retry_in_ms: retry_in.map(|d| d.as_millis() as u64),
            metrics,
        });
    }

    /// Terminal failure before any worker was claimed. No retry is consumed.
    async fn fail_unassigned(&self, mut task: Task, err: SchedulerError) {
        let code = err.code().to_string();
        let message = err.to_string();
        task.status = TaskStatus::Failed;
        task.completed_at = Some(epoch_millis());
        task.error = Some(TaskFailure {
            code: code.clone(),
            message: message.clone(),
            retry_count: task.retry_count,
        });
        let task_id = task.id.clone();
        let retry_count = task.retry_count;

        {
            let mut state = self.state.lock().await;
            state.stats.failed += 1;
            state.push_history(task, self.config.history_capacity, self.config.history_trim_to);
        }

        error!(%task_id, %code, error = %message, "task cannot be placed");
        self.events.publish(GridEvent::TaskFailed {
            task_id,
            worker_id: None,
            code,
            message,
            retry_count,
            retry_in_ms: None,
            metrics: None,
        });
    }

    /// Cancel a queued task. In-flight tasks cannot be cancelled.
    pub async fn cancel(&self, task_id: &str) -> SchedulerResult<Task> {
        let mut state = self.state.lock().await;

        if let Some(pos) = state.queue.iter().position(|t| t.id == task_id) {
            let Some(mut task) = state.queue.remove(pos) else {
                return Err(SchedulerError::TaskNotFound(task_id.to_string()));
            };
            task.status = TaskStatus::Cancelled;
            task.completed_at = Some(epoch_millis());
            task.not_before = None;
            state.stats.cancelled += 1;
            state.push_history(task.clone(), self.config.history_capacity, self.config.history_trim_to);
            drop(state);

            info!(%task_id, "task cancelled");
            self.events.publish(GridEvent::TaskCancelled {
                task_id: task_id.to_string(),
            });
            return Ok(task);
        }

        let status = state
            .active
            .get(task_id)
            .map(|t| t.status)
            .or_else(|| state.history.iter().rev().find(|t| t.id == task_id).map(|t| t.status));
        match status {
            Some(status) => Err(SchedulerError::NotCancellable {
                task_id: task_id.to_string(),
                status: format!("{status:?}").to_lowercase(),
            }),
            None => Err(SchedulerError::TaskNotFound(task_id.to_string())),
        }
    }

    /// Look a task up in the queue, in flight, or in recent history.
    pub async fn get_task(&self, task_id: &str) -> Option<Task> {
        let state = self.state.lock().await;
        state
            .queue
            .iter()
            .find(|t| t.id == task_id)
            .or_else(|| state.active.get(task_id))
            .or_else(|| state.history.iter().rev().find(|t| t.id == task_id))
            .cloned()
    }

    /// Output of a completed task, or its accumulated failure once retries
    /// ran out. `None` while the task is pending or after cancellation.
    pub async fn outcome(&self, task_id: &str) -> SchedulerResult<Option<TaskOutput>> {
        let task = self
            .get_task(task_id)
            .await
            .ok_or_else(|| SchedulerError::TaskNotFound(task_id.to_string()))?;
        match task.status {
            TaskStatus::Completed => Ok(task.result),
            TaskStatus::Failed => {
                let (message, retry_count) = task
                    .error
                    .map(|e| (format!("[{}] {}", e.code, e.message), e.retry_count))
                    .unwrap_or_else(|| ("unknown failure".to_string(), task.retry_count));
                Err(SchedulerError::Failed {
                    task_id: task.id,
                    message,
                    retry_count,
                })
            }
            _ => Ok(None),
        }
    }

    pub async fn stats(&self) -> SchedulerStats {
        let state = self.state.lock().await;
        SchedulerStats {
            queued: state.queue.len(),
            in_flight: state.active.len(),
            ..state.stats.clone()
        }
    }

    /// True once nothing is queued or in flight.
    pub async fn is_idle(&self) -> bool {
        let state = self.state.lock().await;
        state.queue.is_empty() && state.active.is_empty()
    }

    /// Wait for every in-flight adapter call to complete.
    pub async fn settle(&self) {
        let mut inflight = self.inflight.lock().await;
        while let Some(result) = inflight.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "execution task aborted");
            }
        }
    }

    /// Collect finished execution tasks without waiting.
    async fn reap(&self) {
        let mut inflight = self.inflight.lock().await;
        while let Some(result) = inflight.try_join_next() {
            if let Err(e) = result {
                error!(error = %e, "execution task aborted");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use serde_json::json;
    use taskgrid_core::{
        CircuitBreakerConfig, ClusterConfig, GridConfig, RetryPolicy, ScalingConfig,
        TaskRequirements, Worker,
    };
    use taskgrid_health::BreakerRegistry;
    use taskgrid_metrics::MetricsStore;

    use super::*;
    use crate::adapter::ExecuteFuture;

    /// Behaviour keyed on task type: `fail`, `slow`, `soft-fail`, else success.
    #[derive(Default)]
    struct ScriptedAdapter {
        calls: StdMutex<Vec<(TaskId, String)>>,
    }

    impl ScriptedAdapter {
        fn calls(&self) -> Vec<(TaskId, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ExecutionAdapter for ScriptedAdapter {
        fn execute<'a>(&'a self, worker: &'a Worker, task: &'a Task) -> ExecuteFuture<'a> {
            Box::pin(async move {
                self.calls
                    .lock()
                    .unwrap()
                    .push((task.id.clone(), worker.id.clone()));
                match task.task_type.as_str() {
                    "fail" => Err(ExecutionRejection::new("UPSTREAM", "boom")),
                    "soft-fail" => Ok(ExecutionOutput {
                        success: false,
                        output: json!("refused"),
                        latency_ms: 5.0,
                        cost: 0.0,
                        tokens: None,
                    }),
                    "slow" => {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Ok(ExecutionOutput::ok(json!(null), 1.0, 0.0))
                    }
                    _ => Ok(ExecutionOutput::ok(json!({ "echo": task.payload }), 10.0, 0.001)
                        .with_tokens(12)),
                }
            })
        }
    }

    struct Fixture {
        scheduler: TaskScheduler,
        adapter: Arc<ScriptedAdapter>,
        events: EventBus,
    }

    async fn fixture(tweak: impl FnOnce(&mut GridConfig)) -> Fixture {
        let mut config = GridConfig::default();
        config.routing.seed = Some(1);
        config.scheduler.retry = RetryPolicy {
            max_retries: 3,
            backoff_multiplier: 2.0,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
        };
        config.circuit_breaker = CircuitBreakerConfig {
            failure_threshold: 10,
            cooldown_ms: 30_000,
            half_open_max_trials: 1,
        };
        tweak(&mut config);

        let events = EventBus::new(256);
        let metrics = MetricsStore::new(config.quality.clone());
        let breakers =
            BreakerRegistry::new(config.circuit_breaker.clone(), metrics.clone(), events.clone());
        let pool = PoolManager::new(&config, metrics, breakers, events.clone());

        let mut cluster = ClusterConfig::new("c-main", "general");
        cluster.max_concurrency = Some(1);
        cluster.scaling = Some(ScalingConfig {
            min_workers: 1,
            max_workers: 2,
            ..Default::default()
        });
        pool.create_cluster(&cluster).await.unwrap();

        let adapter = Arc::new(ScriptedAdapter::default());
        let scheduler =
            TaskScheduler::new(config.scheduler.clone(), pool, adapter.clone(), events.clone());
        Fixture {
            scheduler,
            adapter,
            events,
        }
    }

    fn task(task_type: &str) -> TaskSubmission {
        TaskSubmission {
            task_type: task_type.to_string(),
            ..Default::default()
        }
    }

    fn with_priority(task_type: &str, priority: u8) -> TaskSubmission {
        TaskSubmission {
            task_type: task_type.to_string(),
            requirements: TaskRequirements {
                priority: Some(priority),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn submit_applies_defaults() {
        let f = fixture(|_| {}).await;
        let task = f.scheduler.submit(task("summarize")).await.unwrap();

        assert_eq!(task.id, "task-000001");
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.requirements.priority, 5);
        assert_eq!(task.requirements.timeout_ms, 30_000);
        assert_eq!(task.requirements.max_retries, 3);
        assert_eq!(f.scheduler.stats().await.queued, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_submissions_never_enqueue() {
        let f = fixture(|_| {}).await;

        let err = f.scheduler.submit(task("  ")).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Validation(_)));

        let err = f.scheduler.submit(with_priority("x", 11)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Validation(_)));

        let mut zero_timeout = task("x");
        zero_timeout.requirements.timeout_ms = Some(0);
        assert!(f.scheduler.submit(zero_timeout).await.is_err());

        let mut bad_quality = task("x");
        bad_quality.requirements.min_quality = Some(1.5);
        assert!(f.scheduler.submit(bad_quality).await.is_err());

        let stats = f.scheduler.stats().await;
        assert_eq!(stats.queued, 0);
        assert_eq!(stats.submitted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_pending_id_rejected() {
        let f = fixture(|_| {}).await;
        let mut first = task("x");
        first.id = Some("job-1".into());
        f.scheduler.submit(first.clone()).await.unwrap();
        assert!(f.scheduler.submit(first).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn successful_task_completes() {
        let f = fixture(|_| {}).await;
        let mut rx = f.events.subscribe();
        let submitted = f.scheduler.submit(task("echo")).await.unwrap();

        let report = f.scheduler.tick().await;
        assert_eq!(report.dispatched, vec![submitted.id.clone()]);
        f.scheduler.settle().await;

        let done = f.scheduler.get_task(&submitted.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.result.as_ref().unwrap().tokens, Some(12));
        assert_eq!(done.assignment.unwrap().worker_id, "c-main-w001");

        let worker = f.scheduler.pool().worker("c-main-w001").await.unwrap();
        assert_eq!(worker.load, 0);

        let names: Vec<&str> = [
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
        ]
        .iter()
        .map(|e| e.name())
        .collect();
        assert_eq!(names, vec!["task-submitted", "task-assigned", "task-completed"]);

        let stats = f.scheduler.stats().await;
        assert_eq!(stats.completed, 1);
        assert!(f.scheduler.is_idle().await);

        let output = f.scheduler.outcome(&submitted.id).await.unwrap().unwrap();
        assert_eq!(output.output, json!({ "echo": null }));
        assert!(matches!(
            f.scheduler.outcome("missing").await.unwrap_err(),
            SchedulerError::TaskNotFound(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn higher_priority_dispatches_first() {
        let f = fixture(|c| c.scheduler.max_dispatch_per_tick = 1).await;
        let low = f.scheduler.submit(with_priority("echo", 1)).await.unwrap();
        let high = f.scheduler.submit(with_priority("echo", 10)).await.unwrap();

        let report = f.scheduler.tick().await;
        assert_eq!(report.dispatched, vec![high.id.clone()]);
        f.scheduler.settle().await;

        let report = f.scheduler.tick().await;
        assert_eq!(report.dispatched, vec![low.id.clone()]);
        f.scheduler.settle().await;

        let order: Vec<TaskId> = f.adapter.calls().into_iter().map(|(t, _)| t).collect();
        assert_eq!(order, vec![high.id, low.id]);
    }

    #[tokio::test(start_paused = true)]
    async fn equal_priority_keeps_submission_order() {
        let f = fixture(|c| c.scheduler.max_dispatch_per_tick = 1).await;
        let a = f.scheduler.submit(task("echo")).await.unwrap();
        let b = f.scheduler.submit(task("echo")).await.unwrap();

        assert_eq!(f.scheduler.tick().await.dispatched, vec![a.id]);
        f.scheduler.settle().await;
        assert_eq!(f.scheduler.tick().await.dispatched, vec![b.id]);
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_limits_dispatch() {
        let f = fixture(|c| c.scheduler.max_concurrent_tasks = 1).await;
        f.scheduler.submit(task("slow")).await.unwrap();
        f.scheduler.submit(task("slow")).await.unwrap();

        let report = f.scheduler.tick().await;
        assert_eq!(report.dispatched.len(), 1);

        // The single slot is taken, so nothing moves.
        let report = f.scheduler.tick().await;
        assert!(report.dispatched.is_empty());
        assert_eq!(f.scheduler.stats().await.in_flight, 1);
        assert_eq!(f.scheduler.stats().await.queued, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn busy_worker_requeues_at_head() {
        let f = fixture(|_| {}).await;
        let slow = f.scheduler.submit(task("slow")).await.unwrap();
        f.scheduler.tick().await;

        // The only worker has max_concurrency 1 and is occupied.
        let high = f.scheduler.submit(with_priority("echo", 9)).await.unwrap();
        let low = f.scheduler.submit(with_priority("echo", 2)).await.unwrap();
        let report = f.scheduler.tick().await;
        assert_eq!(report.requeued, vec![high.id.clone(), low.id.clone()]);

        let stats = f.scheduler.stats().await;
        assert_eq!(stats.no_worker_available, 2);
        assert_eq!(stats.queued, 2);
        assert_eq!(
            f.scheduler.get_task(&high.id).await.unwrap().status,
            TaskStatus::Queued
        );
        assert_eq!(
            f.scheduler.get_task(&slow.id).await.unwrap().status,
            TaskStatus::Processing
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retries_back_off_exponentially() {
        let f = fixture(|_| {}).await;
        let mut rx = f.events.subscribe();
        let submitted = f.scheduler.submit(task("fail")).await.unwrap();

        f.scheduler.tick().await;
        f.scheduler.settle().await;

        for (expected_retry, delay_ms) in [(1u32, 1000u64), (2, 2000), (3, 4000)] {
            let queued = f.scheduler.get_task(&submitted.id).await.unwrap();
            assert_eq!(queued.status, TaskStatus::Queued);
            assert_eq!(queued.retry_count, expected_retry);

            tokio::time::advance(Duration::from_millis(delay_ms - 1)).await;
            let report = f.scheduler.tick().await;
            assert!(report.dispatched.is_empty(), "dispatched before backoff elapsed");
            assert_eq!(report.deferred, 1);

            tokio::time::advance(Duration::from_millis(1)).await;
            let report = f.scheduler.tick().await;
            assert_eq!(report.dispatched, vec![submitted.id.clone()]);
            f.scheduler.settle().await;
        }

        let failed = f.scheduler.get_task(&submitted.id).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.retry_count, 3);
        let error = failed.error.unwrap();
        assert_eq!(error.code, "UPSTREAM");
        assert_eq!(error.retry_count, 3);

        let mut delays = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let GridEvent::TaskFailed { retry_in_ms, .. } = event {
                delays.push(retry_in_ms);
            }
        }
        assert_eq!(delays, vec![Some(1000), Some(2000), Some(4000), None]);

        let stats = f.scheduler.stats().await;
        assert_eq!(stats.retried, 3);
        assert_eq!(stats.failed, 1);

        match f.scheduler.outcome(&submitted.id).await.unwrap_err() {
            SchedulerError::Failed {
                message,
                retry_count,
                ..
            } => {
                assert_eq!(message, "[UPSTREAM] boom");
                assert_eq!(retry_count, 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unsuccessful_output_is_a_failure() {
        let f = fixture(|_| {}).await;
        let mut sub = task("soft-fail");
        sub.requirements.max_retries = Some(0);
        let submitted = f.scheduler.submit(sub).await.unwrap();

        f.scheduler.tick().await;
        f.scheduler.settle().await;

        let failed = f.scheduler.get_task(&submitted.id).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error.unwrap().code, "UNSUCCESSFUL");

        let record = f
            .scheduler
            .pool()
            .metrics()
            .get_metrics("c-main-w001")
            .await
            .unwrap();
        assert_eq!(record.error_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_surfaces_as_failure() {
        let f = fixture(|_| {}).await;
        let mut sub = task("slow");
        sub.requirements.timeout_ms = Some(500);
        sub.requirements.max_retries = Some(0);
        let submitted = f.scheduler.submit(sub).await.unwrap();

        f.scheduler.tick().await;
        f.scheduler.settle().await;

        let failed = f.scheduler.get_task(&submitted.id).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.error.unwrap().code, "TIMEOUT");
        assert_eq!(f.scheduler.pool().worker("c-main-w001").await.unwrap().load, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn tripped_cluster_yields_to_placeable_one() {
        let f = fixture(|_| {}).await;
        let pool = f.scheduler.pool();
        let mut spare = ClusterConfig::new("c-spare", "general");
        spare.max_concurrency = Some(1);
        spare.scaling = Some(ScalingConfig {
            min_workers: 2,
            max_workers: 2,
            ..Default::default()
        });
        pool.create_cluster(&spare).await.unwrap();
        pool.acquire("c-spare", "c-spare-w001").await.unwrap();

        for _ in 0..10 {
            pool.breakers().record_failure("c-main-w001").await;
        }

        let submitted = f.scheduler.submit(task("echo")).await.unwrap();
        let report = f.scheduler.tick().await;
        assert_eq!(report.dispatched, vec![submitted.id.clone()]);
        f.scheduler.settle().await;

        assert_eq!(
            f.adapter.calls(),
            vec![(submitted.id.clone(), "c-spare-w002".to_string())]
        );
        assert_eq!(f.scheduler.stats().await.no_worker_available, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_cluster_fails_without_retry() {
        let f = fixture(|_| {}).await;
        let mut sub = task("echo");
        sub.requirements.cluster_id = Some("missing".into());
        let submitted = f.scheduler.submit(sub).await.unwrap();

        let report = f.scheduler.tick().await;
        assert_eq!(report.failed, vec![submitted.id.clone()]);

        let failed = f.scheduler.get_task(&submitted.id).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.retry_count, 0);
        assert_eq!(failed.error.unwrap().code, "CLUSTER_NOT_FOUND");
        assert!(f.adapter.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_only_queued() {
        let f = fixture(|_| {}).await;
        let slow = f.scheduler.submit(task("slow")).await.unwrap();
        f.scheduler.tick().await;
        let queued = f.scheduler.submit(task("echo")).await.unwrap();

        let cancelled = f.scheduler.cancel(&queued.id).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert_eq!(
            f.scheduler.get_task(&queued.id).await.unwrap().status,
            TaskStatus::Cancelled
        );

        assert!(matches!(
            f.scheduler.cancel(&slow.id).await.unwrap_err(),
            SchedulerError::NotCancellable { .. }
        ));
        assert!(matches!(
            f.scheduler.cancel(&queued.id).await.unwrap_err(),
            SchedulerError::NotCancellable { .. }
        ));
        assert!(matches!(
            f.scheduler.cancel("nope").await.unwrap_err(),
            SchedulerError::TaskNotFound(_)
        ));
        assert_eq!(f.scheduler.stats().await.cancelled, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn history_is_trimmed() {
        let f = fixture(|c| {
            c.scheduler.history_capacity = 4;
            c.scheduler.history_trim_to = 2;
        })
        .await;

        let mut ids = Vec::new();
        for _ in 0..5 {
            let t = f.scheduler.submit(task("echo")).await.unwrap();
            ids.push(t.id);
            f.scheduler.tick().await;
            f.scheduler.settle().await;
        }

        // Five completions overflow a capacity of four; two are kept.
        assert!(f.scheduler.get_task(&ids[0]).await.is_none());
        assert!(f.scheduler.get_task(&ids[2]).await.is_none());
        assert!(f.scheduler.get_task(&ids[3]).await.is_some());
        assert!(f.scheduler.get_task(&ids[4]).await.is_some());
    }
}
