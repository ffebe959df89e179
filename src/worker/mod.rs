//! Worker loop.
//!
//! A worker claims tasks under a lease, dispatches them to activity or
//! orchestrator execution, renews the lease by heartbeat while the runner
//! is in flight, writes results, schedules retries, dead-letters exhausted
//! tasks, emits notifications, and respects drain requests.
//!
//! A worker that loses its lease (renewal comes back [`LeaseState::Lost`])
//! cancels the in-flight runner and writes nothing: the rightful owner
//! will.

use crate::backend::{Backend, BackendError, FailureDisposition, LeaseState};
use crate::codec::{Codec, Payload};
use crate::context::ActivityContext;
use crate::driver::{self, TurnOutcome};
use crate::notify::{execution_channel, task_channel, NotificationBus, PollBackoff, StateNotice};
use crate::registry::{DurableFunction, FunctionRegistry, HandlerKind};
use crate::{now_ms, ExecutionState, Task, TaskError, TaskState};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Worker parameters.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Generated when absent.
    pub worker_id: Option<String>,
    pub queues: Vec<String>,
    /// Tags a task must all carry for this worker to claim it.
    pub tags: Vec<String>,
    pub max_concurrency: usize,
    pub lease_duration: Duration,
    /// Defaults to a third of the lease to tolerate clock skew.
    pub heartbeat_interval: Option<Duration>,
    pub poll_interval: Duration,
    /// How long a drain waits for in-flight tasks before aborting them.
    pub stop_timeout: Duration,
    pub codec: Codec,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            worker_id: None,
            queues: vec![crate::DEFAULT_QUEUE.to_string()],
            tags: Vec::new(),
            max_concurrency: 8,
            lease_duration: Duration::from_secs(300),
            heartbeat_interval: None,
            poll_interval: Duration::from_millis(250),
            stop_timeout: Duration::from_secs(30),
            codec: Codec::Json,
        }
    }
}

/// Options for [`Client::serve`](crate::Client::serve): worker parameters
/// plus the retention sweep.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub worker: WorkerOptions,
    /// `None` disables the background retention sweep.
    pub cleanup_interval: Option<Duration>,
    pub retention_period: Duration,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            worker: WorkerOptions::default(),
            cleanup_interval: Some(Duration::from_secs(300)),
            retention_period: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Shared lifecycle handle for one worker: drain requests and
/// ready/stopped signals.
#[derive(Clone)]
pub struct WorkerLifecycle {
    name: String,
    drain: CancellationToken,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
    stopped_tx: watch::Sender<bool>,
    stopped_rx: watch::Receiver<bool>,
}

impl WorkerLifecycle {
    pub fn new(name: impl Into<String>) -> WorkerLifecycle {
        let (ready_tx, ready_rx) = watch::channel(false);
        let (stopped_tx, stopped_rx) = watch::channel(false);
        WorkerLifecycle { name: name.into(), drain: CancellationToken::new(), ready_tx, ready_rx, stopped_tx, stopped_rx }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask the worker to stop claiming and finish in-flight tasks.
    pub fn request_drain(&self) {
        self.drain.cancel();
    }

    pub fn is_draining(&self) -> bool {
        self.drain.is_cancelled()
    }

    pub(crate) async fn drained(&self) {
        self.drain.cancelled().await
    }

    /// Resolves once the claim loop has started.
    pub async fn wait_until_ready(&self) {
        let mut rx = self.ready_rx.clone();
        // An error means the worker is gone, which also counts as "not
        // starting up anymore".
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Resolves after the worker loop has returned.
    pub async fn wait_until_stopped(&self) {
        let mut rx = self.stopped_rx.clone();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    fn mark_ready(&self) {
        let _ = self.ready_tx.send(true);
    }

    fn mark_stopped(&self) {
        let _ = self.stopped_tx.send(true);
    }
}

pub struct Worker {
    backend: Arc<dyn Backend>,
    registry: Arc<FunctionRegistry>,
    bus: Option<Arc<dyn NotificationBus>>,
    lifecycle: WorkerLifecycle,
    options: WorkerOptions,
    worker_id: String,
    limits: HashMap<String, u32>,
}

impl Worker {
    pub fn new(
        backend: Arc<dyn Backend>,
        registry: Arc<FunctionRegistry>,
        bus: Option<Arc<dyn NotificationBus>>,
        lifecycle: WorkerLifecycle,
        options: WorkerOptions,
    ) -> Worker {
        let worker_id = options
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", Uuid::new_v4().simple()));
        let limits = registry.concurrency_limits();
        Worker { backend, registry, bus, lifecycle, options, worker_id, limits }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn heartbeat_interval(&self) -> Duration {
        self.options
            .heartbeat_interval
            .unwrap_or_else(|| self.options.lease_duration / 3)
            .max(Duration::from_millis(50))
    }

    /// Run the claim loop until drained. In-flight tasks get up to
    /// `stop_timeout` to finish before being aborted (their leases expire
    /// and another worker reclaims).
    pub async fn run(&self) -> Result<(), BackendError> {
        info!(
            target: "senpuki::worker",
            worker_id = %self.worker_id,
            queues = ?self.options.queues,
            max_concurrency = self.options.max_concurrency,
            "worker starting"
        );

        let semaphore = Arc::new(Semaphore::new(self.options.max_concurrency.max(1)));
        let mut runners: JoinSet<()> = JoinSet::new();
        let mut claim_backoff = PollBackoff::new(self.options.poll_interval, Duration::from_secs(5), 2.0);
        self.lifecycle.mark_ready();

        loop {
            while runners.try_join_next().is_some() {}

            if self.lifecycle.is_draining() {
                break;
            }

            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = self.lifecycle.drained() => break,
            };

            match self
                .backend
                .claim_next_task(
                    &self.worker_id,
                    &self.options.queues,
                    &self.options.tags,
                    self.options.lease_duration,
                    &self.limits,
                )
                .await
            {
                Ok(Some(task)) => {
                    claim_backoff.reset();
                    let runner = TaskRunner {
                        backend: self.backend.clone(),
                        registry: self.registry.clone(),
                        bus: self.bus.clone(),
                        worker_id: self.worker_id.clone(),
                        codec: self.options.codec,
                        lease_duration: self.options.lease_duration,
                        heartbeat_interval: self.heartbeat_interval(),
                    };
                    runners.spawn(async move {
                        runner.run(task).await;
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(self.options.poll_interval) => {}
                        _ = self.lifecycle.drained() => break,
                    }
                }
                Err(e) if e.is_retryable() => {
                    drop(permit);
                    let backoff = claim_backoff.next_interval();
                    warn!(
                        target: "senpuki::worker",
                        worker_id = %self.worker_id,
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "backend unavailable, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.lifecycle.drained() => break,
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!(target: "senpuki::worker", worker_id = %self.worker_id, error = %e, "claim failed");
                    tokio::select! {
                        _ = tokio::time::sleep(self.options.poll_interval) => {}
                        _ = self.lifecycle.drained() => break,
                    }
                }
            }
        }

        debug!(target: "senpuki::worker", worker_id = %self.worker_id, "draining");
        let deadline = tokio::time::Instant::now() + self.options.stop_timeout;
        loop {
            tokio::select! {
                joined = runners.join_next() => {
                    if joined.is_none() {
                        break;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(
                        target: "senpuki::worker",
                        worker_id = %self.worker_id,
                        remaining = runners.len(),
                        "stop timeout reached, aborting in-flight tasks"
                    );
                    runners.abort_all();
                    break;
                }
            }
        }

        self.lifecycle.mark_stopped();
        info!(target: "senpuki::worker", worker_id = %self.worker_id, "worker stopped");
        Ok(())
    }
}

enum RunResult {
    Done(Result<Payload, TaskError>),
    Suspended { progress: Vec<crate::StepRecord>, scheduled_for: i64, children: Vec<Task> },
    TimedOut,
    LeaseLost,
}

struct TaskRunner {
    backend: Arc<dyn Backend>,
    registry: Arc<FunctionRegistry>,
    bus: Option<Arc<dyn NotificationBus>>,
    worker_id: String,
    codec: Codec,
    lease_duration: Duration,
    heartbeat_interval: Duration,
}

impl TaskRunner {
    async fn run(&self, task: Task) {
        let cancel = CancellationToken::new();
        let heartbeat = self.spawn_heartbeat(task.id, cancel.clone());

        self.execute(&task, &cancel).await;

        cancel.cancel();
        heartbeat.abort();
    }

    /// Renew the lease until the runner finishes; on a lost lease, cancel
    /// the runner so nothing gets written.
    fn spawn_heartbeat(&self, task_id: Uuid, cancel: CancellationToken) -> JoinHandle<()> {
        let backend = self.backend.clone();
        let worker_id = self.worker_id.clone();
        let lease = self.lease_duration;
        let interval = self.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match backend.renew_lease(task_id, &worker_id, lease).await {
                            Ok(LeaseState::Renewed) => {}
                            Ok(LeaseState::Lost) => {
                                warn!(
                                    target: "senpuki::worker",
                                    task_id = %task_id,
                                    worker_id = %worker_id,
                                    "lease lost, aborting runner"
                                );
                                cancel.cancel();
                                break;
                            }
                            Err(e) => {
                                // Transient renewal failures are survivable
                                // while the lease itself has slack.
                                warn!(
                                    target: "senpuki::worker",
                                    task_id = %task_id,
                                    error = %e,
                                    "lease renewal failed"
                                );
                            }
                        }
                    }
                }
            }
        })
    }

    async fn execute(&self, task: &Task, cancel: &CancellationToken) {
        // Cancellation check: abort before user code runs.
        match self.backend.get_execution_state(task.execution_id).await {
            Ok(Some(view)) if view.execution.state == ExecutionState::Cancelled => {
                debug!(target: "senpuki::worker", task_id = %task.id, "execution cancelled, dropping task");
                let _ = self
                    .backend
                    .fail_task(task.id, &self.worker_id, "execution cancelled", FailureDisposition::Cancelled)
                    .await;
                self.publish_task(task.id, TaskState::Failed).await;
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(target: "senpuki::worker", task_id = %task.id, error = %e, "execution lookup failed");
                return;
            }
        }

        let Some(func) = self.registry.resolve(&task.step_name) else {
            // Retrying an unresolvable name on the same binary is
            // pointless: dead-letter immediately.
            error!(
                target: "senpuki::worker",
                task_id = %task.id,
                step_name = %task.step_name,
                "unknown step name, dead-lettering"
            );
            let error = format!("function not registered: {}", task.step_name);
            let _ = self
                .backend
                .fail_task(
                    task.id,
                    &self.worker_id,
                    &error,
                    FailureDisposition::Dead { execution_state: ExecutionState::Failed },
                )
                .await;
            self.publish_settled(task, TaskState::Dead, ExecutionState::Failed).await;
            return;
        };

        // Idempotency / cache short-circuit.
        for key in [task.idempotency_key.as_deref(), task.cache_key.as_deref()].into_iter().flatten() {
            match self.backend.get_cache(key).await {
                Ok(Some(cached)) => {
                    debug!(target: "senpuki::worker", task_id = %task.id, key = %key, "cache hit, short-circuiting");
                    self.finish_success(task, &func, cached, false).await;
                    return;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(target: "senpuki::worker", task_id = %task.id, error = %e, "cache lookup failed");
                }
            }
        }

        let started = std::time::Instant::now();
        let result = self.run_body(task, &func, cancel).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            RunResult::LeaseLost => {
                // Another worker owns the task now; write nothing.
                debug!(target: "senpuki::worker", task_id = %task.id, "runner cancelled after lease loss");
            }
            RunResult::TimedOut => {
                warn!(
                    target: "senpuki::worker",
                    task_id = %task.id,
                    step_name = %task.step_name,
                    elapsed_ms,
                    "task expired while running"
                );
                let _ = self
                    .backend
                    .fail_task(
                        task.id,
                        &self.worker_id,
                        "task expired before completion",
                        FailureDisposition::Dead { execution_state: ExecutionState::TimedOut },
                    )
                    .await;
                self.publish_settled(task, TaskState::Dead, ExecutionState::TimedOut).await;
            }
            RunResult::Suspended { progress, scheduled_for, children } => {
                if let Err(e) = self
                    .backend
                    .suspend_task(task.id, &self.worker_id, &progress, scheduled_for, &children)
                    .await
                {
                    warn!(target: "senpuki::worker", task_id = %task.id, error = %e, "suspend failed");
                }
            }
            RunResult::Done(Ok(result)) => {
                debug!(
                    target: "senpuki::worker",
                    task_id = %task.id,
                    step_name = %task.step_name,
                    elapsed_ms,
                    outcome = "success",
                    "task completed"
                );
                self.finish_success(task, &func, result, true).await;
            }
            RunResult::Done(Err(error)) => {
                self.finish_failure(task, &func, error, elapsed_ms).await;
            }
        }
    }

    async fn run_body(&self, task: &Task, func: &Arc<DurableFunction>, cancel: &CancellationToken) -> RunResult {
        let deadline = task.expires_at.map(|expires_at| {
            let remaining = (expires_at - now_ms()).max(0);
            tokio::time::Instant::now() + Duration::from_millis(remaining as u64)
        });
        let expiry = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => futures::future::pending().await,
            }
        };

        match &func.handler {
            HandlerKind::Activity(handler) => {
                let ctx = ActivityContext::new(
                    task.execution_id,
                    task.id,
                    task.step_name.clone(),
                    task.attempt,
                    self.worker_id.clone(),
                    self.backend.clone(),
                    cancel.child_token(),
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => RunResult::LeaseLost,
                    _ = expiry => RunResult::TimedOut,
                    result = handler.invoke(ctx, task.args.clone()) => RunResult::Done(result),
                }
            }
            HandlerKind::Orchestrator(handler) => {
                let turn = driver::run_orchestrator_turn(&self.backend, &self.registry, self.codec, task, handler.clone());
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => RunResult::LeaseLost,
                    _ = expiry => RunResult::TimedOut,
                    outcome = turn => match outcome {
                        Ok(TurnOutcome::Completed(result)) => RunResult::Done(Ok(result)),
                        Ok(TurnOutcome::Failed(error)) => RunResult::Done(Err(error)),
                        Ok(TurnOutcome::Suspended { progress, scheduled_for, children }) => {
                            RunResult::Suspended { progress, scheduled_for, children }
                        }
                        Err(e) if e.is_retryable() => RunResult::Done(Err(TaskError::Retryable(e.to_string()))),
                        Err(e) => RunResult::Done(Err(TaskError::Terminal(e.to_string()))),
                    },
                }
            }
        }
    }

    async fn finish_success(&self, task: &Task, func: &Arc<DurableFunction>, result: Payload, fill_cache: bool) {
        if fill_cache {
            if let Some(key) = task.cache_key.as_deref() {
                if let Err(e) = self.backend.put_cache(key, &result, func.options.cache_ttl).await {
                    warn!(target: "senpuki::worker", task_id = %task.id, error = %e, "cache write failed");
                }
            }
            if let Some(key) = task.idempotency_key.as_deref() {
                if let Err(e) = self.backend.put_cache(key, &result, None).await {
                    warn!(target: "senpuki::worker", task_id = %task.id, error = %e, "idempotency write failed");
                }
            }
        }

        if let Err(e) = self.backend.complete_task(task.id, &self.worker_id, &result).await {
            // Likely a lost lease surfacing late; the rightful owner wrote
            // or will write the result.
            warn!(target: "senpuki::worker", task_id = %task.id, error = %e, "complete failed");
            return;
        }
        self.publish_settled(task, TaskState::Completed, ExecutionState::Completed).await;
    }

    async fn finish_failure(&self, task: &Task, func: &Arc<DurableFunction>, error: TaskError, elapsed_ms: u64) {
        let attempts_left = task.attempt + 1 < task.max_attempts;
        if !error.is_terminal() && attempts_left {
            let policy = func.retry_policy();
            let retry_at = now_ms() + policy.delay_for_attempt(task.attempt).as_millis() as i64;
            warn!(
                target: "senpuki::worker",
                task_id = %task.id,
                step_name = %task.step_name,
                attempt = task.attempt,
                elapsed_ms,
                error = %error,
                retry_at,
                "task failed, retrying"
            );
            if let Err(e) = self
                .backend
                .fail_task(task.id, &self.worker_id, error.message(), FailureDisposition::Retry { at: retry_at })
                .await
            {
                warn!(target: "senpuki::worker", task_id = %task.id, error = %e, "retry transition failed");
            }
            return;
        }

        error!(
            target: "senpuki::worker",
            task_id = %task.id,
            step_name = %task.step_name,
            attempt = task.attempt,
            elapsed_ms,
            error = %error,
            "task failed terminally, dead-lettering"
        );
        if let Err(e) = self
            .backend
            .fail_task(
                task.id,
                &self.worker_id,
                error.message(),
                FailureDisposition::Dead { execution_state: ExecutionState::Failed },
            )
            .await
        {
            warn!(target: "senpuki::worker", task_id = %task.id, error = %e, "dead-letter transition failed");
            return;
        }
        self.publish_settled(task, TaskState::Dead, ExecutionState::Failed).await;
    }

    async fn publish_task(&self, task_id: Uuid, state: TaskState) {
        let Some(bus) = &self.bus else { return };
        let notice = StateNotice::for_task(task_id, state);
        if let Err(e) = bus.publish(&task_channel(task_id), &notice).await {
            warn!(target: "senpuki::worker", task_id = %task_id, error = %e, "notify failed");
        }
    }

    async fn publish_settled(&self, task: &Task, task_state: TaskState, execution_state: ExecutionState) {
        self.publish_task(task.id, task_state).await;
        if task.parent_task_id.is_none() {
            let Some(bus) = &self.bus else { return };
            let notice = StateNotice::for_execution(task.execution_id, execution_state);
            if let Err(e) = bus.publish(&execution_channel(task.execution_id), &notice).await {
                warn!(target: "senpuki::worker", execution_id = %task.execution_id, error = %e, "notify failed");
            }
        }
    }
}
