//! Executor facade.
//!
//! [`Client`] is the public surface of the engine: dispatch, wait, state
//! inspection, signal sends, dead-letter operations, and `serve` for
//! running a worker with a retention sweep. A `Client` owns its function
//! registry; nothing in the engine is process-global.

use crate::backend::{Backend, BackendError, ExecutionView};
use crate::codec::{Codec, CodecError, Payload};
use crate::notify::{execution_channel, NotificationBus, PollBackoff};
use crate::registry::{FunctionRegistry, TaskOverrides};
use crate::worker::{ServeOptions, Worker, WorkerLifecycle};
use crate::{DeadLetter, Execution, ExecutionState, RetryPolicy, Task};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Error surface of the facade.
#[derive(Debug, Clone)]
pub enum ClientError {
    /// Dispatch of a function name the registry does not know. Fatal: fix
    /// the registration, not the call site.
    NotRegistered { name: String },
    /// Backend operation failed (carries retryability).
    Backend(BackendError),
    Serialization(CodecError),
    NotFound { execution_id: Uuid },
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::NotRegistered { name } => write!(f, "function not registered: {name}"),
            ClientError::Backend(e) => write!(f, "{e}"),
            ClientError::Serialization(e) => write!(f, "{e}"),
            ClientError::NotFound { execution_id } => write!(f, "execution not found: {execution_id}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<BackendError> for ClientError {
    fn from(e: BackendError) -> Self {
        ClientError::Backend(e)
    }
}

impl From<CodecError> for ClientError {
    fn from(e: CodecError) -> Self {
        ClientError::Serialization(e)
    }
}

/// Error returned by the wait helpers.
#[derive(Debug, Clone)]
pub enum WaitError {
    /// The caller-supplied timeout elapsed first; the execution keeps
    /// running.
    Timeout,
    /// The execution reached a non-completed terminal state.
    Terminal { state: ExecutionState, error: Option<String> },
    Client(ClientError),
}

impl std::fmt::Display for WaitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitError::Timeout => write!(f, "timed out waiting for execution"),
            WaitError::Terminal { state, error } => match error {
                Some(error) => write!(f, "execution {state}: {error}"),
                None => write!(f, "execution {state}"),
            },
            WaitError::Client(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for WaitError {}

impl From<ClientError> for WaitError {
    fn from(e: ClientError) -> Self {
        WaitError::Client(e)
    }
}

impl From<CodecError> for WaitError {
    fn from(e: CodecError) -> Self {
        WaitError::Client(ClientError::Serialization(e))
    }
}

/// Per-dispatch overrides. `expiry` is measured from `scheduled_for`
/// (i.e. after `delay`), not from dispatch time.
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    pub queue: Option<String>,
    pub priority: Option<i32>,
    pub tags: Vec<String>,
    pub delay: Option<Duration>,
    pub expiry: Option<Duration>,
    pub idempotency_key: Option<String>,
    pub retry: Option<RetryPolicy>,
}

/// Counts per execution state plus the dead-letter queue depth, assembled
/// from backend count APIs (no full scans).
#[derive(Debug, Clone)]
pub struct Stats {
    pub executions: HashMap<ExecutionState, u64>,
    pub dead_tasks: u64,
}

impl Stats {
    pub fn total_executions(&self) -> u64 {
        self.executions.values().sum()
    }
}

#[derive(Clone)]
pub struct Client {
    backend: Arc<dyn Backend>,
    registry: Arc<FunctionRegistry>,
    bus: Option<Arc<dyn NotificationBus>>,
    codec: Codec,
}

impl Client {
    pub fn new(backend: Arc<dyn Backend>, registry: Arc<FunctionRegistry>) -> Client {
        Client { backend, registry, bus: None, codec: Codec::Json }
    }

    /// Attach a notification bus; waiters subscribe instead of polling at
    /// the minimum interval, and workers publish transitions.
    pub fn with_bus(mut self, bus: Arc<dyn NotificationBus>) -> Client {
        self.bus = Some(bus);
        self
    }

    /// Change the default codec for dispatched arguments.
    pub fn with_codec(mut self, codec: Codec) -> Client {
        self.codec = codec;
        self
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.registry
    }

    /// Start one execution of a registered durable function. The execution
    /// row and its root task are written atomically; fails fast with
    /// [`ClientError::NotRegistered`] for unknown names.
    pub async fn dispatch<A: Serialize>(
        &self,
        name: &str,
        args: &A,
        options: DispatchOptions,
    ) -> Result<Uuid, ClientError> {
        let func = self
            .registry
            .resolve(name)
            .ok_or_else(|| ClientError::NotRegistered { name: name.to_string() })?;
        let args = Payload::encode(self.codec, args)?;

        let overrides = TaskOverrides {
            queue: options.queue,
            priority: options.priority,
            tags: options.tags,
            delay: options.delay,
            expiry: options.expiry,
            idempotency_key: options.idempotency_key,
            retry: options.retry,
        };
        let execution = Execution::new(name, args.clone());
        let task = func.build_task(execution.id, None, args, &overrides);
        self.backend.create_execution_with_root_task(&execution, &task).await?;

        info!(
            target: "senpuki::client",
            execution_id = %execution.id,
            step_name = %name,
            queue = %task.queue,
            "dispatched"
        );
        Ok(execution.id)
    }

    /// Wait for the execution's terminal state and return the completed
    /// result. Subscribes to `execution:{id}` when a bus is configured and
    /// falls back to adaptive polling; the backend poll stays authoritative
    /// either way.
    pub async fn wait_for(&self, execution_id: Uuid, timeout: Option<Duration>) -> Result<Payload, WaitError> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        let mut subscription = match &self.bus {
            Some(bus) => match bus.subscribe(&execution_channel(execution_id)).await {
                Ok(rx) => Some(rx),
                Err(e) => {
                    warn!(target: "senpuki::client", execution_id = %execution_id, error = %e, "subscribe failed, polling");
                    None
                }
            },
            None => None,
        };
        let mut backoff = PollBackoff::default();

        loop {
            let view = self
                .backend
                .get_execution_state(execution_id)
                .await
                .map_err(ClientError::from)?
                .ok_or(ClientError::NotFound { execution_id })?;
            match view.execution.state {
                ExecutionState::Completed => {
                    return Ok(view.execution.result.unwrap_or_else(Payload::unit));
                }
                state if state.is_terminal() => {
                    return Err(WaitError::Terminal { state, error: view.execution.error });
                }
                _ => {}
            }

            let mut interval = backoff.next_interval();
            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    return Err(WaitError::Timeout);
                }
                interval = interval.min(remaining);
            }

            let mut subscription_closed = false;
            match &mut subscription {
                Some(rx) => {
                    tokio::select! {
                        notice = rx.recv() => match notice {
                            Some(_) => backoff.reset(),
                            None => subscription_closed = true,
                        },
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
                None => tokio::time::sleep(interval).await,
            }
            if subscription_closed {
                // Publisher is gone; keep polling.
                subscription = None;
            }
        }
    }

    /// [`wait_for`](Self::wait_for), decoding the result payload.
    pub async fn wait_for_typed<T: DeserializeOwned>(
        &self,
        execution_id: Uuid,
        timeout: Option<Duration>,
    ) -> Result<T, WaitError> {
        let payload = self.wait_for(execution_id, timeout).await?;
        Ok(payload.decode()?)
    }

    /// Full view of one execution: state, result, error, counters, custom
    /// state.
    pub async fn state_of(&self, execution_id: Uuid) -> Result<ExecutionView, ClientError> {
        self.backend
            .get_execution_state(execution_id)
            .await?
            .ok_or(ClientError::NotFound { execution_id })
    }

    pub async fn list_executions(
        &self,
        state: Option<ExecutionState>,
        limit: u32,
    ) -> Result<Vec<Execution>, ClientError> {
        Ok(self.backend.list_executions(state, limit).await?)
    }

    pub async fn list_tasks(&self, execution_id: Uuid) -> Result<Vec<Task>, ClientError> {
        Ok(self.backend.list_tasks(execution_id).await?)
    }

    /// Deliver a named signal to an execution; consumed FIFO by
    /// `wait_for_signal` in its orchestrator.
    pub async fn send_signal<T: Serialize>(
        &self,
        execution_id: Uuid,
        name: &str,
        payload: &T,
    ) -> Result<(), ClientError> {
        let payload = Payload::encode(self.codec, payload)?;
        self.backend.send_signal(execution_id, name, &payload).await?;
        debug!(target: "senpuki::client", execution_id = %execution_id, signal = %name, "signal sent");
        Ok(())
    }

    /// Cancel an execution. Claimed-but-unstarted tasks abort before user
    /// code runs; in-flight activities keep running until their next
    /// cancellation check or lease expiry.
    pub async fn cancel(&self, execution_id: Uuid) -> Result<(), ClientError> {
        self.backend
            .set_execution_state(execution_id, ExecutionState::Cancelled, Some("cancelled"))
            .await?;
        Ok(())
    }

    pub async fn list_dead_letters(&self, limit: u32) -> Result<Vec<DeadLetter>, ClientError> {
        Ok(self.backend.list_dead_letters(limit).await?)
    }

    pub async fn get_dead_letter(&self, task_id: Uuid) -> Result<Option<DeadLetter>, ClientError> {
        Ok(self.backend.get_dead_letter(task_id).await?)
    }

    /// Re-create a pending task from a dead-letter snapshot, optionally on
    /// a different queue. The snapshot row remains until deleted.
    pub async fn replay_dead_letter(&self, task_id: Uuid, queue: Option<&str>) -> Result<Task, ClientError> {
        Ok(self.backend.replay_dead_letter(task_id, queue).await?)
    }

    pub async fn delete_dead_letter(&self, task_id: Uuid) -> Result<bool, ClientError> {
        Ok(self.backend.delete_dead_letter(task_id).await?)
    }

    /// Counts per execution state plus DLQ depth.
    pub async fn stats(&self) -> Result<Stats, ClientError> {
        let mut executions = HashMap::new();
        for state in ExecutionState::ALL {
            executions.insert(state, self.backend.count_executions(Some(state)).await?);
        }
        let dead_tasks = self.backend.count_dead_tasks().await?;
        Ok(Stats { executions, dead_tasks })
    }

    pub fn create_worker_lifecycle(&self, name: impl Into<String>) -> WorkerLifecycle {
        WorkerLifecycle::new(name)
    }

    pub fn request_worker_drain(&self, lifecycle: &WorkerLifecycle) {
        lifecycle.request_drain();
    }

    /// Run a worker against this client's backend and registry until the
    /// lifecycle drains, sweeping expired terminal executions in the
    /// background.
    pub async fn serve(&self, lifecycle: WorkerLifecycle, options: ServeOptions) -> Result<(), ClientError> {
        let mut worker_options = options.worker.clone();
        worker_options.codec = self.codec;
        let worker = Worker::new(
            self.backend.clone(),
            self.registry.clone(),
            self.bus.clone(),
            lifecycle.clone(),
            worker_options,
        );

        let cleanup = options.cleanup_interval.map(|interval| {
            let backend = self.backend.clone();
            let retention = options.retention_period;
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = lifecycle.drained() => break,
                        _ = tokio::time::sleep(interval) => {
                            match backend.cleanup_executions(retention).await {
                                Ok(0) => {}
                                Ok(removed) => {
                                    info!(target: "senpuki::client", removed, "swept expired executions");
                                }
                                Err(e) => {
                                    warn!(target: "senpuki::client", error = %e, "cleanup sweep failed");
                                }
                            }
                        }
                    }
                }
            })
        });

        let result = worker.run().await;

        if let Some(cleanup) = cleanup {
            cleanup.abort();
        }
        result.map_err(ClientError::from)
    }
}
