//! Execution contexts.
//!
//! [`ActivityContext`] is handed to activity bodies: correlation metadata,
//! durable counters and custom state on the owning execution, and a
//! cooperative cancellation token that trips when the worker loses its
//! lease.
//!
//! [`OrchestrationContext`] is handed to orchestrator bodies. Its durable
//! operations ([`call`](OrchestrationContext::call),
//! [`durable_sleep`](OrchestrationContext::durable_sleep),
//! [`wait_for_signal`](OrchestrationContext::wait_for_signal), counters,
//! custom state) register logical steps with a deterministic index in call
//! order. A step whose outcome is already in the progress log resolves
//! synchronously (replay); an unresolved step leaves the returned future
//! pending, and the driver either resolves it between body polls or parks
//! the task.

use crate::backend::Backend;
use crate::codec::{Codec, Payload};
use crate::registry::{FunctionRegistry, TaskOverrides};
use crate::{now_ms, RetryPolicy, StepKind, StepRecord, StepStatus, Task, TaskError};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn backend_err(e: crate::backend::BackendError) -> TaskError {
    if e.is_retryable() {
        TaskError::Retryable(e.to_string())
    } else {
        TaskError::Terminal(e.to_string())
    }
}

// ============================================================================
// Activity context
// ============================================================================

/// Context bound to a running activity task.
#[derive(Clone)]
pub struct ActivityContext {
    execution_id: Uuid,
    task_id: Uuid,
    step_name: String,
    attempt: u32,
    worker_id: String,
    backend: Arc<dyn Backend>,
    cancellation: CancellationToken,
}

impl ActivityContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        execution_id: Uuid,
        task_id: Uuid,
        step_name: String,
        attempt: u32,
        worker_id: String,
        backend: Arc<dyn Backend>,
        cancellation: CancellationToken,
    ) -> Self {
        Self { execution_id, task_id, step_name, attempt, worker_id, backend, cancellation }
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    /// 0 on the first attempt.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Atomically add to a per-execution counter. Applied immediately;
    /// under retries the add is at-least-once.
    pub async fn add_counter(&self, name: &str, delta: i64) -> Result<(), TaskError> {
        self.backend.add_counter(self.execution_id, name, delta).await.map_err(backend_err)
    }

    /// Atomically set a custom-state value on the owning execution.
    pub async fn set_state<T: Serialize>(&self, key: &str, value: &T) -> Result<(), TaskError> {
        let payload = Payload::json(value)?;
        self.backend.set_custom_state(self.execution_id, key, &payload).await.map_err(backend_err)
    }

    /// True once the worker has lost its lease (or is shutting down); the
    /// result of this attempt will be discarded, so long-running bodies
    /// should bail out.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Completes when cancellation is requested; for use with `tokio::select!`.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    pub fn trace_info(&self, message: impl Into<String>) {
        tracing::info!(
            target: "senpuki::activity",
            execution_id = %self.execution_id,
            task_id = %self.task_id,
            step_name = %self.step_name,
            attempt = %self.attempt,
            worker_id = %self.worker_id,
            "{}",
            message.into()
        );
    }

    pub fn trace_warn(&self, message: impl Into<String>) {
        tracing::warn!(
            target: "senpuki::activity",
            execution_id = %self.execution_id,
            task_id = %self.task_id,
            step_name = %self.step_name,
            attempt = %self.attempt,
            worker_id = %self.worker_id,
            "{}",
            message.into()
        );
    }

    pub fn trace_error(&self, message: impl Into<String>) {
        tracing::error!(
            target: "senpuki::activity",
            execution_id = %self.execution_id,
            task_id = %self.task_id,
            step_name = %self.step_name,
            attempt = %self.attempt,
            worker_id = %self.worker_id,
            "{}",
            message.into()
        );
    }
}

// ============================================================================
// Orchestration turn state
// ============================================================================

/// Mutable per-turn state shared between the context, its durable futures,
/// and the driver.
pub(crate) struct TurnState {
    /// Next step index; steps are numbered in call order per re-entry.
    pub next_index: u32,
    /// Progress map: loaded records plus the steps registered this turn.
    pub progress: BTreeMap<u32, StepRecord>,
    /// Child task rows registered this turn, created atomically at park.
    pub new_children: Vec<Task>,
    /// Set when a body poll registers a new step; cleared by the driver.
    pub registered: bool,
}

impl TurnState {
    pub(crate) fn new(progress: Vec<StepRecord>) -> TurnState {
        let progress = progress.into_iter().map(|r| (r.index, r)).collect();
        TurnState { next_index: 0, progress, new_children: Vec::new(), registered: false }
    }

    /// Pending steps in index order.
    pub(crate) fn pending(&self) -> impl Iterator<Item = &StepRecord> {
        self.progress.values().filter(|r| r.status == StepStatus::Pending)
    }
}

/// Options for one durable call, layered over the callee's registration.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Shift the child's `scheduled_for` into the future.
    pub delay: Option<Duration>,
    pub queue: Option<String>,
    pub priority: Option<i32>,
    pub retry: Option<RetryPolicy>,
}

/// Context bound to a running orchestrator task.
#[derive(Clone)]
pub struct OrchestrationContext {
    execution_id: Uuid,
    task_id: Uuid,
    step_name: String,
    attempt: u32,
    registry: Arc<FunctionRegistry>,
    codec: Codec,
    pub(crate) inner: Arc<Mutex<TurnState>>,
}

impl OrchestrationContext {
    pub(crate) fn new(
        execution_id: Uuid,
        task_id: Uuid,
        step_name: String,
        attempt: u32,
        registry: Arc<FunctionRegistry>,
        codec: Codec,
        progress: Vec<StepRecord>,
    ) -> Self {
        Self {
            execution_id,
            task_id,
            step_name,
            attempt,
            registry,
            codec,
            inner: Arc::new(Mutex::new(TurnState::new(progress))),
        }
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Durable call to another registered function.
    pub fn call<A: Serialize, T: DeserializeOwned>(&self, step_name: &str, args: &A) -> DurableCall<T> {
        self.call_opts(step_name, args, CallOptions::default())
    }

    /// Durable call with per-call overrides.
    pub fn call_opts<A: Serialize, T: DeserializeOwned>(
        &self,
        step_name: &str,
        args: &A,
        opts: CallOptions,
    ) -> DurableCall<T> {
        let mut st = self.inner.lock().expect("turn state mutex poisoned");
        let index = st.next_index;
        st.next_index += 1;

        if let Some(record) = st.progress.get(&index) {
            match &record.kind {
                StepKind::Call { step_name: recorded, .. } if recorded == step_name => {
                    return DurableCall::step(index, self.inner.clone());
                }
                other => {
                    return DurableCall::failed(nondeterminism(index, &format!("call {step_name}"), other));
                }
            }
        }

        let args = match Payload::encode(self.codec, args) {
            Ok(args) => args,
            Err(e) => return DurableCall::failed(e.into()),
        };
        let Some(func) = self.registry.resolve(step_name) else {
            return DurableCall::failed(TaskError::Terminal(format!("function not registered: {step_name}")));
        };

        let overrides = TaskOverrides {
            queue: opts.queue,
            priority: opts.priority,
            delay: opts.delay,
            retry: opts.retry,
            ..Default::default()
        };
        let child = func.build_task(self.execution_id, Some(self.task_id), args, &overrides);
        let record = StepRecord {
            index,
            kind: StepKind::Call { step_name: step_name.to_string(), child_task_id: child.id },
            status: StepStatus::Pending,
            result: None,
            error: None,
        };
        st.progress.insert(index, record);
        st.new_children.push(child);
        st.registered = true;
        DurableCall::step(index, self.inner.clone())
    }

    /// Durable delay. Unlike `tokio::time::sleep`, the wake time is
    /// persisted and survives restarts.
    pub fn durable_sleep(&self, duration: Duration) -> DurableSleep {
        let mut st = self.inner.lock().expect("turn state mutex poisoned");
        let index = st.next_index;
        st.next_index += 1;

        if let Some(record) = st.progress.get(&index) {
            match &record.kind {
                StepKind::Sleep { .. } => return DurableSleep::step(index, self.inner.clone()),
                other => return DurableSleep::failed(nondeterminism(index, "sleep", other)),
            }
        }

        let record = StepRecord {
            index,
            kind: StepKind::Sleep { wake_at: now_ms() + duration.as_millis() as i64 },
            status: StepStatus::Pending,
            result: None,
            error: None,
        };
        st.progress.insert(index, record);
        st.registered = true;
        DurableSleep::step(index, self.inner.clone())
    }

    /// Wait for the next payload of the named signal, FIFO per
    /// (execution, name). With a timeout the step fails once the deadline
    /// passes without a payload.
    pub fn wait_for_signal<T: DeserializeOwned>(&self, name: &str, timeout: Option<Duration>) -> DurableSignal<T> {
        let mut st = self.inner.lock().expect("turn state mutex poisoned");
        let index = st.next_index;
        st.next_index += 1;

        if let Some(record) = st.progress.get(&index) {
            match &record.kind {
                StepKind::Signal { name: recorded, .. } if recorded == name => {
                    return DurableSignal::step(index, self.inner.clone());
                }
                other => return DurableSignal::failed(nondeterminism(index, &format!("signal {name}"), other)),
            }
        }

        let record = StepRecord {
            index,
            kind: StepKind::Signal {
                name: name.to_string(),
                deadline: timeout.map(|t| now_ms() + t.as_millis() as i64),
            },
            status: StepStatus::Pending,
            result: None,
            error: None,
        };
        st.progress.insert(index, record);
        st.registered = true;
        DurableSignal::step(index, self.inner.clone())
    }

    /// Durable counter add. Recorded as a step so replay does not re-apply
    /// it; this is the replay-safe accumulator orchestrator bodies should
    /// use instead of mutable locals.
    pub fn add_counter(&self, name: &str, delta: i64) -> DurableUnit {
        let mut st = self.inner.lock().expect("turn state mutex poisoned");
        let index = st.next_index;
        st.next_index += 1;

        if let Some(record) = st.progress.get(&index) {
            match &record.kind {
                StepKind::Counter { .. } => return DurableUnit::step(index, self.inner.clone()),
                other => return DurableUnit::failed(nondeterminism(index, &format!("counter {name}"), other)),
            }
        }

        let record = StepRecord {
            index,
            kind: StepKind::Counter { name: name.to_string(), delta },
            status: StepStatus::Pending,
            result: None,
            error: None,
        };
        st.progress.insert(index, record);
        st.registered = true;
        DurableUnit::step(index, self.inner.clone())
    }

    /// Durable custom-state set; same replay behavior as [`add_counter`](Self::add_counter).
    pub fn set_state<T: Serialize>(&self, key: &str, value: &T) -> DurableUnit {
        let mut st = self.inner.lock().expect("turn state mutex poisoned");
        let index = st.next_index;
        st.next_index += 1;

        if let Some(record) = st.progress.get(&index) {
            match &record.kind {
                StepKind::CustomState { .. } => return DurableUnit::step(index, self.inner.clone()),
                other => return DurableUnit::failed(nondeterminism(index, &format!("state {key}"), other)),
            }
        }

        let value = match Payload::json(value) {
            Ok(v) => v,
            Err(e) => return DurableUnit::failed(e.into()),
        };
        let record = StepRecord {
            index,
            kind: StepKind::CustomState { key: key.to_string() },
            status: StepStatus::Pending,
            result: Some(value),
            error: None,
        };
        st.progress.insert(index, record);
        st.registered = true;
        DurableUnit::step(index, self.inner.clone())
    }

    /// Fan out `step_name` over `items` with at most `limit` children in
    /// flight; results come back in input order.
    pub async fn map_bounded<A: Serialize, T: DeserializeOwned>(
        &self,
        step_name: &str,
        items: &[A],
        limit: usize,
    ) -> Result<Vec<T>, TaskError> {
        let mut out = Vec::with_capacity(items.len());
        for chunk in items.chunks(limit.max(1)) {
            let futures: Vec<DurableCall<T>> = chunk.iter().map(|item| self.call(step_name, item)).collect();
            for result in futures::future::join_all(futures).await {
                out.push(result?);
            }
        }
        Ok(out)
    }
}

fn nondeterminism(index: u32, expected: &str, recorded: &StepKind) -> TaskError {
    TaskError::Terminal(format!(
        "non-deterministic orchestrator body: step {index} expected {expected}, progress log has {recorded:?}"
    ))
}

// ============================================================================
// Durable futures
// ============================================================================

enum StepHandle {
    Step { index: u32, inner: Arc<Mutex<TurnState>> },
    Failed(Option<TaskError>),
}

impl StepHandle {
    fn poll_record(&mut self, cx: &mut Context<'_>) -> Poll<Result<StepRecord, TaskError>> {
        match self {
            StepHandle::Failed(err) => {
                let err = err.take().unwrap_or_else(|| TaskError::Terminal("step already polled".into()));
                Poll::Ready(Err(err))
            }
            StepHandle::Step { index, inner } => {
                let st = inner.lock().expect("turn state mutex poisoned");
                if let Some(record) = st.progress.get(index) {
                    match record.status {
                        StepStatus::Pending => {}
                        StepStatus::Completed => return Poll::Ready(Ok(record.clone())),
                        StepStatus::Failed => {
                            return Poll::Ready(Err(TaskError::Terminal(
                                record.error.clone().unwrap_or_else(|| "durable step failed".into()),
                            )))
                        }
                    }
                }
                // Steps resolve between body polls, not via wakers.
                // Combinators (join_all's FuturesOrdered and friends) only
                // re-poll children whose waker fired, so a pending step
                // must always signal readiness for the driver's next
                // round.
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }
}

/// Future returned by [`OrchestrationContext::call`].
pub struct DurableCall<T> {
    handle: StepHandle,
    _marker: PhantomData<fn() -> T>,
}

impl<T> DurableCall<T> {
    fn step(index: u32, inner: Arc<Mutex<TurnState>>) -> Self {
        Self { handle: StepHandle::Step { index, inner }, _marker: PhantomData }
    }

    fn failed(err: TaskError) -> Self {
        Self { handle: StepHandle::Failed(Some(err)), _marker: PhantomData }
    }
}

impl<T: DeserializeOwned> Future for DurableCall<T> {
    type Output = Result<T, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.handle.poll_record(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Ready(Ok(record)) => {
                let payload = record
                    .result
                    .ok_or_else(|| TaskError::Terminal("completed call step has no result".into()));
                Poll::Ready(payload.and_then(|p| p.decode::<T>().map_err(Into::into)))
            }
        }
    }
}

/// Future returned by [`OrchestrationContext::durable_sleep`].
pub struct DurableSleep {
    handle: StepHandle,
}

impl DurableSleep {
    fn step(index: u32, inner: Arc<Mutex<TurnState>>) -> Self {
        Self { handle: StepHandle::Step { index, inner } }
    }

    fn failed(err: TaskError) -> Self {
        Self { handle: StepHandle::Failed(Some(err)) }
    }
}

impl Future for DurableSleep {
    type Output = Result<(), TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.handle.poll_record(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Ready(Ok(_)) => Poll::Ready(Ok(())),
        }
    }
}

/// Future returned by [`OrchestrationContext::wait_for_signal`].
pub struct DurableSignal<T> {
    handle: StepHandle,
    _marker: PhantomData<fn() -> T>,
}

impl<T> DurableSignal<T> {
    fn step(index: u32, inner: Arc<Mutex<TurnState>>) -> Self {
        Self { handle: StepHandle::Step { index, inner }, _marker: PhantomData }
    }

    fn failed(err: TaskError) -> Self {
        Self { handle: StepHandle::Failed(Some(err)), _marker: PhantomData }
    }
}

impl<T: DeserializeOwned> Future for DurableSignal<T> {
    type Output = Result<T, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.handle.poll_record(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Ready(Ok(record)) => {
                let payload = record
                    .result
                    .ok_or_else(|| TaskError::Terminal("completed signal step has no payload".into()));
                Poll::Ready(payload.and_then(|p| p.decode::<T>().map_err(Into::into)))
            }
        }
    }
}

/// Future returned by the durable counter/custom-state operations.
pub struct DurableUnit {
    handle: StepHandle,
}

impl DurableUnit {
    fn step(index: u32, inner: Arc<Mutex<TurnState>>) -> Self {
        Self { handle: StepHandle::Step { index, inner } }
    }

    fn failed(err: TaskError) -> Self {
        Self { handle: StepHandle::Failed(Some(err)) }
    }
}

impl Future for DurableUnit {
    type Output = Result<(), TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.handle.poll_record(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Ready(Ok(_)) => Poll::Ready(Ok(())),
        }
    }
}
