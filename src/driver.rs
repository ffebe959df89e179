//! Orchestrator turn driver.
//!
//! One *turn* re-enters an orchestrator body against its recorded progress
//! and drives it as far as the recorded outcomes allow:
//!
//! 1. Resolve every pending step that can settle right now (children that
//!    reached a terminal state, sleeps whose wake time passed, signals with
//!    a queued payload or an expired deadline, unapplied counter/state
//!    micro-steps).
//! 2. Poll the body once. Resolved steps return synchronously (replay);
//!    the first unresolved step leaves the body pending.
//! 3. If the poll registered new steps or step 1 changed anything, go
//!    around again: a freshly registered signal wait may already have a
//!    queued payload, a zero-length sleep may already be due.
//! 4. Otherwise park: hand the accumulated progress, the new child rows,
//!    and the earliest wake time back to the worker for one atomic
//!    `suspend_task` commit.
//!
//! A body that goes pending with no pending durable step is awaiting
//! something the engine cannot persist; that is a contract violation and
//! fails the task terminally.

use crate::backend::{Backend, BackendError};
use crate::codec::{Codec, Payload};
use crate::context::OrchestrationContext;
use crate::registry::{FunctionRegistry, OrchestratorHandler};
use crate::{now_ms, StepKind, StepRecord, StepStatus, Task, TaskError, TaskState, FAR_FUTURE_MS};
use futures::poll;
use std::sync::Arc;
use std::task::Poll;
use tracing::debug;

pub(crate) enum TurnOutcome {
    Completed(Payload),
    Failed(TaskError),
    Suspended { progress: Vec<StepRecord>, scheduled_for: i64, children: Vec<Task> },
}

pub(crate) async fn run_orchestrator_turn(
    backend: &Arc<dyn Backend>,
    registry: &Arc<FunctionRegistry>,
    codec: Codec,
    task: &Task,
    handler: Arc<dyn OrchestratorHandler>,
) -> Result<TurnOutcome, BackendError> {
    let progress = backend.load_progress(task.id).await?;
    let ctx = OrchestrationContext::new(
        task.execution_id,
        task.id,
        task.step_name.clone(),
        task.attempt,
        registry.clone(),
        codec,
        progress,
    );

    let mut body = Box::pin(handler.invoke(ctx.clone(), task.args.clone()));

    loop {
        let resolved = resolve_pending(backend, &ctx).await?;

        match poll!(body.as_mut()) {
            Poll::Ready(Ok(result)) => return Ok(TurnOutcome::Completed(result)),
            Poll::Ready(Err(e)) => return Ok(TurnOutcome::Failed(e)),
            Poll::Pending => {}
        }

        let (registered, has_pending) = {
            let mut st = ctx.inner.lock().expect("turn state mutex poisoned");
            let registered = st.registered;
            st.registered = false;
            let has_pending = st.pending().next().is_some();
            (registered, has_pending)
        };

        if registered || resolved {
            continue;
        }

        if !has_pending {
            return Ok(TurnOutcome::Failed(TaskError::Terminal(
                "orchestrator body suspended on a non-durable await".into(),
            )));
        }

        let mut st = ctx.inner.lock().expect("turn state mutex poisoned");
        let scheduled_for = st.pending().map(wake_time).min().unwrap_or(FAR_FUTURE_MS);
        let progress: Vec<StepRecord> = st.progress.values().cloned().collect();
        let children = std::mem::take(&mut st.new_children);
        debug!(
            target: "senpuki::driver",
            task_id = %task.id,
            steps = progress.len(),
            children = children.len(),
            scheduled_for,
            "parking orchestrator"
        );
        return Ok(TurnOutcome::Suspended { progress, scheduled_for, children });
    }
}

/// When a pending step can wake the parked task on its own.
fn wake_time(record: &StepRecord) -> i64 {
    match &record.kind {
        // Child settle wakes the parent transactionally.
        StepKind::Call { .. } => FAR_FUTURE_MS,
        StepKind::Sleep { wake_at } => *wake_at,
        // Signal sends wake the execution; the deadline bounds the wait.
        StepKind::Signal { deadline, .. } => deadline.unwrap_or(FAR_FUTURE_MS),
        StepKind::Counter { .. } | StepKind::CustomState { .. } => FAR_FUTURE_MS,
    }
}

/// Settle every pending step that can settle now. Returns whether anything
/// changed.
async fn resolve_pending(backend: &Arc<dyn Backend>, ctx: &OrchestrationContext) -> Result<bool, BackendError> {
    let pending: Vec<StepRecord> = {
        let st = ctx.inner.lock().expect("turn state mutex poisoned");
        st.pending().cloned().collect()
    };
    if pending.is_empty() {
        return Ok(false);
    }

    let now = now_ms();
    let mut changed = false;
    for mut record in pending {
        match record.kind.clone() {
            StepKind::Call { child_task_id, step_name } => {
                let Some(child) = backend.get_task(child_task_id).await? else {
                    continue;
                };
                match child.state {
                    TaskState::Completed => {
                        record.status = StepStatus::Completed;
                        record.result = Some(child.result.unwrap_or_else(Payload::unit));
                    }
                    TaskState::Failed | TaskState::Dead => {
                        record.status = StepStatus::Failed;
                        record.error =
                            Some(child.error.unwrap_or_else(|| format!("durable call failed: {step_name}")));
                    }
                    TaskState::Pending | TaskState::Running => continue,
                }
            }
            StepKind::Sleep { wake_at } => {
                if wake_at > now {
                    continue;
                }
                record.status = StepStatus::Completed;
            }
            StepKind::Signal { name, deadline } => {
                if let Some(payload) = backend.consume_signal(ctx.execution_id(), &name).await? {
                    record.status = StepStatus::Completed;
                    record.result = Some(payload);
                } else if deadline.is_some_and(|d| d <= now) {
                    record.status = StepStatus::Failed;
                    record.error = Some(format!("signal wait timed out: {name}"));
                } else {
                    continue;
                }
            }
            StepKind::Counter { name, delta } => {
                backend.add_counter(ctx.execution_id(), &name, delta).await?;
                record.status = StepStatus::Completed;
            }
            StepKind::CustomState { key } => {
                let value = record.result.clone().unwrap_or_else(Payload::unit);
                backend.set_custom_state(ctx.execution_id(), &key, &value).await?;
                record.status = StepStatus::Completed;
            }
        }
        let mut st = ctx.inner.lock().expect("turn state mutex poisoned");
        st.progress.insert(record.index, record);
        changed = true;
    }
    Ok(changed)
}
