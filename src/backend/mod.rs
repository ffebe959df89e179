//! Storage backends.
//!
//! A [`Backend`] is the only coordination point between workers: every method
//! is a failure-domain boundary and returns a [`BackendError`] carrying a
//! retryability classification. Two implementations ship with the crate: an
//! embedded single-file store ([`sqlite::SqliteBackend`]) and a networked SQL
//! store ([`postgres::PostgresBackend`]).
//!
//! The contract's transactional obligations (atomic execution+root-task
//! create, single-claimant task claims, atomic suspend commits, dead-letter
//! snapshots taken inside the failing transition) are what the rest of the
//! engine's correctness rests on; notifications are only ever an
//! acceleration on top of this.

pub mod postgres;
pub mod sqlite;

use crate::codec::Payload;
use crate::{DeadLetter, Execution, ExecutionState, StepRecord, Task};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Backend failure with retry classification.
///
/// **Retryable**: busy/locked databases, connection timeouts, network
/// failures. Workers back off and retry the claim loop; dispatch surfaces
/// the error to the caller.
///
/// **Permanent**: missing rows, ownership conflicts, corrupt payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendError {
    /// Operation that failed (e.g. "claim_next_task").
    pub operation: String,
    pub message: String,
    pub retryable: bool,
}

impl BackendError {
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self { operation: operation.into(), message: message.into(), retryable: true }
    }

    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self { operation: operation.into(), message: message.into(), retryable: false }
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Classify a sqlx error: pool/io/protocol problems are transient,
    /// everything else is permanent.
    pub(crate) fn from_sqlx(operation: &str, e: sqlx::Error) -> Self {
        let retryable = match &e {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::Protocol(_) => true,
            sqlx::Error::Database(db) => {
                let msg = db.message().to_ascii_lowercase();
                msg.contains("locked") || msg.contains("busy") || msg.contains("deadlock")
            }
            _ => false,
        };
        Self { operation: operation.to_string(), message: e.to_string(), retryable }
    }
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.retryable { "retryable" } else { "permanent" };
        write!(f, "backend error in {} ({kind}): {}", self.operation, self.message)
    }
}

impl std::error::Error for BackendError {}

/// Outcome of a lease renewal attempt. `Lost` means the worker must stop
/// executing the task and must not write a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Renewed,
    Lost,
}

/// How a failing task leaves its transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Back to pending at the given time; attempt increments.
    Retry { at: i64 },
    /// Snapshot into the dead-letter table; for a root task the execution
    /// also moves to the given terminal state (Failed or TimedOut).
    Dead { execution_state: ExecutionState },
    /// The execution was cancelled before user code ran: mark the task
    /// failed without a dead-letter snapshot.
    Cancelled,
}

/// Full view of one execution: row plus counters and custom state.
#[derive(Debug, Clone)]
pub struct ExecutionView {
    pub execution: Execution,
    pub counters: HashMap<String, i64>,
    pub custom_state: HashMap<String, Payload>,
}

/// Transactional persistence of executions, tasks, dead letters, cache
/// entries, signals, counters, and custom state.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Create tables and indexes. Idempotent.
    async fn init_db(&self) -> Result<(), BackendError>;

    /// Atomic: both rows appear together or neither does.
    async fn create_execution_with_root_task(
        &self,
        execution: &Execution,
        task: &Task,
    ) -> Result<(), BackendError>;

    /// Atomically select, lock, and return the next claimable task.
    ///
    /// Candidate set: `state = pending AND scheduled_for <= now AND (lease
    /// absent OR expired) AND queue ∈ queues AND tags ⊇ tags`. Ordering:
    /// priority DESC, scheduled_for ASC, created_at ASC. A candidate whose
    /// `concurrency_group` has a limit in `limits` is skipped while the
    /// group's running count is at the limit. Candidates past their
    /// `expires_at` are dead-lettered with a timeout error instead of being
    /// handed out.
    async fn claim_next_task(
        &self,
        worker_id: &str,
        queues: &[String],
        tags: &[String],
        lease: Duration,
        limits: &HashMap<String, u32>,
    ) -> Result<Option<Task>, BackendError>;

    /// Extend the lease. Succeeds only while the row is still running and
    /// owned by `worker_id`.
    async fn renew_lease(
        &self,
        task_id: Uuid,
        worker_id: &str,
        extend: Duration,
    ) -> Result<LeaseState, BackendError>;

    /// Conditional on ownership. For a root task the execution completes in
    /// the same transaction; a parked parent is woken in the same
    /// transaction.
    async fn complete_task(&self, task_id: Uuid, worker_id: &str, result: &Payload) -> Result<(), BackendError>;

    /// Conditional on ownership. See [`FailureDisposition`] for routing;
    /// dead-letter snapshots and parent wakeups happen in the same
    /// transaction.
    async fn fail_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        error: &str,
        disposition: FailureDisposition,
    ) -> Result<(), BackendError>;

    /// Park an orchestrator: one atomic commit of the progress delta, the
    /// newly spawned child task rows, and the pending transition with the
    /// given wake time. Conditional on ownership.
    async fn suspend_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        progress: &[StepRecord],
        scheduled_for: i64,
        children: &[Task],
    ) -> Result<(), BackendError>;

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, BackendError>;

    /// Full progress log: archived entries merged ahead of the hot list.
    async fn load_progress(&self, task_id: Uuid) -> Result<Vec<StepRecord>, BackendError>;

    async fn list_tasks(&self, execution_id: Uuid) -> Result<Vec<Task>, BackendError>;

    /// Explicit manual reclaim/repair; overwrites scheduling and lease
    /// fields from the given row.
    async fn update_task(&self, task: &Task) -> Result<(), BackendError>;

    async fn count_executions(&self, state: Option<ExecutionState>) -> Result<u64, BackendError>;

    async fn list_executions(
        &self,
        state: Option<ExecutionState>,
        limit: u32,
    ) -> Result<Vec<Execution>, BackendError>;

    async fn count_dead_tasks(&self) -> Result<u64, BackendError>;

    async fn list_dead_letters(&self, limit: u32) -> Result<Vec<DeadLetter>, BackendError>;

    async fn get_dead_letter(&self, task_id: Uuid) -> Result<Option<DeadLetter>, BackendError>;

    async fn delete_dead_letter(&self, task_id: Uuid) -> Result<bool, BackendError>;

    /// Re-create a pending task from the stored snapshot: fresh id, attempt
    /// 0, cleared lease/result/error, optional queue override. A root-task
    /// replay also re-opens its execution. The snapshot row remains until
    /// explicitly deleted.
    async fn replay_dead_letter(&self, task_id: Uuid, queue: Option<&str>) -> Result<Task, BackendError>;

    /// Terminal states are write-once: transitions out of a terminal state
    /// are ignored.
    async fn set_execution_state(
        &self,
        execution_id: Uuid,
        state: ExecutionState,
        error: Option<&str>,
    ) -> Result<(), BackendError>;

    async fn set_execution_result(
        &self,
        execution_id: Uuid,
        state: ExecutionState,
        result: Option<&Payload>,
        error: Option<&str>,
    ) -> Result<(), BackendError>;

    async fn get_execution_state(&self, execution_id: Uuid) -> Result<Option<ExecutionView>, BackendError>;

    /// Atomic increment of a per-execution counter.
    async fn add_counter(&self, execution_id: Uuid, name: &str, delta: i64) -> Result<(), BackendError>;

    /// Atomic set of a per-execution custom-state value.
    async fn set_custom_state(&self, execution_id: Uuid, key: &str, value: &Payload) -> Result<(), BackendError>;

    /// Append to the signal queue and wake any parked orchestrator of the
    /// execution in the same transaction.
    async fn send_signal(&self, execution_id: Uuid, name: &str, payload: &Payload) -> Result<(), BackendError>;

    /// Pop the oldest pending payload atomically.
    async fn consume_signal(&self, execution_id: Uuid, name: &str) -> Result<Option<Payload>, BackendError>;

    /// Expired entries are treated as absent.
    async fn get_cache(&self, key: &str) -> Result<Option<Payload>, BackendError>;

    async fn put_cache(&self, key: &str, value: &Payload, ttl: Option<Duration>) -> Result<(), BackendError>;

    /// Cascading delete of terminal executions older than the window.
    /// Returns the number of executions removed.
    async fn cleanup_executions(&self, older_than: Duration) -> Result<u64, BackendError>;
}

/// Select a backend from a connection string: `sqlite://path` (embedded) or
/// `postgresql://…` (networked).
pub async fn backend_from_url(url: &str) -> Result<Arc<dyn Backend>, BackendError> {
    if url.starts_with("sqlite:") {
        Ok(Arc::new(sqlite::SqliteBackend::connect(url).await?))
    } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        Ok(Arc::new(postgres::PostgresBackend::connect(url).await?))
    } else {
        Err(BackendError::permanent(
            "backend_from_url",
            format!("unsupported connection string: {url}"),
        ))
    }
}
