//! # Senpuki: durable-function orchestration in Rust
//!
//! Senpuki lets application code express workflows as ordinary async
//! functions while the engine guarantees that each step survives process
//! crashes, runs at-most-once on success, retries on failure, and resumes
//! after restart. It sits between a task queue and a workflow engine: there
//! is no DAG declaration and no at-least-once firehose, just durable
//! functions, a persistent task state machine, and workers that claim tasks
//! under renewable leases.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use senpuki::backend::sqlite::SqliteBackend;
//! use senpuki::backend::Backend;
//! use senpuki::registry::{DurableOptions, FunctionRegistry};
//! use senpuki::Client;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // 1. Open a backend and create the schema.
//! let backend = Arc::new(SqliteBackend::connect("sqlite://senpuki.db").await?);
//! backend.init_db().await?;
//!
//! // 2. Register durable functions under stable names.
//! let registry = FunctionRegistry::builder()
//!     .register_activity_typed("billing::charge", DurableOptions::default(), |_ctx, amount: u64| async move {
//!         Ok(format!("charged {amount}"))
//!     })
//!     .register_orchestrator_typed("billing::flow", DurableOptions::default(), |ctx, amount: u64| async move {
//!         let receipt: String = ctx.call("billing::charge", &amount).await?;
//!         Ok(receipt)
//!     })
//!     .build()?;
//!
//! // 3. Create the facade, dispatch, serve, and wait.
//! let client = Client::new(backend, Arc::new(registry));
//! let lifecycle = client.create_worker_lifecycle("worker-1");
//! let serve = tokio::spawn({
//!     let client = client.clone();
//!     let lifecycle = lifecycle.clone();
//!     async move { client.serve(lifecycle, Default::default()).await }
//! });
//!
//! let exec_id = client.dispatch("billing::flow", &42u64, Default::default()).await?;
//! let result: String = client.wait_for_typed(exec_id, Some(Duration::from_secs(30))).await?;
//! assert_eq!(result, "charged 42");
//!
//! lifecycle.request_drain();
//! serve.await??;
//! # Ok(())
//! # }
//! ```
//!
//! ## Key concepts
//!
//! - **Activity**: a leaf durable function. Runs to completion or failure on
//!   a worker; its result is persisted before the task completes.
//! - **Orchestrator**: a durable function that coordinates child durable
//!   calls, durable sleeps, and signal waits. Its body is re-entered after
//!   every suspension and replayed against the recorded progress log, so the
//!   body must produce the same sequence of durable steps given the same
//!   recorded outcomes.
//! - **Task**: the scheduler's unit of work. Workers claim tasks under a
//!   time-bounded lease renewed by heartbeat; a lost lease aborts the runner
//!   without writing a result.
//! - **Dead letter**: a task whose retries are exhausted (or whose failure
//!   is terminal) is snapshotted intact for inspection and replay.
//! - **Signal**: an external event delivered by name to an execution and
//!   consumed in FIFO order.
//!
//! ## Orchestrators vs. side effects
//!
//! An orchestrator body is re-executed to reach its suspension point, so any
//! side effect inside it that is not a durable call is at-least-once per
//! replay. Put side effects in activities; use counters and custom state on
//! the execution context for durable accumulators; use
//! [`OrchestrationContext::durable_sleep`](context::OrchestrationContext::durable_sleep)
//! instead of `tokio::time::sleep`, which is not durable inside a body.

pub mod backend;
pub mod client;
pub mod codec;
pub mod context;
pub(crate) mod driver;
pub mod notify;
pub mod registry;
pub mod worker;

pub use client::{Client, ClientError, DispatchOptions, WaitError};
pub use codec::{Codec, CodecError, Payload};
pub use context::{ActivityContext, OrchestrationContext};
pub use registry::{DurableOptions, FunctionRegistry};
pub use worker::{ServeOptions, WorkerLifecycle, WorkerOptions};

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Queue used when a dispatch or registration does not name one.
pub const DEFAULT_QUEUE: &str = "default";

/// `scheduled_for` value for a parked orchestrator with no wake deadline.
/// Far enough out that no claim ever sees it as eligible.
pub(crate) const FAR_FUTURE_MS: i64 = 253_370_764_800_000;

/// Completed progress entries beyond this count spill to the side table so
/// hot task rows stay small.
pub(crate) const PROGRESS_HOT_CAP: usize = 64;

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// ============================================================================
// Execution
// ============================================================================

/// Lifecycle state of one workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl ExecutionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionState::Pending => "pending",
            ExecutionState::Running => "running",
            ExecutionState::Completed => "completed",
            ExecutionState::Failed => "failed",
            ExecutionState::TimedOut => "timed_out",
            ExecutionState::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<ExecutionState> {
        match s {
            "pending" => Some(ExecutionState::Pending),
            "running" => Some(ExecutionState::Running),
            "completed" => Some(ExecutionState::Completed),
            "failed" => Some(ExecutionState::Failed),
            "timed_out" => Some(ExecutionState::TimedOut),
            "cancelled" => Some(ExecutionState::Cancelled),
            _ => None,
        }
    }

    /// Terminal states are write-once.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionState::Completed
                | ExecutionState::Failed
                | ExecutionState::TimedOut
                | ExecutionState::Cancelled
        )
    }

    pub const ALL: [ExecutionState; 6] = [
        ExecutionState::Pending,
        ExecutionState::Running,
        ExecutionState::Completed,
        ExecutionState::Failed,
        ExecutionState::TimedOut,
        ExecutionState::Cancelled,
    ];
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical workflow instance. Owns its tasks, counters, custom state,
/// and signals; deleting the execution cascades.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    /// Root step name.
    pub step_name: String,
    pub args: Payload,
    pub state: ExecutionState,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
    pub result: Option<Payload>,
    pub error: Option<String>,
}

impl Execution {
    pub fn new(step_name: impl Into<String>, args: Payload) -> Execution {
        let now = now_ms();
        Execution {
            id: Uuid::new_v4(),
            step_name: step_name.into(),
            args,
            state: ExecutionState::Pending,
            created_at: now,
            updated_at: now,
            completed_at: None,
            result: None,
            error: None,
        }
    }
}

// ============================================================================
// Task
// ============================================================================

/// Whether a task runs an activity body or drives an orchestrator body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Orchestrator,
    Activity,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Orchestrator => "orchestrator",
            TaskKind::Activity => "activity",
        }
    }

    pub fn parse(s: &str) -> Option<TaskKind> {
        match s {
            "orchestrator" => Some(TaskKind::Orchestrator),
            "activity" => Some(TaskKind::Activity),
            _ => None,
        }
    }
}

/// Task lifecycle state.
///
/// A task is claimable iff `state = Pending`, `scheduled_for <= now`, and
/// its lease is absent or expired. `Dead` means the full snapshot lives in
/// the dead-letter table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Dead,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<TaskState> {
        match s {
            "pending" => Some(TaskState::Pending),
            "running" => Some(TaskState::Running),
            "completed" => Some(TaskState::Completed),
            "failed" => Some(TaskState::Failed),
            "dead" => Some(TaskState::Dead),
            _ => None,
        }
    }

    pub fn is_settled(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed | TaskState::Dead)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of worker-consumed work: a root orchestrator, a child
/// orchestrator, or an activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub parent_task_id: Option<Uuid>,
    pub kind: TaskKind,
    pub step_name: String,
    pub args: Payload,
    pub state: TaskState,
    /// Increments only on a retry transition.
    pub attempt: u32,
    pub max_attempts: u32,
    /// Earliest eligible claim time (ms since epoch).
    pub scheduled_for: i64,
    /// Absolute deadline after which the task fails with timeout.
    pub expires_at: Option<i64>,
    pub lease_expires_at: Option<i64>,
    pub worker_id: Option<String>,
    pub queue: String,
    /// Higher first.
    pub priority: i32,
    pub tags: Vec<String>,
    pub idempotency_key: Option<String>,
    pub cache_key: Option<String>,
    pub concurrency_group: Option<String>,
    pub result: Option<Payload>,
    pub error: Option<String>,
    /// Hot portion of the orchestrator progress log (see [`StepRecord`]).
    pub progress: Vec<StepRecord>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Task {
    pub fn new(execution_id: Uuid, kind: TaskKind, step_name: impl Into<String>, args: Payload) -> Task {
        let now = now_ms();
        Task {
            id: Uuid::new_v4(),
            execution_id,
            parent_task_id: None,
            kind,
            step_name: step_name.into(),
            args,
            state: TaskState::Pending,
            attempt: 0,
            max_attempts: RetryPolicy::default().max_attempts,
            scheduled_for: now,
            expires_at: None,
            lease_expires_at: None,
            worker_id: None,
            queue: DEFAULT_QUEUE.to_string(),
            priority: 0,
            tags: Vec::new(),
            idempotency_key: None,
            cache_key: None,
            concurrency_group: None,
            result: None,
            error: None,
            progress: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

// ============================================================================
// Progress log
// ============================================================================

/// What a durable step does. The variant is fixed when the step is first
/// registered; a reclaimed orchestrator replays against it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Durable call to another registered function. The child task row is
    /// created atomically with the park that records this entry.
    Call { step_name: String, child_task_id: Uuid },
    /// Durable sleep until the absolute wake time.
    Sleep { wake_at: i64 },
    /// Signal wait, with an optional absolute deadline.
    Signal { name: String, deadline: Option<i64> },
    /// Durable counter add, applied once and replayed from the log.
    Counter { name: String, delta: i64 },
    /// Durable custom-state set; the value travels in the record's result
    /// field.
    CustomState { key: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Completed,
    Failed,
}

/// One entry in an orchestrator task's progress log, keyed by the step's
/// deterministic index in call order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: u32,
    #[serde(flatten)]
    pub kind: StepKind,
    pub status: StepStatus,
    /// Call result or signal payload once the step settles.
    pub result: Option<Payload>,
    pub error: Option<String>,
}

// ============================================================================
// Dead letters
// ============================================================================

/// Persisted full snapshot of a task that exhausted retries or failed
/// terminally. The original task payload is carried verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub task_id: Uuid,
    pub task: Task,
    pub error: String,
    pub created_at: i64,
}

// ============================================================================
// Errors raised by user code
// ============================================================================

/// Error returned by a durable function body. The variant decides the retry
/// pipeline's routing: `Retryable` goes back to pending with a backoff delay
/// until attempts are exhausted; `Terminal` dead-letters immediately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskError {
    Retryable(String),
    Terminal(String),
}

impl TaskError {
    pub fn retryable(message: impl Into<String>) -> TaskError {
        TaskError::Retryable(message.into())
    }

    pub fn terminal(message: impl Into<String>) -> TaskError {
        TaskError::Terminal(message.into())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskError::Terminal(_))
    }

    pub fn message(&self) -> &str {
        match self {
            TaskError::Retryable(m) | TaskError::Terminal(m) => m,
        }
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskError::Retryable(m) => write!(f, "retryable: {m}"),
            TaskError::Terminal(m) => write!(f, "terminal: {m}"),
        }
    }
}

impl std::error::Error for TaskError {}

impl From<CodecError> for TaskError {
    fn from(e: CodecError) -> TaskError {
        // The same bytes will fail the same way on every attempt.
        TaskError::Terminal(e.to_string())
    }
}

// ============================================================================
// Retry policy
// ============================================================================

/// Immutable retry configuration.
///
/// Next delay = clamp(base_delay × multiplier^attempt × (1 ± jitter·rand),
/// 0, max_delay). A [`TaskError::Terminal`] or exceeding `max_attempts`
/// routes the task to the dead-letter table.
///
/// # Example
///
/// ```rust
/// use senpuki::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::new(5)
///     .with_base_delay(Duration::from_millis(250))
///     .with_max_delay(Duration::from_secs(30))
///     .with_jitter(0.2);
/// assert!(policy.delay_for_attempt(1) <= Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the initial one. Must be >= 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Jitter fraction in [0, 1]; 0 disables jitter.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    /// # Panics
    /// Panics if `max_attempts` is 0.
    pub fn new(max_attempts: u32) -> RetryPolicy {
        assert!(max_attempts >= 1, "max_attempts must be at least 1");
        RetryPolicy { max_attempts, ..Default::default() }
    }

    pub fn with_base_delay(mut self, base: Duration) -> RetryPolicy {
        self.base_delay = base;
        self
    }

    pub fn with_max_delay(mut self, max: Duration) -> RetryPolicy {
        self.max_delay = max;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> RetryPolicy {
        self.multiplier = multiplier;
        self
    }

    /// # Panics
    /// Panics if `jitter` is outside [0, 1].
    pub fn with_jitter(mut self, jitter: f64) -> RetryPolicy {
        assert!((0.0..=1.0).contains(&jitter), "jitter must be in [0, 1]");
        self.jitter = jitter;
        self
    }

    /// Delay before the next attempt, given the attempt count that just
    /// failed (0-indexed: attempt 0 failing yields the first backoff).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(63) as i32);
        let mut delay_ms = self.base_delay.as_millis() as f64 * factor;
        if self.jitter > 0.0 {
            use rand::Rng;
            let spread: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
            delay_ms *= 1.0 + self.jitter * spread;
        }
        let max = self.max_delay.as_millis() as f64;
        Duration::from_millis(delay_ms.clamp(0.0, max) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_grows_and_caps() {
        let p = RetryPolicy::new(10)
            .with_base_delay(Duration::from_millis(100))
            .with_multiplier(2.0)
            .with_max_delay(Duration::from_secs(1));
        assert_eq!(p.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(p.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(p.delay_for_attempt(2), Duration::from_millis(400));
        // 100ms * 2^5 = 3.2s, clamped.
        assert_eq!(p.delay_for_attempt(5), Duration::from_secs(1));
    }

    #[test]
    fn jittered_delay_stays_within_envelope() {
        let p = RetryPolicy::new(5)
            .with_base_delay(Duration::from_millis(1000))
            .with_multiplier(1.0)
            .with_jitter(0.5)
            .with_max_delay(Duration::from_secs(10));
        for _ in 0..100 {
            let d = p.delay_for_attempt(0);
            assert!(d >= Duration::from_millis(500), "below jitter floor: {d:?}");
            assert!(d <= Duration::from_millis(1500), "above jitter ceiling: {d:?}");
        }
    }

    #[test]
    fn terminal_errors_classify() {
        assert!(TaskError::terminal("boom").is_terminal());
        assert!(!TaskError::retryable("flaky").is_terminal());
    }

    #[test]
    fn execution_state_round_trips() {
        for s in ExecutionState::ALL {
            assert_eq!(ExecutionState::parse(s.as_str()), Some(s));
        }
        assert!(ExecutionState::Cancelled.is_terminal());
        assert!(!ExecutionState::Running.is_terminal());
    }

    #[test]
    fn step_record_serde_round_trips() {
        let rec = StepRecord {
            index: 3,
            kind: StepKind::Signal { name: "approve".into(), deadline: Some(17) },
            status: StepStatus::Pending,
            result: None,
            error: None,
        };
        let json = serde_json::to_string(&rec).unwrap();
        let back: StepRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rec);
    }
}
