//! Notification bus.
//!
//! Optional publish/subscribe fan-out of task- and execution-state
//! transitions. Two channels exist per unit of work: `task:{id}` and
//! `execution:{id}`; messages are JSON objects with `task_id` or
//! `execution_id` plus `state`. Notifications are best-effort: correctness
//! never depends on them, because every waiter falls back to adaptive
//! polling of the backend ([`PollBackoff`]).

pub mod redis;

use crate::{ExecutionState, TaskState};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

pub fn task_channel(task_id: Uuid) -> String {
    format!("task:{task_id}")
}

pub fn execution_channel(execution_id: Uuid) -> String {
    format!("execution:{execution_id}")
}

/// One state-transition message. Exactly one of `task_id` / `execution_id`
/// is set, matching the channel the notice is published on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateNotice {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<Uuid>,
    pub state: String,
}

impl StateNotice {
    pub fn for_task(task_id: Uuid, state: TaskState) -> StateNotice {
        StateNotice { task_id: Some(task_id), execution_id: None, state: state.as_str().to_string() }
    }

    pub fn for_execution(execution_id: Uuid, state: ExecutionState) -> StateNotice {
        StateNotice { task_id: None, execution_id: Some(execution_id), state: state.as_str().to_string() }
    }

    /// Subscribers unsubscribe once a terminal state arrives.
    pub fn is_terminal(&self) -> bool {
        if self.task_id.is_some() {
            TaskState::parse(&self.state).map(TaskState::is_settled).unwrap_or(false)
        } else {
            ExecutionState::parse(&self.state).map(ExecutionState::is_terminal).unwrap_or(false)
        }
    }
}

/// Bus failures are logged and otherwise ignored by publishers.
#[derive(Debug, Clone)]
pub struct NotifyError {
    pub message: String,
}

impl NotifyError {
    pub fn new(message: impl Into<String>) -> NotifyError {
        NotifyError { message: message.into() }
    }
}

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "notification bus error: {}", self.message)
    }
}

impl std::error::Error for NotifyError {}

#[async_trait]
pub trait NotificationBus: Send + Sync {
    async fn publish(&self, channel: &str, notice: &StateNotice) -> Result<(), NotifyError>;

    /// Subscribe to a channel. The stream ends after a terminal notice or
    /// when the receiver is dropped.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<StateNotice>, NotifyError>;
}

/// Select a bus from a URI: `redis://[user:pass@]host[:port][/db]` or
/// `rediss://…`.
pub async fn bus_from_url(url: &str) -> Result<Arc<dyn NotificationBus>, NotifyError> {
    if url.starts_with("redis://") || url.starts_with("rediss://") {
        Ok(Arc::new(redis::RedisBus::connect(url).await?))
    } else {
        Err(NotifyError::new(format!("unsupported bus uri: {url}")))
    }
}

/// Adaptive polling fallback used when no bus is configured: start at the
/// minimum interval, multiply on every empty poll, cap at the maximum, and
/// reset to the minimum on any observed update.
#[derive(Debug, Clone)]
pub struct PollBackoff {
    current: Duration,
    min: Duration,
    max: Duration,
    factor: f64,
}

impl Default for PollBackoff {
    fn default() -> Self {
        PollBackoff::new(Duration::from_millis(100), Duration::from_secs(5), 2.0)
    }
}

impl PollBackoff {
    pub fn new(min: Duration, max: Duration, factor: f64) -> PollBackoff {
        PollBackoff { current: min, min, max, factor }
    }

    /// Interval to sleep before the next poll; backs off for the one after.
    pub fn next_interval(&mut self) -> Duration {
        let interval = self.current;
        let scaled = self.current.mul_f64(self.factor);
        self.current = scaled.min(self.max);
        interval
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_backoff_doubles_and_caps() {
        let mut b = PollBackoff::default();
        assert_eq!(b.next_interval(), Duration::from_millis(100));
        assert_eq!(b.next_interval(), Duration::from_millis(200));
        assert_eq!(b.next_interval(), Duration::from_millis(400));
        for _ in 0..10 {
            b.next_interval();
        }
        assert_eq!(b.next_interval(), Duration::from_secs(5));
        b.reset();
        assert_eq!(b.next_interval(), Duration::from_millis(100));
    }

    #[test]
    fn notice_terminality() {
        let n = StateNotice::for_task(Uuid::new_v4(), TaskState::Completed);
        assert!(n.is_terminal());
        let n = StateNotice::for_task(Uuid::new_v4(), TaskState::Pending);
        assert!(!n.is_terminal());
        let n = StateNotice::for_execution(Uuid::new_v4(), ExecutionState::TimedOut);
        assert!(n.is_terminal());
    }

    #[test]
    fn notice_wire_shape() {
        let id = Uuid::new_v4();
        let json = serde_json::to_value(StateNotice::for_execution(id, ExecutionState::Completed)).unwrap();
        assert_eq!(json["execution_id"], serde_json::json!(id));
        assert_eq!(json["state"], "completed");
        assert!(json.get("task_id").is_none());
    }
}
