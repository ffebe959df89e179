//! Dead-letter pipeline: exhausted retries snapshot the full task, replay
//! re-creates a pending task on a chosen queue.

mod common;

use common::*;
use senpuki::worker::WorkerOptions;
use senpuki::{ExecutionState, TaskState};
use std::time::Duration;

#[tokio::test]
async fn exhausted_retries_snapshot_full_payload() {
    let (backend, _dir) = disk_backend().await;
    let client = client_for(backend.clone(), scenario_registry());
    let worker = spawn_worker(&client, fast_serve_options()).await;

    let options = senpuki::DispatchOptions {
        tags: vec!["billing".to_string()],
        idempotency_key: Some("charge-42".to_string()),
        ..Default::default()
    };
    let exec_id = client.dispatch("math::always_fail", &(), options).await.unwrap();
    let err = client.wait_for(exec_id, Some(Duration::from_secs(10))).await.unwrap_err();
    assert!(matches!(err, senpuki::WaitError::Terminal { state: ExecutionState::Failed, .. }));

    let letters = client.list_dead_letters(10).await.unwrap();
    assert_eq!(letters.len(), 1);
    let letter = &letters[0];
    assert_eq!(letter.task.step_name, "math::always_fail");
    assert_eq!(letter.task.attempt, 1, "attempt 0 and 1 both failed with max_attempts 2");
    assert_eq!(letter.task.queue, "default");
    assert_eq!(letter.task.tags, vec!["billing".to_string()]);
    assert_eq!(letter.task.idempotency_key.as_deref(), Some("charge-42"));
    assert!(letter.error.contains("I failed"));

    worker.stop().await;
}

#[tokio::test]
async fn replay_lands_on_requested_queue_and_runs_there() {
    let (backend, _dir) = disk_backend().await;
    let client = client_for(backend.clone(), scenario_registry());

    let worker = spawn_worker(&client, fast_serve_options()).await;
    let exec_id = client.dispatch("math::always_fail", &(), Default::default()).await.unwrap();
    let _ = client.wait_for(exec_id, Some(Duration::from_secs(10))).await.unwrap_err();
    worker.stop().await;

    let letter = client.list_dead_letters(1).await.unwrap().remove(0);
    let replayed = client.replay_dead_letter(letter.task_id, Some("retry")).await.unwrap();
    assert_ne!(replayed.id, letter.task_id);
    assert_eq!(replayed.state, TaskState::Pending);
    assert_eq!(replayed.attempt, 0);
    assert_eq!(replayed.queue, "retry");
    // The snapshot stays until explicitly deleted.
    assert!(client.get_dead_letter(letter.task_id).await.unwrap().is_some());

    // A worker serving only the retry queue picks the replay up.
    let mut options = fast_serve_options();
    options.worker = WorkerOptions {
        queues: vec!["retry".to_string()],
        ..options.worker
    };
    let retry_worker = spawn_worker(&client, options).await;

    let attempted = wait_until(Duration::from_secs(10), || {
        let backend = backend.clone();
        let task_id = replayed.id;
        async move {
            backend
                .get_task(task_id)
                .await
                .unwrap()
                .map(|t| t.state.is_settled())
                .unwrap_or(false)
        }
    })
    .await;
    assert!(attempted, "replayed task was never claimed from the retry queue");

    retry_worker.stop().await;

    assert!(client.delete_dead_letter(letter.task_id).await.unwrap());
    assert!(client.get_dead_letter(letter.task_id).await.unwrap().is_none());
}

#[tokio::test]
async fn unknown_step_name_dead_letters_without_retry() {
    use senpuki::registry::{DurableOptions, FunctionRegistry};

    let (backend, _dir) = disk_backend().await;
    // Dispatch against a registry that knows the name, run a worker whose
    // registry does not: a deploy skew.
    let full = client_for(backend.clone(), scenario_registry());
    let exec_id = full.dispatch("math::add", &(1i64, 2i64), Default::default()).await.unwrap();

    let empty_registry = FunctionRegistry::builder()
        .register_activity_typed("tests::unrelated", DurableOptions::default(), |_ctx, (): ()| async move { Ok(()) })
        .build()
        .unwrap();
    let stale = client_for(backend.clone(), empty_registry);
    let worker = spawn_worker(&stale, fast_serve_options()).await;

    let err = full.wait_for(exec_id, Some(Duration::from_secs(10))).await.unwrap_err();
    match err {
        senpuki::WaitError::Terminal { state, error } => {
            assert_eq!(state, ExecutionState::Failed);
            assert!(error.unwrap().contains("not registered"));
        }
        other => panic!("expected terminal error, got {other:?}"),
    }
    let tasks = backend.list_tasks(exec_id).await.unwrap();
    assert_eq!(tasks[0].state, TaskState::Dead);
    assert_eq!(tasks[0].attempt, 0, "unresolvable names do not burn retries");

    worker.stop().await;
}
