//! Linear orchestration: chained activities, crash between steps, replay.

mod common;

use common::*;
use senpuki::{StepStatus, TaskKind, TaskState};
use std::time::Duration;

#[tokio::test]
async fn chained_calls_return_final_result() {
    let (backend, _dir) = disk_backend().await;
    let client = client_for(backend.clone(), scenario_registry());
    let worker = spawn_worker(&client, fast_serve_options()).await;

    let exec_id = client.dispatch("math::add_then_mul", &(2i64, 3i64, 4i64), Default::default()).await.unwrap();
    let result: i64 = client.wait_for_typed(exec_id, Some(Duration::from_secs(10))).await.unwrap();
    assert_eq!(result, 20);

    let tasks = backend.list_tasks(exec_id).await.unwrap();
    let activities: Vec<_> = tasks.iter().filter(|t| t.kind == TaskKind::Activity).collect();
    assert_eq!(activities.len(), 2);
    assert!(activities.iter().all(|t| t.state == TaskState::Completed));

    let root = tasks.iter().find(|t| t.parent_task_id.is_none()).unwrap();
    assert_eq!(root.kind, TaskKind::Orchestrator);
    let progress = backend.load_progress(root.id).await.unwrap();
    assert_eq!(progress.len(), 2);

    worker.stop().await;
}

#[tokio::test]
async fn worker_crash_between_steps_resumes_from_progress() {
    let (backend, dir) = disk_backend().await;
    let client = client_for(backend.clone(), scenario_registry());

    let worker = spawn_worker(&client, fast_serve_options()).await;
    let exec_id = client.dispatch("math::add_then_mul", &(2i64, 3i64, 4i64), Default::default()).await.unwrap();

    // Wait for the first activity to commit, then take the worker down.
    let committed = wait_until(Duration::from_secs(10), || {
        let backend = backend.clone();
        async move {
            backend
                .list_tasks(exec_id)
                .await
                .unwrap()
                .iter()
                .any(|t| t.step_name == "math::add" && t.state == TaskState::Completed)
        }
    })
    .await;
    assert!(committed, "first activity never completed");
    worker.stop().await;

    // A fresh worker over the same store picks the execution back up.
    let backend2 = open_disk_backend(&dir).await;
    let client2 = client_for(backend2.clone(), scenario_registry());
    let worker2 = spawn_worker(&client2, fast_serve_options()).await;

    let result: i64 = client2.wait_for_typed(exec_id, Some(Duration::from_secs(10))).await.unwrap();
    assert_eq!(result, 20);

    let tasks = backend2.list_tasks(exec_id).await.unwrap();
    let completed_activities = tasks
        .iter()
        .filter(|t| t.kind == TaskKind::Activity && t.state == TaskState::Completed)
        .count();
    assert_eq!(completed_activities, 2, "each activity runs exactly one task to completion");

    let root = tasks.iter().find(|t| t.parent_task_id.is_none()).unwrap();
    let progress = backend2.load_progress(root.id).await.unwrap();
    assert_eq!(progress.len(), 2);

    worker2.stop().await;
}

#[tokio::test]
async fn completed_progress_records_outcomes_in_step_order() {
    let (backend, _dir) = disk_backend().await;
    let client = client_for(backend.clone(), scenario_registry());
    let worker = spawn_worker(&client, fast_serve_options()).await;

    let exec_id = client.dispatch("math::add_then_mul", &(1i64, 2i64, 10i64), Default::default()).await.unwrap();
    let result: i64 = client.wait_for_typed(exec_id, Some(Duration::from_secs(10))).await.unwrap();
    assert_eq!(result, 30);

    let tasks = backend.list_tasks(exec_id).await.unwrap();
    let root = tasks.iter().find(|t| t.parent_task_id.is_none()).unwrap();
    let progress = backend.load_progress(root.id).await.unwrap();

    let indices: Vec<u32> = progress.iter().map(|r| r.index).collect();
    assert_eq!(indices, vec![0, 1]);
    // The first step settled before the second was ever registered, so its
    // recorded outcome is what the replayed body saw.
    let first = &progress[0];
    assert_eq!(first.status, StepStatus::Completed);
    let recorded: i64 = first.result.as_ref().unwrap().decode().unwrap();
    assert_eq!(recorded, 3);

    worker.stop().await;
}
