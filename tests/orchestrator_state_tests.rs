//! Orchestrator durable state: replay-safe counters and custom state, and
//! the progress spill that keeps hot task rows bounded.

mod common;

use common::*;
use senpuki::registry::{DurableOptions, FunctionRegistry};
use std::time::Duration;

#[tokio::test]
async fn counters_between_steps_apply_once_despite_reentries() {
    let registry = FunctionRegistry::builder()
        .register_activity_typed("math::add", DurableOptions::default(), |_ctx, (a, b): (i64, i64)| async move {
            Ok(a + b)
        })
        .register_orchestrator_typed("flow::counted", DurableOptions::default(), |ctx, (): ()| async move {
            // The body re-enters at least three times (one park per call),
            // but each counter add is a recorded step.
            ctx.add_counter("turns", 1).await?;
            let a: i64 = ctx.call("math::add", &(1i64, 2i64)).await?;
            ctx.add_counter("turns", 1).await?;
            let b: i64 = ctx.call("math::add", &(a, 10i64)).await?;
            ctx.add_counter("turns", 1).await?;
            Ok(b)
        })
        .build()
        .unwrap();

    let (backend, _dir) = disk_backend().await;
    let client = client_for(backend.clone(), registry);
    let worker = spawn_worker(&client, fast_serve_options()).await;

    let exec_id = client.dispatch("flow::counted", &(), Default::default()).await.unwrap();
    let result: i64 = client.wait_for_typed(exec_id, Some(Duration::from_secs(10))).await.unwrap();
    assert_eq!(result, 13);

    let view = client.state_of(exec_id).await.unwrap();
    assert_eq!(view.counters.get("turns"), Some(&3), "counter adds must not multiply across replays");

    worker.stop().await;
}

#[tokio::test]
async fn custom_state_set_from_orchestrator_is_visible_in_state_of() {
    let registry = FunctionRegistry::builder()
        .register_activity_typed("math::add", DurableOptions::default(), |_ctx, (a, b): (i64, i64)| async move {
            Ok(a + b)
        })
        .register_orchestrator_typed("flow::staged", DurableOptions::default(), |ctx, (): ()| async move {
            ctx.set_state("phase", &"adding").await?;
            let sum: i64 = ctx.call("math::add", &(20i64, 22i64)).await?;
            ctx.set_state("phase", &"done").await?;
            Ok(sum)
        })
        .build()
        .unwrap();

    let (backend, _dir) = disk_backend().await;
    let client = client_for(backend.clone(), registry);
    let worker = spawn_worker(&client, fast_serve_options()).await;

    let exec_id = client.dispatch("flow::staged", &(), Default::default()).await.unwrap();
    let result: i64 = client.wait_for_typed(exec_id, Some(Duration::from_secs(10))).await.unwrap();
    assert_eq!(result, 42);

    let view = client.state_of(exec_id).await.unwrap();
    let phase: String = view.custom_state.get("phase").unwrap().decode().unwrap();
    assert_eq!(phase, "done");

    worker.stop().await;
}

#[tokio::test]
async fn long_progress_logs_spill_but_stay_complete() {
    const STEPS: usize = 80;

    let registry = FunctionRegistry::builder()
        .register_activity_typed("math::add", DurableOptions::default(), |_ctx, (a, b): (i64, i64)| async move {
            Ok(a + b)
        })
        .register_orchestrator_typed("flow::marathon", DurableOptions::default(), |ctx, (): ()| async move {
            let mut total = 0i64;
            for _ in 0..STEPS {
                total = ctx.call("math::add", &(total, 1i64)).await?;
            }
            Ok(total)
        })
        .build()
        .unwrap();

    let (backend, _dir) = disk_backend().await;
    let client = client_for(backend.clone(), registry);
    let worker = spawn_worker(&client, fast_serve_options()).await;

    let exec_id = client.dispatch("flow::marathon", &(), Default::default()).await.unwrap();
    let result: i64 = client.wait_for_typed(exec_id, Some(Duration::from_secs(60))).await.unwrap();
    assert_eq!(result, STEPS as i64);

    let tasks = backend.list_tasks(exec_id).await.unwrap();
    let root = tasks.iter().find(|t| t.parent_task_id.is_none()).unwrap();

    // The merged log is complete and ordered; the hot row holds only the
    // tail.
    let progress = backend.load_progress(root.id).await.unwrap();
    assert_eq!(progress.len(), STEPS);
    let indices: Vec<u32> = progress.iter().map(|r| r.index).collect();
    let expected: Vec<u32> = (0..STEPS as u32).collect();
    assert_eq!(indices, expected);
    assert!(root.progress.len() < STEPS, "hot progress row did not spill");

    worker.stop().await;
}
