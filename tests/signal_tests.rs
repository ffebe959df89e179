//! Signals: FIFO delivery into waiting orchestrators, wake-on-send, and
//! wait deadlines.

mod common;

use common::*;
use senpuki::registry::{DurableOptions, FunctionRegistry};
use senpuki::ExecutionState;
use std::time::Duration;

#[tokio::test]
async fn signal_resumes_waiting_orchestrator_with_payload() {
    let (backend, _dir) = disk_backend().await;
    let client = client_for(backend.clone(), scenario_registry());
    let worker = spawn_worker(&client, fast_serve_options()).await;

    let exec_id = client.dispatch("flow::await_approval", &(), Default::default()).await.unwrap();

    // Let the orchestrator park on the signal first.
    let parked = wait_until(Duration::from_secs(10), || {
        let client = client.clone();
        async move {
            let view = client.state_of(exec_id).await.unwrap();
            view.execution.state == ExecutionState::Running
        }
    })
    .await;
    assert!(parked);
    tokio::time::sleep(Duration::from_millis(100)).await;

    client.send_signal(exec_id, "approve", &serde_json::json!({"ok": true})).await.unwrap();

    let result: serde_json::Value = client.wait_for_typed(exec_id, Some(Duration::from_secs(10))).await.unwrap();
    assert_eq!(result, serde_json::json!({"ok": true}));

    worker.stop().await;
}

#[tokio::test]
async fn signal_sent_before_wait_is_consumed_fifo() {
    let (backend, _dir) = disk_backend().await;
    let registry = FunctionRegistry::builder()
        .register_orchestrator_typed("flow::drain_two", DurableOptions::default(), |ctx, (): ()| async move {
            let first: String = ctx.wait_for_signal("item", None).await?;
            let second: String = ctx.wait_for_signal("item", None).await?;
            Ok(format!("{first},{second}"))
        })
        .build()
        .unwrap();
    let client = client_for(backend.clone(), registry);

    // Both payloads are queued before any worker exists.
    let exec_id = client.dispatch("flow::drain_two", &(), Default::default()).await.unwrap();
    client.send_signal(exec_id, "item", &"a").await.unwrap();
    client.send_signal(exec_id, "item", &"b").await.unwrap();

    let worker = spawn_worker(&client, fast_serve_options()).await;
    let result: String = client.wait_for_typed(exec_id, Some(Duration::from_secs(10))).await.unwrap();
    assert_eq!(result, "a,b");

    worker.stop().await;
}

#[tokio::test]
async fn signal_wait_deadline_fails_the_step() {
    let (backend, _dir) = disk_backend().await;
    let registry = FunctionRegistry::builder()
        .register_orchestrator_typed("flow::impatient", DurableOptions::default(), |ctx, (): ()| async move {
            match ctx.wait_for_signal::<String>("never", Some(Duration::from_millis(200))).await {
                Ok(payload) => Ok(payload),
                Err(_) => Ok("gave up".to_string()),
            }
        })
        .build()
        .unwrap();
    let client = client_for(backend.clone(), registry);
    let worker = spawn_worker(&client, fast_serve_options()).await;

    let exec_id = client.dispatch("flow::impatient", &(), Default::default()).await.unwrap();
    let result: String = client.wait_for_typed(exec_id, Some(Duration::from_secs(10))).await.unwrap();
    assert_eq!(result, "gave up");

    worker.stop().await;
}
