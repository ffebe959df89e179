//! Claim protocol: single-claimant guarantees, lease bookkeeping, and the
//! lost-lease write fence.

mod common;

use common::*;
use senpuki::backend::Backend;
use senpuki::{Execution, Payload, Task, TaskKind, TaskState};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

async fn seed_task(backend: &Arc<dyn Backend>, step_name: &str) -> Task {
    let execution = Execution::new(step_name, Payload::unit());
    let task = Task::new(execution.id, TaskKind::Activity, step_name, Payload::unit());
    backend.create_execution_with_root_task(&execution, &task).await.unwrap();
    task
}

#[tokio::test]
async fn racing_workers_claim_exactly_once() {
    let (backend, _dir) = disk_backend().await;
    seed_task(&backend, "tests::contended").await;

    let mut handles = Vec::new();
    for i in 0..8 {
        let backend = backend.clone();
        handles.push(tokio::spawn(async move {
            backend
                .claim_next_task(&format!("racer-{i}"), &[], &[], Duration::from_secs(30), &HashMap::new())
                .await
                .unwrap()
        }));
    }

    let mut claims = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            claims += 1;
        }
    }
    assert_eq!(claims, 1, "exactly one of 8 racing claimants may win");
}

#[tokio::test]
async fn claim_sets_owner_and_full_lease() {
    let (backend, _dir) = disk_backend().await;
    let seeded = seed_task(&backend, "tests::leased").await;

    let before = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64;
    let claimed = backend
        .claim_next_task("w1", &[], &[], Duration::from_secs(120), &HashMap::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, seeded.id);
    assert_eq!(claimed.state, TaskState::Running);
    assert_eq!(claimed.worker_id.as_deref(), Some("w1"));
    let lease = claimed.lease_expires_at.unwrap();
    assert!(lease >= before + 119_000, "lease shorter than requested");

    let stored = backend.get_task(seeded.id).await.unwrap().unwrap();
    assert_eq!(stored.worker_id.as_deref(), Some("w1"));
    assert_eq!(stored.lease_expires_at, Some(lease));
}

#[tokio::test]
async fn expired_lease_is_reclaimable_and_loser_cannot_write() {
    let (backend, _dir) = disk_backend().await;
    let seeded = seed_task(&backend, "tests::reclaim").await;

    let first = backend
        .claim_next_task("loser", &[], &[], Duration::from_millis(100), &HashMap::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.worker_id.as_deref(), Some("loser"));

    tokio::time::sleep(Duration::from_millis(200)).await;

    // Renewal after expiry reports the lease as lost.
    let state = backend
        .renew_lease(seeded.id, "loser", Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(state, senpuki::backend::LeaseState::Lost);

    let second = backend
        .claim_next_task("winner", &[], &[], Duration::from_secs(30), &HashMap::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.id, seeded.id);
    assert_eq!(second.worker_id.as_deref(), Some("winner"));

    // The loser's late write is rejected; only the winner's result lands.
    let loser_write = backend.complete_task(seeded.id, "loser", &Payload::json(&"stale").unwrap()).await;
    assert!(loser_write.is_err());

    backend.complete_task(seeded.id, "winner", &Payload::json(&"fresh").unwrap()).await.unwrap();
    let stored = backend.get_task(seeded.id).await.unwrap().unwrap();
    assert_eq!(stored.state, TaskState::Completed);
    let result: String = stored.result.unwrap().decode().unwrap();
    assert_eq!(result, "fresh");
}

#[tokio::test]
async fn priority_then_schedule_order_governs_claims() {
    let (backend, _dir) = disk_backend().await;

    let mut low = seed_task(&backend, "tests::low").await;
    low.priority = 0;
    backend.update_task(&low).await.unwrap();
    let mut high = seed_task(&backend, "tests::high").await;
    high.priority = 5;
    backend.update_task(&high).await.unwrap();

    let first = backend
        .claim_next_task("w", &[], &[], Duration::from_secs(30), &HashMap::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.step_name, "tests::high");
    let second = backend
        .claim_next_task("w", &[], &[], Duration::from_secs(30), &HashMap::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.step_name, "tests::low");
}

#[tokio::test]
async fn future_scheduled_tasks_are_not_claimable() {
    let (backend, _dir) = disk_backend().await;
    let mut seeded = seed_task(&backend, "tests::later").await;
    seeded.scheduled_for += 60_000;
    backend.update_task(&seeded).await.unwrap();

    let claimed = backend
        .claim_next_task("w", &[], &[], Duration::from_secs(30), &HashMap::new())
        .await
        .unwrap();
    assert!(claimed.is_none());
}
