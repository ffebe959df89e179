//! Concurrency groups: the claim transaction admits at most `limit` running
//! tasks per group, cluster-wide.

mod common;

use common::*;
use senpuki::registry::{DurableOptions, FunctionRegistry};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn group_limit_bounds_simultaneous_runs() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let high_water = Arc::new(AtomicUsize::new(0));

    let in_flight_body = in_flight.clone();
    let high_water_body = high_water.clone();
    let registry = FunctionRegistry::builder()
        .register_activity_typed(
            "tests::throttled",
            DurableOptions::default().with_concurrency_limit(2),
            move |_ctx, (): ()| {
                let in_flight = in_flight_body.clone();
                let high_water = high_water_body.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    high_water.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        )
        .build()
        .unwrap();

    let (backend, _dir) = disk_backend().await;
    let client = client_for(backend.clone(), registry);
    // Plenty of worker capacity: only the group limit throttles.
    let worker = spawn_worker(&client, fast_serve_options()).await;

    let mut exec_ids = Vec::new();
    for _ in 0..6 {
        exec_ids.push(client.dispatch("tests::throttled", &(), Default::default()).await.unwrap());
    }
    for exec_id in exec_ids {
        let _: () = client.wait_for_typed(exec_id, Some(Duration::from_secs(20))).await.unwrap();
    }

    assert!(
        high_water.load(Ordering::SeqCst) <= 2,
        "observed {} concurrent runs in a limit-2 group",
        high_water.load(Ordering::SeqCst)
    );

    worker.stop().await;
}

#[tokio::test]
async fn named_group_is_shared_across_functions() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let high_water = Arc::new(AtomicUsize::new(0));

    let make_body = |in_flight: Arc<AtomicUsize>, high_water: Arc<AtomicUsize>| {
        move |_ctx: senpuki::ActivityContext, (): ()| {
            let in_flight = in_flight.clone();
            let high_water = high_water.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                high_water.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        }
    };

    let registry = FunctionRegistry::builder()
        .register_activity_typed(
            "tests::reader",
            DurableOptions::default().with_concurrency_limit(1).with_concurrency_group("db"),
            make_body(in_flight.clone(), high_water.clone()),
        )
        .register_activity_typed(
            "tests::writer",
            DurableOptions::default().with_concurrency_limit(1).with_concurrency_group("db"),
            make_body(in_flight.clone(), high_water.clone()),
        )
        .build()
        .unwrap();

    let (backend, _dir) = disk_backend().await;
    let client = client_for(backend.clone(), registry);
    let worker = spawn_worker(&client, fast_serve_options()).await;

    let mut exec_ids = Vec::new();
    for _ in 0..2 {
        exec_ids.push(client.dispatch("tests::reader", &(), Default::default()).await.unwrap());
        exec_ids.push(client.dispatch("tests::writer", &(), Default::default()).await.unwrap());
    }
    for exec_id in exec_ids {
        let _: () = client.wait_for_typed(exec_id, Some(Duration::from_secs(20))).await.unwrap();
    }

    assert_eq!(high_water.load(Ordering::SeqCst), 1, "the shared group must serialise both functions");

    worker.stop().await;
}
