use senpuki::backend::sqlite::SqliteBackend;
use senpuki::backend::Backend;
use senpuki::registry::{DurableOptions, FunctionRegistry};
use senpuki::worker::{ServeOptions, WorkerLifecycle, WorkerOptions};
use senpuki::{Client, RetryPolicy, TaskError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use uuid::Uuid;

#[allow(dead_code)]
pub async fn memory_backend() -> Arc<dyn Backend> {
    let backend = SqliteBackend::connect("sqlite::memory:").await.unwrap();
    backend.init_db().await.unwrap();
    Arc::new(backend)
}

/// File-backed store so several backend handles (and several workers) can
/// share it, as separate processes would.
pub async fn disk_backend() -> (Arc<dyn Backend>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let backend = open_disk_backend(&dir).await;
    (backend, dir)
}

#[allow(dead_code)]
pub async fn open_disk_backend(dir: &TempDir) -> Arc<dyn Backend> {
    let url = format!("sqlite://{}", dir.path().join("senpuki.db").display());
    let backend = SqliteBackend::connect(&url).await.unwrap();
    backend.init_db().await.unwrap();
    Arc::new(backend)
}

/// Activities and orchestrators shared by the end-to-end tests.
pub fn scenario_registry() -> FunctionRegistry {
    FunctionRegistry::builder()
        .register_activity_typed("math::add", DurableOptions::default(), |_ctx, (a, b): (i64, i64)| async move {
            Ok(a + b)
        })
        .register_activity_typed("math::mul", DurableOptions::default(), |_ctx, (a, b): (i64, i64)| async move {
            Ok(a * b)
        })
        .register_activity_typed("math::square", DurableOptions::default(), |_ctx, n: i64| async move { Ok(n * n) })
        .register_activity_typed(
            "math::flaky",
            DurableOptions::default().with_retry(
                RetryPolicy::new(5)
                    .with_base_delay(Duration::from_millis(10))
                    .with_max_delay(Duration::from_millis(100)),
            ),
            |ctx, succeed_on: u32| async move {
                if ctx.attempt() < succeed_on {
                    ctx.add_counter("failures", 1).await?;
                    Err(TaskError::retryable(format!("attempt {} too early", ctx.attempt())))
                } else {
                    ctx.add_counter("successes", 1).await?;
                    Ok(ctx.attempt())
                }
            },
        )
        .register_activity_typed(
            "math::always_fail",
            DurableOptions::default()
                .with_retry(RetryPolicy::new(2).with_base_delay(Duration::from_millis(10))),
            |_ctx, (): ()| async move { Err::<(), _>(TaskError::retryable("I failed")) },
        )
        .register_orchestrator_typed(
            "math::add_then_mul",
            DurableOptions::default(),
            |ctx, (a, b, c): (i64, i64, i64)| async move {
                let sum: i64 = ctx.call("math::add", &(a, b)).await?;
                let product: i64 = ctx.call("math::mul", &(sum, c)).await?;
                Ok(product)
            },
        )
        .register_orchestrator_typed("math::square_all", DurableOptions::default(), |ctx, items: Vec<i64>| async move {
            let futures: Vec<_> = items.iter().map(|n| ctx.call::<i64, i64>("math::square", n)).collect();
            futures::future::join_all(futures)
                .await
                .into_iter()
                .collect::<Result<Vec<i64>, _>>()
        })
        .register_orchestrator_typed("flow::await_approval", DurableOptions::default(), |ctx, (): ()| async move {
            let payload: serde_json::Value = ctx.wait_for_signal("approve", None).await?;
            Ok(payload)
        })
        .register_orchestrator_typed("flow::nap_then_answer", DurableOptions::default(), |ctx, nap_ms: u64| async move {
            ctx.durable_sleep(Duration::from_millis(nap_ms)).await?;
            Ok(42i64)
        })
        .build()
        .unwrap()
}

pub fn client_for(backend: Arc<dyn Backend>, registry: FunctionRegistry) -> Client {
    Client::new(backend, Arc::new(registry))
}

pub fn fast_serve_options() -> ServeOptions {
    ServeOptions {
        worker: WorkerOptions {
            poll_interval: Duration::from_millis(25),
            lease_duration: Duration::from_secs(10),
            ..Default::default()
        },
        cleanup_interval: None,
        ..Default::default()
    }
}

/// A worker running in the background until dropped or stopped.
pub struct WorkerGuard {
    pub lifecycle: WorkerLifecycle,
    handle: tokio::task::JoinHandle<()>,
}

impl WorkerGuard {
    pub async fn stop(self) {
        self.lifecycle.request_drain();
        self.lifecycle.wait_until_stopped().await;
        let _ = self.handle.await;
    }
}

pub async fn spawn_worker(client: &Client, options: ServeOptions) -> WorkerGuard {
    let lifecycle = client.create_worker_lifecycle(format!("test-{}", Uuid::new_v4().simple()));
    let handle = tokio::spawn({
        let client = client.clone();
        let lifecycle = lifecycle.clone();
        async move {
            if let Err(e) = client.serve(lifecycle, options).await {
                panic!("worker failed: {e}");
            }
        }
    });
    lifecycle.wait_until_ready().await;
    WorkerGuard { lifecycle, handle }
}

/// Poll until the predicate holds or the deadline passes.
#[allow(dead_code)]
pub async fn wait_until<F, Fut>(timeout: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if predicate().await {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
