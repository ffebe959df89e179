//! Function registry.
//!
//! Maps a stable function name to a callable plus its durability metadata.
//! The registry is owned by the executor instance and populated by explicit
//! registration calls; there is no ambient global state, and dispatch of an
//! unknown name fails fast.
//!
//! Names are chosen by the caller and must be stable across deployments
//! (the conventional shape is `module::function`, mirroring where the code
//! lives).

use crate::codec::{Codec, Payload};
use crate::context::{ActivityContext, OrchestrationContext};
use crate::{now_ms, RetryPolicy, Task, TaskError, TaskKind, DEFAULT_QUEUE};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Stable cache key for a cacheable function: step name plus a content hash
/// of the serialized arguments.
pub(crate) fn cache_key(step_name: &str, args: &Payload) -> String {
    let digest = Sha256::digest(args.as_bytes());
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    format!("{step_name}:{hex}")
}

/// Durability metadata attached to a registered function.
#[derive(Clone, Default)]
pub struct DurableOptions {
    pub queue: Option<String>,
    pub priority: i32,
    pub tags: Vec<String>,
    pub retry: Option<RetryPolicy>,
    /// Absolute task deadline, measured from `scheduled_for`.
    pub timeout: Option<Duration>,
    /// Cache results keyed by step name + argument hash.
    pub cacheable: bool,
    pub cache_ttl: Option<Duration>,
    /// Derives an idempotency key from the serialized arguments; a cache hit
    /// on that key short-circuits execution.
    pub idempotency_key_fn: Option<Arc<dyn Fn(&Payload) -> String + Send + Sync>>,
    /// Cluster-wide cap on concurrently running tasks of this function's
    /// concurrency group.
    pub concurrency_limit: Option<u32>,
    /// Defaults to the step name when a limit is set.
    pub concurrency_group: Option<String>,
}

impl std::fmt::Debug for DurableOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableOptions")
            .field("queue", &self.queue)
            .field("priority", &self.priority)
            .field("tags", &self.tags)
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("cacheable", &self.cacheable)
            .field("cache_ttl", &self.cache_ttl)
            .field("idempotency_key_fn", &self.idempotency_key_fn.as_ref().map(|_| "<fn>"))
            .field("concurrency_limit", &self.concurrency_limit)
            .field("concurrency_group", &self.concurrency_group)
            .finish()
    }
}

impl DurableOptions {
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cacheable(mut self, ttl: Option<Duration>) -> Self {
        self.cacheable = true;
        self.cache_ttl = ttl;
        self
    }

    pub fn with_idempotency_key_fn(mut self, f: impl Fn(&Payload) -> String + Send + Sync + 'static) -> Self {
        self.idempotency_key_fn = Some(Arc::new(f));
        self
    }

    pub fn with_concurrency_limit(mut self, limit: u32) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    pub fn with_concurrency_group(mut self, group: impl Into<String>) -> Self {
        self.concurrency_group = Some(group.into());
        self
    }
}

/// Trait implemented by activity handlers.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: Payload) -> Result<Payload, TaskError>;
}

/// Trait implemented by orchestrator handlers.
#[async_trait]
pub trait OrchestratorHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: Payload) -> Result<Payload, TaskError>;
}

/// Function wrapper that implements [`ActivityHandler`].
pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(ActivityContext, Payload) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Payload, TaskError>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(ActivityContext, Payload) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Payload, TaskError>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: Payload) -> Result<Payload, TaskError> {
        (self.0)(ctx, input).await
    }
}

/// Function wrapper that implements [`OrchestratorHandler`].
pub struct FnOrchestrator<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, Payload) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Payload, TaskError>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestratorHandler for FnOrchestrator<F, Fut>
where
    F: Fn(OrchestrationContext, Payload) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Payload, TaskError>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: Payload) -> Result<Payload, TaskError> {
        (self.0)(ctx, input).await
    }
}

#[derive(Clone)]
pub(crate) enum HandlerKind {
    Activity(Arc<dyn ActivityHandler>),
    Orchestrator(Arc<dyn OrchestratorHandler>),
}

/// A registered durable function: callable plus metadata.
pub struct DurableFunction {
    pub name: String,
    pub options: DurableOptions,
    pub(crate) handler: HandlerKind,
}

/// Per-dispatch overrides layered over a function's registered options.
#[derive(Debug, Clone, Default)]
pub(crate) struct TaskOverrides {
    pub queue: Option<String>,
    pub priority: Option<i32>,
    pub tags: Vec<String>,
    pub delay: Option<Duration>,
    pub expiry: Option<Duration>,
    pub idempotency_key: Option<String>,
    pub retry: Option<RetryPolicy>,
}

impl DurableFunction {
    pub fn kind(&self) -> TaskKind {
        match self.handler {
            HandlerKind::Activity(_) => TaskKind::Activity,
            HandlerKind::Orchestrator(_) => TaskKind::Orchestrator,
        }
    }

    /// The retry policy in effect absent a dispatch-level override.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.options.retry.clone().unwrap_or_default()
    }

    /// Build a task row for one invocation of this function, applying the
    /// override precedence dispatch > registration > engine default.
    /// `expiry` is measured from `scheduled_for`.
    pub(crate) fn build_task(
        &self,
        execution_id: Uuid,
        parent_task_id: Option<Uuid>,
        args: Payload,
        overrides: &TaskOverrides,
    ) -> Task {
        let retry = overrides.retry.clone().or_else(|| self.options.retry.clone()).unwrap_or_default();
        let now = now_ms();
        let scheduled_for = now + overrides.delay.map(|d| d.as_millis() as i64).unwrap_or(0);
        let expiry = overrides.expiry.or(self.options.timeout);

        let mut tags = self.options.tags.clone();
        for tag in &overrides.tags {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }

        let idempotency_key = overrides
            .idempotency_key
            .clone()
            .or_else(|| self.options.idempotency_key_fn.as_ref().map(|f| f(&args)));

        let mut task = Task::new(execution_id, self.kind(), &self.name, args);
        task.parent_task_id = parent_task_id;
        task.max_attempts = retry.max_attempts;
        task.scheduled_for = scheduled_for;
        task.expires_at = expiry.map(|e| scheduled_for + e.as_millis() as i64);
        task.queue = overrides
            .queue
            .clone()
            .or_else(|| self.options.queue.clone())
            .unwrap_or_else(|| DEFAULT_QUEUE.to_string());
        task.priority = overrides.priority.unwrap_or(self.options.priority);
        task.tags = tags;
        task.idempotency_key = idempotency_key;
        task.cache_key = if self.options.cacheable { Some(cache_key(&self.name, &task.args)) } else { None };
        task.concurrency_group = if self.options.concurrency_limit.is_some() {
            Some(self.options.concurrency_group.clone().unwrap_or_else(|| self.name.clone()))
        } else {
            None
        };
        task
    }
}

/// Immutable name → durable-function map.
#[derive(Clone)]
pub struct FunctionRegistry {
    inner: Arc<HashMap<String, Arc<DurableFunction>>>,
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("names", &self.inner.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl FunctionRegistry {
    pub fn builder() -> FunctionRegistryBuilder {
        FunctionRegistryBuilder { map: HashMap::new(), errors: Vec::new() }
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<DurableFunction>> {
        self.inner.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn list_names(&self) -> Vec<String> {
        self.inner.keys().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }

    /// Concurrency limits by group, consulted inside the claim transaction.
    pub fn concurrency_limits(&self) -> HashMap<String, u32> {
        let mut limits = HashMap::new();
        for f in self.inner.values() {
            if let Some(limit) = f.options.concurrency_limit {
                let group = f.options.concurrency_group.clone().unwrap_or_else(|| f.name.clone());
                limits.insert(group, limit);
            }
        }
        limits
    }
}

pub struct FunctionRegistryBuilder {
    map: HashMap<String, Arc<DurableFunction>>,
    errors: Vec<String>,
}

impl FunctionRegistryBuilder {
    pub fn register_activity<F, Fut>(mut self, name: impl Into<String>, options: DurableOptions, f: F) -> Self
    where
        F: Fn(ActivityContext, Payload) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Payload, TaskError>> + Send + 'static,
    {
        let name = name.into();
        self.insert(name.clone(), options, HandlerKind::Activity(Arc::new(FnActivity(f))));
        self
    }

    pub fn register_orchestrator<F, Fut>(mut self, name: impl Into<String>, options: DurableOptions, f: F) -> Self
    where
        F: Fn(OrchestrationContext, Payload) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Payload, TaskError>> + Send + 'static,
    {
        let name = name.into();
        self.insert(name.clone(), options, HandlerKind::Orchestrator(Arc::new(FnOrchestrator(f))));
        self
    }

    /// Register an activity whose arguments and result go through the
    /// default JSON codec.
    pub fn register_activity_typed<In, Out, F, Fut>(
        self,
        name: impl Into<String>,
        options: DurableOptions,
        f: F,
    ) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(ActivityContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, TaskError>> + Send + 'static,
    {
        let wrapper = move |ctx: ActivityContext, input: Payload| {
            let f = f.clone();
            async move {
                let args: In = input.decode()?;
                let out = f(ctx, args).await?;
                Ok(Payload::encode(Codec::Json, &out)?)
            }
        };
        self.register_activity(name, options, wrapper)
    }

    /// Register an orchestrator whose arguments and result go through the
    /// default JSON codec.
    pub fn register_orchestrator_typed<In, Out, F, Fut>(
        self,
        name: impl Into<String>,
        options: DurableOptions,
        f: F,
    ) -> Self
    where
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, TaskError>> + Send + 'static,
    {
        let wrapper = move |ctx: OrchestrationContext, input: Payload| {
            let f = f.clone();
            async move {
                let args: In = input.decode()?;
                let out = f(ctx, args).await?;
                Ok(Payload::encode(Codec::Json, &out)?)
            }
        };
        self.register_orchestrator(name, options, wrapper)
    }

    fn insert(&mut self, name: String, options: DurableOptions, handler: HandlerKind) {
        if self.map.contains_key(&name) {
            self.errors.push(format!("duplicate registration: {name}"));
            return;
        }
        self.map.insert(name.clone(), Arc::new(DurableFunction { name, options, handler }));
    }

    /// # Errors
    /// Returns the joined registration errors (duplicates) if any occurred.
    pub fn build(self) -> Result<FunctionRegistry, String> {
        if self.errors.is_empty() {
            Ok(FunctionRegistry { inner: Arc::new(self.map) })
        } else {
            Err(self.errors.join("; "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_registry() -> FunctionRegistryBuilder {
        FunctionRegistry::builder().register_activity("tests::echo", DurableOptions::default(), |_ctx, input| async move {
            Ok(input)
        })
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let err = echo_registry()
            .register_activity("tests::echo", DurableOptions::default(), |_ctx, input| async move { Ok(input) })
            .build()
            .unwrap_err();
        assert!(err.contains("duplicate registration: tests::echo"));
    }

    #[test]
    fn resolve_unknown_name_fails() {
        let registry = echo_registry().build().unwrap();
        assert!(registry.resolve("tests::echo").is_some());
        assert!(registry.resolve("tests::missing").is_none());
    }

    #[test]
    fn build_task_applies_override_precedence() {
        let options = DurableOptions::default()
            .with_queue("reports")
            .with_priority(3)
            .with_tags(["pii"])
            .with_retry(RetryPolicy::new(7))
            .with_timeout(Duration::from_secs(60));
        let registry = FunctionRegistry::builder()
            .register_activity("tests::opts", options, |_ctx, input| async move { Ok(input) })
            .build()
            .unwrap();
        let f = registry.resolve("tests::opts").unwrap();

        let exec_id = Uuid::new_v4();
        let overrides = TaskOverrides {
            queue: Some("urgent".into()),
            delay: Some(Duration::from_secs(10)),
            tags: vec!["ops".into()],
            retry: Some(RetryPolicy::new(2)),
            ..Default::default()
        };
        let task = f.build_task(exec_id, None, Payload::unit(), &overrides);

        assert_eq!(task.queue, "urgent");
        assert_eq!(task.priority, 3);
        assert_eq!(task.tags, vec!["pii".to_string(), "ops".to_string()]);
        assert_eq!(task.max_attempts, 2);
        // Expiry measured from scheduled_for, not dispatch time.
        assert_eq!(task.expires_at, Some(task.scheduled_for + 60_000));
        assert!(task.scheduled_for >= task.created_at + 10_000);
    }

    #[test]
    fn concurrency_group_defaults_to_step_name() {
        let registry = FunctionRegistry::builder()
            .register_activity(
                "tests::limited",
                DurableOptions::default().with_concurrency_limit(2),
                |_ctx, input| async move { Ok(input) },
            )
            .build()
            .unwrap();
        let limits = registry.concurrency_limits();
        assert_eq!(limits.get("tests::limited"), Some(&2));

        let f = registry.resolve("tests::limited").unwrap();
        let task = f.build_task(Uuid::new_v4(), None, Payload::unit(), &TaskOverrides::default());
        assert_eq!(task.concurrency_group.as_deref(), Some("tests::limited"));
    }

    #[test]
    fn cache_key_is_stable_per_args() {
        let a = Payload::json(&(1, 2)).unwrap();
        let b = Payload::json(&(1, 2)).unwrap();
        let c = Payload::json(&(2, 1)).unwrap();
        assert_eq!(cache_key("f", &a), cache_key("f", &b));
        assert_ne!(cache_key("f", &a), cache_key("f", &c));
        assert_ne!(cache_key("f", &a), cache_key("g", &a));
    }
}
