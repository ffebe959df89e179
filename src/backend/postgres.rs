//! Networked SQL backend over PostgreSQL.
//!
//! Claims rely on row-level locks with `FOR UPDATE SKIP LOCKED`, so many
//! worker processes can poll the same database without serialising on an
//! application-level lock.

use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{PgConnection, Row};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::{Backend, BackendError, ExecutionView, FailureDisposition, LeaseState};
use crate::codec::Payload;
use crate::{
    now_ms, DeadLetter, Execution, ExecutionState, StepRecord, Task, TaskKind, TaskState, PROGRESS_HOT_CAP,
};

const TERMINAL_EXECUTION_STATES: &str = "('completed','failed','timed_out','cancelled')";

const CLAIM_SCAN_LIMIT: i64 = 64;

const INSERT_TASK_SQL: &str = r#"
    INSERT INTO tasks (
        id, execution_id, parent_task_id, kind, step_name, args, state,
        attempt, max_attempts, scheduled_for, expires_at, lease_expires_at,
        worker_id, queue, priority, tags, idempotency_key, cache_key,
        concurrency_group, result, error, progress, created_at, updated_at
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
              $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24)
    "#;

pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    pub async fn connect(database_url: &str) -> Result<PostgresBackend, BackendError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| BackendError::from_sqlx("connect", e))?;
        Ok(PostgresBackend { pool })
    }
}

fn parse_uuid(op: &str, s: &str) -> Result<Uuid, BackendError> {
    Uuid::parse_str(s).map_err(|e| BackendError::permanent(op, format!("bad uuid {s}: {e}")))
}

fn execution_from_row(row: &PgRow) -> Result<Execution, BackendError> {
    let op = "decode_execution";
    let id: String = row.try_get("id").map_err(|e| BackendError::from_sqlx(op, e))?;
    let state: String = row.try_get("state").map_err(|e| BackendError::from_sqlx(op, e))?;
    Ok(Execution {
        id: parse_uuid(op, &id)?,
        step_name: row.try_get("step_name").map_err(|e| BackendError::from_sqlx(op, e))?,
        args: Payload::from_bytes(row.try_get("args").map_err(|e| BackendError::from_sqlx(op, e))?),
        state: ExecutionState::parse(&state)
            .ok_or_else(|| BackendError::permanent(op, format!("bad execution state {state}")))?,
        created_at: row.try_get("created_at").map_err(|e| BackendError::from_sqlx(op, e))?,
        updated_at: row.try_get("updated_at").map_err(|e| BackendError::from_sqlx(op, e))?,
        completed_at: row.try_get("completed_at").map_err(|e| BackendError::from_sqlx(op, e))?,
        result: row
            .try_get::<Option<Vec<u8>>, _>("result")
            .map_err(|e| BackendError::from_sqlx(op, e))?
            .map(Payload::from_bytes),
        error: row.try_get("error").map_err(|e| BackendError::from_sqlx(op, e))?,
    })
}

fn task_from_row(row: &PgRow) -> Result<Task, BackendError> {
    let op = "decode_task";
    let id: String = row.try_get("id").map_err(|e| BackendError::from_sqlx(op, e))?;
    let execution_id: String = row.try_get("execution_id").map_err(|e| BackendError::from_sqlx(op, e))?;
    let parent: Option<String> = row.try_get("parent_task_id").map_err(|e| BackendError::from_sqlx(op, e))?;
    let kind: String = row.try_get("kind").map_err(|e| BackendError::from_sqlx(op, e))?;
    let state: String = row.try_get("state").map_err(|e| BackendError::from_sqlx(op, e))?;
    let tags: String = row.try_get("tags").map_err(|e| BackendError::from_sqlx(op, e))?;
    let progress: String = row.try_get("progress").map_err(|e| BackendError::from_sqlx(op, e))?;
    Ok(Task {
        id: parse_uuid(op, &id)?,
        execution_id: parse_uuid(op, &execution_id)?,
        parent_task_id: parent.as_deref().map(|s| parse_uuid(op, s)).transpose()?,
        kind: TaskKind::parse(&kind).ok_or_else(|| BackendError::permanent(op, format!("bad task kind {kind}")))?,
        step_name: row.try_get("step_name").map_err(|e| BackendError::from_sqlx(op, e))?,
        args: Payload::from_bytes(row.try_get("args").map_err(|e| BackendError::from_sqlx(op, e))?),
        state: TaskState::parse(&state)
            .ok_or_else(|| BackendError::permanent(op, format!("bad task state {state}")))?,
        attempt: row.try_get::<i32, _>("attempt").map_err(|e| BackendError::from_sqlx(op, e))? as u32,
        max_attempts: row.try_get::<i32, _>("max_attempts").map_err(|e| BackendError::from_sqlx(op, e))? as u32,
        scheduled_for: row.try_get("scheduled_for").map_err(|e| BackendError::from_sqlx(op, e))?,
        expires_at: row.try_get("expires_at").map_err(|e| BackendError::from_sqlx(op, e))?,
        lease_expires_at: row.try_get("lease_expires_at").map_err(|e| BackendError::from_sqlx(op, e))?,
        worker_id: row.try_get("worker_id").map_err(|e| BackendError::from_sqlx(op, e))?,
        queue: row.try_get("queue").map_err(|e| BackendError::from_sqlx(op, e))?,
        priority: row.try_get::<i32, _>("priority").map_err(|e| BackendError::from_sqlx(op, e))?,
        tags: serde_json::from_str(&tags).map_err(|e| BackendError::permanent(op, format!("bad tags: {e}")))?,
        idempotency_key: row.try_get("idempotency_key").map_err(|e| BackendError::from_sqlx(op, e))?,
        cache_key: row.try_get("cache_key").map_err(|e| BackendError::from_sqlx(op, e))?,
        concurrency_group: row.try_get("concurrency_group").map_err(|e| BackendError::from_sqlx(op, e))?,
        result: row
            .try_get::<Option<Vec<u8>>, _>("result")
            .map_err(|e| BackendError::from_sqlx(op, e))?
            .map(Payload::from_bytes),
        error: row.try_get("error").map_err(|e| BackendError::from_sqlx(op, e))?,
        progress: serde_json::from_str(&progress)
            .map_err(|e| BackendError::permanent(op, format!("bad progress: {e}")))?,
        created_at: row.try_get("created_at").map_err(|e| BackendError::from_sqlx(op, e))?,
        updated_at: row.try_get("updated_at").map_err(|e| BackendError::from_sqlx(op, e))?,
    })
}

async fn insert_task(conn: &mut PgConnection, op: &str, task: &Task) -> Result<(), BackendError> {
    let tags = serde_json::to_string(&task.tags).map_err(|e| BackendError::permanent(op, e.to_string()))?;
    let progress =
        serde_json::to_string(&task.progress).map_err(|e| BackendError::permanent(op, e.to_string()))?;
    sqlx::query(INSERT_TASK_SQL)
        .bind(task.id.to_string())
        .bind(task.execution_id.to_string())
        .bind(task.parent_task_id.map(|p| p.to_string()))
        .bind(task.kind.as_str())
        .bind(&task.step_name)
        .bind(task.args.as_bytes())
        .bind(task.state.as_str())
        .bind(task.attempt as i32)
        .bind(task.max_attempts as i32)
        .bind(task.scheduled_for)
        .bind(task.expires_at)
        .bind(task.lease_expires_at)
        .bind(task.worker_id.as_deref())
        .bind(&task.queue)
        .bind(task.priority)
        .bind(tags)
        .bind(task.idempotency_key.as_deref())
        .bind(task.cache_key.as_deref())
        .bind(task.concurrency_group.as_deref())
        .bind(task.result.as_ref().map(|p| p.as_bytes().to_vec()))
        .bind(task.error.as_deref())
        .bind(progress)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&mut *conn)
        .await
        .map_err(|e| BackendError::from_sqlx(op, e))?;
    Ok(())
}

async fn wake_parent(conn: &mut PgConnection, parent_task_id: Uuid, now: i64) -> Result<(), BackendError> {
    sqlx::query(
        "UPDATE tasks SET scheduled_for = $1, updated_at = $2 \
         WHERE id = $3 AND state = 'pending' AND scheduled_for > $4",
    )
    .bind(now)
    .bind(now)
    .bind(parent_task_id.to_string())
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(|e| BackendError::from_sqlx("wake_parent", e))?;
    Ok(())
}

async fn dead_letter_in_tx(
    conn: &mut PgConnection,
    mut task: Task,
    error: &str,
    execution_state: ExecutionState,
    now: i64,
) -> Result<(), BackendError> {
    let op = "dead_letter";
    task.state = TaskState::Dead;
    task.error = Some(error.to_string());
    task.worker_id = None;
    task.lease_expires_at = None;
    task.updated_at = now;

    let payload = serde_json::to_string(&task).map_err(|e| BackendError::permanent(op, e.to_string()))?;
    sqlx::query(
        "INSERT INTO dead_tasks (task_id, payload, error, created_at) VALUES ($1, $2, $3, $4) \
         ON CONFLICT (task_id) DO UPDATE SET payload = EXCLUDED.payload, error = EXCLUDED.error, \
         created_at = EXCLUDED.created_at",
    )
    .bind(task.id.to_string())
    .bind(payload)
    .bind(error)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(|e| BackendError::from_sqlx(op, e))?;

    sqlx::query(
        "UPDATE tasks SET state = 'dead', error = $1, worker_id = NULL, lease_expires_at = NULL, updated_at = $2 \
         WHERE id = $3",
    )
    .bind(error)
    .bind(now)
    .bind(task.id.to_string())
    .execute(&mut *conn)
    .await
    .map_err(|e| BackendError::from_sqlx(op, e))?;

    if let Some(parent) = task.parent_task_id {
        wake_parent(conn, parent, now).await?;
    } else {
        let sql = format!(
            "UPDATE executions SET state = $1, error = $2, completed_at = $3, updated_at = $4 \
             WHERE id = $5 AND state NOT IN {TERMINAL_EXECUTION_STATES}"
        );
        sqlx::query(&sql)
            .bind(execution_state.as_str())
            .bind(error)
            .bind(now)
            .bind(now)
            .bind(task.execution_id.to_string())
            .execute(&mut *conn)
            .await
            .map_err(|e| BackendError::from_sqlx(op, e))?;
    }
    Ok(())
}

#[async_trait::async_trait]
impl Backend for PostgresBackend {
    async fn init_db(&self) -> Result<(), BackendError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                step_name TEXT NOT NULL,
                args BYTEA NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending',
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL,
                completed_at BIGINT,
                result BYTEA,
                error TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                execution_id TEXT NOT NULL,
                parent_task_id TEXT,
                kind TEXT NOT NULL,
                step_name TEXT NOT NULL,
                args BYTEA NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending',
                attempt INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                scheduled_for BIGINT NOT NULL,
                expires_at BIGINT,
                lease_expires_at BIGINT,
                worker_id TEXT,
                queue TEXT NOT NULL DEFAULT 'default',
                priority INTEGER NOT NULL DEFAULT 0,
                tags TEXT NOT NULL DEFAULT '[]',
                idempotency_key TEXT,
                cache_key TEXT,
                concurrency_group TEXT,
                result BYTEA,
                error TEXT,
                progress TEXT NOT NULL DEFAULT '[]',
                created_at BIGINT NOT NULL,
                updated_at BIGINT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS task_progress (
                task_id TEXT NOT NULL,
                step_index BIGINT NOT NULL,
                record TEXT NOT NULL,
                PRIMARY KEY (task_id, step_index)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS dead_tasks (
                task_id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                error TEXT NOT NULL,
                created_at BIGINT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS cache (
                key TEXT PRIMARY KEY,
                value BYTEA NOT NULL,
                created_at BIGINT NOT NULL,
                ttl_ms BIGINT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS signals (
                seq BIGSERIAL PRIMARY KEY,
                execution_id TEXT NOT NULL,
                name TEXT NOT NULL,
                payload BYTEA NOT NULL,
                created_at BIGINT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS execution_counters (
                execution_id TEXT NOT NULL,
                name TEXT NOT NULL,
                value BIGINT NOT NULL DEFAULT 0,
                PRIMARY KEY (execution_id, name)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS execution_state (
                execution_id TEXT NOT NULL,
                key TEXT NOT NULL,
                value BYTEA NOT NULL,
                PRIMARY KEY (execution_id, key)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_tasks_claim ON tasks(state, scheduled_for, queue, priority)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_group ON tasks(concurrency_group, state, lease_expires_at)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_execution ON tasks(execution_id)",
            "CREATE INDEX IF NOT EXISTS idx_executions_state ON executions(state, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_dead_tasks_created ON dead_tasks(created_at)",
            "CREATE INDEX IF NOT EXISTS idx_signals_lookup ON signals(execution_id, name, seq)",
        ];
        for sql in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| BackendError::from_sqlx("init_db", e))?;
        }
        Ok(())
    }

    async fn create_execution_with_root_task(
        &self,
        execution: &Execution,
        task: &Task,
    ) -> Result<(), BackendError> {
        let op = "create_execution_with_root_task";
        let mut tx = self.pool.begin().await.map_err(|e| BackendError::from_sqlx(op, e))?;
        sqlx::query(
            "INSERT INTO executions (id, step_name, args, state, created_at, updated_at, completed_at, result, error) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(execution.id.to_string())
        .bind(&execution.step_name)
        .bind(execution.args.as_bytes())
        .bind(execution.state.as_str())
        .bind(execution.created_at)
        .bind(execution.updated_at)
        .bind(execution.completed_at)
        .bind(execution.result.as_ref().map(|p| p.as_bytes().to_vec()))
        .bind(execution.error.as_deref())
        .execute(&mut *tx)
        .await
        .map_err(|e| BackendError::from_sqlx(op, e))?;

        insert_task(&mut tx, op, task).await?;
        tx.commit().await.map_err(|e| BackendError::from_sqlx(op, e))
    }

    async fn claim_next_task(
        &self,
        worker_id: &str,
        queues: &[String],
        tags: &[String],
        lease: Duration,
        limits: &HashMap<String, u32>,
    ) -> Result<Option<Task>, BackendError> {
        let op = "claim_next_task";
        let now = now_ms();
        let mut tx = self.pool.begin().await.map_err(|e| BackendError::from_sqlx(op, e))?;

        let mut sql = String::from(
            "SELECT * FROM tasks WHERE state = 'pending' AND scheduled_for <= $1 \
             AND (lease_expires_at IS NULL OR lease_expires_at <= $1)",
        );
        if !queues.is_empty() {
            sql.push_str(" AND queue = ANY($2)");
        }
        sql.push_str(" ORDER BY priority DESC, scheduled_for ASC, created_at ASC");
        sql.push_str(&format!(" LIMIT {CLAIM_SCAN_LIMIT} FOR UPDATE SKIP LOCKED"));

        let mut query = sqlx::query(&sql).bind(now);
        if !queues.is_empty() {
            query = query.bind(queues.to_vec());
        }
        let rows = query.fetch_all(&mut *tx).await.map_err(|e| BackendError::from_sqlx(op, e))?;

        for row in &rows {
            let task = task_from_row(row)?;

            if !tags.iter().all(|t| task.tags.contains(t)) {
                continue;
            }

            if let Some(expires_at) = task.expires_at {
                if expires_at <= now {
                    dead_letter_in_tx(&mut tx, task, "task expired before completion", ExecutionState::TimedOut, now)
                        .await?;
                    continue;
                }
            }

            if let Some(group) = task.concurrency_group.as_deref() {
                if let Some(&limit) = limits.get(group) {
                    let running: i64 = sqlx::query_scalar(
                        "SELECT COUNT(*) FROM tasks WHERE concurrency_group = $1 AND state = 'running' AND lease_expires_at > $2",
                    )
                    .bind(group)
                    .bind(now)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| BackendError::from_sqlx(op, e))?;
                    if running >= limit as i64 {
                        continue;
                    }
                }
            }

            let lease_expires_at = now + lease.as_millis() as i64;
            let updated = sqlx::query(
                "UPDATE tasks SET state = 'running', worker_id = $1, lease_expires_at = $2, updated_at = $3 \
                 WHERE id = $4 AND state = 'pending'",
            )
            .bind(worker_id)
            .bind(lease_expires_at)
            .bind(now)
            .bind(task.id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| BackendError::from_sqlx(op, e))?;
            if updated.rows_affected() != 1 {
                continue;
            }

            sqlx::query("UPDATE executions SET state = 'running', updated_at = $1 WHERE id = $2 AND state = 'pending'")
                .bind(now)
                .bind(task.execution_id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(|e| BackendError::from_sqlx(op, e))?;

            tx.commit().await.map_err(|e| BackendError::from_sqlx(op, e))?;

            debug!(
                target: "senpuki::backend::postgres",
                task_id = %task.id,
                step_name = %task.step_name,
                worker_id = %worker_id,
                "claimed task"
            );

            let mut claimed = task;
            claimed.state = TaskState::Running;
            claimed.worker_id = Some(worker_id.to_string());
            claimed.lease_expires_at = Some(lease_expires_at);
            claimed.updated_at = now;
            return Ok(Some(claimed));
        }

        tx.commit().await.map_err(|e| BackendError::from_sqlx(op, e))?;
        Ok(None)
    }

    async fn renew_lease(
        &self,
        task_id: Uuid,
        worker_id: &str,
        extend: Duration,
    ) -> Result<LeaseState, BackendError> {
        let op = "renew_lease";
        let now = now_ms();
        let new_expiry = now + extend.as_millis() as i64;
        let res = sqlx::query(
            "UPDATE tasks SET lease_expires_at = $1, updated_at = $2 \
             WHERE id = $3 AND state = 'running' AND worker_id = $4 AND lease_expires_at > $5",
        )
        .bind(new_expiry)
        .bind(now)
        .bind(task_id.to_string())
        .bind(worker_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| BackendError::from_sqlx(op, e))?;
        if res.rows_affected() == 1 {
            Ok(LeaseState::Renewed)
        } else {
            Ok(LeaseState::Lost)
        }
    }

    async fn complete_task(&self, task_id: Uuid, worker_id: &str, result: &Payload) -> Result<(), BackendError> {
        let op = "complete_task";
        let now = now_ms();
        let mut tx = self.pool.begin().await.map_err(|e| BackendError::from_sqlx(op, e))?;

        let res = sqlx::query(
            "UPDATE tasks SET state = 'completed', result = $1, error = NULL, worker_id = NULL, \
             lease_expires_at = NULL, updated_at = $2 WHERE id = $3 AND state = 'running' AND worker_id = $4",
        )
        .bind(result.as_bytes())
        .bind(now)
        .bind(task_id.to_string())
        .bind(worker_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| BackendError::from_sqlx(op, e))?;
        if res.rows_affected() != 1 {
            return Err(BackendError::permanent(op, "task is not running under this worker"));
        }

        let row = sqlx::query("SELECT execution_id, parent_task_id FROM tasks WHERE id = $1")
            .bind(task_id.to_string())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| BackendError::from_sqlx(op, e))?;
        let execution_id: String = row.try_get("execution_id").map_err(|e| BackendError::from_sqlx(op, e))?;
        let parent: Option<String> = row.try_get("parent_task_id").map_err(|e| BackendError::from_sqlx(op, e))?;

        if let Some(parent) = parent {
            wake_parent(&mut tx, parse_uuid(op, &parent)?, now).await?;
        } else {
            let sql = format!(
                "UPDATE executions SET state = 'completed', result = $1, error = NULL, completed_at = $2, \
                 updated_at = $3 WHERE id = $4 AND state NOT IN {TERMINAL_EXECUTION_STATES}"
            );
            sqlx::query(&sql)
                .bind(result.as_bytes())
                .bind(now)
                .bind(now)
                .bind(&execution_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| BackendError::from_sqlx(op, e))?;
        }

        tx.commit().await.map_err(|e| BackendError::from_sqlx(op, e))
    }

    async fn fail_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        error: &str,
        disposition: FailureDisposition,
    ) -> Result<(), BackendError> {
        let op = "fail_task";
        let now = now_ms();
        let mut tx = self.pool.begin().await.map_err(|e| BackendError::from_sqlx(op, e))?;

        let row = sqlx::query("SELECT * FROM tasks WHERE id = $1 AND state = 'running' AND worker_id = $2 FOR UPDATE")
            .bind(task_id.to_string())
            .bind(worker_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| BackendError::from_sqlx(op, e))?
            .ok_or_else(|| BackendError::permanent(op, "task is not running under this worker"))?;
        let task = task_from_row(&row)?;

        match disposition {
            FailureDisposition::Retry { at } => {
                sqlx::query(
                    "UPDATE tasks SET state = 'pending', attempt = attempt + 1, worker_id = NULL, \
                     lease_expires_at = NULL, scheduled_for = $1, error = $2, updated_at = $3 WHERE id = $4",
                )
                .bind(at)
                .bind(error)
                .bind(now)
                .bind(task_id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(|e| BackendError::from_sqlx(op, e))?;
            }
            FailureDisposition::Dead { execution_state } => {
                dead_letter_in_tx(&mut tx, task, error, execution_state, now).await?;
            }
            FailureDisposition::Cancelled => {
                sqlx::query(
                    "UPDATE tasks SET state = 'failed', worker_id = NULL, lease_expires_at = NULL, \
                     error = $1, updated_at = $2 WHERE id = $3",
                )
                .bind(error)
                .bind(now)
                .bind(task_id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(|e| BackendError::from_sqlx(op, e))?;
                if let Some(parent) = task.parent_task_id {
                    wake_parent(&mut tx, parent, now).await?;
                }
            }
        }

        tx.commit().await.map_err(|e| BackendError::from_sqlx(op, e))
    }

    async fn suspend_task(
        &self,
        task_id: Uuid,
        worker_id: &str,
        progress: &[StepRecord],
        scheduled_for: i64,
        children: &[Task],
    ) -> Result<(), BackendError> {
        let op = "suspend_task";
        let now = now_ms();
        let mut tx = self.pool.begin().await.map_err(|e| BackendError::from_sqlx(op, e))?;

        let excess = progress.len().saturating_sub(PROGRESS_HOT_CAP);
        let (archived, hot) = progress.split_at(excess);
        for record in archived {
            let body = serde_json::to_string(record).map_err(|e| BackendError::permanent(op, e.to_string()))?;
            sqlx::query(
                "INSERT INTO task_progress (task_id, step_index, record) VALUES ($1, $2, $3) \
                 ON CONFLICT (task_id, step_index) DO UPDATE SET record = EXCLUDED.record",
            )
            .bind(task_id.to_string())
            .bind(record.index as i64)
            .bind(body)
            .execute(&mut *tx)
            .await
            .map_err(|e| BackendError::from_sqlx(op, e))?;
        }

        let hot_json = serde_json::to_string(hot).map_err(|e| BackendError::permanent(op, e.to_string()))?;
        let res = sqlx::query(
            "UPDATE tasks SET state = 'pending', worker_id = NULL, lease_expires_at = NULL, \
             scheduled_for = $1, progress = $2, updated_at = $3 WHERE id = $4 AND state = 'running' AND worker_id = $5",
        )
        .bind(scheduled_for)
        .bind(hot_json)
        .bind(now)
        .bind(task_id.to_string())
        .bind(worker_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| BackendError::from_sqlx(op, e))?;
        if res.rows_affected() != 1 {
            return Err(BackendError::permanent(op, "task is not running under this worker"));
        }

        for child in children {
            insert_task(&mut tx, op, child).await?;
        }

        tx.commit().await.map_err(|e| BackendError::from_sqlx(op, e))
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, BackendError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = $1")
            .bind(task_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BackendError::from_sqlx("get_task", e))?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn load_progress(&self, task_id: Uuid) -> Result<Vec<StepRecord>, BackendError> {
        let op = "load_progress";
        let rows = sqlx::query("SELECT record FROM task_progress WHERE task_id = $1 ORDER BY step_index ASC")
            .bind(task_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| BackendError::from_sqlx(op, e))?;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let body: String = row.try_get("record").map_err(|e| BackendError::from_sqlx(op, e))?;
            records.push(
                serde_json::from_str(&body).map_err(|e| BackendError::permanent(op, format!("bad record: {e}")))?,
            );
        }
        let hot: Option<String> = sqlx::query_scalar("SELECT progress FROM tasks WHERE id = $1")
            .bind(task_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BackendError::from_sqlx(op, e))?;
        if let Some(hot) = hot {
            let hot: Vec<StepRecord> =
                serde_json::from_str(&hot).map_err(|e| BackendError::permanent(op, format!("bad progress: {e}")))?;
            records.extend(hot);
        }
        Ok(records)
    }

    async fn list_tasks(&self, execution_id: Uuid) -> Result<Vec<Task>, BackendError> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE execution_id = $1 ORDER BY created_at ASC")
            .bind(execution_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| BackendError::from_sqlx("list_tasks", e))?;
        rows.iter().map(task_from_row).collect()
    }

    async fn update_task(&self, task: &Task) -> Result<(), BackendError> {
        let op = "update_task";
        let tags = serde_json::to_string(&task.tags).map_err(|e| BackendError::permanent(op, e.to_string()))?;
        let progress =
            serde_json::to_string(&task.progress).map_err(|e| BackendError::permanent(op, e.to_string()))?;
        sqlx::query(
            "UPDATE tasks SET state = $1, attempt = $2, max_attempts = $3, scheduled_for = $4, expires_at = $5, \
             lease_expires_at = $6, worker_id = $7, queue = $8, priority = $9, tags = $10, result = $11, \
             error = $12, progress = $13, updated_at = $14 WHERE id = $15",
        )
        .bind(task.state.as_str())
        .bind(task.attempt as i32)
        .bind(task.max_attempts as i32)
        .bind(task.scheduled_for)
        .bind(task.expires_at)
        .bind(task.lease_expires_at)
        .bind(task.worker_id.as_deref())
        .bind(&task.queue)
        .bind(task.priority)
        .bind(tags)
        .bind(task.result.as_ref().map(|p| p.as_bytes().to_vec()))
        .bind(task.error.as_deref())
        .bind(progress)
        .bind(now_ms())
        .bind(task.id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| BackendError::from_sqlx(op, e))?;
        Ok(())
    }

    async fn count_executions(&self, state: Option<ExecutionState>) -> Result<u64, BackendError> {
        let op = "count_executions";
        let count: i64 = match state {
            Some(state) => sqlx::query_scalar("SELECT COUNT(*) FROM executions WHERE state = $1")
                .bind(state.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(|e| BackendError::from_sqlx(op, e))?,
            None => sqlx::query_scalar("SELECT COUNT(*) FROM executions")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| BackendError::from_sqlx(op, e))?,
        };
        Ok(count as u64)
    }

    async fn list_executions(
        &self,
        state: Option<ExecutionState>,
        limit: u32,
    ) -> Result<Vec<Execution>, BackendError> {
        let op = "list_executions";
        let rows = match state {
            Some(state) => {
                sqlx::query("SELECT * FROM executions WHERE state = $1 ORDER BY created_at DESC LIMIT $2")
                    .bind(state.as_str())
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query("SELECT * FROM executions ORDER BY created_at DESC LIMIT $1")
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(|e| BackendError::from_sqlx(op, e))?;
        rows.iter().map(execution_from_row).collect()
    }

    async fn count_dead_tasks(&self) -> Result<u64, BackendError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_tasks")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| BackendError::from_sqlx("count_dead_tasks", e))?;
        Ok(count as u64)
    }

    async fn list_dead_letters(&self, limit: u32) -> Result<Vec<DeadLetter>, BackendError> {
        let op = "list_dead_letters";
        let rows = sqlx::query("SELECT * FROM dead_tasks ORDER BY created_at DESC LIMIT $1")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| BackendError::from_sqlx(op, e))?;
        rows.iter().map(|row| dead_letter_from_row(op, row)).collect()
    }

    async fn get_dead_letter(&self, task_id: Uuid) -> Result<Option<DeadLetter>, BackendError> {
        let op = "get_dead_letter";
        let row = sqlx::query("SELECT * FROM dead_tasks WHERE task_id = $1")
            .bind(task_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BackendError::from_sqlx(op, e))?;
        row.as_ref().map(|row| dead_letter_from_row(op, row)).transpose()
    }

    async fn delete_dead_letter(&self, task_id: Uuid) -> Result<bool, BackendError> {
        let res = sqlx::query("DELETE FROM dead_tasks WHERE task_id = $1")
            .bind(task_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| BackendError::from_sqlx("delete_dead_letter", e))?;
        Ok(res.rows_affected() > 0)
    }

    async fn replay_dead_letter(&self, task_id: Uuid, queue: Option<&str>) -> Result<Task, BackendError> {
        let op = "replay_dead_letter";
        let now = now_ms();
        let mut tx = self.pool.begin().await.map_err(|e| BackendError::from_sqlx(op, e))?;

        let payload: Option<String> = sqlx::query_scalar("SELECT payload FROM dead_tasks WHERE task_id = $1")
            .bind(task_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| BackendError::from_sqlx(op, e))?;
        let payload = payload.ok_or_else(|| BackendError::permanent(op, format!("no dead letter {task_id}")))?;
        let snapshot: Task =
            serde_json::from_str(&payload).map_err(|e| BackendError::permanent(op, format!("bad snapshot: {e}")))?;

        let mut task = snapshot;
        task.id = Uuid::new_v4();
        task.state = TaskState::Pending;
        task.attempt = 0;
        task.scheduled_for = now;
        task.lease_expires_at = None;
        task.worker_id = None;
        task.result = None;
        task.error = None;
        task.progress = Vec::new();
        task.created_at = now;
        task.updated_at = now;
        if let Some(queue) = queue {
            task.queue = queue.to_string();
        }
        insert_task(&mut tx, op, &task).await?;

        if task.parent_task_id.is_none() {
            sqlx::query(
                "UPDATE executions SET state = 'pending', result = NULL, error = NULL, completed_at = NULL, \
                 updated_at = $1 WHERE id = $2",
            )
            .bind(now)
            .bind(task.execution_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| BackendError::from_sqlx(op, e))?;
        }

        tx.commit().await.map_err(|e| BackendError::from_sqlx(op, e))?;
        Ok(task)
    }

    async fn set_execution_state(
        &self,
        execution_id: Uuid,
        state: ExecutionState,
        error: Option<&str>,
    ) -> Result<(), BackendError> {
        let op = "set_execution_state";
        let now = now_ms();
        let completed_at = if state.is_terminal() { Some(now) } else { None };
        let sql = format!(
            "UPDATE executions SET state = $1, error = COALESCE($2, error), \
             completed_at = COALESCE($3, completed_at), updated_at = $4 \
             WHERE id = $5 AND state NOT IN {TERMINAL_EXECUTION_STATES}"
        );
        sqlx::query(&sql)
            .bind(state.as_str())
            .bind(error)
            .bind(completed_at)
            .bind(now)
            .bind(execution_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| BackendError::from_sqlx(op, e))?;
        Ok(())
    }

    async fn set_execution_result(
        &self,
        execution_id: Uuid,
        state: ExecutionState,
        result: Option<&Payload>,
        error: Option<&str>,
    ) -> Result<(), BackendError> {
        let op = "set_execution_result";
        let now = now_ms();
        let sql = format!(
            "UPDATE executions SET state = $1, result = $2, error = $3, completed_at = $4, updated_at = $5 \
             WHERE id = $6 AND state NOT IN {TERMINAL_EXECUTION_STATES}"
        );
        sqlx::query(&sql)
            .bind(state.as_str())
            .bind(result.map(|p| p.as_bytes().to_vec()))
            .bind(error)
            .bind(if state.is_terminal() { Some(now) } else { None })
            .bind(now)
            .bind(execution_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| BackendError::from_sqlx(op, e))?;
        Ok(())
    }

    async fn get_execution_state(&self, execution_id: Uuid) -> Result<Option<ExecutionView>, BackendError> {
        let op = "get_execution_state";
        let row = sqlx::query("SELECT * FROM executions WHERE id = $1")
            .bind(execution_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BackendError::from_sqlx(op, e))?;
        let Some(row) = row else { return Ok(None) };
        let execution = execution_from_row(&row)?;

        let mut counters = HashMap::new();
        let rows = sqlx::query("SELECT name, value FROM execution_counters WHERE execution_id = $1")
            .bind(execution_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| BackendError::from_sqlx(op, e))?;
        for row in rows {
            let name: String = row.try_get("name").map_err(|e| BackendError::from_sqlx(op, e))?;
            let value: i64 = row.try_get("value").map_err(|e| BackendError::from_sqlx(op, e))?;
            counters.insert(name, value);
        }

        let mut custom_state = HashMap::new();
        let rows = sqlx::query("SELECT key, value FROM execution_state WHERE execution_id = $1")
            .bind(execution_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| BackendError::from_sqlx(op, e))?;
        for row in rows {
            let key: String = row.try_get("key").map_err(|e| BackendError::from_sqlx(op, e))?;
            let value: Vec<u8> = row.try_get("value").map_err(|e| BackendError::from_sqlx(op, e))?;
            custom_state.insert(key, Payload::from_bytes(value));
        }

        Ok(Some(ExecutionView { execution, counters, custom_state }))
    }

    async fn add_counter(&self, execution_id: Uuid, name: &str, delta: i64) -> Result<(), BackendError> {
        sqlx::query(
            "INSERT INTO execution_counters (execution_id, name, value) VALUES ($1, $2, $3) \
             ON CONFLICT (execution_id, name) DO UPDATE SET value = execution_counters.value + EXCLUDED.value",
        )
        .bind(execution_id.to_string())
        .bind(name)
        .bind(delta)
        .execute(&self.pool)
        .await
        .map_err(|e| BackendError::from_sqlx("add_counter", e))?;
        Ok(())
    }

    async fn set_custom_state(&self, execution_id: Uuid, key: &str, value: &Payload) -> Result<(), BackendError> {
        sqlx::query(
            "INSERT INTO execution_state (execution_id, key, value) VALUES ($1, $2, $3) \
             ON CONFLICT (execution_id, key) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(execution_id.to_string())
        .bind(key)
        .bind(value.as_bytes())
        .execute(&self.pool)
        .await
        .map_err(|e| BackendError::from_sqlx("set_custom_state", e))?;
        Ok(())
    }

    async fn send_signal(&self, execution_id: Uuid, name: &str, payload: &Payload) -> Result<(), BackendError> {
        let op = "send_signal";
        let now = now_ms();
        let mut tx = self.pool.begin().await.map_err(|e| BackendError::from_sqlx(op, e))?;
        sqlx::query("INSERT INTO signals (execution_id, name, payload, created_at) VALUES ($1, $2, $3, $4)")
            .bind(execution_id.to_string())
            .bind(name)
            .bind(payload.as_bytes())
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| BackendError::from_sqlx(op, e))?;
        sqlx::query(
            "UPDATE tasks SET scheduled_for = $1, updated_at = $2 \
             WHERE execution_id = $3 AND kind = 'orchestrator' AND state = 'pending' AND scheduled_for > $4",
        )
        .bind(now)
        .bind(now)
        .bind(execution_id.to_string())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| BackendError::from_sqlx(op, e))?;
        tx.commit().await.map_err(|e| BackendError::from_sqlx(op, e))
    }

    async fn consume_signal(&self, execution_id: Uuid, name: &str) -> Result<Option<Payload>, BackendError> {
        let op = "consume_signal";
        // Single statement: pop the oldest row atomically.
        let row = sqlx::query(
            "DELETE FROM signals WHERE seq = ( \
                 SELECT seq FROM signals WHERE execution_id = $1 AND name = $2 \
                 ORDER BY seq ASC LIMIT 1 FOR UPDATE SKIP LOCKED \
             ) RETURNING payload",
        )
        .bind(execution_id.to_string())
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BackendError::from_sqlx(op, e))?;
        Ok(row.map(|row| {
            let payload: Vec<u8> = row.get("payload");
            Payload::from_bytes(payload)
        }))
    }

    async fn get_cache(&self, key: &str) -> Result<Option<Payload>, BackendError> {
        let op = "get_cache";
        let row = sqlx::query("SELECT value, created_at, ttl_ms FROM cache WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BackendError::from_sqlx(op, e))?;
        let Some(row) = row else { return Ok(None) };
        let created_at: i64 = row.try_get("created_at").map_err(|e| BackendError::from_sqlx(op, e))?;
        let ttl_ms: Option<i64> = row.try_get("ttl_ms").map_err(|e| BackendError::from_sqlx(op, e))?;
        if let Some(ttl_ms) = ttl_ms {
            if created_at + ttl_ms <= now_ms() {
                return Ok(None);
            }
        }
        let value: Vec<u8> = row.try_get("value").map_err(|e| BackendError::from_sqlx(op, e))?;
        Ok(Some(Payload::from_bytes(value)))
    }

    async fn put_cache(&self, key: &str, value: &Payload, ttl: Option<Duration>) -> Result<(), BackendError> {
        sqlx::query(
            "INSERT INTO cache (key, value, created_at, ttl_ms) VALUES ($1, $2, $3, $4) ON CONFLICT (key) DO NOTHING",
        )
        .bind(key)
        .bind(value.as_bytes())
        .bind(now_ms())
        .bind(ttl.map(|t| t.as_millis() as i64))
        .execute(&self.pool)
        .await
        .map_err(|e| BackendError::from_sqlx("put_cache", e))?;
        Ok(())
    }

    async fn cleanup_executions(&self, older_than: Duration) -> Result<u64, BackendError> {
        let op = "cleanup_executions";
        let cutoff = now_ms() - older_than.as_millis() as i64;
        let mut tx = self.pool.begin().await.map_err(|e| BackendError::from_sqlx(op, e))?;

        let filter = format!(
            "SELECT id FROM executions WHERE state IN {TERMINAL_EXECUTION_STATES} AND completed_at IS NOT NULL AND completed_at < $1"
        );
        for sql in [
            format!("DELETE FROM task_progress WHERE task_id IN (SELECT id FROM tasks WHERE execution_id IN ({filter}))"),
            format!("DELETE FROM tasks WHERE execution_id IN ({filter})"),
            format!("DELETE FROM signals WHERE execution_id IN ({filter})"),
            format!("DELETE FROM execution_counters WHERE execution_id IN ({filter})"),
            format!("DELETE FROM execution_state WHERE execution_id IN ({filter})"),
        ] {
            sqlx::query(&sql)
                .bind(cutoff)
                .execute(&mut *tx)
                .await
                .map_err(|e| BackendError::from_sqlx(op, e))?;
        }
        let sql = format!(
            "DELETE FROM executions WHERE state IN {TERMINAL_EXECUTION_STATES} AND completed_at IS NOT NULL AND completed_at < $1"
        );
        let res = sqlx::query(&sql)
            .bind(cutoff)
            .execute(&mut *tx)
            .await
            .map_err(|e| BackendError::from_sqlx(op, e))?;

        tx.commit().await.map_err(|e| BackendError::from_sqlx(op, e))?;
        Ok(res.rows_affected())
    }
}

fn dead_letter_from_row(op: &str, row: &PgRow) -> Result<DeadLetter, BackendError> {
    let task_id: String = row.try_get("task_id").map_err(|e| BackendError::from_sqlx(op, e))?;
    let payload: String = row.try_get("payload").map_err(|e| BackendError::from_sqlx(op, e))?;
    Ok(DeadLetter {
        task_id: parse_uuid(op, &task_id)?,
        task: serde_json::from_str(&payload)
            .map_err(|e| BackendError::permanent(op, format!("bad snapshot: {e}")))?,
        error: row.try_get("error").map_err(|e| BackendError::from_sqlx(op, e))?,
        created_at: row.try_get("created_at").map_err(|e| BackendError::from_sqlx(op, e))?,
    })
}
