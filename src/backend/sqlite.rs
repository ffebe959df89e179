//! Embedded single-file backend over SQLite.
//!
//! Claim transactions take an immediate write lock (`BEGIN IMMEDIATE`) and
//! are additionally serialised through an in-process mutex, so two claimants
//! can never select the same row. All binary payloads round-trip unmodified.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{Backend, BackendError, ExecutionView, FailureDisposition, LeaseState};
use crate::codec::Payload;
use crate::{
    now_ms, DeadLetter, Execution, ExecutionState, StepRecord, Task, TaskKind, TaskState, PROGRESS_HOT_CAP,
};

const TERMINAL_EXECUTION_STATES: &str = "('completed','failed','timed_out','cancelled')";

/// How many eligible rows one claim transaction inspects before giving up.
/// Skipped candidates (tag mismatch, concurrency limit) stay pending for the
/// next poll.
const CLAIM_SCAN_LIMIT: i64 = 64;

const INSERT_TASK_SQL: &str = r#"
    INSERT INTO tasks (
        id, execution_id, parent_task_id, kind, step_name, args, state,
        attempt, max_attempts, scheduled_for, expires_at, lease_expires_at,
        worker_id, queue, priority, tags, idempotency_key, cache_key,
        concurrency_group, result, error, progress, created_at, updated_at
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    "#;

pub struct SqliteBackend {
    pool: SqlitePool,
    /// Serialises claim transactions in-process; cross-process exclusion
    /// comes from the immediate transaction's write lock.
    claim_lock: Mutex<()>,
}

impl SqliteBackend {
    /// Open (and create if missing) the store at the given connection
    /// string, e.g. `sqlite://senpuki.db` or `sqlite::memory:`.
    pub async fn connect(database_url: &str) -> Result<SqliteBackend, BackendError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| BackendError::from_sqlx("connect", e))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5))
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        // A shared in-memory database only exists on one connection.
        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let max_connections = if in_memory { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| BackendError::from_sqlx("connect", e))?;

        Ok(SqliteBackend { pool, claim_lock: Mutex::new(()) })
    }

    async fn create_schema(&self) -> Result<(), BackendError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                step_name TEXT NOT NULL,
                args BLOB NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                completed_at INTEGER,
                result BLOB,
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
                args BLOB NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending',
                attempt INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                scheduled_for INTEGER NOT NULL,
                expires_at INTEGER,
                lease_expires_at INTEGER,
                worker_id TEXT,
                queue TEXT NOT NULL DEFAULT 'default',
                priority INTEGER NOT NULL DEFAULT 0,
                tags TEXT NOT NULL DEFAULT '[]',
                idempotency_key TEXT,
                cache_key TEXT,
                concurrency_group TEXT,
                result BLOB,
                error TEXT,
                progress TEXT NOT NULL DEFAULT '[]',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS task_progress (
                task_id TEXT NOT NULL,
                step_index INTEGER NOT NULL,
                record TEXT NOT NULL,
                PRIMARY KEY (task_id, step_index)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS dead_tasks (
                task_id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                error TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS cache (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                created_at INTEGER NOT NULL,
                ttl_ms INTEGER
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS signals (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                execution_id TEXT NOT NULL,
                name TEXT NOT NULL,
                payload BLOB NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS execution_counters (
                execution_id TEXT NOT NULL,
                name TEXT NOT NULL,
                value INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (execution_id, name)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS execution_state (
                execution_id TEXT NOT NULL,
                key TEXT NOT NULL,
                value BLOB NOT NULL,
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
}

fn parse_uuid(op: &str, s: &str) -> Result<Uuid, BackendError> {
    Uuid::parse_str(s).map_err(|e| BackendError::permanent(op, format!("bad uuid {s}: {e}")))
}

fn execution_from_row(row: &SqliteRow) -> Result<Execution, BackendError> {
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

fn task_from_row(row: &SqliteRow) -> Result<Task, BackendError> {
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
        attempt: row.try_get::<i64, _>("attempt").map_err(|e| BackendError::from_sqlx(op, e))? as u32,
        max_attempts: row.try_get::<i64, _>("max_attempts").map_err(|e| BackendError::from_sqlx(op, e))? as u32,
        scheduled_for: row.try_get("scheduled_for").map_err(|e| BackendError::from_sqlx(op, e))?,
        expires_at: row.try_get("expires_at").map_err(|e| BackendError::from_sqlx(op, e))?,
        lease_expires_at: row.try_get("lease_expires_at").map_err(|e| BackendError::from_sqlx(op, e))?,
        worker_id: row.try_get("worker_id").map_err(|e| BackendError::from_sqlx(op, e))?,
        queue: row.try_get("queue").map_err(|e| BackendError::from_sqlx(op, e))?,
        priority: row.try_get::<i64, _>("priority").map_err(|e| BackendError::from_sqlx(op, e))? as i32,
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

async fn insert_task(conn: &mut SqliteConnection, op: &str, task: &Task) -> Result<(), BackendError> {
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
        .bind(task.attempt as i64)
        .bind(task.max_attempts as i64)
        .bind(task.scheduled_for)
        .bind(task.expires_at)
        .bind(task.lease_expires_at)
        .bind(task.worker_id.as_deref())
        .bind(&task.queue)
        .bind(task.priority as i64)
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

/// Wake a parked parent so any worker can reclaim it. Only pending rows
/// scheduled in the future are touched.
async fn wake_parent(conn: &mut SqliteConnection, parent_task_id: Uuid, now: i64) -> Result<(), BackendError> {
    sqlx::query(
        "UPDATE tasks SET scheduled_for = ?, updated_at = ? WHERE id = ? AND state = 'pending' AND scheduled_for > ?",
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

/// Snapshot a task into `dead_tasks` and mark the row dead. For a root task
/// the execution moves to the given terminal state in the same transaction.
async fn dead_letter_in_tx(
    conn: &mut SqliteConnection,
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
    sqlx::query("INSERT OR REPLACE INTO dead_tasks (task_id, payload, error, created_at) VALUES (?, ?, ?, ?)")
        .bind(task.id.to_string())
        .bind(payload)
        .bind(error)
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(|e| BackendError::from_sqlx(op, e))?;

    sqlx::query(
        "UPDATE tasks SET state = 'dead', error = ?, worker_id = NULL, lease_expires_at = NULL, updated_at = ? WHERE id = ?",
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
            "UPDATE executions SET state = ?, error = ?, completed_at = ?, updated_at = ? WHERE id = ? AND state NOT IN {TERMINAL_EXECUTION_STATES}"
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

impl SqliteBackend {
    async fn claim_in_tx(
        &self,
        conn: &mut SqliteConnection,
        worker_id: &str,
        queues: &[String],
        tags: &[String],
        lease: Duration,
        limits: &HashMap<String, u32>,
        now: i64,
    ) -> Result<Option<Task>, BackendError> {
        let op = "claim_next_task";
        let mut sql = String::from(
            "SELECT * FROM tasks WHERE state = 'pending' AND scheduled_for <= ? \
             AND (lease_expires_at IS NULL OR lease_expires_at <= ?)",
        );
        if !queues.is_empty() {
            sql.push_str(" AND queue IN (");
            sql.push_str(&vec!["?"; queues.len()].join(", "));
            sql.push(')');
        }
        sql.push_str(" ORDER BY priority DESC, scheduled_for ASC, created_at ASC LIMIT ?");

        let mut query = sqlx::query(&sql).bind(now).bind(now);
        for queue in queues {
            query = query.bind(queue);
        }
        let rows = query
            .bind(CLAIM_SCAN_LIMIT)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| BackendError::from_sqlx(op, e))?;

        for row in &rows {
            let task = task_from_row(row)?;

            if !tags.iter().all(|t| task.tags.contains(t)) {
                continue;
            }

            // Past its absolute deadline: never hand it out.
            if let Some(expires_at) = task.expires_at {
                if expires_at <= now {
                    dead_letter_in_tx(conn, task, "task expired before completion", ExecutionState::TimedOut, now)
                        .await?;
                    continue;
                }
            }

            if let Some(group) = task.concurrency_group.as_deref() {
                if let Some(&limit) = limits.get(group) {
                    let running: i64 = sqlx::query_scalar(
                        "SELECT COUNT(*) FROM tasks WHERE concurrency_group = ? AND state = 'running' AND lease_expires_at > ?",
                    )
                    .bind(group)
                    .bind(now)
                    .fetch_one(&mut *conn)
                    .await
                    .map_err(|e| BackendError::from_sqlx(op, e))?;
                    if running >= limit as i64 {
                        continue;
                    }
                }
            }

            let lease_expires_at = now + lease.as_millis() as i64;
            let updated = sqlx::query(
                "UPDATE tasks SET state = 'running', worker_id = ?, lease_expires_at = ?, updated_at = ? \
                 WHERE id = ? AND state = 'pending'",
            )
            .bind(worker_id)
            .bind(lease_expires_at)
            .bind(now)
            .bind(task.id.to_string())
            .execute(&mut *conn)
            .await
            .map_err(|e| BackendError::from_sqlx(op, e))?;
            if updated.rows_affected() != 1 {
                continue;
            }

            sqlx::query("UPDATE executions SET state = 'running', updated_at = ? WHERE id = ? AND state = 'pending'")
                .bind(now)
                .bind(task.execution_id.to_string())
                .execute(&mut *conn)
                .await
                .map_err(|e| BackendError::from_sqlx(op, e))?;

            let mut claimed = task;
            claimed.state = TaskState::Running;
            claimed.worker_id = Some(worker_id.to_string());
            claimed.lease_expires_at = Some(lease_expires_at);
            claimed.updated_at = now;
            return Ok(Some(claimed));
        }
        Ok(None)
    }
}

#[async_trait::async_trait]
impl Backend for SqliteBackend {
    async fn init_db(&self) -> Result<(), BackendError> {
        self.create_schema().await
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
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
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
        tx.commit().await.map_err(|e| BackendError::from_sqlx(op, e))?;
        Ok(())
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
        let _guard = self.claim_lock.lock().await;
        let mut conn = self.pool.acquire().await.map_err(|e| BackendError::from_sqlx(op, e))?;

        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .map_err(|e| BackendError::from_sqlx(op, e))?;

        let now = now_ms();
        match self.claim_in_tx(&mut conn, worker_id, queues, tags, lease, limits, now).await {
            Ok(claimed) => {
                sqlx::query("COMMIT")
                    .execute(&mut *conn)
                    .await
                    .map_err(|e| BackendError::from_sqlx(op, e))?;
                if let Some(task) = &claimed {
                    debug!(
                        target: "senpuki::backend::sqlite",
                        task_id = %task.id,
                        step_name = %task.step_name,
                        worker_id = %worker_id,
                        "claimed task"
                    );
                }
                Ok(claimed)
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
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
            "UPDATE tasks SET lease_expires_at = ?, updated_at = ? \
             WHERE id = ? AND state = 'running' AND worker_id = ? AND lease_expires_at > ?",
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
            "UPDATE tasks SET state = 'completed', result = ?, error = NULL, worker_id = NULL, \
             lease_expires_at = NULL, updated_at = ? WHERE id = ? AND state = 'running' AND worker_id = ?",
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

        let row = sqlx::query("SELECT execution_id, parent_task_id FROM tasks WHERE id = ?")
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
                "UPDATE executions SET state = 'completed', result = ?, error = NULL, completed_at = ?, updated_at = ? \
                 WHERE id = ? AND state NOT IN {TERMINAL_EXECUTION_STATES}"
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

        // Touch the row first: takes the write lock at transaction start
        // (no deferred-to-write upgrade) and doubles as the ownership
        // probe.
        let probe = sqlx::query(
            "UPDATE tasks SET updated_at = ? WHERE id = ? AND state = 'running' AND worker_id = ?",
        )
        .bind(now)
        .bind(task_id.to_string())
        .bind(worker_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| BackendError::from_sqlx(op, e))?;
        if probe.rows_affected() != 1 {
            return Err(BackendError::permanent(op, "task is not running under this worker"));
        }
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(task_id.to_string())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| BackendError::from_sqlx(op, e))?;
        let task = task_from_row(&row)?;

        match disposition {
            FailureDisposition::Retry { at } => {
                sqlx::query(
                    "UPDATE tasks SET state = 'pending', attempt = attempt + 1, worker_id = NULL, \
                     lease_expires_at = NULL, scheduled_for = ?, error = ?, updated_at = ? WHERE id = ?",
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
                     error = ?, updated_at = ? WHERE id = ?",
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

        // Spill everything beyond the hot cap to the side table so the row
        // stays small; the hot tail keeps the most recent entries.
        let excess = progress.len().saturating_sub(PROGRESS_HOT_CAP);
        let (archived, hot) = progress.split_at(excess);
        for record in archived {
            let body = serde_json::to_string(record).map_err(|e| BackendError::permanent(op, e.to_string()))?;
            sqlx::query("INSERT OR REPLACE INTO task_progress (task_id, step_index, record) VALUES (?, ?, ?)")
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
             scheduled_for = ?, progress = ?, updated_at = ? WHERE id = ? AND state = 'running' AND worker_id = ?",
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
            // Lease lost mid-turn: the rightful owner will redo this turn.
            return Err(BackendError::permanent(op, "task is not running under this worker"));
        }

        for child in children {
            insert_task(&mut tx, op, child).await?;
        }

        tx.commit().await.map_err(|e| BackendError::from_sqlx(op, e))
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, BackendError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(task_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BackendError::from_sqlx("get_task", e))?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn load_progress(&self, task_id: Uuid) -> Result<Vec<StepRecord>, BackendError> {
        let op = "load_progress";
        let rows = sqlx::query("SELECT record FROM task_progress WHERE task_id = ? ORDER BY step_index ASC")
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
        let hot: Option<String> = sqlx::query_scalar("SELECT progress FROM tasks WHERE id = ?")
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
        let rows = sqlx::query("SELECT * FROM tasks WHERE execution_id = ? ORDER BY created_at ASC")
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
            "UPDATE tasks SET state = ?, attempt = ?, max_attempts = ?, scheduled_for = ?, expires_at = ?, \
             lease_expires_at = ?, worker_id = ?, queue = ?, priority = ?, tags = ?, result = ?, error = ?, \
             progress = ?, updated_at = ? WHERE id = ?",
        )
        .bind(task.state.as_str())
        .bind(task.attempt as i64)
        .bind(task.max_attempts as i64)
        .bind(task.scheduled_for)
        .bind(task.expires_at)
        .bind(task.lease_expires_at)
        .bind(task.worker_id.as_deref())
        .bind(&task.queue)
        .bind(task.priority as i64)
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
            Some(state) => sqlx::query_scalar("SELECT COUNT(*) FROM executions WHERE state = ?")
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
                sqlx::query("SELECT * FROM executions WHERE state = ? ORDER BY created_at DESC LIMIT ?")
                    .bind(state.as_str())
                    .bind(limit as i64)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query("SELECT * FROM executions ORDER BY created_at DESC LIMIT ?")
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
        let rows = sqlx::query("SELECT * FROM dead_tasks ORDER BY created_at DESC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| BackendError::from_sqlx(op, e))?;
        rows.iter().map(|row| dead_letter_from_row(op, row)).collect()
    }

    async fn get_dead_letter(&self, task_id: Uuid) -> Result<Option<DeadLetter>, BackendError> {
        let op = "get_dead_letter";
        let row = sqlx::query("SELECT * FROM dead_tasks WHERE task_id = ?")
            .bind(task_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BackendError::from_sqlx(op, e))?;
        row.as_ref().map(|row| dead_letter_from_row(op, row)).transpose()
    }

    async fn delete_dead_letter(&self, task_id: Uuid) -> Result<bool, BackendError> {
        let res = sqlx::query("DELETE FROM dead_tasks WHERE task_id = ?")
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

        // Touch first so the transaction starts on the write lock.
        sqlx::query("UPDATE dead_tasks SET created_at = created_at WHERE task_id = ?")
            .bind(task_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|e| BackendError::from_sqlx(op, e))?;
        let payload: Option<String> = sqlx::query_scalar("SELECT payload FROM dead_tasks WHERE task_id = ?")
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

        // A root-task replay re-opens its execution so the new run can
        // complete it; operator replay is the sanctioned exception to the
        // write-once rule.
        if task.parent_task_id.is_none() {
            sqlx::query(
                "UPDATE executions SET state = 'pending', result = NULL, error = NULL, completed_at = NULL, \
                 updated_at = ? WHERE id = ?",
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
            "UPDATE executions SET state = ?, error = COALESCE(?, error), \
             completed_at = COALESCE(?, completed_at), updated_at = ? \
             WHERE id = ? AND state NOT IN {TERMINAL_EXECUTION_STATES}"
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
            "UPDATE executions SET state = ?, result = ?, error = ?, completed_at = ?, updated_at = ? \
             WHERE id = ? AND state NOT IN {TERMINAL_EXECUTION_STATES}"
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
        let row = sqlx::query("SELECT * FROM executions WHERE id = ?")
            .bind(execution_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BackendError::from_sqlx(op, e))?;
        let Some(row) = row else { return Ok(None) };
        let execution = execution_from_row(&row)?;

        let mut counters = HashMap::new();
        let rows = sqlx::query("SELECT name, value FROM execution_counters WHERE execution_id = ?")
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
        let rows = sqlx::query("SELECT key, value FROM execution_state WHERE execution_id = ?")
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
            "INSERT INTO execution_counters (execution_id, name, value) VALUES (?, ?, ?) \
             ON CONFLICT(execution_id, name) DO UPDATE SET value = value + excluded.value",
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
        sqlx::query("INSERT OR REPLACE INTO execution_state (execution_id, key, value) VALUES (?, ?, ?)")
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
        sqlx::query("INSERT INTO signals (execution_id, name, payload, created_at) VALUES (?, ?, ?, ?)")
            .bind(execution_id.to_string())
            .bind(name)
            .bind(payload.as_bytes())
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| BackendError::from_sqlx(op, e))?;
        // Wake any parked orchestrator of this execution so it can retry
        // its consume.
        sqlx::query(
            "UPDATE tasks SET scheduled_for = ?, updated_at = ? \
             WHERE execution_id = ? AND kind = 'orchestrator' AND state = 'pending' AND scheduled_for > ?",
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
        // Single statement: pop the oldest row atomically.
        let row = sqlx::query(
            "DELETE FROM signals WHERE seq = ( \
                 SELECT seq FROM signals WHERE execution_id = ? AND name = ? ORDER BY seq ASC LIMIT 1 \
             ) RETURNING payload",
        )
        .bind(execution_id.to_string())
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BackendError::from_sqlx("consume_signal", e))?;
        row.map(|row| {
            let payload: Vec<u8> = row.try_get("payload").map_err(|e| BackendError::from_sqlx("consume_signal", e))?;
            Ok(Payload::from_bytes(payload))
        })
        .transpose()
    }

    async fn get_cache(&self, key: &str) -> Result<Option<Payload>, BackendError> {
        let op = "get_cache";
        let row = sqlx::query("SELECT value, created_at, ttl_ms FROM cache WHERE key = ?")
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
        // Cache entries are write-once per key.
        sqlx::query("INSERT OR IGNORE INTO cache (key, value, created_at, ttl_ms) VALUES (?, ?, ?, ?)")
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
            "SELECT id FROM executions WHERE state IN {TERMINAL_EXECUTION_STATES} AND completed_at IS NOT NULL AND completed_at < ?"
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
            "DELETE FROM executions WHERE state IN {TERMINAL_EXECUTION_STATES} AND completed_at IS NOT NULL AND completed_at < ?"
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

fn dead_letter_from_row(op: &str, row: &SqliteRow) -> Result<DeadLetter, BackendError> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TaskKind;

    async fn create_test_backend() -> SqliteBackend {
        let backend = SqliteBackend::connect("sqlite::memory:").await.expect("connect");
        backend.init_db().await.expect("init_db");
        backend
    }

    fn no_limits() -> HashMap<String, u32> {
        HashMap::new()
    }

    async fn seed_root(backend: &SqliteBackend) -> (Execution, Task) {
        let execution = Execution::new("tests::step", Payload::json(&1u32).unwrap());
        let task = Task::new(execution.id, TaskKind::Activity, "tests::step", execution.args.clone());
        backend.create_execution_with_root_task(&execution, &task).await.unwrap();
        (execution, task)
    }

    #[tokio::test]
    async fn claim_transitions_to_running_with_lease() {
        let backend = create_test_backend().await;
        let (_, task) = seed_root(&backend).await;

        let before = now_ms();
        let claimed = backend
            .claim_next_task("w1", &[], &[], Duration::from_secs(60), &no_limits())
            .await
            .unwrap()
            .expect("one task claimable");
        assert_eq!(claimed.id, task.id);
        assert_eq!(claimed.state, TaskState::Running);
        assert_eq!(claimed.worker_id.as_deref(), Some("w1"));
        assert!(claimed.lease_expires_at.unwrap() >= before + 59_000);

        // No second claim while the lease holds.
        let second = backend
            .claim_next_task("w2", &[], &[], Duration::from_secs(60), &no_limits())
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn complete_root_task_completes_execution() {
        let backend = create_test_backend().await;
        let (execution, _) = seed_root(&backend).await;
        let claimed = backend
            .claim_next_task("w1", &[], &[], Duration::from_secs(60), &no_limits())
            .await
            .unwrap()
            .unwrap();

        let result = Payload::json(&"done").unwrap();
        backend.complete_task(claimed.id, "w1", &result).await.unwrap();

        let view = backend.get_execution_state(execution.id).await.unwrap().unwrap();
        assert_eq!(view.execution.state, ExecutionState::Completed);
        assert_eq!(view.execution.result, Some(result));
    }

    #[tokio::test]
    async fn complete_requires_ownership() {
        let backend = create_test_backend().await;
        seed_root(&backend).await;
        let claimed = backend
            .claim_next_task("w1", &[], &[], Duration::from_secs(60), &no_limits())
            .await
            .unwrap()
            .unwrap();

        let err = backend
            .complete_task(claimed.id, "intruder", &Payload::unit())
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn dead_letter_snapshot_preserves_payload() {
        let backend = create_test_backend().await;
        let execution = Execution::new("tests::doomed", Payload::json(&"args").unwrap());
        let mut task = Task::new(execution.id, TaskKind::Activity, "tests::doomed", execution.args.clone());
        task.queue = "retry".into();
        task.tags = vec!["ops".into()];
        task.idempotency_key = Some("idem-1".into());
        backend.create_execution_with_root_task(&execution, &task).await.unwrap();

        let claimed = backend
            .claim_next_task("w1", &[], &[], Duration::from_secs(60), &no_limits())
            .await
            .unwrap()
            .unwrap();
        backend
            .fail_task(
                claimed.id,
                "w1",
                "boom",
                FailureDisposition::Dead { execution_state: ExecutionState::Failed },
            )
            .await
            .unwrap();

        let letter = backend.get_dead_letter(task.id).await.unwrap().expect("dead letter");
        assert_eq!(letter.task.step_name, "tests::doomed");
        assert_eq!(letter.task.queue, "retry");
        assert_eq!(letter.task.tags, vec!["ops".to_string()]);
        assert_eq!(letter.task.idempotency_key.as_deref(), Some("idem-1"));
        assert_eq!(letter.task.args, task.args);
        assert_eq!(letter.error, "boom");

        let view = backend.get_execution_state(execution.id).await.unwrap().unwrap();
        assert_eq!(view.execution.state, ExecutionState::Failed);
        assert_eq!(backend.count_dead_tasks().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn replay_resets_attempt_and_keeps_snapshot() {
        let backend = create_test_backend().await;
        let (execution, task) = seed_root(&backend).await;
        let claimed = backend
            .claim_next_task("w1", &[], &[], Duration::from_secs(60), &no_limits())
            .await
            .unwrap()
            .unwrap();
        backend
            .fail_task(
                claimed.id,
                "w1",
                "boom",
                FailureDisposition::Dead { execution_state: ExecutionState::Failed },
            )
            .await
            .unwrap();

        let replayed = backend.replay_dead_letter(task.id, Some("retry")).await.unwrap();
        assert_ne!(replayed.id, task.id);
        assert_eq!(replayed.attempt, 0);
        assert_eq!(replayed.state, TaskState::Pending);
        assert_eq!(replayed.queue, "retry");
        // Snapshot row remains until explicitly deleted.
        assert!(backend.get_dead_letter(task.id).await.unwrap().is_some());
        // Execution re-opened for the new run.
        let view = backend.get_execution_state(execution.id).await.unwrap().unwrap();
        assert_eq!(view.execution.state, ExecutionState::Pending);

        assert!(backend.delete_dead_letter(task.id).await.unwrap());
        assert!(backend.get_dead_letter(task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn signals_are_fifo() {
        let backend = create_test_backend().await;
        let (execution, _) = seed_root(&backend).await;
        for i in 0..3u32 {
            backend
                .send_signal(execution.id, "approve", &Payload::json(&i).unwrap())
                .await
                .unwrap();
        }
        for expected in 0..3u32 {
            let got: u32 = backend
                .consume_signal(execution.id, "approve")
                .await
                .unwrap()
                .unwrap()
                .decode()
                .unwrap();
            assert_eq!(got, expected);
        }
        assert!(backend.consume_signal(execution.id, "approve").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cache_is_write_once_and_ttl_expires() {
        let backend = create_test_backend().await;
        backend.put_cache("k", &Payload::json(&1u32).unwrap(), None).await.unwrap();
        backend.put_cache("k", &Payload::json(&2u32).unwrap(), None).await.unwrap();
        let got: u32 = backend.get_cache("k").await.unwrap().unwrap().decode().unwrap();
        assert_eq!(got, 1);

        backend
            .put_cache("ttl", &Payload::json(&9u32).unwrap(), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(backend.get_cache("ttl").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn counters_accumulate_atomically() {
        let backend = create_test_backend().await;
        let (execution, _) = seed_root(&backend).await;
        backend.add_counter(execution.id, "hits", 2).await.unwrap();
        backend.add_counter(execution.id, "hits", 3).await.unwrap();
        let view = backend.get_execution_state(execution.id).await.unwrap().unwrap();
        assert_eq!(view.counters.get("hits"), Some(&5));
    }

    #[tokio::test]
    async fn queue_and_tag_filters_apply() {
        let backend = create_test_backend().await;
        let execution = Execution::new("tests::tagged", Payload::unit());
        let mut task = Task::new(execution.id, TaskKind::Activity, "tests::tagged", Payload::unit());
        task.queue = "reports".into();
        task.tags = vec!["pii".into(), "batch".into()];
        backend.create_execution_with_root_task(&execution, &task).await.unwrap();

        let miss = backend
            .claim_next_task("w1", &["default".into()], &[], Duration::from_secs(5), &no_limits())
            .await
            .unwrap();
        assert!(miss.is_none());

        let miss = backend
            .claim_next_task(
                "w1",
                &["reports".into()],
                &["pii".into(), "archive".into()],
                Duration::from_secs(5),
                &no_limits(),
            )
            .await
            .unwrap();
        assert!(miss.is_none());

        let hit = backend
            .claim_next_task("w1", &["reports".into()], &["pii".into()], Duration::from_secs(5), &no_limits())
            .await
            .unwrap();
        assert!(hit.is_some());
    }

    #[tokio::test]
    async fn concurrency_limit_blocks_claims_in_group() {
        let backend = create_test_backend().await;
        let mut limits = HashMap::new();
        limits.insert("g".to_string(), 1u32);

        for _ in 0..2 {
            let execution = Execution::new("tests::grouped", Payload::unit());
            let mut task = Task::new(execution.id, TaskKind::Activity, "tests::grouped", Payload::unit());
            task.concurrency_group = Some("g".into());
            backend.create_execution_with_root_task(&execution, &task).await.unwrap();
        }

        let first = backend
            .claim_next_task("w1", &[], &[], Duration::from_secs(60), &limits)
            .await
            .unwrap();
        assert!(first.is_some());
        let second = backend
            .claim_next_task("w2", &[], &[], Duration::from_secs(60), &limits)
            .await
            .unwrap();
        assert!(second.is_none(), "group limit must hold the second claim back");

        backend.complete_task(first.unwrap().id, "w1", &Payload::unit()).await.unwrap();
        let third = backend
            .claim_next_task("w2", &[], &[], Duration::from_secs(60), &limits)
            .await
            .unwrap();
        assert!(third.is_some());
    }
}
