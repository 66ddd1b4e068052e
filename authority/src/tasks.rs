//! SQLite task and thought store.
//!
//! Deferrals live on task rows: `status = 'deferred'` with an embedded
//! `deferral` record in `context_json`.

use chrono::{DateTime, Utc};
use fabric_contracts::{AuthorityError, Task};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::store::db_err;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    task_id TEXT PRIMARY KEY,
    channel_id TEXT,
    description TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    priority INTEGER NOT NULL DEFAULT 0,
    context_json TEXT,
    signed_by TEXT,
    signature TEXT,
    signed_at TEXT,
    parent_task_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

CREATE TABLE IF NOT EXISTS thoughts (
    thought_id TEXT PRIMARY KEY,
    task_id TEXT,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_thoughts_status ON thoughts(status);
"#;

/// Task table access used by the wise authority service and task signing.
#[derive(Clone)]
pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    pub async fn new(pool: SqlitePool) -> Result<Self, AuthorityError> {
        sqlx::query(SCHEMA).execute(&pool).await.map_err(db_err)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn insert(&self, task: &Task) -> Result<(), AuthorityError> {
        sqlx::query(
            "INSERT INTO tasks (task_id, channel_id, description, status, priority, \
             context_json, signed_by, signature, signed_at, parent_task_id, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&task.task_id)
        .bind(&task.channel_id)
        .bind(&task.description)
        .bind(&task.status)
        .bind(task.priority)
        .bind(task.context.as_ref().map(|c| c.to_string()))
        .bind(&task.signed_by)
        .bind(&task.signature)
        .bind(&task.signed_at)
        .bind(&task.parent_task_id)
        .bind(task.created_at.to_rfc3339())
        .bind(task.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    pub async fn get(&self, task_id: &str) -> Result<Option<Task>, AuthorityError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| task_from_row(&r)).transpose()
    }

    pub async fn count_by_status(&self, status: &str) -> Result<u64, AuthorityError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks WHERE status = ?")
            .bind(status)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(count.max(0) as u64)
    }

    pub async fn set_signature(
        &self,
        task_id: &str,
        signed_by: &str,
        signature: &str,
        signed_at: &str,
    ) -> Result<bool, AuthorityError> {
        let result = sqlx::query(
            "UPDATE tasks SET signed_by = ?, signature = ?, signed_at = ? WHERE task_id = ?",
        )
        .bind(signed_by)
        .bind(signature)
        .bind(signed_at)
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }
}

pub(crate) fn task_from_row(row: &SqliteRow) -> Result<Task, AuthorityError> {
    let context_json: Option<String> = row.try_get("context_json").map_err(db_err)?;
    let context = context_json
        .as_deref()
        .and_then(|raw| serde_json::from_str(raw).ok());

    Ok(Task {
        task_id: row.try_get("task_id").map_err(db_err)?,
        channel_id: row.try_get("channel_id").map_err(db_err)?,
        description: row.try_get("description").map_err(db_err)?,
        status: row.try_get("status").map_err(db_err)?,
        priority: row.try_get("priority").map_err(db_err)?,
        context,
        signed_by: row.try_get("signed_by").map_err(db_err)?,
        signature: row.try_get("signature").map_err(db_err)?,
        signed_at: row.try_get("signed_at").map_err(db_err)?,
        parent_task_id: row.try_get("parent_task_id").map_err(db_err)?,
        created_at: parse_ts(row, "created_at")?,
        updated_at: parse_ts(row, "updated_at")?,
    })
}

fn parse_ts(row: &SqliteRow, column: &str) -> Result<DateTime<Utc>, AuthorityError> {
    let raw: String = row.try_get(column).map_err(db_err)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| AuthorityError::Storage(format!("bad {} timestamp: {}", column, e)))
}
