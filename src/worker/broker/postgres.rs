//! PostgreSQL task queue
//!
//! Workers claim rows with `FOR UPDATE SKIP LOCKED`, so any number of
//! processors can poll the same table without blocking each other or
//! claiming the same task twice.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use super::TaskBroker;
use crate::worker::error::BrokerError;
use crate::worker::task::{Task, TaskId, TaskInfo, TaskOptions, TaskState};

type PgQuery<'q> = sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>;

pub struct PgTaskBroker {
    pool: PgPool,
}

const TASK_COLUMNS: &str = "id, task_type, payload, queue, state, retried, max_retry, last_error, process_at, created_at, updated_at";

impl PgTaskBroker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_task(row: &PgRow) -> Result<TaskInfo, BrokerError> {
        let id: String = column(row, "id")?;
        let state_id: i16 = column(row, "state")?;
        let retried: i32 = column(row, "retried")?;
        let max_retry: i32 = column(row, "max_retry")?;

        Ok(TaskInfo {
            id: id
                .parse()
                .map_err(|e| BrokerError::Corrupt(format!("task id {}: {}", id, e)))?,
            task_type: column(row, "task_type")?,
            payload: column(row, "payload")?,
            queue: column(row, "queue")?,
            state: TaskState::from_id(state_id)
                .ok_or_else(|| BrokerError::Corrupt(format!("task {} state {}", id, state_id)))?,
            retried: u32::try_from(retried).unwrap_or(0),
            max_retry: u32::try_from(max_retry).unwrap_or(0),
            last_error: column(row, "last_error")?,
            process_at: column(row, "process_at")?,
            created_at: column(row, "created_at")?,
            updated_at: column(row, "updated_at")?,
        })
    }

    /// CAS update on a `Processing` row; distinguishes missing rows from lost races
    async fn transition(&self, id: TaskId, query: PgQuery<'_>) -> Result<(), BrokerError> {
        let result = query.execute(&self.pool).await?;
        if result.rows_affected() > 0 {
            return Ok(());
        }

        match self.get(id).await? {
            None => Err(BrokerError::NotFound(id)),
            Some(task) => Err(BrokerError::InvalidState {
                id,
                expected: TaskState::Processing,
                actual: task.state,
            }),
        }
    }
}

/// Decode one column; a type mismatch or missing column marks the row corrupt
fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T, BrokerError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(name).map_err(|e| {
        tracing::error!(column = name, error = %e, "Failed to read task column");
        BrokerError::Corrupt(format!("column {}: {}", name, e))
    })
}

#[async_trait]
impl TaskBroker for PgTaskBroker {
    async fn enqueue(&self, task: Task, opts: TaskOptions) -> Result<TaskInfo, BrokerError> {
        let info = TaskInfo::new(task, &opts, Utc::now());

        let sql = format!(
            r#"
            INSERT INTO tasks
                (id, task_type, payload, queue, state, retried, max_retry, process_at, created_at, updated_at)
            VALUES
                ($1, $2, $3, $4, $5, 0, $6, $7, $8, $8)
            RETURNING {}
            "#,
            TASK_COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(info.id.to_string())
            .bind(&info.task_type)
            .bind(&info.payload)
            .bind(&info.queue)
            .bind(info.state.id())
            .bind(i32::try_from(info.max_retry).unwrap_or(i32::MAX))
            .bind(info.process_at)
            .bind(info.created_at)
            .fetch_one(&self.pool)
            .await?;

        Self::row_to_task(&row)
    }

    async fn dequeue(&self, queues: &[String]) -> Result<Option<TaskInfo>, BrokerError> {
        let sql = format!(
            r#"
            UPDATE tasks SET state = $1, updated_at = now()
            WHERE id = (
                SELECT id FROM tasks
                WHERE queue = $2
                  AND state IN ($3, $4)
                  AND process_at <= now()
                ORDER BY process_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            TASK_COLUMNS
        );

        for queue in queues {
            let row = sqlx::query(&sql)
                .bind(TaskState::Processing.id())
                .bind(queue)
                .bind(TaskState::Pending.id())
                .bind(TaskState::Retrying.id())
                .fetch_optional(&self.pool)
                .await?;

            if let Some(row) = row {
                return Self::row_to_task(&row).map(Some);
            }
        }
        Ok(None)
    }

    async fn complete(&self, id: TaskId) -> Result<(), BrokerError> {
        let query = sqlx::query(
            "UPDATE tasks SET state = $1, updated_at = now() WHERE id = $2 AND state = $3",
        )
        .bind(TaskState::Succeeded.id())
        .bind(id.to_string())
        .bind(TaskState::Processing.id());
        self.transition(id, query).await
    }

    async fn retry(
        &self,
        id: TaskId,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<(), BrokerError> {
        let query = sqlx::query(
            r#"
            UPDATE tasks
            SET state = $1, retried = retried + 1, last_error = $2, process_at = $3, updated_at = now()
            WHERE id = $4 AND state = $5
            "#,
        )
        .bind(TaskState::Retrying.id())
        .bind(error)
        .bind(retry_at)
        .bind(id.to_string())
        .bind(TaskState::Processing.id());
        self.transition(id, query).await
    }

    async fn fail(&self, id: TaskId, error: &str) -> Result<(), BrokerError> {
        let query = sqlx::query(
            "UPDATE tasks SET state = $1, last_error = $2, updated_at = now() WHERE id = $3 AND state = $4",
        )
        .bind(TaskState::Failed.id())
        .bind(error)
        .bind(id.to_string())
        .bind(TaskState::Processing.id());
        self.transition(id, query).await
    }

    async fn requeue(&self, id: TaskId) -> Result<(), BrokerError> {
        let query = sqlx::query(
            "UPDATE tasks SET state = $1, process_at = now(), updated_at = now() WHERE id = $2 AND state = $3",
        )
        .bind(TaskState::Pending.id())
        .bind(id.to_string())
        .bind(TaskState::Processing.id());
        self.transition(id, query).await
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskInfo>, BrokerError> {
        let sql = format!("SELECT {} FROM tasks WHERE id = $1", TASK_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn recover_stale(&self, threshold: Duration) -> Result<u64, BrokerError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks SET state = $1, process_at = now(), updated_at = now()
            WHERE state = $2
              AND updated_at < now() - make_interval(secs => $3)
            "#,
        )
        .bind(TaskState::Pending.id())
        .bind(TaskState::Processing.id())
        .bind(threshold.as_secs_f64())
        .execute(&self.pool)
        .await?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            tracing::warn!(recovered, "Recovered stale tasks");
        }
        Ok(recovered)
    }
}
