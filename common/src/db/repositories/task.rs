// PostgreSQL task repository

use super::TaskRepository;
use crate::db::DbPool;
use crate::errors::DatabaseError;
use crate::models::{ScheduleTask, TaskMetadata, TaskStatus};
use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::instrument;
use uuid::Uuid;

const TASK_COLUMNS: &str = r#"
    id, name, description, recurrence_expression, source_module,
    source_entity_id, metadata, enabled, status, next_run_at,
    last_run_at, execution_count, last_error, created_at, updated_at
"#;

/// Repository for schedule task rows in PostgreSQL
pub struct PostgresTaskRepository {
    pool: DbPool,
}

impl PostgresTaskRepository {
    /// Create a new PostgresTaskRepository
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Create the `schedule_tasks` table and its source index if missing
    #[instrument(skip(self))]
    pub async fn ensure_schema(&self) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schedule_tasks (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                recurrence_expression TEXT NOT NULL,
                source_module TEXT,
                source_entity_id TEXT,
                metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
                enabled BOOLEAN NOT NULL DEFAULT TRUE,
                status TEXT NOT NULL,
                next_run_at TIMESTAMPTZ,
                last_run_at TIMESTAMPTZ,
                execution_count BIGINT NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(self.pool.pool())
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_schedule_tasks_source
                ON schedule_tasks (source_module, source_entity_id)
            "#,
        )
        .execute(self.pool.pool())
        .await?;

        tracing::info!("schedule_tasks schema ready");
        Ok(())
    }

    async fn fetch_many(
        &self,
        query: sqlx::query::Query<'_, sqlx::Postgres, PgArguments>,
    ) -> Result<Vec<ScheduleTask>, DatabaseError> {
        let rows = query.fetch_all(self.pool.pool()).await?;
        rows.iter().map(row_to_task).collect()
    }
}

fn row_to_task(row: &PgRow) -> Result<ScheduleTask, DatabaseError> {
    let status: String = row.try_get("status")?;
    let status: TaskStatus = status
        .parse()
        .map_err(|e| DatabaseError::QueryFailed(format!("Failed to parse status: {}", e)))?;
    let metadata: Json<TaskMetadata> = row.try_get("metadata")?;

    Ok(ScheduleTask {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        recurrence_expression: row.try_get("recurrence_expression")?,
        source_module: row.try_get("source_module")?,
        source_entity_id: row.try_get("source_entity_id")?,
        metadata: metadata.0,
        enabled: row.try_get("enabled")?,
        status,
        next_run_at: row.try_get("next_run_at")?,
        last_run_at: row.try_get("last_run_at")?,
        execution_count: row.try_get("execution_count")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl TaskRepository for PostgresTaskRepository {
    #[instrument(skip(self, task), fields(task_id = %task.id, task_name = %task.name))]
    async fn save(&self, task: &ScheduleTask) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO schedule_tasks (
                id, name, description, recurrence_expression, source_module,
                source_entity_id, metadata, enabled, status, next_run_at,
                last_run_at, execution_count, last_error, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(task.id)
        .bind(&task.name)
        .bind(&task.description)
        .bind(&task.recurrence_expression)
        .bind(&task.source_module)
        .bind(&task.source_entity_id)
        .bind(Json(&task.metadata))
        .bind(task.enabled)
        .bind(task.status.as_str())
        .bind(task.next_run_at)
        .bind(task.last_run_at)
        .bind(task.execution_count)
        .bind(&task.last_error)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(self.pool.pool())
        .await?;

        tracing::debug!("Task saved");
        Ok(())
    }

    #[instrument(skip(self, task), fields(task_id = %task.id))]
    async fn update(&self, task: &ScheduleTask) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            r#"
            UPDATE schedule_tasks
            SET name = $2,
                description = $3,
                recurrence_expression = $4,
                source_module = $5,
                source_entity_id = $6,
                metadata = $7,
                enabled = $8,
                status = $9,
                next_run_at = $10,
                last_run_at = $11,
                execution_count = $12,
                last_error = $13,
                updated_at = $14
            WHERE id = $1
            "#,
        )
        .bind(task.id)
        .bind(&task.name)
        .bind(&task.description)
        .bind(&task.recurrence_expression)
        .bind(&task.source_module)
        .bind(&task.source_entity_id)
        .bind(Json(&task.metadata))
        .bind(task.enabled)
        .bind(task.status.as_str())
        .bind(task.next_run_at)
        .bind(task.last_run_at)
        .bind(task.execution_count)
        .bind(&task.last_error)
        .bind(task.updated_at)
        .execute(self.pool.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(task.id.to_string()));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM schedule_tasks WHERE id = $1")
            .bind(id)
            .execute(self.pool.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn find_by_uuid(&self, id: Uuid) -> Result<Option<ScheduleTask>, DatabaseError> {
        let sql = format!("SELECT {} FROM schedule_tasks WHERE id = $1", TASK_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(self.pool.pool())
            .await?;
        row.as_ref().map(row_to_task).transpose()
    }

    #[instrument(skip(self))]
    async fn find_by_source(
        &self,
        source_module: &str,
        source_entity_id: &str,
    ) -> Result<Vec<ScheduleTask>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM schedule_tasks WHERE source_module = $1 AND source_entity_id = $2 ORDER BY created_at, id",
            TASK_COLUMNS
        );
        self.fetch_many(sqlx::query(&sql).bind(source_module).bind(source_entity_id))
            .await
    }

    #[instrument(skip(self))]
    async fn find_all_enabled(&self) -> Result<Vec<ScheduleTask>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM schedule_tasks WHERE enabled = true ORDER BY created_at, id",
            TASK_COLUMNS
        );
        let tasks = self.fetch_many(sqlx::query(&sql)).await?;
        tracing::debug!(count = tasks.len(), "Found enabled tasks");
        Ok(tasks)
    }

    #[instrument(skip(self))]
    async fn find_all(&self) -> Result<Vec<ScheduleTask>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM schedule_tasks ORDER BY created_at, id",
            TASK_COLUMNS
        );
        self.fetch_many(sqlx::query(&sql)).await
    }
}
