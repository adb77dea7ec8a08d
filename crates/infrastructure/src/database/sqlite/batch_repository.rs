use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use jobcenter_core::JobCenterResult;
use jobcenter_domain::repositories::BatchRepository;
use jobcenter_domain::TaskBatch;

use crate::database::mapping::MappingHelpers;

pub struct SqliteBatchRepository {
    pool: SqlitePool,
}

impl SqliteBatchRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_batch(row: &SqliteRow) -> JobCenterResult<TaskBatch> {
        Ok(TaskBatch {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            status: MappingHelpers::parse_enum(row, "status")?,
            total_tasks: row.try_get("total_tasks")?,
            pending_tasks: row.try_get("pending_tasks")?,
            running_tasks: row.try_get("running_tasks")?,
            success_tasks: row.try_get("success_tasks")?,
            failed_tasks: row.try_get("failed_tasks")?,
            started_at: row.try_get("started_at")?,
            ended_at: row.try_get("ended_at")?,
            duration_ms: row.try_get("duration_ms")?,
            stop_on_fail: row.try_get("stop_on_fail")?,
            notify_on_complete: row.try_get("notify_on_complete")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl BatchRepository for SqliteBatchRepository {
    async fn create(&self, batch: &TaskBatch) -> JobCenterResult<TaskBatch> {
        let result = sqlx::query(
            r#"
            INSERT INTO task_batches (
                name, description, status, total_tasks, pending_tasks, running_tasks,
                success_tasks, failed_tasks, started_at, ended_at, duration_ms,
                stop_on_fail, notify_on_complete, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
        )
        .bind(&batch.name)
        .bind(&batch.description)
        .bind(batch.status.as_str())
        .bind(batch.total_tasks)
        .bind(batch.pending_tasks)
        .bind(batch.running_tasks)
        .bind(batch.success_tasks)
        .bind(batch.failed_tasks)
        .bind(batch.started_at)
        .bind(batch.ended_at)
        .bind(batch.duration_ms)
        .bind(batch.stop_on_fail)
        .bind(batch.notify_on_complete)
        .bind(batch.created_at)
        .bind(batch.updated_at)
        .execute(&self.pool)
        .await?;

        let mut created = batch.clone();
        created.id = result.last_insert_rowid();
        Ok(created)
    }

    async fn get_by_id(&self, id: i64) -> JobCenterResult<Option<TaskBatch>> {
        let row = sqlx::query("SELECT * FROM task_batches WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::row_to_batch(&r)).transpose()
    }

    async fn update(&self, batch: &TaskBatch) -> JobCenterResult<()> {
        sqlx::query(
            r#"
            UPDATE task_batches SET
                status = ?1, pending_tasks = ?2, running_tasks = ?3, success_tasks = ?4,
                failed_tasks = ?5, started_at = ?6, ended_at = ?7, duration_ms = ?8,
                updated_at = ?9
            WHERE id = ?10
            "#,
        )
        .bind(batch.status.as_str())
        .bind(batch.pending_tasks)
        .bind(batch.running_tasks)
        .bind(batch.success_tasks)
        .bind(batch.failed_tasks)
        .bind(batch.started_at)
        .bind(batch.ended_at)
        .bind(batch.duration_ms)
        .bind(Utc::now())
        .bind(batch.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn active(&self) -> JobCenterResult<Vec<TaskBatch>> {
        let rows = sqlx::query(
            "SELECT * FROM task_batches WHERE status IN ('pending', 'running') ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_batch).collect()
    }
}
