use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use jobcenter_core::JobCenterResult;
use jobcenter_domain::repositories::CronRepository;
use jobcenter_domain::{CronExecution, CronJob};

use crate::database::mapping::MappingHelpers;

pub struct SqliteCronRepository {
    pool: SqlitePool,
}

impl SqliteCronRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_job(row: &SqliteRow) -> JobCenterResult<CronJob> {
        Ok(CronJob {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            cron_expr: row.try_get("cron_expr")?,
            timezone: row.try_get("timezone")?,
            enabled: row.try_get("enabled")?,
            task_template: MappingHelpers::parse_json(row, "task_template")?,
            misfire_policy: MappingHelpers::parse_enum(row, "misfire_policy")?,
            concurrent_policy: MappingHelpers::parse_enum(row, "concurrent_policy")?,
            last_run_at: row.try_get("last_run_at")?,
            next_run_at: row.try_get("next_run_at")?,
            run_count: row.try_get("run_count")?,
            success_count: row.try_get("success_count")?,
            fail_count: row.try_get("fail_count")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_execution(row: &SqliteRow) -> JobCenterResult<CronExecution> {
        Ok(CronExecution {
            id: row.try_get("id")?,
            cron_job_id: row.try_get("cron_job_id")?,
            task_id: row.try_get("task_id")?,
            node_id: row.try_get("node_id")?,
            scheduled_at: row.try_get("scheduled_at")?,
            fired_at: row.try_get("fired_at")?,
            status: MappingHelpers::parse_enum(row, "status")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl CronRepository for SqliteCronRepository {
    async fn create_job(&self, job: &CronJob) -> JobCenterResult<CronJob> {
        let result = sqlx::query(
            r#"
            INSERT INTO cron_jobs (
                name, description, cron_expr, timezone, enabled, task_template,
                misfire_policy, concurrent_policy, last_run_at, next_run_at,
                run_count, success_count, fail_count, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
        )
        .bind(&job.name)
        .bind(&job.description)
        .bind(&job.cron_expr)
        .bind(&job.timezone)
        .bind(job.enabled)
        .bind(job.task_template.to_string())
        .bind(job.misfire_policy.as_str())
        .bind(job.concurrent_policy.as_str())
        .bind(job.last_run_at)
        .bind(job.next_run_at)
        .bind(job.run_count)
        .bind(job.success_count)
        .bind(job.fail_count)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;

        let mut created = job.clone();
        created.id = result.last_insert_rowid();
        Ok(created)
    }

    async fn get_job(&self, id: i64) -> JobCenterResult<Option<CronJob>> {
        let row = sqlx::query("SELECT * FROM cron_jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::row_to_job(&r)).transpose()
    }

    async fn list_jobs(&self, enabled_only: bool) -> JobCenterResult<Vec<CronJob>> {
        let sql = if enabled_only {
            "SELECT * FROM cron_jobs WHERE enabled = 1 ORDER BY id ASC"
        } else {
            "SELECT * FROM cron_jobs ORDER BY id ASC"
        };
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_job).collect()
    }

    async fn update_job(&self, job: &CronJob) -> JobCenterResult<()> {
        sqlx::query(
            r#"
            UPDATE cron_jobs SET
                name = ?1, description = ?2, cron_expr = ?3, timezone = ?4, enabled = ?5,
                task_template = ?6, misfire_policy = ?7, concurrent_policy = ?8,
                last_run_at = ?9, next_run_at = ?10, run_count = ?11,
                success_count = ?12, fail_count = ?13, updated_at = ?14
            WHERE id = ?15
            "#,
        )
        .bind(&job.name)
        .bind(&job.description)
        .bind(&job.cron_expr)
        .bind(&job.timezone)
        .bind(job.enabled)
        .bind(job.task_template.to_string())
        .bind(job.misfire_policy.as_str())
        .bind(job.concurrent_policy.as_str())
        .bind(job.last_run_at)
        .bind(job.next_run_at)
        .bind(job.run_count)
        .bind(job.success_count)
        .bind(job.fail_count)
        .bind(Utc::now())
        .bind(job.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_job(&self, id: i64) -> JobCenterResult<bool> {
        let result = sqlx::query("DELETE FROM cron_jobs WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_execution(
        &self,
        execution: &CronExecution,
    ) -> JobCenterResult<CronExecution> {
        let result = sqlx::query(
            r#"
            INSERT INTO cron_executions (
                cron_job_id, task_id, node_id, scheduled_at, fired_at, status, error, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(execution.cron_job_id)
        .bind(execution.task_id)
        .bind(&execution.node_id)
        .bind(execution.scheduled_at)
        .bind(execution.fired_at)
        .bind(execution.status.as_str())
        .bind(&execution.error)
        .bind(execution.created_at)
        .execute(&self.pool)
        .await?;

        let mut created = execution.clone();
        created.id = result.last_insert_rowid();
        Ok(created)
    }

    async fn update_execution(&self, execution: &CronExecution) -> JobCenterResult<()> {
        sqlx::query(
            "UPDATE cron_executions SET task_id = ?1, status = ?2, error = ?3 WHERE id = ?4",
        )
        .bind(execution.task_id)
        .bind(execution.status.as_str())
        .bind(&execution.error)
        .bind(execution.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_execution(
        &self,
        cron_job_id: i64,
    ) -> JobCenterResult<Option<CronExecution>> {
        let row = sqlx::query(
            "SELECT * FROM cron_executions WHERE cron_job_id = ?1 ORDER BY id DESC LIMIT 1",
        )
        .bind(cron_job_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| Self::row_to_execution(&r)).transpose()
    }

    async fn executions(
        &self,
        cron_job_id: i64,
        limit: i64,
    ) -> JobCenterResult<Vec<CronExecution>> {
        let rows = sqlx::query(
            "SELECT * FROM cron_executions WHERE cron_job_id = ?1 ORDER BY id DESC LIMIT ?2",
        )
        .bind(cron_job_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_execution).collect()
    }
}
