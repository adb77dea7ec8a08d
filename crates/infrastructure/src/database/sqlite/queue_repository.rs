use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use jobcenter_core::JobCenterResult;
use jobcenter_domain::repositories::QueueRepository;
use jobcenter_domain::QueueConfig;

pub struct SqliteQueueRepository {
    pool: SqlitePool,
}

impl SqliteQueueRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_config(row: &SqliteRow) -> JobCenterResult<QueueConfig> {
        Ok(QueueConfig {
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            max_workers: row.try_get::<i64, _>("max_workers")? as u32,
            max_pending: row.try_get::<i64, _>("max_pending")? as u32,
            priority: row.try_get("priority")?,
            timeout_seconds: row.try_get("timeout_seconds")?,
            max_retry: row.try_get("max_retry")?,
            enabled: row.try_get("enabled")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl QueueRepository for SqliteQueueRepository {
    async fn upsert(&self, config: &QueueConfig) -> JobCenterResult<()> {
        sqlx::query(
            r#"
            INSERT INTO queues (
                name, description, max_workers, max_pending, priority,
                timeout_seconds, max_retry, enabled, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
            ON CONFLICT(name) DO UPDATE SET
                description = excluded.description,
                max_workers = excluded.max_workers,
                max_pending = excluded.max_pending,
                priority = excluded.priority,
                timeout_seconds = excluded.timeout_seconds,
                max_retry = excluded.max_retry,
                enabled = excluded.enabled,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&config.name)
        .bind(&config.description)
        .bind(config.max_workers as i64)
        .bind(config.max_pending as i64)
        .bind(config.priority)
        .bind(config.timeout_seconds)
        .bind(config.max_retry)
        .bind(config.enabled)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, name: &str) -> JobCenterResult<Option<QueueConfig>> {
        let row = sqlx::query("SELECT * FROM queues WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::row_to_config(&r)).transpose()
    }

    async fn list(&self) -> JobCenterResult<Vec<QueueConfig>> {
        let rows = sqlx::query("SELECT * FROM queues ORDER BY priority DESC, name ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_config).collect()
    }
}
