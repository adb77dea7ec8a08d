//! SQLite存储
//!
//! 嵌入式零配置部署：启动时自动建表建索引，WAL模式。

pub mod mapping;
pub mod sqlite;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::debug;

use jobcenter_core::{DatabaseConfig, JobCenterResult};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// 连接数据库并执行迁移
    pub async fn connect(config: &DatabaseConfig) -> JobCenterResult<Self> {
        debug!("Connecting to database: {}", config.url);

        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// 内存数据库，测试用
    pub async fn connect_in_memory() -> JobCenterResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        // 内存库所有连接必须共享同一个连接，否则各连接各自为库
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn run_migrations(&self) -> JobCenterResult<()> {
        debug!("Running database migrations");

        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                task_type TEXT NOT NULL,
                priority TEXT NOT NULL DEFAULT 'normal',
                status TEXT NOT NULL DEFAULT 'pending',
                target_type TEXT,
                target_ids TEXT NOT NULL DEFAULT '[]',
                executor TEXT NOT NULL,
                payload TEXT NOT NULL DEFAULT 'null',
                schedule TEXT NOT NULL DEFAULT '{"mode":"immediate"}',
                timeout_seconds INTEGER NOT NULL DEFAULT 300,
                max_retry INTEGER NOT NULL DEFAULT 0,
                retry_delay_seconds INTEGER NOT NULL DEFAULT 60,
                retry_backoff TEXT NOT NULL DEFAULT 'linear',
                retry_max_delay_seconds INTEGER NOT NULL DEFAULT 3600,
                retry_count INTEGER NOT NULL DEFAULT 0,
                idempotent_key TEXT,
                dedup_window_seconds INTEGER NOT NULL DEFAULT 0,
                rollback_payload TEXT,
                dependencies TEXT NOT NULL DEFAULT '[]',
                dependency_policy TEXT NOT NULL DEFAULT 'all_success',
                queue_name TEXT NOT NULL DEFAULT 'default',
                worker_id TEXT,
                queued_at DATETIME,
                started_at DATETIME,
                ended_at DATETIME,
                result TEXT,
                error TEXT,
                tags TEXT NOT NULL DEFAULT '[]',
                metadata TEXT NOT NULL DEFAULT 'null',
                parent_id INTEGER,
                batch_id INTEGER,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS task_executions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL,
                attempt INTEGER NOT NULL,
                status TEXT NOT NULL,
                worker_id TEXT NOT NULL,
                started_at DATETIME NOT NULL,
                ended_at DATETIME,
                duration_ms INTEGER,
                exit_code INTEGER,
                stdout TEXT,
                stderr TEXT,
                error TEXT,
                rollback_at DATETIME,
                rollback_result TEXT,
                created_at DATETIME NOT NULL,
                FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS task_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                source TEXT NOT NULL,
                payload TEXT NOT NULL DEFAULT 'null',
                created_at DATETIME NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS task_batches (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                description TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                total_tasks INTEGER NOT NULL DEFAULT 0,
                pending_tasks INTEGER NOT NULL DEFAULT 0,
                running_tasks INTEGER NOT NULL DEFAULT 0,
                success_tasks INTEGER NOT NULL DEFAULT 0,
                failed_tasks INTEGER NOT NULL DEFAULT 0,
                started_at DATETIME,
                ended_at DATETIME,
                duration_ms INTEGER,
                stop_on_fail INTEGER NOT NULL DEFAULT 0,
                notify_on_complete INTEGER NOT NULL DEFAULT 1,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS queues (
                name TEXT PRIMARY KEY,
                description TEXT,
                max_workers INTEGER NOT NULL,
                max_pending INTEGER NOT NULL,
                priority INTEGER NOT NULL DEFAULT 5,
                timeout_seconds INTEGER NOT NULL DEFAULT 300,
                max_retry INTEGER NOT NULL DEFAULT 3,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS cron_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                description TEXT,
                cron_expr TEXT NOT NULL,
                timezone TEXT,
                enabled INTEGER NOT NULL DEFAULT 1,
                task_template TEXT NOT NULL,
                misfire_policy TEXT NOT NULL DEFAULT 'ignore',
                concurrent_policy TEXT NOT NULL DEFAULT 'allow',
                last_run_at DATETIME,
                next_run_at DATETIME,
                run_count INTEGER NOT NULL DEFAULT 0,
                success_count INTEGER NOT NULL DEFAULT 0,
                fail_count INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS cron_executions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cron_job_id INTEGER NOT NULL,
                task_id INTEGER,
                node_id TEXT NOT NULL,
                scheduled_at DATETIME NOT NULL,
                fired_at DATETIME NOT NULL,
                status TEXT NOT NULL,
                error TEXT,
                created_at DATETIME NOT NULL,
                FOREIGN KEY (cron_job_id) REFERENCES cron_jobs(id) ON DELETE CASCADE
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS leader_leases (
                lease_key TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                expires_at DATETIME NOT NULL,
                acquired_at DATETIME NOT NULL
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_queue_name ON tasks(queue_name)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_idempotent_key ON tasks(idempotent_key)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks(created_at)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_batch_id ON tasks(batch_id)",
            "CREATE INDEX IF NOT EXISTS idx_task_executions_task_id ON task_executions(task_id)",
            "CREATE INDEX IF NOT EXISTS idx_task_events_task_id ON task_events(task_id)",
            "CREATE INDEX IF NOT EXISTS idx_cron_executions_job_id ON cron_executions(cron_job_id)",
        ];

        for index in indexes {
            sqlx::query(index).execute(&self.pool).await?;
        }

        debug!("Database migrations completed");
        Ok(())
    }
}
