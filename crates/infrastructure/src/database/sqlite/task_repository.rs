use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, Transaction};
use std::collections::HashMap;
use tracing::debug;

use jobcenter_core::{JobCenterError, JobCenterResult};
use jobcenter_domain::repositories::TaskRepository;
use jobcenter_domain::{
    AttemptOutcome, BatchCounts, Task, TaskEvent, TaskEventKind, TaskExecution, TaskFilter,
    TaskStatus,
};

use crate::database::mapping::MappingHelpers;

pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_task(row: &SqliteRow) -> JobCenterResult<Task> {
        Ok(Task {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            task_type: MappingHelpers::parse_enum(row, "task_type")?,
            priority: MappingHelpers::parse_enum(row, "priority")?,
            status: MappingHelpers::parse_enum(row, "status")?,
            target_type: row.try_get("target_type")?,
            target_ids: MappingHelpers::parse_typed(row, "target_ids")?,
            executor: MappingHelpers::parse_enum(row, "executor")?,
            payload: MappingHelpers::parse_json(row, "payload")?,
            schedule: MappingHelpers::parse_typed(row, "schedule")?,
            timeout_seconds: row.try_get("timeout_seconds")?,
            retry_policy: jobcenter_domain::RetryPolicy {
                max_retry: row.try_get("max_retry")?,
                retry_delay_seconds: row.try_get("retry_delay_seconds")?,
                backoff: MappingHelpers::parse_enum(row, "retry_backoff")?,
                max_delay_seconds: row.try_get("retry_max_delay_seconds")?,
            },
            retry_count: row.try_get("retry_count")?,
            idempotent_key: row.try_get("idempotent_key")?,
            dedup_window_seconds: row.try_get("dedup_window_seconds")?,
            rollback_payload: MappingHelpers::parse_opt_json(row, "rollback_payload")?,
            dependencies: MappingHelpers::parse_typed(row, "dependencies")?,
            dependency_policy: MappingHelpers::parse_enum(row, "dependency_policy")?,
            queue_name: row.try_get("queue_name")?,
            worker_id: row.try_get("worker_id")?,
            queued_at: row.try_get("queued_at")?,
            started_at: row.try_get("started_at")?,
            ended_at: row.try_get("ended_at")?,
            result: MappingHelpers::parse_opt_typed(row, "result")?,
            error: row.try_get("error")?,
            tags: MappingHelpers::parse_typed(row, "tags")?,
            metadata: MappingHelpers::parse_json(row, "metadata")?,
            parent_id: row.try_get("parent_id")?,
            batch_id: row.try_get("batch_id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_execution(row: &SqliteRow) -> JobCenterResult<TaskExecution> {
        Ok(TaskExecution {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            attempt: row.try_get("attempt")?,
            status: MappingHelpers::parse_enum(row, "status")?,
            worker_id: row.try_get("worker_id")?,
            started_at: row.try_get("started_at")?,
            ended_at: row.try_get("ended_at")?,
            duration_ms: row.try_get("duration_ms")?,
            exit_code: row.try_get("exit_code")?,
            stdout: row.try_get("stdout")?,
            stderr: row.try_get("stderr")?,
            error: row.try_get("error")?,
            rollback_at: row.try_get("rollback_at")?,
            rollback_result: row.try_get("rollback_result")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn row_to_event(row: &SqliteRow) -> JobCenterResult<TaskEvent> {
        Ok(TaskEvent {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            kind: MappingHelpers::parse_enum(row, "kind")?,
            source: row.try_get("source")?,
            payload: MappingHelpers::parse_json(row, "payload")?,
            created_at: row.try_get("created_at")?,
        })
    }

    async fn insert_event_tx(
        tx: &mut Transaction<'_, Sqlite>,
        task_id: i64,
        kind: TaskEventKind,
        source: &str,
        payload: serde_json::Value,
    ) -> JobCenterResult<()> {
        sqlx::query(
            "INSERT INTO task_events (task_id, kind, source, payload, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(task_id)
        .bind(kind.as_str())
        .bind(source)
        .bind(payload.to_string())
        .bind(Utc::now())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn get_task_tx(
        tx: &mut Transaction<'_, Sqlite>,
        task_id: i64,
    ) -> JobCenterResult<Task> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?1")
            .bind(task_id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or(JobCenterError::TaskNotFound { id: task_id })?;
        Self::row_to_task(&row)
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn create(&self, task: &Task) -> JobCenterResult<Task> {
        let result = sqlx::query(
            r#"
            INSERT INTO tasks (
                name, task_type, priority, status, target_type, target_ids,
                executor, payload, schedule, timeout_seconds,
                max_retry, retry_delay_seconds, retry_backoff, retry_max_delay_seconds,
                retry_count, idempotent_key, dedup_window_seconds, rollback_payload,
                dependencies, dependency_policy, queue_name, worker_id,
                queued_at, started_at, ended_at, result, error,
                tags, metadata, parent_id, batch_id, created_at, updated_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20,
                ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?31, ?32, ?33
            )
            "#,
        )
        .bind(&task.name)
        .bind(task.task_type.as_str())
        .bind(task.priority.as_str())
        .bind(task.status.as_str())
        .bind(&task.target_type)
        .bind(MappingHelpers::to_json(&task.target_ids)?)
        .bind(task.executor.as_str())
        .bind(task.payload.to_string())
        .bind(MappingHelpers::to_json(&task.schedule)?)
        .bind(task.timeout_seconds)
        .bind(task.retry_policy.max_retry)
        .bind(task.retry_policy.retry_delay_seconds)
        .bind(task.retry_policy.backoff.as_str())
        .bind(task.retry_policy.max_delay_seconds)
        .bind(task.retry_count)
        .bind(&task.idempotent_key)
        .bind(task.dedup_window_seconds)
        .bind(
            task.rollback_payload
                .as_ref()
                .map(|p| p.to_string()),
        )
        .bind(MappingHelpers::to_json(&task.dependencies)?)
        .bind(task.dependency_policy.as_str())
        .bind(&task.queue_name)
        .bind(&task.worker_id)
        .bind(task.queued_at)
        .bind(task.started_at)
        .bind(task.ended_at)
        .bind(task.result.as_ref().map(MappingHelpers::to_json).transpose()?)
        .bind(&task.error)
        .bind(MappingHelpers::to_json(&task.tags)?)
        .bind(task.metadata.to_string())
        .bind(task.parent_id)
        .bind(task.batch_id)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        let mut created = task.clone();
        created.id = id;
        debug!("创建任务 {} (ID: {})", created.name, id);
        Ok(created)
    }

    async fn get_by_id(&self, id: i64) -> JobCenterResult<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| Self::row_to_task(&r)).transpose()
    }

    async fn get_by_idempotent_key(&self, key: &str) -> JobCenterResult<Option<Task>> {
        let row = sqlx::query(
            "SELECT * FROM tasks WHERE idempotent_key = ?1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        let task = match row.map(|r| Self::row_to_task(&r)).transpose()? {
            Some(task) => task,
            None => return Ok(None),
        };

        // 去重窗口外的记录视为不存在
        let window = chrono::Duration::seconds(task.dedup_window_seconds.max(0));
        if task.dedup_window_seconds > 0 && task.created_at + window <= Utc::now() {
            return Ok(None);
        }
        Ok(Some(task))
    }

    async fn list(&self, filter: &TaskFilter) -> JobCenterResult<(Vec<Task>, i64)> {
        let mut count_builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) as cnt FROM tasks WHERE 1=1");
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM tasks WHERE 1=1");

        for b in [&mut count_builder, &mut builder] {
            if let Some(status) = filter.status {
                b.push(" AND status = ").push_bind(status.as_str());
            }
            if let Some(task_type) = filter.task_type {
                b.push(" AND task_type = ").push_bind(task_type.as_str());
            }
            if let Some(ref queue) = filter.queue_name {
                b.push(" AND queue_name = ").push_bind(queue.clone());
            }
            if let Some(batch_id) = filter.batch_id {
                b.push(" AND batch_id = ").push_bind(batch_id);
            }
        }

        let total: i64 = count_builder
            .build()
            .fetch_one(&self.pool)
            .await?
            .try_get("cnt")?;

        builder.push(" ORDER BY created_at DESC");
        builder
            .push(" LIMIT ")
            .push_bind(filter.limit.unwrap_or(100));
        builder
            .push(" OFFSET ")
            .push_bind(filter.offset.unwrap_or(0));

        let rows = builder.build().fetch_all(&self.pool).await?;
        let tasks = rows
            .iter()
            .map(Self::row_to_task)
            .collect::<JobCenterResult<Vec<_>>>()?;
        Ok((tasks, total))
    }

    async fn mark_queued(&self, task_id: i64, source: &str) -> JobCenterResult<()> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let task = Self::get_task_tx(&mut tx, task_id).await?;
        let updated = sqlx::query(
            "UPDATE tasks SET status = 'queued', queued_at = ?1, updated_at = ?1 \
             WHERE id = ?2 AND status IN ('pending', 'retrying')",
        )
        .bind(now)
        .bind(task_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(JobCenterError::Internal(format!(
                "任务 {task_id} 状态 {} 不允许入队",
                task.status
            )));
        }

        Self::insert_event_tx(
            &mut tx,
            task_id,
            TaskEventKind::Queued,
            source,
            serde_json::json!({ "queue": task.queue_name }),
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn begin_attempt(
        &self,
        task_id: i64,
        worker_id: &str,
    ) -> JobCenterResult<TaskExecution> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let task = Self::get_task_tx(&mut tx, task_id).await?;
        let attempt = task.retry_count + 1;

        sqlx::query(
            "UPDATE tasks SET status = 'running', worker_id = ?1, started_at = ?2, updated_at = ?2 \
             WHERE id = ?3",
        )
        .bind(worker_id)
        .bind(now)
        .bind(task_id)
        .execute(&mut *tx)
        .await?;

        let result = sqlx::query(
            "INSERT INTO task_executions (task_id, attempt, status, worker_id, started_at, created_at) \
             VALUES (?1, ?2, 'running', ?3, ?4, ?4)",
        )
        .bind(task_id)
        .bind(attempt)
        .bind(worker_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        let execution_id = result.last_insert_rowid();

        Self::insert_event_tx(
            &mut tx,
            task_id,
            TaskEventKind::Started,
            worker_id,
            serde_json::json!({ "attempt": attempt, "worker_id": worker_id }),
        )
        .await?;

        tx.commit().await?;

        Ok(TaskExecution {
            id: execution_id,
            task_id,
            attempt,
            status: TaskStatus::Running,
            worker_id: worker_id.to_string(),
            started_at: now,
            ended_at: None,
            duration_ms: None,
            exit_code: None,
            stdout: None,
            stderr: None,
            error: None,
            rollback_at: None,
            rollback_result: None,
            created_at: now,
        })
    }

    async fn complete_attempt(&self, outcome: &AttemptOutcome) -> JobCenterResult<()> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let (exit_code, stdout, stderr, duration_ms) = match &outcome.result {
            Some(r) => (
                r.exit_code,
                r.stdout.clone(),
                r.stderr.clone(),
                Some(r.execution_time_ms as i64),
            ),
            None => (None, None, None, None),
        };

        sqlx::query(
            "UPDATE task_executions SET status = ?1, ended_at = ?2, duration_ms = ?3, \
             exit_code = ?4, stdout = ?5, stderr = ?6, error = ?7 WHERE id = ?8",
        )
        .bind(outcome.status.as_str())
        .bind(now)
        .bind(duration_ms)
        .bind(exit_code)
        .bind(&stdout)
        .bind(&stderr)
        .bind(&outcome.error)
        .bind(outcome.execution_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE tasks SET status = ?1, result = ?2, error = ?3, ended_at = ?4, updated_at = ?4 \
             WHERE id = ?5",
        )
        .bind(outcome.task_status.as_str())
        .bind(
            outcome
                .result
                .as_ref()
                .map(MappingHelpers::to_json)
                .transpose()?,
        )
        .bind(&outcome.error)
        .bind(now)
        .bind(outcome.task_id)
        .execute(&mut *tx)
        .await?;

        let kind = match outcome.task_status {
            TaskStatus::Success => TaskEventKind::Succeeded,
            TaskStatus::Canceled => TaskEventKind::Cancelled,
            _ => TaskEventKind::Failed,
        };
        Self::insert_event_tx(
            &mut tx,
            outcome.task_id,
            kind,
            &outcome.worker_id,
            serde_json::json!({
                "execution_id": outcome.execution_id,
                "status": outcome.task_status.as_str(),
                "error": outcome.error,
            }),
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn mark_retrying(
        &self,
        task_id: i64,
        retry_count: i32,
        next_at: DateTime<Utc>,
        reason: &str,
    ) -> JobCenterResult<()> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        sqlx::query(
            "UPDATE tasks SET status = 'retrying', retry_count = ?1, updated_at = ?2 WHERE id = ?3",
        )
        .bind(retry_count)
        .bind(now)
        .bind(task_id)
        .execute(&mut *tx)
        .await?;

        Self::insert_event_tx(
            &mut tx,
            task_id,
            TaskEventKind::Retrying,
            "system",
            serde_json::json!({
                "attempt": retry_count,
                "next_at": next_at,
                "reason": reason,
            }),
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn record_rollback(
        &self,
        execution_id: i64,
        task_id: i64,
        rollback_result: &str,
        success: bool,
    ) -> JobCenterResult<()> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        sqlx::query(
            "UPDATE task_executions SET rollback_at = ?1, rollback_result = ?2 WHERE id = ?3",
        )
        .bind(now)
        .bind(rollback_result)
        .bind(execution_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE tasks SET status = 'rolledback', updated_at = ?1 WHERE id = ?2")
            .bind(now)
            .bind(task_id)
            .execute(&mut *tx)
            .await?;

        Self::insert_event_tx(
            &mut tx,
            task_id,
            TaskEventKind::RolledBack,
            "system",
            serde_json::json!({
                "execution_id": execution_id,
                "success": success,
                "result": rollback_result,
            }),
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn cancel(&self, task_id: i64, source: &str, reason: &str) -> JobCenterResult<()> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        sqlx::query(
            "UPDATE tasks SET status = 'canceled', error = ?1, ended_at = ?2, updated_at = ?2 \
             WHERE id = ?3",
        )
        .bind(reason)
        .bind(now)
        .bind(task_id)
        .execute(&mut *tx)
        .await?;

        Self::insert_event_tx(
            &mut tx,
            task_id,
            TaskEventKind::Cancelled,
            source,
            serde_json::json!({ "reason": reason }),
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn requeue_after_retry(&self, task_id: i64) -> JobCenterResult<()> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let updated = sqlx::query(
            "UPDATE tasks SET status = 'queued', queued_at = ?1, updated_at = ?1 \
             WHERE id = ?2 AND status = 'retrying'",
        )
        .bind(now)
        .bind(task_id)
        .execute(&mut *tx)
        .await?;

        // 重试等待期间被取消的任务不再入队
        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(JobCenterError::Internal(format!(
                "任务 {task_id} 不处于retrying状态，跳过重试入队"
            )));
        }

        Self::insert_event_tx(
            &mut tx,
            task_id,
            TaskEventKind::Queued,
            "system",
            serde_json::json!({ "retry": true }),
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn reset_for_rerun(&self, task_id: i64) -> JobCenterResult<()> {
        let now = Utc::now();
        let updated = sqlx::query(
            "UPDATE tasks SET status = 'pending', retry_count = 0, result = NULL, error = NULL, \
             worker_id = NULL, queued_at = NULL, started_at = NULL, ended_at = NULL, \
             updated_at = ?1 WHERE id = ?2 AND status IN ('pending', 'failed', 'canceled', 'timeout')",
        )
        .bind(now)
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(JobCenterError::Internal(format!(
                "任务 {task_id} 当前状态不允许重跑"
            )));
        }
        Ok(())
    }

    async fn record_event(
        &self,
        task_id: i64,
        kind: TaskEventKind,
        source: &str,
        payload: serde_json::Value,
    ) -> JobCenterResult<()> {
        let mut tx = self.pool.begin().await?;
        Self::insert_event_tx(&mut tx, task_id, kind, source, payload).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn executions(&self, task_id: i64) -> JobCenterResult<Vec<TaskExecution>> {
        let rows = sqlx::query(
            "SELECT * FROM task_executions WHERE task_id = ?1 ORDER BY attempt ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_execution).collect()
    }

    async fn events(&self, task_id: i64) -> JobCenterResult<Vec<TaskEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM task_events WHERE task_id = ?1 ORDER BY id ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_event).collect()
    }

    async fn statuses(&self, ids: &[i64]) -> JobCenterResult<HashMap<i64, TaskStatus>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT id, status FROM tasks WHERE id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        builder.push(")");

        let rows = builder.build().fetch_all(&self.pool).await?;
        let mut result = HashMap::with_capacity(rows.len());
        for row in &rows {
            let id: i64 = row.try_get("id")?;
            let status: TaskStatus = MappingHelpers::parse_enum(row, "status")?;
            result.insert(id, status);
        }
        Ok(result)
    }

    async fn pending_with_dependencies(&self) -> JobCenterResult<Vec<Task>> {
        let rows = sqlx::query(
            "SELECT * FROM tasks WHERE status = 'pending' AND dependencies != '[]' \
             ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    async fn batch_counts(&self, batch_id: i64) -> JobCenterResult<BatchCounts> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) as cnt FROM tasks WHERE batch_id = ?1 GROUP BY status",
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = BatchCounts::default();
        for row in &rows {
            let status: TaskStatus = MappingHelpers::parse_enum(row, "status")?;
            let cnt: i64 = row.try_get("cnt")?;
            let cnt = cnt as i32;
            match status {
                TaskStatus::Pending | TaskStatus::Queued | TaskStatus::Retrying => {
                    counts.pending += cnt
                }
                TaskStatus::Running => counts.running += cnt,
                TaskStatus::Success => counts.success += cnt,
                TaskStatus::Failed
                | TaskStatus::Timeout
                | TaskStatus::Canceled
                | TaskStatus::Rolledback => counts.failed += cnt,
            }
        }
        Ok(counts)
    }

    async fn tasks_by_batch(&self, batch_id: i64) -> JobCenterResult<Vec<Task>> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE batch_id = ?1 ORDER BY id ASC")
            .bind(batch_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    async fn queue_counts(&self, queue_name: &str) -> JobCenterResult<(i64, i64)> {
        let row = sqlx::query(
            "SELECT \
               SUM(CASE WHEN status IN ('pending', 'queued', 'retrying') THEN 1 ELSE 0 END) as queued, \
               SUM(CASE WHEN status = 'running' THEN 1 ELSE 0 END) as running \
             FROM tasks WHERE queue_name = ?1",
        )
        .bind(queue_name)
        .fetch_one(&self.pool)
        .await?;

        let queued: Option<i64> = row.try_get("queued")?;
        let running: Option<i64> = row.try_get("running")?;
        Ok((queued.unwrap_or(0), running.unwrap_or(0)))
    }
}
