//! 任务提交
//!
//! 提交路径：校验 -> 依赖放行 -> 幂等查重 -> 落库 -> 容量检查入队 ->
//! `queued`事件。队列满时快速失败，给生产者背压信号。

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use jobcenter_core::{JobCenterError, JobCenterResult};
use jobcenter_domain::ports::TaskQueue;
use jobcenter_domain::repositories::{BatchRepository, QueueRepository, TaskRepository};
use jobcenter_domain::{
    ExecutorKind, QueueConfig, ScheduleMode, Task, TaskBatch, TaskSpec, TaskStatus,
};

use crate::cron_utils::CronSchedule;
use crate::dependency::{DependencyDecision, DependencyGate};
use crate::idempotency::IdempotencyLedger;

pub struct SubmissionService {
    task_repo: Arc<dyn TaskRepository>,
    batch_repo: Arc<dyn BatchRepository>,
    queue_repo: Arc<dyn QueueRepository>,
    queue: Arc<dyn TaskQueue>,
    ledger: Arc<IdempotencyLedger>,
    gate: DependencyGate,
    registered_executors: HashSet<ExecutorKind>,
}

impl SubmissionService {
    pub fn new(
        task_repo: Arc<dyn TaskRepository>,
        batch_repo: Arc<dyn BatchRepository>,
        queue_repo: Arc<dyn QueueRepository>,
        queue: Arc<dyn TaskQueue>,
        ledger: Arc<IdempotencyLedger>,
        registered_executors: HashSet<ExecutorKind>,
    ) -> Self {
        Self {
            gate: DependencyGate::new(task_repo.clone()),
            task_repo,
            batch_repo,
            queue_repo,
            queue,
            ledger,
            registered_executors,
        }
    }

    pub fn ledger(&self) -> Arc<IdempotencyLedger> {
        self.ledger.clone()
    }

    async fn queue_config(&self, name: &str) -> JobCenterResult<QueueConfig> {
        self.queue_repo
            .get(name)
            .await?
            .ok_or_else(|| JobCenterError::queue_not_found(name))
    }

    fn validate(&self, spec: &TaskSpec) -> JobCenterResult<()> {
        if spec.name.trim().is_empty() {
            return Err(JobCenterError::validation("任务名称不能为空"));
        }
        if let Some(timeout) = spec.timeout_seconds {
            if timeout <= 0 {
                return Err(JobCenterError::validation("超时必须大于0"));
            }
        }
        if let Some(ref policy) = spec.retry_policy {
            if policy.max_retry < 0 {
                return Err(JobCenterError::validation("max_retry不能为负数"));
            }
            if policy.retry_delay_seconds < 0 {
                return Err(JobCenterError::validation("retry_delay不能为负数"));
            }
        }
        if spec.idempotent_key.is_some() {
            let window = spec.dedup_window_seconds.unwrap_or(0);
            if window <= 0 {
                return Err(JobCenterError::validation(
                    "幂等键必须配合正的去重窗口",
                ));
            }
        }
        if !self.registered_executors.contains(&spec.executor) {
            return Err(JobCenterError::invalid_params(format!(
                "执行器 {} 未注册",
                spec.executor.as_str()
            )));
        }
        if let ScheduleMode::Cron { ref expr, ref timezone } = spec.schedule {
            CronSchedule::validate(expr, timezone.as_deref())?;
        }
        Ok(())
    }

    /// 提交单个任务。
    /// 幂等命中时直接返回既有任务的结果（在途任务按配置有界等待），
    /// 不视为错误。依赖无法满足时任务落库为Canceled并上报错误。
    pub async fn submit(self: &Arc<Self>, spec: TaskSpec) -> JobCenterResult<Task> {
        let queue_name = spec
            .queue_name
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let config = self.queue_config(&queue_name).await?;

        self.validate(&spec)?;

        // 幂等查重
        if let Some(ref key) = spec.idempotent_key {
            if let Some(existing) = self.ledger.lookup(key).await? {
                info!(
                    "幂等命中: key={}, 返回任务 {} 的结果 (状态: {})",
                    key, existing.id, existing.status
                );
                metrics::counter!("jobcenter_duplicate_submissions").increment(1);
                return self.ledger.await_result(existing).await;
            }
        }

        let task = spec.into_task(Some(config.timeout_seconds), Some(config.max_retry));

        // 依赖条件在入队前评估
        match self.gate.evaluate(&task).await? {
            DependencyDecision::Violated(reason) => {
                let created = self.task_repo.create(&task).await?;
                self.task_repo
                    .cancel(created.id, "system", &reason)
                    .await?;
                return Err(JobCenterError::DependencyUnsatisfied {
                    task_id: created.id,
                    reason,
                });
            }
            DependencyDecision::Wait => {
                let created = self.task_repo.create(&task).await?;
                self.record_ledger(&created).await;
                debug!("任务 {} 等待依赖完成，保持Pending", created.id);
                return Ok(created);
            }
            DependencyDecision::Satisfied => {}
        }

        // 延迟任务先落库，到点由定时器放行
        if let ScheduleMode::Delayed { at } = task.schedule {
            if at > Utc::now() {
                let created = self.task_repo.create(&task).await?;
                self.record_ledger(&created).await;
                self.spawn_delayed_admission(created.clone(), at);
                return Ok(created);
            }
        }

        // 容量预检，避免为注定被拒绝的任务落库
        let pending = self.queue.pending_count(&queue_name).await?;
        if pending >= config.max_pending as usize {
            return Err(JobCenterError::QueueFull {
                queue: queue_name,
                max_pending: config.max_pending,
            });
        }

        let created = self.task_repo.create(&task).await?;
        self.record_ledger(&created).await;
        self.admit(&created).await?;
        Ok(created)
    }

    async fn record_ledger(&self, task: &Task) {
        if let Some(ref key) = task.idempotent_key {
            self.ledger
                .record(key, task.id, task.dedup_window_seconds)
                .await;
        }
    }

    fn spawn_delayed_admission(self: &Arc<Self>, task: Task, at: chrono::DateTime<Utc>) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let delay = (at - Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(delay).await;

            // 等待期间可能已被取消
            match service.task_repo.get_by_id(task.id).await {
                Ok(Some(current)) if current.status == TaskStatus::Pending => {
                    if let Err(e) = service.admit(&current).await {
                        warn!("延迟任务 {} 入队失败: {}", task.id, e);
                    }
                }
                Ok(_) => debug!("延迟任务 {} 已不在Pending状态，跳过入队", task.id),
                Err(e) => warn!("延迟任务 {} 状态查询失败: {}", task.id, e),
            }
        });
    }

    /// 把Pending/Retrying任务放入队列（依赖放行、延迟到点、手动重跑共用）
    pub async fn admit(&self, task: &Task) -> JobCenterResult<()> {
        self.queue.enqueue(task).await?;
        self.task_repo.mark_queued(task.id, "system").await?;
        debug!("任务 {} 已入队 {}", task.id, task.queue_name);
        Ok(())
    }

    /// 批量提交。单个成员失败不阻断其余成员，失败数记入批次统计。
    pub async fn submit_batch(
        self: &Arc<Self>,
        name: &str,
        specs: Vec<TaskSpec>,
        stop_on_fail: bool,
        notify_on_complete: bool,
    ) -> JobCenterResult<TaskBatch> {
        if specs.is_empty() {
            return Err(JobCenterError::validation("批次不能为空"));
        }

        let mut batch = TaskBatch::new(name, specs.len() as i32, stop_on_fail);
        batch.notify_on_complete = notify_on_complete;
        batch.status = TaskStatus::Running;
        batch.started_at = Some(Utc::now());
        let batch = self.batch_repo.create(&batch).await?;

        let mut submit_failures = 0i32;
        for mut spec in specs {
            spec.batch_id = Some(batch.id);
            if let Err(e) = self.submit(spec).await {
                warn!("批次 {} 成员提交失败: {}", batch.id, e);
                submit_failures += 1;
            }
        }

        let mut batch = batch;
        if submit_failures > 0 {
            batch.failed_tasks = submit_failures;
            batch.pending_tasks = batch.total_tasks - submit_failures;
            self.batch_repo.update(&batch).await?;
        }

        info!(
            "批次 {} 提交完成: 共 {} 个任务, {} 个提交失败",
            batch.id, batch.total_tasks, submit_failures
        );
        Ok(batch)
    }

    /// 手动重跑：Pending任务直接入队，终态任务清零重试计数后重新入队
    pub async fn run_task_now(self: &Arc<Self>, task_id: i64) -> JobCenterResult<Task> {
        let task = self
            .task_repo
            .get_by_id(task_id)
            .await?
            .ok_or(JobCenterError::TaskNotFound { id: task_id })?;

        match task.status {
            TaskStatus::Pending => {
                self.admit(&task).await?;
            }
            TaskStatus::Failed | TaskStatus::Canceled | TaskStatus::Timeout => {
                self.task_repo.reset_for_rerun(task_id).await?;
                let reset = self
                    .task_repo
                    .get_by_id(task_id)
                    .await?
                    .ok_or(JobCenterError::TaskNotFound { id: task_id })?;
                self.admit(&reset).await?;
            }
            status => {
                return Err(JobCenterError::Validation(format!(
                    "任务 {task_id} 当前状态 {status} 不允许立即执行"
                )));
            }
        }

        self.task_repo
            .get_by_id(task_id)
            .await?
            .ok_or(JobCenterError::TaskNotFound { id: task_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobcenter_core::IdempotencyConfig;
    use jobcenter_domain::{Priority, TaskType};
    use jobcenter_infrastructure::{
        Database, MemoryTaskQueue, SqliteBatchRepository, SqliteQueueRepository,
        SqliteTaskRepository,
    };
    use std::time::Duration;

    struct Fixture {
        task_repo: Arc<SqliteTaskRepository>,
        queue: Arc<MemoryTaskQueue>,
        service: Arc<SubmissionService>,
    }

    async fn setup() -> Fixture {
        let db = Database::connect_in_memory().await.unwrap();
        let task_repo = Arc::new(SqliteTaskRepository::new(db.pool().clone()));
        let batch_repo = Arc::new(SqliteBatchRepository::new(db.pool().clone()));
        let queue_repo = Arc::new(SqliteQueueRepository::new(db.pool().clone()));
        let queue = Arc::new(MemoryTaskQueue::new(Duration::from_secs(600)));

        let mut config = QueueConfig::new("default", 5, 3);
        config.max_retry = 2;
        queue_repo.upsert(&config).await.unwrap();
        queue.register(&config).await.unwrap();

        let ledger = Arc::new(IdempotencyLedger::new(
            task_repo.clone(),
            IdempotencyConfig {
                wait_poll_interval_ms: 10,
                wait_max_polls: 3,
                sweep_interval_seconds: 60,
            },
        ));

        let service = Arc::new(SubmissionService::new(
            task_repo.clone(),
            batch_repo,
            queue_repo,
            queue.clone(),
            ledger,
            HashSet::from([ExecutorKind::Shell, ExecutorKind::Script]),
        ));

        Fixture {
            task_repo,
            queue,
            service,
        }
    }

    fn shell_spec(name: &str) -> TaskSpec {
        TaskSpec::new(name, TaskType::Command, ExecutorKind::Shell)
            .payload(serde_json::json!({ "command": "true" }))
    }

    #[tokio::test]
    async fn test_submit_enqueues_and_marks_queued() {
        use jobcenter_domain::repositories::TaskRepository as _;
        let fx = setup().await;

        let task = fx.service.submit(shell_spec("t1")).await.unwrap();
        assert!(task.id > 0);
        // 队列默认值回填
        assert_eq!(task.retry_policy.max_retry, 2);

        let stored = fx.task_repo.get_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Queued);
        assert!(stored.queued_at.is_some());
        assert_eq!(fx.queue.pending_count("default").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_validation_rejected_before_enqueue() {
        let fx = setup().await;

        let err = fx.service.submit(shell_spec("")).await.unwrap_err();
        assert!(matches!(err, JobCenterError::Validation(_)));

        let err = fx
            .service
            .submit(TaskSpec::new("t", TaskType::Command, ExecutorKind::Docker))
            .await
            .unwrap_err();
        assert!(matches!(err, JobCenterError::InvalidTaskParams(_)));

        // 幂等键缺少窗口
        let mut spec = shell_spec("t");
        spec.idempotent_key = Some("k".to_string());
        let err = fx.service.submit(spec).await.unwrap_err();
        assert!(matches!(err, JobCenterError::Validation(_)));

        // 校验失败的任务不会入队
        assert_eq!(fx.queue.pending_count("default").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_queue_full_backpressure() {
        let fx = setup().await;

        for i in 0..3 {
            fx.service.submit(shell_spec(&format!("t{i}"))).await.unwrap();
        }

        let err = fx.service.submit(shell_spec("overflow")).await.unwrap_err();
        assert!(matches!(err, JobCenterError::QueueFull { .. }));
        assert_eq!(fx.queue.pending_count("default").await.unwrap(), 3);

        // 消费一个之后可以再次提交
        fx.queue
            .dequeue("default", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        fx.service.submit(shell_spec("overflow")).await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_submission_returns_prior_task() {
        let fx = setup().await;

        let first = fx
            .service
            .submit(shell_spec("dedup").idempotent("deploy-v1", 3600))
            .await
            .unwrap();

        let second = fx
            .service
            .submit(shell_spec("dedup").idempotent("deploy-v1", 3600))
            .await
            .unwrap();

        // 第二次提交返回第一次的任务，只有一次底层入队
        assert_eq!(first.id, second.id);
        assert_eq!(fx.queue.pending_count("default").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unknown_queue_rejected() {
        let fx = setup().await;
        let err = fx
            .service
            .submit(shell_spec("t").queue("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, JobCenterError::QueueNotFound { .. }));
    }

    #[tokio::test]
    async fn test_dependency_violation_cancels_task() {
        use jobcenter_domain::repositories::TaskRepository as _;
        let fx = setup().await;

        // 依赖一个不存在的任务
        let err = fx
            .service
            .submit(shell_spec("dependent").depends_on(
                vec![9999],
                jobcenter_domain::DependencyPolicy::AllSuccess,
            ))
            .await
            .unwrap_err();

        let task_id = match err {
            JobCenterError::DependencyUnsatisfied { task_id, .. } => task_id,
            other => panic!("意外的错误类型: {other}"),
        };

        let task = fx.task_repo.get_by_id(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Canceled);
        // 被取消的任务从未进入队列
        assert_eq!(fx.queue.pending_count("default").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_dependency_wait_keeps_pending() {
        use jobcenter_domain::repositories::TaskRepository as _;
        let fx = setup().await;

        let dep = fx.service.submit(shell_spec("dep")).await.unwrap();
        let dependent = fx
            .service
            .submit(shell_spec("dependent").depends_on(
                vec![dep.id],
                jobcenter_domain::DependencyPolicy::AllSuccess,
            ))
            .await
            .unwrap();

        let stored = fx.task_repo.get_by_id(dependent.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        // 依赖未完成时不入队
        assert_eq!(fx.queue.pending_count("default").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_batch_submission() {
        let fx = setup().await;

        let batch = fx
            .service
            .submit_batch(
                "fanout",
                vec![shell_spec("b1"), shell_spec("b2")],
                true,
                false,
            )
            .await
            .unwrap();

        assert!(batch.id > 0);
        assert_eq!(batch.total_tasks, 2);
        assert!(batch.stop_on_fail);
        assert_eq!(fx.queue.pending_count("default").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_priority_applies_to_queue_order() {
        let fx = setup().await;

        fx.service
            .submit(shell_spec("low").priority(Priority::Low))
            .await
            .unwrap();
        fx.service
            .submit(shell_spec("critical").priority(Priority::Critical))
            .await
            .unwrap();

        let first = fx
            .queue
            .dequeue("default", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.name, "critical");
    }
}
