mod batch_repository;
mod cron_repository;
mod lease_repository;
mod queue_repository;
mod task_repository;

pub use batch_repository::SqliteBatchRepository;
pub use cron_repository::SqliteCronRepository;
pub use lease_repository::SqliteLeaseRepository;
pub use queue_repository::SqliteQueueRepository;
pub use task_repository::SqliteTaskRepository;

#[cfg(test)]
mod repository_tests {
    use super::*;
    use crate::database::Database;
    use chrono::Utc;
    use jobcenter_domain::repositories::{
        BatchRepository, CronRepository, LeaseRepository, QueueRepository, TaskRepository,
    };
    use jobcenter_domain::{
        AttemptOutcome, CronJob, ExecutorKind, QueueConfig, Task, TaskBatch, TaskEventKind,
        TaskResult, TaskSpec, TaskStatus, TaskType,
    };

    async fn setup() -> Database {
        Database::connect_in_memory().await.unwrap()
    }

    fn sample_task(queue: &str) -> Task {
        TaskSpec::new("restart-nginx", TaskType::Command, ExecutorKind::Shell)
            .payload(serde_json::json!({ "command": "systemctl restart nginx" }))
            .queue(queue)
            .into_task(None, None)
    }

    #[tokio::test]
    async fn test_task_roundtrip() {
        let db = setup().await;
        let repo = SqliteTaskRepository::new(db.pool().clone());

        let created = repo.create(&sample_task("default")).await.unwrap();
        assert!(created.id > 0);

        let fetched = repo.get_by_id(created.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "restart-nginx");
        assert_eq!(fetched.status, TaskStatus::Pending);
        assert_eq!(fetched.executor, ExecutorKind::Shell);
        assert_eq!(
            fetched.payload,
            serde_json::json!({ "command": "systemctl restart nginx" })
        );
        assert_eq!(fetched.queue_name, "default");

        assert!(repo.get_by_id(9999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_attempt_lifecycle_writes_all_rows() {
        let db = setup().await;
        let repo = SqliteTaskRepository::new(db.pool().clone());

        let task = repo.create(&sample_task("default")).await.unwrap();
        repo.mark_queued(task.id, "test").await.unwrap();

        let execution = repo.begin_attempt(task.id, "worker-1").await.unwrap();
        assert_eq!(execution.attempt, 1);

        let running = repo.get_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(running.status, TaskStatus::Running);
        assert_eq!(running.worker_id.as_deref(), Some("worker-1"));

        repo.complete_attempt(&AttemptOutcome {
            execution_id: execution.id,
            task_id: task.id,
            status: TaskStatus::Success,
            task_status: TaskStatus::Success,
            result: Some(TaskResult::success_with_output("ok", 42)),
            error: None,
            worker_id: "worker-1".to_string(),
        })
        .await
        .unwrap();

        // 终态任务必须带有完整的执行记录与事件轨迹
        let done = repo.get_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Success);
        assert!(done.result.unwrap().success);

        let executions = repo.executions(task.id).await.unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, TaskStatus::Success);
        assert!(executions[0].ended_at.is_some());

        let events = repo.events(task.id).await.unwrap();
        let kinds: Vec<TaskEventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TaskEventKind::Queued,
                TaskEventKind::Started,
                TaskEventKind::Succeeded
            ]
        );
    }

    #[tokio::test]
    async fn test_retry_and_rollback_path() {
        let db = setup().await;
        let repo = SqliteTaskRepository::new(db.pool().clone());

        let mut task = sample_task("default");
        task.retry_policy.max_retry = 1;
        task.rollback_payload = Some(serde_json::json!({ "command": "rollback.sh" }));
        let task = repo.create(&task).await.unwrap();

        repo.mark_queued(task.id, "test").await.unwrap();
        let execution = repo.begin_attempt(task.id, "worker-1").await.unwrap();
        repo.complete_attempt(&AttemptOutcome {
            execution_id: execution.id,
            task_id: task.id,
            status: TaskStatus::Failed,
            task_status: TaskStatus::Failed,
            result: Some(TaskResult::failure(Some(1), "boom", 10)),
            error: Some("boom".to_string()),
            worker_id: "worker-1".to_string(),
        })
        .await
        .unwrap();

        repo.mark_retrying(task.id, 1, Utc::now(), "exit 1").await.unwrap();
        repo.requeue_after_retry(task.id).await.unwrap();

        let second = repo.begin_attempt(task.id, "worker-2").await.unwrap();
        assert_eq!(second.attempt, 2);
        repo.complete_attempt(&AttemptOutcome {
            execution_id: second.id,
            task_id: task.id,
            status: TaskStatus::Failed,
            task_status: TaskStatus::Failed,
            result: Some(TaskResult::failure(Some(1), "boom", 10)),
            error: Some("boom".to_string()),
            worker_id: "worker-2".to_string(),
        })
        .await
        .unwrap();

        repo.record_rollback(second.id, task.id, "rolled back ok", true)
            .await
            .unwrap();

        let done = repo.get_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Rolledback);

        let executions = repo.executions(task.id).await.unwrap();
        assert_eq!(executions.len(), 2);
        assert!(executions[1].rollback_at.is_some());
        assert_eq!(
            executions[1].rollback_result.as_deref(),
            Some("rolled back ok")
        );
    }

    #[tokio::test]
    async fn test_idempotent_key_respects_window() {
        let db = setup().await;
        let repo = SqliteTaskRepository::new(db.pool().clone());

        let mut task = sample_task("default");
        task.idempotent_key = Some("backup-db".to_string());
        task.dedup_window_seconds = 3600;
        repo.create(&task).await.unwrap();

        assert!(repo
            .get_by_idempotent_key("backup-db")
            .await
            .unwrap()
            .is_some());
        assert!(repo.get_by_idempotent_key("other").await.unwrap().is_none());

        // 窗口过期的记录视为不存在
        let mut expired = sample_task("default");
        expired.idempotent_key = Some("stale-key".to_string());
        expired.dedup_window_seconds = 60;
        expired.created_at = Utc::now() - chrono::Duration::seconds(120);
        repo.create(&expired).await.unwrap();
        assert!(repo
            .get_by_idempotent_key("stale-key")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_cancel_records_reason() {
        let db = setup().await;
        let repo = SqliteTaskRepository::new(db.pool().clone());

        let task = repo.create(&sample_task("default")).await.unwrap();
        repo.cancel(task.id, "user", "operator canceled").await.unwrap();

        let canceled = repo.get_by_id(task.id).await.unwrap().unwrap();
        assert_eq!(canceled.status, TaskStatus::Canceled);
        assert_eq!(canceled.error.as_deref(), Some("operator canceled"));

        let events = repo.events(task.id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, TaskEventKind::Cancelled);
        assert_eq!(events[0].source, "user");
    }

    #[tokio::test]
    async fn test_batch_counts_by_status() {
        let db = setup().await;
        let repo = SqliteTaskRepository::new(db.pool().clone());
        let batch_repo = SqliteBatchRepository::new(db.pool().clone());

        let batch = batch_repo
            .create(&TaskBatch::new("fanout", 3, false))
            .await
            .unwrap();

        for _ in 0..3 {
            let mut task = sample_task("default");
            task.batch_id = Some(batch.id);
            repo.create(&task).await.unwrap();
        }

        let counts = repo.batch_counts(batch.id).await.unwrap();
        assert_eq!(counts.pending, 3);
        assert_eq!(counts.running, 0);

        let members = repo.tasks_by_batch(batch.id).await.unwrap();
        assert_eq!(members.len(), 3);
    }

    #[tokio::test]
    async fn test_queue_config_upsert() {
        let db = setup().await;
        let repo = SqliteQueueRepository::new(db.pool().clone());

        let mut config = QueueConfig::new("critical", 5, 100);
        repo.upsert(&config).await.unwrap();

        config.max_pending = 200;
        repo.upsert(&config).await.unwrap();

        let fetched = repo.get("critical").await.unwrap().unwrap();
        assert_eq!(fetched.max_pending, 200);
        assert_eq!(repo.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cron_job_and_executions() {
        let db = setup().await;
        let repo = SqliteCronRepository::new(db.pool().clone());

        let job = repo
            .create_job(&CronJob::new(
                "nightly-backup",
                "0 0 2 * * *",
                serde_json::json!({ "name": "backup", "task_type": "backup" }),
            ))
            .await
            .unwrap();
        assert!(job.id > 0);

        let execution = repo
            .create_execution(&jobcenter_domain::CronExecution {
                id: 0,
                cron_job_id: job.id,
                task_id: None,
                node_id: "node-1".to_string(),
                scheduled_at: Utc::now(),
                fired_at: Utc::now(),
                status: TaskStatus::Pending,
                error: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let mut updated = execution.clone();
        updated.task_id = Some(42);
        updated.status = TaskStatus::Queued;
        repo.update_execution(&updated).await.unwrap();

        let latest = repo.latest_execution(job.id).await.unwrap().unwrap();
        assert_eq!(latest.task_id, Some(42));
        assert_eq!(latest.status, TaskStatus::Queued);

        assert!(repo.delete_job(job.id).await.unwrap());
        assert!(repo.get_job(job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lease_cas_single_holder() {
        let db = setup().await;
        let repo = SqliteLeaseRepository::new(db.pool().clone());

        // 节点1获取成功，节点2在租约有效期内获取失败
        assert!(repo.try_acquire("cron", "node-1", 30).await.unwrap());
        assert!(!repo.try_acquire("cron", "node-2", 30).await.unwrap());

        // 持有者续约成功
        assert!(repo.try_acquire("cron", "node-1", 30).await.unwrap());

        let lease = repo.current("cron").await.unwrap().unwrap();
        assert_eq!(lease.holder, "node-1");

        // 释放后其他节点可以获取
        repo.release("cron", "node-1").await.unwrap();
        assert!(repo.try_acquire("cron", "node-2", 30).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let db = setup().await;
        let repo = SqliteLeaseRepository::new(db.pool().clone());

        // TTL为0的租约立即过期
        assert!(repo.try_acquire("cron", "node-1", 0).await.unwrap());
        assert!(repo.try_acquire("cron", "node-2", 30).await.unwrap());

        let lease = repo.current("cron").await.unwrap().unwrap();
        assert_eq!(lease.holder, "node-2");
    }
}
