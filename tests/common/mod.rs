//! 集成测试公共设施

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use jobcenter::domain::ports::Executor;
use jobcenter::domain::{ExecutorKind, Task, TaskResult, TaskStatus};
use jobcenter::{AppConfig, ExecutorRegistry, JobCenter, JobCenterResult};
use jobcenter_core::QueueSettings;

/// 按payload里的behavior字段行动的测试执行器
pub struct MockExecutor;

#[async_trait]
impl Executor for MockExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Shell
    }

    async fn execute(&self, task: &Task) -> JobCenterResult<TaskResult> {
        if let Some(ms) = task.payload.get("sleep_ms").and_then(|v| v.as_u64()) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        match task.payload.get("behavior").and_then(|v| v.as_str()) {
            Some("fail") => Ok(TaskResult::failure(Some(1), "simulated failure", 5)),
            _ => Ok(TaskResult::success_with_output("done", 5)),
        }
    }

    async fn cancel(&self, _task_id: i64) -> JobCenterResult<()> {
        Ok(())
    }

    async fn is_running(&self, _task_id: i64) -> bool {
        false
    }
}

pub fn registry() -> ExecutorRegistry {
    ExecutorRegistry::new().with(Arc::new(MockExecutor))
}

/// 快节奏的测试配置
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.node.node_id = Some("test-node".to_string());
    config.worker.dequeue_wait_seconds = 1;
    config.worker.shutdown_grace_seconds = 1;
    config.batch.monitor_interval_seconds = 1;
    config.idempotency.wait_poll_interval_ms = 50;
    config.idempotency.wait_max_polls = 100;
    config.queues = vec![
        QueueSettings {
            name: "default".to_string(),
            max_workers: 2,
            max_pending: 1000,
            priority: 5,
            timeout_seconds: 300,
            max_retry: 3,
        },
        QueueSettings {
            name: "critical".to_string(),
            max_workers: 5,
            max_pending: 100,
            priority: 20,
            timeout_seconds: 600,
            max_retry: 5,
        },
    ];
    config
}

pub async fn wait_for_status(
    center: &JobCenter,
    task_id: i64,
    status: TaskStatus,
    timeout: Duration,
) -> Task {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        let task = center.get_task(task_id).await.unwrap().unwrap();
        if task.status == status {
            return task;
        }
        if std::time::Instant::now() > deadline {
            panic!(
                "任务 {} 等待状态 {} 超时，当前状态 {}",
                task_id, status, task.status
            );
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
}
