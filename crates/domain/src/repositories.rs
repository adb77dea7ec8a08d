//! 领域仓储抽象
//!
//! 定义数据访问的抽象接口，遵循依赖倒置原则。
//! 涉及状态转移的方法必须在单个事务内同时落任务、执行记录与事件，
//! 并发读取方不允许观察到缺少执行记录的终态任务。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use jobcenter_core::JobCenterResult;

use crate::models::batch::{BatchCounts, TaskBatch};
use crate::models::cron::{CronExecution, CronJob};
use crate::models::event::{TaskEvent, TaskEventKind};
use crate::models::lease::LeaderLease;
use crate::models::queue::QueueConfig;
use crate::models::task::{
    AttemptOutcome, Task, TaskExecution, TaskFilter, TaskStatus,
};

/// 任务仓储抽象
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn create(&self, task: &Task) -> JobCenterResult<Task>;
    async fn get_by_id(&self, id: i64) -> JobCenterResult<Option<Task>>;
    /// 去重窗口内（created_at在窗口内）的同幂等键任务
    async fn get_by_idempotent_key(&self, key: &str) -> JobCenterResult<Option<Task>>;
    async fn list(&self, filter: &TaskFilter) -> JobCenterResult<(Vec<Task>, i64)>;

    /// 入队成功：status -> Queued，记录queue_at与`queued`事件（单事务）
    async fn mark_queued(&self, task_id: i64, source: &str) -> JobCenterResult<()>;
    /// 尝试开始：status -> Running，插入执行记录与`started`事件（单事务）
    async fn begin_attempt(&self, task_id: i64, worker_id: &str) -> JobCenterResult<TaskExecution>;
    /// 尝试结束：更新执行记录、任务状态/结果与终态事件（单事务）
    async fn complete_attempt(&self, outcome: &AttemptOutcome) -> JobCenterResult<()>;
    /// 安排重试：status -> Retrying，递增retry_count，记录`retrying`事件（单事务）
    async fn mark_retrying(
        &self,
        task_id: i64,
        retry_count: i32,
        next_at: DateTime<Utc>,
        reason: &str,
    ) -> JobCenterResult<()>;
    /// 回滚完成：执行记录补写回滚结果，任务 -> Rolledback，记录`rolled_back`事件（单事务）
    async fn record_rollback(
        &self,
        execution_id: i64,
        task_id: i64,
        rollback_result: &str,
        success: bool,
    ) -> JobCenterResult<()>;
    /// 取消：status -> Canceled，记录`cancelled`事件（单事务）
    async fn cancel(&self, task_id: i64, source: &str, reason: &str) -> JobCenterResult<()>;
    /// 重新入队前将Retrying任务置回Queued（单事务，含`queued`事件）
    async fn requeue_after_retry(&self, task_id: i64) -> JobCenterResult<()>;
    /// 手动重跑：清空重试计数与上次结果，状态置回Pending
    async fn reset_for_rerun(&self, task_id: i64) -> JobCenterResult<()>;

    async fn record_event(
        &self,
        task_id: i64,
        kind: TaskEventKind,
        source: &str,
        payload: serde_json::Value,
    ) -> JobCenterResult<()>;

    async fn executions(&self, task_id: i64) -> JobCenterResult<Vec<TaskExecution>>;
    async fn events(&self, task_id: i64) -> JobCenterResult<Vec<TaskEvent>>;

    /// 一组任务的当前状态
    async fn statuses(&self, ids: &[i64]) -> JobCenterResult<HashMap<i64, TaskStatus>>;
    /// 等待依赖放行的Pending任务
    async fn pending_with_dependencies(&self) -> JobCenterResult<Vec<Task>>;
    async fn batch_counts(&self, batch_id: i64) -> JobCenterResult<BatchCounts>;
    async fn tasks_by_batch(&self, batch_id: i64) -> JobCenterResult<Vec<Task>>;
    /// (queued, running) 计数，供队列管理面使用
    async fn queue_counts(&self, queue_name: &str) -> JobCenterResult<(i64, i64)>;
}

/// 批次仓储抽象
#[async_trait]
pub trait BatchRepository: Send + Sync {
    async fn create(&self, batch: &TaskBatch) -> JobCenterResult<TaskBatch>;
    async fn get_by_id(&self, id: i64) -> JobCenterResult<Option<TaskBatch>>;
    async fn update(&self, batch: &TaskBatch) -> JobCenterResult<()>;
    /// 尚未达到终态的批次
    async fn active(&self) -> JobCenterResult<Vec<TaskBatch>>;
}

/// 定时任务仓储抽象
#[async_trait]
pub trait CronRepository: Send + Sync {
    async fn create_job(&self, job: &CronJob) -> JobCenterResult<CronJob>;
    async fn get_job(&self, id: i64) -> JobCenterResult<Option<CronJob>>;
    async fn list_jobs(&self, enabled_only: bool) -> JobCenterResult<Vec<CronJob>>;
    async fn update_job(&self, job: &CronJob) -> JobCenterResult<()>;
    async fn delete_job(&self, id: i64) -> JobCenterResult<bool>;

    async fn create_execution(&self, execution: &CronExecution) -> JobCenterResult<CronExecution>;
    async fn update_execution(&self, execution: &CronExecution) -> JobCenterResult<()>;
    async fn latest_execution(&self, cron_job_id: i64) -> JobCenterResult<Option<CronExecution>>;
    async fn executions(&self, cron_job_id: i64, limit: i64)
        -> JobCenterResult<Vec<CronExecution>>;
}

/// 队列配置仓储抽象
#[async_trait]
pub trait QueueRepository: Send + Sync {
    async fn upsert(&self, config: &QueueConfig) -> JobCenterResult<()>;
    async fn get(&self, name: &str) -> JobCenterResult<Option<QueueConfig>>;
    async fn list(&self) -> JobCenterResult<Vec<QueueConfig>>;
}

/// Leader租约仓储抽象。获取/续约必须是单条带条件的原子语句，
/// 不允许出现两个节点同时认为自己持有租约的读改写竞态。
#[async_trait]
pub trait LeaseRepository: Send + Sync {
    /// 尝试获取或续约租约，成功返回true
    async fn try_acquire(
        &self,
        key: &str,
        node_id: &str,
        ttl_seconds: i64,
    ) -> JobCenterResult<bool>;
    /// 主动放弃租约（仅当自己是持有者）
    async fn release(&self, key: &str, node_id: &str) -> JobCenterResult<()>;
    async fn current(&self, key: &str) -> JobCenterResult<Option<LeaderLease>>;
}
