//! 引擎与外部协作方之间的窄接口

use async_trait::async_trait;
use std::time::Duration;

use jobcenter_core::JobCenterResult;

use crate::models::queue::QueueConfig;
use crate::models::task::{ExecutorKind, Task, TaskResult};

/// 任务队列后端。实现必须支持任意数量生产者与worker的并发访问，
/// 队列内保证优先级高者先出、同优先级按创建时间先进先出。
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// 注册/更新一个命名队列的容量策略
    async fn register(&self, config: &QueueConfig) -> JobCenterResult<()>;
    /// 入队。队列达到max_pending时立即返回QueueFull，不阻塞
    async fn enqueue(&self, task: &Task) -> JobCenterResult<()>;
    /// 出队，最多阻塞`wait`。超时返回Ok(None)作为正常的空轮询信号。
    /// 出队的任务持有租约，租约到期未确认会被重新投递（至少一次投递）。
    async fn dequeue(&self, queue_name: &str, wait: Duration) -> JobCenterResult<Option<Task>>;
    /// 确认：执行已报告终态，移除在途跟踪
    async fn ack(&self, task_id: i64) -> JobCenterResult<()>;
    /// 拒收：任务放回同优先级队头。不修改重试计数，重试归Worker池管
    async fn nack(&self, task_id: i64) -> JobCenterResult<()>;
    /// 把仍在排队的任务移出队列（取消路径），移除成功返回true
    async fn remove(&self, task_id: i64) -> JobCenterResult<bool>;
    async fn pending_count(&self, queue_name: &str) -> JobCenterResult<usize>;
    async fn in_flight_count(&self, queue_name: &str) -> JobCenterResult<usize>;
    /// 清空队列，返回清除的任务数
    async fn purge(&self, queue_name: &str) -> JobCenterResult<usize>;
    /// 回收租约过期的在途任务（重新投递），返回任务ID列表
    async fn reclaim_expired(&self) -> JobCenterResult<Vec<i64>>;
}

/// 任务执行器。宿主应用提供具体实现（shell/ssh/http/docker/kubernetes/script）。
/// 执行必须支持协作式取消：cancel之后execute应尽快返回。
#[async_trait]
pub trait Executor: Send + Sync {
    fn kind(&self) -> ExecutorKind;
    /// Err表示执行器基础设施故障；执行失败（非零退出）用 success=false 的结果表达
    async fn execute(&self, task: &Task) -> JobCenterResult<TaskResult>;
    async fn cancel(&self, task_id: i64) -> JobCenterResult<()>;
    async fn is_running(&self, task_id: i64) -> bool;
}

/// 通知接口。通知失败只记录日志，绝不影响任务状态。
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_message(&self, title: &str, content: &str) -> JobCenterResult<()>;
}

/// 任务控制接口，供cron replace策略等内部协作方取消在途任务
#[async_trait]
pub trait TaskControl: Send + Sync {
    async fn cancel_task(&self, task_id: i64, source: &str, reason: &str) -> JobCenterResult<()>;
}
