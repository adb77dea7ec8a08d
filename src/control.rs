//! 任务取消
//!
//! 排队中的任务直接移出队列，永远不会触达执行器；执行中的任务
//! 通过取消令牌协作式停止，由worker记录Canceled终态。

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use jobcenter_core::{JobCenterError, JobCenterResult};
use jobcenter_domain::ports::{TaskControl, TaskQueue};
use jobcenter_domain::repositories::TaskRepository;
use jobcenter_domain::TaskStatus;
use jobcenter_worker::WorkerPool;

pub struct EngineTaskControl {
    task_repo: Arc<dyn TaskRepository>,
    queue: Arc<dyn TaskQueue>,
    pool: Arc<WorkerPool>,
}

impl EngineTaskControl {
    pub fn new(
        task_repo: Arc<dyn TaskRepository>,
        queue: Arc<dyn TaskQueue>,
        pool: Arc<WorkerPool>,
    ) -> Self {
        Self {
            task_repo,
            queue,
            pool,
        }
    }
}

#[async_trait]
impl TaskControl for EngineTaskControl {
    async fn cancel_task(&self, task_id: i64, source: &str, reason: &str) -> JobCenterResult<()> {
        let task = self
            .task_repo
            .get_by_id(task_id)
            .await?
            .ok_or(JobCenterError::TaskNotFound { id: task_id })?;

        match task.status {
            TaskStatus::Pending | TaskStatus::Retrying => {
                self.task_repo.cancel(task_id, source, reason).await?;
                info!("取消任务 {} (状态: {})", task_id, task.status);
            }
            TaskStatus::Queued => {
                let removed = self.queue.remove(task_id).await?;
                debug!("任务 {} 从队列移除: {}", task_id, removed);
                self.task_repo.cancel(task_id, source, reason).await?;
                info!("取消排队中的任务 {}", task_id);
            }
            TaskStatus::Running => {
                if self.pool.cancel_task(task_id).await {
                    // worker观察到取消信号后记录终态
                    info!("已向执行中的任务 {} 发送取消信号", task_id);
                } else {
                    // 不在本节点执行（或worker已消亡），直接落终态
                    self.task_repo.cancel(task_id, source, reason).await?;
                    info!("任务 {} 不在本节点执行，直接标记取消", task_id);
                }
            }
            status => {
                return Err(JobCenterError::Validation(format!(
                    "任务 {task_id} 已处于终态 {status}，无法取消"
                )));
            }
        }

        Ok(())
    }
}
