//! 批次监控
//!
//! 周期性从成员任务状态刷新批次计数，执行stop_on_fail策略，
//! 批次结束时发送通知。通知失败只记日志，不影响任务状态。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use jobcenter_core::JobCenterResult;
use jobcenter_domain::ports::{Notifier, TaskControl};
use jobcenter_domain::repositories::{BatchRepository, TaskRepository};
use jobcenter_domain::{TaskBatch, TaskStatus};

pub struct BatchMonitor {
    batch_repo: Arc<dyn BatchRepository>,
    task_repo: Arc<dyn TaskRepository>,
    control: Arc<dyn TaskControl>,
    notifier: Arc<dyn Notifier>,
    interval: Duration,
}

impl BatchMonitor {
    pub fn new(
        batch_repo: Arc<dyn BatchRepository>,
        task_repo: Arc<dyn TaskRepository>,
        control: Arc<dyn TaskControl>,
        notifier: Arc<dyn Notifier>,
        interval: Duration,
    ) -> Self {
        Self {
            batch_repo,
            task_repo,
            control,
            notifier,
            interval,
        }
    }

    /// 刷新所有活跃批次，返回仍在执行中的批次数
    pub async fn refresh_all(&self) -> JobCenterResult<usize> {
        let active = self.batch_repo.active().await?;
        let mut still_running = 0usize;

        for batch in active {
            match self.refresh_batch(batch).await {
                Ok(true) => still_running += 1,
                Ok(false) => {}
                Err(e) => error!("批次刷新失败: {}", e),
            }
        }
        Ok(still_running)
    }

    /// 刷新单个批次，返回是否仍在执行
    async fn refresh_batch(&self, mut batch: TaskBatch) -> JobCenterResult<bool> {
        let counts = self.task_repo.batch_counts(batch.id).await?;
        batch.apply_counts(&counts);

        // stop_on_fail: 出现失败后取消剩余未开始的成员
        if batch.stop_on_fail && counts.failed > 0 && !batch.is_settled() {
            self.cancel_remaining(&batch).await?;
            // 取消后重新统计
            let counts = self.task_repo.batch_counts(batch.id).await?;
            batch.apply_counts(&counts);
        }

        if batch.is_settled() {
            let now = Utc::now();
            batch.status = if batch.failed_tasks > 0 {
                TaskStatus::Failed
            } else {
                TaskStatus::Success
            };
            batch.ended_at = Some(now);
            if let Some(started) = batch.started_at {
                batch.duration_ms = Some((now - started).num_milliseconds());
            }
            self.batch_repo.update(&batch).await?;

            info!(
                "批次 {} 执行完成: 成功 {}, 失败 {}",
                batch.id, batch.success_tasks, batch.failed_tasks
            );

            if batch.notify_on_complete {
                let content = format!(
                    "批次 {} 执行完成: 成功 {}, 失败 {}",
                    batch.name, batch.success_tasks, batch.failed_tasks
                );
                if let Err(e) = self.notifier.send_message("批量任务完成", &content).await {
                    // 通知失败不影响批次状态
                    warn!("批次 {} 完成通知发送失败: {}", batch.id, e);
                }
            }
            return Ok(false);
        }

        self.batch_repo.update(&batch).await?;
        Ok(true)
    }

    async fn cancel_remaining(&self, batch: &TaskBatch) -> JobCenterResult<()> {
        let members = self.task_repo.tasks_by_batch(batch.id).await?;
        for task in members {
            if matches!(task.status, TaskStatus::Pending | TaskStatus::Queued) {
                info!("批次 {} stop_on_fail，取消成员任务 {}", batch.id, task.id);
                if let Err(e) = self
                    .control
                    .cancel_task(task.id, "system", "批次中有任务失败，stop_on_fail生效")
                    .await
                {
                    warn!("取消批次成员 {} 失败: {}", task.id, e);
                }
            }
        }
        Ok(())
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh_all().await {
                        error!("批次监控刷新失败: {}", e);
                    }
                }
                _ = shutdown.cancelled() => {
                    debug!("批次监控收到停止信号");
                    break;
                }
            }
        }
    }
}
