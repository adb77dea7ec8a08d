//! 依赖放行
//!
//! 依赖条件在任务进入Queued之前评估：all_success要求全部依赖成功，
//! any_success要求至少一个成功。条件已不可能满足的任务直接取消并
//! 记录原因；依赖尚未跑完的任务保持Pending，由看护循环轮询放行。

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use jobcenter_core::JobCenterResult;
use jobcenter_domain::repositories::TaskRepository;
use jobcenter_domain::{DependencyPolicy, Task, TaskStatus};

use crate::submitter::SubmissionService;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyDecision {
    /// 条件满足，可以入队
    Satisfied,
    /// 依赖尚未达到终态，继续等待
    Wait,
    /// 条件已不可能满足
    Violated(String),
}

pub struct DependencyGate {
    task_repo: Arc<dyn TaskRepository>,
}

impl DependencyGate {
    pub fn new(task_repo: Arc<dyn TaskRepository>) -> Self {
        Self { task_repo }
    }

    pub async fn evaluate(&self, task: &Task) -> JobCenterResult<DependencyDecision> {
        if task.dependencies.is_empty() {
            return Ok(DependencyDecision::Satisfied);
        }

        let statuses = self.task_repo.statuses(&task.dependencies).await?;

        let mut success = 0usize;
        let mut failed: Vec<i64> = Vec::new();
        let mut in_flight = 0usize;

        for dep_id in &task.dependencies {
            match statuses.get(dep_id) {
                None => {
                    return Ok(DependencyDecision::Violated(format!(
                        "依赖任务 {dep_id} 不存在"
                    )))
                }
                Some(TaskStatus::Success) => success += 1,
                Some(status) if status.is_terminal() => failed.push(*dep_id),
                Some(_) => in_flight += 1,
            }
        }

        let decision = match task.dependency_policy {
            DependencyPolicy::AllSuccess => {
                if !failed.is_empty() {
                    DependencyDecision::Violated(format!("依赖任务 {failed:?} 未成功"))
                } else if in_flight > 0 {
                    DependencyDecision::Wait
                } else {
                    DependencyDecision::Satisfied
                }
            }
            DependencyPolicy::AnySuccess => {
                if success > 0 {
                    DependencyDecision::Satisfied
                } else if in_flight > 0 {
                    DependencyDecision::Wait
                } else {
                    DependencyDecision::Violated("所有依赖任务均未成功".to_string())
                }
            }
        };

        debug!(
            "任务 {} 依赖评估: policy={}, 结果={:?}",
            task.id,
            task.dependency_policy.as_str(),
            decision
        );
        Ok(decision)
    }
}

/// 轮询Pending的带依赖任务，放行或取消
pub struct DependencyWatcher {
    task_repo: Arc<dyn TaskRepository>,
    gate: DependencyGate,
    submitter: Arc<SubmissionService>,
    poll_interval: Duration,
}

impl DependencyWatcher {
    pub fn new(
        task_repo: Arc<dyn TaskRepository>,
        submitter: Arc<SubmissionService>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            gate: DependencyGate::new(task_repo.clone()),
            task_repo,
            submitter,
            poll_interval,
        }
    }

    pub async fn scan_once(&self) -> JobCenterResult<usize> {
        let waiting = self.task_repo.pending_with_dependencies().await?;
        let mut admitted = 0usize;

        for task in waiting {
            match self.gate.evaluate(&task).await? {
                DependencyDecision::Satisfied => {
                    match self.submitter.admit(&task).await {
                        Ok(()) => {
                            info!("任务 {} 依赖满足，已入队", task.id);
                            admitted += 1;
                        }
                        Err(e) => warn!("任务 {} 依赖放行入队失败: {}", task.id, e),
                    }
                }
                DependencyDecision::Violated(reason) => {
                    info!("任务 {} 依赖条件无法满足，取消: {}", task.id, reason);
                    self.task_repo.cancel(task.id, "system", &reason).await?;
                }
                DependencyDecision::Wait => {}
            }
        }
        Ok(admitted)
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.scan_once().await {
                        error!("依赖扫描失败: {}", e);
                    }
                }
                _ = shutdown.cancelled() => {
                    debug!("依赖看护循环收到停止信号");
                    break;
                }
            }
        }
    }
}
