//! Worker执行循环
//!
//! 出队 -> 执行 -> 上报。每次尝试的开始与结束都落在单个存储事务里，
//! 超时与取消通过同一个select路径交付给执行器（协作式取消）。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use jobcenter_domain::ports::{Executor, TaskQueue};
use jobcenter_domain::repositories::TaskRepository;
use jobcenter_domain::{
    AttemptOutcome, Task, TaskExecution, TaskResult, TaskStatus, WorkerState, WorkerStatus,
};

use crate::executor_registry::ExecutorRegistry;

pub(crate) struct WorkerContext {
    pub state: Arc<RwLock<WorkerState>>,
    pub token: CancellationToken,
    pub queue: Arc<dyn TaskQueue>,
    pub task_repo: Arc<dyn TaskRepository>,
    pub executors: Arc<ExecutorRegistry>,
    pub cancel_handles: Arc<RwLock<HashMap<i64, CancellationToken>>>,
    pub dequeue_wait: Duration,
}

enum AttemptResult {
    Success(TaskResult),
    Failed(Option<TaskResult>, String),
    Timeout(String),
    Canceled,
}

pub(crate) async fn worker_loop(ctx: WorkerContext) {
    let (worker_id, queue_name) = {
        let state = ctx.state.read().await;
        (state.id.clone(), state.queue_name.clone())
    };
    info!("Worker {} 启动，绑定队列 {}", worker_id, queue_name);

    loop {
        let dequeued = tokio::select! {
            _ = ctx.token.cancelled() => break,
            result = ctx.queue.dequeue(&queue_name, ctx.dequeue_wait) => result,
        };

        {
            let mut state = ctx.state.write().await;
            state.last_heartbeat = Utc::now();
        }

        match dequeued {
            Ok(Some(task)) => {
                run_task(&ctx, &worker_id, task).await;
            }
            Ok(None) => {
                // 空轮询，回头检查停止信号
            }
            Err(e) => {
                error!("Worker {} 出队失败: {}", worker_id, e);
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }

    {
        let mut state = ctx.state.write().await;
        state.status = WorkerStatus::Stopped;
        state.current_task_id = None;
    }
    info!("Worker {} 已停止", worker_id);
}

async fn run_task(ctx: &WorkerContext, worker_id: &str, snapshot: Task) {
    let task_id = snapshot.id;

    // 出队快照可能过时（重试计数、取消），以存储为准。
    // Running状态出现在租约过期重投的场景（原worker已消亡），照常重新执行。
    let task = match ctx.task_repo.get_by_id(task_id).await {
        Ok(Some(task)) if task.status == TaskStatus::Queued => task,
        Ok(Some(task)) if task.status == TaskStatus::Running => {
            warn!("任务 {} 租约过期重投，重新执行", task_id);
            task
        }
        Ok(Some(task)) => {
            debug!(
                "任务 {} 出队后状态为 {}，跳过执行",
                task_id, task.status
            );
            let _ = ctx.queue.ack(task_id).await;
            return;
        }
        Ok(None) => {
            warn!("任务 {} 不存在，跳过执行", task_id);
            let _ = ctx.queue.ack(task_id).await;
            return;
        }
        Err(e) => {
            error!("任务 {} 状态查询失败: {}，拒收回队列", task_id, e);
            let _ = ctx.queue.nack(task_id).await;
            return;
        }
    };

    {
        let mut state = ctx.state.write().await;
        state.status = WorkerStatus::Busy;
        state.current_task_id = Some(task_id);
        state.last_heartbeat = Utc::now();
    }

    if let Err(e) = execute_attempt(ctx, worker_id, &task).await {
        error!("任务 {} 执行上报失败: {}", task_id, e);
    }

    {
        let mut state = ctx.state.write().await;
        if state.status == WorkerStatus::Busy {
            state.status = WorkerStatus::Idle;
        }
        state.current_task_id = None;
        state.tasks_handled += 1;
        state.last_heartbeat = Utc::now();
    }
}

async fn execute_attempt(
    ctx: &WorkerContext,
    worker_id: &str,
    task: &Task,
) -> jobcenter_core::JobCenterResult<()> {
    let task_id = task.id;

    let executor = match ctx.executors.get(task.executor) {
        Some(executor) => executor,
        None => {
            // 提交侧校验过注册表，到这里说明运行期配置变了
            error!("任务 {} 的执行器 {} 未注册", task_id, task.executor.as_str());
            let execution = ctx.task_repo.begin_attempt(task_id, worker_id).await?;
            ctx.task_repo
                .complete_attempt(&AttemptOutcome {
                    execution_id: execution.id,
                    task_id,
                    status: TaskStatus::Failed,
                    task_status: TaskStatus::Failed,
                    result: None,
                    error: Some(format!("执行器 {} 未注册", task.executor.as_str())),
                    worker_id: worker_id.to_string(),
                })
                .await?;
            ctx.queue.ack(task_id).await?;
            return Ok(());
        }
    };

    let execution = ctx.task_repo.begin_attempt(task_id, worker_id).await?;
    info!(
        "任务 {} 开始第 {} 次尝试 (worker: {}, timeout: {}s)",
        task_id, execution.attempt, worker_id, task.timeout_seconds
    );

    // 每个在途任务一个取消令牌，取消与超时共用一条select路径
    let cancel_token = CancellationToken::new();
    {
        let mut handles = ctx.cancel_handles.write().await;
        handles.insert(task_id, cancel_token.clone());
    }

    let timeout = Duration::from_secs(task.timeout_seconds.max(1) as u64);
    let started = std::time::Instant::now();

    let attempt_result = tokio::select! {
        result = executor.execute(task) => match result {
            Ok(r) if r.success => AttemptResult::Success(r),
            Ok(r) => {
                let reason = r
                    .error_message
                    .clone()
                    .unwrap_or_else(|| format!("退出码: {:?}", r.exit_code));
                AttemptResult::Failed(Some(r), reason)
            }
            Err(e) => AttemptResult::Failed(None, e.to_string()),
        },
        _ = tokio::time::sleep(timeout) => {
            if let Err(e) = executor.cancel(task_id).await {
                warn!("取消超时任务 {} 失败: {}", task_id, e);
            }
            AttemptResult::Timeout(format!("任务执行超时 ({}s)", task.timeout_seconds))
        }
        _ = cancel_token.cancelled() => {
            if let Err(e) = executor.cancel(task_id).await {
                warn!("取消任务 {} 失败: {}", task_id, e);
            }
            AttemptResult::Canceled
        }
    };

    {
        let mut handles = ctx.cancel_handles.write().await;
        handles.remove(&task_id);
    }

    let elapsed_ms = started.elapsed().as_millis() as u64;
    let attempt = execution.attempt;
    // 已消耗的重试次数 = attempt - 1
    let will_retry = matches!(
        attempt_result,
        AttemptResult::Failed(..) | AttemptResult::Timeout(..)
    ) && attempt <= task.retry_policy.max_retry;

    match attempt_result {
        AttemptResult::Success(result) => {
            ctx.task_repo
                .complete_attempt(&AttemptOutcome {
                    execution_id: execution.id,
                    task_id,
                    status: TaskStatus::Success,
                    task_status: TaskStatus::Success,
                    result: Some(result),
                    error: None,
                    worker_id: worker_id.to_string(),
                })
                .await?;
            ctx.queue.ack(task_id).await?;

            let mut state = ctx.state.write().await;
            state.tasks_succeeded += 1;
            metrics::counter!("jobcenter_tasks_succeeded").increment(1);
            info!("任务 {} 执行成功 ({}ms)", task_id, elapsed_ms);
        }
        AttemptResult::Canceled => {
            ctx.task_repo
                .complete_attempt(&AttemptOutcome {
                    execution_id: execution.id,
                    task_id,
                    status: TaskStatus::Canceled,
                    task_status: TaskStatus::Canceled,
                    result: None,
                    error: Some("任务被取消".to_string()),
                    worker_id: worker_id.to_string(),
                })
                .await?;
            ctx.queue.ack(task_id).await?;
            metrics::counter!("jobcenter_tasks_canceled").increment(1);
            info!("任务 {} 已取消 ({}ms)", task_id, elapsed_ms);
        }
        AttemptResult::Failed(result, reason) => {
            handle_failure(
                ctx,
                worker_id,
                task,
                &execution,
                TaskStatus::Failed,
                result,
                reason,
                will_retry,
            )
            .await?;
        }
        AttemptResult::Timeout(reason) => {
            metrics::counter!("jobcenter_tasks_timeout").increment(1);
            handle_failure(
                ctx,
                worker_id,
                task,
                &execution,
                TaskStatus::Timeout,
                None,
                reason,
                will_retry,
            )
            .await?;
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn handle_failure(
    ctx: &WorkerContext,
    worker_id: &str,
    task: &Task,
    execution: &TaskExecution,
    attempt_status: TaskStatus,
    result: Option<TaskResult>,
    reason: String,
    will_retry: bool,
) -> jobcenter_core::JobCenterResult<()> {
    let task_id = task.id;

    // 重试中的任务保持Timeout/Failed过渡状态；终态失败统一落Failed
    let task_status = if will_retry {
        attempt_status
    } else {
        TaskStatus::Failed
    };

    ctx.task_repo
        .complete_attempt(&AttemptOutcome {
            execution_id: execution.id,
            task_id,
            status: attempt_status,
            task_status,
            result,
            error: Some(reason.clone()),
            worker_id: worker_id.to_string(),
        })
        .await?;
    ctx.queue.ack(task_id).await?;

    {
        let mut state = ctx.state.write().await;
        state.tasks_failed += 1;
    }
    metrics::counter!("jobcenter_tasks_failed").increment(1);

    if will_retry {
        let new_retry_count = execution.attempt;
        let base_delay = task.retry_policy.delay_for_attempt(new_retry_count);
        // 随机抖动避免雷群
        let jitter_ms =
            (base_delay.num_milliseconds() as f64 * 0.1 * rand::random::<f64>()) as i64;
        let delay = base_delay + chrono::Duration::milliseconds(jitter_ms);
        let next_at = Utc::now() + delay;

        warn!(
            "任务 {} 第 {} 次尝试失败 ({})，{}s后重试",
            task_id,
            execution.attempt,
            reason,
            delay.num_seconds()
        );
        ctx.task_repo
            .mark_retrying(task_id, new_retry_count, next_at, &reason)
            .await?;

        let queue = ctx.queue.clone();
        let task_repo = ctx.task_repo.clone();
        let mut retry_task = task.clone();
        retry_task.retry_count = new_retry_count;
        tokio::spawn(async move {
            tokio::time::sleep(delay.to_std().unwrap_or_default()).await;
            requeue_retry(queue, task_repo, retry_task).await;
        });
    } else {
        error!(
            "任务 {} 重试次数耗尽，最后一次失败: {}",
            task_id, reason
        );
        if task.rollback_enabled() {
            run_rollback(ctx, worker_id, task, execution).await;
        }
    }

    Ok(())
}

/// 退避到期后把Retrying任务放回队列。队列持续满载时放弃并取消任务，
/// 留下明确的终态而不是无限等待。
async fn requeue_retry(
    queue: Arc<dyn TaskQueue>,
    task_repo: Arc<dyn TaskRepository>,
    task: Task,
) {
    let task_id = task.id;

    match task_repo.requeue_after_retry(task_id).await {
        Ok(()) => {}
        Err(e) => {
            // 等待期间被取消
            debug!("任务 {} 重试入队跳过: {}", task_id, e);
            return;
        }
    }

    for attempt in 0..5 {
        match queue.enqueue(&task).await {
            Ok(()) => {
                debug!("任务 {} 重试已入队", task_id);
                return;
            }
            Err(e) => {
                warn!("任务 {} 重试入队失败 ({}/5): {}", task_id, attempt + 1, e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }

    error!("任务 {} 重试入队持续失败，任务取消", task_id);
    if let Err(e) = task_repo
        .cancel(task_id, "system", "重试入队失败: 队列已满")
        .await
    {
        error!("任务 {} 取消失败: {}", task_id, e);
    }
}

/// 回滚只执行一次，尽力而为；回滚自身的失败记录在案但不再重试
async fn run_rollback(
    ctx: &WorkerContext,
    worker_id: &str,
    task: &Task,
    execution: &TaskExecution,
) {
    let task_id = task.id;
    let payload = match &task.rollback_payload {
        Some(payload) => payload.clone(),
        None => return,
    };

    info!("任务 {} 开始执行回滚", task_id);

    let executor = match ctx.executors.get(task.executor) {
        Some(executor) => executor,
        None => {
            error!("任务 {} 回滚失败: 执行器未注册", task_id);
            return;
        }
    };

    let mut rollback_task = task.clone();
    rollback_task.payload = payload;
    rollback_task.name = format!("{}-rollback", task.name);

    let timeout = Duration::from_secs(task.timeout_seconds.max(1) as u64);
    let outcome = tokio::select! {
        result = executor.execute(&rollback_task) => result,
        _ = tokio::time::sleep(timeout) => {
            let _ = executor.cancel(task_id).await;
            Err(jobcenter_core::JobCenterError::ExecutionTimeout {
                timeout_seconds: task.timeout_seconds,
            })
        }
    };

    let (summary, success) = match outcome {
        Ok(result) if result.success => {
            let summary = result.stdout.unwrap_or_else(|| "rollback ok".to_string());
            (summary, true)
        }
        Ok(result) => {
            let summary = result
                .error_message
                .unwrap_or_else(|| "rollback failed".to_string());
            (summary, false)
        }
        Err(e) => (e.to_string(), false),
    };

    if success {
        info!("任务 {} 回滚完成 (worker: {})", task_id, worker_id);
    } else {
        error!("任务 {} 回滚失败: {}", task_id, summary);
    }

    if let Err(e) = ctx
        .task_repo
        .record_rollback(execution.id, task_id, &summary, success)
        .await
    {
        error!("任务 {} 回滚记录写入失败: {}", task_id, e);
    }
    metrics::counter!("jobcenter_tasks_rolledback").increment(1);
}
