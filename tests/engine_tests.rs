//! 引擎端到端测试：提交 -> 队列 -> worker -> 执行器 -> 存储回写

mod common;

use std::time::Duration;

use common::{registry, test_config, wait_for_status};
use jobcenter::domain::{
    DependencyPolicy, ExecutorKind, Priority, RetryPolicy, TaskEventKind, TaskSpec, TaskStatus,
    TaskType,
};
use jobcenter::{JobCenter, JobCenterError};

fn shell_spec(name: &str, payload: serde_json::Value) -> TaskSpec {
    TaskSpec::new(name, TaskType::Command, ExecutorKind::Shell).payload(payload)
}

async fn start_center() -> JobCenter {
    let center = JobCenter::new_in_memory(test_config(), registry(), None)
        .await
        .unwrap();
    center.start().await.unwrap();
    center
}

#[tokio::test]
async fn test_submit_executes_and_records_trail() {
    let center = start_center().await;

    let task = center
        .create_task(shell_spec("e2e-ok", serde_json::json!({ "behavior": "ok" })))
        .await
        .unwrap();

    let done = wait_for_status(&center, task.id, TaskStatus::Success, Duration::from_secs(10)).await;
    assert!(done.result.unwrap().success);

    let executions = center.task_executions(task.id).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].attempt, 1);

    let events = center.task_events(task.id).await.unwrap();
    let kinds: Vec<TaskEventKind> = events.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            TaskEventKind::Queued,
            TaskEventKind::Started,
            TaskEventKind::Succeeded
        ]
    );

    center.stop().await;
}

#[tokio::test]
async fn test_idempotent_submission_single_execution() {
    let center = start_center().await;

    let first = center
        .create_task(
            shell_spec("dedup", serde_json::json!({ "behavior": "ok" }))
                .idempotent("release-v3", 3600),
        )
        .await
        .unwrap();

    wait_for_status(&center, first.id, TaskStatus::Success, Duration::from_secs(10)).await;

    // 窗口内的第二次提交返回第一次的结果，没有新的执行
    let second = center
        .create_task(
            shell_spec("dedup", serde_json::json!({ "behavior": "ok" }))
                .idempotent("release-v3", 3600),
        )
        .await
        .unwrap();

    assert_eq!(second.id, first.id);
    assert_eq!(second.status, TaskStatus::Success);
    assert_eq!(center.task_executions(first.id).await.unwrap().len(), 1);

    center.stop().await;
}

#[tokio::test]
async fn test_retry_exhaustion_end_to_end() {
    let center = start_center().await;

    let task = center
        .create_task(
            shell_spec("always-fails", serde_json::json!({ "behavior": "fail" })).retry(
                RetryPolicy {
                    max_retry: 2,
                    retry_delay_seconds: 0,
                    ..Default::default()
                },
            ),
        )
        .await
        .unwrap();

    let done = wait_for_status(&center, task.id, TaskStatus::Failed, Duration::from_secs(15)).await;
    assert_eq!(done.retry_count, 2);
    assert!(done.error.is_some());

    // MaxRetry=2 恰好3条执行记录，事件轨迹包含两次retrying
    let executions = center.task_executions(task.id).await.unwrap();
    assert_eq!(executions.len(), 3);

    let events = center.task_events(task.id).await.unwrap();
    let retrying = events
        .iter()
        .filter(|e| e.kind == TaskEventKind::Retrying)
        .count();
    assert_eq!(retrying, 2);

    center.stop().await;
}

#[tokio::test]
async fn test_backpressure_scenario_on_critical_queue() {
    let center = start_center().await;

    // 腾空worker，确保任务全部滞留队列
    center.scale_workers("critical", 0).await.unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let stats = center.worker_stats("critical").await;
        if stats.idle_workers + stats.busy_workers == 0 {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "缩容超时");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    for i in 0..100 {
        center
            .create_task(
                shell_spec(
                    &format!("burst-{i}"),
                    serde_json::json!({ "sleep_ms": 60_000 }),
                )
                .queue("critical")
                .priority(Priority::High)
                .timeout(120),
            )
            .await
            .unwrap();
    }

    // 第101个提交收到背压错误
    let err = center
        .create_task(
            shell_spec("burst-101", serde_json::json!({ "sleep_ms": 60_000 }))
                .queue("critical")
                .priority(Priority::High)
                .timeout(120),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, JobCenterError::QueueFull { .. }));

    // 拉起一个worker消化一个任务后，重新提交成功
    center.scale_workers("critical", 1).await.unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        let queues = center.list_queues().await.unwrap();
        let critical = queues
            .iter()
            .find(|q| q.config.name == "critical")
            .unwrap();
        if critical.pending < 100 {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "队列未消化任务");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    center
        .create_task(
            shell_spec("burst-retry", serde_json::json!({ "sleep_ms": 60_000 }))
                .queue("critical")
                .priority(Priority::High)
                .timeout(120),
        )
        .await
        .unwrap();

    center.stop().await;
}

#[tokio::test]
async fn test_cancel_queued_task_never_executes() {
    let center = start_center().await;
    center.scale_workers("default", 0).await.unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let stats = center.worker_stats("default").await;
        if stats.idle_workers + stats.busy_workers == 0 {
            break;
        }
        assert!(std::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let task = center
        .create_task(shell_spec("queued-cancel", serde_json::json!({ "behavior": "ok" })))
        .await
        .unwrap();

    center.cancel_task(task.id, "不再需要").await.unwrap();

    let canceled = center.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(canceled.status, TaskStatus::Canceled);
    // 排队中取消的任务绝不产生执行记录
    assert!(center.task_executions(task.id).await.unwrap().is_empty());

    // 终态任务重复取消报错
    assert!(center.cancel_task(task.id, "再取消一次").await.is_err());

    center.stop().await;
}

#[tokio::test]
async fn test_cancel_running_task_records_single_canceled_execution() {
    let center = start_center().await;

    let task = center
        .create_task(
            shell_spec("running-cancel", serde_json::json!({ "sleep_ms": 60_000 })).timeout(120),
        )
        .await
        .unwrap();

    // 等任务进入执行中
    wait_for_status(&center, task.id, TaskStatus::Running, Duration::from_secs(10)).await;
    center.cancel_task(task.id, "手动停止").await.unwrap();

    wait_for_status(&center, task.id, TaskStatus::Canceled, Duration::from_secs(10)).await;
    let executions = center.task_executions(task.id).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].status, TaskStatus::Canceled);

    center.stop().await;
}

#[tokio::test]
async fn test_dependency_admission_after_dep_succeeds() {
    let center = start_center().await;

    // 依赖任务短暂执行中，保证被依赖方提交时走等待路径
    let dep = center
        .create_task(shell_spec("dep", serde_json::json!({ "sleep_ms": 300 })))
        .await
        .unwrap();

    let dependent = center
        .create_task(
            shell_spec("dependent", serde_json::json!({ "behavior": "ok" }))
                .depends_on(vec![dep.id], DependencyPolicy::AllSuccess),
        )
        .await
        .unwrap();
    assert_eq!(dependent.status, TaskStatus::Pending);

    // 依赖成功后看护循环自动放行
    wait_for_status(&center, dep.id, TaskStatus::Success, Duration::from_secs(10)).await;
    wait_for_status(
        &center,
        dependent.id,
        TaskStatus::Success,
        Duration::from_secs(10),
    )
    .await;

    center.stop().await;
}

#[tokio::test]
async fn test_dependency_violation_cancels_dependent() {
    let center = start_center().await;

    let dep = center
        .create_task(
            shell_spec("failing-dep", serde_json::json!({ "behavior": "fail" }))
                .retry(RetryPolicy::default()),
        )
        .await
        .unwrap();
    wait_for_status(&center, dep.id, TaskStatus::Failed, Duration::from_secs(10)).await;

    // 依赖已终态失败，提交时直接取消并上报
    let err = center
        .create_task(
            shell_spec("dependent", serde_json::json!({ "behavior": "ok" }))
                .depends_on(vec![dep.id], DependencyPolicy::AllSuccess),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, JobCenterError::DependencyUnsatisfied { .. }));

    center.stop().await;
}

#[tokio::test]
async fn test_rollback_end_to_end() {
    let center = start_center().await;

    let task = center
        .create_task(
            shell_spec("deploy-bad", serde_json::json!({ "behavior": "fail" }))
                .retry(RetryPolicy {
                    max_retry: 1,
                    retry_delay_seconds: 0,
                    ..Default::default()
                })
                .rollback(serde_json::json!({ "behavior": "ok" })),
        )
        .await
        .unwrap();

    let done =
        wait_for_status(&center, task.id, TaskStatus::Rolledback, Duration::from_secs(15)).await;
    assert_eq!(done.status, TaskStatus::Rolledback);

    let executions = center.task_executions(task.id).await.unwrap();
    assert_eq!(executions.len(), 2);
    // 回滚结果落在最后一次执行记录上
    assert!(executions[1].rollback_at.is_some());

    let events = center.task_events(task.id).await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.kind == TaskEventKind::RolledBack));

    center.stop().await;
}

#[tokio::test]
async fn test_batch_stop_on_fail_cancels_remaining() {
    let center = start_center().await;
    // 单worker保证成员串行执行
    center.scale_workers("default", 1).await.unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let stats = center.worker_stats("default").await;
        if stats.idle_workers + stats.busy_workers == 1 {
            break;
        }
        assert!(std::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let batch = center
        .create_batch(
            "rolling-update",
            vec![
                shell_spec("m1", serde_json::json!({ "behavior": "fail" }))
                    .retry(RetryPolicy::default()),
                shell_spec("m2", serde_json::json!({ "sleep_ms": 1500 })).timeout(30),
                shell_spec("m3", serde_json::json!({ "sleep_ms": 1500 })).timeout(30),
            ],
            true,
            true,
        )
        .await
        .unwrap();

    // 批次最终失败，未开始的成员被取消
    let deadline = std::time::Instant::now() + Duration::from_secs(20);
    let settled = loop {
        let current = center.get_batch(batch.id).await.unwrap().unwrap();
        if current.status.is_terminal() {
            break current;
        }
        assert!(std::time::Instant::now() < deadline, "批次未结束");
        tokio::time::sleep(Duration::from_millis(100)).await;
    };

    assert_eq!(settled.status, TaskStatus::Failed);
    assert!(settled.failed_tasks >= 1);

    let (members, _) = center
        .list_tasks(&jobcenter::domain::TaskFilter {
            batch_id: Some(batch.id),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(members.len(), 3);
    assert!(members
        .iter()
        .any(|t| t.status == TaskStatus::Canceled));

    center.stop().await;
}

#[tokio::test]
async fn test_run_now_reruns_failed_task() {
    let center = start_center().await;

    let task = center
        .create_task(
            shell_spec("flaky", serde_json::json!({ "behavior": "fail" }))
                .retry(RetryPolicy::default()),
        )
        .await
        .unwrap();
    wait_for_status(&center, task.id, TaskStatus::Failed, Duration::from_secs(10)).await;

    // 手动重跑清零重试计数并重新入队，产生新的执行记录
    center.run_task_now(task.id).await.unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        let executions = center.task_executions(task.id).await.unwrap();
        let task = center.get_task(task.id).await.unwrap().unwrap();
        if executions.len() == 2 && task.status == TaskStatus::Failed {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "重跑未完成");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    center.stop().await;
}
