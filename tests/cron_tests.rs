//! Cron调度与Leader选举的集成测试

mod common;

use std::time::Duration;

use chrono::{Duration as ChronoDuration, Timelike, Utc};
use common::{registry, test_config, wait_for_status};
use jobcenter::domain::repositories::CronRepository;
use jobcenter::domain::{ConcurrentPolicy, CronJob, MisfirePolicy, TaskStatus};
use jobcenter::JobCenter;
use jobcenter_infrastructure::{Database, SqliteCronRepository};

fn quick_template() -> serde_json::Value {
    serde_json::json!({
        "name": "tick",
        "task_type": "command",
        "executor": "shell",
        "payload": { "behavior": "ok" }
    })
}

fn slow_template() -> serde_json::Value {
    serde_json::json!({
        "name": "tick-slow",
        "task_type": "command",
        "executor": "shell",
        "payload": { "sleep_ms": 60_000 },
        "timeout_seconds": 120
    })
}

async fn start_center() -> JobCenter {
    let center = JobCenter::new_in_memory(test_config(), registry(), None)
        .await
        .unwrap();
    center.start().await.unwrap();
    center
}

#[tokio::test]
async fn test_force_fire_spawns_task() {
    let center = start_center().await;

    let mut job = CronJob::new("hourly-report", "0 0 * * * *", quick_template());
    job.description = Some("整点报表".to_string());
    let job = center.create_cron_job(job).await.unwrap();
    assert!(job.id > 0);
    assert!(job.next_run_at.is_some());

    let task_id = center.fire_cron_job(job.id).await.unwrap().unwrap();
    wait_for_status(&center, task_id, TaskStatus::Success, Duration::from_secs(10)).await;

    let executions = center.cron_executions(job.id, 10).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].task_id, Some(task_id));

    // 派生任务名带触发时间戳，且带有cron元数据
    let task = center.get_task(task_id).await.unwrap().unwrap();
    assert!(task.name.starts_with("tick-"));
    assert_eq!(
        task.metadata.get("cron_job_id"),
        Some(&serde_json::json!(job.id))
    );

    center.stop().await;
}

#[tokio::test]
async fn test_upcoming_fire_times() {
    let center = start_center().await;

    let job = center
        .create_cron_job(CronJob::new("hourly", "0 0 * * * *", quick_template()))
        .await
        .unwrap();

    let upcoming = center.cron_upcoming(job.id, 3).await.unwrap();
    assert_eq!(upcoming.len(), 3);
    for window in upcoming.windows(2) {
        assert!(window[0] < window[1]);
        assert_eq!((window[1] - window[0]).num_hours(), 1);
    }
    assert!(upcoming.iter().all(|t| t.minute() == 0 && t.second() == 0));

    center.stop().await;
}

#[tokio::test]
async fn test_concurrent_policy_forbid_skips_while_running() {
    let center = start_center().await;

    let mut job = CronJob::new("overlapping", "* * * * * *", slow_template());
    job.concurrent_policy = ConcurrentPolicy::Forbid;
    let job = center.create_cron_job(job).await.unwrap();

    // 跨越多个tick窗口，第一次派生的任务一直在执行
    tokio::time::sleep(Duration::from_millis(3500)).await;

    // 上一个任务未终态期间不允许产生新的触发
    let executions = center.cron_executions(job.id, 50).await.unwrap();
    assert_eq!(executions.len(), 1);

    center.stop().await;
}

#[tokio::test]
async fn test_concurrent_policy_replace_cancels_previous() {
    let center = start_center().await;

    let mut job = CronJob::new("replacing", "* * * * * *", slow_template());
    job.concurrent_policy = ConcurrentPolicy::Replace;
    let job = center.create_cron_job(job).await.unwrap();

    tokio::time::sleep(Duration::from_millis(3500)).await;
    center.stop().await;

    let executions = center.cron_executions(job.id, 50).await.unwrap();
    assert!(executions.len() >= 2, "replace策略应持续触发");

    // 除最新一次外，此前派生的任务都被取消
    let mut canceled = 0;
    for execution in executions.iter().skip(1) {
        if let Some(task_id) = execution.task_id {
            let task = center.get_task(task_id).await.unwrap().unwrap();
            if task.status == TaskStatus::Canceled {
                canceled += 1;
            }
        }
    }
    assert!(canceled >= 1, "replace策略应取消在途任务");
}

#[tokio::test]
async fn test_misfire_fire_once_fires_single_catchup() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("misfire.db");
    let mut config = test_config();
    config.database.url = format!("sqlite://{}", db_path.display());

    // 预置一个3小时没跑过的整点任务
    let db = Database::connect(&config.database).await.unwrap();
    let cron_repo = SqliteCronRepository::new(db.pool().clone());
    let mut job = CronJob::new("hourly-sync", "0 0 * * * *", quick_template());
    job.misfire_policy = MisfirePolicy::FireOnce;
    job.last_run_at = Some(Utc::now() - ChronoDuration::hours(3));
    let job = cron_repo.create_job(&job).await.unwrap();
    drop(cron_repo);
    drop(db);

    let center = JobCenter::new(config, registry(), None).await.unwrap();
    center.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    // 任意数量的错过触发合并为一次补发，补发时间是最近一次错过的整点
    let executions = center.cron_executions(job.id, 50).await.unwrap();
    assert_eq!(executions.len(), 1);
    let scheduled = executions[0].scheduled_at;
    assert!(scheduled <= Utc::now());
    assert!(Utc::now() - scheduled <= ChronoDuration::hours(1));

    center.stop().await;
}

#[tokio::test]
async fn test_misfire_ignore_drops_missed_ticks() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("ignore.db");
    let mut config = test_config();
    config.database.url = format!("sqlite://{}", db_path.display());

    let db = Database::connect(&config.database).await.unwrap();
    let cron_repo = SqliteCronRepository::new(db.pool().clone());
    let mut job = CronJob::new("hourly-clean", "0 0 * * * *", quick_template());
    job.misfire_policy = MisfirePolicy::Ignore;
    job.last_run_at = Some(Utc::now() - ChronoDuration::hours(3));
    let job = cron_repo.create_job(&job).await.unwrap();
    drop(cron_repo);
    drop(db);

    let center = JobCenter::new(config, registry(), None).await.unwrap();
    center.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(center.cron_executions(job.id, 50).await.unwrap().is_empty());

    center.stop().await;
}

#[tokio::test]
async fn test_two_nodes_fire_each_tick_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("cluster.db");
    let db_url = format!("sqlite://{}", db_path.display());

    let mut config1 = test_config();
    config1.database.url = db_url.clone();
    config1.node.node_id = Some("node-1".to_string());

    let mut config2 = test_config();
    config2.database.url = db_url;
    config2.node.node_id = Some("node-2".to_string());

    // node-1先启动并成为Leader
    let center1 = JobCenter::new(config1, registry(), None).await.unwrap();
    center1.start().await.unwrap();
    assert!(center1.is_leader());

    let job = center1
        .create_cron_job(CronJob::new("cluster-tick", "* * * * * *", quick_template()))
        .await
        .unwrap();

    // node-2加载同一张cron表，但不是Leader
    let center2 = JobCenter::new(config2, registry(), None).await.unwrap();
    center2.start().await.unwrap();
    assert!(!center2.is_leader());

    tokio::time::sleep(Duration::from_millis(4200)).await;
    center1.stop().await;
    center2.stop().await;

    let executions = center1.cron_executions(job.id, 100).await.unwrap();
    assert!(executions.len() >= 2, "应有多次触发");

    // 两个节点同时调度，每个计划tick只产生一条执行记录，且都出自Leader
    let mut scheduled: Vec<_> = executions.iter().map(|e| e.scheduled_at).collect();
    scheduled.sort();
    scheduled.dedup();
    assert_eq!(scheduled.len(), executions.len(), "存在重复触发");
    assert!(executions.iter().all(|e| e.node_id == "node-1"));
}
