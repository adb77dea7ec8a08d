//! Cron调度器
//!
//! 每个节点都在内存里维护同一张cron表并推进时间，但只有Leader节点
//! 真正触发：调度逻辑保持节点本地无状态，触发效果全局单例。
//! 每次触发物化一个任务实例走正常提交路径，并记录CronExecution。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use jobcenter_core::{JobCenterError, JobCenterResult};
use jobcenter_domain::ports::TaskControl;
use jobcenter_domain::repositories::{CronRepository, TaskRepository};
use jobcenter_domain::{
    ConcurrentPolicy, CronExecution, CronJob, MisfirePolicy, ScheduleMode, TaskSpec, TaskStatus,
};

use crate::cron_utils::CronSchedule;
use crate::leader::LeaderElector;
use crate::submitter::SubmissionService;

struct CronEntry {
    job: CronJob,
    schedule: CronSchedule,
    next_run: DateTime<Utc>,
}

pub struct CronScheduler {
    jobs: RwLock<HashMap<i64, CronEntry>>,
    cron_repo: Arc<dyn CronRepository>,
    task_repo: Arc<dyn TaskRepository>,
    submitter: Arc<SubmissionService>,
    leader: Arc<LeaderElector>,
    control: Arc<dyn TaskControl>,
    tick_interval: Duration,
    misfire_scan_limit: usize,
}

impl CronScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cron_repo: Arc<dyn CronRepository>,
        task_repo: Arc<dyn TaskRepository>,
        submitter: Arc<SubmissionService>,
        leader: Arc<LeaderElector>,
        control: Arc<dyn TaskControl>,
        tick_interval: Duration,
        misfire_scan_limit: usize,
    ) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            cron_repo,
            task_repo,
            submitter,
            leader,
            control,
            tick_interval,
            misfire_scan_limit,
        }
    }

    fn far_future(now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::weeks(52 * 100)
    }

    /// 校验任务模板可以物化为合法的任务定义
    fn validate_template(template: &serde_json::Value) -> JobCenterResult<TaskSpec> {
        serde_json::from_value::<TaskSpec>(template.clone()).map_err(|e| {
            JobCenterError::Validation(format!("任务模板无效: {e}"))
        })
    }

    /// 加载所有启用的定时任务并执行misfire补偿
    pub async fn load_jobs(&self) -> JobCenterResult<usize> {
        let jobs = self.cron_repo.list_jobs(true).await?;
        let count = jobs.len();

        for job in jobs {
            if let Err(e) = self.install_job(job, true).await {
                error!("加载定时任务失败: {}", e);
            }
        }

        info!("加载了 {} 个定时任务", count);
        Ok(count)
    }

    async fn install_job(&self, job: CronJob, recover_misfires: bool) -> JobCenterResult<()> {
        let schedule = CronSchedule::new(&job.cron_expr, job.timezone.as_deref())?;
        let now = Utc::now();

        let catch_up = if recover_misfires {
            let basis = job.last_run_at.unwrap_or(job.created_at);
            let missed = schedule.missed_ticks(basis, now, self.misfire_scan_limit);
            match (missed.last().copied(), job.misfire_policy) {
                (None, _) | (_, MisfirePolicy::Ignore) => {
                    if !missed.is_empty() {
                        debug!("定时任务 {} 丢弃 {} 次错过的触发", job.id, missed.len());
                    }
                    None
                }
                // fire_now补发最近一次；fire_once把全部错过合并为一次补发，
                // 两者在恢复时都只产生一次触发
                (Some(last_missed), MisfirePolicy::FireNow | MisfirePolicy::FireOnce) => {
                    info!(
                        "定时任务 {} 错过 {} 次触发，按 {} 补发一次",
                        job.id,
                        missed.len(),
                        job.misfire_policy.as_str()
                    );
                    Some(last_missed)
                }
            }
        } else {
            None
        };

        let next_run = schedule
            .next_after(now)
            .unwrap_or_else(|| Self::far_future(now));
        let job_id = job.id;

        {
            let mut jobs = self.jobs.write().await;
            jobs.insert(
                job_id,
                CronEntry {
                    job,
                    schedule,
                    next_run,
                },
            );
        }

        if let Some(scheduled_at) = catch_up {
            if self.leader.is_leader() {
                if let Err(e) = self.fire(job_id, scheduled_at).await {
                    error!("定时任务 {} misfire补发失败: {}", job_id, e);
                }
            }
        }

        Ok(())
    }

    /// 单次调度检查。所有节点都推进时间，只有Leader触发。
    pub async fn tick(&self) {
        let now = Utc::now();

        let due: Vec<(i64, DateTime<Utc>)> = {
            let mut jobs = self.jobs.write().await;
            let mut due = Vec::new();
            for (id, entry) in jobs.iter_mut() {
                if entry.next_run <= now {
                    due.push((*id, entry.next_run));
                    entry.next_run = entry
                        .schedule
                        .next_after(now)
                        .unwrap_or_else(|| Self::far_future(now));
                }
            }
            due
        };

        if due.is_empty() {
            return;
        }

        if !self.leader.is_leader() {
            debug!("非Leader节点跳过 {} 个到期触发", due.len());
            return;
        }

        for (job_id, scheduled_at) in due {
            if let Err(e) = self.fire(job_id, scheduled_at).await {
                error!("定时任务 {} 触发失败: {}", job_id, e);
            }
        }
    }

    /// 触发一次定时任务，返回派生任务的ID（被并发策略跳过时为None）
    pub async fn fire(
        &self,
        job_id: i64,
        scheduled_at: DateTime<Utc>,
    ) -> JobCenterResult<Option<i64>> {
        let mut job = {
            let jobs = self.jobs.read().await;
            jobs.get(&job_id)
                .map(|entry| entry.job.clone())
                .ok_or(JobCenterError::CronJobNotFound { id: job_id })?
        };

        // 并发策略
        if let Some(latest) = self.cron_repo.latest_execution(job_id).await? {
            if let Some(task_id) = latest.task_id {
                if let Some(task) = self.task_repo.get_by_id(task_id).await? {
                    if !task.is_terminal() {
                        match job.concurrent_policy {
                            ConcurrentPolicy::Forbid => {
                                debug!(
                                    "定时任务 {} 的上一个任务 {} 未结束，按forbid跳过本次触发",
                                    job_id, task_id
                                );
                                return Ok(None);
                            }
                            ConcurrentPolicy::Replace => {
                                info!(
                                    "定时任务 {} 按replace取消在途任务 {}",
                                    job_id, task_id
                                );
                                self.control
                                    .cancel_task(task_id, "cron", "被新一轮触发替换")
                                    .await?;
                            }
                            ConcurrentPolicy::Allow => {}
                        }
                    }
                }
            }
        }

        let now = Utc::now();
        let mut execution = self
            .cron_repo
            .create_execution(&CronExecution {
                id: 0,
                cron_job_id: job_id,
                task_id: None,
                node_id: self.leader.node_id().to_string(),
                scheduled_at,
                fired_at: now,
                status: TaskStatus::Pending,
                error: None,
                created_at: now,
            })
            .await?;

        // 物化任务模板
        let mut spec = match Self::validate_template(&job.task_template) {
            Ok(spec) => spec,
            Err(e) => {
                execution.status = TaskStatus::Failed;
                execution.error = Some(e.to_string());
                self.cron_repo.update_execution(&execution).await?;
                job.fail_count += 1;
                self.cron_repo.update_job(&job).await?;
                return Err(e);
            }
        };

        spec.name = format!("{}-{}", spec.name, now.timestamp());
        // 实例立即入队执行，schedule字段保留cron来源作为标记
        spec.schedule = ScheduleMode::Cron {
            expr: job.cron_expr.clone(),
            timezone: job.timezone.clone(),
        };
        let mut metadata = spec
            .metadata
            .take()
            .and_then(|m| m.as_object().cloned())
            .unwrap_or_default();
        metadata.insert("cron_job_id".to_string(), serde_json::json!(job_id));
        metadata.insert(
            "cron_execution_id".to_string(),
            serde_json::json!(execution.id),
        );
        spec.metadata = Some(serde_json::Value::Object(metadata));

        match self.submitter.submit(spec).await {
            Ok(task) => {
                execution.task_id = Some(task.id);
                execution.status = task.status;
                self.cron_repo.update_execution(&execution).await?;

                job.run_count += 1;
                job.success_count += 1;
                job.last_run_at = Some(now);
                {
                    let jobs = self.jobs.read().await;
                    if let Some(entry) = jobs.get(&job_id) {
                        job.next_run_at = Some(entry.next_run);
                    }
                }
                self.cron_repo.update_job(&job).await?;
                self.sync_entry_job(&job).await;

                info!("定时任务 {} 触发成功，派生任务 {}", job_id, task.id);
                Ok(Some(task.id))
            }
            Err(e) => {
                execution.status = TaskStatus::Failed;
                execution.error = Some(e.to_string());
                self.cron_repo.update_execution(&execution).await?;

                job.run_count += 1;
                job.fail_count += 1;
                job.last_run_at = Some(now);
                self.cron_repo.update_job(&job).await?;
                self.sync_entry_job(&job).await;

                warn!("定时任务 {} 派生任务提交失败: {}", job_id, e);
                Err(e)
            }
        }
    }

    async fn sync_entry_job(&self, job: &CronJob) {
        let mut jobs = self.jobs.write().await;
        if let Some(entry) = jobs.get_mut(&job.id) {
            entry.job = job.clone();
        }
    }

    // ==================== 管理面 ====================

    pub async fn add_job(&self, mut job: CronJob) -> JobCenterResult<CronJob> {
        CronSchedule::validate(&job.cron_expr, job.timezone.as_deref())?;
        Self::validate_template(&job.task_template)?;

        let schedule = CronSchedule::new(&job.cron_expr, job.timezone.as_deref())?;
        job.next_run_at = schedule.next_after(Utc::now());

        let created = self.cron_repo.create_job(&job).await?;
        if created.enabled {
            self.install_job(created.clone(), false).await?;
        }
        info!("创建定时任务 {} ({})", created.id, created.name);
        Ok(created)
    }

    pub async fn update_job(&self, job: CronJob) -> JobCenterResult<()> {
        CronSchedule::validate(&job.cron_expr, job.timezone.as_deref())?;
        Self::validate_template(&job.task_template)?;

        self.cron_repo.update_job(&job).await?;

        {
            let mut jobs = self.jobs.write().await;
            jobs.remove(&job.id);
        }
        if job.enabled {
            self.install_job(job, false).await?;
        }
        Ok(())
    }

    pub async fn remove_job(&self, job_id: i64) -> JobCenterResult<bool> {
        {
            let mut jobs = self.jobs.write().await;
            jobs.remove(&job_id);
        }
        self.cron_repo.delete_job(job_id).await
    }

    /// 未来`count`次触发时间
    pub async fn upcoming(&self, job_id: i64, count: usize) -> JobCenterResult<Vec<DateTime<Utc>>> {
        let jobs = self.jobs.read().await;
        if let Some(entry) = jobs.get(&job_id) {
            return Ok(entry.schedule.upcoming(Utc::now(), count));
        }
        drop(jobs);

        // 未安装（禁用）的任务按存储的表达式计算
        let job = self
            .cron_repo
            .get_job(job_id)
            .await?
            .ok_or(JobCenterError::CronJobNotFound { id: job_id })?;
        let schedule = CronSchedule::new(&job.cron_expr, job.timezone.as_deref())?;
        Ok(schedule.upcoming(Utc::now(), count))
    }

    /// 手动强制触发（运维操作，不经过Leader判定，但仍受并发策略约束）
    pub async fn trigger_now(&self, job_id: i64) -> JobCenterResult<Option<i64>> {
        info!("手动触发定时任务 {}", job_id);
        self.fire(job_id, Utc::now()).await
    }

    /// 调度循环
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = shutdown.cancelled() => {
                    info!("Cron调度器收到停止信号");
                    break;
                }
            }
        }
    }
}
