//! 任务中心
//!
//! 组合根：持有队列后端、Worker池、Cron调度器、Leader选举、
//! 幂等台账、批次监控，暴露生产者接口与队列/定时任务管理面。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use jobcenter_core::{AppConfig, JobCenterError, JobCenterResult, QueueSettings};
use jobcenter_dispatcher::{
    BatchMonitor, CronScheduler, DependencyWatcher, IdempotencyLedger, LeaderElector,
    SubmissionService,
};
use jobcenter_domain::ports::{Notifier, TaskControl, TaskQueue};
use jobcenter_domain::repositories::{
    BatchRepository, CronRepository, QueueRepository, TaskRepository,
};
use jobcenter_domain::{
    CronExecution, CronJob, QueueConfig, QueueStatus, Task, TaskBatch, TaskEvent, TaskExecution,
    TaskFilter, TaskSpec, WorkerPoolStats, WorkerState,
};
use jobcenter_infrastructure::{
    Database, LogNotifier, MemoryTaskQueue, SqliteBatchRepository, SqliteCronRepository,
    SqliteLeaseRepository, SqliteQueueRepository, SqliteTaskRepository,
};
use jobcenter_worker::{ExecutorRegistry, WorkerPool};

use crate::control::EngineTaskControl;
use crate::shutdown::ShutdownManager;

pub struct JobCenter {
    config: AppConfig,
    task_repo: Arc<dyn TaskRepository>,
    batch_repo: Arc<dyn BatchRepository>,
    queue_repo: Arc<dyn QueueRepository>,
    cron_repo: Arc<dyn CronRepository>,
    queue: Arc<dyn TaskQueue>,
    pool: Arc<WorkerPool>,
    submitter: Arc<SubmissionService>,
    ledger: Arc<IdempotencyLedger>,
    cron: Arc<CronScheduler>,
    leader: Arc<LeaderElector>,
    control: Arc<dyn TaskControl>,
    batch_monitor: Arc<BatchMonitor>,
    watcher: Arc<DependencyWatcher>,
    shutdown: ShutdownManager,
    running: RwLock<bool>,
}

impl JobCenter {
    /// 构建任务中心。执行器由宿主应用通过`executors`注入，
    /// 引擎本身不内置任何命令通道。
    pub async fn new(
        config: AppConfig,
        executors: ExecutorRegistry,
        notifier: Option<Arc<dyn Notifier>>,
    ) -> JobCenterResult<Self> {
        let db = Database::connect(&config.database).await?;
        Self::build(config, db, executors, notifier).await
    }

    /// 内存数据库版本，测试与嵌入式试用场景
    pub async fn new_in_memory(
        config: AppConfig,
        executors: ExecutorRegistry,
        notifier: Option<Arc<dyn Notifier>>,
    ) -> JobCenterResult<Self> {
        let db = Database::connect_in_memory().await?;
        Self::build(config, db, executors, notifier).await
    }

    async fn build(
        config: AppConfig,
        db: Database,
        executors: ExecutorRegistry,
        notifier: Option<Arc<dyn Notifier>>,
    ) -> JobCenterResult<Self> {
        let node_id = config.node.resolve_node_id();
        info!("初始化任务中心，节点: {}", node_id);

        let task_repo: Arc<dyn TaskRepository> =
            Arc::new(SqliteTaskRepository::new(db.pool().clone()));
        let batch_repo: Arc<dyn BatchRepository> =
            Arc::new(SqliteBatchRepository::new(db.pool().clone()));
        let queue_repo: Arc<dyn QueueRepository> =
            Arc::new(SqliteQueueRepository::new(db.pool().clone()));
        let cron_repo: Arc<dyn CronRepository> =
            Arc::new(SqliteCronRepository::new(db.pool().clone()));
        let lease_repo = Arc::new(SqliteLeaseRepository::new(db.pool().clone()));

        let queue: Arc<dyn TaskQueue> = Arc::new(MemoryTaskQueue::new(Duration::from_secs(
            config.worker.lease_timeout_seconds,
        )));

        let registered_kinds = executors.kinds();
        if registered_kinds.is_empty() {
            warn!("未注册任何执行器，所有任务提交都会被拒绝");
        }
        let executors = Arc::new(executors);

        let pool = Arc::new(WorkerPool::new(
            queue.clone(),
            task_repo.clone(),
            executors,
            Duration::from_secs(config.worker.dequeue_wait_seconds),
        ));

        let ledger = Arc::new(IdempotencyLedger::new(
            task_repo.clone(),
            config.idempotency.clone(),
        ));

        let submitter = Arc::new(SubmissionService::new(
            task_repo.clone(),
            batch_repo.clone(),
            queue_repo.clone(),
            queue.clone(),
            ledger.clone(),
            registered_kinds,
        ));

        let leader = Arc::new(LeaderElector::new(
            node_id,
            config.cron.leader_key.clone(),
            config.cron.leader_lease_seconds,
            lease_repo,
        ));

        let control: Arc<dyn TaskControl> = Arc::new(EngineTaskControl::new(
            task_repo.clone(),
            queue.clone(),
            pool.clone(),
        ));

        let cron = Arc::new(CronScheduler::new(
            cron_repo.clone(),
            task_repo.clone(),
            submitter.clone(),
            leader.clone(),
            control.clone(),
            Duration::from_secs(config.cron.tick_interval_seconds),
            config.cron.misfire_scan_limit,
        ));

        let notifier = notifier.unwrap_or_else(|| Arc::new(LogNotifier::new()));
        let batch_monitor = Arc::new(BatchMonitor::new(
            batch_repo.clone(),
            task_repo.clone(),
            control.clone(),
            notifier,
            Duration::from_secs(config.batch.monitor_interval_seconds),
        ));

        let watcher = Arc::new(DependencyWatcher::new(
            task_repo.clone(),
            submitter.clone(),
            Duration::from_secs(1),
        ));

        Ok(Self {
            config,
            task_repo,
            batch_repo,
            queue_repo,
            cron_repo,
            queue,
            pool,
            submitter,
            ledger,
            cron,
            leader,
            control,
            batch_monitor,
            watcher,
            shutdown: ShutdownManager::new(),
            running: RwLock::new(false),
        })
    }

    fn settings_to_config(settings: &QueueSettings) -> QueueConfig {
        let mut config = QueueConfig::new(
            settings.name.clone(),
            settings.max_workers,
            settings.max_pending,
        );
        config.priority = settings.priority;
        config.timeout_seconds = settings.timeout_seconds;
        config.max_retry = settings.max_retry;
        config
    }

    /// 启动所有组件
    pub async fn start(&self) -> JobCenterResult<()> {
        let mut running = self.running.write().await;
        if *running {
            return Err(JobCenterError::internal("任务中心已在运行"));
        }

        info!("启动任务中心");

        // 配置中的队列写入存储，存储中的全部队列注册到内存队列并拉起worker
        for settings in &self.config.queues {
            self.queue_repo
                .upsert(&Self::settings_to_config(settings))
                .await?;
        }
        for queue_config in self.queue_repo.list().await? {
            self.queue.register(&queue_config).await?;
            if queue_config.enabled {
                self.pool
                    .start(&queue_config.name, queue_config.max_workers as usize)
                    .await?;
            }
        }

        // Leader选举先行一次，misfire补偿依赖当前节点的领导权判定
        if let Err(e) = self.leader.try_acquire().await {
            warn!("启动时获取领导权失败: {}", e);
        }
        tokio::spawn(Arc::clone(&self.leader).run(self.shutdown.subscribe()));

        self.cron.load_jobs().await?;
        tokio::spawn(Arc::clone(&self.cron).run(self.shutdown.subscribe()));

        tokio::spawn(Arc::clone(&self.watcher).run(self.shutdown.subscribe()));
        tokio::spawn(Arc::clone(&self.batch_monitor).run(self.shutdown.subscribe()));
        tokio::spawn(Arc::clone(&self.ledger).run_sweeper(self.shutdown.subscribe()));

        // 租约回收：worker消亡后把超时未确认的任务重新投递
        {
            let queue = self.queue.clone();
            let token = self.shutdown.subscribe();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(1));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            match queue.reclaim_expired().await {
                                Ok(ids) if !ids.is_empty() => {
                                    warn!("重投了 {} 个租约过期的任务: {:?}", ids.len(), ids);
                                }
                                Ok(_) => {}
                                Err(e) => error!("租约回收失败: {}", e),
                            }
                        }
                        _ = token.cancelled() => break,
                    }
                }
            });
        }

        *running = true;
        info!("任务中心启动完成");
        Ok(())
    }

    /// 停止所有组件，在宽限期内等待在途任务完成
    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        if !*running {
            return;
        }

        info!("停止任务中心");
        self.shutdown.shutdown().await;
        self.pool
            .stop(Duration::from_secs(self.config.worker.shutdown_grace_seconds))
            .await;
        *running = false;
        info!("任务中心已停止");
    }

    pub async fn wait_for_signal(&self) {
        self.shutdown.wait_for_signal().await;
    }

    pub fn is_leader(&self) -> bool {
        self.leader.is_leader()
    }

    // ==================== 生产者接口 ====================

    /// 提交任务。幂等命中返回既有任务的结果。
    pub async fn create_task(&self, spec: TaskSpec) -> JobCenterResult<Task> {
        self.submitter.submit(spec).await
    }

    /// 批量提交
    pub async fn create_batch(
        &self,
        name: &str,
        specs: Vec<TaskSpec>,
        stop_on_fail: bool,
        notify_on_complete: bool,
    ) -> JobCenterResult<TaskBatch> {
        self.submitter
            .submit_batch(name, specs, stop_on_fail, notify_on_complete)
            .await
    }

    /// 取消任务。排队中的任务不会触达执行器；执行中的任务协作式停止。
    pub async fn cancel_task(&self, task_id: i64, reason: &str) -> JobCenterResult<()> {
        self.control.cancel_task(task_id, "user", reason).await
    }

    /// 立即执行任务（Pending直接入队，终态任务重置后重跑）
    pub async fn run_task_now(&self, task_id: i64) -> JobCenterResult<Task> {
        self.submitter.run_task_now(task_id).await
    }

    // ==================== 任务查询 ====================

    pub async fn get_task(&self, task_id: i64) -> JobCenterResult<Option<Task>> {
        self.task_repo.get_by_id(task_id).await
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> JobCenterResult<(Vec<Task>, i64)> {
        self.task_repo.list(filter).await
    }

    pub async fn task_executions(&self, task_id: i64) -> JobCenterResult<Vec<TaskExecution>> {
        self.task_repo.executions(task_id).await
    }

    pub async fn task_events(&self, task_id: i64) -> JobCenterResult<Vec<TaskEvent>> {
        self.task_repo.events(task_id).await
    }

    pub async fn get_batch(&self, batch_id: i64) -> JobCenterResult<Option<TaskBatch>> {
        self.batch_repo.get_by_id(batch_id).await
    }

    // ==================== 队列管理面 ====================

    /// 注册或更新命名队列。运行中的任务中心会立即应用容量策略，
    /// 新队列按max_workers拉起worker。
    pub async fn register_queue(&self, config: QueueConfig) -> JobCenterResult<()> {
        self.queue_repo.upsert(&config).await?;
        self.queue.register(&config).await?;

        if *self.running.read().await && config.enabled {
            let current = self.pool.worker_count(&config.name).await;
            if current == 0 {
                self.pool
                    .start(&config.name, config.max_workers as usize)
                    .await?;
            }
        }
        info!("注册队列 {}", config.name);
        Ok(())
    }

    /// 调整队列worker数量（缩容只摘除空闲worker）
    pub async fn scale_workers(&self, queue_name: &str, target: usize) -> JobCenterResult<()> {
        self.queue_repo
            .get(queue_name)
            .await?
            .ok_or_else(|| JobCenterError::queue_not_found(queue_name))?;
        info!("调整队列 {} 的worker数为 {}", queue_name, target);
        self.pool.scale(queue_name, target).await
    }

    /// 队列列表及实时水位
    pub async fn list_queues(&self) -> JobCenterResult<Vec<QueueStatus>> {
        let configs = self.queue_repo.list().await?;
        let mut statuses = Vec::with_capacity(configs.len());
        for config in configs {
            let pending = self.queue.pending_count(&config.name).await.unwrap_or(0);
            let in_flight = self.queue.in_flight_count(&config.name).await.unwrap_or(0);
            let workers = self.pool.worker_count(&config.name).await;
            statuses.push(QueueStatus {
                config,
                pending,
                in_flight,
                workers,
            });
        }
        Ok(statuses)
    }

    pub async fn worker_stats(&self, queue_name: &str) -> WorkerPoolStats {
        self.pool.stats(queue_name).await
    }

    pub async fn worker_states(&self, queue_name: Option<&str>) -> Vec<WorkerState> {
        self.pool.worker_states(queue_name).await
    }

    // ==================== 定时任务管理面 ====================

    pub async fn create_cron_job(&self, job: CronJob) -> JobCenterResult<CronJob> {
        self.cron.add_job(job).await
    }

    pub async fn update_cron_job(&self, job: CronJob) -> JobCenterResult<()> {
        self.cron.update_job(job).await
    }

    pub async fn delete_cron_job(&self, job_id: i64) -> JobCenterResult<bool> {
        self.cron.remove_job(job_id).await
    }

    pub async fn list_cron_jobs(&self) -> JobCenterResult<Vec<CronJob>> {
        self.cron_repo.list_jobs(false).await
    }

    /// 未来count次触发时间
    pub async fn cron_upcoming(
        &self,
        job_id: i64,
        count: usize,
    ) -> JobCenterResult<Vec<DateTime<Utc>>> {
        self.cron.upcoming(job_id, count).await
    }

    /// 手动强制触发，返回派生任务ID
    pub async fn fire_cron_job(&self, job_id: i64) -> JobCenterResult<Option<i64>> {
        self.cron.trigger_now(job_id).await
    }

    pub async fn cron_executions(
        &self,
        job_id: i64,
        limit: i64,
    ) -> JobCenterResult<Vec<CronExecution>> {
        self.cron_repo.executions(job_id, limit).await
    }
}
