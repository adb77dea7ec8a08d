//! Worker池
//!
//! 每个命名队列一组并发worker，支持运行期扩缩容。缩容只移除空闲
//! worker，绝不打断在途任务。停机通过级联取消令牌交付，worker在
//! 出队等待点观察到信号后退出。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use jobcenter_core::{JobCenterError, JobCenterResult};
use jobcenter_domain::ports::TaskQueue;
use jobcenter_domain::repositories::TaskRepository;
use jobcenter_domain::{WorkerPoolStats, WorkerState, WorkerStatus};

use crate::executor_registry::ExecutorRegistry;
use crate::worker::{worker_loop, WorkerContext};

struct WorkerHandle {
    state: Arc<RwLock<WorkerState>>,
    token: CancellationToken,
    join: Option<JoinHandle<()>>,
}

pub struct WorkerPool {
    queue: Arc<dyn TaskQueue>,
    task_repo: Arc<dyn TaskRepository>,
    executors: Arc<ExecutorRegistry>,
    workers: RwLock<HashMap<String, WorkerHandle>>,
    cancel_handles: Arc<RwLock<HashMap<i64, CancellationToken>>>,
    shutdown: CancellationToken,
    dequeue_wait: Duration,
    counter: AtomicU64,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        task_repo: Arc<dyn TaskRepository>,
        executors: Arc<ExecutorRegistry>,
        dequeue_wait: Duration,
    ) -> Self {
        Self {
            queue,
            task_repo,
            executors,
            workers: RwLock::new(HashMap::new()),
            cancel_handles: Arc::new(RwLock::new(HashMap::new())),
            shutdown: CancellationToken::new(),
            dequeue_wait,
            counter: AtomicU64::new(1),
        }
    }

    /// 为指定队列启动n个worker
    pub async fn start(&self, queue_name: &str, count: usize) -> JobCenterResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(JobCenterError::internal("Worker池已停止"));
        }

        for _ in 0..count {
            self.spawn_worker(queue_name).await;
        }
        info!("队列 {} 启动了 {} 个worker", queue_name, count);
        Ok(())
    }

    async fn spawn_worker(&self, queue_name: &str) {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let worker_id = format!("{queue_name}-worker-{seq}");
        let state = Arc::new(RwLock::new(WorkerState::new(&worker_id, queue_name)));
        let token = self.shutdown.child_token();

        let ctx = WorkerContext {
            state: state.clone(),
            token: token.clone(),
            queue: self.queue.clone(),
            task_repo: self.task_repo.clone(),
            executors: self.executors.clone(),
            cancel_handles: self.cancel_handles.clone(),
            dequeue_wait: self.dequeue_wait,
        };
        let join = tokio::spawn(worker_loop(ctx));

        let mut workers = self.workers.write().await;
        workers.insert(
            worker_id,
            WorkerHandle {
                state,
                token,
                join: Some(join),
            },
        );
    }

    /// 调整队列的worker数量。扩容即时生效；缩容只摘除空闲worker，
    /// 在途任务跑完后worker自行退出。
    pub async fn scale(&self, queue_name: &str, target: usize) -> JobCenterResult<()> {
        self.prune_stopped().await;

        let current: Vec<(String, WorkerStatus)> = {
            let workers = self.workers.read().await;
            let mut current = Vec::new();
            for (id, handle) in workers.iter() {
                let state = handle.state.read().await;
                if state.queue_name == queue_name && !handle.token.is_cancelled() {
                    current.push((id.clone(), state.status));
                }
            }
            current
        };

        let active = current.len();
        if target > active {
            let to_add = target - active;
            for _ in 0..to_add {
                self.spawn_worker(queue_name).await;
            }
            info!("队列 {} 扩容 {} 个worker ({} -> {})", queue_name, to_add, active, target);
        } else if target < active {
            let mut to_remove = active - target;
            let workers = self.workers.read().await;
            for (id, status) in &current {
                if to_remove == 0 {
                    break;
                }
                if *status != WorkerStatus::Idle {
                    continue;
                }
                if let Some(handle) = workers.get(id) {
                    let mut state = handle.state.write().await;
                    // 再次确认仍然空闲，绝不打断执行中的worker
                    if state.status == WorkerStatus::Idle {
                        state.status = WorkerStatus::Stopping;
                        handle.token.cancel();
                        to_remove -= 1;
                        debug!("缩容摘除worker {}", id);
                    }
                }
            }
            if to_remove > 0 {
                warn!(
                    "队列 {} 缩容未达目标，剩余 {} 个worker正在执行任务",
                    queue_name, to_remove
                );
            }
        }

        Ok(())
    }

    /// 取消正在本池执行的任务（协作式）。任务不在执行中返回false。
    pub async fn cancel_task(&self, task_id: i64) -> bool {
        let handles = self.cancel_handles.read().await;
        match handles.get(&task_id) {
            Some(token) => {
                info!("向执行中的任务 {} 发送取消信号", task_id);
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn is_task_running(&self, task_id: i64) -> bool {
        self.cancel_handles.read().await.contains_key(&task_id)
    }

    /// 停止所有worker，在宽限期内等待在途任务完成
    pub async fn stop(&self, grace: Duration) {
        info!("停止Worker池");
        self.shutdown.cancel();

        let joins: Vec<(String, JoinHandle<()>)> = {
            let mut workers = self.workers.write().await;
            workers
                .iter_mut()
                .filter_map(|(id, handle)| handle.join.take().map(|j| (id.clone(), j)))
                .collect()
        };

        for (id, join) in joins {
            if tokio::time::timeout(grace, join).await.is_err() {
                warn!("Worker {} 未在宽限期内退出", id);
            }
        }
        info!("Worker池已停止");
    }

    async fn prune_stopped(&self) {
        let mut workers = self.workers.write().await;
        let mut stopped = Vec::new();
        for (id, handle) in workers.iter() {
            let state = handle.state.read().await;
            if state.status == WorkerStatus::Stopped {
                stopped.push(id.clone());
            }
        }
        for id in stopped {
            workers.remove(&id);
        }
    }

    /// 单个队列的统计
    pub async fn stats(&self, queue_name: &str) -> WorkerPoolStats {
        let workers = self.workers.read().await;
        let mut stats = WorkerPoolStats {
            queue_name: queue_name.to_string(),
            ..Default::default()
        };

        for handle in workers.values() {
            let state = handle.state.read().await;
            if state.queue_name != queue_name {
                continue;
            }
            stats.total_workers += 1;
            match state.status {
                WorkerStatus::Idle => stats.idle_workers += 1,
                WorkerStatus::Busy => stats.busy_workers += 1,
                WorkerStatus::Stopped => stats.stopped_workers += 1,
                WorkerStatus::Stopping | WorkerStatus::Error => {}
            }
            stats.tasks_handled += state.tasks_handled;
            stats.tasks_succeeded += state.tasks_succeeded;
            stats.tasks_failed += state.tasks_failed;
        }
        stats
    }

    /// worker运行时快照，管理面用
    pub async fn worker_states(&self, queue_name: Option<&str>) -> Vec<WorkerState> {
        let workers = self.workers.read().await;
        let mut states = Vec::new();
        for handle in workers.values() {
            let state = handle.state.read().await;
            if queue_name.map_or(true, |q| q == state.queue_name) {
                states.push(state.clone());
            }
        }
        states.sort_by(|a, b| a.id.cmp(&b.id));
        states
    }

    /// 指定队列当前未停止的worker数
    pub async fn worker_count(&self, queue_name: &str) -> usize {
        let workers = self.workers.read().await;
        let mut count = 0;
        for handle in workers.values() {
            let state = handle.state.read().await;
            if state.queue_name == queue_name && state.status != WorkerStatus::Stopped {
                count += 1;
            }
        }
        count
    }
}
