//! 幂等台账
//!
//! 幂等键 -> 任务的映射，带去重窗口TTL。命中在途任务时按配置的
//! 有界轮询等待其终态，等待耗尽返回当前的在途记录而不是无限阻塞。
//! 内存表覆盖热路径，存储层的幂等键索引兜底进程重启。

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use jobcenter_core::{IdempotencyConfig, JobCenterResult};
use jobcenter_domain::repositories::TaskRepository;
use jobcenter_domain::Task;

#[derive(Debug, Clone)]
struct LedgerEntry {
    task_id: i64,
    expires_at: DateTime<Utc>,
}

pub struct IdempotencyLedger {
    entries: RwLock<HashMap<String, LedgerEntry>>,
    task_repo: Arc<dyn TaskRepository>,
    config: IdempotencyConfig,
}

impl IdempotencyLedger {
    pub fn new(task_repo: Arc<dyn TaskRepository>, config: IdempotencyConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            task_repo,
            config,
        }
    }

    /// 查找去重窗口内的既有任务。过期条目在查找时顺手清除。
    pub async fn lookup(&self, key: &str) -> JobCenterResult<Option<Task>> {
        let now = Utc::now();
        let cached = {
            let entries = self.entries.read().await;
            entries.get(key).cloned()
        };

        if let Some(entry) = cached {
            if entry.expires_at <= now {
                let mut entries = self.entries.write().await;
                entries.remove(key);
            } else if let Some(task) = self.task_repo.get_by_id(entry.task_id).await? {
                return Ok(Some(task));
            }
        }

        // 内存未命中时回查存储（进程重启后的窗口内提交）
        let task = self.task_repo.get_by_idempotent_key(key).await?;
        if let Some(ref task) = task {
            self.record(key, task.id, task.dedup_window_seconds).await;
        }
        Ok(task)
    }

    /// 登记在途/结果指针，窗口从现在起算
    pub async fn record(&self, key: &str, task_id: i64, window_seconds: i64) {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            LedgerEntry {
                task_id,
                expires_at: Utc::now() + Duration::seconds(window_seconds.max(0)),
            },
        );
    }

    /// 等待在途任务到达终态，轮询次数与间隔由配置决定。
    /// `wait_max_polls = 0` 表示不等待。等待耗尽返回最新的任务快照。
    pub async fn await_result(&self, task: Task) -> JobCenterResult<Task> {
        if task.is_terminal() {
            return Ok(task);
        }
        let task_id = task.id;

        let interval = std::time::Duration::from_millis(self.config.wait_poll_interval_ms.max(1));
        let mut latest = task;
        for _ in 0..self.config.wait_max_polls {
            tokio::time::sleep(interval).await;
            match self.task_repo.get_by_id(task_id).await? {
                Some(task) if task.is_terminal() => {
                    debug!("幂等等待结束: 任务 {} 达到终态 {}", task_id, task.status);
                    return Ok(task);
                }
                Some(task) => latest = task,
                None => break,
            }
        }

        warn!("幂等等待超时: 任务 {} 仍在执行中", task_id);
        Ok(latest)
    }

    /// 清理过期条目
    pub async fn sweep(&self) {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        let removed = before - entries.len();
        if removed > 0 {
            debug!("幂等台账清理了 {} 条过期记录", removed);
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// 周期清理循环
    pub async fn run_sweeper(self: Arc<Self>, shutdown: CancellationToken) {
        let interval =
            std::time::Duration::from_secs(self.config.sweep_interval_seconds.max(1));
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep().await,
                _ = shutdown.cancelled() => {
                    info!("幂等台账清理循环收到停止信号");
                    break;
                }
            }
        }
    }
}
