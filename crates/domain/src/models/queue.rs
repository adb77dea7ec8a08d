use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 队列容量与默认策略配置，运行期只读
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    pub description: Option<String>,
    pub max_workers: u32,
    pub max_pending: u32,
    /// 队列级优先级，仅作跨队列调度权重
    pub priority: i32,
    /// 队列内任务的默认超时（秒）
    pub timeout_seconds: i32,
    /// 队列内任务的默认最大重试次数
    pub max_retry: i32,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>, max_workers: u32, max_pending: u32) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            description: None,
            max_workers,
            max_pending,
            priority: 5,
            timeout_seconds: 300,
            max_retry: 3,
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }
}

/// 队列实时状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStatus {
    pub config: QueueConfig,
    /// 等待中的任务数
    pub pending: usize,
    /// 已出队未确认的任务数
    pub in_flight: usize,
    /// 当前绑定的worker数
    pub workers: usize,
}
