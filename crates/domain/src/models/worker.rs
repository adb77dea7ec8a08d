use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Worker运行状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Stopping,
    Stopped,
    Error,
}

/// Worker运行时信息，存活于内存，通过统计接口对外暴露
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerState {
    pub id: String,
    pub queue_name: String,
    pub status: WorkerStatus,
    pub current_task_id: Option<i64>,
    pub tasks_handled: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub last_heartbeat: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
}

impl WorkerState {
    pub fn new(id: impl Into<String>, queue_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            queue_name: queue_name.into(),
            status: WorkerStatus::Idle,
            current_task_id: None,
            tasks_handled: 0,
            tasks_succeeded: 0,
            tasks_failed: 0,
            last_heartbeat: now,
            started_at: now,
        }
    }
}

/// 单个队列的Worker池统计
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerPoolStats {
    pub queue_name: String,
    pub total_workers: usize,
    pub idle_workers: usize,
    pub busy_workers: usize,
    pub stopped_workers: usize,
    pub tasks_handled: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
}
