use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::TaskStatus;

/// 任务批次
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskBatch {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub status: TaskStatus,

    // 统计
    pub total_tasks: i32,
    pub pending_tasks: i32,
    pub running_tasks: i32,
    pub success_tasks: i32,
    pub failed_tasks: i32,

    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,

    // 配置
    pub stop_on_fail: bool,
    pub notify_on_complete: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskBatch {
    pub fn new(name: impl Into<String>, total: i32, stop_on_fail: bool) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            name: name.into(),
            description: None,
            status: TaskStatus::Pending,
            total_tasks: total,
            pending_tasks: total,
            running_tasks: 0,
            success_tasks: 0,
            failed_tasks: 0,
            started_at: None,
            ended_at: None,
            duration_ms: None,
            stop_on_fail,
            notify_on_complete: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// 所有成员都达到终态
    pub fn is_settled(&self) -> bool {
        self.pending_tasks == 0 && self.running_tasks == 0
    }

    pub fn apply_counts(&mut self, counts: &BatchCounts) {
        self.pending_tasks = counts.pending;
        self.running_tasks = counts.running;
        self.success_tasks = counts.success;
        self.failed_tasks = counts.failed;
    }
}

/// 由成员任务状态派生出的批次计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchCounts {
    /// pending + queued + retrying
    pub pending: i32,
    pub running: i32,
    pub success: i32,
    /// failed + canceled + rolledback
    pub failed: i32,
}
