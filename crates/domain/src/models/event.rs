use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// 任务生命周期事件类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    Queued,
    Started,
    Retrying,
    Succeeded,
    Failed,
    RolledBack,
    Cancelled,
}

impl TaskEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskEventKind::Queued => "queued",
            TaskEventKind::Started => "started",
            TaskEventKind::Retrying => "retrying",
            TaskEventKind::Succeeded => "succeeded",
            TaskEventKind::Failed => "failed",
            TaskEventKind::RolledBack => "rolled_back",
            TaskEventKind::Cancelled => "cancelled",
        }
    }
}

impl FromStr for TaskEventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskEventKind::Queued),
            "started" => Ok(TaskEventKind::Started),
            "retrying" => Ok(TaskEventKind::Retrying),
            "succeeded" => Ok(TaskEventKind::Succeeded),
            "failed" => Ok(TaskEventKind::Failed),
            "rolled_back" => Ok(TaskEventKind::RolledBack),
            "cancelled" => Ok(TaskEventKind::Cancelled),
            _ => Err(format!("无效的事件类型: {s}")),
        }
    }
}

/// 任务审计事件，只追加，不更新不删除
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub id: i64,
    pub task_id: i64,
    pub kind: TaskEventKind,
    /// 事件来源：worker标识、"cron"、"user" 等
    pub source: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
