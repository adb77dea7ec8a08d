use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::task::TaskStatus;

/// 错过触发的补偿策略
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MisfirePolicy {
    /// 恢复后立即补发最近一次错过的触发
    FireNow,
    /// 丢弃错过的触发
    #[default]
    Ignore,
    /// 任意数量的错过触发合并为一次补发
    FireOnce,
}

impl MisfirePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MisfirePolicy::FireNow => "fire_now",
            MisfirePolicy::Ignore => "ignore",
            MisfirePolicy::FireOnce => "fire_once",
        }
    }
}

impl FromStr for MisfirePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fire_now" => Ok(MisfirePolicy::FireNow),
            "ignore" => Ok(MisfirePolicy::Ignore),
            "fire_once" => Ok(MisfirePolicy::FireOnce),
            _ => Err(format!("无效的misfire策略: {s}")),
        }
    }
}

/// 同一定时任务并发触发的处理策略
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrentPolicy {
    #[default]
    Allow,
    /// 上一次派生任务未达终态时跳过本次触发
    Forbid,
    /// 先取消在途任务再触发
    Replace,
}

impl ConcurrentPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConcurrentPolicy::Allow => "allow",
            ConcurrentPolicy::Forbid => "forbid",
            ConcurrentPolicy::Replace => "replace",
        }
    }
}

impl FromStr for ConcurrentPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" => Ok(ConcurrentPolicy::Allow),
            "forbid" => Ok(ConcurrentPolicy::Forbid),
            "replace" => Ok(ConcurrentPolicy::Replace),
            _ => Err(format!("无效的并发策略: {s}")),
        }
    }
}

/// 定时任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,

    pub cron_expr: String,
    /// 固定偏移时区（如 "+08:00"），缺省UTC
    pub timezone: Option<String>,
    pub enabled: bool,

    /// 每次触发时物化为任务的JSON模板（TaskSpec结构）
    pub task_template: serde_json::Value,

    pub misfire_policy: MisfirePolicy,
    pub concurrent_policy: ConcurrentPolicy,

    // 统计
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub run_count: i64,
    pub success_count: i64,
    pub fail_count: i64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CronJob {
    pub fn new(
        name: impl Into<String>,
        cron_expr: impl Into<String>,
        task_template: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            name: name.into(),
            description: None,
            cron_expr: cron_expr.into(),
            timezone: None,
            enabled: true,
            task_template,
            misfire_policy: MisfirePolicy::default(),
            concurrent_policy: ConcurrentPolicy::default(),
            last_run_at: None,
            next_run_at: None,
            run_count: 0,
            success_count: 0,
            fail_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// 每次实际触发记录一行，关联派生出的任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronExecution {
    pub id: i64,
    pub cron_job_id: i64,
    pub task_id: Option<i64>,
    /// 触发所在节点
    pub node_id: String,
    /// 计划触发时间
    pub scheduled_at: DateTime<Utc>,
    pub fired_at: DateTime<Utc>,
    pub status: TaskStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}
