use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Success,
    Failed,
    Timeout,
    Retrying,
    Canceled,
    Rolledback,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
            TaskStatus::Timeout => "timeout",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Canceled => "canceled",
            TaskStatus::Rolledback => "rolledback",
        }
    }

    /// 终态：不再发生任何状态转移
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Canceled | TaskStatus::Rolledback
        )
    }

    /// 状态机合法边。超时的尝试在任务层面按失败处理，
    /// 因此 Timeout 可以进入 Retrying/Failed/Rolledback。
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Queued)
                | (Pending, Canceled)
                | (Queued, Running)
                | (Queued, Canceled)
                | (Running, Success)
                | (Running, Failed)
                | (Running, Timeout)
                | (Running, Canceled)
                | (Failed, Retrying)
                | (Failed, Rolledback)
                | (Timeout, Retrying)
                | (Timeout, Failed)
                | (Timeout, Rolledback)
                | (Retrying, Queued)
                | (Retrying, Canceled)
        )
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "queued" => Ok(TaskStatus::Queued),
            "running" => Ok(TaskStatus::Running),
            "success" => Ok(TaskStatus::Success),
            "failed" => Ok(TaskStatus::Failed),
            "timeout" => Ok(TaskStatus::Timeout),
            "retrying" => Ok(TaskStatus::Retrying),
            "canceled" => Ok(TaskStatus::Canceled),
            "rolledback" => Ok(TaskStatus::Rolledback),
            _ => Err(format!("无效的任务状态: {s}")),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 任务类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Command,
    Script,
    Deploy,
    Backup,
    Cleanup,
    Monitor,
    Report,
    Sync,
    Batch,
    Workflow,
    Scheduled,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Command => "command",
            TaskType::Script => "script",
            TaskType::Deploy => "deploy",
            TaskType::Backup => "backup",
            TaskType::Cleanup => "cleanup",
            TaskType::Monitor => "monitor",
            TaskType::Report => "report",
            TaskType::Sync => "sync",
            TaskType::Batch => "batch",
            TaskType::Workflow => "workflow",
            TaskType::Scheduled => "scheduled",
        }
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "command" => Ok(TaskType::Command),
            "script" => Ok(TaskType::Script),
            "deploy" => Ok(TaskType::Deploy),
            "backup" => Ok(TaskType::Backup),
            "cleanup" => Ok(TaskType::Cleanup),
            "monitor" => Ok(TaskType::Monitor),
            "report" => Ok(TaskType::Report),
            "sync" => Ok(TaskType::Sync),
            "batch" => Ok(TaskType::Batch),
            "workflow" => Ok(TaskType::Workflow),
            "scheduled" => Ok(TaskType::Scheduled),
            _ => Err(format!("无效的任务类型: {s}")),
        }
    }
}

/// 任务优先级，数值越大越优先
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn weight(&self) -> i32 {
        match self {
            Priority::Low => 1,
            Priority::Normal => 5,
            Priority::High => 10,
            Priority::Critical => 20,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            _ => Err(format!("无效的优先级: {s}")),
        }
    }
}

/// 执行器种类，提交时解析一次，固定能力集
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    Shell,
    Ssh,
    Http,
    Docker,
    Kubernetes,
    Script,
}

impl ExecutorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorKind::Shell => "shell",
            ExecutorKind::Ssh => "ssh",
            ExecutorKind::Http => "http",
            ExecutorKind::Docker => "docker",
            ExecutorKind::Kubernetes => "kubernetes",
            ExecutorKind::Script => "script",
        }
    }
}

impl FromStr for ExecutorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shell" => Ok(ExecutorKind::Shell),
            "ssh" => Ok(ExecutorKind::Ssh),
            "http" => Ok(ExecutorKind::Http),
            "docker" => Ok(ExecutorKind::Docker),
            "kubernetes" => Ok(ExecutorKind::Kubernetes),
            "script" => Ok(ExecutorKind::Script),
            _ => Err(format!("无效的执行器类型: {s}")),
        }
    }
}

/// 重试退避策略
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Linear,
    Exponential,
}

impl BackoffKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackoffKind::Linear => "linear",
            BackoffKind::Exponential => "exponential",
        }
    }
}

impl FromStr for BackoffKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linear" => Ok(BackoffKind::Linear),
            "exponential" => Ok(BackoffKind::Exponential),
            _ => Err(format!("无效的退避策略: {s}")),
        }
    }
}

/// 重试策略
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retry: i32,
    /// 基础重试延迟（秒）
    pub retry_delay_seconds: i64,
    pub backoff: BackoffKind,
    /// 退避延迟上限（秒），防止指数退避无限增长
    pub max_delay_seconds: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry: 0,
            retry_delay_seconds: 60,
            backoff: BackoffKind::Linear,
            max_delay_seconds: 3600,
        }
    }
}

impl RetryPolicy {
    /// 第 `attempt` 次重试的退避延迟（1起始）。
    /// linear: delay * attempt；exponential: delay * 2^(attempt-1)，封顶于上限。
    pub fn delay_for_attempt(&self, attempt: i32) -> Duration {
        let attempt = attempt.max(1);
        let base = self.retry_delay_seconds.max(0);
        let raw = match self.backoff {
            BackoffKind::Linear => base.saturating_mul(attempt as i64),
            BackoffKind::Exponential => {
                let shift = (attempt - 1).min(62) as u32;
                match 1i64.checked_shl(shift) {
                    Some(factor) => base.saturating_mul(factor),
                    None => i64::MAX,
                }
            }
        };
        Duration::seconds(raw.min(self.max_delay_seconds.max(0)))
    }
}

/// 依赖条件
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DependencyPolicy {
    /// 所有依赖任务都必须成功
    #[default]
    AllSuccess,
    /// 至少一个依赖任务成功
    AnySuccess,
}

impl DependencyPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DependencyPolicy::AllSuccess => "all_success",
            DependencyPolicy::AnySuccess => "any_success",
        }
    }
}

impl FromStr for DependencyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all_success" => Ok(DependencyPolicy::AllSuccess),
            "any_success" => Ok(DependencyPolicy::AnySuccess),
            _ => Err(format!("无效的依赖条件: {s}")),
        }
    }
}

/// 调度方式
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ScheduleMode {
    #[default]
    Immediate,
    Delayed {
        at: DateTime<Utc>,
    },
    Cron {
        expr: String,
        timezone: Option<String>,
    },
}

/// 任务定义
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub name: String,
    pub task_type: TaskType,
    pub priority: Priority,
    pub status: TaskStatus,

    // 执行目标
    pub target_type: Option<String>,
    pub target_ids: Vec<i64>,

    // 执行内容
    pub executor: ExecutorKind,
    pub payload: serde_json::Value,

    // 调度配置
    pub schedule: ScheduleMode,

    // 超时与重试
    pub timeout_seconds: i32,
    pub retry_policy: RetryPolicy,
    pub retry_count: i32,

    // 幂等控制
    pub idempotent_key: Option<String>,
    pub dedup_window_seconds: i64,

    // 回滚配置
    pub rollback_payload: Option<serde_json::Value>,

    // 依赖控制
    pub dependencies: Vec<i64>,
    pub dependency_policy: DependencyPolicy,

    // 队列信息
    pub queue_name: String,
    pub worker_id: Option<String>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,

    // 执行结果
    pub result: Option<TaskResult>,
    pub error: Option<String>,

    // 标签和元数据
    pub tags: Vec<String>,
    pub metadata: serde_json::Value,

    // 关联任务
    pub parent_id: Option<i64>,
    pub batch_id: Option<i64>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn rollback_enabled(&self) -> bool {
        self.rollback_payload.is_some()
    }
    pub fn has_dependencies(&self) -> bool {
        !self.dependencies.is_empty()
    }
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
    /// 剩余重试次数用尽
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.retry_policy.max_retry
    }
}

/// 任务执行结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub error_message: Option<String>,
    pub execution_time_ms: u64,
}

impl TaskResult {
    pub fn success_with_output(stdout: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            stdout: Some(stdout.into()),
            stderr: None,
            error_message: None,
            execution_time_ms: duration_ms,
        }
    }

    pub fn failure(
        exit_code: Option<i32>,
        stderr: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        let stderr = stderr.into();
        Self {
            success: false,
            exit_code,
            stdout: None,
            error_message: Some(stderr.clone()),
            stderr: Some(stderr),
            execution_time_ms: duration_ms,
        }
    }
}

/// 一次执行尝试的记录，尝试结束后不再修改
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecution {
    pub id: i64,
    pub task_id: i64,
    /// 第几次尝试，1起始
    pub attempt: i32,
    pub status: TaskStatus,
    pub worker_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub error: Option<String>,
    pub rollback_at: Option<DateTime<Utc>>,
    pub rollback_result: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// 尝试结束时写回的汇总，在一个事务内同时更新执行记录、任务和事件。
/// `status`记在执行记录上，`task_status`记在任务上：最后一次尝试超时
/// 的任务落为Failed，执行记录仍保留Timeout便于观测。
#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    pub execution_id: i64,
    pub task_id: i64,
    pub status: TaskStatus,
    pub task_status: TaskStatus,
    pub result: Option<TaskResult>,
    pub error: Option<String>,
    pub worker_id: String,
}

/// 任务过滤器
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<TaskType>,
    pub queue_name: Option<String>,
    pub batch_id: Option<i64>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// 提交方给出的任务定义，缺省字段在提交时补齐
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub task_type: TaskType,
    #[serde(default)]
    pub priority: Option<Priority>,
    pub executor: ExecutorKind,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub queue_name: Option<String>,
    #[serde(default)]
    pub schedule: ScheduleMode,
    #[serde(default)]
    pub timeout_seconds: Option<i32>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub idempotent_key: Option<String>,
    #[serde(default)]
    pub dedup_window_seconds: Option<i64>,
    #[serde(default)]
    pub rollback_payload: Option<serde_json::Value>,
    #[serde(default)]
    pub dependencies: Vec<i64>,
    #[serde(default)]
    pub dependency_policy: DependencyPolicy,
    #[serde(default)]
    pub target_type: Option<String>,
    #[serde(default)]
    pub target_ids: Vec<i64>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub parent_id: Option<i64>,
    #[serde(default)]
    pub batch_id: Option<i64>,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, task_type: TaskType, executor: ExecutorKind) -> Self {
        Self {
            name: name.into(),
            task_type,
            priority: None,
            executor,
            payload: serde_json::Value::Null,
            queue_name: None,
            schedule: ScheduleMode::Immediate,
            timeout_seconds: None,
            retry_policy: None,
            idempotent_key: None,
            dedup_window_seconds: None,
            rollback_payload: None,
            dependencies: Vec::new(),
            dependency_policy: DependencyPolicy::AllSuccess,
            target_type: None,
            target_ids: Vec::new(),
            tags: Vec::new(),
            metadata: None,
            parent_id: None,
            batch_id: None,
        }
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue_name = Some(queue.into());
        self
    }
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }
    pub fn timeout(mut self, seconds: i32) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }
    pub fn idempotent(mut self, key: impl Into<String>, window_seconds: i64) -> Self {
        self.idempotent_key = Some(key.into());
        self.dedup_window_seconds = Some(window_seconds);
        self
    }
    pub fn rollback(mut self, payload: serde_json::Value) -> Self {
        self.rollback_payload = Some(payload);
        self
    }
    pub fn depends_on(mut self, ids: Vec<i64>, policy: DependencyPolicy) -> Self {
        self.dependencies = ids;
        self.dependency_policy = policy;
        self
    }

    /// 补齐默认值并转换为任务记录（id由存储层生成）
    pub fn into_task(self, default_queue_timeout: Option<i32>, default_max_retry: Option<i32>) -> Task {
        let now = Utc::now();
        let retry_policy_was_none = self.retry_policy.is_none();
        let mut retry_policy = self.retry_policy.unwrap_or_default();
        if retry_policy_was_none {
            if let Some(max_retry) = default_max_retry {
                retry_policy.max_retry = max_retry;
            }
        }
        Task {
            id: 0,
            name: self.name,
            task_type: self.task_type,
            priority: self.priority.unwrap_or(Priority::Normal),
            status: TaskStatus::Pending,
            target_type: self.target_type,
            target_ids: self.target_ids,
            executor: self.executor,
            payload: self.payload,
            schedule: self.schedule,
            timeout_seconds: self
                .timeout_seconds
                .or(default_queue_timeout)
                .unwrap_or(300),
            retry_policy,
            retry_count: 0,
            idempotent_key: self.idempotent_key,
            dedup_window_seconds: self.dedup_window_seconds.unwrap_or(0),
            rollback_payload: self.rollback_payload,
            dependencies: self.dependencies,
            dependency_policy: self.dependency_policy,
            queue_name: self.queue_name.unwrap_or_else(|| "default".to_string()),
            worker_id: None,
            queued_at: None,
            started_at: None,
            ended_at: None,
            result: None,
            error: None,
            tags: self.tags,
            metadata: self.metadata.unwrap_or(serde_json::Value::Null),
            parent_id: self.parent_id,
            batch_id: self.batch_id,
            created_at: now,
            updated_at: now,
        }
    }
}
