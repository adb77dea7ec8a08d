use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobCenterError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),
    #[error("任务未找到: {id}")]
    TaskNotFound { id: i64 },
    #[error("任务批次未找到: {id}")]
    BatchNotFound { id: i64 },
    #[error("定时任务未找到: {id}")]
    CronJobNotFound { id: i64 },
    #[error("队列未找到: {name}")]
    QueueNotFound { name: String },
    #[error("队列 {queue} 已满 (max_pending={max_pending})")]
    QueueFull { queue: String, max_pending: u32 },
    #[error("重复提交: 幂等键 {key} 命中任务 {task_id}")]
    DuplicateSubmission { key: String, task_id: i64 },
    #[error("依赖条件未满足: 任务 {task_id} - {reason}")]
    DependencyUnsatisfied { task_id: i64, reason: String },
    #[error("检测到循环依赖")]
    CircularDependency,
    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },
    #[error("任务执行错误: {0}")]
    Execution(String),
    #[error("任务执行超时 ({timeout_seconds}s)")]
    ExecutionTimeout { timeout_seconds: i32 },
    #[error("失去领导权")]
    LeadershipLost,
    #[error("无效的任务参数: {0}")]
    InvalidTaskParams(String),
    #[error("数据验证失败: {0}")]
    Validation(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type JobCenterResult<T> = Result<T, JobCenterError>;

impl JobCenterError {
    pub fn task_not_found(id: i64) -> Self {
        Self::TaskNotFound { id }
    }
    pub fn queue_not_found<S: Into<String>>(name: S) -> Self {
        Self::QueueNotFound { name: name.into() }
    }
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }
    pub fn invalid_params<S: Into<String>>(msg: S) -> Self {
        Self::InvalidTaskParams(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// 瞬态错误：可以通过重试/退避在本地恢复
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobCenterError::Execution(_)
                | JobCenterError::ExecutionTimeout { .. }
                | JobCenterError::QueueFull { .. }
                | JobCenterError::DatabaseOperation(_)
        )
    }

    /// 需要立即上报给提交方、绝不静默重试的错误
    pub fn is_terminal_for_caller(&self) -> bool {
        matches!(
            self,
            JobCenterError::Validation(_)
                | JobCenterError::InvalidTaskParams(_)
                | JobCenterError::DependencyUnsatisfied { .. }
                | JobCenterError::CircularDependency
                | JobCenterError::InvalidCron { .. }
        )
    }
}

impl From<serde_json::Error> for JobCenterError {
    fn from(err: serde_json::Error) -> Self {
        JobCenterError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for JobCenterError {
    fn from(err: anyhow::Error) -> Self {
        JobCenterError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(JobCenterError::Execution("exit 1".to_string()).is_retryable());
        assert!(JobCenterError::ExecutionTimeout {
            timeout_seconds: 300
        }
        .is_retryable());
        assert!(JobCenterError::QueueFull {
            queue: "default".to_string(),
            max_pending: 100
        }
        .is_retryable());
        assert!(!JobCenterError::Validation("bad".to_string()).is_retryable());
    }

    #[test]
    fn test_terminal_for_caller() {
        assert!(JobCenterError::DependencyUnsatisfied {
            task_id: 1,
            reason: "dep 2 failed".to_string()
        }
        .is_terminal_for_caller());
        assert!(!JobCenterError::Execution("boom".to_string()).is_terminal_for_caller());
    }

    #[test]
    fn test_error_display() {
        let err = JobCenterError::QueueFull {
            queue: "critical".to_string(),
            max_pending: 100,
        };
        assert_eq!(err.to_string(), "队列 critical 已满 (max_pending=100)");
    }
}
