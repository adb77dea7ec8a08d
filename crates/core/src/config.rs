//! 应用配置
//!
//! 分层加载：内置默认值 -> 可选TOML配置文件 -> `JOBCENTER_` 环境变量覆盖。

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::errors::{JobCenterError, JobCenterResult};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub cron: CronConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub idempotency: IdempotencyConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// 启动时注册的队列，为空则使用内置默认队列表
    #[serde(default)]
    pub queues: Vec<QueueSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://jobcenter.db".to_string(),
            max_connections: 5,
            min_connections: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeConfig {
    /// 节点标识，缺省时由主机名加随机后缀生成
    pub node_id: Option<String>,
}

impl NodeConfig {
    /// 解析节点标识
    pub fn resolve_node_id(&self) -> String {
        if let Some(ref id) = self.node_id {
            return id.clone();
        }
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{host}-{}", &suffix[..8])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronConfig {
    /// 调度循环间隔（秒）
    pub tick_interval_seconds: u64,
    /// Leader租约TTL（秒）
    pub leader_lease_seconds: i64,
    /// Leader选举使用的键
    pub leader_key: String,
    /// 错过触发补偿扫描的最大tick数
    pub misfire_scan_limit: usize,
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            tick_interval_seconds: 1,
            leader_lease_seconds: 15,
            leader_key: "cron-scheduler".to_string(),
            misfire_scan_limit: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// 出队阻塞等待时长（秒）
    pub dequeue_wait_seconds: u64,
    /// 任务租约超时（秒），超过后未确认的任务会被重新投递
    pub lease_timeout_seconds: u64,
    /// 停机时等待在途任务完成的时长（秒）
    pub shutdown_grace_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            dequeue_wait_seconds: 5,
            lease_timeout_seconds: 600,
            shutdown_grace_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// 等待在途结果的轮询间隔（毫秒）
    pub wait_poll_interval_ms: u64,
    /// 等待在途结果的最大轮询次数，0表示不等待直接返回在途记录
    pub wait_max_polls: u32,
    /// 过期记录清理间隔（秒）
    pub sweep_interval_seconds: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            wait_poll_interval_ms: 1000,
            wait_max_polls: 60,
            sweep_interval_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// 批次统计刷新间隔（秒）
    pub monitor_interval_seconds: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            monitor_interval_seconds: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    /// pretty 或 json
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    pub name: String,
    pub max_workers: u32,
    pub max_pending: u32,
    pub priority: i32,
    pub timeout_seconds: i32,
    pub max_retry: i32,
}

impl AppConfig {
    /// 内置默认队列表
    pub fn default_queues() -> Vec<QueueSettings> {
        vec![
            QueueSettings {
                name: "default".to_string(),
                max_workers: 10,
                max_pending: 1000,
                priority: 5,
                timeout_seconds: 300,
                max_retry: 3,
            },
            QueueSettings {
                name: "critical".to_string(),
                max_workers: 5,
                max_pending: 100,
                priority: 20,
                timeout_seconds: 600,
                max_retry: 5,
            },
            QueueSettings {
                name: "background".to_string(),
                max_workers: 20,
                max_pending: 5000,
                priority: 1,
                timeout_seconds: 3600,
                max_retry: 2,
            },
            QueueSettings {
                name: "deploy".to_string(),
                max_workers: 3,
                max_pending: 50,
                priority: 10,
                timeout_seconds: 1800,
                max_retry: 1,
            },
            QueueSettings {
                name: "batch".to_string(),
                max_workers: 15,
                max_pending: 2000,
                priority: 3,
                timeout_seconds: 7200,
                max_retry: 3,
            },
        ]
    }

    /// 加载配置，`path` 为可选的TOML配置文件路径
    pub fn load(path: Option<&str>) -> JobCenterResult<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        let settings = builder
            .add_source(
                Environment::with_prefix("JOBCENTER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| JobCenterError::Configuration(format!("配置加载失败: {e}")))?;

        let mut config: AppConfig = settings
            .try_deserialize()
            .map_err(|e| JobCenterError::Configuration(format!("配置解析失败: {e}")))?;

        if config.queues.is_empty() {
            config.queues = Self::default_queues();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> JobCenterResult<()> {
        if self.database.url.is_empty() {
            return Err(JobCenterError::config_error("database.url 不能为空"));
        }
        if self.database.max_connections == 0 {
            return Err(JobCenterError::config_error(
                "database.max_connections 必须大于0",
            ));
        }
        if self.cron.leader_lease_seconds <= 0 {
            return Err(JobCenterError::config_error(
                "cron.leader_lease_seconds 必须大于0",
            ));
        }
        if self.worker.lease_timeout_seconds == 0 {
            return Err(JobCenterError::config_error(
                "worker.lease_timeout_seconds 必须大于0",
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for queue in &self.queues {
            if queue.name.is_empty() {
                return Err(JobCenterError::config_error("队列名称不能为空"));
            }
            if !seen.insert(queue.name.clone()) {
                return Err(JobCenterError::Configuration(format!(
                    "队列名称重复: {}",
                    queue.name
                )));
            }
            if queue.max_workers == 0 {
                return Err(JobCenterError::Configuration(format!(
                    "队列 {} 的 max_workers 必须大于0",
                    queue.name
                )));
            }
            if queue.max_pending == 0 {
                return Err(JobCenterError::Configuration(format!(
                    "队列 {} 的 max_pending 必须大于0",
                    queue.name
                )));
            }
        }

        match self.logging.format.as_str() {
            "pretty" | "json" => {}
            other => {
                return Err(JobCenterError::Configuration(format!(
                    "不支持的日志格式: {other}"
                )))
            }
        }

        Ok(())
    }
}
