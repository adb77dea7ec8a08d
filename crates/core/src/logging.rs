//! 日志初始化

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;
use crate::errors::{JobCenterError, JobCenterResult};

/// 初始化tracing订阅器，环境变量 `RUST_LOG` 优先于配置中的级别
pub fn init_logging(config: &LoggingConfig) -> JobCenterResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| JobCenterError::Configuration(format!("无效的日志级别: {e}")))?;

    match config.format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_target(true))
                .try_init()
                .map_err(|e| JobCenterError::Configuration(format!("日志初始化失败: {e}")))?;
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_target(true))
                .try_init()
                .map_err(|e| JobCenterError::Configuration(format!("日志初始化失败: {e}")))?;
        }
    }

    Ok(())
}
