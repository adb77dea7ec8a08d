pub mod config;
pub mod errors;
pub mod logging;

pub use config::{
    AppConfig, BatchConfig, CronConfig, DatabaseConfig, IdempotencyConfig, LoggingConfig,
    NodeConfig, QueueSettings, WorkerConfig,
};
pub use errors::{JobCenterError, JobCenterResult};
