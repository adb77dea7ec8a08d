//! 运维自动化任务调度与执行引擎
//!
//! `JobCenter`是组合根：一套命名队列、每队列一组worker、cron调度器
//! 与leader选举、幂等台账、批次监控。领域模块（扩缩容、巡检、自愈等）
//! 作为生产者向引擎提交任务，通过`Executor`接口接入具体的执行通道。

pub mod app;
pub mod control;
pub mod shutdown;

pub use app::JobCenter;
pub use shutdown::ShutdownManager;

pub use jobcenter_core::{AppConfig, JobCenterError, JobCenterResult};
pub use jobcenter_domain as domain;
pub use jobcenter_worker::ExecutorRegistry;
