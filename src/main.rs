use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use jobcenter::{AppConfig, ExecutorRegistry, JobCenter};

/// 运维自动化任务调度与执行引擎
#[derive(Parser, Debug)]
#[command(name = "jobcenter", version, about = "运维自动化任务调度与执行引擎")]
struct Cli {
    /// TOML配置文件路径
    #[arg(short, long)]
    config: Option<String>,

    /// 覆盖日志级别 (trace/debug/info/warn/error)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref()).context("配置加载失败")?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    jobcenter_core::logging::init_logging(&config.logging).context("日志初始化失败")?;

    info!("jobcenter {} 启动中", env!("CARGO_PKG_VERSION"));

    // 执行通道（shell/ssh/docker/k8s等）由宿主应用通过库接口注入；
    // 独立运行的进程只提供调度与管理面
    let executors = ExecutorRegistry::new();
    if executors.is_empty() {
        warn!("以空执行器集启动：任务提交会被校验拒绝，仅调度与管理面可用");
    }

    let center = JobCenter::new(config, executors, None)
        .await
        .context("任务中心初始化失败")?;
    center.start().await.context("任务中心启动失败")?;

    center.wait_for_signal().await;
    center.stop().await;

    info!("进程退出");
    Ok(())
}
