//! 优雅关闭管理器

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct ShutdownManager {
    root: CancellationToken,
    is_shutdown: RwLock<bool>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            is_shutdown: RwLock::new(false),
        }
    }

    /// 派生子令牌，后台循环各自持有
    pub fn subscribe(&self) -> CancellationToken {
        self.root.child_token()
    }

    /// 触发关闭，幂等
    pub async fn shutdown(&self) {
        let mut is_shutdown = self.is_shutdown.write().await;
        if *is_shutdown {
            debug!("关闭信号已经触发过");
            return;
        }
        *is_shutdown = true;
        info!("触发系统关闭");
        self.root.cancel();
    }

    pub async fn is_shutdown(&self) -> bool {
        *self.is_shutdown.read().await
    }

    /// 等待Ctrl-C信号
    pub async fn wait_for_signal(&self) {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("收到中断信号"),
            Err(e) => tracing::error!("监听中断信号失败: {}", e),
        }
        self.shutdown().await;
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}
