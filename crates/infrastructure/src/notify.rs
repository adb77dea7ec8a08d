//! 通知实现
//!
//! 宿主应用可以接入钉钉/邮件等通道，引擎默认只落日志。

use async_trait::async_trait;
use tracing::info;

use jobcenter_core::JobCenterResult;
use jobcenter_domain::ports::Notifier;

#[derive(Debug, Default)]
pub struct LogNotifier;

impl LogNotifier {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_message(&self, title: &str, content: &str) -> JobCenterResult<()> {
        info!("通知: {} - {}", title, content);
        Ok(())
    }
}
