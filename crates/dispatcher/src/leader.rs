//! Leader选举
//!
//! 基于TTL租约的单写者选举：心跳周期为租约的1/3，心跳失败即失去
//! 领导权，由下一个抢到CAS的节点接任。租约到期瞬间可能出现短暂的
//! 双主窗口，由CronJob的并发策略兜底。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use jobcenter_core::JobCenterResult;
use jobcenter_domain::repositories::LeaseRepository;

pub struct LeaderElector {
    node_id: String,
    key: String,
    ttl_seconds: i64,
    lease_repo: Arc<dyn LeaseRepository>,
    is_leader: AtomicBool,
}

impl LeaderElector {
    pub fn new(
        node_id: String,
        key: String,
        ttl_seconds: i64,
        lease_repo: Arc<dyn LeaseRepository>,
    ) -> Self {
        Self {
            node_id,
            key,
            ttl_seconds,
            lease_repo,
            is_leader: AtomicBool::new(false),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Acquire)
    }

    /// 单次获取/续约，更新本地领导权标记
    pub async fn try_acquire(&self) -> JobCenterResult<bool> {
        let was_leader = self.is_leader();
        let acquired = self
            .lease_repo
            .try_acquire(&self.key, &self.node_id, self.ttl_seconds)
            .await?;

        self.is_leader.store(acquired, Ordering::Release);
        match (was_leader, acquired) {
            (false, true) => info!("节点 {} 获得领导权 ({})", self.node_id, self.key),
            (true, false) => warn!("节点 {} 失去领导权 ({})", self.node_id, self.key),
            _ => {}
        }
        Ok(acquired)
    }

    /// 主动放弃领导权
    pub async fn resign(&self) -> JobCenterResult<()> {
        if self.is_leader.swap(false, Ordering::AcqRel) {
            info!("节点 {} 辞去领导权 ({})", self.node_id, self.key);
        }
        self.lease_repo.release(&self.key, &self.node_id).await
    }

    /// 心跳循环，直到取消信号
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let heartbeat = Duration::from_secs((self.ttl_seconds as u64 / 3).max(1));
        let mut ticker = interval(heartbeat);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.try_acquire().await {
                        // 心跳失败按失去领导权处理
                        error!("租约心跳失败: {}", e);
                        self.is_leader.store(false, Ordering::Release);
                    }
                }
                _ = shutdown.cancelled() => {
                    debug!("Leader心跳收到停止信号");
                    if let Err(e) = self.resign().await {
                        warn!("释放租约失败: {}", e);
                    }
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobcenter_infrastructure::{Database, SqliteLeaseRepository};

    async fn make_elector(node: &str, db: &Database, ttl: i64) -> Arc<LeaderElector> {
        Arc::new(LeaderElector::new(
            node.to_string(),
            "cron-scheduler".to_string(),
            ttl,
            Arc::new(SqliteLeaseRepository::new(db.pool().clone())),
        ))
    }

    #[tokio::test]
    async fn test_only_one_node_leads() {
        let db = Database::connect_in_memory().await.unwrap();
        let node1 = make_elector("node-1", &db, 30).await;
        let node2 = make_elector("node-2", &db, 30).await;

        assert!(node1.try_acquire().await.unwrap());
        assert!(!node2.try_acquire().await.unwrap());
        assert!(node1.is_leader());
        assert!(!node2.is_leader());

        // 续约保持领导权
        assert!(node1.try_acquire().await.unwrap());
    }

    #[tokio::test]
    async fn test_resign_hands_over_leadership() {
        let db = Database::connect_in_memory().await.unwrap();
        let node1 = make_elector("node-1", &db, 30).await;
        let node2 = make_elector("node-2", &db, 30).await;

        assert!(node1.try_acquire().await.unwrap());
        node1.resign().await.unwrap();
        assert!(!node1.is_leader());

        assert!(node2.try_acquire().await.unwrap());
        assert!(node2.is_leader());
    }

    #[tokio::test]
    async fn test_expired_lease_taken_over() {
        let db = Database::connect_in_memory().await.unwrap();
        let node1 = make_elector("node-1", &db, 0).await;
        let node2 = make_elector("node-2", &db, 30).await;

        // TTL为0的租约立即过期，node2可以接管
        assert!(node1.try_acquire().await.unwrap());
        assert!(node2.try_acquire().await.unwrap());

        // node1的下一次心跳观察到失去领导权
        assert!(!node1.try_acquire().await.unwrap());
        assert!(!node1.is_leader());
    }
}
