use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use jobcenter_core::JobCenterResult;
use jobcenter_domain::repositories::LeaseRepository;
use jobcenter_domain::LeaderLease;

/// Leader租约存储。获取与续约合并为一条带守卫条件的UPSERT，
/// 同一时刻只可能有一个节点的语句生效。
pub struct SqliteLeaseRepository {
    pool: SqlitePool,
}

impl SqliteLeaseRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeaseRepository for SqliteLeaseRepository {
    async fn try_acquire(
        &self,
        key: &str,
        node_id: &str,
        ttl_seconds: i64,
    ) -> JobCenterResult<bool> {
        let now = Utc::now();
        let expires_at = now + Duration::seconds(ttl_seconds);

        let result = sqlx::query(
            r#"
            INSERT INTO leader_leases (lease_key, holder, expires_at, acquired_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(lease_key) DO UPDATE SET
                holder = excluded.holder,
                expires_at = excluded.expires_at,
                acquired_at = CASE
                    WHEN leader_leases.holder = excluded.holder THEN leader_leases.acquired_at
                    ELSE excluded.acquired_at
                END
            WHERE leader_leases.holder = excluded.holder
               OR leader_leases.expires_at <= ?5
            "#,
        )
        .bind(key)
        .bind(node_id)
        .bind(expires_at)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let acquired = result.rows_affected() > 0;
        if acquired {
            debug!("节点 {} 持有租约 {} 至 {}", node_id, key, expires_at);
        }
        Ok(acquired)
    }

    async fn release(&self, key: &str, node_id: &str) -> JobCenterResult<()> {
        sqlx::query("DELETE FROM leader_leases WHERE lease_key = ?1 AND holder = ?2")
            .bind(key)
            .bind(node_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn current(&self, key: &str) -> JobCenterResult<Option<LeaderLease>> {
        let row = sqlx::query("SELECT * FROM leader_leases WHERE lease_key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| {
            Ok(LeaderLease {
                key: r.try_get("lease_key")?,
                holder: r.try_get("holder")?,
                expires_at: r.try_get("expires_at")?,
                acquired_at: r.try_get("acquired_at")?,
            })
        })
        .transpose()
    }
}
