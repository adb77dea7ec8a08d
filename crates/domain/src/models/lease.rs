use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Leader租约记录，每个选举键一行，只通过原子CAS语句变更
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderLease {
    pub key: String,
    pub holder: String,
    pub expires_at: DateTime<Utc>,
    pub acquired_at: DateTime<Utc>,
}

impl LeaderLease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
