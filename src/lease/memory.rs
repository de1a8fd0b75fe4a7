use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{ExecutorError, Result};
use crate::lease::{Lease, LeaseService};

#[derive(Debug)]
struct Holder {
    owner: String,
    fencing_token: u64,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Leases {
    holders: HashMap<String, Holder>,
    /// Last token handed out per key; survives release so tokens never repeat.
    last_token: HashMap<String, u64>,
}

/// Process-local lease service with compare-and-set semantics.
///
/// Every operation runs under one mutex, which makes acquire atomic. Expiry is
/// evaluated lazily against `tokio::time::Instant`.
#[derive(Debug, Default)]
pub struct InMemoryLeaseService {
    leases: Mutex<Leases>,
}

impl InMemoryLeaseService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current unexpired holder of `key`, if any.
    pub async fn holder(&self, key: &str) -> Option<(String, u64)> {
        let leases = self.leases.lock().await;
        leases
            .holders
            .get(key)
            .filter(|h| h.expires_at > Instant::now())
            .map(|h| (h.owner.clone(), h.fencing_token))
    }
}

#[async_trait]
impl LeaseService for InMemoryLeaseService {
    async fn acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<Lease> {
        let now = Instant::now();
        let mut leases = self.leases.lock().await;

        if let Some(holder) = leases.holders.get(key) {
            if holder.expires_at > now {
                return Err(ExecutorError::LockHeld {
                    key: key.to_string(),
                });
            }
            tracing::debug!(
                key,
                previous_owner = %holder.owner,
                fencing_token = holder.fencing_token,
                "Taking over expired lease"
            );
        }

        let token = leases.last_token.get(key).copied().unwrap_or(0) + 1;
        leases.last_token.insert(key.to_string(), token);
        leases.holders.insert(
            key.to_string(),
            Holder {
                owner: owner.to_string(),
                fencing_token: token,
                expires_at: now + ttl,
            },
        );

        Ok(Lease {
            key: key.to_string(),
            owner: owner.to_string(),
            ttl,
            fencing_token: token,
            acquired_at: Utc::now(),
        })
    }

    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Lease> {
        let now = Instant::now();
        let mut leases = self.leases.lock().await;
        let latest = leases.last_token.get(&lease.key).copied().unwrap_or(0);

        if latest != lease.fencing_token {
            return Err(ExecutorError::LeaseLost {
                key: lease.key.clone(),
                held: lease.fencing_token,
                current: latest,
            });
        }

        let live = leases
            .holders
            .get(&lease.key)
            .map(|h| h.expires_at > now)
            .unwrap_or(false);
        if !live {
            leases.holders.remove(&lease.key);
            return Err(ExecutorError::LeaseExpired {
                key: lease.key.clone(),
            });
        }

        if let Some(holder) = leases.holders.get_mut(&lease.key) {
            holder.expires_at = now + ttl;
        }
        Ok(Lease {
            ttl,
            ..lease.clone()
        })
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        let mut leases = self.leases.lock().await;
        let current = leases
            .holders
            .get(&lease.key)
            .map(|h| h.fencing_token == lease.fencing_token)
            .unwrap_or(false);
        if current {
            leases.holders.remove(&lease.key);
        }
        Ok(())
    }
}
