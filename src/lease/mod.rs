//! Lease-based mutual exclusion.
//!
//! A [`Lease`] is time-bounded, fenced ownership of a job key. Holding a
//! non-expired lease is the only authorization to run that job's container.
//! The fencing token grows monotonically per key, so a former holder that
//! slept through its TTL learns on its next renewal that someone else has
//! taken over.
//!
//! [`LeaseService`] is the coordination-service boundary; [`LeaseClient`] is
//! what the supervisor talks to.

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{ExecutorError, Result};
use crate::retry::RetryPolicy;

pub use memory::InMemoryLeaseService;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: String,
    /// Unique per execution attempt
    pub owner: String,
    pub ttl: Duration,
    pub fencing_token: u64,
    pub acquired_at: DateTime<Utc>,
}

#[async_trait]
pub trait LeaseService: Send + Sync {
    /// Atomically take `key` if no unexpired lease exists. Fails with `LockHeld` otherwise.
    async fn acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<Lease>;

    /// Extend the lease if the caller still holds the current fencing token.
    ///
    /// Fails with `LeaseLost` when another holder has since acquired the key,
    /// or `LeaseExpired` when the lease lapsed without a successor.
    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Lease>;

    /// Give the lease up. Releasing a superseded lease is a no-op.
    async fn release(&self, lease: &Lease) -> Result<()>;
}

/// Lease coordinator client used by execution supervisors.
///
/// Retries the service only while it is unavailable; contention and loss are
/// returned to the caller immediately.
#[derive(Clone)]
pub struct LeaseClient {
    service: Arc<dyn LeaseService>,
    retry: RetryPolicy,
}

impl LeaseClient {
    pub fn new(service: Arc<dyn LeaseService>, retry: RetryPolicy) -> Self {
        Self { service, retry }
    }

    pub async fn acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<Lease> {
        let lease = self
            .retry
            .run("lease_acquire", || self.service.acquire(key, owner, ttl))
            .await?;
        tracing::debug!(key, owner, fencing_token = lease.fencing_token, "Lease acquired");
        Ok(lease)
    }

    pub async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Lease> {
        let renewed = self
            .retry
            .run("lease_renew", || self.service.renew(lease, ttl))
            .await?;
        if renewed.fencing_token != lease.fencing_token {
            // A renewal must never hand out a different token.
            return Err(ExecutorError::LeaseLost {
                key: lease.key.clone(),
                held: lease.fencing_token,
                current: renewed.fencing_token,
            });
        }
        tracing::trace!(key = %lease.key, fencing_token = lease.fencing_token, "Lease renewed");
        Ok(renewed)
    }

    /// Best-effort: failures are logged, TTL expiry bounds the damage.
    pub async fn release(&self, lease: &Lease) {
        match self
            .retry
            .run("lease_release", || self.service.release(lease))
            .await
        {
            Ok(()) => {
                tracing::debug!(key = %lease.key, fencing_token = lease.fencing_token, "Lease released")
            }
            Err(e) => tracing::warn!(
                key = %lease.key,
                fencing_token = lease.fencing_token,
                error = %e,
                "Failed to release lease, it will expire after its ttl"
            ),
        }
    }
}

impl std::fmt::Debug for LeaseClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseClient")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
