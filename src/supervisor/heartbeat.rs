use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::LeaseConfig;
use crate::error::ExecutorError;
use crate::lease::{Lease, LeaseClient};

/// Final state of a stopped heartbeat.
#[derive(Debug)]
pub struct HeartbeatOutcome {
    /// Most recently renewed lease
    pub lease: Lease,
    /// Set when the lease stopped authorizing this execution
    pub lost: Option<ExecutorError>,
    pub renewals: u32,
}

/// Periodic lease renewal scoped to one execution.
///
/// The heartbeat is the only caller of `renew` for its lease. It renews every
/// `renew_interval`, starting one interval after spawn. When the lease is lost
/// (fencing token superseded, or lapsed) it cancels the execution token and
/// exits.
///
/// It also keeps a local expiry: `ttl` after the start of the last call that
/// the service granted (the acquire, then each successful renew). The service
/// can only have extended the lease from a later instant, so reaching the
/// local expiry means the lease may already belong to someone else. The
/// execution is cancelled at that instant, whether or not a renew is due or
/// still in flight.
pub struct Heartbeat {
    stop: CancellationToken,
    lease: Lease,
    handle: JoinHandle<HeartbeatOutcome>,
}

impl Heartbeat {
    /// `granted_at` is when the acquire call that produced `lease` was issued.
    pub fn spawn(
        client: LeaseClient,
        lease: Lease,
        config: LeaseConfig,
        granted_at: Instant,
        execution: CancellationToken,
    ) -> Self {
        let stop = CancellationToken::new();
        let handle = tokio::spawn(run(
            client,
            lease.clone(),
            config,
            granted_at + config.ttl,
            execution,
            stop.clone(),
        ));
        Self {
            stop,
            lease,
            handle,
        }
    }

    /// Stop renewing. No renew call is issued after this returns.
    pub async fn stop(self) -> HeartbeatOutcome {
        self.stop.cancel();
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(key = %self.lease.key, error = %e, "Heartbeat task failed");
                HeartbeatOutcome {
                    lease: self.lease,
                    lost: None,
                    renewals: 0,
                }
            }
        }
    }
}

fn expired(lease: Lease, renewals: u32, execution: &CancellationToken) -> HeartbeatOutcome {
    tracing::error!(
        key = %lease.key,
        fencing_token = lease.fencing_token,
        renewals,
        "Lease could not be renewed within its ttl"
    );
    execution.cancel();
    HeartbeatOutcome {
        lost: Some(ExecutorError::LeaseExpired {
            key: lease.key.clone(),
        }),
        lease,
        renewals,
    }
}

async fn run(
    client: LeaseClient,
    mut lease: Lease,
    config: LeaseConfig,
    mut expires_at: Instant,
    execution: CancellationToken,
    stop: CancellationToken,
) -> HeartbeatOutcome {
    let mut ticker = tokio::time::interval_at(
        Instant::now() + config.renew_interval,
        config.renew_interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut renewals = 0u32;

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep_until(expires_at) => return expired(lease, renewals, &execution),
            _ = ticker.tick() => {}
        }

        let issued_at = Instant::now();
        let result = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep_until(expires_at) => return expired(lease, renewals, &execution),
            result = client.renew(&lease, config.ttl) => result,
        };

        match result {
            Ok(renewed) => {
                lease = renewed;
                expires_at = issued_at + config.ttl;
                renewals += 1;
                tracing::debug!(
                    key = %lease.key,
                    fencing_token = lease.fencing_token,
                    renewals,
                    "Lease renewed"
                );
            }
            Err(e) if e.is_lease_gone() => {
                tracing::warn!(key = %lease.key, fencing_token = lease.fencing_token, error = %e, "Lease lost");
                execution.cancel();
                return HeartbeatOutcome {
                    lease,
                    lost: Some(e),
                    renewals,
                };
            }
            Err(e) => {
                tracing::warn!(
                    key = %lease.key,
                    error = %e,
                    remaining_ms = expires_at.saturating_duration_since(Instant::now()).as_millis() as u64,
                    "Lease renewal failed, retrying next tick"
                );
            }
        }
    }

    HeartbeatOutcome {
        lease,
        lost: None,
        renewals,
    }
}
