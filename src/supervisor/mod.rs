//! Execution supervision.
//!
//! [`ExecutionSupervisor::execute`] drives one job-run attempt end to end:
//!
//! ```text
//! Pending ─► LockAcquiring ─┬─► LockNotAcquired                      (no container)
//!                           └─► Running ─► Finalizing ─┬─► Succeeded
//!                                                      ├─► Failed    (exit != 0, lock lost, cancelled)
//!                                                      ├─► TimedOut
//!                                                      └─► RuntimeError
//! ```
//!
//! While `Running`, a [`Heartbeat`] keeps the lease alive. Leaving `Running`
//! stops it before anything else happens. `Finalizing` drains logs, removes
//! the container and releases the lease; removal and release are both
//! attempted whatever happened before, and a failure in one never skips the
//! other. The lease is not released when it was lost.

pub mod heartbeat;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{ExecutorConfig, LeaseConfig, SandboxConfig};
use crate::error::ExecutorError;
use crate::execution::{ExecutionReport, ExecutionState, FailureCause, TerminalState};
use crate::job::JobRunRequest;
use crate::lease::{LeaseClient, LeaseService};
use crate::runtime::{
    ContainerClient, ContainerHandle, ContainerLogs, ContainerRuntime, ContainerSpec, ExitStatus,
};

pub use heartbeat::{Heartbeat, HeartbeatOutcome};

/// How the container phase of an attempt ended.
#[derive(Debug)]
enum RunOutcome {
    Exited(ExitStatus),
    DeadlineExceeded,
    /// The execution token was cancelled: lease lost or executor shutdown
    Interrupted,
    StartFailed(ExecutorError),
    WaitFailed(ExecutorError),
}

impl RunOutcome {
    fn started(&self) -> bool {
        !matches!(self, RunOutcome::StartFailed(_))
    }
}

/// Bookkeeping for one attempt.
struct Attempt {
    id: Uuid,
    job_id: u64,
    state: ExecutionState,
    started_at: DateTime<Utc>,
}

impl Attempt {
    fn new(job_id: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            state: ExecutionState::Pending,
            started_at: Utc::now(),
        }
    }

    fn transition(&mut self, next: ExecutionState) {
        tracing::debug!(
            job_id = self.job_id,
            attempt_id = %self.id,
            from = %self.state,
            to = %next,
            "Execution state transition"
        );
        self.state = next;
    }

    fn close(
        mut self,
        terminal: TerminalState,
        cause: Option<FailureCause>,
        exit_code: Option<i32>,
        logs: ContainerLogs,
    ) -> ExecutionReport {
        self.transition(ExecutionState::Terminal(terminal));
        ExecutionReport {
            job_id: self.job_id,
            attempt_id: self.id,
            terminal_state: terminal,
            cause,
            exit_code,
            stdout: logs.stdout,
            stderr: logs.stderr,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}

/// Runs job attempts under a lease, inside a disposable container.
///
/// One supervisor is shared by all workers of a dispatcher; every call to
/// [`execute`](Self::execute) is an independent attempt with its own lease,
/// container and heartbeat.
#[derive(Debug, Clone)]
pub struct ExecutionSupervisor {
    executor_id: String,
    lease: LeaseClient,
    runtime: ContainerClient,
    lease_config: LeaseConfig,
    sandbox: SandboxConfig,
    default_timeout: Duration,
}

impl ExecutionSupervisor {
    pub fn new(
        config: &ExecutorConfig,
        lease_service: Arc<dyn LeaseService>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            executor_id: config.executor_id.clone(),
            lease: LeaseClient::new(lease_service, config.lease_retry),
            runtime: ContainerClient::new(runtime, config.runtime_retry),
            lease_config: config.lease,
            sandbox: config.sandbox.clone(),
            default_timeout: config.dispatcher.default_job_timeout,
        }
    }

    pub fn executor_id(&self) -> &str {
        &self.executor_id
    }

    /// Run one attempt of `request`. Never fails: every outcome is a report.
    ///
    /// Cancelling `cancel` (executor shutdown) kills the container and closes
    /// the attempt as `Failed` with cause `Cancelled`.
    pub async fn execute(&self, request: &JobRunRequest, cancel: CancellationToken) -> ExecutionReport {
        let mut attempt = Attempt::new(request.job_id);
        attempt.transition(ExecutionState::LockAcquiring);

        let key = request.lease_key();
        let owner = format!("{}/{}", self.executor_id, attempt.id);
        // The service counts the ttl from some point after this instant.
        let requested_at = Instant::now();
        let acquired = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return attempt.close(
                    TerminalState::LockNotAcquired,
                    Some(FailureCause::Cancelled),
                    None,
                    ContainerLogs::default(),
                );
            }
            result = self.lease.acquire(&key, &owner, self.lease_config.ttl) => result,
        };

        let lease = match acquired {
            Ok(lease) => lease,
            Err(ExecutorError::LockHeld { .. }) => {
                tracing::info!(
                    job_id = request.job_id,
                    attempt_id = %attempt.id,
                    "Job lease held by another executor"
                );
                return attempt.close(
                    TerminalState::LockNotAcquired,
                    Some(FailureCause::LockHeld),
                    None,
                    ContainerLogs::default(),
                );
            }
            Err(e) => {
                tracing::warn!(
                    job_id = request.job_id,
                    attempt_id = %attempt.id,
                    error = %e,
                    "Could not acquire job lease"
                );
                return attempt.close(
                    TerminalState::LockNotAcquired,
                    Some(FailureCause::LeaseUnavailable(e.to_string())),
                    None,
                    ContainerLogs::default(),
                );
            }
        };

        attempt.transition(ExecutionState::Running);
        tracing::info!(
            job_id = request.job_id,
            attempt_id = %attempt.id,
            fencing_token = lease.fencing_token,
            "Job lease acquired"
        );

        let execution = cancel.child_token();
        let heartbeat = Heartbeat::spawn(
            self.lease.clone(),
            lease,
            self.lease_config,
            requested_at,
            execution.clone(),
        );

        let spec = ContainerSpec::for_request(request, &self.sandbox, attempt.id);
        let handle = match self.runtime.create(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                let beat = heartbeat.stop().await;
                attempt.transition(ExecutionState::Finalizing);
                tracing::error!(
                    job_id = request.job_id,
                    attempt_id = %attempt.id,
                    image = %spec.image,
                    error = %e,
                    "Failed to create container"
                );
                self.release_unless_lost(&beat).await;
                return attempt.close(
                    TerminalState::RuntimeError,
                    Some(FailureCause::Runtime(e.to_string())),
                    None,
                    ContainerLogs::default(),
                );
            }
        };

        let timeout = request
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);
        let outcome = self.supervise(request.job_id, &handle, timeout, &execution).await;

        let beat = heartbeat.stop().await;
        attempt.transition(ExecutionState::Finalizing);

        if matches!(
            outcome,
            RunOutcome::DeadlineExceeded | RunOutcome::Interrupted | RunOutcome::WaitFailed(_)
        ) {
            if let Err(e) = self.runtime.kill(&handle).await {
                tracing::warn!(container_id = %handle, error = %e, "Failed to kill container");
            }
        }

        let logs = if outcome.started() {
            self.drain_logs(&handle, &execution).await
        } else {
            ContainerLogs::default()
        };

        if let Err(e) = self.runtime.remove(&handle).await {
            tracing::warn!(
                job_id = request.job_id,
                attempt_id = %attempt.id,
                container_id = %handle,
                error = %e,
                "Container cleanup failed"
            );
        }
        self.release_unless_lost(&beat).await;

        let (terminal, cause, exit_code) = match outcome {
            RunOutcome::Exited(status) if status.success() => {
                (TerminalState::Succeeded, None, Some(status.code))
            }
            RunOutcome::Exited(status) => (
                TerminalState::Failed,
                Some(FailureCause::NonZeroExit(status.code)),
                Some(status.code),
            ),
            RunOutcome::DeadlineExceeded => (
                TerminalState::TimedOut,
                Some(FailureCause::DeadlineExceeded),
                None,
            ),
            RunOutcome::Interrupted if beat.lost.is_some() => {
                (TerminalState::Failed, Some(FailureCause::LockLost), None)
            }
            RunOutcome::Interrupted => (TerminalState::Failed, Some(FailureCause::Cancelled), None),
            RunOutcome::StartFailed(e) | RunOutcome::WaitFailed(e) => (
                TerminalState::RuntimeError,
                Some(FailureCause::Runtime(e.to_string())),
                None,
            ),
        };

        let report = attempt.close(terminal, cause, exit_code, logs);
        match terminal {
            TerminalState::Succeeded => tracing::info!(
                job_id = report.job_id,
                attempt_id = %report.attempt_id,
                "Job succeeded"
            ),
            _ => tracing::warn!(
                job_id = report.job_id,
                attempt_id = %report.attempt_id,
                state = %terminal,
                cause = ?report.cause,
                "Job did not succeed"
            ),
        }
        report
    }

    /// Start the container and wait for whichever comes first: exit, deadline
    /// or cancellation of the execution token.
    async fn supervise(
        &self,
        job_id: u64,
        handle: &ContainerHandle,
        timeout: Duration,
        execution: &CancellationToken,
    ) -> RunOutcome {
        if execution.is_cancelled() {
            return RunOutcome::Interrupted;
        }
        if let Err(e) = self.runtime.start(handle).await {
            tracing::error!(job_id, container_id = %handle, error = %e, "Failed to start container");
            return RunOutcome::StartFailed(e);
        }
        tracing::info!(job_id, container_id = %handle, timeout_secs = timeout.as_secs(), "Container started");

        let deadline = Instant::now() + timeout;
        tokio::select! {
            biased;
            _ = execution.cancelled() => RunOutcome::Interrupted,
            _ = tokio::time::sleep_until(deadline) => {
                tracing::warn!(job_id, container_id = %handle, "Job deadline exceeded");
                RunOutcome::DeadlineExceeded
            }
            result = self.runtime.wait(handle) => match result {
                Ok(status) => RunOutcome::Exited(status),
                Err(e) => RunOutcome::WaitFailed(e),
            },
        }
    }

    async fn drain_logs(&self, handle: &ContainerHandle, execution: &CancellationToken) -> ContainerLogs {
        if execution.is_cancelled() {
            return ContainerLogs::default();
        }
        tokio::select! {
            biased;
            _ = execution.cancelled() => ContainerLogs::default(),
            result = self.runtime.drain_logs(handle) => result.unwrap_or_else(|e| {
                tracing::warn!(container_id = %handle, error = %e, "Failed to collect container logs");
                ContainerLogs::default()
            }),
        }
    }

    async fn release_unless_lost(&self, beat: &HeartbeatOutcome) {
        if beat.lost.is_some() {
            tracing::debug!(key = %beat.lease.key, "Skipping release of lost lease");
            return;
        }
        self.lease.release(&beat.lease).await;
    }
}
