use std::time::Duration;

use crate::error::{ExecutorError, Result};
use crate::retry::{BackoffPolicy, RetryPolicy};

/// Configuration for Docker-based job execution.
///
/// All jobs run in sandboxed Docker containers for security.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Docker image used when a job does not name its own
    pub image: String,
    /// Disable network access in container
    pub network_disabled: bool,
    /// Memory limit (e.g., "256m")
    pub memory_limit: Option<String>,
    /// CPU limit (e.g., "0.5" for half a CPU)
    pub cpu_limit: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "alpine:latest".to_string(),
            network_disabled: true,
            memory_limit: Some("256m".to_string()),
            cpu_limit: Some("0.5".to_string()),
        }
    }
}

/// Lease timing.
///
/// `renew_interval` must be strictly shorter than `ttl`, otherwise the lease
/// would lapse between two renewals of a healthy execution.
#[derive(Debug, Clone, Copy)]
pub struct LeaseConfig {
    pub ttl: Duration,
    pub renew_interval: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            renew_interval: Duration::from_secs(10),
        }
    }
}

impl LeaseConfig {
    pub fn new(ttl: Duration, renew_interval: Duration) -> Self {
        Self {
            ttl,
            renew_interval,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.ttl.is_zero() {
            return Err(ExecutorError::Config("lease ttl must be positive".into()));
        }
        if self.renew_interval.is_zero() || self.renew_interval >= self.ttl {
            return Err(ExecutorError::Config(format!(
                "lease renew interval {:?} must be positive and shorter than ttl {:?}",
                self.renew_interval, self.ttl
            )));
        }
        Ok(())
    }
}

/// What to do with a message whose job lease is held by another executor.
#[derive(Debug, Clone, Copy)]
pub struct LockRequeuePolicy {
    /// Requeue at most this many times before dead-lettering. `None` is unbounded.
    pub max_requeues: Option<u32>,
    /// Pause before the message is handed back to the queue.
    pub delay: Duration,
}

impl Default for LockRequeuePolicy {
    fn default() -> Self {
        Self {
            max_requeues: None,
            delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum number of concurrently running executions
    pub workers: usize,
    /// How long in-flight executions get to clean up on shutdown
    pub grace: Duration,
    /// Deadline for jobs that do not carry their own timeout
    pub default_job_timeout: Duration,
    pub lock_requeue: LockRequeuePolicy,
    /// Backoff between receive attempts while the queue is unavailable
    pub queue_backoff: BackoffPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            grace: Duration::from_secs(30),
            default_job_timeout: Duration::from_secs(3600),
            lock_requeue: LockRequeuePolicy::default(),
            queue_backoff: BackoffPolicy {
                first: Duration::from_millis(200),
                max: Duration::from_secs(30),
                factor: 2.0,
                jitter: true,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Identifies this executor process in lease owner tokens and logs
    pub executor_id: String,
    pub sandbox: SandboxConfig,
    pub lease: LeaseConfig,
    /// Retries for container create/start
    pub runtime_retry: RetryPolicy,
    /// Retries for lease calls while the lease service is unavailable
    pub lease_retry: RetryPolicy,
    pub dispatcher: DispatcherConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            executor_id: format!("executor-{}", uuid::Uuid::new_v4().simple()),
            sandbox: SandboxConfig::default(),
            lease: LeaseConfig::default(),
            runtime_retry: RetryPolicy::default(),
            lease_retry: RetryPolicy {
                max_attempts: 3,
                backoff: BackoffPolicy {
                    first: Duration::from_millis(50),
                    max: Duration::from_secs(1),
                    factor: 2.0,
                    jitter: true,
                },
            },
            dispatcher: DispatcherConfig::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn new(executor_id: impl Into<String>) -> Self {
        Self {
            executor_id: executor_id.into(),
            ..Default::default()
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.dispatcher.workers = workers;
        self
    }

    pub fn with_lease(mut self, lease: LeaseConfig) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.sandbox.image = image.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.executor_id.is_empty() {
            return Err(ExecutorError::Config("executor id must not be empty".into()));
        }
        if self.dispatcher.workers == 0 {
            return Err(ExecutorError::Config("workers must be at least 1".into()));
        }
        if self.dispatcher.default_job_timeout.is_zero() {
            return Err(ExecutorError::Config("default job timeout must be positive".into()));
        }
        self.lease.validate()?;
        self.runtime_retry.validate("runtime_retry")?;
        self.lease_retry.validate("lease_retry")?;
        Ok(())
    }
}
