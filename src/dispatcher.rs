//! Bounded worker pool over the work queue.
//!
//! The dispatcher takes a worker slot *before* it receives a message, so a
//! full pool stops pulling from the queue (backpressure). Each message gets
//! its own task that runs the supervisor, publishes the report, and settles
//! the message according to [`settle`].
//!
//! On shutdown it stops receiving, cancels every in-flight execution (the
//! supervisor then kills and removes containers and releases leases), and
//! waits up to the grace period before aborting what is left.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::{DispatcherConfig, ExecutorConfig, LockRequeuePolicy};
use crate::error::{ExecutorError, Result};
use crate::execution::{ExecutionReport, FailureCause, TerminalState};
use crate::lease::LeaseService;
use crate::queue::{MessageHandle, QueueConsumer, WorkQueue};
use crate::runtime::ContainerRuntime;
use crate::sink::ResultSink;
use crate::supervisor::ExecutionSupervisor;

/// What to tell the queue about a processed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Nack { requeue: bool },
}

/// Map an attempt's outcome to an ack or nack.
///
/// - success is acked;
/// - lock contention is requeued, until `policy.max_requeues` is exceeded;
/// - attempts interrupted by executor shutdown are requeued;
/// - every other failure was reported and is not redelivered.
pub fn settle(report: &ExecutionReport, handle: &MessageHandle, policy: &LockRequeuePolicy) -> Settlement {
    if report.cause == Some(FailureCause::Cancelled) {
        return Settlement::Nack { requeue: true };
    }
    match report.terminal_state {
        TerminalState::Succeeded => Settlement::Ack,
        TerminalState::LockNotAcquired => match policy.max_requeues {
            Some(max) if handle.delivery_count > max => Settlement::Nack { requeue: false },
            _ => Settlement::Nack { requeue: true },
        },
        TerminalState::Failed | TerminalState::TimedOut | TerminalState::RuntimeError => {
            Settlement::Nack { requeue: false }
        }
    }
}

/// Everything a worker task needs, cheap to clone.
#[derive(Clone)]
struct Worker {
    consumer: QueueConsumer,
    supervisor: Arc<ExecutionSupervisor>,
    sink: Arc<dyn ResultSink>,
    lock_requeue: LockRequeuePolicy,
}

impl Worker {
    async fn process(
        self,
        request: crate::job::JobRunRequest,
        handle: MessageHandle,
        execution: CancellationToken,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) {
        let report = self.supervisor.execute(&request, execution.clone()).await;
        drop(permit);

        if report.is_reportable() {
            if let Err(e) = self.sink.publish(&report).await {
                tracing::error!(
                    job_id = report.job_id,
                    attempt_id = %report.attempt_id,
                    error = %e,
                    "Failed to publish execution report"
                );
            }
        }

        match settle(&report, &handle, &self.lock_requeue) {
            Settlement::Ack => self.consumer.ack(&handle).await,
            Settlement::Nack { requeue: true }
                if report.terminal_state == TerminalState::LockNotAcquired
                    && !execution.is_cancelled() =>
            {
                tokio::select! {
                    _ = execution.cancelled() => {}
                    _ = tokio::time::sleep(self.lock_requeue.delay) => {}
                }
                self.consumer.nack(&handle, true).await;
            }
            Settlement::Nack { requeue } => {
                if !requeue && report.terminal_state == TerminalState::LockNotAcquired {
                    tracing::warn!(
                        job_id = report.job_id,
                        message_id = %handle.id,
                        deliveries = handle.delivery_count,
                        "Lock requeue budget exhausted, dropping message"
                    );
                }
                self.consumer.nack(&handle, requeue).await;
            }
        }
    }
}

pub struct Dispatcher {
    worker: Worker,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        consumer: QueueConsumer,
        supervisor: Arc<ExecutionSupervisor>,
        sink: Arc<dyn ResultSink>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            worker: Worker {
                consumer,
                supervisor,
                sink,
                lock_requeue: config.lock_requeue,
            },
            config,
        }
    }

    /// Wire a dispatcher from configuration and the external collaborators.
    pub fn from_config(
        config: &ExecutorConfig,
        queue: Arc<dyn WorkQueue>,
        lease_service: Arc<dyn LeaseService>,
        runtime: Arc<dyn ContainerRuntime>,
        sink: Arc<dyn ResultSink>,
    ) -> Result<Self> {
        config.validate()?;
        let consumer = QueueConsumer::new(queue, config.dispatcher.queue_backoff);
        let supervisor = Arc::new(ExecutionSupervisor::new(config, lease_service, runtime));
        Ok(Self::new(consumer, supervisor, sink, config.dispatcher.clone()))
    }

    /// Consume and execute jobs until `shutdown` is cancelled.
    ///
    /// Returns `GraceExceeded` if executions were still running when the grace
    /// period ran out; they are aborted.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let slots = Arc::new(Semaphore::new(self.config.workers));
        let executions = CancellationToken::new();
        let mut set = JoinSet::new();

        tracing::info!(
            executor_id = self.worker.supervisor.executor_id(),
            workers = self.config.workers,
            "Dispatcher started"
        );

        loop {
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let Some((request, handle)) = self.worker.consumer.receive(&shutdown).await else {
                break;
            };
            tracing::debug!(
                job_id = request.job_id,
                message_id = %handle.id,
                deliveries = handle.delivery_count,
                "Dispatching job"
            );

            set.spawn(self.worker.clone().process(
                request,
                handle,
                executions.child_token(),
                permit,
            ));

            while let Some(joined) = set.try_join_next() {
                log_join(joined);
            }
        }

        self.drain(set, executions).await
    }

    async fn drain(&self, mut set: JoinSet<()>, executions: CancellationToken) -> Result<()> {
        let grace = self.config.grace;
        tracing::info!(
            in_flight = set.len(),
            grace_ms = grace.as_millis() as u64,
            "Dispatcher stopping, cancelling in-flight executions"
        );
        executions.cancel();

        let all_done = async {
            while let Some(joined) = set.join_next().await {
                log_join(joined);
            }
        };
        match tokio::time::timeout(grace, all_done).await {
            Ok(()) => {
                tracing::info!("All executions stopped within grace period");
                Ok(())
            }
            Err(_) => {
                tracing::error!(stuck = set.len(), "Grace period exceeded, aborting executions");
                set.abort_all();
                Err(ExecutorError::GraceExceeded(grace))
            }
        }
    }
}

fn log_join(joined: std::result::Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            tracing::error!(error = %e, "Execution task panicked");
        }
    }
}
