//! Work queue consumption.
//!
//! [`WorkQueue`] is the transport boundary: at-least-once delivery of raw
//! payloads with explicit ack / nack-with-requeue. [`QueueConsumer`] sits on
//! top of it, decodes payloads into [`JobRunRequest`]s and absorbs transient
//! transport failures with backoff so the dispatcher only ever sees runnable
//! requests.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ExecutorError, Result};
use crate::job::JobRunRequest;
use crate::retry::BackoffPolicy;

pub use memory::InMemoryQueue;

/// Identifies one delivery of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHandle {
    pub id: Uuid,
    /// 1 on first delivery, incremented on every requeue.
    pub delivery_count: u32,
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub handle: MessageHandle,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Wait for the next message. Fails with `QueueUnavailable` on transport errors.
    async fn receive(&self) -> Result<Delivery>;

    /// Mark a message processed; it will not be redelivered.
    async fn ack(&self, handle: &MessageHandle) -> Result<()>;

    /// Mark a message failed. With `requeue` it becomes eligible for redelivery.
    async fn nack(&self, handle: &MessageHandle, requeue: bool) -> Result<()>;
}

/// Decoding consumer over a [`WorkQueue`].
#[derive(Clone)]
pub struct QueueConsumer {
    queue: Arc<dyn WorkQueue>,
    backoff: BackoffPolicy,
}

impl QueueConsumer {
    pub fn new(queue: Arc<dyn WorkQueue>, backoff: BackoffPolicy) -> Self {
        Self { queue, backoff }
    }

    /// Next runnable request, or `None` once `stop` is cancelled.
    ///
    /// Undecodable payloads are dead-lettered and skipped.
    pub async fn receive(&self, stop: &CancellationToken) -> Option<(JobRunRequest, MessageHandle)> {
        let mut failures = 0u32;
        loop {
            let delivery = tokio::select! {
                _ = stop.cancelled() => return None,
                result = self.queue.receive() => result,
            };

            match delivery {
                Ok(delivery) => {
                    failures = 0;
                    match JobRunRequest::decode(&delivery.payload) {
                        Ok(request) => return Some((request, delivery.handle)),
                        Err(e) => {
                            tracing::error!(
                                message_id = %delivery.handle.id,
                                error = %e,
                                "Dropping undecodable job message"
                            );
                            self.nack(&delivery.handle, false).await;
                        }
                    }
                }
                Err(e) if e.is_transient() => {
                    let delay = self.backoff.next(failures);
                    failures = failures.saturating_add(1);
                    tracing::warn!(
                        error = %e,
                        consecutive_failures = failures,
                        delay_ms = delay.as_millis() as u64,
                        "Work queue unavailable, backing off"
                    );
                    tokio::select! {
                        _ = stop.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Work queue receive failed, stopping consumer");
                    return None;
                }
            }
        }
    }

    pub async fn ack(&self, handle: &MessageHandle) {
        if let Err(e) = self.queue.ack(handle).await {
            tracing::warn!(message_id = %handle.id, error = %e, "Failed to ack message");
        }
    }

    pub async fn nack(&self, handle: &MessageHandle, requeue: bool) {
        if let Err(e) = self.queue.nack(handle, requeue).await {
            tracing::warn!(
                message_id = %handle.id,
                requeue,
                error = %e,
                "Failed to nack message"
            );
        }
    }
}

impl std::fmt::Debug for QueueConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueConsumer")
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

pub(crate) fn unknown(handle: &MessageHandle) -> ExecutorError {
    ExecutorError::UnknownMessage(handle.id)
}
