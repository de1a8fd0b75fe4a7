use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::error::{ExecutorError, Result};
use crate::job::JobRunRequest;
use crate::queue::{unknown, Delivery, MessageHandle, WorkQueue};

const DEFAULT_MAX_MESSAGES: usize = 10_000;

#[derive(Debug, Clone)]
struct Message {
    id: Uuid,
    payload: Vec<u8>,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Message>,
    in_flight: HashMap<Uuid, Message>,
    dead_letters: Vec<Message>,
}

/// Process-local at-least-once queue.
///
/// Backs the standalone binary and the tests. Messages move from `ready` to
/// `in_flight` on receive, and are dropped on ack, returned to the back of
/// `ready` on nack-with-requeue, or dead-lettered otherwise.
#[derive(Debug)]
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    ready: Notify,
    closed: AtomicBool,
    max_messages: usize,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_MESSAGES)
    }

    pub fn with_capacity(max_messages: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            ready: Notify::new(),
            closed: AtomicBool::new(false),
            max_messages,
        }
    }

    /// Enqueue a raw payload. Fails when the queue is closed or at capacity.
    pub async fn publish(&self, payload: Vec<u8>) -> Result<Uuid> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ExecutorError::QueueUnavailable("queue is closed".into()));
        }
        let mut state = self.state.lock().await;
        if state.ready.len() + state.in_flight.len() >= self.max_messages {
            return Err(ExecutorError::QueueUnavailable(format!(
                "queue is at capacity ({} messages)",
                self.max_messages
            )));
        }
        let id = Uuid::new_v4();
        state.ready.push_back(Message {
            id,
            payload,
            delivery_count: 0,
        });
        drop(state);
        self.ready.notify_one();
        Ok(id)
    }

    pub async fn publish_request(&self, request: &JobRunRequest) -> Result<Uuid> {
        self.publish(request.encode()?).await
    }

    /// Make every subsequent call fail with `QueueUnavailable`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.ready.notify_waiters();
    }

    /// Number of messages waiting for delivery
    pub async fn len(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of delivered but unsettled messages
    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    /// Payloads that were nacked without requeue
    pub async fn dead_letters(&self) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .await
            .dead_letters
            .iter()
            .map(|m| m.payload.clone())
            .collect()
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(ExecutorError::QueueUnavailable("queue is closed".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl WorkQueue for InMemoryQueue {
    async fn receive(&self) -> Result<Delivery> {
        loop {
            // Register interest before checking so a publish in between is not missed.
            let notified = self.ready.notified();
            self.check_open()?;
            {
                let mut state = self.state.lock().await;
                if let Some(mut message) = state.ready.pop_front() {
                    message.delivery_count += 1;
                    let delivery = Delivery {
                        handle: MessageHandle {
                            id: message.id,
                            delivery_count: message.delivery_count,
                        },
                        payload: message.payload.clone(),
                    };
                    state.in_flight.insert(message.id, message);
                    if !state.ready.is_empty() {
                        self.ready.notify_one();
                    }
                    return Ok(delivery);
                }
            }
            notified.await;
        }
    }

    async fn ack(&self, handle: &MessageHandle) -> Result<()> {
        self.check_open()?;
        let mut state = self.state.lock().await;
        state
            .in_flight
            .remove(&handle.id)
            .map(|_| ())
            .ok_or_else(|| unknown(handle))
    }

    async fn nack(&self, handle: &MessageHandle, requeue: bool) -> Result<()> {
        self.check_open()?;
        let mut state = self.state.lock().await;
        let message = state
            .in_flight
            .remove(&handle.id)
            .ok_or_else(|| unknown(handle))?;
        if requeue {
            state.ready.push_back(message);
            drop(state);
            self.ready.notify_one();
        } else {
            state.dead_letters.push(message);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn receive_moves_message_in_flight() {
        let queue = InMemoryQueue::new();
        queue.publish(b"one".to_vec()).await.unwrap();

        let delivery = queue.receive().await.unwrap();
        assert_eq!(delivery.payload, b"one");
        assert_eq!(delivery.handle.delivery_count, 1);
        assert!(queue.is_empty().await);
        assert_eq!(queue.in_flight().await, 1);

        queue.ack(&delivery.handle).await.unwrap();
        assert_eq!(queue.in_flight().await, 0);
    }

    #[tokio::test]
    async fn requeue_increments_delivery_count() {
        let queue = InMemoryQueue::new();
        queue.publish(b"job".to_vec()).await.unwrap();

        let first = queue.receive().await.unwrap();
        queue.nack(&first.handle, true).await.unwrap();
        let second = queue.receive().await.unwrap();

        assert_eq!(second.handle.id, first.handle.id);
        assert_eq!(second.handle.delivery_count, 2);
    }

    #[tokio::test]
    async fn nack_without_requeue_dead_letters() {
        let queue = InMemoryQueue::new();
        queue.publish(b"poison".to_vec()).await.unwrap();

        let delivery = queue.receive().await.unwrap();
        queue.nack(&delivery.handle, false).await.unwrap();

        assert!(queue.is_empty().await);
        assert_eq!(queue.dead_letters().await, vec![b"poison".to_vec()]);
    }

    #[tokio::test]
    async fn settling_twice_is_an_error() {
        let queue = InMemoryQueue::new();
        queue.publish(b"x".to_vec()).await.unwrap();
        let delivery = queue.receive().await.unwrap();
        queue.ack(&delivery.handle).await.unwrap();
        assert!(matches!(
            queue.ack(&delivery.handle).await,
            Err(ExecutorError::UnknownMessage(_))
        ));
    }

    #[tokio::test]
    async fn publish_rejected_at_capacity() {
        let queue = InMemoryQueue::with_capacity(1);
        queue.publish(b"a".to_vec()).await.unwrap();
        assert!(matches!(
            queue.publish(b"b".to_vec()).await,
            Err(ExecutorError::QueueUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn receive_waits_for_publish() {
        let queue = Arc::new(InMemoryQueue::new());
        let receiver = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.receive().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.publish(b"late".to_vec()).await.unwrap();

        let delivery = tokio::time::timeout(Duration::from_secs(1), receiver)
            .await
            .expect("receive should wake up")
            .unwrap()
            .unwrap();
        assert_eq!(delivery.payload, b"late");
    }

    #[tokio::test]
    async fn closed_queue_is_unavailable() {
        let queue = InMemoryQueue::new();
        queue.close();
        assert!(matches!(
            queue.receive().await,
            Err(ExecutorError::QueueUnavailable(_))
        ));
        assert!(queue.publish(b"x".to_vec()).await.is_err());
    }
}
