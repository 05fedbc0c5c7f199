//! The queue service contract and its in-memory backend.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use super::{QueueEndpoint, QueueMessage, RedrivePolicy};
use crate::error::{DocflowError, Result};

/// Parameters of one receive call.
#[derive(Debug, Clone)]
pub struct ReceiveRequest {
    pub max_messages: usize,
    /// How long to wait for a message when the queue is empty.
    pub wait_time: Duration,
    /// How long received messages stay hidden from other receivers.
    pub visibility_timeout: Duration,
}

/// External durable queue. Every call may fail with a transport error.
#[async_trait]
pub trait QueueService: Send + Sync {
    /// Create the queue if needed and return its endpoint. Idempotent; a
    /// redrive policy given here replaces the existing one.
    async fn create_queue(
        &self,
        name: &str,
        region: &str,
        redrive: Option<RedrivePolicy>,
    ) -> Result<QueueEndpoint>;

    /// Enqueue a message and return its id.
    async fn send(&self, endpoint: &QueueEndpoint, body: &str) -> Result<String>;

    /// Receive up to `max_messages`, waiting up to `wait_time` for the first
    /// one. An empty vec means the queue stayed empty.
    async fn receive(
        &self,
        endpoint: &QueueEndpoint,
        request: &ReceiveRequest,
    ) -> Result<Vec<QueueMessage>>;

    /// Acknowledge a delivery so the message is never redelivered.
    async fn delete_message(&self, endpoint: &QueueEndpoint, receipt_handle: &str) -> Result<()>;
}

/// Ready and in-flight message counts of one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    pub ready: usize,
    pub in_flight: usize,
}

#[derive(Debug)]
struct StoredMessage {
    id: String,
    body: String,
    receive_count: u32,
}

#[derive(Debug)]
struct InFlight {
    message: StoredMessage,
    receipt: String,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct MemoryQueue {
    ready: VecDeque<StoredMessage>,
    in_flight: Vec<InFlight>,
    redrive: Option<RedrivePolicy>,
}

impl MemoryQueue {
    /// Return messages whose visibility timeout lapsed to the head of the
    /// queue, in their original delivery order.
    fn requeue_expired(&mut self, now: Instant) {
        let (expired, live): (Vec<InFlight>, Vec<InFlight>) = self
            .in_flight
            .drain(..)
            .partition(|entry| entry.visible_at <= now);
        self.in_flight = live;
        for entry in expired.into_iter().rev() {
            self.ready.push_front(entry.message);
        }
    }

    fn next_visible_at(&self) -> Option<Instant> {
        self.in_flight.iter().map(|entry| entry.visible_at).min()
    }
}

/// Queue service held in process memory.
///
/// Keeps visibility timeouts and dead-letter redrive semantics, with timing
/// on the tokio clock so tests can pause and advance time.
#[derive(Debug, Default)]
pub struct InMemoryQueueService {
    queues: Mutex<HashMap<String, MemoryQueue>>,
    notify: Notify,
}

impl InMemoryQueueService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self, endpoint: &QueueEndpoint) -> QueueDepth {
        self.queues
            .lock()
            .get(&endpoint.url)
            .map(|queue| QueueDepth {
                ready: queue.ready.len(),
                in_flight: queue.in_flight.len(),
            })
            .unwrap_or_default()
    }

    fn take_ready(&self, url: &str, request: &ReceiveRequest, now: Instant) -> Vec<QueueMessage> {
        let mut queues = self.queues.lock();
        let Some(queue) = queues.get_mut(url) else {
            return Vec::new();
        };
        queue.requeue_expired(now);

        let mut delivered = Vec::new();
        let mut dead_letters = Vec::new();
        while delivered.len() < request.max_messages {
            let Some(mut message) = queue.ready.pop_front() else {
                break;
            };
            message.receive_count += 1;

            if let Some(policy) = &queue.redrive {
                if message.receive_count > policy.max_receive_count {
                    dead_letters.push((policy.dead_letter.url.clone(), message));
                    continue;
                }
            }

            let receipt = format!("{}:{}", message.id, message.receive_count);
            delivered.push(QueueMessage {
                message_id: message.id.clone(),
                receipt_handle: receipt.clone(),
                body: message.body.clone(),
            });
            queue.in_flight.push(InFlight {
                message,
                receipt,
                visible_at: now + request.visibility_timeout,
            });
        }

        let redriven = !dead_letters.is_empty();
        for (dead_letter_url, mut message) in dead_letters {
            tracing::debug!(message_id = %message.id, queue = %dead_letter_url, "Message moved to dead-letter queue");
            message.receive_count = 0;
            queues.entry(dead_letter_url).or_default().ready.push_back(message);
        }
        if redriven {
            self.notify.notify_waiters();
        }

        delivered
    }

    fn next_visible_at(&self, url: &str) -> Option<Instant> {
        self.queues.lock().get(url).and_then(MemoryQueue::next_visible_at)
    }
}

#[async_trait]
impl QueueService for InMemoryQueueService {
    async fn create_queue(
        &self,
        name: &str,
        region: &str,
        redrive: Option<RedrivePolicy>,
    ) -> Result<QueueEndpoint> {
        let endpoint = QueueEndpoint::new(name, region);
        let mut queues = self.queues.lock();
        let queue = queues.entry(endpoint.url.clone()).or_default();
        if redrive.is_some() {
            queue.redrive = redrive;
        }
        Ok(endpoint)
    }

    async fn send(&self, endpoint: &QueueEndpoint, body: &str) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        self.queues
            .lock()
            .entry(endpoint.url.clone())
            .or_default()
            .ready
            .push_back(StoredMessage {
                id: id.clone(),
                body: body.to_string(),
                receive_count: 0,
            });
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn receive(
        &self,
        endpoint: &QueueEndpoint,
        request: &ReceiveRequest,
    ) -> Result<Vec<QueueMessage>> {
        let deadline = Instant::now() + request.wait_time;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let messages = self.take_ready(&endpoint.url, request, Instant::now());
            if !messages.is_empty() || Instant::now() >= deadline {
                return Ok(messages);
            }

            let wake_at = self
                .next_visible_at(&endpoint.url)
                .map_or(deadline, |at| at.min(deadline));
            let _ = tokio::time::timeout_at(wake_at, notified).await;
        }
    }

    async fn delete_message(&self, endpoint: &QueueEndpoint, receipt_handle: &str) -> Result<()> {
        let mut queues = self.queues.lock();
        let queue = queues
            .get_mut(&endpoint.url)
            .ok_or_else(|| DocflowError::queue(format!("Queue does not exist: {}", endpoint.url)))?;

        let position = queue
            .in_flight
            .iter()
            .position(|entry| entry.receipt == receipt_handle)
            .ok_or_else(|| {
                DocflowError::queue(format!("Receipt handle is no longer valid: {}", receipt_handle))
            })?;
        queue.in_flight.remove(position);
        Ok(())
    }
}
