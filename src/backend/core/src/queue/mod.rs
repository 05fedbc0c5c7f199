//! Durable message queue access and the long-poll consumer.
//!
//! - **Service**: [`QueueService`] abstracts the external queue, with a Redis
//!   backend for production and an in-memory backend for tests
//! - **Endpoints**: [`EndpointCache`] memoizes resolved queue addresses
//! - **Consumer**: [`QueueConsumer`] sends, receives, acknowledges and runs the
//!   long-poll loop that hands each message to a [`MessageHandler`]
//!
//! Delivery is at-least-once: a message is deleted only after its handler
//! succeeds, anything else is redelivered once the visibility timeout lapses.

mod consumer;
mod endpoint;
mod redis_service;
mod service;

pub use consumer::QueueConsumer;
pub use endpoint::EndpointCache;
pub use redis_service::RedisQueueService;
pub use service::{InMemoryQueueService, QueueDepth, QueueService, ReceiveRequest};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;

/// Identifier of a queue known to the consumer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueueId {
    /// A queue declared under `queues.<id>` in the configuration.
    Named(String),
    /// The ingress queue drained by the long-poll loop. Created on demand
    /// together with its dead-letter queue.
    LongPoll,
}

impl QueueId {
    pub fn named(id: impl Into<String>) -> Self {
        Self::Named(id.into())
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(id) => f.write_str(id),
            Self::LongPoll => f.write_str("long-poll"),
        }
    }
}

/// Resolved address of a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEndpoint {
    pub name: String,
    pub region: String,
    pub url: String,
}

impl QueueEndpoint {
    pub fn new(name: impl Into<String>, region: impl Into<String>) -> Self {
        let name = name.into();
        let region = region.into();
        let url = format!("queue://{}/{}", region, name);
        Self { name, region, url }
    }
}

/// Dead-letter routing applied when a queue is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedrivePolicy {
    pub dead_letter: QueueEndpoint,
    /// Receives after which the next receive moves the message to the
    /// dead-letter queue instead of delivering it.
    pub max_receive_count: u32,
}

/// A received message. The receipt handle identifies this delivery and is
/// required to acknowledge it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
}

/// What the consumer does with the rest of a batch once a handler fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchFailurePolicy {
    /// Stop at the failed message and leave it and the remainder undeleted.
    #[default]
    AbortBatch,
    /// Keep handling the batch and report the first failure at the end.
    ContinueBatch,
}

/// Processes one message from the long-poll queue.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &QueueMessage) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_url_includes_region_and_name() {
        let endpoint = QueueEndpoint::new("docflow-steps", "eu-west-1");
        assert_eq!(endpoint.url, "queue://eu-west-1/docflow-steps");
    }

    #[test]
    fn test_queue_id_display() {
        assert_eq!(QueueId::named("steps").to_string(), "steps");
        assert_eq!(QueueId::LongPoll.to_string(), "long-poll");
    }
}
