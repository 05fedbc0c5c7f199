use futures::FutureExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    BatchFailurePolicy, EndpointCache, MessageHandler, QueueEndpoint, QueueId, QueueMessage,
    QueueService, ReceiveRequest, RedrivePolicy,
};
use crate::config::{Config, LongPollConfig, QueueConfig};
use crate::error::{DocflowError, ErrorCode, Result};
use crate::jobs::scheduler::{spawn_loop, FailurePolicy, Started};
use crate::telemetry::metrics::QueueMetrics;

/// Client of the external queue service for one worker process.
///
/// Endpoints are resolved once and kept in the shared [`EndpointCache`].
pub struct QueueConsumer {
    service: Arc<dyn QueueService>,
    endpoints: Arc<EndpointCache>,
    queues: HashMap<String, QueueConfig>,
    long_poll: LongPollConfig,
    token: CancellationToken,
}

impl QueueConsumer {
    pub fn new(
        service: Arc<dyn QueueService>,
        endpoints: Arc<EndpointCache>,
        queues: HashMap<String, QueueConfig>,
        long_poll: LongPollConfig,
    ) -> Self {
        Self {
            service,
            endpoints,
            queues,
            long_poll,
            token: CancellationToken::new(),
        }
    }

    pub fn from_config(
        service: Arc<dyn QueueService>,
        endpoints: Arc<EndpointCache>,
        config: &Config,
    ) -> Self {
        Self::new(
            service,
            endpoints,
            config.queues.clone(),
            config.long_poll.clone(),
        )
    }

    pub fn endpoints(&self) -> &EndpointCache {
        &self.endpoints
    }

    /// Address of `queue_id`, resolved on first use.
    ///
    /// Named queues come from configuration. The long-poll queue is created
    /// on demand, after its dead-letter queue so the redrive target exists.
    pub async fn resolve_endpoint(&self, queue_id: &QueueId) -> Result<QueueEndpoint> {
        if let Some(endpoint) = self.endpoints.get(queue_id) {
            return Ok(endpoint);
        }

        let endpoint = match queue_id {
            QueueId::Named(id) => self.configured_endpoint(id)?,
            QueueId::LongPoll => self.create_long_poll_queue().await?,
        };

        debug!(queue_id = %queue_id, url = %endpoint.url, "Queue endpoint resolved");
        self.endpoints.insert(queue_id.clone(), endpoint.clone());
        Ok(endpoint)
    }

    fn configured_endpoint(&self, id: &str) -> Result<QueueEndpoint> {
        let queue = self
            .queues
            .get(id)
            .ok_or_else(|| DocflowError::configuration(format!("Queue is not configured: {}", id)))?;
        let name = queue.name.as_deref().ok_or_else(|| {
            DocflowError::configuration(format!("Queue {} has no name configured", id))
        })?;
        let region = queue.region.as_deref().ok_or_else(|| {
            DocflowError::configuration(format!("Queue {} has no region configured", id))
        })?;
        Ok(QueueEndpoint::new(name, region))
    }

    async fn create_long_poll_queue(&self) -> Result<QueueEndpoint> {
        let region = &self.long_poll.region;
        let dead_letter = self
            .service
            .create_queue(&self.long_poll.dead_letter_queue_name(), region, None)
            .await?;

        let redrive = RedrivePolicy {
            dead_letter,
            max_receive_count: self.long_poll.max_receive_count,
        };
        let endpoint = self
            .service
            .create_queue(&self.long_poll.queue_name(), region, Some(redrive))
            .await?;

        info!(queue = %endpoint.name, region = %endpoint.region, "Long-poll queue ready");
        Ok(endpoint)
    }

    /// Enqueue `payload` and return the message id.
    pub async fn send(&self, payload: &str, queue_id: &QueueId) -> Result<String> {
        let endpoint = self
            .resolve_endpoint(queue_id)
            .await
            .map_err(|e| as_queue_error(e, "resolve queue for send"))?;
        let message_id = self
            .service
            .send(&endpoint, payload)
            .await
            .map_err(|e| as_queue_error(e, "send message"))?;

        debug!(queue = %endpoint.name, message_id = %message_id, "Message sent");
        Ok(message_id)
    }

    /// Acknowledge a delivery.
    pub async fn delete_message(&self, receipt_handle: &str, queue_id: &QueueId) -> Result<()> {
        let endpoint = self
            .resolve_endpoint(queue_id)
            .await
            .map_err(|e| as_queue_error(e, "resolve queue for delete"))?;
        self.service
            .delete_message(&endpoint, receipt_handle)
            .await
            .map_err(|e| as_queue_error(e, "delete message"))
    }

    /// One long-poll receive. Empty when nothing arrived within the wait time.
    pub async fn receive(&self, queue_id: &QueueId) -> Result<Vec<QueueMessage>> {
        let endpoint = self
            .resolve_endpoint(queue_id)
            .await
            .map_err(|e| as_queue_error(e, "resolve queue for receive"))?;
        self.receive_from(&endpoint).await
    }

    fn receive_request(&self) -> ReceiveRequest {
        ReceiveRequest {
            max_messages: self.long_poll.batch_size,
            wait_time: self.long_poll.wait_time(),
            visibility_timeout: self.long_poll.visibility_timeout(),
        }
    }

    async fn receive_from(&self, endpoint: &QueueEndpoint) -> Result<Vec<QueueMessage>> {
        self.service
            .receive(endpoint, &self.receive_request())
            .await
            .map_err(|e| as_queue_error(e, "receive messages"))
    }

    /// Receive, retrying after `retry_delay` while `retry_on_poll_failure`
    /// is set and fewer than `max_failed_poll_retries` consecutive receives
    /// have failed.
    async fn poll(
        &self,
        endpoint: &QueueEndpoint,
        retry_on_poll_failure: bool,
    ) -> Result<Vec<QueueMessage>> {
        let mut failures = 0u32;
        loop {
            match self.receive_from(endpoint).await {
                Ok(messages) => return Ok(messages),
                Err(e) => {
                    QueueMetrics::poll_failed(&endpoint.name);
                    failures += 1;
                    if !retry_on_poll_failure || failures >= self.long_poll.max_failed_poll_retries {
                        warn!(queue = %endpoint.name, failures, error = %e, "Giving up on queue poll");
                        return Err(e);
                    }
                    warn!(
                        queue = %endpoint.name,
                        failures,
                        retry_delay_ms = self.long_poll.retry_delay_ms,
                        error = %e,
                        "Queue poll failed, retrying"
                    );
                    tokio::time::sleep(self.long_poll.retry_delay()).await;
                }
            }
        }
    }

    /// One consume cycle over the long-poll queue. Returns the number of
    /// messages handled and deleted.
    pub async fn consume_once(
        &self,
        handler: &dyn MessageHandler,
        retry_on_poll_failure: bool,
    ) -> Result<usize> {
        let endpoint = self
            .resolve_endpoint(&QueueId::LongPoll)
            .await
            .map_err(|e| as_queue_error(e, "resolve long-poll queue"))?;
        let messages = self.poll(&endpoint, retry_on_poll_failure).await?;
        if messages.is_empty() {
            return Ok(0);
        }
        QueueMetrics::received(&endpoint.name, messages.len());

        let mut handled = 0;
        let mut first_failure = None;
        for message in &messages {
            if let Err(e) = handler.handle(message).await {
                QueueMetrics::handler_failed(&endpoint.name);
                warn!(
                    queue = %endpoint.name,
                    message_id = %message.message_id,
                    error = %e,
                    "Message handler failed, leaving message for redelivery"
                );
                match self.long_poll.batch_failure_policy {
                    BatchFailurePolicy::AbortBatch => return Err(e),
                    BatchFailurePolicy::ContinueBatch => {
                        first_failure.get_or_insert(e);
                        continue;
                    }
                }
            }

            if let Err(e) = self
                .service
                .delete_message(&endpoint, &message.receipt_handle)
                .await
            {
                let e = as_queue_error(e, "delete message");
                warn!(
                    queue = %endpoint.name,
                    message_id = %message.message_id,
                    error = %e,
                    "Failed to delete handled message"
                );
                match self.long_poll.batch_failure_policy {
                    BatchFailurePolicy::AbortBatch => return Err(e),
                    BatchFailurePolicy::ContinueBatch => {
                        first_failure.get_or_insert(e);
                        continue;
                    }
                }
            }
            QueueMetrics::deleted(&endpoint.name);
            handled += 1;
        }

        match first_failure {
            Some(e) => Err(e),
            None => {
                debug!(queue = %endpoint.name, handled, "Batch handled");
                Ok(handled)
            }
        }
    }

    /// Run one consume cycle now and, with `run_forever` and a successful
    /// first cycle, keep consuming in the background until a cycle fails or
    /// the handle is cancelled.
    pub async fn consume_forever(
        self: &Arc<Self>,
        handler: Arc<dyn MessageHandler>,
        run_forever: bool,
        retry_on_poll_failure: bool,
    ) -> Started<usize> {
        let first_cycle = self.consume_once(handler.as_ref(), retry_on_poll_failure).await;
        if first_cycle.is_err() || !run_forever {
            return Started::once(first_cycle);
        }

        let consumer = Arc::clone(self);
        let handle = spawn_loop(
            "queue_consumer",
            FailurePolicy::StopOnFailure,
            Duration::ZERO,
            self.token.clone(),
            move || {
                let consumer = Arc::clone(&consumer);
                let handler = Arc::clone(&handler);
                async move {
                    consumer
                        .consume_once(handler.as_ref(), retry_on_poll_failure)
                        .await
                        .map(|_| ())
                }
                .boxed()
            },
        );

        Started {
            first_cycle,
            handle: Some(handle),
        }
    }
}

/// Report transport trouble as a queue error. Configuration errors and
/// existing queue errors pass through unchanged.
fn as_queue_error(error: DocflowError, action: &str) -> DocflowError {
    match error.code() {
        ErrorCode::QueueError | ErrorCode::ConfigurationError => error,
        _ => DocflowError::queue(format!("Failed to {}", action)).with_source(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryQueueService;

    fn consumer(queues: HashMap<String, QueueConfig>) -> QueueConsumer {
        QueueConsumer::new(
            Arc::new(InMemoryQueueService::new()),
            Arc::new(EndpointCache::new()),
            queues,
            LongPollConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_named_queue_requires_name_and_region() {
        let mut queues = HashMap::new();
        queues.insert(
            "partial".to_string(),
            QueueConfig {
                name: Some("only-name".to_string()),
                region: None,
            },
        );
        let consumer = consumer(queues);

        for id in ["partial", "missing"] {
            let err = consumer.resolve_endpoint(&QueueId::named(id)).await.unwrap_err();
            assert_eq!(err.code(), ErrorCode::ConfigurationError);
        }
        assert!(consumer.endpoints().is_empty());
    }

    #[tokio::test]
    async fn test_send_keeps_configuration_error() {
        let consumer = consumer(HashMap::new());
        let err = consumer.send("{}", &QueueId::named("nope")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConfigurationError);
    }

    #[test]
    fn test_transport_errors_become_queue_errors() {
        let err = as_queue_error(
            DocflowError::new(ErrorCode::QueueConnectionFailed, "refused"),
            "send message",
        );
        assert_eq!(err.code(), ErrorCode::QueueError);
        assert!(std::error::Error::source(&err).is_some());
    }
}
