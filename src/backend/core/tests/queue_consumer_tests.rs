//! Tests for the queue consumer and its long-poll loop.
//!
//! Tests cover:
//! - Endpoint resolution, caching and reset
//! - Send / receive / delete through the consumer
//! - Batch handling and acknowledgement order
//! - Poll retry policy
//! - Background consumption and cancellation
//! - Dead-letter redrive of poison messages

use async_trait::async_trait;
use docflow_core::config::{LongPollConfig, QueueConfig};
use docflow_core::error::{DocflowError, ErrorCode, Result};
use docflow_core::queue::{
    BatchFailurePolicy, EndpointCache, InMemoryQueueService, MessageHandler, QueueConsumer,
    QueueEndpoint, QueueId, QueueMessage, QueueService, ReceiveRequest, RedrivePolicy,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Test Doubles
// ============================================================================

/// In-memory service that records calls and can fail receives or deletes on demand.
#[derive(Default)]
struct RecordingService {
    inner: InMemoryQueueService,
    created: Mutex<Vec<String>>,
    deleted: Mutex<Vec<String>>,
    receive_calls: AtomicU32,
    failing_receives: AtomicU32,
    failing_deletes: AtomicU32,
}

impl RecordingService {
    fn failing(receives: u32) -> Self {
        let service = Self::default();
        service.failing_receives.store(receives, Ordering::SeqCst);
        service
    }

    fn failing_deletes(deletes: u32) -> Self {
        let service = Self::default();
        service.failing_deletes.store(deletes, Ordering::SeqCst);
        service
    }

    fn deleted_bodies(&self, sent: &HashMap<String, String>) -> Vec<String> {
        self.deleted
            .lock()
            .iter()
            .filter_map(|receipt| receipt.split_once(':'))
            .filter_map(|(id, _)| sent.get(id).cloned())
            .collect()
    }
}

#[async_trait]
impl QueueService for RecordingService {
    async fn create_queue(
        &self,
        name: &str,
        region: &str,
        redrive: Option<RedrivePolicy>,
    ) -> Result<QueueEndpoint> {
        self.created.lock().push(name.to_string());
        self.inner.create_queue(name, region, redrive).await
    }

    async fn send(&self, endpoint: &QueueEndpoint, body: &str) -> Result<String> {
        self.inner.send(endpoint, body).await
    }

    async fn receive(
        &self,
        endpoint: &QueueEndpoint,
        request: &ReceiveRequest,
    ) -> Result<Vec<QueueMessage>> {
        self.receive_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failing_receives.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_receives.store(remaining - 1, Ordering::SeqCst);
            return Err(DocflowError::new(
                ErrorCode::QueueConnectionFailed,
                "connection reset",
            ));
        }
        self.inner.receive(endpoint, request).await
    }

    async fn delete_message(&self, endpoint: &QueueEndpoint, receipt_handle: &str) -> Result<()> {
        let remaining = self.failing_deletes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_deletes.store(remaining - 1, Ordering::SeqCst);
            return Err(DocflowError::new(
                ErrorCode::QueueConnectionFailed,
                "connection reset",
            ));
        }
        self.inner.delete_message(endpoint, receipt_handle).await?;
        self.deleted.lock().push(receipt_handle.to_string());
        Ok(())
    }
}

/// Handler that records bodies and fails those listed in `fail_on`.
#[derive(Default)]
struct ScriptedHandler {
    seen: Mutex<Vec<String>>,
    fail_on: Vec<String>,
}

impl ScriptedHandler {
    fn failing_on(bodies: &[&str]) -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
            fail_on: bodies.iter().map(|b| b.to_string()).collect(),
        }
    }

    fn seen(&self) -> Vec<String> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl MessageHandler for ScriptedHandler {
    async fn handle(&self, message: &QueueMessage) -> Result<()> {
        self.seen.lock().push(message.body.clone());
        if self.fail_on.contains(&message.body) {
            return Err(DocflowError::handler_failed(format!("rejected {}", message.body)));
        }
        Ok(())
    }
}

fn long_poll_config() -> LongPollConfig {
    LongPollConfig {
        wait_time_secs: 1,
        visibility_timeout_secs: 30,
        retry_delay_ms: 500,
        max_failed_poll_retries: 3,
        max_receive_count: 2,
        ..Default::default()
    }
}

fn consumer_with(service: Arc<RecordingService>, long_poll: LongPollConfig) -> Arc<QueueConsumer> {
    let mut queues = HashMap::new();
    queues.insert(
        "steps".to_string(),
        QueueConfig {
            name: Some("docflow-steps".to_string()),
            region: Some("eu-west-1".to_string()),
        },
    );
    Arc::new(QueueConsumer::new(
        service,
        Arc::new(EndpointCache::new()),
        queues,
        long_poll,
    ))
}

async fn enqueue(consumer: &QueueConsumer, bodies: &[&str]) -> HashMap<String, String> {
    let mut sent = HashMap::new();
    for body in bodies {
        let id = consumer.send(body, &QueueId::LongPoll).await.unwrap();
        sent.insert(id, body.to_string());
    }
    sent
}

// ============================================================================
// Endpoint Resolution Tests
// ============================================================================

#[tokio::test]
async fn test_long_poll_queue_created_after_dead_letter_queue() {
    let service = Arc::new(RecordingService::default());
    let consumer = consumer_with(service.clone(), long_poll_config());

    let endpoint = consumer.resolve_endpoint(&QueueId::LongPoll).await.unwrap();
    assert_eq!(endpoint.name, "docflow-long-poll");
    assert_eq!(
        *service.created.lock(),
        vec!["docflow-long-poll-dlq", "docflow-long-poll"]
    );

    consumer.resolve_endpoint(&QueueId::LongPoll).await.unwrap();
    assert_eq!(service.created.lock().len(), 2);
}

#[tokio::test]
async fn test_endpoint_cache_reset_forces_resolution() {
    let service = Arc::new(RecordingService::default());
    let consumer = consumer_with(service.clone(), long_poll_config());

    consumer.resolve_endpoint(&QueueId::LongPoll).await.unwrap();
    consumer.endpoints().reset();
    consumer.resolve_endpoint(&QueueId::LongPoll).await.unwrap();

    assert_eq!(service.created.lock().len(), 4);
}

#[tokio::test]
async fn test_named_queue_from_configuration() {
    let service = Arc::new(RecordingService::default());
    let consumer = consumer_with(service.clone(), long_poll_config());

    let endpoint = consumer.resolve_endpoint(&QueueId::named("steps")).await.unwrap();
    assert_eq!(endpoint, QueueEndpoint::new("docflow-steps", "eu-west-1"));
    assert!(service.created.lock().is_empty());

    let err = consumer
        .resolve_endpoint(&QueueId::named("unknown"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConfigurationError);
}

// ============================================================================
// Send / Receive / Delete Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_send_receive_delete_on_named_queue() {
    let service = Arc::new(RecordingService::default());
    let consumer = consumer_with(service.clone(), long_poll_config());
    let steps = QueueId::named("steps");

    consumer.send(r#"{"step":1}"#, &steps).await.unwrap();
    let messages = consumer.receive(&steps).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].body, r#"{"step":1}"#);

    consumer
        .delete_message(&messages[0].receipt_handle, &steps)
        .await
        .unwrap();
    assert!(consumer.receive(&steps).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_receive_transport_failure_is_queue_error() {
    let service = Arc::new(RecordingService::failing(1));
    let consumer = consumer_with(service, long_poll_config());

    let err = consumer.receive(&QueueId::LongPoll).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::QueueError);
}

// ============================================================================
// Batch Handling Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_successful_batch_deleted_in_receipt_order() {
    let service = Arc::new(RecordingService::default());
    let consumer = consumer_with(service.clone(), long_poll_config());
    let sent = enqueue(&consumer, &["first", "second"]).await;
    let handler = Arc::new(ScriptedHandler::default());

    let started = consumer.consume_forever(handler.clone(), false, false).await;

    assert_eq!(started.first_cycle.unwrap(), 2);
    assert!(started.handle.is_none());
    assert_eq!(handler.seen(), vec!["first", "second"]);
    assert_eq!(service.deleted_bodies(&sent), vec!["first", "second"]);
}

#[tokio::test(start_paused = true)]
async fn test_failed_message_is_not_deleted() {
    let service = Arc::new(RecordingService::default());
    let consumer = consumer_with(service.clone(), long_poll_config());
    enqueue(&consumer, &["bad", "good"]).await;
    let handler = Arc::new(ScriptedHandler::failing_on(&["bad"]));

    let started = consumer.consume_forever(handler.clone(), true, false).await;

    let err = started.first_cycle.unwrap_err();
    assert_eq!(err.code(), ErrorCode::HandlerFailed);
    assert!(started.handle.is_none());
    assert_eq!(handler.seen(), vec!["bad"]);
    assert!(service.deleted.lock().is_empty());

    let endpoint = consumer.resolve_endpoint(&QueueId::LongPoll).await.unwrap();
    let depth = service.inner.depth(&endpoint);
    assert_eq!(depth.in_flight, 2);
}

#[tokio::test(start_paused = true)]
async fn test_continue_batch_policy_handles_remainder() {
    let service = Arc::new(RecordingService::default());
    let consumer = consumer_with(
        service.clone(),
        LongPollConfig {
            batch_failure_policy: BatchFailurePolicy::ContinueBatch,
            ..long_poll_config()
        },
    );
    let sent = enqueue(&consumer, &["a", "bad", "c"]).await;
    let handler = Arc::new(ScriptedHandler::failing_on(&["bad"]));

    let started = consumer.consume_forever(handler.clone(), false, false).await;

    assert_eq!(started.first_cycle.unwrap_err().code(), ErrorCode::HandlerFailed);
    assert_eq!(handler.seen(), vec!["a", "bad", "c"]);
    assert_eq!(service.deleted_bodies(&sent), vec!["a", "c"]);
}

#[tokio::test(start_paused = true)]
async fn test_continue_batch_keeps_handler_failure_when_delete_fails() {
    let service = Arc::new(RecordingService::failing_deletes(1));
    let consumer = consumer_with(
        service.clone(),
        LongPollConfig {
            batch_failure_policy: BatchFailurePolicy::ContinueBatch,
            ..long_poll_config()
        },
    );
    let sent = enqueue(&consumer, &["bad", "a", "c"]).await;
    let handler = Arc::new(ScriptedHandler::failing_on(&["bad"]));

    let started = consumer.consume_forever(handler.clone(), false, false).await;

    assert_eq!(started.first_cycle.unwrap_err().code(), ErrorCode::HandlerFailed);
    assert_eq!(handler.seen(), vec!["bad", "a", "c"]);
    assert_eq!(service.deleted_bodies(&sent), vec!["c"]);
}

#[tokio::test(start_paused = true)]
async fn test_abort_batch_stops_on_delete_failure() {
    let service = Arc::new(RecordingService::failing_deletes(1));
    let consumer = consumer_with(service.clone(), long_poll_config());
    enqueue(&consumer, &["a", "b"]).await;
    let handler = Arc::new(ScriptedHandler::default());

    let started = consumer.consume_forever(handler.clone(), false, false).await;

    assert_eq!(started.first_cycle.unwrap_err().code(), ErrorCode::QueueError);
    assert_eq!(handler.seen(), vec!["a"]);
    assert!(service.deleted.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_message_redelivered_after_visibility_timeout() {
    let service = Arc::new(RecordingService::default());
    let consumer = consumer_with(service.clone(), long_poll_config());
    let sent = enqueue(&consumer, &["flaky"]).await;

    let failing = Arc::new(ScriptedHandler::failing_on(&["flaky"]));
    assert!(consumer
        .consume_forever(failing, false, false)
        .await
        .first_cycle
        .is_err());

    tokio::time::advance(Duration::from_secs(31)).await;
    let handler = Arc::new(ScriptedHandler::default());
    let started = consumer.consume_forever(handler.clone(), false, false).await;

    assert_eq!(started.first_cycle.unwrap(), 1);
    assert_eq!(service.deleted_bodies(&sent), vec!["flaky"]);
}

// ============================================================================
// Poll Retry Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_poll_failure_without_retry_propagates() {
    let service = Arc::new(RecordingService::failing(1));
    let consumer = consumer_with(service.clone(), long_poll_config());

    let started = consumer
        .consume_forever(Arc::new(ScriptedHandler::default()), true, false)
        .await;

    assert_eq!(started.first_cycle.unwrap_err().code(), ErrorCode::QueueError);
    assert_eq!(service.receive_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_poll_retry_recovers() {
    let service = Arc::new(RecordingService::failing(2));
    let consumer = consumer_with(service.clone(), long_poll_config());
    enqueue(&consumer, &["late"]).await;

    let started = consumer
        .consume_forever(Arc::new(ScriptedHandler::default()), false, true)
        .await;

    assert_eq!(started.first_cycle.unwrap(), 1);
    assert_eq!(service.receive_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_poll_retry_gives_up_after_max_failures() {
    let service = Arc::new(RecordingService::failing(10));
    let consumer = consumer_with(service.clone(), long_poll_config());

    let before = tokio::time::Instant::now();
    let started = consumer
        .consume_forever(Arc::new(ScriptedHandler::default()), true, true)
        .await;

    assert_eq!(started.first_cycle.unwrap_err().code(), ErrorCode::QueueError);
    assert!(started.handle.is_none());
    assert_eq!(service.receive_calls.load(Ordering::SeqCst), 3);
    assert!(before.elapsed() >= Duration::from_millis(1000));
}

// ============================================================================
// Background Loop Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_background_cycles_drain_later_messages() {
    let service = Arc::new(RecordingService::default());
    let consumer = consumer_with(service.clone(), long_poll_config());
    let handler = Arc::new(ScriptedHandler::default());

    let started = consumer.consume_forever(handler.clone(), true, false).await;
    assert_eq!(started.first_cycle.unwrap(), 0);
    let mut handle = started.handle.unwrap();

    enqueue(&consumer, &["one", "two"]).await;
    while handler.seen().len() < 2 {
        handle.changed().await;
    }
    assert_eq!(handler.seen(), vec!["one", "two"]);

    handle.cancel();
    handle.join().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_background_failure_stops_loop() {
    let service = Arc::new(RecordingService::default());
    let consumer = consumer_with(service.clone(), long_poll_config());
    let handler = Arc::new(ScriptedHandler::failing_on(&["poison"]));

    let started = consumer.consume_forever(handler.clone(), true, false).await;
    let handle = started.handle.unwrap();

    enqueue(&consumer, &["poison"]).await;
    let err = handle.join().await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::HandlerFailed);
}

// ============================================================================
// Dead-Letter Tests
// ============================================================================

/// Handler counting every delivery.
struct CountingHandler(AtomicUsize);

#[async_trait]
impl MessageHandler for CountingHandler {
    async fn handle(&self, _message: &QueueMessage) -> Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Err(DocflowError::handler_failed("always fails"))
    }
}

#[tokio::test(start_paused = true)]
async fn test_poison_message_moves_to_dead_letter_queue() {
    let service = Arc::new(RecordingService::default());
    let consumer = consumer_with(service.clone(), long_poll_config());
    enqueue(&consumer, &["poison"]).await;
    let handler = Arc::new(CountingHandler(AtomicUsize::new(0)));

    for _ in 0..3 {
        let _ = consumer.consume_forever(handler.clone(), false, false).await;
        tokio::time::advance(Duration::from_secs(31)).await;
    }

    assert_eq!(handler.0.load(Ordering::SeqCst), 2);
    let dlq = QueueEndpoint::new("docflow-long-poll-dlq", "local");
    assert_eq!(service.inner.depth(&dlq).ready, 1);
}
