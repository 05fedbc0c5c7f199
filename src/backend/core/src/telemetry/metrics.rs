//! Prometheus metrics and the gauge sink used by the periodic jobs.
//!
//! # Example
//!
//! ```rust,no_run
//! use docflow_core::telemetry::metrics::{MetricsSink, PrometheusSink};
//!
//! PrometheusSink.gauge("items_with_status_received", 12.0);
//! ```

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;

/// Metrics configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Address the Prometheus scrape endpoint listens on (e.g., "0.0.0.0:9090")
    #[serde(default = "default_metrics_endpoint")]
    pub endpoint: String,

    /// Global labels to add to all metrics
    #[serde(default)]
    pub global_labels: HashMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            endpoint: default_metrics_endpoint(),
            global_labels: HashMap::new(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_endpoint() -> String {
    "0.0.0.0:9090".to_string()
}

impl MetricsConfig {
    /// Parsed scrape endpoint address.
    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        self.endpoint
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid metrics endpoint {}: {}", self.endpoint, e))
    }
}

/// Handle on the installed Prometheus recorder.
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("prometheus_handle", &self.prometheus_handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Initialize the metrics subsystem and start the scrape endpoint.
///
/// Must be called from within a tokio runtime when metrics are enabled.
///
/// # Errors
///
/// Returns an error if the endpoint is invalid or a global recorder is
/// already installed.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry {
            prometheus_handle: None,
        });
    }

    let addr = config.listen_addr()?;
    let mut builder = PrometheusBuilder::new().with_http_listener(addr);
    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }

    let (recorder, exporter) = builder.build()?;
    let handle = recorder.handle();
    metrics::set_global_recorder(recorder)
        .map_err(|_| anyhow::anyhow!("A global metrics recorder is already installed"))?;
    tokio::spawn(async move {
        if let Err(e) = exporter.await {
            tracing::error!(error = ?e, "Prometheus scrape endpoint stopped");
        }
    });
    register_metric_descriptions();

    tracing::info!(service_name = %service_name, endpoint = %addr, "Metrics initialized");

    Ok(MetricsRegistry {
        prometheus_handle: Some(handle),
    })
}

fn register_metric_descriptions() {
    describe_counter!("docflow_errors_total", "Total number of errors by code");

    describe_counter!(
        "docflow_queue_messages_received_total",
        "Messages received from the long-poll queue"
    );
    describe_counter!(
        "docflow_queue_messages_deleted_total",
        "Messages acknowledged after successful handling"
    );
    describe_counter!(
        "docflow_queue_handler_failures_total",
        "Messages whose handler failed and were left for redelivery"
    );
    describe_counter!(
        "docflow_queue_poll_failures_total",
        "Failed receive calls on the long-poll queue"
    );

    describe_counter!("docflow_tasks_handled_total", "Work items handed to the task handler");
    describe_counter!("docflow_tasks_failed_total", "Task handler failures");
    describe_counter!("docflow_tasks_idle_total", "Watcher cycles that found no eligible work item");

    describe_counter!("docflow_lease_acquired_total", "Periodic job runs that won the lease");
    describe_counter!("docflow_lease_skipped_total", "Periodic job runs skipped because the lease was held");

    describe_gauge!("docflow_loop_running", "Background loops currently running");
}

/// Sink for gauge values reported by periodic jobs.
pub trait MetricsSink: Send + Sync {
    /// Set a gauge. Fire-and-forget.
    fn gauge(&self, name: &str, value: f64);
}

/// Sink backed by the global `metrics` recorder.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusSink;

impl MetricsSink for PrometheusSink {
    fn gauge(&self, name: &str, value: f64) {
        gauge!(name.to_string()).set(value);
    }
}

/// Sink that keeps the last value of each gauge, for tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemorySink {
    gauges: RwLock<HashMap<String, f64>>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        self.gauges.read().get(name).copied()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.gauges.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl MetricsSink for InMemorySink {
    fn gauge(&self, name: &str, value: f64) {
        self.gauges.write().insert(name.to_string(), value);
    }
}

/// Counters for the long-poll consumer.
pub struct QueueMetrics;

impl QueueMetrics {
    pub fn received(queue: &str, count: usize) {
        counter!("docflow_queue_messages_received_total", "queue" => queue.to_string())
            .increment(count as u64);
    }

    pub fn deleted(queue: &str) {
        counter!("docflow_queue_messages_deleted_total", "queue" => queue.to_string())
            .increment(1);
    }

    pub fn handler_failed(queue: &str) {
        counter!("docflow_queue_handler_failures_total", "queue" => queue.to_string())
            .increment(1);
    }

    pub fn poll_failed(queue: &str) {
        counter!("docflow_queue_poll_failures_total", "queue" => queue.to_string())
            .increment(1);
    }
}

/// Counters for the task watcher.
pub struct TaskMetrics;

impl TaskMetrics {
    pub fn handled(kind: &str) {
        counter!("docflow_tasks_handled_total", "kind" => kind.to_string()).increment(1);
    }

    pub fn failed(kind: &str) {
        counter!("docflow_tasks_failed_total", "kind" => kind.to_string()).increment(1);
    }

    pub fn idle() {
        counter!("docflow_tasks_idle_total").increment(1);
    }
}

/// Counters for leased periodic jobs.
pub struct LeaseMetrics;

impl LeaseMetrics {
    pub fn acquired(lease_id: &str) {
        counter!("docflow_lease_acquired_total", "lease" => lease_id.to_string()).increment(1);
    }

    pub fn skipped(lease_id: &str) {
        counter!("docflow_lease_skipped_total", "lease" => lease_id.to_string()).increment(1);
    }
}

/// Gauge of running background loops, by loop name.
pub struct LoopGauge;

impl LoopGauge {
    pub fn started(name: &str) {
        gauge!("docflow_loop_running", "loop" => name.to_string()).increment(1.0);
    }

    pub fn stopped(name: &str) {
        gauge!("docflow_loop_running", "loop" => name.to_string()).decrement(1.0);
    }
}
