//! Telemetry: structured logging and metrics.
//!
//! - **Logging**: `tracing` subscriber with JSON/pretty/compact output
//! - **Metrics**: Prometheus recorder plus the [`MetricsSink`] seam used by
//!   periodic jobs to report gauges
//!
//! # Example
//!
//! ```rust,no_run
//! use docflow_core::telemetry::{TelemetryConfig, init_telemetry};
//!
//! let config = TelemetryConfig::default();
//! let _registry = init_telemetry(&config).expect("Failed to initialize telemetry");
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig};
pub use metrics::{
    init_metrics, InMemorySink, MetricsConfig, MetricsRegistry, MetricsSink, PrometheusSink,
};

use serde::Deserialize;

/// Unified telemetry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Service name for identification in logs and metrics
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Environment (development, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            environment: default_environment(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

fn default_service_name() -> String {
    "docflow-worker".to_string()
}

fn default_environment() -> String {
    std::env::var("DOCFLOW_ENV").unwrap_or_else(|_| "development".to_string())
}

/// Initialize logging and metrics.
pub fn init_telemetry(config: &TelemetryConfig) -> anyhow::Result<MetricsRegistry> {
    init_logging(&config.logging, &config.environment)?;
    let registry = init_metrics(&config.metrics, &config.service_name)?;

    tracing::info!(
        service_name = %config.service_name,
        environment = %config.environment,
        "Telemetry initialized"
    );

    Ok(registry)
}
