#![allow(clippy::result_large_err)]
//! # Docflow Core
//!
//! Scheduling and queue-consumption engine for document workflow workers.
//!
//! ## Architecture
//!
//! - **Priority**: Ranked entity list biasing which work is picked first
//! - **Queue**: Durable queue access with a long-poll consumer and dead-letter redrive
//! - **Jobs**: Task watcher loop, leases and leased periodic jobs
//! - **Work Items**: Record store contract with PostgreSQL and in-memory backends
//! - **Telemetry**: Structured logging and Prometheus metrics

pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod priority;
pub mod queue;
pub mod telemetry;
pub mod work_items;

pub use error::{DocflowError, ErrorCode, ErrorSeverity, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{DocflowError, ErrorCode, ErrorSeverity, Result};
    pub use crate::handlers::{CreateWorkItemHandler, QueueDispatchHandler};
    pub use crate::jobs::{
        LeaseStore, LeasedPeriodicJob, LeasedTask, LoopHandle, LoopStatus, Started,
        StatusCountTask, TaskHandler, TaskWatcher,
    };
    pub use crate::priority::{from_ordered_ids, EntityPriority, PriorityRegistry};
    pub use crate::queue::{
        BatchFailurePolicy, EndpointCache, MessageHandler, QueueConsumer, QueueEndpoint, QueueId,
        QueueMessage, QueueService,
    };
    pub use crate::telemetry::MetricsSink;
    pub use crate::work_items::{
        EntityRanking, NextTask, WorkItem, WorkItemStatus, WorkItemStore,
    };
}
