//! Docflow Worker - Main entry point
//!
//! Runs the long-poll consumer, the task watcher and the leased status
//! checker against PostgreSQL and Redis.

use std::sync::Arc;

use clap::Parser;
use docflow_core::{
    config::Config,
    db::Database,
    handlers::{CreateWorkItemHandler, QueueDispatchHandler},
    jobs::{LeasedPeriodicJob, LoopHandle, PostgresLeaseStore, StatusCountTask, TaskWatcher},
    priority::{PostgresDocumentStore, PriorityRegistry},
    queue::{EndpointCache, QueueConsumer, QueueId, RedisQueueService},
    telemetry::{self, PrometheusSink},
    work_items::PostgresWorkItemStore,
};

#[derive(Debug, Parser)]
#[command(name = "docflow-worker", version, about = "Docflow background worker")]
struct Args {
    /// Configuration file; environment variables prefixed DOCFLOW__ override it
    #[arg(short, long, env = "DOCFLOW_CONFIG")]
    config: Option<String>,

    /// Run a single cycle of every component and exit
    #[arg(long)]
    once: bool,

    /// Do not consume the long-poll queue
    #[arg(long)]
    skip_consumer: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();
    let args = Args::parse();

    // Load configuration
    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };

    // Initialize telemetry
    let _metrics = telemetry::init_telemetry(&config.telemetry)?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        once = args.once,
        "Starting Docflow worker"
    );

    // Connect to database
    let db = Database::new(&config.database).await?;
    db.migrate().await?;
    tracing::info!("Connected to database, migrations applied");

    // Connect to the queue backend
    let queue_service = Arc::new(RedisQueueService::connect(&config.redis.url).await?);
    tracing::info!("Connected to Redis queue backend");

    let run_forever = !args.once;
    let pool = db.pool().clone();

    let priorities = Arc::new(PriorityRegistry::new(Arc::new(PostgresDocumentStore::new(
        pool.clone(),
    ))));
    let work_items = Arc::new(PostgresWorkItemStore::with_ranking(pool.clone(), priorities));
    let consumer = Arc::new(QueueConsumer::from_config(
        queue_service,
        Arc::new(EndpointCache::new()),
        &config,
    ));

    let mut handles: Vec<LoopHandle> = Vec::new();

    // Leased status checker
    let status_job = Arc::new(LeasedPeriodicJob::from_config(
        StatusCountTask::new(
            work_items.clone(),
            Arc::new(PrometheusSink),
            config.image_status_checker.tracked_statuses.clone(),
        ),
        Arc::new(PostgresLeaseStore::new(pool)),
        &config.image_status_checker,
    ));
    handles.extend(status_job.run(run_forever).await);

    // Task watcher
    let watcher = Arc::new(TaskWatcher::new(
        work_items.clone(),
        Arc::new(QueueDispatchHandler::new(
            consumer.clone(),
            QueueId::named(config.dispatch_queue.clone()),
        )),
        config.tasks.clone(),
    ));
    handles.extend(watcher.start(run_forever).await.handle);

    // Long-poll consumer
    if !args.skip_consumer {
        let started = consumer
            .consume_forever(Arc::new(CreateWorkItemHandler::new(work_items)), run_forever, true)
            .await;
        match started.first_cycle {
            Ok(handled) => tracing::info!(handled, "First consume cycle completed"),
            Err(e) => tracing::error!(error = %e, "First consume cycle failed, consumer not started"),
        }
        handles.extend(started.handle);
    }

    if handles.is_empty() {
        tracing::info!("Single run complete");
        return Ok(());
    }

    shutdown_signal().await;
    for handle in &handles {
        handle.cancel();
    }
    for handle in handles {
        let name = handle.name();
        if let Err(e) = handle.join().await {
            tracing::warn!(loop_name = name, error = %e, "Loop ended with an error");
        }
    }

    tracing::info!("Worker shutdown complete");
    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
