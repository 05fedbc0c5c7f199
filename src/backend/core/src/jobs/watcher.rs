//! Polling loop over retry-eligible work items.

use async_trait::async_trait;
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::scheduler::{spawn_loop, FailurePolicy, Started};
use crate::config::TasksConfig;
use crate::error::{DocflowError, Result};
use crate::telemetry::metrics::TaskMetrics;
use crate::work_items::{WorkItem, WorkItemStore};

/// Performs the next task of a work item.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, item: &WorkItem) -> Result<()>;
}

/// Repeatedly picks the next eligible work item and hands it to a
/// [`TaskHandler`].
///
/// Selection does not claim the item. Two watchers polling the same store
/// can pick the same item; retry bookkeeping only spaces out attempts.
pub struct TaskWatcher {
    store: Arc<dyn WorkItemStore>,
    handler: Arc<dyn TaskHandler>,
    config: TasksConfig,
    token: CancellationToken,
}

impl TaskWatcher {
    pub fn new(
        store: Arc<dyn WorkItemStore>,
        handler: Arc<dyn TaskHandler>,
        config: TasksConfig,
    ) -> Self {
        Self {
            store,
            handler,
            config,
            token: CancellationToken::new(),
        }
    }

    /// Token cancelled by the loop handle. Also interrupts the idle sleep.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// One cycle. Returns the item that was handled, or `None` after an idle
    /// sleep when nothing was eligible.
    pub async fn run_once(&self) -> Result<Option<WorkItem>> {
        let next = self
            .store
            .next_waiting_task(self.config.retry_interval_min, self.config.max_retries)
            .await
            .inspect_err(DocflowError::log)?;

        let Some(item) = next else {
            TaskMetrics::idle();
            debug!(delay_ms = self.config.delay_when_no_tasks_ms, "No waiting task");
            self.idle(self.config.delay_when_no_tasks()).await;
            return Ok(None);
        };

        let kind = item
            .next_task
            .as_ref()
            .map(|task| task.kind.clone())
            .unwrap_or_default();

        self.store
            .record_retry(item.id)
            .await
            .inspect_err(DocflowError::log)?;

        match self.handler.handle(&item).await {
            Ok(()) => {
                TaskMetrics::handled(&kind);
                info!(work_item_id = %item.id, entity_id = %item.entity_id, task_kind = %kind, "Task handled");
                Ok(Some(item))
            }
            Err(e) => {
                TaskMetrics::failed(&kind);
                warn!(
                    work_item_id = %item.id,
                    entity_id = %item.entity_id,
                    task_kind = %kind,
                    error = %e,
                    "Task handler failed"
                );
                Err(e)
            }
        }
    }

    async fn idle(&self, delay: Duration) {
        tokio::select! {
            _ = self.token.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }

    /// Run one cycle now and, with `run_forever`, keep cycling in the
    /// background whatever each cycle's outcome. Failures are logged by
    /// [`run_once`](Self::run_once).
    pub async fn start(self: &Arc<Self>, run_forever: bool) -> Started<Option<WorkItem>> {
        let first_cycle = self.run_once().await;
        if !run_forever {
            return Started::once(first_cycle);
        }

        let watcher = Arc::clone(self);
        let handle = spawn_loop(
            "task_watcher",
            FailurePolicy::KeepGoing,
            Duration::ZERO,
            self.token.clone(),
            move || {
                let watcher = Arc::clone(&watcher);
                async move { watcher.run_once().await.map(|_| ()) }.boxed()
            },
        );

        Started {
            first_cycle,
            handle: Some(handle),
        }
    }
}
