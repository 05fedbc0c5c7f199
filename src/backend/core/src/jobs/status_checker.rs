//! Periodic jobs guarded by a lease, and the work item status counter.

use async_trait::async_trait;
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::lease::LeaseStore;
use super::scheduler::{spawn_loop, FailurePolicy, LoopHandle};
use crate::config::ImageStatusCheckerConfig;
use crate::error::{DocflowError, Result};
use crate::telemetry::metrics::{LeaseMetrics, MetricsSink};
use crate::work_items::{StatusCounts, WorkItemStatus, WorkItemStore};

/// Work done by the instance holding the lease.
#[async_trait]
pub trait LeasedTask: Send + Sync {
    type Output: Send;

    fn name(&self) -> &'static str;

    async fn execute(&self) -> Result<Self::Output>;
}

/// Runs a [`LeasedTask`] at most once per lease window across the fleet.
pub struct LeasedPeriodicJob<T: LeasedTask> {
    task: T,
    leases: Arc<dyn LeaseStore>,
    lease_id: String,
    lease_duration: Duration,
    run_every: Duration,
    token: CancellationToken,
}

impl<T: LeasedTask + 'static> LeasedPeriodicJob<T> {
    pub fn new(
        task: T,
        leases: Arc<dyn LeaseStore>,
        lease_id: impl Into<String>,
        lease_duration: Duration,
        run_every: Duration,
    ) -> Self {
        Self {
            task,
            leases,
            lease_id: lease_id.into(),
            lease_duration,
            run_every,
            token: CancellationToken::new(),
        }
    }

    pub fn from_config(task: T, leases: Arc<dyn LeaseStore>, config: &ImageStatusCheckerConfig) -> Self {
        Self::new(
            task,
            leases,
            config.lease_id.clone(),
            config.lease_duration(),
            config.run_every(),
        )
    }

    pub fn task(&self) -> &T {
        &self.task
    }

    /// Take the lease for `lease_duration` if nobody holds it.
    pub async fn try_acquire_lease(&self, lease_duration: Duration) -> Result<bool> {
        self.leases.ensure(&self.lease_id).await?;
        self.leases.try_acquire(&self.lease_id, lease_duration).await
    }

    /// Execute the task if the lease is won. `None` means another instance
    /// holds the lease.
    pub async fn run_task(&self) -> Result<Option<T::Output>> {
        let acquired = self
            .try_acquire_lease(self.lease_duration)
            .await
            .inspect_err(DocflowError::log)?;
        if !acquired {
            LeaseMetrics::skipped(&self.lease_id);
            debug!(job = self.task.name(), lease_id = %self.lease_id, "Lease held elsewhere, skipping run");
            return Ok(None);
        }

        LeaseMetrics::acquired(&self.lease_id);
        let output = self.task.execute().await.inspect_err(|e| {
            warn!(job = self.task.name(), lease_id = %self.lease_id, error = %e, "Leased job failed");
        })?;
        info!(job = self.task.name(), lease_id = %self.lease_id, "Leased job completed");
        Ok(Some(output))
    }

    /// Run now, then with `run_forever` every `run_every`. Failures are
    /// logged by [`run_task`](Self::run_task) and never stop the schedule.
    pub async fn run(self: &Arc<Self>, run_forever: bool) -> Option<LoopHandle> {
        let _ = self.run_task().await;
        if !run_forever {
            return None;
        }

        let job = Arc::clone(self);
        Some(spawn_loop(
            self.task.name(),
            FailurePolicy::KeepGoing,
            self.run_every,
            self.token.clone(),
            move || {
                let job = Arc::clone(&job);
                async move { job.run_task().await.map(|_| ()) }.boxed()
            },
        ))
    }
}

/// Reports how many work items are in each tracked status.
pub struct StatusCountTask {
    store: Arc<dyn WorkItemStore>,
    sink: Arc<dyn MetricsSink>,
    statuses: Vec<WorkItemStatus>,
}

impl StatusCountTask {
    pub fn new(
        store: Arc<dyn WorkItemStore>,
        sink: Arc<dyn MetricsSink>,
        statuses: Vec<WorkItemStatus>,
    ) -> Self {
        Self {
            store,
            sink,
            statuses,
        }
    }

    pub fn gauge_name(status: WorkItemStatus) -> String {
        format!("items_with_status_{}", status)
    }
}

#[async_trait]
impl LeasedTask for StatusCountTask {
    type Output = StatusCounts;

    fn name(&self) -> &'static str {
        "image_status_checker"
    }

    async fn execute(&self) -> Result<StatusCounts> {
        let counts = self.store.count_by_status(&self.statuses).await?;
        for (status, count) in &counts {
            self.sink.gauge(&Self::gauge_name(*status), *count as f64);
        }
        Ok(counts)
    }
}
