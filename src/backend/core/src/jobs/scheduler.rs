//! Background cycle loops with explicit handles.

use futures::future::BoxFuture;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{DocflowError, Result};
use crate::telemetry::metrics::LoopGauge;

/// Outcome of starting a loop: the first cycle ran inline, later cycles
/// (if any) run in the background behind `handle`.
#[must_use]
pub struct Started<T> {
    pub first_cycle: Result<T>,
    pub handle: Option<LoopHandle>,
}

impl<T> Started<T> {
    /// First cycle only, nothing left running.
    pub fn once(first_cycle: Result<T>) -> Self {
        Self {
            first_cycle,
            handle: None,
        }
    }
}

/// Progress of a background loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopStatus {
    /// Background cycles completed, successful or not.
    pub cycles: u64,
    pub failures: u64,
    pub last_error: Option<String>,
    pub finished: bool,
}

/// What a loop does when a cycle fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// End the loop and report the error from [`LoopHandle::join`].
    StopOnFailure,
    /// Log the error and run the next cycle.
    KeepGoing,
}

/// Control over a running background loop.
pub struct LoopHandle {
    name: &'static str,
    token: CancellationToken,
    status: watch::Receiver<LoopStatus>,
    task: JoinHandle<Result<()>>,
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("name", &self.name)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl LoopHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Stop at the next cycle boundary. A cycle in progress completes.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn status(&self) -> LoopStatus {
        self.status.borrow().clone()
    }

    /// Wait for the next status update and return it.
    pub async fn changed(&mut self) -> LoopStatus {
        let _ = self.status.changed().await;
        self.status.borrow_and_update().clone()
    }

    /// Wait for the loop to end. Returns the error that stopped it, if any.
    pub async fn join(self) -> Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(DocflowError::internal(format!(
                "Loop {} terminated abnormally: {}",
                self.name, e
            ))),
        }
    }
}

/// Spawn a loop that waits `pause`, runs `cycle`, and repeats until
/// `token` is cancelled or, under [`FailurePolicy::StopOnFailure`], a cycle
/// fails. A zero pause yields to the runtime between cycles.
pub fn spawn_loop<F>(
    name: &'static str,
    policy: FailurePolicy,
    pause: Duration,
    token: CancellationToken,
    mut cycle: F,
) -> LoopHandle
where
    F: FnMut() -> BoxFuture<'static, Result<()>> + Send + 'static,
{
    let (status_tx, status_rx) = watch::channel(LoopStatus::default());
    let loop_token = token.clone();

    let task = tokio::spawn(async move {
        LoopGauge::started(name);
        info!(loop_name = name, ?policy, "Background loop started");

        let result = loop {
            tokio::select! {
                biased;
                _ = loop_token.cancelled() => break Ok(()),
                _ = pause_between_cycles(pause) => {}
            }

            let outcome = cycle().await;
            status_tx.send_modify(|status| {
                status.cycles += 1;
                if let Err(e) = &outcome {
                    status.failures += 1;
                    status.last_error = Some(e.to_string());
                }
            });

            match outcome {
                Ok(()) => debug!(loop_name = name, "Cycle completed"),
                Err(e) if policy == FailurePolicy::StopOnFailure => {
                    warn!(loop_name = name, error = %e, "Cycle failed, stopping loop");
                    break Err(e);
                }
                Err(e) => debug!(loop_name = name, error = %e, "Cycle failed, continuing"),
            }
        };

        status_tx.send_modify(|status| status.finished = true);
        LoopGauge::stopped(name);
        info!(loop_name = name, cancelled = loop_token.is_cancelled(), "Background loop stopped");
        result
    });

    LoopHandle {
        name,
        token,
        status: status_rx,
        task,
    }
}

async fn pause_between_cycles(pause: Duration) {
    if pause.is_zero() {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(pause).await;
    }
}
