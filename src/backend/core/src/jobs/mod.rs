//! Background loops of the worker.
//!
//! - **Scheduler**: [`spawn_loop`] runs cycles in the background behind a
//!   cancellable [`LoopHandle`]; [`Started`] pairs it with the first cycle's
//!   result
//! - **Watcher**: [`TaskWatcher`] drives retry-eligible work items through a
//!   [`TaskHandler`]
//! - **Leases**: [`LeaseStore`] rows give fleet-wide mutual exclusion to
//!   [`LeasedPeriodicJob`]s such as the [`StatusCountTask`]
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   next_waiting_task   ┌──────────────┐
//! │ TaskWatcher  │──────────────────────▶│ WorkItemStore│◀── ranking (PriorityRegistry)
//! └──────┬───────┘                       └──────▲───────┘
//!        │ handle                               │ count_by_status
//!        ▼                                      │
//! ┌──────────────┐                       ┌──────┴───────────┐   try_acquire   ┌────────────┐
//! │ TaskHandler  │                       │ LeasedPeriodicJob│────────────────▶│ LeaseStore │
//! └──────────────┘                       └──────────────────┘                 └────────────┘
//! ```

pub mod lease;
pub mod scheduler;
pub mod status_checker;
pub mod watcher;

pub use lease::{InMemoryLeaseStore, LeaseStore, PostgresLeaseStore};
pub use scheduler::{spawn_loop, FailurePolicy, LoopHandle, LoopStatus, Started};
pub use status_checker::{LeasedPeriodicJob, LeasedTask, StatusCountTask};
pub use watcher::{TaskHandler, TaskWatcher};
