//! Build scheduling for the Keel CI server.
//!
//! A fixed pool of workers pulls jobs from one in-memory queue. Head-only
//! projects coalesce pending jobs per branch. Terminal jobs are persisted
//! with retries and published as [`CompletedBuild`] events.

mod handle;
mod persist;
mod queue;
pub mod scheduler;
mod worker;

pub use handle::{JobHandle, JobOutcome};
pub use persist::RetryPolicy;
pub use queue::QueueSnapshot;
pub use scheduler::{CompletedBuild, Scheduler, SchedulerConfig};
