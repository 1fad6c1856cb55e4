//! Periodic job producers.
//!
//! Four independent schedulers feed the queue: the spot-migration sweep, the
//! failed-migration sweep (at twice the migration interval), the auto-stop
//! check (fixed two minutes), and job-data garbage collection (three-hourly,
//! aligned to the UTC hour). Each runs on its own timer and tracks health.

mod periodic;
mod tasks;

pub use periodic::{
    PeriodicScheduler, SchedulerHealth, SchedulerService, SchedulerStatus, SchedulerTask,
};
pub use tasks::{AutoStopSweepTask, DataCleanupTask, FailedMigrationSweepTask, MigrationSweepTask};
