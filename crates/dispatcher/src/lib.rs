pub mod batch_monitor;
pub mod cron_scheduler;
pub mod cron_utils;
pub mod dependency;
pub mod idempotency;
pub mod leader;
pub mod submitter;

pub use batch_monitor::BatchMonitor;
pub use cron_scheduler::CronScheduler;
pub use cron_utils::CronSchedule;
pub use dependency::{DependencyDecision, DependencyGate, DependencyWatcher};
pub use idempotency::IdempotencyLedger;
pub use leader::LeaderElector;
pub use submitter::SubmissionService;
