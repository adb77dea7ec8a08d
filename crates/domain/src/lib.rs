pub mod models;
pub mod ports;
pub mod repositories;

pub use models::batch::{BatchCounts, TaskBatch};
pub use models::cron::{ConcurrentPolicy, CronExecution, CronJob, MisfirePolicy};
pub use models::event::{TaskEvent, TaskEventKind};
pub use models::lease::LeaderLease;
pub use models::queue::{QueueConfig, QueueStatus};
pub use models::task::{
    AttemptOutcome, BackoffKind, DependencyPolicy, ExecutorKind, Priority, RetryPolicy,
    ScheduleMode, Task, TaskExecution, TaskFilter, TaskResult, TaskSpec, TaskStatus, TaskType,
};
pub use models::worker::{WorkerPoolStats, WorkerState, WorkerStatus};
