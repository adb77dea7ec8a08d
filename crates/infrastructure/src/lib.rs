pub mod database;
pub mod memory_queue;
pub mod notify;

pub use database::sqlite::{
    SqliteBatchRepository, SqliteCronRepository, SqliteLeaseRepository, SqliteQueueRepository,
    SqliteTaskRepository,
};
pub use database::Database;
pub use memory_queue::MemoryTaskQueue;
pub use notify::LogNotifier;
