pub mod executor_registry;
pub mod pool;
mod worker;

pub use executor_registry::ExecutorRegistry;
pub use pool::WorkerPool;
