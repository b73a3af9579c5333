pub mod executor;
pub mod handler;
pub mod pool;

pub use executor::{ExecutionOutcome, TaskExecutor};
pub use handler::{BatchListener, HandlerRegistry, TaskHandler};
pub use pool::WorkerPool;
