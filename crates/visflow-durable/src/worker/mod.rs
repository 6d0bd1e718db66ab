//! Worker pool and executor contract

mod executor;
mod pool;

pub use executor::{CancellationHandle, ExecContext, ExecError, Executor, ExecutorRegistry};
pub use pool::{Worker, WorkerConfig, WorkerError, WorkerStatus};
