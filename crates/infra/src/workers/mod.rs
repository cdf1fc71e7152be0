//! Background event consumers.

pub mod event_worker;
pub mod executor_reaper;

pub use event_worker::{EventWorker, WorkerHandle};
pub use executor_reaper::ExecutorReaper;
