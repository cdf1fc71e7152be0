//! `taskfleet-core` — scheduler domain building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! the job state machine, job/resource records, executor addressing and the
//! heartbeat & retry decision logic.

pub mod error;
pub mod executor;
pub mod id;
pub mod job;
pub mod policy;
pub mod resource;
pub mod status;
pub mod task_result;

pub use error::{DomainError, DomainResult};
pub use executor::ExecutorIdentifier;
pub use id::{JobId, ResourceRowId};
pub use job::{Job, JobAttribute, JobProperties, NewJob};
pub use policy::{HeartbeatPolicy, MAX_TIMEOUT_SECONDS, RetryDecision, RetryDefaults, RetryPolicy};
pub use resource::{Resource, ResourceId, ResourceLocation, ResourceState};
pub use status::{JobStatus, RunMode};
pub use task_result::{TaskOutcome, TaskResult};
