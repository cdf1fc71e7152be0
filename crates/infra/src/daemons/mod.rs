//! Reconciliation daemons.
//!
//! Each daemon scans one bounded page of candidate rows per run and drives
//! each row one step along the lifecycle. Rows are independent: a failure on
//! one is logged and counted, and the batch continues. Only a failure to fetch
//! the page (or a denied admission) ends a run early.

use chrono::{DateTime, Utc};

use crate::store::StoreError;

pub mod check_running;
pub mod destroy_executor;
pub mod destroy_resource;
pub mod do_canceling;
pub mod pull_task_result;
pub mod runner;
pub mod start_preparing;

pub use check_running::CheckRunningJob;
pub use destroy_executor::DestroyExecutorJob;
pub use destroy_resource::DestroyResourceJob;
pub use do_canceling::DoCancelingJob;
pub use pull_task_result::PullTaskResultJob;
pub use runner::{DaemonHandle, DaemonRunner};
pub use start_preparing::StartPreparingJob;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("failed to fetch candidates: {0}")]
    Fetch(#[source] StoreError),
    #[error("admission check failed: {0}")]
    Admission(#[source] StoreError),
}

/// Per-run counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub scanned: usize,
    /// Rows moved forward (state written or external action completed).
    pub advanced: usize,
    /// Rows left alone (stale guard, nothing to do yet, not ours).
    pub skipped: usize,
    pub failed: usize,
}

impl BatchReport {
    pub(crate) fn record(&mut self, step: Step) {
        match step {
            Step::Advanced => self.advanced += 1,
            Step::Skipped => self.skipped += 1,
            Step::Failed => self.failed += 1,
        }
    }
}

/// What happened to one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Advanced,
    Skipped,
    Failed,
}

pub trait Daemon: Send + Sync {
    fn name(&self) -> &'static str;

    fn run_once(&self, now: DateTime<Utc>) -> Result<BatchReport, DaemonError>;
}
