//! Payloads published by the reconciliation daemons and result ingestion.

use serde::{Deserialize, Serialize};

use taskfleet_core::{ExecutorIdentifier, JobStatus, RunMode, TaskOutcome};

use crate::envelope::EventEnvelope;

pub type SchedulerEnvelope = EventEnvelope<SchedulerEvent>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    /// The executor of a job must be torn down (heartbeat lost).
    ExecutorDestroyRequested {
        run_mode: RunMode,
        executor_identifier: ExecutorIdentifier,
        reason: String,
    },

    /// An executor report changed the job's progress.
    TaskResultUploaded {
        outcome: TaskOutcome,
        progress_percentage: f64,
    },

    /// The job reached DONE, FAILED or CANCELED.
    JobTerminated {
        status: JobStatus,
        description: Option<String>,
    },
}

impl SchedulerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SchedulerEvent::ExecutorDestroyRequested { .. } => "executor_destroy_requested",
            SchedulerEvent::TaskResultUploaded { .. } => "task_result_uploaded",
            SchedulerEvent::JobTerminated { .. } => "job_terminated",
        }
    }
}
