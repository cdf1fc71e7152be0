//! Job lifecycle state machine and run modes.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::task_result::TaskOutcome;

/// Persisted lifecycle state of a job.
///
/// ```text
/// PREPARING ──┬─> RUNNING ──┬─> DONE / FAILED
///             │      │      ├─> RETRYING ──> RUNNING | CANCELED
///             │      │      ├─> CANCELED
///             │      └──────┴─> CANCELING ──> CANCELED
///             └─> CANCELED
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Preparing,
    Retrying,
    Running,
    Canceling,
    Canceled,
    Done,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Preparing,
        JobStatus::Retrying,
        JobStatus::Running,
        JobStatus::Canceling,
        JobStatus::Canceled,
        JobStatus::Done,
        JobStatus::Failed,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Canceled | JobStatus::Done | JobStatus::Failed)
    }

    /// Waiting for (re-)dispatch.
    pub fn is_pending_dispatch(&self) -> bool {
        matches!(self, JobStatus::Preparing | JobStatus::Retrying)
    }

    /// Whether the state machine has an edge `self -> next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Preparing | Retrying, Running | Canceled) => true,
            (Running, Canceling | Retrying | Canceled | Done | Failed) => true,
            (Canceling, Canceled) => true,
            _ => false,
        }
    }

    /// Validate an edge, returning the illegal pair as an error.
    pub fn ensure_transition(&self, next: JobStatus) -> Result<(), DomainError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(DomainError::IllegalTransition {
                from: *self,
                to: next,
            })
        }
    }

    /// Target status for a terminal report coming from an executor.
    ///
    /// A job that was asked to cancel ends CANCELED whatever the executor says.
    pub fn after_terminal_report(&self, outcome: TaskOutcome) -> Option<JobStatus> {
        match self {
            JobStatus::Canceling => Some(JobStatus::Canceled),
            JobStatus::Running => match outcome {
                TaskOutcome::Done => Some(JobStatus::Done),
                TaskOutcome::Failed => Some(JobStatus::Failed),
                TaskOutcome::Canceled => Some(JobStatus::Canceled),
                TaskOutcome::Preparing | TaskOutcome::Running => None,
            },
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Preparing => "PREPARING",
            JobStatus::Retrying => "RETRYING",
            JobStatus::Running => "RUNNING",
            JobStatus::Canceling => "CANCELING",
            JobStatus::Canceled => "CANCELED",
            JobStatus::Done => "DONE",
            JobStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job status '{s}'")))
    }
}

/// Selects which executor gateway runs a job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunMode {
    Process,
    Cluster,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Process => "PROCESS",
            RunMode::Cluster => "CLUSTER",
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PROCESS" => Ok(RunMode::Process),
            "CLUSTER" => Ok(RunMode::Cluster),
            other => Err(DomainError::validation(format!("unknown run mode '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use JobStatus::*;

    #[test]
    fn transition_table_matches_lifecycle() {
        let allowed = [
            (Preparing, Running),
            (Preparing, Canceled),
            (Retrying, Running),
            (Retrying, Canceled),
            (Running, Canceling),
            (Running, Retrying),
            (Running, Canceled),
            (Running, Done),
            (Running, Failed),
            (Canceling, Canceled),
        ];

        for from in JobStatus::ALL {
            for to in JobStatus::ALL {
                let expected = allowed.contains(&(from, to));
                assert_eq!(
                    from.can_transition_to(to),
                    expected,
                    "edge {from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for from in [Canceled, Done, Failed] {
            assert!(from.is_terminal());
            assert!(JobStatus::ALL.iter().all(|to| !from.can_transition_to(*to)));
            assert!(matches!(
                from.ensure_transition(Running),
                Err(DomainError::IllegalTransition { .. })
            ));
        }
    }

    #[test]
    fn terminal_report_mapping() {
        assert_eq!(Running.after_terminal_report(TaskOutcome::Done), Some(Done));
        assert_eq!(Running.after_terminal_report(TaskOutcome::Failed), Some(Failed));
        assert_eq!(Running.after_terminal_report(TaskOutcome::Running), None);
        assert_eq!(Canceling.after_terminal_report(TaskOutcome::Done), Some(Canceled));
        assert_eq!(Done.after_terminal_report(TaskOutcome::Failed), None);
    }

    #[test]
    fn string_round_trip_for_storage() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert_eq!("CLUSTER".parse::<RunMode>().unwrap(), RunMode::Cluster);
        assert!("k8s".parse::<RunMode>().is_err());
    }
}
