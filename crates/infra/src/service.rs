//! Operator-facing job operations: submit, inspect, cancel.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use taskfleet_core::{Job, JobAttribute, JobId, JobStatus, NewJob};
use taskfleet_events::{EventBus, SchedulerEnvelope, SchedulerEvent};

use crate::store::{JobStore, RowDecision, StoreError, Transition, transition};

pub const CANCELED_BEFORE_START: &str = "canceled before start";

/// A cancel racing a daemon re-reads the row this many times.
const CANCEL_ATTEMPTS: usize = 3;

#[derive(Clone)]
pub struct JobService {
    store: Arc<dyn JobStore>,
    bus: Arc<dyn EventBus<SchedulerEnvelope>>,
}

impl JobService {
    pub fn new(store: Arc<dyn JobStore>, bus: Arc<dyn EventBus<SchedulerEnvelope>>) -> Self {
        Self { store, bus }
    }

    pub fn submit(&self, job: NewJob) -> Result<Job, StoreError> {
        job.validate()?;
        let job = self.store.insert(job, Utc::now())?;
        info!(job_id = %job.id, job_type = %job.job_type, run_mode = %job.run_mode, "job submitted");
        Ok(job)
    }

    pub fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        self.store.get(id)
    }

    pub fn attributes(&self, id: JobId) -> Result<Vec<JobAttribute>, StoreError> {
        self.store.attributes(id)
    }

    /// Request cancellation.
    ///
    /// Jobs that have not started are canceled outright; running jobs move to
    /// CANCELING and are stopped by the canceling daemon. Other states are
    /// returned unchanged as `Skipped`.
    pub fn cancel(&self, id: JobId) -> Result<Transition, StoreError> {
        let mut last = Transition::Missing;
        for _ in 0..CANCEL_ATTEMPTS {
            let Some(job) = self.store.get(id)? else {
                return Ok(Transition::Missing);
            };
            let now = Utc::now();

            last = match job.status {
                JobStatus::Preparing | JobStatus::Retrying => {
                    transition(self.store.as_ref(), id, &[job.status], |row| {
                        row.job_mut().finish(JobStatus::Canceled, CANCELED_BEFORE_START, now)?;
                        Ok(RowDecision::Commit)
                    })?
                }
                JobStatus::Running => transition(self.store.as_ref(), id, &[JobStatus::Running], |row| {
                    row.job_mut().mark_canceling(now)?;
                    Ok(RowDecision::Commit)
                })?,
                _ => return Ok(Transition::Skipped(job)),
            };

            match &last {
                Transition::Applied(updated) => {
                    info!(job_id = %id, status = %updated.status, "cancel requested");
                    if updated.status.is_terminal() {
                        let event = SchedulerEvent::JobTerminated {
                            status: updated.status,
                            description: updated.description.clone(),
                        };
                        if let Err(err) = self.bus.publish(SchedulerEnvelope::wrap(id, now, event)) {
                            warn!(job_id = %id, error = %err, "failed to publish scheduler event");
                        }
                    }
                    return Ok(last);
                }
                Transition::Stale { current } => {
                    debug!(job_id = %id, current = %current, "job moved during cancel; re-reading");
                }
                Transition::Skipped(_) | Transition::Missing => return Ok(last),
            }
        }
        Ok(last)
    }
}

impl std::fmt::Debug for JobService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobService").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryJobStore;
    use taskfleet_core::{DomainError, RunMode};
    use taskfleet_events::InMemoryEventBus;

    fn service() -> (JobService, Arc<InMemoryEventBus<SchedulerEnvelope>>) {
        let bus = Arc::new(InMemoryEventBus::<SchedulerEnvelope>::new());
        (JobService::new(InMemoryJobStore::arc(), bus.clone()), bus)
    }

    #[test]
    fn submit_rejects_invalid_parameters() {
        let (service, _) = service();
        let err = service
            .submit(NewJob::new("report", RunMode::Process).parameters("{not json"))
            .unwrap_err();
        assert!(matches!(err, StoreError::Domain(DomainError::Validation(_))));
    }

    #[test]
    fn cancel_before_start_terminates_and_publishes() {
        let (service, bus) = service();
        let events = bus.subscribe();
        let job = service.submit(NewJob::new("report", RunMode::Process)).unwrap();

        let result = service.cancel(job.id).unwrap();

        let Transition::Applied(job) = result else {
            panic!("expected applied, got {result:?}");
        };
        assert_eq!(job.status, JobStatus::Canceled);
        assert_eq!(job.description.as_deref(), Some(CANCELED_BEFORE_START));
        assert_eq!(events.try_recv().unwrap().payload().kind(), "job_terminated");
    }

    #[test]
    fn cancel_running_job_moves_to_canceling() {
        let (service, _) = service();
        let job = service.submit(NewJob::new("report", RunMode::Cluster)).unwrap();
        transition(service.store.as_ref(), job.id, &[JobStatus::Preparing], |row| {
            row.job_mut()
                .mark_started("cluster://a/b/c/d".parse().unwrap(), None, Utc::now())?;
            Ok(RowDecision::Commit)
        })
        .unwrap();

        service.cancel(job.id).unwrap();

        let stored = service.get(job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Canceling);
        assert!(stored.cancelling_time.is_some());
    }

    #[test]
    fn cancel_of_finished_or_unknown_job_is_a_noop() {
        let (service, _) = service();
        let job = service.submit(NewJob::new("report", RunMode::Process)).unwrap();
        service.cancel(job.id).unwrap();

        assert!(matches!(service.cancel(job.id).unwrap(), Transition::Skipped(_)));
        assert_eq!(service.cancel(JobId::new(999)).unwrap(), Transition::Missing);
    }
}
