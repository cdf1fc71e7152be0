//! Ask executors of CANCELING jobs to stop; give up after the cancel timeout.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use taskfleet_core::{Job, JobStatus};
use taskfleet_events::{EventBus, SchedulerEnvelope, SchedulerEvent};

use super::{BatchReport, Daemon, DaemonError, Step};
use crate::gateway::{ExecutorGateways, ExecutorHandle};
use crate::store::{JobStore, Page, RowDecision, StoreError, Transition, transition};

pub struct DoCancelingJob {
    store: Arc<dyn JobStore>,
    gateways: ExecutorGateways,
    bus: Arc<dyn EventBus<SchedulerEnvelope>>,
    cancel_timeout: Duration,
    batch_size: usize,
}

impl DoCancelingJob {
    pub fn new(
        store: Arc<dyn JobStore>,
        gateways: ExecutorGateways,
        bus: Arc<dyn EventBus<SchedulerEnvelope>>,
        cancel_timeout: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            gateways,
            bus,
            cancel_timeout,
            batch_size,
        }
    }

    fn timed_out(&self, job: &Job, now: DateTime<Utc>) -> bool {
        let since = job.cancelling_time.unwrap_or(job.create_time);
        now - since > self.cancel_timeout
    }

    fn give_up(&self, job: &Job, now: DateTime<Utc>) -> Result<Step, StoreError> {
        let result = transition(self.store.as_ref(), job.id, &[JobStatus::Canceling], |row| {
            row.job_mut().finish(JobStatus::Canceled, "cancel timeout", now)?;
            Ok(RowDecision::Commit)
        })?;

        let Transition::Applied(job) = result else {
            return Ok(Step::Skipped);
        };
        info!(job_id = %job.id, "executor never confirmed cancel; job canceled");
        let event = SchedulerEvent::JobTerminated {
            status: job.status,
            description: job.description.clone(),
        };
        if let Err(err) = self.bus.publish(SchedulerEnvelope::wrap(job.id, now, event)) {
            warn!(job_id = %job.id, error = %err, "failed to publish scheduler event");
        }
        Ok(Step::Advanced)
    }

    fn request_stop(&self, job: &Job) -> Result<Step, StoreError> {
        let mut stop_error = None;

        // The lock keeps a concurrent finish from racing the stop request.
        let result = transition(self.store.as_ref(), job.id, &[JobStatus::Canceling], |row| {
            let Some(handle) = ExecutorHandle::of(row.job()) else {
                return Ok(RowDecision::Abort);
            };
            let gateway = self.gateways.for_identifier(&handle.identifier);
            if let Err(err) = gateway.stop(&handle) {
                stop_error = Some(err);
            }
            Ok(RowDecision::Abort)
        })?;

        Ok(match (result, stop_error) {
            (Transition::Skipped(job), None) if job.executor_identifier.is_some() => {
                debug!(job_id = %job.id, "stop requested");
                Step::Advanced
            }
            (Transition::Skipped(_), Some(err)) => {
                warn!(job_id = %job.id, error = %err, "stop request failed; will retry next cycle");
                Step::Failed
            }
            _ => Step::Skipped,
        })
    }
}

impl Daemon for DoCancelingJob {
    fn name(&self) -> &'static str {
        "do-canceling-job"
    }

    fn run_once(&self, now: DateTime<Utc>) -> Result<BatchReport, DaemonError> {
        let candidates = self
            .store
            .find_by_status(&[JobStatus::Canceling], Page::first(self.batch_size))
            .map_err(DaemonError::Fetch)?;

        let mut report = BatchReport::default();
        for job in candidates {
            report.scanned += 1;
            let step = if self.timed_out(&job, now) {
                self.give_up(&job, now)
            } else {
                self.request_stop(&job)
            };
            report.record(step.unwrap_or_else(|err| {
                warn!(job_id = %job.id, error = %err, "canceling step failed");
                Step::Failed
            }));
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::FakeGateway;
    use crate::store::InMemoryJobStore;
    use taskfleet_core::{NewJob, RunMode};
    use taskfleet_events::InMemoryEventBus;

    struct Fixture {
        store: Arc<InMemoryJobStore>,
        cluster: Arc<FakeGateway>,
        daemon: DoCancelingJob,
    }

    fn fixture() -> Fixture {
        let store = InMemoryJobStore::arc();
        let cluster = Arc::new(FakeGateway::new(RunMode::Cluster));
        let gateways =
            ExecutorGateways::new(Arc::new(FakeGateway::new(RunMode::Process)), cluster.clone());
        let daemon = DoCancelingJob::new(
            store.clone(),
            gateways,
            Arc::new(InMemoryEventBus::<SchedulerEnvelope>::new()),
            Duration::minutes(10),
            10,
        );
        Fixture {
            store,
            cluster,
            daemon,
        }
    }

    fn canceling_job(f: &Fixture, canceled_at: DateTime<Utc>) -> Job {
        let job = f.store.insert(NewJob::new("t", RunMode::Cluster), canceled_at).unwrap();
        let identifier = f.cluster.identifier_for(job.id, 1);
        transition(f.store.as_ref(), job.id, &[JobStatus::Preparing], |row| {
            row.job_mut().mark_started(identifier, None, canceled_at)?;
            Ok(RowDecision::Commit)
        })
        .unwrap();
        let result = transition(f.store.as_ref(), job.id, &[JobStatus::Running], |row| {
            row.job_mut().mark_canceling(canceled_at)?;
            Ok(RowDecision::Commit)
        })
        .unwrap();
        match result {
            Transition::Applied(job) => job,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn stop_is_requested_without_state_change() {
        let f = fixture();
        let now = Utc::now();
        let job = canceling_job(&f, now);

        let report = f.daemon.run_once(now).unwrap();

        assert_eq!(report.advanced, 1);
        assert_eq!(f.cluster.stops().len(), 1);
        assert_eq!(f.store.get(job.id).unwrap().unwrap().status, JobStatus::Canceling);
    }

    #[test]
    fn cancel_timeout_moves_job_to_canceled() {
        let f = fixture();
        let now = Utc::now();
        let job = canceling_job(&f, now - Duration::minutes(11));

        f.daemon.run_once(now).unwrap();

        let stored = f.store.get(job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Canceled);
        assert_eq!(stored.description.as_deref(), Some("cancel timeout"));
        assert!(f.cluster.stops().is_empty());
        assert!(stored.needs_executor_teardown());
    }
}
