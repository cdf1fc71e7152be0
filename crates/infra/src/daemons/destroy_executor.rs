//! Tear down executors of finished jobs, and executors superseded by a retry.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use taskfleet_core::{Job, JobStatus};

use super::{BatchReport, Daemon, DaemonError, Step};
use crate::gateway::{ExecutorGateways, ExecutorHandle, GatewayError};
use crate::store::{
    JobStore, Page, PendingTeardown, RowDecision, StoreError, Transition, transition,
};

const TERMINAL: [JobStatus; 3] = [JobStatus::Done, JobStatus::Failed, JobStatus::Canceled];

pub struct DestroyExecutorJob {
    store: Arc<dyn JobStore>,
    gateways: ExecutorGateways,
    batch_size: usize,
}

impl DestroyExecutorJob {
    pub fn new(store: Arc<dyn JobStore>, gateways: ExecutorGateways, batch_size: usize) -> Self {
        Self {
            store,
            gateways,
            batch_size,
        }
    }

    fn destroy(&self, job: &Job, now: DateTime<Utc>) -> Result<Step, StoreError> {
        let mut failure = None;

        let result = transition(self.store.as_ref(), job.id, &TERMINAL, |row| {
            if !row.job().needs_executor_teardown() {
                return Ok(RowDecision::Abort);
            }
            let Some(handle) = ExecutorHandle::of(row.job()) else {
                return Ok(RowDecision::Abort);
            };

            match self.gateways.for_identifier(&handle.identifier).destroy(&handle) {
                Ok(()) => {}
                Err(GatewayError::NotFound(_)) => {
                    debug!(job_id = %handle.job_id, "executor already gone");
                }
                Err(err) => {
                    failure = Some(err);
                    return Ok(RowDecision::Abort);
                }
            }
            row.job_mut().mark_executor_destroyed(now);
            Ok(RowDecision::Commit)
        })?;

        Ok(match (result, failure) {
            (Transition::Applied(job), _) => {
                info!(job_id = %job.id, "executor destroyed");
                Step::Advanced
            }
            (_, Some(GatewayError::NotOwned(identifier))) => {
                debug!(job_id = %job.id, executor = %identifier, "executor owned by another instance");
                Step::Skipped
            }
            (_, Some(err)) => {
                warn!(job_id = %job.id, error = %err, "executor destroy failed; will retry next cycle");
                Step::Failed
            }
            (_, None) => Step::Skipped,
        })
    }

    /// The job row has moved on to a newer executor; only the queue entry
    /// remembers this one.
    fn destroy_superseded(&self, pending: &PendingTeardown) -> Result<Step, StoreError> {
        let handle = ExecutorHandle {
            job_id: pending.job_id,
            identifier: pending.executor_identifier.clone(),
            endpoint: None,
        };
        match self.gateways.for_identifier(&handle.identifier).destroy(&handle) {
            Ok(()) | Err(GatewayError::NotFound(_)) => {}
            Err(GatewayError::NotOwned(identifier)) => {
                debug!(job_id = %pending.job_id, executor = %identifier, "executor owned by another instance");
                return Ok(Step::Skipped);
            }
            Err(err) => {
                warn!(job_id = %pending.job_id, error = %err, "superseded executor destroy failed; will retry next cycle");
                return Ok(Step::Failed);
            }
        }

        self.store.complete_teardown(pending.job_id, &pending.executor_identifier)?;
        info!(job_id = %pending.job_id, executor = %pending.executor_identifier, "superseded executor destroyed");
        Ok(Step::Advanced)
    }
}

impl Daemon for DestroyExecutorJob {
    fn name(&self) -> &'static str {
        "destroy-executor-job"
    }

    fn run_once(&self, now: DateTime<Utc>) -> Result<BatchReport, DaemonError> {
        let candidates = self
            .store
            .find_executor_teardown(Page::first(self.batch_size))
            .map_err(DaemonError::Fetch)?;

        let mut report = BatchReport::default();
        for job in candidates {
            report.scanned += 1;
            let step = self.destroy(&job, now).unwrap_or_else(|err| {
                warn!(job_id = %job.id, error = %err, "executor teardown failed");
                Step::Failed
            });
            report.record(step);
        }

        let superseded = self
            .store
            .find_pending_teardowns(Page::first(self.batch_size))
            .map_err(DaemonError::Fetch)?;
        for pending in superseded {
            report.scanned += 1;
            let step = self.destroy_superseded(&pending).unwrap_or_else(|err| {
                warn!(job_id = %pending.job_id, error = %err, "executor teardown failed");
                Step::Failed
            });
            report.record(step);
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

    struct Fixture {
        store: Arc<InMemoryJobStore>,
        process: Arc<FakeGateway>,
        daemon: DestroyExecutorJob,
    }

    fn fixture() -> Fixture {
        let store = InMemoryJobStore::arc();
        let process = Arc::new(FakeGateway::new(RunMode::Process));
        let gateways =
            ExecutorGateways::new(process.clone(), Arc::new(FakeGateway::new(RunMode::Cluster)));
        let daemon = DestroyExecutorJob::new(store.clone(), gateways, 10);
        Fixture {
            store,
            process,
            daemon,
        }
    }

    fn finished_job(f: &Fixture, status: JobStatus) -> Job {
        let job = f.store.insert(NewJob::new("t", RunMode::Process), Utc::now()).unwrap();
        let identifier = f.process.identifier_for(job.id, 1);
        transition(f.store.as_ref(), job.id, &[JobStatus::Preparing], |row| {
            row.job_mut().mark_started(identifier, None, Utc::now())?;
            Ok(RowDecision::Commit)
        })
        .unwrap();
        match transition(f.store.as_ref(), job.id, &[JobStatus::Running], |row| {
            row.job_mut().finish(status, "done", Utc::now())?;
            Ok(RowDecision::Commit)
        })
        .unwrap()
        {
            Transition::Applied(job) => job,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn destroys_once_and_records_time() {
        let f = fixture();
        let job = finished_job(&f, JobStatus::Done);

        let first = f.daemon.run_once(Utc::now()).unwrap();
        let second = f.daemon.run_once(Utc::now()).unwrap();

        assert_eq!(first.advanced, 1);
        assert_eq!(second.scanned, 0);
        assert_eq!(f.process.destroys().len(), 1);
        let stored = f.store.get(job.id).unwrap().unwrap();
        assert!(stored.executor_destroyed_time.is_some());
        assert!(stored.executor_identifier.is_some());
    }

    #[test]
    fn not_found_counts_as_destroyed() {
        let f = fixture();
        let job = finished_job(&f, JobStatus::Failed);
        f.process
            .fail_destroys_with(Some(GatewayError::NotFound(f.process.identifier_for(job.id, 1))));

        let report = f.daemon.run_once(Utc::now()).unwrap();

        assert_eq!(report.advanced, 1);
        assert!(f.store.get(job.id).unwrap().unwrap().executor_destroyed_time.is_some());
    }

    #[test]
    fn dispatch_failure_is_retried_next_cycle() {
        let f = fixture();
        let job = finished_job(&f, JobStatus::Canceled);
        f.process
            .fail_destroys_with(Some(GatewayError::Dispatch("boom".into())));

        let report = f.daemon.run_once(Utc::now()).unwrap();
        assert_eq!(report.failed, 1);
        assert!(f.store.get(job.id).unwrap().unwrap().executor_destroyed_time.is_none());

        f.process.fail_destroys_with(None);
        let report = f.daemon.run_once(Utc::now()).unwrap();
        assert_eq!(report.advanced, 1);
        assert_eq!(f.process.destroys().len(), 2);
    }

    /// Job whose first executor was replaced by a second attempt.
    fn redispatched_job(f: &Fixture) -> Job {
        let job = f.store.insert(NewJob::new("t", RunMode::Process), Utc::now()).unwrap();
        let first = f.process.identifier_for(job.id, 1);
        transition(f.store.as_ref(), job.id, &[JobStatus::Preparing], |row| {
            row.job_mut().mark_started(first, None, Utc::now())?;
            Ok(RowDecision::Commit)
        })
        .unwrap();
        transition(f.store.as_ref(), job.id, &[JobStatus::Running], |row| {
            row.job_mut().mark_retrying("heartbeat timeout, retrying")?;
            row.request_teardown(Utc::now());
            Ok(RowDecision::Commit)
        })
        .unwrap();
        let second = f.process.identifier_for(job.id, 2);
        match transition(f.store.as_ref(), job.id, &[JobStatus::Retrying], |row| {
            row.job_mut().mark_started(second, None, Utc::now())?;
            Ok(RowDecision::Commit)
        })
        .unwrap()
        {
            Transition::Applied(job) => job,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn superseded_executor_is_destroyed_without_any_event() {
        let f = fixture();
        let job = redispatched_job(&f);

        let report = f.daemon.run_once(Utc::now()).unwrap();

        assert_eq!(report.advanced, 1);
        let destroyed: Vec<_> = f.process.destroys().into_iter().map(|h| h.identifier).collect();
        assert_eq!(destroyed, vec![f.process.identifier_for(job.id, 1)]);
        assert!(f.store.find_pending_teardowns(Page::first(10)).unwrap().is_empty());
        assert_eq!(
            f.store.get(job.id).unwrap().unwrap().executor_identifier,
            Some(f.process.identifier_for(job.id, 2))
        );

        assert_eq!(f.daemon.run_once(Utc::now()).unwrap().scanned, 0);
    }

    #[test]
    fn failed_superseded_destroy_stays_queued() {
        let f = fixture();
        let job = redispatched_job(&f);
        f.process
            .fail_destroys_with(Some(GatewayError::Dispatch("boom".into())));

        assert_eq!(f.daemon.run_once(Utc::now()).unwrap().failed, 1);
        f.process
            .fail_destroys_with(Some(GatewayError::NotOwned(f.process.identifier_for(job.id, 1))));
        assert_eq!(f.daemon.run_once(Utc::now()).unwrap().skipped, 1);
        assert_eq!(f.store.find_pending_teardowns(Page::first(10)).unwrap().len(), 1);

        f.process.fail_destroys_with(None);
        assert_eq!(f.daemon.run_once(Utc::now()).unwrap().advanced, 1);
        assert!(f.store.find_pending_teardowns(Page::first(10)).unwrap().is_empty());
    }

    #[test]
    fn foreign_executor_is_left_for_its_owner() {
        let f = fixture();
        let job = finished_job(&f, JobStatus::Done);
        f.process
            .fail_destroys_with(Some(GatewayError::NotOwned(f.process.identifier_for(job.id, 1))));

        let report = f.daemon.run_once(Utc::now()).unwrap();

        assert_eq!(report.skipped, 1);
        assert!(f.store.get(job.id).unwrap().unwrap().executor_destroyed_time.is_none());
    }
}
