//! Dispatch PREPARING and RETRYING jobs; cancel the ones that expired waiting.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use taskfleet_core::{HeartbeatPolicy, Job, JobStatus};
use taskfleet_events::{EventBus, SchedulerEnvelope, SchedulerEvent};

use super::{BatchReport, Daemon, DaemonError, Step};
use crate::admission::{Admission, AdmissionGate};
use crate::gateway::{ExecutorGateways, ExecutorHandle, JobContext};
use crate::store::{JobStore, Page, RowDecision, StoreError, Transition, transition};

const PENDING: [JobStatus; 2] = [JobStatus::Preparing, JobStatus::Retrying];

pub struct StartPreparingJob {
    store: Arc<dyn JobStore>,
    gateways: ExecutorGateways,
    admission: Arc<AdmissionGate>,
    bus: Arc<dyn EventBus<SchedulerEnvelope>>,
    batch_size: usize,
}

enum Row {
    Step(Step),
    /// Admission denied: stop the batch.
    Denied(Admission),
}

impl StartPreparingJob {
    pub fn new(
        store: Arc<dyn JobStore>,
        gateways: ExecutorGateways,
        admission: Arc<AdmissionGate>,
        bus: Arc<dyn EventBus<SchedulerEnvelope>>,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            gateways,
            admission,
            bus,
            batch_size,
        }
    }

    fn expire(&self, job: &Job, now: DateTime<Utc>) -> Result<Step, StoreError> {
        let result = transition(self.store.as_ref(), job.id, &PENDING, |row| {
            // Re-check under the lock; the row may have been re-created meanwhile.
            if !HeartbeatPolicy::is_expired(row.job(), now) {
                return Ok(RowDecision::Abort);
            }
            row.job_mut().finish(JobStatus::Canceled, "expired", now)?;
            Ok(RowDecision::Commit)
        })?;

        match result {
            Transition::Applied(job) => {
                info!(job_id = %job.id, "job expired before it could start");
                let event = SchedulerEvent::JobTerminated {
                    status: job.status,
                    description: job.description.clone(),
                };
                if let Err(err) = self.bus.publish(SchedulerEnvelope::wrap(job.id, now, event)) {
                    warn!(job_id = %job.id, error = %err, "failed to publish scheduler event");
                }
                Ok(Step::Advanced)
            }
            _ => Ok(Step::Skipped),
        }
    }

    fn dispatch(&self, job: &Job, now: DateTime<Utc>) -> Result<Row, DaemonError> {
        let admission = self
            .admission
            .try_admit(job.run_mode)
            .map_err(DaemonError::Admission)?;
        if !admission.is_granted() {
            return Ok(Row::Denied(admission));
        }

        let gateway = self.gateways.for_mode(job.run_mode);
        let mut dispatch_error = None;
        let mut started_identifier = None;

        let result = transition(self.store.as_ref(), job.id, &PENDING, |row| {
            let context = JobContext::for_next_attempt(row.job());
            match gateway.start(&context) {
                Ok(started) => {
                    started_identifier = Some(started.identifier.clone());
                    row.job_mut()
                        .mark_started(started.identifier, started.endpoint, now)?;
                    Ok(RowDecision::Commit)
                }
                Err(err) => {
                    dispatch_error = Some(err);
                    Ok(RowDecision::Abort)
                }
            }
        });

        if !matches!(result, Ok(Transition::Applied(_))) {
            self.admission.refund();
        }

        let step = match result {
            Ok(Transition::Applied(job)) => {
                info!(
                    job_id = %job.id,
                    run_mode = %job.run_mode,
                    attempt = job.execution_times,
                    executor = ?job.executor_identifier.as_ref().map(ToString::to_string),
                    "job dispatched"
                );
                Step::Advanced
            }
            Ok(Transition::Skipped(_)) => match dispatch_error {
                Some(err) => {
                    warn!(job_id = %job.id, error = %err, "dispatch failed; will retry next cycle");
                    Step::Failed
                }
                None => Step::Skipped,
            },
            Ok(Transition::Stale { current }) => {
                debug!(job_id = %job.id, current = %current, "job no longer pending");
                Step::Skipped
            }
            Ok(Transition::Missing) => Step::Skipped,
            Err(err) => {
                warn!(job_id = %job.id, error = %err, "failed to record dispatch");
                // The executor is running but no row points at it.
                if let Some(identifier) = started_identifier {
                    let handle = ExecutorHandle {
                        job_id: job.id,
                        identifier,
                        endpoint: None,
                    };
                    if let Err(err) = gateway.destroy(&handle) {
                        warn!(job_id = %job.id, executor = %handle.identifier, error = %err, "failed to destroy unrecorded executor");
                    }
                }
                Step::Failed
            }
        };
        Ok(Row::Step(step))
    }
}

impl Daemon for StartPreparingJob {
    fn name(&self) -> &'static str {
        "start-preparing-job"
    }

    fn run_once(&self, now: DateTime<Utc>) -> Result<BatchReport, DaemonError> {
        let candidates = self
            .store
            .find_by_status(&PENDING, Page::first(self.batch_size))
            .map_err(DaemonError::Fetch)?;

        let mut report = BatchReport::default();
        for job in candidates {
            report.scanned += 1;

            if HeartbeatPolicy::is_expired(&job, now) {
                let step = self.expire(&job, now).unwrap_or_else(|err| {
                    warn!(job_id = %job.id, error = %err, "failed to expire job");
                    Step::Failed
                });
                report.record(step);
                continue;
            }

            match self.dispatch(&job, now)? {
                Row::Step(step) => report.record(step),
                Row::Denied(admission) => {
                    debug!(job_id = %job.id, admission = ?admission, "admission denied; ending batch");
                    report.skipped += 1;
                    break;
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::FakeGateway;
    use crate::store::InMemoryJobStore;
    use chrono::Duration;
    use taskfleet_core::{JobProperties, NewJob, RunMode};
    use taskfleet_events::InMemoryEventBus;

    struct Fixture {
        store: Arc<InMemoryJobStore>,
        process: Arc<FakeGateway>,
        cluster: Arc<FakeGateway>,
        daemon: StartPreparingJob,
    }

    fn fixture(threshold: usize, burst: u32) -> Fixture {
        let store = InMemoryJobStore::arc();
        let process = Arc::new(FakeGateway::new(RunMode::Process));
        let cluster = Arc::new(FakeGateway::new(RunMode::Cluster));
        let gateways = ExecutorGateways::new(process.clone(), cluster.clone());
        let admission = Arc::new(AdmissionGate::new(store.clone(), threshold, 0.0, burst));
        let bus = Arc::new(InMemoryEventBus::<SchedulerEnvelope>::new());
        let daemon = StartPreparingJob::new(store.clone(), gateways, admission, bus, 10);
        Fixture {
            store,
            process,
            cluster,
            daemon,
        }
    }

    #[test]
    fn dispatches_through_the_run_mode_gateway() {
        let f = fixture(10, 10);
        let now = Utc::now();
        let p = f.store.insert(NewJob::new("a", RunMode::Process), now).unwrap();
        let c = f.store.insert(NewJob::new("b", RunMode::Cluster), now).unwrap();

        let report = f.daemon.run_once(now).unwrap();

        assert_eq!(report.advanced, 2);
        assert_eq!(f.process.starts()[0].job_id, p.id);
        assert_eq!(f.cluster.starts()[0].job_id, c.id);

        let p = f.store.get(p.id).unwrap().unwrap();
        assert_eq!(p.status, JobStatus::Running);
        assert_eq!(p.execution_times, 1);
        assert!(p.executor_endpoint.is_some());
        let c = f.store.get(c.id).unwrap().unwrap();
        assert_eq!(c.executor_endpoint, None);
    }

    #[test]
    fn expired_job_is_canceled_without_gateway_call() {
        let f = fixture(10, 10);
        let now = Utc::now();
        let job = f
            .store
            .insert(
                NewJob::new("a", RunMode::Process)
                    .properties(JobProperties::default().expiring_after(60))
                    .created_at(now - Duration::seconds(61)),
                now,
            )
            .unwrap();

        let report = f.daemon.run_once(now).unwrap();

        assert_eq!(report.advanced, 1);
        assert!(f.process.starts().is_empty());
        let stored = f.store.get(job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Canceled);
        assert_eq!(stored.description.as_deref(), Some("expired"));
    }

    #[test]
    fn dispatch_failure_leaves_job_pending() {
        let f = fixture(10, 10);
        let job = f.store.insert(NewJob::new("a", RunMode::Process), Utc::now()).unwrap();
        f.process.fail_starts(true);

        let report = f.daemon.run_once(Utc::now()).unwrap();

        assert_eq!(report.failed, 1);
        let stored = f.store.get(job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Preparing);
        assert_eq!(stored.execution_times, 0);
    }

    #[test]
    fn admission_denial_ends_the_batch() {
        let f = fixture(10, 1);
        let now = Utc::now();
        for minutes in [3, 2, 1] {
            f.store
                .insert(
                    NewJob::new("a", RunMode::Process).created_at(now - Duration::minutes(minutes)),
                    now,
                )
                .unwrap();
        }

        let report = f.daemon.run_once(now).unwrap();

        assert_eq!(report.advanced, 1);
        assert_eq!(report.scanned, 2);
        assert_eq!(f.process.starts().len(), 1);
        assert_eq!(
            f.store.find_by_status(&PENDING, Page::first(10)).unwrap().len(),
            2
        );
    }

    #[test]
    fn failed_dispatch_returns_the_admission_token() {
        let f = fixture(10, 1);
        let job = f.store.insert(NewJob::new("a", RunMode::Process), Utc::now()).unwrap();
        f.process.fail_starts(true);

        assert_eq!(f.daemon.run_once(Utc::now()).unwrap().failed, 1);

        // Refill rate is zero, so this only dispatches if the token came back.
        f.process.fail_starts(false);
        let report = f.daemon.run_once(Utc::now()).unwrap();
        assert_eq!(report.advanced, 1);
        assert_eq!(f.store.get(job.id).unwrap().unwrap().status, JobStatus::Running);
    }

    #[test]
    fn unrecorded_executor_is_destroyed() {
        let f = fixture(10, 10);
        let job = f.store.insert(NewJob::new("a", RunMode::Cluster), Utc::now()).unwrap();
        f.store.refuse_commits(true);

        let report = f.daemon.run_once(Utc::now()).unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(f.cluster.starts().len(), 1);
        let destroys = f.cluster.destroys();
        assert_eq!(destroys.len(), 1);
        assert_eq!(destroys[0].identifier, f.cluster.identifier_for(job.id, 1));
        let stored = f.store.get(job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Preparing);
        assert_eq!(stored.executor_identifier, None);
    }

    #[test]
    fn retrying_job_is_redispatched_with_next_attempt() {
        let f = fixture(10, 10);
        let job = f.store.insert(NewJob::new("a", RunMode::Cluster), Utc::now()).unwrap();
        f.daemon.run_once(Utc::now()).unwrap();
        transition(f.store.as_ref(), job.id, &[JobStatus::Running], |row| {
            row.job_mut().mark_retrying("heartbeat timeout, retrying")?;
            Ok(RowDecision::Commit)
        })
        .unwrap();

        f.daemon.run_once(Utc::now()).unwrap();

        let starts = f.cluster.starts();
        assert_eq!(starts.len(), 2);
        assert_eq!(starts[1].attempt, 2);
        let stored = f.store.get(job.id).unwrap().unwrap();
        assert_eq!(stored.execution_times, 2);
        assert_eq!(
            stored.executor_identifier,
            Some(f.cluster.identifier_for(job.id, 2))
        );
    }
}
