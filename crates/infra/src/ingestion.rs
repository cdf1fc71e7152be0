//! Result Ingestion: apply an executor report to its job.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use taskfleet_core::{Job, JobStatus, TaskResult};
use taskfleet_events::{EventBus, SchedulerEnvelope, SchedulerEvent};

use crate::store::{JobStore, RowDecision, StoreError, Transition, transition};

#[derive(Debug, Clone, PartialEq)]
pub enum Ingested {
    /// Only the heartbeat moved.
    HeartbeatOnly,
    Progressed,
    Terminated(JobStatus),
    /// The job left the state it was observed in before the report was applied.
    Stale,
}

pub struct ResultIngestion {
    store: Arc<dyn JobStore>,
    bus: Arc<dyn EventBus<SchedulerEnvelope>>,
}

impl ResultIngestion {
    pub fn new(store: Arc<dyn JobStore>, bus: Arc<dyn EventBus<SchedulerEnvelope>>) -> Self {
        Self { store, bus }
    }

    /// Apply `report` to `job`, guarded by the status and executor `job` was
    /// observed with. A report from an executor the row has since replaced is
    /// `Stale`.
    pub fn apply(
        &self,
        job: &Job,
        report: &TaskResult,
        now: DateTime<Utc>,
    ) -> Result<Ingested, StoreError> {
        let observed = job.status;
        let mut ingested = Ingested::HeartbeatOnly;

        let result = transition(self.store.as_ref(), job.id, &[observed], |row| {
            if row.job().executor_identifier != job.executor_identifier {
                return Ok(RowDecision::Abort);
            }
            let job = row.job_mut();
            job.heartbeat_time = Some(now);

            if report.is_terminal() {
                if let Some(target) = observed.after_terminal_report(report.status) {
                    job.progress_percentage = report.progress_percentage;
                    job.result_json = report.result_json.clone();
                    let description = match observed {
                        JobStatus::Canceling => "canceled by request".to_string(),
                        _ => format!("executor reported {target}"),
                    };
                    job.finish(target, description, now)?;
                    for (key, value) in &report.log_attributes {
                        row.add_attribute(key.clone(), value.clone());
                    }
                    ingested = Ingested::Terminated(target);
                    return Ok(RowDecision::Commit);
                }
            }

            let changed = job.progress_percentage != report.progress_percentage
                || job.result_json != report.result_json;
            if changed {
                job.progress_percentage = report.progress_percentage;
                job.result_json = report.result_json.clone();
                ingested = Ingested::Progressed;
            }
            Ok(RowDecision::Commit)
        })?;

        let committed = match result {
            Transition::Applied(job) => job,
            Transition::Stale { current } => {
                debug!(job_id = %job.id, observed = %observed, current = %current, "report for a job that moved on");
                return Ok(Ingested::Stale);
            }
            Transition::Skipped(_) => {
                debug!(job_id = %job.id, "report from a superseded executor");
                return Ok(Ingested::Stale);
            }
            Transition::Missing => return Ok(Ingested::Stale),
        };

        match &ingested {
            Ingested::Progressed => {
                self.publish(&committed, report, now);
            }
            Ingested::Terminated(status) => {
                info!(job_id = %committed.id, status = %status, "job finished");
                self.publish(&committed, report, now);
                self.publish_event(
                    &committed,
                    now,
                    SchedulerEvent::JobTerminated {
                        status: *status,
                        description: committed.description.clone(),
                    },
                );
            }
            Ingested::HeartbeatOnly | Ingested::Stale => {}
        }
        Ok(ingested)
    }

    fn publish(&self, job: &Job, report: &TaskResult, now: DateTime<Utc>) {
        self.publish_event(
            job,
            now,
            SchedulerEvent::TaskResultUploaded {
                outcome: report.status,
                progress_percentage: report.progress_percentage,
            },
        );
    }

    fn publish_event(&self, job: &Job, now: DateTime<Utc>, event: SchedulerEvent) {
        let kind = event.kind();
        if let Err(err) = self.bus.publish(SchedulerEnvelope::wrap(job.id, now, event)) {
            warn!(job_id = %job.id, event = kind, error = %err, "failed to publish scheduler event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryJobStore;
    use taskfleet_core::{NewJob, RunMode, TaskOutcome};
    use taskfleet_events::InMemoryEventBus;

    struct Fixture {
        store: Arc<InMemoryJobStore>,
        bus: Arc<InMemoryEventBus<SchedulerEnvelope>>,
        ingestion: ResultIngestion,
    }

    fn fixture() -> Fixture {
        let store = InMemoryJobStore::arc();
        let bus = Arc::new(InMemoryEventBus::<SchedulerEnvelope>::new());
        let ingestion = ResultIngestion::new(store.clone(), bus.clone());
        Fixture {
            store,
            bus,
            ingestion,
        }
    }

    fn running_job(store: &InMemoryJobStore) -> Job {
        let job = store.insert(NewJob::new("t", RunMode::Cluster), Utc::now()).unwrap();
        match transition(store, job.id, &[JobStatus::Preparing], |row| {
            let identifier = "cluster://a/b/c/d".parse().unwrap();
            row.job_mut().mark_started(identifier, None, Utc::now())?;
            Ok(RowDecision::Commit)
        })
        .unwrap()
        {
            Transition::Applied(job) => job,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unchanged_report_only_refreshes_heartbeat() {
        let f = fixture();
        let events = f.bus.subscribe();
        let job = running_job(&f.store);
        let now = Utc::now();

        let outcome = f.ingestion.apply(&job, &TaskResult::running(0.0), now).unwrap();

        assert_eq!(outcome, Ingested::HeartbeatOnly);
        assert_eq!(f.store.get(job.id).unwrap().unwrap().heartbeat_time, Some(now));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn progress_is_written_and_published() {
        let f = fixture();
        let events = f.bus.subscribe();
        let job = running_job(&f.store);

        let outcome = f.ingestion.apply(&job, &TaskResult::running(55.0), Utc::now()).unwrap();

        assert_eq!(outcome, Ingested::Progressed);
        assert_eq!(f.store.get(job.id).unwrap().unwrap().progress_percentage, 55.0);
        assert_eq!(events.try_recv().unwrap().payload().kind(), "task_result_uploaded");
    }

    #[test]
    fn terminal_report_finishes_job_with_attributes() {
        let f = fixture();
        let events = f.bus.subscribe();
        let job = running_job(&f.store);
        let report = TaskResult::finished(TaskOutcome::Failed, None)
            .with_log_attribute("log_path", "/logs/1.log");

        let outcome = f.ingestion.apply(&job, &report, Utc::now()).unwrap();

        assert_eq!(outcome, Ingested::Terminated(JobStatus::Failed));
        let stored = f.store.get(job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.finished_time.is_some());
        assert_eq!(f.store.attributes(job.id).unwrap()[0].key, "log_path");

        let kinds: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.payload().kind())
            .collect();
        assert_eq!(kinds, vec!["task_result_uploaded", "job_terminated"]);
    }

    #[test]
    fn canceling_job_ends_canceled_whatever_the_outcome() {
        let f = fixture();
        let job = running_job(&f.store);
        let canceling = match transition(f.store.as_ref(), job.id, &[JobStatus::Running], |row| {
            row.job_mut().mark_canceling(Utc::now())?;
            Ok(RowDecision::Commit)
        })
        .unwrap()
        {
            Transition::Applied(job) => job,
            other => panic!("unexpected {other:?}"),
        };

        let report = TaskResult::finished(TaskOutcome::Done, Some("{}".into()));
        let outcome = f.ingestion.apply(&canceling, &report, Utc::now()).unwrap();

        assert_eq!(outcome, Ingested::Terminated(JobStatus::Canceled));
    }

    #[test]
    fn report_for_moved_job_is_stale() {
        let f = fixture();
        let job = running_job(&f.store);
        f.ingestion
            .apply(&job, &TaskResult::finished(TaskOutcome::Done, None), Utc::now())
            .unwrap();

        let again = f
            .ingestion
            .apply(&job, &TaskResult::finished(TaskOutcome::Done, None), Utc::now())
            .unwrap();
        assert_eq!(again, Ingested::Stale);
    }

    #[test]
    fn report_from_superseded_attempt_leaves_new_attempt_running() {
        let f = fixture();
        let first = running_job(&f.store);
        transition(f.store.as_ref(), first.id, &[JobStatus::Running], |row| {
            row.job_mut().mark_retrying("heartbeat timeout, retrying")?;
            Ok(RowDecision::Commit)
        })
        .unwrap();
        transition(f.store.as_ref(), first.id, &[JobStatus::Retrying], |row| {
            let identifier = "cluster://a/b/c/e".parse().unwrap();
            row.job_mut().mark_started(identifier, None, Utc::now())?;
            Ok(RowDecision::Commit)
        })
        .unwrap();

        let outcome = f
            .ingestion
            .apply(&first, &TaskResult::finished(TaskOutcome::Failed, None), Utc::now())
            .unwrap();

        assert_eq!(outcome, Ingested::Stale);
        let stored = f.store.get(first.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Running);
        assert_eq!(stored.heartbeat_time, None);
        assert_eq!(
            stored.executor_identifier.map(|i| i.to_string()).as_deref(),
            Some("cluster://a/b/c/e")
        );
    }
}
