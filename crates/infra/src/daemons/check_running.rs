//! Heartbeat watchdog for RUNNING jobs.
//!
//! A stale job always gets its executor destroyed. The event lets the reaper
//! act at once; a requeued job also records the executor as a pending
//! teardown in the same commit, which `DestroyExecutorJob` drains if the event
//! is lost. A canceled job is torn down through the terminal-row scan.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use taskfleet_core::{HeartbeatPolicy, Job, JobStatus, RetryDecision, RetryDefaults, RetryPolicy};
use taskfleet_events::{EventBus, SchedulerEnvelope, SchedulerEvent};

use super::{BatchReport, Daemon, DaemonError, Step};
use crate::store::{JobStore, Page, RowDecision, StoreError, Transition, transition};

pub const RETRYING_DESCRIPTION: &str = "heartbeat timeout, retrying";
pub const EXHAUSTED_DESCRIPTION: &str = "heartbeat timeout, retry exhausted";

pub struct CheckRunningJob {
    store: Arc<dyn JobStore>,
    bus: Arc<dyn EventBus<SchedulerEnvelope>>,
    heartbeat: HeartbeatPolicy,
    retry_defaults: RetryDefaults,
    batch_size: usize,
}

impl CheckRunningJob {
    pub fn new(
        store: Arc<dyn JobStore>,
        bus: Arc<dyn EventBus<SchedulerEnvelope>>,
        heartbeat: HeartbeatPolicy,
        retry_defaults: RetryDefaults,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            bus,
            heartbeat,
            retry_defaults,
            batch_size,
        }
    }

    fn publish(&self, job: &Job, now: DateTime<Utc>, event: SchedulerEvent) {
        let kind = event.kind();
        if let Err(err) = self.bus.publish(SchedulerEnvelope::wrap(job.id, now, event)) {
            warn!(job_id = %job.id, event = kind, error = %err, "failed to publish scheduler event");
        }
    }

    fn handle_stale(&self, job: &Job, now: DateTime<Utc>) -> Result<Step, StoreError> {
        if let Some(identifier) = &job.executor_identifier {
            self.publish(
                job,
                now,
                SchedulerEvent::ExecutorDestroyRequested {
                    run_mode: job.run_mode,
                    executor_identifier: identifier.clone(),
                    reason: "heartbeat timeout".to_string(),
                },
            );
        }

        let mut decision = None;
        let result = transition(self.store.as_ref(), job.id, &[JobStatus::Running], |row| {
            // A report may have landed between the scan and the lock.
            if !self.heartbeat.is_stale(row.job(), now) {
                return Ok(RowDecision::Abort);
            }
            let job = row.job_mut();
            let retry = RetryPolicy::decide(&job.job_properties, self.retry_defaults, job.execution_times);
            if retry.should_retry() {
                job.mark_retrying(RETRYING_DESCRIPTION)?;
                row.request_teardown(now);
            } else {
                job.finish(JobStatus::Canceled, EXHAUSTED_DESCRIPTION, now)?;
            }
            decision = Some(retry);
            Ok(RowDecision::Commit)
        })?;

        let Transition::Applied(updated) = result else {
            debug!(job_id = %job.id, "job no longer stale");
            return Ok(Step::Skipped);
        };

        match decision {
            Some(RetryDecision::Retry) => {
                info!(
                    job_id = %updated.id,
                    execution_times = updated.execution_times,
                    "heartbeat lost; job requeued"
                );
            }
            Some(other) => {
                info!(job_id = %updated.id, decision = ?other, "heartbeat lost; job canceled");
                self.publish(
                    &updated,
                    now,
                    SchedulerEvent::JobTerminated {
                        status: updated.status,
                        description: updated.description.clone(),
                    },
                );
            }
            None => {}
        }
        Ok(Step::Advanced)
    }
}

impl Daemon for CheckRunningJob {
    fn name(&self) -> &'static str {
        "check-running-job"
    }

    fn run_once(&self, now: DateTime<Utc>) -> Result<BatchReport, DaemonError> {
        let candidates = self
            .store
            .find_stale_running(self.heartbeat.stale_before(now), Page::first(self.batch_size))
            .map_err(DaemonError::Fetch)?;

        let mut report = BatchReport::default();
        for job in candidates {
            report.scanned += 1;
            let step = self.handle_stale(&job, now).unwrap_or_else(|err| {
                warn!(job_id = %job.id, error = %err, "heartbeat check failed");
                Step::Failed
            });
            report.record(step);
        }
        Ok(report)
    }
}
