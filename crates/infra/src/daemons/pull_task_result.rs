//! Poll executors of live jobs and feed their reports to Result Ingestion.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use taskfleet_core::{Job, JobStatus};

use super::{BatchReport, Daemon, DaemonError, Step};
use crate::client::{ClientError, TaskExecutorClient};
use crate::gateway::{ExecutorGateways, ExecutorHandle};
use crate::ingestion::{Ingested, ResultIngestion};
use crate::store::{JobStore, Page, RowDecision, StoreError, Transition, transition};

const LIVE: [JobStatus; 2] = [JobStatus::Running, JobStatus::Canceling];

pub struct PullTaskResultJob {
    store: Arc<dyn JobStore>,
    gateways: ExecutorGateways,
    client: Arc<dyn TaskExecutorClient>,
    ingestion: Arc<ResultIngestion>,
    batch_size: usize,
}

impl PullTaskResultJob {
    pub fn new(
        store: Arc<dyn JobStore>,
        gateways: ExecutorGateways,
        client: Arc<dyn TaskExecutorClient>,
        ingestion: Arc<ResultIngestion>,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            gateways,
            client,
            ingestion,
            batch_size,
        }
    }

    /// Endpoint for `job`, resolving and caching it on the row if needed.
    /// `Ok(None)` while the executor cannot be reached yet.
    fn endpoint(&self, job: &mut Job, handle: &ExecutorHandle) -> Result<Option<String>, StoreError> {
        if let Some(endpoint) = &handle.endpoint {
            return Ok(Some(endpoint.clone()));
        }

        let resolved = match self
            .gateways
            .for_identifier(&handle.identifier)
            .resolve_endpoint(&handle.identifier)
        {
            Ok(Some(endpoint)) => endpoint,
            Ok(None) => return Ok(None),
            Err(err) => {
                debug!(job_id = %job.id, error = %err, "executor endpoint not resolvable yet");
                return Ok(None);
            }
        };

        let result = transition(self.store.as_ref(), job.id, &[job.status], |row| {
            if row.job().executor_identifier.as_ref() != Some(&handle.identifier) {
                return Ok(RowDecision::Abort);
            }
            row.job_mut().executor_endpoint = Some(resolved.clone());
            Ok(RowDecision::Commit)
        })?;

        match result {
            Transition::Applied(updated) => {
                debug!(job_id = %updated.id, endpoint = %resolved, "executor endpoint cached");
                *job = updated;
                Ok(Some(resolved))
            }
            _ => Ok(None),
        }
    }

    fn pull(&self, mut job: Job, now: DateTime<Utc>) -> Result<Step, StoreError> {
        let Some(handle) = ExecutorHandle::of(&job) else {
            return Ok(Step::Skipped);
        };
        let Some(endpoint) = self.endpoint(&mut job, &handle)? else {
            return Ok(Step::Skipped);
        };

        let report = match self.client.pull_result(&endpoint, job.id) {
            Ok(report) => report,
            Err(ClientError::Unreachable { message, .. }) => {
                debug!(job_id = %job.id, endpoint = %endpoint, error = %message, "executor unreachable");
                return Ok(Step::Skipped);
            }
            Err(err) => {
                warn!(job_id = %job.id, endpoint = %endpoint, error = %err, "failed to pull task result");
                return Ok(Step::Failed);
            }
        };

        Ok(match self.ingestion.apply(&job, &report, now)? {
            Ingested::Stale => Step::Skipped,
            Ingested::HeartbeatOnly | Ingested::Progressed | Ingested::Terminated(_) => Step::Advanced,
        })
    }
}

impl Daemon for PullTaskResultJob {
    fn name(&self) -> &'static str {
        "pull-task-result-job"
    }

    fn run_once(&self, now: DateTime<Utc>) -> Result<BatchReport, DaemonError> {
        let candidates = self
            .store
            .find_by_status(&LIVE, Page::first(self.batch_size))
            .map_err(DaemonError::Fetch)?;

        let mut report = BatchReport::default();
        for job in candidates {
            report.scanned += 1;
            let id = job.id;
            let step = self.pull(job, now).unwrap_or_else(|err| {
                warn!(job_id = %id, error = %err, "result ingestion failed");
                Step::Failed
            });
            report.record(step);
        }
        Ok(report)
    }
}
