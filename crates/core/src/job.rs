//! Job records and the field updates that accompany each lifecycle edge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::executor::ExecutorIdentifier;
use crate::id::JobId;
use crate::status::{JobStatus, RunMode};

/// Per-job scheduling knobs, persisted as `job_properties_json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobProperties {
    pub enable_retry_after_heart_timeout: bool,
    pub max_retry_times_after_heart_timeout: Option<u32>,
    pub expire_if_not_running_after_seconds: Option<u64>,
}

impl JobProperties {
    pub fn with_retry(max_retry_times: Option<u32>) -> Self {
        Self {
            enable_retry_after_heart_timeout: true,
            max_retry_times_after_heart_timeout: max_retry_times,
            ..Self::default()
        }
    }

    pub fn expiring_after(mut self, seconds: u64) -> Self {
        self.expire_if_not_running_after_seconds = Some(seconds);
        self
    }

    pub fn to_json(&self) -> DomainResult<String> {
        serde_json::to_string(self).map_err(|e| DomainError::malformed(e.to_string()))
    }

    /// Missing or empty column decodes to defaults.
    pub fn from_json(raw: Option<&str>) -> DomainResult<Self> {
        match raw.map(str::trim) {
            None | Some("") => Ok(Self::default()),
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| DomainError::malformed(format!("job_properties_json: {e}"))),
        }
    }
}

/// Append-only key/value metadata attached to a job on completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAttribute {
    pub job_id: JobId,
    pub key: String,
    pub value: String,
}

impl JobAttribute {
    pub fn new(job_id: JobId, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            job_id,
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A scheduled unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub run_mode: RunMode,
    pub job_type: String,
    pub job_parameters_json: Option<String>,
    pub executor_identifier: Option<ExecutorIdentifier>,
    pub executor_endpoint: Option<String>,
    pub execution_times: u32,
    pub progress_percentage: f64,
    pub result_json: Option<String>,
    pub job_properties: JobProperties,
    pub heartbeat_time: Option<DateTime<Utc>>,
    pub create_time: DateTime<Utc>,
    pub started_time: Option<DateTime<Utc>>,
    pub cancelling_time: Option<DateTime<Utc>>,
    pub finished_time: Option<DateTime<Utc>>,
    pub executor_destroyed_time: Option<DateTime<Utc>>,
    pub description: Option<String>,
    pub organization_id: Option<i64>,
}

impl Job {
    /// Successful dispatch: RUNNING with a fresh executor.
    pub fn mark_started(
        &mut self,
        identifier: ExecutorIdentifier,
        endpoint: Option<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.status.ensure_transition(JobStatus::Running)?;
        self.status = JobStatus::Running;
        self.executor_identifier = Some(identifier);
        self.executor_endpoint = endpoint;
        self.execution_times = self.execution_times.saturating_add(1);
        self.started_time = Some(now);
        self.heartbeat_time = None;
        self.executor_destroyed_time = None;
        self.description = None;
        Ok(())
    }

    /// Heartbeat lost but retry allowed: wait for the next dispatch.
    pub fn mark_retrying(&mut self, description: impl Into<String>) -> DomainResult<()> {
        self.status.ensure_transition(JobStatus::Retrying)?;
        self.status = JobStatus::Retrying;
        self.executor_endpoint = None;
        self.heartbeat_time = None;
        self.description = Some(description.into());
        Ok(())
    }

    pub fn mark_canceling(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.status.ensure_transition(JobStatus::Canceling)?;
        self.status = JobStatus::Canceling;
        self.cancelling_time = Some(now);
        Ok(())
    }

    /// Any edge into DONE, FAILED or CANCELED.
    pub fn finish(
        &mut self,
        status: JobStatus,
        description: impl Into<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        if !status.is_terminal() {
            return Err(DomainError::validation(format!("{status} is not a terminal status")));
        }
        self.status.ensure_transition(status)?;
        self.status = status;
        self.finished_time = Some(now);
        self.description = Some(description.into());
        Ok(())
    }

    /// Executor torn down; the identifier stays for audit.
    pub fn mark_executor_destroyed(&mut self, now: DateTime<Utc>) {
        self.executor_destroyed_time = Some(now);
    }

    pub fn needs_executor_teardown(&self) -> bool {
        self.status.is_terminal()
            && self.executor_identifier.is_some()
            && self.executor_destroyed_time.is_none()
    }
}

/// Submission request for a new job.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    job_type: String,
    run_mode: RunMode,
    job_parameters_json: Option<String>,
    job_properties: JobProperties,
    organization_id: Option<i64>,
    create_time: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, run_mode: RunMode) -> Self {
        Self {
            job_type: job_type.into(),
            run_mode,
            job_parameters_json: None,
            job_properties: JobProperties::default(),
            organization_id: None,
            create_time: None,
        }
    }

    pub fn parameters(mut self, json: impl Into<String>) -> Self {
        self.job_parameters_json = Some(json.into());
        self
    }

    pub fn properties(mut self, properties: JobProperties) -> Self {
        self.job_properties = properties;
        self
    }

    pub fn organization(mut self, organization_id: i64) -> Self {
        self.organization_id = Some(organization_id);
        self
    }

    /// Backdate the row (defaults to the store's clock).
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.create_time = Some(at);
        self
    }

    pub fn run_mode(&self) -> RunMode {
        self.run_mode
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.job_type.trim().is_empty() {
            return Err(DomainError::validation("job_type must not be empty"));
        }
        if let Some(raw) = &self.job_parameters_json {
            serde_json::from_str::<serde_json::Value>(raw)
                .map_err(|e| DomainError::validation(format!("job parameters are not JSON: {e}")))?;
        }
        Ok(())
    }

    /// Materialize the PREPARING row once the store has assigned an id.
    pub fn into_job(self, id: JobId, now: DateTime<Utc>) -> Job {
        Job {
            id,
            status: JobStatus::Preparing,
            run_mode: self.run_mode,
            job_type: self.job_type,
            job_parameters_json: self.job_parameters_json,
            executor_identifier: None,
            executor_endpoint: None,
            execution_times: 0,
            progress_percentage: 0.0,
            result_json: None,
            job_properties: self.job_properties,
            heartbeat_time: None,
            create_time: self.create_time.unwrap_or(now),
            started_time: None,
            cancelling_time: None,
            finished_time: None,
            executor_destroyed_time: None,
            description: None,
            organization_id: self.organization_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn preparing() -> Job {
        NewJob::new("sql-export", RunMode::Process).into_job(JobId::new(1), Utc::now())
    }

    fn process_id() -> ExecutorIdentifier {
        "process://localhost:4000/12/taskfleet-1".parse().unwrap()
    }

    #[test]
    fn start_increments_execution_times_and_resets_heartbeat() {
        let now = Utc::now();
        let mut job = preparing();
        job.heartbeat_time = Some(now - Duration::seconds(30));

        job.mark_started(process_id(), Some("http://localhost:4000".into()), now).unwrap();

        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.execution_times, 1);
        assert_eq!(job.started_time, Some(now));
        assert_eq!(job.heartbeat_time, None);
    }

    #[test]
    fn retry_clears_endpoint_but_keeps_identifier() {
        let now = Utc::now();
        let mut job = preparing();
        job.mark_started(process_id(), Some("http://localhost:4000".into()), now).unwrap();

        job.mark_retrying("heartbeat timeout, retrying").unwrap();

        assert_eq!(job.status, JobStatus::Retrying);
        assert_eq!(job.executor_endpoint, None);
        assert_eq!(job.executor_identifier, Some(process_id()));

        job.mark_started(process_id(), None, now).unwrap();
        assert_eq!(job.execution_times, 2);
    }

    #[test]
    fn finished_job_rejects_further_edges() {
        let now = Utc::now();
        let mut job = preparing();
        job.finish(JobStatus::Canceled, "expired", now).unwrap();

        assert!(job.mark_started(process_id(), None, now).is_err());
        assert!(job.finish(JobStatus::Done, "late", now).is_err());
        assert_eq!(job.status, JobStatus::Canceled);
    }

    #[test]
    fn finish_requires_terminal_target() {
        let mut job = preparing();
        assert!(matches!(
            job.finish(JobStatus::Running, "nope", Utc::now()),
            Err(DomainError::Validation(_))
        ));
    }

    #[test]
    fn properties_decode_with_defaults() {
        assert_eq!(JobProperties::from_json(None).unwrap(), JobProperties::default());
        let props = JobProperties::from_json(Some(r#"{"enable_retry_after_heart_timeout":true}"#)).unwrap();
        assert!(props.enable_retry_after_heart_timeout);
        assert_eq!(props.max_retry_times_after_heart_timeout, None);
        assert!(JobProperties::from_json(Some("{not json")).is_err());
    }

    #[test]
    fn new_job_validation() {
        assert!(NewJob::new(" ", RunMode::Cluster).validate().is_err());
        assert!(NewJob::new("x", RunMode::Cluster).parameters("{").validate().is_err());
        assert!(NewJob::new("x", RunMode::Cluster).parameters("{\"a\":1}").validate().is_ok());
    }
}
