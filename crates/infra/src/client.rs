//! Client for the executor's task API.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use taskfleet_core::{JobId, TaskResult};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("executor unreachable at {endpoint}: {message}")]
    Unreachable { endpoint: String, message: String },
    #[error("executor returned HTTP {0}")]
    Status(u16),
    #[error("executor response could not be decoded: {0}")]
    Decode(String),
}

/// Talks to a running executor.
pub trait TaskExecutorClient: Send + Sync {
    fn pull_result(&self, endpoint: &str, job_id: JobId) -> Result<TaskResult, ClientError>;

    /// Ask the executor to stop its task cooperatively.
    fn stop(&self, endpoint: &str, job_id: JobId) -> Result<(), ClientError>;
}

/// Blocking HTTP client.
///
/// - `GET  {endpoint}/tasks/{id}/result`
/// - `POST {endpoint}/tasks/{id}/stop`
///
/// Must be constructed and used outside any async runtime context.
#[derive(Debug, Clone)]
pub struct HttpTaskExecutorClient {
    http: reqwest::blocking::Client,
}

impl HttpTaskExecutorClient {
    pub fn new(timeout: Duration) -> Result<Self, ClientError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::Unreachable {
                endpoint: String::new(),
                message: e.to_string(),
            })?;
        Ok(Self { http })
    }

    fn url(endpoint: &str, job_id: JobId, action: &str) -> String {
        format!("{}/tasks/{}/{}", endpoint.trim_end_matches('/'), job_id, action)
    }

    fn unreachable(endpoint: &str, err: reqwest::Error) -> ClientError {
        ClientError::Unreachable {
            endpoint: endpoint.to_string(),
            message: err.to_string(),
        }
    }
}

impl TaskExecutorClient for HttpTaskExecutorClient {
    fn pull_result(&self, endpoint: &str, job_id: JobId) -> Result<TaskResult, ClientError> {
        let response = self
            .http
            .get(Self::url(endpoint, job_id, "result"))
            .send()
            .map_err(|e| Self::unreachable(endpoint, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status(status.as_u16()));
        }
        response
            .json::<TaskResult>()
            .map_err(|e| ClientError::Decode(e.to_string()))
    }

    fn stop(&self, endpoint: &str, job_id: JobId) -> Result<(), ClientError> {
        let response = self
            .http
            .post(Self::url(endpoint, job_id, "stop"))
            .send()
            .map_err(|e| Self::unreachable(endpoint, e))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ClientError::Status(status.as_u16()))
        }
    }
}

#[derive(Debug, Default)]
struct ScriptedState {
    reports: HashMap<JobId, TaskResult>,
    unreachable: HashSet<JobId>,
    stops: Vec<(String, JobId)>,
    pulls: usize,
}

/// Scripted executor responses for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryTaskExecutorClient {
    state: Mutex<ScriptedState>,
}

impl InMemoryTaskExecutorClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next pulls for `job_id` return `report`.
    pub fn set_report(&self, job_id: JobId, report: TaskResult) {
        if let Ok(mut state) = self.state.lock() {
            state.unreachable.remove(&job_id);
            state.reports.insert(job_id, report);
        }
    }

    pub fn set_unreachable(&self, job_id: JobId) {
        if let Ok(mut state) = self.state.lock() {
            state.unreachable.insert(job_id);
        }
    }

    pub fn stops(&self) -> Vec<(String, JobId)> {
        self.state.lock().map(|s| s.stops.clone()).unwrap_or_default()
    }

    pub fn pull_count(&self) -> usize {
        self.state.lock().map(|s| s.pulls).unwrap_or(0)
    }
}

impl TaskExecutorClient for InMemoryTaskExecutorClient {
    fn pull_result(&self, endpoint: &str, job_id: JobId) -> Result<TaskResult, ClientError> {
        let mut state = self.state.lock().map_err(|_| ClientError::Unreachable {
            endpoint: endpoint.to_string(),
            message: "poisoned".into(),
        })?;
        state.pulls += 1;
        if state.unreachable.contains(&job_id) {
            return Err(ClientError::Unreachable {
                endpoint: endpoint.to_string(),
                message: "connection refused".into(),
            });
        }
        state
            .reports
            .get(&job_id)
            .cloned()
            .ok_or(ClientError::Status(404))
    }

    fn stop(&self, endpoint: &str, job_id: JobId) -> Result<(), ClientError> {
        let mut state = self.state.lock().map_err(|_| ClientError::Unreachable {
            endpoint: endpoint.to_string(),
            message: "poisoned".into(),
        })?;
        if state.unreachable.contains(&job_id) {
            return Err(ClientError::Unreachable {
                endpoint: endpoint.to_string(),
                message: "connection refused".into(),
            });
        }
        state.stops.push((endpoint.to_string(), job_id));
        Ok(())
    }
}
