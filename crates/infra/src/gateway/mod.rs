//! Executor gateways: start, stop, destroy and locate executors.

use std::sync::Arc;

use serde::Serialize;

use taskfleet_core::{ExecutorIdentifier, Job, JobId, RunMode};

use crate::client::ClientError;
use crate::cluster::ResourceError;
use crate::store::StoreError;

pub mod cluster;
pub mod process;

#[cfg(test)]
pub(crate) mod testing;

pub use cluster::{ClusterExecutorGateway, ClusterGatewayConfig};
pub use process::{ProcessExecutorGateway, ProcessGatewayConfig};

#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("executor dispatch failed: {0}")]
    Dispatch(String),
    /// The executor does not exist (already gone). Benign for destroy.
    #[error("executor not found: {0}")]
    NotFound(ExecutorIdentifier),
    /// A process executor started by another host.
    #[error("executor {0} belongs to another host")]
    NotOwned(ExecutorIdentifier),
    #[error("identifier {0} is not handled by this gateway")]
    InvalidIdentifier(ExecutorIdentifier),
}

impl GatewayError {
    pub fn dispatch(err: impl std::fmt::Display) -> Self {
        Self::Dispatch(err.to_string())
    }
}

impl From<ClientError> for GatewayError {
    fn from(err: ClientError) -> Self {
        Self::dispatch(err)
    }
}

impl From<ResourceError> for GatewayError {
    fn from(err: ResourceError) -> Self {
        Self::dispatch(err)
    }
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        Self::dispatch(err)
    }
}

/// Everything an executor needs to run one attempt of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobContext {
    pub job_id: JobId,
    pub run_mode: RunMode,
    pub job_type: String,
    pub job_parameters_json: Option<String>,
    /// 1-based attempt number of this dispatch.
    pub attempt: u32,
    pub organization_id: Option<i64>,
}

impl JobContext {
    pub fn for_next_attempt(job: &Job) -> Self {
        Self {
            job_id: job.id,
            run_mode: job.run_mode,
            job_type: job.job_type.clone(),
            job_parameters_json: job.job_parameters_json.clone(),
            attempt: job.execution_times.saturating_add(1),
            organization_id: job.organization_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Started {
    pub identifier: ExecutorIdentifier,
    /// Known up front for process executors; resolved later for pods.
    pub endpoint: Option<String>,
}

/// A dispatched executor.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorHandle {
    pub job_id: JobId,
    pub identifier: ExecutorIdentifier,
    pub endpoint: Option<String>,
}

impl ExecutorHandle {
    pub fn of(job: &Job) -> Option<Self> {
        job.executor_identifier.as_ref().map(|identifier| Self {
            job_id: job.id,
            identifier: identifier.clone(),
            endpoint: job.executor_endpoint.clone(),
        })
    }
}

pub trait ExecutorGateway: Send + Sync {
    fn start(&self, context: &JobContext) -> Result<Started, GatewayError>;

    /// Cooperative stop; the executor reports its final state afterwards.
    fn stop(&self, handle: &ExecutorHandle) -> Result<(), GatewayError>;

    /// Tear down the executor. Repeated calls are harmless.
    fn destroy(&self, handle: &ExecutorHandle) -> Result<(), GatewayError>;

    /// `Ok(None)` while the executor is not reachable yet.
    fn resolve_endpoint(&self, identifier: &ExecutorIdentifier) -> Result<Option<String>, GatewayError>;
}

impl<T> ExecutorGateway for Arc<T>
where
    T: ExecutorGateway + ?Sized,
{
    fn start(&self, context: &JobContext) -> Result<Started, GatewayError> {
        (**self).start(context)
    }

    fn stop(&self, handle: &ExecutorHandle) -> Result<(), GatewayError> {
        (**self).stop(handle)
    }

    fn destroy(&self, handle: &ExecutorHandle) -> Result<(), GatewayError> {
        (**self).destroy(handle)
    }

    fn resolve_endpoint(&self, identifier: &ExecutorIdentifier) -> Result<Option<String>, GatewayError> {
        (**self).resolve_endpoint(identifier)
    }
}

/// One gateway per run mode.
#[derive(Clone)]
pub struct ExecutorGateways {
    pub process: Arc<dyn ExecutorGateway>,
    pub cluster: Arc<dyn ExecutorGateway>,
}

impl ExecutorGateways {
    pub fn new(process: Arc<dyn ExecutorGateway>, cluster: Arc<dyn ExecutorGateway>) -> Self {
        Self { process, cluster }
    }

    pub fn for_mode(&self, run_mode: RunMode) -> &dyn ExecutorGateway {
        match run_mode {
            RunMode::Process => self.process.as_ref(),
            RunMode::Cluster => self.cluster.as_ref(),
        }
    }

    /// Gateway owning `identifier`, chosen by its scheme.
    pub fn for_identifier(&self, identifier: &ExecutorIdentifier) -> &dyn ExecutorGateway {
        self.for_mode(identifier.run_mode())
    }
}

impl std::fmt::Debug for ExecutorGateways {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorGateways").finish_non_exhaustive()
    }
}
