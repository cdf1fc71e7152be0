//! Recording gateway double for daemon tests.

use std::collections::HashMap;
use std::sync::Mutex;

use taskfleet_core::{ExecutorIdentifier, JobId, ResourceId, ResourceLocation, RunMode};

use super::{ExecutorGateway, ExecutorHandle, GatewayError, JobContext, Started};

#[derive(Debug, Default)]
struct Calls {
    starts: Vec<JobContext>,
    stops: Vec<ExecutorHandle>,
    destroys: Vec<ExecutorHandle>,
    fail_start: bool,
    destroy_error: Option<GatewayError>,
    endpoints: HashMap<ExecutorIdentifier, String>,
}

#[derive(Debug)]
pub(crate) struct FakeGateway {
    run_mode: RunMode,
    calls: Mutex<Calls>,
}

impl FakeGateway {
    pub(crate) fn new(run_mode: RunMode) -> Self {
        Self {
            run_mode,
            calls: Mutex::new(Calls::default()),
        }
    }

    pub(crate) fn identifier_for(&self, job_id: JobId, attempt: u32) -> ExecutorIdentifier {
        match self.run_mode {
            RunMode::Process => ExecutorIdentifier::Process {
                host: "127.0.0.1".into(),
                port: 40_000,
                pid: 1_000 + attempt,
                name: format!("fake-{job_id}-{attempt}"),
            },
            RunMode::Cluster => ExecutorIdentifier::Cluster(
                ResourceId::new(
                    ResourceLocation::new("test", "test"),
                    "jobs",
                    format!("fake-{job_id}-{attempt}"),
                )
                .unwrap(),
            ),
        }
    }

    pub(crate) fn fail_starts(&self, fail: bool) {
        self.calls.lock().unwrap().fail_start = fail;
    }

    pub(crate) fn fail_destroys_with(&self, err: Option<GatewayError>) {
        self.calls.lock().unwrap().destroy_error = err;
    }

    pub(crate) fn set_endpoint(&self, identifier: &ExecutorIdentifier, endpoint: &str) {
        self.calls
            .lock()
            .unwrap()
            .endpoints
            .insert(identifier.clone(), endpoint.to_string());
    }

    pub(crate) fn starts(&self) -> Vec<JobContext> {
        self.calls.lock().unwrap().starts.clone()
    }

    pub(crate) fn stops(&self) -> Vec<ExecutorHandle> {
        self.calls.lock().unwrap().stops.clone()
    }

    pub(crate) fn destroys(&self) -> Vec<ExecutorHandle> {
        self.calls.lock().unwrap().destroys.clone()
    }
}

impl ExecutorGateway for FakeGateway {
    fn start(&self, context: &JobContext) -> Result<Started, GatewayError> {
        let mut calls = self.calls.lock().unwrap();
        if calls.fail_start {
            return Err(GatewayError::Dispatch("injected start failure".into()));
        }
        calls.starts.push(context.clone());
        let identifier = self.identifier_for(context.job_id, context.attempt);
        Ok(Started {
            endpoint: identifier.static_endpoint(),
            identifier,
        })
    }

    fn stop(&self, handle: &ExecutorHandle) -> Result<(), GatewayError> {
        self.calls.lock().unwrap().stops.push(handle.clone());
        Ok(())
    }

    fn destroy(&self, handle: &ExecutorHandle) -> Result<(), GatewayError> {
        let mut calls = self.calls.lock().unwrap();
        calls.destroys.push(handle.clone());
        match &calls.destroy_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn resolve_endpoint(&self, identifier: &ExecutorIdentifier) -> Result<Option<String>, GatewayError> {
        let calls = self.calls.lock().unwrap();
        Ok(calls
            .endpoints
            .get(identifier)
            .cloned()
            .or_else(|| identifier.static_endpoint()))
    }
}
