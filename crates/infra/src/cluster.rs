//! Cluster collaborators: pod provisioning and pod status lookup.
//!
//! The concrete cluster API lives outside this workspace; these traits are the
//! seam. `InMemoryCluster` implements both for tests/dev.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use taskfleet_core::ResourceId;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ResourceError {
    /// The resource no longer exists; teardown is complete.
    #[error("resource already gone: {0}")]
    AlreadyGone(ResourceId),
    #[error("resource backend error: {0}")]
    Backend(String),
}

/// What to run in a provisioned pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSpec {
    pub resource_id: ResourceId,
    pub image: String,
    pub port: u16,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodStatus {
    pub phase: String,
    pub pod_ip: Option<String>,
}

pub trait ResourceManager: Send + Sync {
    fn create(&self, spec: &PodSpec) -> Result<(), ResourceError>;

    fn destroy(&self, resource_id: &ResourceId) -> Result<(), ResourceError>;
}

pub trait ClusterJobClient: Send + Sync {
    fn get(&self, namespace: &str, name: &str) -> Result<Option<PodStatus>, ResourceError>;
}

#[derive(Debug, Default)]
struct ClusterState {
    pods: HashMap<ResourceId, (PodSpec, PodStatus)>,
    failing_destroys: HashSet<ResourceId>,
    refuse_creates: bool,
    destroy_calls: Vec<ResourceId>,
}

/// In-memory cluster for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryCluster {
    state: Mutex<ClusterState>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the scheduler placing the pod and assigning it an address.
    pub fn assign_ip(&self, resource_id: &ResourceId, ip: &str) {
        if let Ok(mut state) = self.state.lock() {
            if let Some((_, status)) = state.pods.get_mut(resource_id) {
                status.phase = "Running".to_string();
                status.pod_ip = Some(ip.to_string());
            }
        }
    }

    /// Make `destroy` fail for this resource until cleared.
    pub fn fail_destroy(&self, resource_id: &ResourceId, failing: bool) {
        if let Ok(mut state) = self.state.lock() {
            if failing {
                state.failing_destroys.insert(resource_id.clone());
            } else {
                state.failing_destroys.remove(resource_id);
            }
        }
    }

    /// Make every `create` fail until cleared.
    pub fn refuse_creates(&self, refuse: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.refuse_creates = refuse;
        }
    }

    pub fn pods(&self) -> Vec<PodSpec> {
        self.state
            .lock()
            .map(|s| s.pods.values().map(|(spec, _)| spec.clone()).collect())
            .unwrap_or_default()
    }

    pub fn destroy_calls(&self) -> Vec<ResourceId> {
        self.state
            .lock()
            .map(|s| s.destroy_calls.clone())
            .unwrap_or_default()
    }
}

impl ResourceManager for InMemoryCluster {
    fn create(&self, spec: &PodSpec) -> Result<(), ResourceError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| ResourceError::Backend("cluster state poisoned".into()))?;
        if state.refuse_creates {
            return Err(ResourceError::Backend(format!("cluster refused to create {}", spec.resource_id)));
        }
        let status = PodStatus {
            phase: "Pending".to_string(),
            pod_ip: None,
        };
        state.pods.insert(spec.resource_id.clone(), (spec.clone(), status));
        Ok(())
    }

    fn destroy(&self, resource_id: &ResourceId) -> Result<(), ResourceError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| ResourceError::Backend("cluster state poisoned".into()))?;
        state.destroy_calls.push(resource_id.clone());
        if state.failing_destroys.contains(resource_id) {
            return Err(ResourceError::Backend(format!("cluster refused to delete {resource_id}")));
        }
        match state.pods.remove(resource_id) {
            Some(_) => Ok(()),
            None => Err(ResourceError::AlreadyGone(resource_id.clone())),
        }
    }
}

impl ClusterJobClient for InMemoryCluster {
    fn get(&self, namespace: &str, name: &str) -> Result<Option<PodStatus>, ResourceError> {
        let state = self
            .state
            .lock()
            .map_err(|_| ResourceError::Backend("cluster state poisoned".into()))?;
        Ok(state
            .pods
            .iter()
            .find(|(id, _)| id.namespace == namespace && id.name == name)
            .map(|(_, (_, status))| status.clone()))
    }
}
