//! CLUSTER mode: each attempt is a pod tracked in the Resource Registry.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use taskfleet_core::{ExecutorIdentifier, ResourceId, ResourceLocation, ResourceState};

use super::{ExecutorGateway, ExecutorHandle, GatewayError, JobContext, Started};
use crate::client::TaskExecutorClient;
use crate::cluster::{ClusterJobClient, PodSpec, ResourceManager};
use crate::gateway::process::{ENV_EXECUTOR_PORT, ENV_JOB_CONTEXT, ENV_JOB_ID};
use crate::store::ResourceRegistry;

pub const POD_RESOURCE_TYPE: &str = "cluster-pod";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterGatewayConfig {
    pub region: String,
    pub group: String,
    pub namespace: String,
    pub image: String,
    pub executor_port: u16,
}

impl Default for ClusterGatewayConfig {
    fn default() -> Self {
        Self {
            region: "default".to_string(),
            group: "default".to_string(),
            namespace: "taskfleet".to_string(),
            image: "taskfleet/executor:latest".to_string(),
            executor_port: 8080,
        }
    }
}

pub struct ClusterExecutorGateway {
    config: ClusterGatewayConfig,
    manager: Arc<dyn ResourceManager>,
    pods: Arc<dyn ClusterJobClient>,
    registry: Arc<dyn ResourceRegistry>,
    client: Arc<dyn TaskExecutorClient>,
}

impl ClusterExecutorGateway {
    pub fn new(
        config: ClusterGatewayConfig,
        manager: Arc<dyn ResourceManager>,
        pods: Arc<dyn ClusterJobClient>,
        registry: Arc<dyn ResourceRegistry>,
        client: Arc<dyn TaskExecutorClient>,
    ) -> Self {
        Self {
            config,
            manager,
            pods,
            registry,
            client,
        }
    }

    fn resource_id<'a>(&self, identifier: &'a ExecutorIdentifier) -> Result<&'a ResourceId, GatewayError> {
        match identifier {
            ExecutorIdentifier::Cluster(id) => Ok(id),
            ExecutorIdentifier::Process { .. } => Err(GatewayError::InvalidIdentifier(identifier.clone())),
        }
    }
}

impl ExecutorGateway for ClusterExecutorGateway {
    fn start(&self, context: &JobContext) -> Result<Started, GatewayError> {
        let location = ResourceLocation::new(&self.config.region, &self.config.group);
        let name = format!("taskfleet-job-{}-{}", context.job_id, context.attempt);
        let resource_id = ResourceId::new(location, &self.config.namespace, name)
            .map_err(GatewayError::dispatch)?;
        let payload = serde_json::to_string(context).map_err(GatewayError::dispatch)?;

        let spec = PodSpec {
            resource_id: resource_id.clone(),
            image: self.config.image.clone(),
            port: self.config.executor_port,
            env: vec![
                (ENV_JOB_ID.to_string(), context.job_id.to_string()),
                (ENV_EXECUTOR_PORT.to_string(), self.config.executor_port.to_string()),
                (ENV_JOB_CONTEXT.to_string(), payload),
            ],
        };
        // Registered first so a pod can never exist without a row to tear it down.
        self.registry
            .register(&resource_id, POD_RESOURCE_TYPE, ResourceState::Creating, Utc::now())?;
        if let Err(err) = self.manager.create(&spec) {
            if let Err(abandon) =
                self.registry.mark_abandoned(&resource_id, POD_RESOURCE_TYPE, Utc::now())
            {
                warn!(resource = %resource_id, error = %abandon, "failed to abandon resource after create failure");
            }
            return Err(err.into());
        }

        info!(job_id = %context.job_id, resource = %resource_id, "cluster executor provisioned");
        Ok(Started {
            identifier: ExecutorIdentifier::Cluster(resource_id),
            endpoint: None,
        })
    }

    fn stop(&self, handle: &ExecutorHandle) -> Result<(), GatewayError> {
        let endpoint = match &handle.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => self
                .resolve_endpoint(&handle.identifier)?
                .ok_or_else(|| GatewayError::Dispatch(format!("no endpoint yet for {}", handle.identifier)))?,
        };
        self.client.stop(&endpoint, handle.job_id)?;
        Ok(())
    }

    fn destroy(&self, handle: &ExecutorHandle) -> Result<(), GatewayError> {
        let resource_id = self.resource_id(&handle.identifier)?;
        let resource = self
            .registry
            .mark_abandoned(resource_id, POD_RESOURCE_TYPE, Utc::now())?;
        debug!(job_id = %handle.job_id, resource = %resource_id, row = %resource.row_id, "resource abandoned");
        Ok(())
    }

    fn resolve_endpoint(&self, identifier: &ExecutorIdentifier) -> Result<Option<String>, GatewayError> {
        let resource_id = self.resource_id(identifier)?;
        let Some(status) = self.pods.get(&resource_id.namespace, &resource_id.name)? else {
            return Ok(None);
        };
        let Some(ip) = status.pod_ip else {
            return Ok(None);
        };

        let endpoint = format!("http://{}:{}", ip, self.config.executor_port);
        self.registry.mark_available(resource_id, &endpoint)?;
        Ok(Some(endpoint))
    }
}
