//! PROCESS mode: each attempt is a child OS process on this host.
//!
//! Children spawned by this instance are killed and reaped through their
//! `Child` handle. A pid on this host that is not tracked, typically one
//! started before a restart, is signalled directly.

use std::collections::HashMap;
use std::net::TcpListener;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use taskfleet_core::ExecutorIdentifier;

use super::{ExecutorGateway, ExecutorHandle, GatewayError, JobContext, Started};
use crate::client::TaskExecutorClient;

pub const ENV_JOB_ID: &str = "TASKFLEET_JOB_ID";
pub const ENV_EXECUTOR_PORT: &str = "TASKFLEET_EXECUTOR_PORT";
pub const ENV_JOB_CONTEXT: &str = "TASKFLEET_JOB_CONTEXT";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessGatewayConfig {
    /// Executor program; receives the job context in its environment.
    pub program: String,
    pub args: Vec<String>,
    /// Host name advertised in identifiers and endpoints.
    pub host: String,
}

impl Default for ProcessGatewayConfig {
    fn default() -> Self {
        Self {
            program: "taskfleet-executor".to_string(),
            args: Vec::new(),
            host: "127.0.0.1".to_string(),
        }
    }
}

pub struct ProcessExecutorGateway {
    config: ProcessGatewayConfig,
    client: Arc<dyn TaskExecutorClient>,
    children: Mutex<HashMap<u32, Child>>,
}

impl ProcessExecutorGateway {
    pub fn new(config: ProcessGatewayConfig, client: Arc<dyn TaskExecutorClient>) -> Self {
        Self {
            config,
            client,
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Number of children this instance is tracking.
    pub fn tracked_children(&self) -> usize {
        self.children.lock().map(|c| c.len()).unwrap_or(0)
    }

    fn free_port() -> Result<u16, GatewayError> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).map_err(GatewayError::dispatch)?;
        let port = listener.local_addr().map_err(GatewayError::dispatch)?.port();
        Ok(port)
    }

    /// Split a process identifier, rejecting foreign schemes and hosts.
    fn owned_pid(&self, identifier: &ExecutorIdentifier) -> Result<u32, GatewayError> {
        match identifier {
            ExecutorIdentifier::Process { host, pid, .. } if *host == self.config.host => Ok(*pid),
            ExecutorIdentifier::Process { .. } => Err(GatewayError::NotOwned(identifier.clone())),
            ExecutorIdentifier::Cluster(_) => Err(GatewayError::InvalidIdentifier(identifier.clone())),
        }
    }

    fn kill(&self, identifier: &ExecutorIdentifier, pid: u32) -> Result<(), GatewayError> {
        let child = {
            let mut children = self
                .children
                .lock()
                .map_err(|_| GatewayError::Dispatch("process table poisoned".into()))?;
            children.remove(&pid)
        };
        let Some(mut child) = child else {
            return signal_untracked(identifier, pid);
        };

        // Fails only when the child already exited; reaping below still applies.
        if let Err(err) = child.kill() {
            warn!(executor = %identifier, error = %err, "kill failed, reaping anyway");
        }
        child.wait().map_err(GatewayError::dispatch)?;
        Ok(())
    }
}

#[cfg(unix)]
fn signal_untracked(identifier: &ExecutorIdentifier, pid: u32) -> Result<(), GatewayError> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    // 0 and negative values address process groups.
    let raw = i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .ok_or_else(|| GatewayError::InvalidIdentifier(identifier.clone()))?;
    match kill(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) => {
            info!(executor = %identifier, "untracked process executor signalled");
            Ok(())
        }
        Err(Errno::ESRCH) => Err(GatewayError::NotFound(identifier.clone())),
        Err(err) => Err(GatewayError::Dispatch(format!("signal {identifier}: {err}"))),
    }
}

#[cfg(not(unix))]
fn signal_untracked(identifier: &ExecutorIdentifier, _pid: u32) -> Result<(), GatewayError> {
    Err(GatewayError::Dispatch(format!(
        "cannot signal untracked executor {identifier} on this platform"
    )))
}

impl ExecutorGateway for ProcessExecutorGateway {
    fn start(&self, context: &JobContext) -> Result<Started, GatewayError> {
        let port = Self::free_port()?;
        let payload = serde_json::to_string(context).map_err(GatewayError::dispatch)?;

        let child = Command::new(&self.config.program)
            .args(&self.config.args)
            .env(ENV_JOB_ID, context.job_id.to_string())
            .env(ENV_EXECUTOR_PORT, port.to_string())
            .env(ENV_JOB_CONTEXT, payload)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| GatewayError::Dispatch(format!("spawn {}: {e}", self.config.program)))?;

        let pid = child.id();
        let identifier = ExecutorIdentifier::Process {
            host: self.config.host.clone(),
            port,
            pid,
            name: format!("taskfleet-{}-{}", context.job_id, context.attempt),
        };

        self.children
            .lock()
            .map_err(|_| GatewayError::Dispatch("process table poisoned".into()))?
            .insert(pid, child);

        info!(job_id = %context.job_id, executor = %identifier, "process executor started");
        Ok(Started {
            endpoint: identifier.static_endpoint(),
            identifier,
        })
    }

    fn stop(&self, handle: &ExecutorHandle) -> Result<(), GatewayError> {
        let pid = self.owned_pid(&handle.identifier)?;
        let endpoint = handle
            .endpoint
            .clone()
            .or_else(|| handle.identifier.static_endpoint());

        if let Some(endpoint) = endpoint {
            match self.client.stop(&endpoint, handle.job_id) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(job_id = %handle.job_id, error = %err, "cooperative stop failed, killing process");
                }
            }
        }
        self.kill(&handle.identifier, pid)
    }

    fn destroy(&self, handle: &ExecutorHandle) -> Result<(), GatewayError> {
        let pid = self.owned_pid(&handle.identifier)?;
        self.kill(&handle.identifier, pid)?;
        info!(job_id = %handle.job_id, executor = %handle.identifier, "process executor destroyed");
        Ok(())
    }

    fn resolve_endpoint(&self, identifier: &ExecutorIdentifier) -> Result<Option<String>, GatewayError> {
        match identifier {
            ExecutorIdentifier::Process { .. } => Ok(identifier.static_endpoint()),
            ExecutorIdentifier::Cluster(_) => Err(GatewayError::InvalidIdentifier(identifier.clone())),
        }
    }
}
