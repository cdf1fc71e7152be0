//! Wiring: builds the daemons from config and runs them.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use taskfleet_core::{HeartbeatPolicy, RetryDefaults};
use taskfleet_events::{EventBus, SchedulerEnvelope};

use crate::admission::AdmissionGate;
use crate::alarm::AlarmSink;
use crate::client::TaskExecutorClient;
use crate::cluster::{ClusterJobClient, ResourceManager};
use crate::config::SchedulerConfig;
use crate::daemons::{
    BatchReport, CheckRunningJob, Daemon, DaemonHandle, DaemonRunner, DestroyExecutorJob,
    DestroyResourceJob, DoCancelingJob, PullTaskResultJob, StartPreparingJob,
};
use crate::gateway::{ClusterExecutorGateway, ExecutorGateways, ProcessExecutorGateway};
use crate::ingestion::ResultIngestion;
use crate::service::JobService;
use crate::store::{JobStore, ResourceRegistry};
use crate::workers::{ExecutorReaper, WorkerHandle};

/// Collaborators the scheduler is built from.
#[derive(Clone)]
pub struct SchedulerParts {
    pub store: Arc<dyn JobStore>,
    pub registry: Arc<dyn ResourceRegistry>,
    pub bus: Arc<dyn EventBus<SchedulerEnvelope>>,
    pub client: Arc<dyn TaskExecutorClient>,
    pub manager: Arc<dyn ResourceManager>,
    pub pods: Arc<dyn ClusterJobClient>,
    pub alarms: Arc<dyn AlarmSink>,
}

impl SchedulerParts {
    /// Process and cluster gateways configured from `config`.
    pub fn gateways(&self, config: &SchedulerConfig) -> ExecutorGateways {
        let process = ProcessExecutorGateway::new(config.process.clone(), self.client.clone());
        let cluster = ClusterExecutorGateway::new(
            config.cluster.clone(),
            self.manager.clone(),
            self.pods.clone(),
            self.registry.clone(),
            self.client.clone(),
        );
        ExecutorGateways::new(Arc::new(process), Arc::new(cluster))
    }
}

struct Scheduled {
    daemon: Arc<dyn Daemon>,
    interval: Duration,
}

pub struct Scheduler {
    daemons: Vec<Scheduled>,
    store: Arc<dyn JobStore>,
    gateways: ExecutorGateways,
    bus: Arc<dyn EventBus<SchedulerEnvelope>>,
    service: JobService,
}

impl Scheduler {
    pub fn new(parts: SchedulerParts, gateways: ExecutorGateways, config: &SchedulerConfig) -> Self {
        let d = &config.daemons;
        let admission = Arc::new(AdmissionGate::new(
            parts.store.clone(),
            config.start_admission_threshold,
            config.start_rate_per_second,
            config.start_burst,
        ));
        let ingestion = Arc::new(ResultIngestion::new(parts.store.clone(), parts.bus.clone()));

        let daemons: Vec<Scheduled> = vec![
            Scheduled {
                daemon: Arc::new(StartPreparingJob::new(
                    parts.store.clone(),
                    gateways.clone(),
                    admission,
                    parts.bus.clone(),
                    d.start_preparing.batch_size,
                )),
                interval: d.start_preparing.interval(),
            },
            Scheduled {
                daemon: Arc::new(DoCancelingJob::new(
                    parts.store.clone(),
                    gateways.clone(),
                    parts.bus.clone(),
                    config.cancel_timeout(),
                    d.do_canceling.batch_size,
                )),
                interval: d.do_canceling.interval(),
            },
            Scheduled {
                daemon: Arc::new(CheckRunningJob::new(
                    parts.store.clone(),
                    parts.bus.clone(),
                    HeartbeatPolicy::from_seconds(config.heartbeat_timeout_seconds),
                    RetryDefaults {
                        max_retry_times: config.default_max_retry_times,
                    },
                    d.check_running.batch_size,
                )),
                interval: d.check_running.interval(),
            },
            Scheduled {
                daemon: Arc::new(DestroyExecutorJob::new(
                    parts.store.clone(),
                    gateways.clone(),
                    d.destroy_executor.batch_size,
                )),
                interval: d.destroy_executor.interval(),
            },
            Scheduled {
                daemon: Arc::new(DestroyResourceJob::new(
                    parts.registry.clone(),
                    parts.manager.clone(),
                    parts.alarms.clone(),
                    d.destroy_resource.batch_size,
                )),
                interval: d.destroy_resource.interval(),
            },
            Scheduled {
                daemon: Arc::new(PullTaskResultJob::new(
                    parts.store.clone(),
                    gateways.clone(),
                    parts.client.clone(),
                    ingestion,
                    d.pull_task_result.batch_size,
                )),
                interval: d.pull_task_result.interval(),
            },
        ];

        Self {
            daemons,
            store: parts.store.clone(),
            gateways,
            service: JobService::new(parts.store, parts.bus.clone()),
            bus: parts.bus,
        }
    }

    pub fn service(&self) -> &JobService {
        &self.service
    }

    /// Run every daemon once, in lifecycle order, on the calling thread.
    pub fn run_all_once(&self, now: DateTime<Utc>) -> Vec<(&'static str, BatchReport)> {
        self.daemons
            .iter()
            .filter_map(|s| match s.daemon.run_once(now) {
                Ok(report) => Some((s.daemon.name(), report)),
                Err(err) => {
                    warn!(daemon = s.daemon.name(), error = %err, "daemon run failed");
                    None
                }
            })
            .collect()
    }

    /// Spawn one thread per daemon plus the executor reaper.
    pub fn start(&self) -> SchedulerHandle {
        let reaper = ExecutorReaper::spawn(self.bus.as_ref(), self.store.clone(), self.gateways.clone());
        let daemons = self
            .daemons
            .iter()
            .map(|s| DaemonRunner::new(s.interval).spawn(s.daemon.clone()))
            .collect::<Vec<_>>();
        info!(daemons = daemons.len(), "scheduler started");
        SchedulerHandle { daemons, reaper }
    }
}

pub struct SchedulerHandle {
    daemons: Vec<DaemonHandle>,
    reaper: WorkerHandle,
}

impl SchedulerHandle {
    pub fn trigger_all(&self) {
        for handle in &self.daemons {
            handle.trigger();
        }
    }

    pub fn shutdown(self) {
        for handle in self.daemons {
            let name = handle.name();
            handle.shutdown();
            info!(daemon = name, "daemon stopped");
        }
        self.reaper.shutdown();
        info!("scheduler stopped");
    }
}
