//! Scheduler configuration.
//!
//! Serialized defaults, overridden by `TASKFLEET__*` environment variables.
//! A double underscore separates nesting levels:
//!
//! - `TASKFLEET__HEARTBEAT_TIMEOUT_SECONDS=120`
//! - `TASKFLEET__DAEMONS__CHECK_RUNNING__BATCH_SIZE=50`
//! - `TASKFLEET__PROCESS__PROGRAM=/usr/local/bin/executor`

use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Serialized};
use serde::{Deserialize, Serialize};

use taskfleet_core::MAX_TIMEOUT_SECONDS;
use taskfleet_observability::LogFormat;

use crate::gateway::{ClusterGatewayConfig, ProcessGatewayConfig};

pub const ENV_PREFIX: &str = "TASKFLEET__";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Schedule of one reconciliation daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub interval_ms: u64,
    /// Page size of one run.
    pub batch_size: usize,
}

impl DaemonConfig {
    pub const fn new(interval_ms: u64, batch_size: usize) -> Self {
        Self {
            interval_ms,
            batch_size,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonsConfig {
    pub start_preparing: DaemonConfig,
    pub do_canceling: DaemonConfig,
    pub check_running: DaemonConfig,
    pub destroy_executor: DaemonConfig,
    pub destroy_resource: DaemonConfig,
    pub pull_task_result: DaemonConfig,
}

impl Default for DaemonsConfig {
    fn default() -> Self {
        Self {
            start_preparing: DaemonConfig::new(1_000, 50),
            do_canceling: DaemonConfig::new(5_000, 50),
            check_running: DaemonConfig::new(10_000, 100),
            destroy_executor: DaemonConfig::new(10_000, 50),
            destroy_resource: DaemonConfig::new(30_000, 50),
            pull_task_result: DaemonConfig::new(3_000, 100),
        }
    }
}

impl DaemonsConfig {
    fn all(&self) -> [(&'static str, DaemonConfig); 6] {
        [
            ("start_preparing", self.start_preparing),
            ("do_canceling", self.do_canceling),
            ("check_running", self.check_running),
            ("destroy_executor", self.destroy_executor),
            ("destroy_resource", self.destroy_resource),
            ("pull_task_result", self.pull_task_result),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// PostgreSQL connection string; in-memory stores when unset.
    pub database_url: Option<String>,
    pub log_format: LogFormat,
    pub heartbeat_timeout_seconds: u64,
    pub cancel_timeout_seconds: u64,
    pub default_max_retry_times: u32,
    /// Max RUNNING + CANCELING executors per run mode.
    pub start_admission_threshold: usize,
    pub start_rate_per_second: f64,
    pub start_burst: u32,
    pub executor_client_timeout_ms: u64,
    pub daemons: DaemonsConfig,
    pub process: ProcessGatewayConfig,
    pub cluster: ClusterGatewayConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            log_format: LogFormat::default(),
            heartbeat_timeout_seconds: 120,
            cancel_timeout_seconds: 600,
            default_max_retry_times: 3,
            start_admission_threshold: 100,
            start_rate_per_second: 10.0,
            start_burst: 20,
            executor_client_timeout_ms: 5_000,
            daemons: DaemonsConfig::default(),
            process: ProcessGatewayConfig::default(),
            cluster: ClusterGatewayConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment())
    }

    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(SchedulerConfig::default()))
            .merge(Env::prefixed(ENV_PREFIX).map(|p| p.as_str().replace("__", ".").into()))
    }

    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_timeout_seconds == 0 {
            return Err(ConfigError::Invalid("heartbeat_timeout_seconds must be positive".into()));
        }
        if self.cancel_timeout_seconds == 0 {
            return Err(ConfigError::Invalid("cancel_timeout_seconds must be positive".into()));
        }
        if !self.start_rate_per_second.is_finite() || self.start_rate_per_second < 0.0 {
            return Err(ConfigError::Invalid(
                "start_rate_per_second must be a non-negative number".into(),
            ));
        }
        if self.start_burst == 0 {
            return Err(ConfigError::Invalid("start_burst must be at least 1".into()));
        }
        for (name, daemon) in self.daemons.all() {
            if daemon.interval_ms == 0 || daemon.batch_size == 0 {
                return Err(ConfigError::Invalid(format!(
                    "daemons.{name}: interval_ms and batch_size must be positive"
                )));
            }
        }
        Ok(())
    }

    pub fn cancel_timeout(&self) -> chrono::Duration {
        let seconds = self.cancel_timeout_seconds.min(MAX_TIMEOUT_SECONDS as u64) as i64;
        chrono::Duration::seconds(seconds)
    }

    pub fn executor_client_timeout(&self) -> Duration {
        Duration::from_millis(self.executor_client_timeout_ms)
    }
}
