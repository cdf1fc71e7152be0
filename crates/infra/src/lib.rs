//! Infrastructure layer: stores, executor gateways, daemons, config.

pub mod admission;
pub mod alarm;
pub mod client;
pub mod cluster;
pub mod config;
pub mod daemons;
pub mod gateway;
pub mod ingestion;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod workers;

pub use config::{ConfigError, SchedulerConfig};
pub use scheduler::{Scheduler, SchedulerHandle, SchedulerParts};
pub use service::JobService;
