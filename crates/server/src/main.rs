use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;
use tokio::runtime::Runtime;
use tracing::{info, warn};

use taskfleet_events::{InMemoryEventBus, SchedulerEnvelope};
use taskfleet_infra::alarm::TracingAlarmSink;
use taskfleet_infra::client::HttpTaskExecutorClient;
use taskfleet_infra::cluster::InMemoryCluster;
use taskfleet_infra::store::{
    InMemoryJobStore, InMemoryResourceRegistry, JobStore, PostgresJobStore, PostgresResourceRegistry,
    ResourceRegistry,
};
use taskfleet_infra::{Scheduler, SchedulerConfig, SchedulerParts};

fn main() -> anyhow::Result<()> {
    let config = SchedulerConfig::load().context("loading configuration")?;
    taskfleet_observability::init(config.log_format);

    // Daemons run on plain threads; the runtime only drives the database driver.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("taskfleet-db")
        .build()
        .context("building tokio runtime")?;

    let (store, registry) = stores(&config, &runtime)?;

    // Built outside the runtime: the blocking client must not live in an async context.
    let client = Arc::new(
        HttpTaskExecutorClient::new(config.executor_client_timeout())
            .context("building executor client")?,
    );

    warn!("no cluster backend configured; CLUSTER jobs run against an in-memory cluster");
    let cluster = Arc::new(InMemoryCluster::new());

    let parts = SchedulerParts {
        store,
        registry,
        bus: Arc::new(InMemoryEventBus::<SchedulerEnvelope>::new()),
        client,
        manager: cluster.clone(),
        pods: cluster,
        alarms: Arc::new(TracingAlarmSink),
    };
    let gateways = parts.gateways(&config);
    let scheduler = Scheduler::new(parts, gateways, &config);
    let handle = scheduler.start();

    info!(
        heartbeat_timeout_seconds = config.heartbeat_timeout_seconds,
        cancel_timeout_seconds = config.cancel_timeout_seconds,
        "taskfleet scheduler running"
    );

    runtime
        .block_on(tokio::signal::ctrl_c())
        .context("waiting for shutdown signal")?;
    info!("shutdown requested");
    handle.shutdown();
    Ok(())
}

fn stores(
    config: &SchedulerConfig,
    runtime: &Runtime,
) -> anyhow::Result<(Arc<dyn JobStore>, Arc<dyn ResourceRegistry>)> {
    let Some(database_url) = &config.database_url else {
        warn!("no database configured; using in-memory stores");
        let store: Arc<dyn JobStore> = InMemoryJobStore::arc();
        let registry: Arc<dyn ResourceRegistry> = InMemoryResourceRegistry::arc();
        return Ok((store, registry));
    };

    let pool = runtime
        .block_on(PgPool::connect(database_url))
        .context("connecting to Postgres")?;
    let store = PostgresJobStore::new(pool.clone(), runtime.handle().clone());
    store.ensure_schema().context("creating schema")?;
    let store: Arc<dyn JobStore> = Arc::new(store);
    let registry: Arc<dyn ResourceRegistry> =
        Arc::new(PostgresResourceRegistry::new(pool, runtime.handle().clone()));
    info!("using Postgres stores");
    Ok((store, registry))
}
