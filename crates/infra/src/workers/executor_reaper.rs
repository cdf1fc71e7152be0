//! Destroys executors named in `ExecutorDestroyRequested` events.
//!
//! This is the prompt path. A requeued job's old executor is also recorded as
//! a pending teardown, which the reaper clears once the executor is gone and
//! `DestroyExecutorJob` drains if the event never arrives.

use std::sync::Arc;

use tracing::{debug, info};

use taskfleet_events::{EventBus, SchedulerEnvelope, SchedulerEvent};

use super::event_worker::{EventWorker, WorkerHandle};
use crate::gateway::{ExecutorGateways, ExecutorHandle, GatewayError};
use crate::store::JobStore;

pub const REAPER_WORKER: &str = "executor-reaper";

pub struct ExecutorReaper;

impl ExecutorReaper {
    pub fn spawn<B>(bus: &B, store: Arc<dyn JobStore>, gateways: ExecutorGateways) -> WorkerHandle
    where
        B: EventBus<SchedulerEnvelope> + ?Sized,
    {
        EventWorker::spawn(REAPER_WORKER, bus, move |envelope: SchedulerEnvelope| {
            reap(store.as_ref(), &gateways, &envelope)
        })
    }
}

/// Handle one envelope. Events other than destroy requests are ignored.
pub fn reap(
    store: &dyn JobStore,
    gateways: &ExecutorGateways,
    envelope: &SchedulerEnvelope,
) -> Result<(), GatewayError> {
    let SchedulerEvent::ExecutorDestroyRequested {
        executor_identifier,
        reason,
        ..
    } = envelope.payload()
    else {
        return Ok(());
    };

    let handle = ExecutorHandle {
        job_id: envelope.job_id(),
        identifier: executor_identifier.clone(),
        endpoint: None,
    };
    match gateways.for_identifier(executor_identifier).destroy(&handle) {
        Ok(()) => {
            info!(job_id = %handle.job_id, executor = %executor_identifier, reason = %reason, "executor reaped");
        }
        Err(GatewayError::NotFound(_)) => {
            debug!(job_id = %handle.job_id, executor = %executor_identifier, "executor already gone");
        }
        Err(GatewayError::NotOwned(_)) => {
            debug!(job_id = %handle.job_id, executor = %executor_identifier, "executor owned by another instance");
            return Ok(());
        }
        Err(err) => return Err(err),
    }
    store.complete_teardown(handle.job_id, executor_identifier)?;
    Ok(())
}
