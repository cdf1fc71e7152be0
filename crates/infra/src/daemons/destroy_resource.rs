//! Tear down ABANDONED cluster resources and drop their registry rows.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use taskfleet_core::Resource;

use super::{BatchReport, Daemon, DaemonError, Step};
use crate::alarm::AlarmSink;
use crate::cluster::{ResourceError, ResourceManager};
use crate::store::{Page, ResourceRegistry};

pub const RESOURCE_DESTROY_FAILED: &str = "RESOURCE_DESTROY_FAILED";

pub struct DestroyResourceJob {
    registry: Arc<dyn ResourceRegistry>,
    manager: Arc<dyn ResourceManager>,
    alarms: Arc<dyn AlarmSink>,
    batch_size: usize,
}

impl DestroyResourceJob {
    pub fn new(
        registry: Arc<dyn ResourceRegistry>,
        manager: Arc<dyn ResourceManager>,
        alarms: Arc<dyn AlarmSink>,
        batch_size: usize,
    ) -> Self {
        Self {
            registry,
            manager,
            alarms,
            batch_size,
        }
    }

    fn teardown(&self, resource: &Resource) -> Step {
        match self.manager.destroy(&resource.resource_id) {
            Ok(()) => {}
            Err(ResourceError::AlreadyGone(_)) => {
                debug!(resource = %resource.resource_id, "resource already gone");
            }
            Err(err) => {
                self.alarms.alarm(
                    RESOURCE_DESTROY_FAILED,
                    &format!("failed to destroy {}: {err}", resource.resource_id),
                );
                return Step::Failed;
            }
        }

        match self.registry.delete(resource.row_id) {
            Ok(true) => {
                info!(resource = %resource.resource_id, "resource destroyed");
                Step::Advanced
            }
            Ok(false) => Step::Skipped,
            Err(err) => {
                self.alarms.alarm(
                    RESOURCE_DESTROY_FAILED,
                    &format!("destroyed {} but could not drop its row: {err}", resource.resource_id),
                );
                Step::Failed
            }
        }
    }
}

impl Daemon for DestroyResourceJob {
    fn name(&self) -> &'static str {
        "destroy-resource-job"
    }

    fn run_once(&self, _now: DateTime<Utc>) -> Result<BatchReport, DaemonError> {
        let candidates = self
            .registry
            .find_abandoned(Page::first(self.batch_size))
            .map_err(DaemonError::Fetch)?;

        let mut report = BatchReport::default();
        for resource in candidates {
            report.scanned += 1;
            report.record(self.teardown(&resource));
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::InMemoryAlarmSink;
    use crate::cluster::{InMemoryCluster, PodSpec};
    use crate::gateway::cluster::POD_RESOURCE_TYPE;
    use crate::store::InMemoryResourceRegistry;
    use taskfleet_core::{ResourceId, ResourceLocation};

    struct Fixture {
        registry: Arc<InMemoryResourceRegistry>,
        cluster: Arc<InMemoryCluster>,
        alarms: Arc<InMemoryAlarmSink>,
        daemon: DestroyResourceJob,
    }

    fn fixture() -> Fixture {
        let registry = InMemoryResourceRegistry::arc();
        let cluster = Arc::new(InMemoryCluster::new());
        let alarms = Arc::new(InMemoryAlarmSink::new());
        let daemon = DestroyResourceJob::new(registry.clone(), cluster.clone(), alarms.clone(), 10);
        Fixture {
            registry,
            cluster,
            alarms,
            daemon,
        }
    }

    fn abandoned_pod(f: &Fixture, name: &str) -> ResourceId {
        let id = ResourceId::new(ResourceLocation::new("eu", "batch"), "jobs", name).unwrap();
        f.cluster
            .create(&PodSpec {
                resource_id: id.clone(),
                image: "img".into(),
                port: 8080,
                env: Vec::new(),
            })
            .unwrap();
        f.registry
            .mark_abandoned(&id, POD_RESOURCE_TYPE, Utc::now())
            .unwrap();
        id
    }

    #[test]
    fn destroys_and_forgets_without_alarm() {
        let f = fixture();
        let id = abandoned_pod(&f, "pod-1");

        let report = f.daemon.run_once(Utc::now()).unwrap();

        assert_eq!(report.advanced, 1);
        assert!(f.registry.get(&id).unwrap().is_none());
        assert!(f.cluster.pods().is_empty());
        assert!(f.alarms.all().is_empty());
    }

    #[test]
    fn already_gone_resource_is_forgotten() {
        let f = fixture();
        let id = ResourceId::new(ResourceLocation::new("eu", "batch"), "jobs", "ghost").unwrap();
        f.registry.mark_abandoned(&id, POD_RESOURCE_TYPE, Utc::now()).unwrap();

        let report = f.daemon.run_once(Utc::now()).unwrap();

        assert_eq!(report.advanced, 1);
        assert!(f.registry.all().is_empty());
        assert!(f.alarms.all().is_empty());
    }

    #[test]
    fn failing_destroy_alarms_once_per_cycle_and_keeps_row() {
        let f = fixture();
        let failing = abandoned_pod(&f, "stuck");
        abandoned_pod(&f, "fine");
        f.cluster.fail_destroy(&failing, true);

        let first = f.daemon.run_once(Utc::now()).unwrap();
        assert_eq!(first.failed, 1);
        assert_eq!(first.advanced, 1);
        assert_eq!(f.alarms.all().len(), 1);
        assert_eq!(f.alarms.all()[0].0, RESOURCE_DESTROY_FAILED);
        assert!(f.registry.get(&failing).unwrap().is_some());

        f.daemon.run_once(Utc::now()).unwrap();
        assert_eq!(f.alarms.all().len(), 2);

        f.cluster.fail_destroy(&failing, false);
        let last = f.daemon.run_once(Utc::now()).unwrap();
        assert_eq!(last.advanced, 1);
        assert!(f.registry.all().is_empty());
        assert_eq!(f.alarms.all().len(), 2);
    }
}
