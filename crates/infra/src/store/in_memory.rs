//! In-memory Job Store and Resource Registry for tests/dev.
//!
//! Each job lives behind its own `Mutex`, which is the per-row exclusive lock.
//! The map lock is only held long enough to find the row.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};

use taskfleet_core::{
    ExecutorIdentifier, HeartbeatPolicy, Job, JobAttribute, JobId, JobStatus, NewJob, Resource,
    ResourceId, ResourceRowId, ResourceState, RunMode,
};

use super::{
    JobStore, LockOutcome, LockedRow, Page, PendingTeardown, ResourceRegistry, RowDecision,
    SideWrites, StoreError,
};

#[derive(Debug)]
pub struct InMemoryJobStore {
    next_id: AtomicI64,
    rows: RwLock<HashMap<JobId, Arc<Mutex<Job>>>>,
    attributes: RwLock<HashMap<JobId, Vec<JobAttribute>>>,
    teardowns: Mutex<Vec<PendingTeardown>>,
    refuse_commits: AtomicBool,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            rows: RwLock::new(HashMap::new()),
            attributes: RwLock::new(HashMap::new()),
            teardowns: Mutex::new(Vec::new()),
            refuse_commits: AtomicBool::new(false),
        }
    }

    /// Make every committing `lock_and_update` fail after the closure ran.
    pub fn refuse_commits(&self, refuse: bool) {
        self.refuse_commits.store(refuse, Ordering::SeqCst);
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn row(&self, id: JobId) -> Result<Option<Arc<Mutex<Job>>>, StoreError> {
        let rows = self.rows.read().map_err(|_| StoreError::Poisoned)?;
        Ok(rows.get(&id).cloned())
    }

    /// Snapshot of every row matching `filter`, oldest first.
    fn select<F>(&self, page: Page, filter: F) -> Result<Vec<Job>, StoreError>
    where
        F: Fn(&Job) -> bool,
    {
        let handles: Vec<Arc<Mutex<Job>>> = {
            let rows = self.rows.read().map_err(|_| StoreError::Poisoned)?;
            rows.values().cloned().collect()
        };

        let mut selected = Vec::new();
        for handle in handles {
            let job = handle.lock().map_err(|_| StoreError::Poisoned)?;
            if filter(&job) {
                selected.push(job.clone());
            }
        }

        selected.sort_by_key(|j| (j.create_time, j.id));
        Ok(selected.into_iter().skip(page.offset).take(page.limit).collect())
    }

    fn apply_side_writes(&self, writes: SideWrites) -> Result<(), StoreError> {
        if !writes.attributes.is_empty() {
            let mut all = self.attributes.write().map_err(|_| StoreError::Poisoned)?;
            for attribute in writes.attributes {
                let existing = all.entry(attribute.job_id).or_default();
                if existing.iter().all(|a| a.key != attribute.key) {
                    existing.push(attribute);
                }
            }
        }
        if !writes.teardowns.is_empty() {
            let mut pending = self.teardowns.lock().map_err(|_| StoreError::Poisoned)?;
            for teardown in writes.teardowns {
                let known = pending.iter().any(|p| {
                    p.job_id == teardown.job_id && p.executor_identifier == teardown.executor_identifier
                });
                if !known {
                    pending.push(teardown);
                }
            }
        }
        Ok(())
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl JobStore for InMemoryJobStore {
    fn insert(&self, job: NewJob, now: DateTime<Utc>) -> Result<Job, StoreError> {
        job.validate()?;
        let id = JobId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        let job = job.into_job(id, now);
        let mut rows = self.rows.write().map_err(|_| StoreError::Poisoned)?;
        rows.insert(id, Arc::new(Mutex::new(job.clone())));
        Ok(job)
    }

    fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let Some(row) = self.row(id)? else {
            return Ok(None);
        };
        let job = row.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(Some(job.clone()))
    }

    fn attributes(&self, id: JobId) -> Result<Vec<JobAttribute>, StoreError> {
        let all = self.attributes.read().map_err(|_| StoreError::Poisoned)?;
        Ok(all.get(&id).cloned().unwrap_or_default())
    }

    fn find_by_status(&self, statuses: &[JobStatus], page: Page) -> Result<Vec<Job>, StoreError> {
        self.select(page, |job| statuses.contains(&job.status))
    }

    fn find_stale_running(
        &self,
        stale_before: DateTime<Utc>,
        page: Page,
    ) -> Result<Vec<Job>, StoreError> {
        self.select(page, |job| {
            job.status == JobStatus::Running && HeartbeatPolicy::last_alive(job) < stale_before
        })
    }

    fn find_executor_teardown(&self, page: Page) -> Result<Vec<Job>, StoreError> {
        self.select(page, Job::needs_executor_teardown)
    }

    fn count_active_executors(&self, run_mode: RunMode) -> Result<usize, StoreError> {
        let active = self.select(Page::first(usize::MAX), |job| {
            job.run_mode == run_mode
                && matches!(job.status, JobStatus::Running | JobStatus::Canceling)
        })?;
        Ok(active.len())
    }

    fn find_pending_teardowns(&self, page: Page) -> Result<Vec<PendingTeardown>, StoreError> {
        let pending = self.teardowns.lock().map_err(|_| StoreError::Poisoned)?;
        let mut selected = pending.clone();
        selected.sort_by_key(|p| (p.requested_time, p.job_id));
        Ok(selected.into_iter().skip(page.offset).take(page.limit).collect())
    }

    fn complete_teardown(
        &self,
        job_id: JobId,
        identifier: &ExecutorIdentifier,
    ) -> Result<bool, StoreError> {
        let mut pending = self.teardowns.lock().map_err(|_| StoreError::Poisoned)?;
        let before = pending.len();
        pending.retain(|p| !(p.job_id == job_id && p.executor_identifier == *identifier));
        Ok(pending.len() != before)
    }

    fn lock_and_update(
        &self,
        id: JobId,
        f: &mut dyn FnMut(&mut LockedRow) -> RowDecision,
    ) -> Result<LockOutcome, StoreError> {
        let Some(row) = self.row(id)? else {
            return Ok(LockOutcome::Missing);
        };
        let mut guard = row.lock().map_err(|_| StoreError::Poisoned)?;

        let mut locked = LockedRow::new(guard.clone());
        match f(&mut locked) {
            RowDecision::Abort => Ok(LockOutcome::Aborted(guard.clone())),
            RowDecision::Commit if self.refuse_commits.load(Ordering::SeqCst) => {
                Err(StoreError::Backend(format!("commit refused for job {id}")))
            }
            RowDecision::Commit => {
                let (mut job, writes) = locked.into_parts();
                job.id = id;
                self.apply_side_writes(writes)?;
                *guard = job.clone();
                Ok(LockOutcome::Committed(job))
            }
        }
    }
}

impl<T> JobStore for Arc<T>
where
    T: JobStore + ?Sized,
{
    fn insert(&self, job: NewJob, now: DateTime<Utc>) -> Result<Job, StoreError> {
        (**self).insert(job, now)
    }

    fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        (**self).get(id)
    }

    fn attributes(&self, id: JobId) -> Result<Vec<JobAttribute>, StoreError> {
        (**self).attributes(id)
    }

    fn find_by_status(&self, statuses: &[JobStatus], page: Page) -> Result<Vec<Job>, StoreError> {
        (**self).find_by_status(statuses, page)
    }

    fn find_stale_running(
        &self,
        stale_before: DateTime<Utc>,
        page: Page,
    ) -> Result<Vec<Job>, StoreError> {
        (**self).find_stale_running(stale_before, page)
    }

    fn find_executor_teardown(&self, page: Page) -> Result<Vec<Job>, StoreError> {
        (**self).find_executor_teardown(page)
    }

    fn count_active_executors(&self, run_mode: RunMode) -> Result<usize, StoreError> {
        (**self).count_active_executors(run_mode)
    }

    fn find_pending_teardowns(&self, page: Page) -> Result<Vec<PendingTeardown>, StoreError> {
        (**self).find_pending_teardowns(page)
    }

    fn complete_teardown(
        &self,
        job_id: JobId,
        identifier: &ExecutorIdentifier,
    ) -> Result<bool, StoreError> {
        (**self).complete_teardown(job_id, identifier)
    }

    fn lock_and_update(
        &self,
        id: JobId,
        f: &mut dyn FnMut(&mut LockedRow) -> RowDecision,
    ) -> Result<LockOutcome, StoreError> {
        (**self).lock_and_update(id, f)
    }
}

#[derive(Debug)]
pub struct InMemoryResourceRegistry {
    next_id: AtomicI64,
    rows: RwLock<HashMap<ResourceId, Resource>>,
}

impl InMemoryResourceRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            rows: RwLock::new(HashMap::new()),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn all(&self) -> Vec<Resource> {
        self.rows
            .read()
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    fn allocate(
        &self,
        resource_id: &ResourceId,
        resource_type: &str,
        status: ResourceState,
        now: DateTime<Utc>,
    ) -> Resource {
        Resource {
            row_id: ResourceRowId::new(self.next_id.fetch_add(1, Ordering::SeqCst)),
            resource_id: resource_id.clone(),
            resource_type: resource_type.to_string(),
            status,
            endpoint: None,
            create_time: now,
        }
    }
}

impl Default for InMemoryResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceRegistry for InMemoryResourceRegistry {
    fn register(
        &self,
        resource_id: &ResourceId,
        resource_type: &str,
        status: ResourceState,
        now: DateTime<Utc>,
    ) -> Result<Resource, StoreError> {
        let mut rows = self.rows.write().map_err(|_| StoreError::Poisoned)?;
        if let Some(existing) = rows.get(resource_id) {
            return Ok(existing.clone());
        }
        let resource = self.allocate(resource_id, resource_type, status, now);
        rows.insert(resource_id.clone(), resource.clone());
        Ok(resource)
    }

    fn get(&self, resource_id: &ResourceId) -> Result<Option<Resource>, StoreError> {
        let rows = self.rows.read().map_err(|_| StoreError::Poisoned)?;
        Ok(rows.get(resource_id).cloned())
    }

    fn mark_available(&self, resource_id: &ResourceId, endpoint: &str) -> Result<Resource, StoreError> {
        let mut rows = self.rows.write().map_err(|_| StoreError::Poisoned)?;
        let resource = rows
            .get_mut(resource_id)
            .ok_or_else(|| StoreError::ResourceNotFound(resource_id.clone()))?;
        resource.endpoint = Some(endpoint.to_string());
        if resource.status == ResourceState::Creating {
            resource.status = ResourceState::Available;
        }
        Ok(resource.clone())
    }

    fn mark_abandoned(
        &self,
        resource_id: &ResourceId,
        resource_type: &str,
        now: DateTime<Utc>,
    ) -> Result<Resource, StoreError> {
        let mut rows = self.rows.write().map_err(|_| StoreError::Poisoned)?;
        if let Some(resource) = rows.get_mut(resource_id) {
            resource.status = ResourceState::Abandoned;
            return Ok(resource.clone());
        }
        let resource = self.allocate(resource_id, resource_type, ResourceState::Abandoned, now);
        rows.insert(resource_id.clone(), resource.clone());
        Ok(resource)
    }

    fn find_abandoned(&self, page: Page) -> Result<Vec<Resource>, StoreError> {
        let rows = self.rows.read().map_err(|_| StoreError::Poisoned)?;
        let mut abandoned: Vec<Resource> = rows
            .values()
            .filter(|r| r.status == ResourceState::Abandoned)
            .cloned()
            .collect();
        abandoned.sort_by_key(|r| r.row_id);
        Ok(abandoned.into_iter().skip(page.offset).take(page.limit).collect())
    }

    fn delete(&self, row_id: ResourceRowId) -> Result<bool, StoreError> {
        let mut rows = self.rows.write().map_err(|_| StoreError::Poisoned)?;
        let before = rows.len();
        rows.retain(|_, r| r.row_id != row_id);
        Ok(rows.len() != before)
    }
}

impl<T> ResourceRegistry for Arc<T>
where
    T: ResourceRegistry + ?Sized,
{
    fn register(
        &self,
        resource_id: &ResourceId,
        resource_type: &str,
        status: ResourceState,
        now: DateTime<Utc>,
    ) -> Result<Resource, StoreError> {
        (**self).register(resource_id, resource_type, status, now)
    }

    fn get(&self, resource_id: &ResourceId) -> Result<Option<Resource>, StoreError> {
        (**self).get(resource_id)
    }

    fn mark_available(&self, resource_id: &ResourceId, endpoint: &str) -> Result<Resource, StoreError> {
        (**self).mark_available(resource_id, endpoint)
    }

    fn mark_abandoned(
        &self,
        resource_id: &ResourceId,
        resource_type: &str,
        now: DateTime<Utc>,
    ) -> Result<Resource, StoreError> {
        (**self).mark_abandoned(resource_id, resource_type, now)
    }

    fn find_abandoned(&self, page: Page) -> Result<Vec<Resource>, StoreError> {
        (**self).find_abandoned(page)
    }

    fn delete(&self, row_id: ResourceRowId) -> Result<bool, StoreError> {
        (**self).delete(row_id)
    }
}
