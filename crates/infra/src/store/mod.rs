//! Job Store and Resource Registry contracts.
//!
//! Every mutation of a job row goes through [`JobStore::lock_and_update`]: the
//! store re-reads the row under an exclusive lock, hands it to a closure, and
//! either writes the closure's changes (plus any queued attributes and
//! executor teardowns) in the same unit of work or discards them. [`transition`] layers the expected
//! source-state check and the lifecycle table on top of it.

use chrono::{DateTime, Utc};

use taskfleet_core::{
    DomainError, ExecutorIdentifier, Job, JobAttribute, JobId, JobStatus, NewJob, Resource,
    ResourceId, ResourceRowId, ResourceState, RunMode,
};

pub mod in_memory;
pub mod postgres;

pub use in_memory::{InMemoryJobStore, InMemoryResourceRegistry};
pub use postgres::{PostgresJobStore, PostgresResourceRegistry};

/// Storage error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("resource not found: {0}")]
    ResourceNotFound(ResourceId),
    #[error("storage lock poisoned")]
    Poisoned,
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("storage error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }
}

/// One bounded page of a candidate query.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Page {
    pub fn first(limit: usize) -> Self {
        Self { offset: 0, limit }
    }
}

/// An executor superseded by a later attempt of its job.
///
/// Persisted with the transition that replaced it and removed once the
/// executor is gone, so teardown survives restarts and lost events.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTeardown {
    pub job_id: JobId,
    pub executor_identifier: ExecutorIdentifier,
    pub requested_time: DateTime<Utc>,
}

/// Rows written alongside the job row when a [`LockedRow`] commits.
#[derive(Debug, Clone, Default)]
pub struct SideWrites {
    pub attributes: Vec<JobAttribute>,
    pub teardowns: Vec<PendingTeardown>,
}

/// A job row held under its exclusive lock.
#[derive(Debug, Clone)]
pub struct LockedRow {
    job: Job,
    writes: SideWrites,
}

impl LockedRow {
    pub fn new(job: Job) -> Self {
        Self {
            job,
            writes: SideWrites::default(),
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn job_mut(&mut self) -> &mut Job {
        &mut self.job
    }

    /// Queue an attribute to be inserted with this row's commit.
    ///
    /// Keys that already exist for the job are ignored by the store.
    pub fn add_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let attribute = JobAttribute::new(self.job.id, key, value);
        self.writes.attributes.push(attribute);
    }

    /// Queue the row's current executor for teardown with this commit.
    pub fn request_teardown(&mut self, now: DateTime<Utc>) {
        if let Some(identifier) = &self.job.executor_identifier {
            self.writes.teardowns.push(PendingTeardown {
                job_id: self.job.id,
                executor_identifier: identifier.clone(),
                requested_time: now,
            });
        }
    }

    pub fn into_parts(self) -> (Job, SideWrites) {
        (self.job, self.writes)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RowDecision {
    Commit,
    Abort,
}

/// Result of one locked unit of work.
#[derive(Debug, Clone, PartialEq)]
pub enum LockOutcome {
    /// Changes written; the row as committed.
    Committed(Job),
    /// Nothing written; the row as read under the lock.
    Aborted(Job),
    Missing,
}

/// Persisted jobs and their append-only attributes.
pub trait JobStore: Send + Sync {
    /// Insert a PREPARING row and assign its id.
    fn insert(&self, job: NewJob, now: DateTime<Utc>) -> Result<Job, StoreError>;

    fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    fn attributes(&self, id: JobId) -> Result<Vec<JobAttribute>, StoreError>;

    /// Rows in any of `statuses`, oldest first.
    fn find_by_status(&self, statuses: &[JobStatus], page: Page) -> Result<Vec<Job>, StoreError>;

    /// RUNNING rows whose last sign of life is older than `stale_before`, oldest first.
    fn find_stale_running(
        &self,
        stale_before: DateTime<Utc>,
        page: Page,
    ) -> Result<Vec<Job>, StoreError>;

    /// Terminal rows that still have an executor to tear down.
    fn find_executor_teardown(&self, page: Page) -> Result<Vec<Job>, StoreError>;

    /// RUNNING and CANCELING rows of one run mode.
    fn count_active_executors(&self, run_mode: RunMode) -> Result<usize, StoreError>;

    /// Superseded executors still waiting for teardown, oldest first.
    fn find_pending_teardowns(&self, page: Page) -> Result<Vec<PendingTeardown>, StoreError>;

    /// Forget a pending teardown. Returns `false` when it was already gone.
    fn complete_teardown(
        &self,
        job_id: JobId,
        identifier: &ExecutorIdentifier,
    ) -> Result<bool, StoreError>;

    /// Run `f` against the row while holding its exclusive lock.
    fn lock_and_update(
        &self,
        id: JobId,
        f: &mut dyn FnMut(&mut LockedRow) -> RowDecision,
    ) -> Result<LockOutcome, StoreError>;
}

/// Resources provisioned for CLUSTER executors.
pub trait ResourceRegistry: Send + Sync {
    /// Insert (or return the existing row for) `resource_id`.
    fn register(
        &self,
        resource_id: &ResourceId,
        resource_type: &str,
        status: ResourceState,
        now: DateTime<Utc>,
    ) -> Result<Resource, StoreError>;

    fn get(&self, resource_id: &ResourceId) -> Result<Option<Resource>, StoreError>;

    /// Record the endpoint of a running pod and flip CREATING to AVAILABLE.
    fn mark_available(&self, resource_id: &ResourceId, endpoint: &str) -> Result<Resource, StoreError>;

    /// Mark for teardown; unknown ids are registered directly as ABANDONED.
    fn mark_abandoned(
        &self,
        resource_id: &ResourceId,
        resource_type: &str,
        now: DateTime<Utc>,
    ) -> Result<Resource, StoreError>;

    fn find_abandoned(&self, page: Page) -> Result<Vec<Resource>, StoreError>;

    /// Returns `false` when the row was already gone.
    fn delete(&self, row_id: ResourceRowId) -> Result<bool, StoreError>;
}

/// Outcome of a guarded transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Applied(Job),
    /// The row was in an expected state but the change chose not to write.
    Skipped(Job),
    /// The row moved on before we locked it.
    Stale { current: JobStatus },
    Missing,
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied(_))
    }
}

/// Lock the row, verify it is in one of `expected`, then apply `change`.
///
/// `change` returning `Abort` leaves the row untouched. A change that moves the
/// status along an edge the lifecycle does not allow is rejected with
/// [`DomainError::IllegalTransition`] and nothing is written.
pub fn transition<S, F>(
    store: &S,
    id: JobId,
    expected: &[JobStatus],
    change: F,
) -> Result<Transition, StoreError>
where
    S: JobStore + ?Sized,
    F: FnOnce(&mut LockedRow) -> Result<RowDecision, DomainError>,
{
    let mut change = Some(change);
    let mut stale: Option<JobStatus> = None;
    let mut failure: Option<DomainError> = None;

    let outcome = store.lock_and_update(id, &mut |row| {
        let current = row.job().status;
        if !expected.contains(&current) {
            stale = Some(current);
            return RowDecision::Abort;
        }
        let Some(change) = change.take() else {
            return RowDecision::Abort;
        };
        match change(row) {
            Ok(RowDecision::Commit) => {
                let next = row.job().status;
                if next != current && !current.can_transition_to(next) {
                    failure = Some(DomainError::IllegalTransition { from: current, to: next });
                    return RowDecision::Abort;
                }
                RowDecision::Commit
            }
            Ok(RowDecision::Abort) => RowDecision::Abort,
            Err(err) => {
                failure = Some(err);
                RowDecision::Abort
            }
        }
    })?;

    if let Some(err) = failure {
        return Err(StoreError::Domain(err));
    }

    Ok(match outcome {
        LockOutcome::Committed(job) => Transition::Applied(job),
        LockOutcome::Aborted(job) => match stale {
            Some(current) => Transition::Stale { current },
            None => Transition::Skipped(job),
        },
        LockOutcome::Missing => Transition::Missing,
    })
}
