//! PostgreSQL-backed Job Store and Resource Registry.
//!
//! The store traits are synchronous; the async `sqlx` driver is bridged with a
//! `tokio` runtime handle. Callers must not be running on that runtime's worker
//! threads (daemons run on plain OS threads).
//!
//! `lock_and_update` opens a transaction, takes the row lock with
//! `SELECT ... FOR UPDATE`, runs the caller's closure outside the runtime, and
//! then writes the row, its new attributes and any queued executor teardowns
//! before committing. Concurrent
//! instances contending for the same row serialize on that lock.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use tracing::debug;

use taskfleet_core::{
    DomainError, ExecutorIdentifier, Job, JobAttribute, JobId, JobProperties, JobStatus, NewJob,
    Resource, ResourceId, ResourceLocation, ResourceRowId, ResourceState, RunMode,
};

use super::{
    JobStore, LockOutcome, LockedRow, Page, PendingTeardown, ResourceRegistry, RowDecision,
    SideWrites, StoreError,
};

/// DDL for the scheduler tables. Safe to run repeatedly.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tf_job (
    id                      BIGSERIAL PRIMARY KEY,
    status                  TEXT NOT NULL,
    run_mode                TEXT NOT NULL,
    job_type                TEXT NOT NULL,
    job_parameters_json     TEXT,
    executor_identifier     TEXT,
    executor_endpoint       TEXT,
    execution_times         INTEGER NOT NULL DEFAULT 0,
    progress_percentage     DOUBLE PRECISION NOT NULL DEFAULT 0,
    result_json             TEXT,
    job_properties_json     TEXT,
    heartbeat_time          TIMESTAMPTZ,
    create_time             TIMESTAMPTZ NOT NULL,
    started_time            TIMESTAMPTZ,
    cancelling_time         TIMESTAMPTZ,
    finished_time           TIMESTAMPTZ,
    executor_destroyed_time TIMESTAMPTZ,
    description             TEXT,
    organization_id         BIGINT
);

CREATE INDEX IF NOT EXISTS tf_job_status_create_time ON tf_job (status, create_time);

CREATE TABLE IF NOT EXISTS tf_job_attribute (
    job_id          BIGINT NOT NULL REFERENCES tf_job (id),
    attribute_key   TEXT NOT NULL,
    attribute_value TEXT NOT NULL,
    create_time     TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (job_id, attribute_key)
);

CREATE TABLE IF NOT EXISTS tf_resource (
    id            BIGSERIAL PRIMARY KEY,
    region        TEXT NOT NULL,
    group_name    TEXT NOT NULL,
    namespace     TEXT NOT NULL,
    resource_name TEXT NOT NULL,
    resource_type TEXT NOT NULL,
    status        TEXT NOT NULL,
    endpoint      TEXT,
    create_time   TIMESTAMPTZ NOT NULL,
    UNIQUE (region, group_name, namespace, resource_name)
);

CREATE TABLE IF NOT EXISTS tf_executor_teardown (
    job_id              BIGINT NOT NULL REFERENCES tf_job (id),
    executor_identifier TEXT NOT NULL,
    requested_time      TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (job_id, executor_identifier)
);
"#;

const JOB_COLUMNS: &str = "id, status, run_mode, job_type, job_parameters_json, \
    executor_identifier, executor_endpoint, execution_times, progress_percentage, result_json, \
    job_properties_json, heartbeat_time, create_time, started_time, cancelling_time, \
    finished_time, executor_destroyed_time, description, organization_id";

const RESOURCE_COLUMNS: &str =
    "id, region, group_name, namespace, resource_name, resource_type, status, endpoint, create_time";

const TERMINAL_STATUSES: [&str; 3] = ["DONE", "FAILED", "CANCELED"];

fn db_err(err: sqlx::Error) -> StoreError {
    StoreError::backend(err)
}

fn page_bounds(page: Page) -> (i64, i64) {
    let offset = i64::try_from(page.offset).unwrap_or(i64::MAX);
    let limit = i64::try_from(page.limit).unwrap_or(i64::MAX);
    (offset, limit)
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let status: String = row.try_get("status").map_err(db_err)?;
    let run_mode: String = row.try_get("run_mode").map_err(db_err)?;
    let identifier: Option<String> = row.try_get("executor_identifier").map_err(db_err)?;
    let properties: Option<String> = row.try_get("job_properties_json").map_err(db_err)?;
    let execution_times: i32 = row.try_get("execution_times").map_err(db_err)?;

    Ok(Job {
        id: JobId::new(row.try_get("id").map_err(db_err)?),
        status: status.parse()?,
        run_mode: run_mode.parse()?,
        job_type: row.try_get("job_type").map_err(db_err)?,
        job_parameters_json: row.try_get("job_parameters_json").map_err(db_err)?,
        executor_identifier: identifier
            .as_deref()
            .map(str::parse::<ExecutorIdentifier>)
            .transpose()?,
        executor_endpoint: row.try_get("executor_endpoint").map_err(db_err)?,
        execution_times: u32::try_from(execution_times)
            .map_err(|_| DomainError::malformed(format!("execution_times {execution_times}")))?,
        progress_percentage: row.try_get("progress_percentage").map_err(db_err)?,
        result_json: row.try_get("result_json").map_err(db_err)?,
        job_properties: JobProperties::from_json(properties.as_deref())?,
        heartbeat_time: row.try_get("heartbeat_time").map_err(db_err)?,
        create_time: row.try_get("create_time").map_err(db_err)?,
        started_time: row.try_get("started_time").map_err(db_err)?,
        cancelling_time: row.try_get("cancelling_time").map_err(db_err)?,
        finished_time: row.try_get("finished_time").map_err(db_err)?,
        executor_destroyed_time: row.try_get("executor_destroyed_time").map_err(db_err)?,
        description: row.try_get("description").map_err(db_err)?,
        organization_id: row.try_get("organization_id").map_err(db_err)?,
    })
}

fn resource_from_row(row: &PgRow) -> Result<Resource, StoreError> {
    let location = ResourceLocation::new(
        row.try_get::<String, _>("region").map_err(db_err)?,
        row.try_get::<String, _>("group_name").map_err(db_err)?,
    );
    let resource_id = ResourceId::new(
        location,
        row.try_get::<String, _>("namespace").map_err(db_err)?,
        row.try_get::<String, _>("resource_name").map_err(db_err)?,
    )?;
    let status: String = row.try_get("status").map_err(db_err)?;

    Ok(Resource {
        row_id: ResourceRowId::new(row.try_get("id").map_err(db_err)?),
        resource_id,
        resource_type: row.try_get("resource_type").map_err(db_err)?,
        status: status.parse()?,
        endpoint: row.try_get("endpoint").map_err(db_err)?,
        create_time: row.try_get("create_time").map_err(db_err)?,
    })
}

/// Shared pool + runtime bridge.
#[derive(Debug, Clone)]
struct Bridge {
    pool: Arc<PgPool>,
    handle: Handle,
}

impl Bridge {
    fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.handle.block_on(fut)
    }
}

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    bridge: Bridge,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self {
            bridge: Bridge {
                pool: Arc::new(pool),
                handle,
            },
        }
    }

    /// Create the scheduler tables if they do not exist.
    pub fn ensure_schema(&self) -> Result<(), StoreError> {
        let pool = self.bridge.pool.clone();
        self.bridge.block_on(async move {
            sqlx::raw_sql(SCHEMA).execute(&*pool).await.map_err(db_err)?;
            Ok(())
        })
    }

    fn select(&self, sql: String, binds: SelectBinds) -> Result<Vec<Job>, StoreError> {
        let pool = self.bridge.pool.clone();
        let rows = self.bridge.block_on(async move {
            let mut query = sqlx::query(&sql);
            if let Some(statuses) = binds.statuses {
                query = query.bind(statuses);
            }
            if let Some(before) = binds.before {
                query = query.bind(before);
            }
            let (offset, limit) = page_bounds(binds.page);
            query
                .bind(offset)
                .bind(limit)
                .fetch_all(&*pool)
                .await
                .map_err(db_err)
        })?;
        rows.iter().map(job_from_row).collect()
    }

    async fn write_row(
        tx: &mut Transaction<'static, Postgres>,
        job: &Job,
        writes: &SideWrites,
    ) -> Result<(), StoreError> {
        let properties = job.job_properties.to_json()?;
        let execution_times = i32::try_from(job.execution_times)
            .map_err(|_| DomainError::validation("execution_times overflow"))?;

        sqlx::query(
            r#"
            UPDATE tf_job SET
                status = $2,
                executor_identifier = $3,
                executor_endpoint = $4,
                execution_times = $5,
                progress_percentage = $6,
                result_json = $7,
                job_properties_json = $8,
                heartbeat_time = $9,
                started_time = $10,
                cancelling_time = $11,
                finished_time = $12,
                executor_destroyed_time = $13,
                description = $14
            WHERE id = $1
            "#,
        )
        .bind(job.id.get())
        .bind(job.status.as_str())
        .bind(job.executor_identifier.as_ref().map(ToString::to_string))
        .bind(job.executor_endpoint.as_deref())
        .bind(execution_times)
        .bind(job.progress_percentage)
        .bind(job.result_json.as_deref())
        .bind(properties)
        .bind(job.heartbeat_time)
        .bind(job.started_time)
        .bind(job.cancelling_time)
        .bind(job.finished_time)
        .bind(job.executor_destroyed_time)
        .bind(job.description.as_deref())
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;

        for attribute in &writes.attributes {
            sqlx::query(
                r#"
                INSERT INTO tf_job_attribute (job_id, attribute_key, attribute_value)
                VALUES ($1, $2, $3)
                ON CONFLICT (job_id, attribute_key) DO NOTHING
                "#,
            )
            .bind(attribute.job_id.get())
            .bind(&attribute.key)
            .bind(&attribute.value)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        }

        for teardown in &writes.teardowns {
            sqlx::query(
                r#"
                INSERT INTO tf_executor_teardown (job_id, executor_identifier, requested_time)
                VALUES ($1, $2, $3)
                ON CONFLICT (job_id, executor_identifier) DO NOTHING
                "#,
            )
            .bind(teardown.job_id.get())
            .bind(teardown.executor_identifier.to_string())
            .bind(teardown.requested_time)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        }

        Ok(())
    }
}

#[derive(Debug)]
struct SelectBinds {
    statuses: Option<Vec<String>>,
    before: Option<DateTime<Utc>>,
    page: Page,
}

impl JobStore for PostgresJobStore {
    fn insert(&self, job: NewJob, now: DateTime<Utc>) -> Result<Job, StoreError> {
        job.validate()?;
        // Build the row with a placeholder id, then take the one Postgres assigns.
        let draft = job.into_job(JobId::new(0), now);
        let properties = draft.job_properties.to_json()?;
        let pool = self.bridge.pool.clone();

        let row = self.bridge.block_on(async move {
            sqlx::query(&format!(
                r#"
                INSERT INTO tf_job (status, run_mode, job_type, job_parameters_json,
                    execution_times, progress_percentage, job_properties_json, create_time,
                    organization_id)
                VALUES ($1, $2, $3, $4, 0, 0, $5, $6, $7)
                RETURNING {JOB_COLUMNS}
                "#
            ))
            .bind(draft.status.as_str())
            .bind(draft.run_mode.as_str())
            .bind(&draft.job_type)
            .bind(draft.job_parameters_json.as_deref())
            .bind(properties)
            .bind(draft.create_time)
            .bind(draft.organization_id)
            .fetch_one(&*pool)
            .await
            .map_err(db_err)
        })?;

        job_from_row(&row)
    }

    fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let pool = self.bridge.pool.clone();
        let row = self.bridge.block_on(async move {
            sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM tf_job WHERE id = $1"))
                .bind(id.get())
                .fetch_optional(&*pool)
                .await
                .map_err(db_err)
        })?;
        row.as_ref().map(job_from_row).transpose()
    }

    fn attributes(&self, id: JobId) -> Result<Vec<JobAttribute>, StoreError> {
        let pool = self.bridge.pool.clone();
        let rows = self.bridge.block_on(async move {
            sqlx::query(
                r#"
                SELECT attribute_key, attribute_value
                FROM tf_job_attribute
                WHERE job_id = $1
                ORDER BY create_time, attribute_key
                "#,
            )
            .bind(id.get())
            .fetch_all(&*pool)
            .await
            .map_err(db_err)
        })?;

        rows.iter()
            .map(|row| {
                Ok(JobAttribute::new(
                    id,
                    row.try_get::<String, _>("attribute_key").map_err(db_err)?,
                    row.try_get::<String, _>("attribute_value").map_err(db_err)?,
                ))
            })
            .collect()
    }

    fn find_by_status(&self, statuses: &[JobStatus], page: Page) -> Result<Vec<Job>, StoreError> {
        let statuses = statuses.iter().map(|s| s.as_str().to_string()).collect();
        self.select(
            format!(
                "SELECT {JOB_COLUMNS} FROM tf_job WHERE status = ANY($1) \
                 ORDER BY create_time, id OFFSET $2 LIMIT $3"
            ),
            SelectBinds {
                statuses: Some(statuses),
                before: None,
                page,
            },
        )
    }

    fn find_stale_running(
        &self,
        stale_before: DateTime<Utc>,
        page: Page,
    ) -> Result<Vec<Job>, StoreError> {
        self.select(
            format!(
                "SELECT {JOB_COLUMNS} FROM tf_job WHERE status = 'RUNNING' \
                 AND COALESCE(heartbeat_time, started_time, create_time) < $1 \
                 ORDER BY create_time, id OFFSET $2 LIMIT $3"
            ),
            SelectBinds {
                statuses: None,
                before: Some(stale_before),
                page,
            },
        )
    }

    fn find_executor_teardown(&self, page: Page) -> Result<Vec<Job>, StoreError> {
        let statuses = TERMINAL_STATUSES.iter().map(|s| s.to_string()).collect();
        self.select(
            format!(
                "SELECT {JOB_COLUMNS} FROM tf_job WHERE status = ANY($1) \
                 AND executor_identifier IS NOT NULL AND executor_destroyed_time IS NULL \
                 ORDER BY create_time, id OFFSET $2 LIMIT $3"
            ),
            SelectBinds {
                statuses: Some(statuses),
                before: None,
                page,
            },
        )
    }

    fn count_active_executors(&self, run_mode: RunMode) -> Result<usize, StoreError> {
        let pool = self.bridge.pool.clone();
        let count: i64 = self.bridge.block_on(async move {
            sqlx::query_scalar(
                "SELECT COUNT(*) FROM tf_job WHERE run_mode = $1 AND status IN ('RUNNING', 'CANCELING')",
            )
            .bind(run_mode.as_str())
            .fetch_one(&*pool)
            .await
            .map_err(db_err)
        })?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn find_pending_teardowns(&self, page: Page) -> Result<Vec<PendingTeardown>, StoreError> {
        let pool = self.bridge.pool.clone();
        let (offset, limit) = page_bounds(page);
        let rows = self.bridge.block_on(async move {
            sqlx::query(
                r#"
                SELECT job_id, executor_identifier, requested_time
                FROM tf_executor_teardown
                ORDER BY requested_time, job_id
                OFFSET $1 LIMIT $2
                "#,
            )
            .bind(offset)
            .bind(limit)
            .fetch_all(&*pool)
            .await
            .map_err(db_err)
        })?;

        rows.iter()
            .map(|row| {
                let identifier: String = row.try_get("executor_identifier").map_err(db_err)?;
                Ok(PendingTeardown {
                    job_id: JobId::new(row.try_get("job_id").map_err(db_err)?),
                    executor_identifier: identifier.parse()?,
                    requested_time: row.try_get("requested_time").map_err(db_err)?,
                })
            })
            .collect()
    }

    fn complete_teardown(
        &self,
        job_id: JobId,
        identifier: &ExecutorIdentifier,
    ) -> Result<bool, StoreError> {
        let pool = self.bridge.pool.clone();
        let identifier = identifier.to_string();
        let result = self.bridge.block_on(async move {
            sqlx::query(
                "DELETE FROM tf_executor_teardown WHERE job_id = $1 AND executor_identifier = $2",
            )
            .bind(job_id.get())
            .bind(identifier)
            .execute(&*pool)
            .await
            .map_err(db_err)
        })?;
        Ok(result.rows_affected() > 0)
    }

    fn lock_and_update(
        &self,
        id: JobId,
        f: &mut dyn FnMut(&mut LockedRow) -> RowDecision,
    ) -> Result<LockOutcome, StoreError> {
        let pool = self.bridge.pool.clone();
        let mut tx = self
            .bridge
            .block_on(async move { pool.begin().await })
            .map_err(db_err)?;

        let row = self.bridge.block_on(async {
            sqlx::query(&format!(
                "SELECT {JOB_COLUMNS} FROM tf_job WHERE id = $1 FOR UPDATE"
            ))
            .bind(id.get())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)
        })?;

        let Some(row) = row else {
            let _ = self.bridge.block_on(tx.rollback());
            return Ok(LockOutcome::Missing);
        };
        let current = job_from_row(&row)?;

        let mut locked = LockedRow::new(current.clone());
        match f(&mut locked) {
            RowDecision::Abort => {
                self.bridge.block_on(tx.rollback()).map_err(db_err)?;
                debug!(job_id = %id, "row lock released without changes");
                Ok(LockOutcome::Aborted(current))
            }
            RowDecision::Commit => {
                let (mut job, writes) = locked.into_parts();
                job.id = id;
                self.bridge.block_on(async {
                    Self::write_row(&mut tx, &job, &writes).await?;
                    tx.commit().await.map_err(db_err)
                })?;
                Ok(LockOutcome::Committed(job))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct PostgresResourceRegistry {
    bridge: Bridge,
}

impl PostgresResourceRegistry {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self {
            bridge: Bridge {
                pool: Arc::new(pool),
                handle,
            },
        }
    }

    fn fetch_one(
        &self,
        sql: String,
        resource_id: &ResourceId,
        extra: Vec<Extra>,
    ) -> Result<Option<Resource>, StoreError> {
        let pool = self.bridge.pool.clone();
        let id = resource_id.clone();
        let row = self.bridge.block_on(async move {
            let mut query = sqlx::query(&sql)
                .bind(id.location.region)
                .bind(id.location.group)
                .bind(id.namespace)
                .bind(id.name);
            for value in extra {
                query = match value {
                    Extra::Text(text) => query.bind(text),
                    Extra::Time(time) => query.bind(time),
                };
            }
            query.fetch_optional(&*pool).await.map_err(db_err)
        })?;
        row.as_ref().map(resource_from_row).transpose()
    }
}

/// Trailing bind values after the four composite-id columns.
#[derive(Debug)]
enum Extra {
    Text(String),
    Time(DateTime<Utc>),
}

impl ResourceRegistry for PostgresResourceRegistry {
    fn register(
        &self,
        resource_id: &ResourceId,
        resource_type: &str,
        status: ResourceState,
        now: DateTime<Utc>,
    ) -> Result<Resource, StoreError> {
        // The no-op update makes RETURNING yield the existing row on conflict.
        self.fetch_one(
            format!(
                r#"
                INSERT INTO tf_resource (region, group_name, namespace, resource_name,
                    resource_type, status, create_time)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (region, group_name, namespace, resource_name)
                DO UPDATE SET resource_type = tf_resource.resource_type
                RETURNING {RESOURCE_COLUMNS}
                "#
            ),
            resource_id,
            vec![
                Extra::Text(resource_type.to_string()),
                Extra::Text(status.as_str().to_string()),
                Extra::Time(now),
            ],
        )?
        .ok_or_else(|| StoreError::ResourceNotFound(resource_id.clone()))
    }

    fn get(&self, resource_id: &ResourceId) -> Result<Option<Resource>, StoreError> {
        self.fetch_one(
            format!(
                "SELECT {RESOURCE_COLUMNS} FROM tf_resource \
                 WHERE region = $1 AND group_name = $2 AND namespace = $3 AND resource_name = $4"
            ),
            resource_id,
            Vec::new(),
        )
    }

    fn mark_available(&self, resource_id: &ResourceId, endpoint: &str) -> Result<Resource, StoreError> {
        self.fetch_one(
            format!(
                r#"
                UPDATE tf_resource SET
                    endpoint = $5,
                    status = CASE WHEN status = 'CREATING' THEN 'AVAILABLE' ELSE status END
                WHERE region = $1 AND group_name = $2 AND namespace = $3 AND resource_name = $4
                RETURNING {RESOURCE_COLUMNS}
                "#
            ),
            resource_id,
            vec![Extra::Text(endpoint.to_string())],
        )?
        .ok_or_else(|| StoreError::ResourceNotFound(resource_id.clone()))
    }

    fn mark_abandoned(
        &self,
        resource_id: &ResourceId,
        resource_type: &str,
        now: DateTime<Utc>,
    ) -> Result<Resource, StoreError> {
        self.fetch_one(
            format!(
                r#"
                INSERT INTO tf_resource (region, group_name, namespace, resource_name,
                    resource_type, status, create_time)
                VALUES ($1, $2, $3, $4, $5, 'ABANDONED', $6)
                ON CONFLICT (region, group_name, namespace, resource_name)
                DO UPDATE SET status = 'ABANDONED'
                RETURNING {RESOURCE_COLUMNS}
                "#
            ),
            resource_id,
            vec![Extra::Text(resource_type.to_string()), Extra::Time(now)],
        )?
        .ok_or_else(|| StoreError::ResourceNotFound(resource_id.clone()))
    }

    fn find_abandoned(&self, page: Page) -> Result<Vec<Resource>, StoreError> {
        let pool = self.bridge.pool.clone();
        let (offset, limit) = page_bounds(page);
        let rows = self.bridge.block_on(async move {
            sqlx::query(&format!(
                "SELECT {RESOURCE_COLUMNS} FROM tf_resource WHERE status = 'ABANDONED' \
                 ORDER BY id OFFSET $1 LIMIT $2"
            ))
            .bind(offset)
            .bind(limit)
            .fetch_all(&*pool)
            .await
            .map_err(db_err)
        })?;
        rows.iter().map(resource_from_row).collect()
    }

    fn delete(&self, row_id: ResourceRowId) -> Result<bool, StoreError> {
        let pool = self.bridge.pool.clone();
        let result = self.bridge.block_on(async move {
            sqlx::query("DELETE FROM tf_resource WHERE id = $1")
                .bind(row_id.get())
                .execute(&*pool)
                .await
                .map_err(db_err)
        })?;
        Ok(result.rows_affected() > 0)
    }
}
