use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use taskfleet_core::JobId;

/// Envelope for a scheduler event.
///
/// - `event_id` is a time-ordered UUID (v7), so consumers can deduplicate.
/// - `job_id` is the job whose transition produced the event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    job_id: JobId,
    occurred_at: DateTime<Utc>,
    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(event_id: Uuid, job_id: JobId, occurred_at: DateTime<Utc>, payload: E) -> Self {
        Self {
            event_id,
            job_id,
            occurred_at,
            payload,
        }
    }

    /// New envelope with a fresh v7 id.
    pub fn wrap(job_id: JobId, occurred_at: DateTime<Utc>, payload: E) -> Self {
        Self::new(Uuid::now_v7(), job_id, occurred_at, payload)
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }
}
