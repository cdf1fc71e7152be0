//! Heartbeat staleness, expiry, and retry-after-heartbeat-timeout decisions.
//!
//! Everything here is pure: callers pass `now` explicitly.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{Job, JobProperties};

/// Ten years; keeps `chrono::Duration` arithmetic in range.
pub const MAX_TIMEOUT_SECONDS: i64 = 10 * 365 * 24 * 3600;

/// Process-wide fallback when a job enables retry without its own maximum.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryDefaults {
    pub max_retry_times: u32,
}

impl Default for RetryDefaults {
    fn default() -> Self {
        Self { max_retry_times: 3 }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue as RETRYING.
    Retry,
    /// Retry enabled but `execution_times` reached the maximum.
    Exhausted { max: u32 },
    /// The job did not opt in.
    Disabled,
}

impl RetryDecision {
    pub fn should_retry(&self) -> bool {
        matches!(self, RetryDecision::Retry)
    }
}

pub struct RetryPolicy;

impl RetryPolicy {
    pub fn decide(
        properties: &JobProperties,
        defaults: RetryDefaults,
        execution_times: u32,
    ) -> RetryDecision {
        if !properties.enable_retry_after_heart_timeout {
            return RetryDecision::Disabled;
        }
        let max = properties
            .max_retry_times_after_heart_timeout
            .unwrap_or(defaults.max_retry_times);
        if execution_times < max {
            RetryDecision::Retry
        } else {
            RetryDecision::Exhausted { max }
        }
    }
}

/// Liveness rules for dispatched and not-yet-dispatched jobs.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HeartbeatPolicy {
    timeout: Duration,
}

impl HeartbeatPolicy {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn from_seconds(seconds: u64) -> Self {
        let seconds = seconds.min(MAX_TIMEOUT_SECONDS as u64) as i64;
        Self::new(Duration::seconds(seconds))
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Most recent sign of life: heartbeat, else dispatch time, else creation.
    pub fn last_alive(job: &Job) -> DateTime<Utc> {
        job.heartbeat_time
            .or(job.started_time)
            .unwrap_or(job.create_time)
    }

    /// Rows whose last sign of life is older than this are stale.
    pub fn stale_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.timeout
    }

    pub fn is_stale(&self, job: &Job, now: DateTime<Utc>) -> bool {
        Self::last_alive(job) < self.stale_before(now)
    }

    /// Declared expiry passed before the job ever started running.
    pub fn is_expired(job: &Job, now: DateTime<Utc>) -> bool {
        let Some(seconds) = job.job_properties.expire_if_not_running_after_seconds else {
            return false;
        };
        let seconds = seconds.min(MAX_TIMEOUT_SECONDS as u64) as i64;
        job.status.is_pending_dispatch() && now > job.create_time + Duration::seconds(seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::JobId;
    use crate::job::NewJob;
    use crate::status::{JobStatus, RunMode};
    use proptest::prelude::*;

    fn job_at(create_time: DateTime<Utc>) -> Job {
        NewJob::new("report", RunMode::Cluster)
            .created_at(create_time)
            .into_job(JobId::new(1), create_time)
    }

    #[test]
    fn retry_table() {
        let defaults = RetryDefaults { max_retry_times: 3 };
        let disabled = JobProperties::default();
        let own_max = JobProperties::with_retry(Some(1));
        let default_max = JobProperties::with_retry(None);

        assert_eq!(RetryPolicy::decide(&disabled, defaults, 0), RetryDecision::Disabled);
        assert_eq!(RetryPolicy::decide(&own_max, defaults, 0), RetryDecision::Retry);
        assert_eq!(
            RetryPolicy::decide(&own_max, defaults, 1),
            RetryDecision::Exhausted { max: 1 }
        );
        assert_eq!(RetryPolicy::decide(&default_max, defaults, 2), RetryDecision::Retry);
        assert_eq!(
            RetryPolicy::decide(&default_max, defaults, 3),
            RetryDecision::Exhausted { max: 3 }
        );
    }

    #[test]
    fn last_alive_prefers_heartbeat_then_start_then_create() {
        let t0 = Utc::now() - Duration::minutes(10);
        let mut job = job_at(t0);
        assert_eq!(HeartbeatPolicy::last_alive(&job), t0);

        job.started_time = Some(t0 + Duration::minutes(1));
        assert_eq!(HeartbeatPolicy::last_alive(&job), t0 + Duration::minutes(1));

        job.heartbeat_time = Some(t0 + Duration::minutes(5));
        assert_eq!(HeartbeatPolicy::last_alive(&job), t0 + Duration::minutes(5));
    }

    #[test]
    fn staleness_uses_timeout_window() {
        let now = Utc::now();
        let policy = HeartbeatPolicy::from_seconds(60);
        let mut job = job_at(now - Duration::minutes(10));
        job.status = JobStatus::Running;

        job.heartbeat_time = Some(now - Duration::seconds(30));
        assert!(!policy.is_stale(&job, now));

        job.heartbeat_time = Some(now - Duration::seconds(61));
        assert!(policy.is_stale(&job, now));
    }

    #[test]
    fn expiry_only_applies_before_running() {
        let now = Utc::now();
        let mut job = job_at(now - Duration::seconds(120));
        assert!(!HeartbeatPolicy::is_expired(&job, now));

        job.job_properties = JobProperties::default().expiring_after(60);
        assert!(HeartbeatPolicy::is_expired(&job, now));

        job.status = JobStatus::Retrying;
        assert!(HeartbeatPolicy::is_expired(&job, now));

        job.status = JobStatus::Running;
        assert!(!HeartbeatPolicy::is_expired(&job, now));

        job.status = JobStatus::Preparing;
        job.job_properties = JobProperties::default().expiring_after(600);
        assert!(!HeartbeatPolicy::is_expired(&job, now));
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, .. ProptestConfig::default() })]

        #[test]
        fn retries_iff_enabled_and_below_max(
            enabled in any::<bool>(),
            own_max in proptest::option::of(0u32..10),
            default_max in 0u32..10,
            execution_times in 0u32..20,
        ) {
            let props = JobProperties {
                enable_retry_after_heart_timeout: enabled,
                max_retry_times_after_heart_timeout: own_max,
                expire_if_not_running_after_seconds: None,
            };
            let decision = RetryPolicy::decide(
                &props,
                RetryDefaults { max_retry_times: default_max },
                execution_times,
            );
            let max = own_max.unwrap_or(default_max);
            prop_assert_eq!(decision.should_retry(), enabled && execution_times < max);
            if !enabled {
                prop_assert_eq!(decision, RetryDecision::Disabled);
            }
        }
    }
}
