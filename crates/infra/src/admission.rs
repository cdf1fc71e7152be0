//! Dispatch admission: rate limit plus a cap on live executors.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::debug;

use taskfleet_core::RunMode;

use crate::store::{JobStore, StoreError};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Admission {
    Granted,
    /// The local token bucket is empty.
    Throttled,
    /// Too many RUNNING/CANCELING executors for this run mode.
    AtCapacity { active: usize },
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted)
    }
}

#[derive(Debug)]
struct TokenBucket {
    rate_per_second: f64,
    burst: f64,
    tokens: f64,
    refilled_at: Instant,
}

impl TokenBucket {
    fn new(rate_per_second: f64, burst: u32, now: Instant) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            rate_per_second: rate_per_second.max(0.0),
            burst,
            tokens: burst,
            refilled_at: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.refilled_at).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_second).min(self.burst);
        self.refilled_at = now;
    }

    fn has_token(&mut self, now: Instant) -> bool {
        self.refill(now);
        self.tokens >= 1.0
    }

    fn take(&mut self) {
        self.tokens -= 1.0;
    }

    fn give_back(&mut self) {
        self.tokens = (self.tokens + 1.0).min(self.burst);
    }
}

/// Process-local token bucket in front of a store-backed threshold.
pub struct AdmissionGate {
    store: Arc<dyn JobStore>,
    threshold: usize,
    bucket: Mutex<TokenBucket>,
}

impl AdmissionGate {
    pub fn new(store: Arc<dyn JobStore>, threshold: usize, rate_per_second: f64, burst: u32) -> Self {
        Self {
            store,
            threshold,
            bucket: Mutex::new(TokenBucket::new(rate_per_second, burst, Instant::now())),
        }
    }

    pub fn try_admit(&self, run_mode: RunMode) -> Result<Admission, StoreError> {
        self.try_admit_at(run_mode, Instant::now())
    }

    /// A token is only spent when the threshold check also passes.
    pub fn try_admit_at(&self, run_mode: RunMode, now: Instant) -> Result<Admission, StoreError> {
        let mut bucket = self.bucket.lock().map_err(|_| StoreError::Poisoned)?;
        if !bucket.has_token(now) {
            debug!(run_mode = %run_mode, "admission throttled");
            return Ok(Admission::Throttled);
        }

        let active = self.store.count_active_executors(run_mode)?;
        if active >= self.threshold {
            debug!(run_mode = %run_mode, active, threshold = self.threshold, "admission at capacity");
            return Ok(Admission::AtCapacity { active });
        }

        bucket.take();
        Ok(Admission::Granted)
    }

    /// Return the token of a grant that did not lead to a dispatch.
    pub fn refund(&self) {
        match self.bucket.lock() {
            Ok(mut bucket) => bucket.give_back(),
            Err(_) => debug!("admission bucket poisoned; token not refunded"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryJobStore, RowDecision, transition};
    use chrono::Utc;
    use std::time::Duration;
    use taskfleet_core::{JobStatus, NewJob};

    #[test]
    fn burst_then_refill() {
        let store = InMemoryJobStore::arc();
        let gate = AdmissionGate::new(store, 100, 2.0, 2);
        let t0 = Instant::now();

        assert!(gate.try_admit_at(RunMode::Process, t0).unwrap().is_granted());
        assert!(gate.try_admit_at(RunMode::Process, t0).unwrap().is_granted());
        assert_eq!(gate.try_admit_at(RunMode::Process, t0).unwrap(), Admission::Throttled);

        let later = t0 + Duration::from_millis(500);
        assert!(gate.try_admit_at(RunMode::Process, later).unwrap().is_granted());
        assert_eq!(gate.try_admit_at(RunMode::Process, later).unwrap(), Admission::Throttled);
    }

    #[test]
    fn refund_restores_a_token_up_to_burst() {
        let store = InMemoryJobStore::arc();
        let gate = AdmissionGate::new(store, 100, 0.0, 1);
        let t0 = Instant::now();

        assert!(gate.try_admit_at(RunMode::Process, t0).unwrap().is_granted());
        assert_eq!(gate.try_admit_at(RunMode::Process, t0).unwrap(), Admission::Throttled);

        gate.refund();
        gate.refund();
        assert!(gate.try_admit_at(RunMode::Process, t0).unwrap().is_granted());
        assert_eq!(gate.try_admit_at(RunMode::Process, t0).unwrap(), Admission::Throttled);
    }

    #[test]
    fn threshold_counts_active_executors_per_mode() {
        let store = InMemoryJobStore::arc();
        let job = store.insert(NewJob::new("t", RunMode::Cluster), Utc::now()).unwrap();
        transition(&store, job.id, &[JobStatus::Preparing], |row| {
            let identifier = "cluster://a/b/c/d".parse().unwrap();
            row.job_mut().mark_started(identifier, None, Utc::now())?;
            Ok(RowDecision::Commit)
        })
        .unwrap();

        let gate = AdmissionGate::new(store, 1, 100.0, 10);
        assert_eq!(
            gate.try_admit(RunMode::Cluster).unwrap(),
            Admission::AtCapacity { active: 1 }
        );
        assert!(gate.try_admit(RunMode::Process).unwrap().is_granted());
    }
}
