//! Operator alarms.

use std::sync::Mutex;

use tracing::error;

/// Destination for conditions an operator must look at.
pub trait AlarmSink: Send + Sync {
    fn alarm(&self, event_name: &str, message: &str);
}

/// Logs alarms at `error` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlarmSink;

impl AlarmSink for TracingAlarmSink {
    fn alarm(&self, event_name: &str, message: &str) {
        error!(alarm = event_name, "{message}");
    }
}

/// Records alarms for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryAlarmSink {
    inner: Mutex<Vec<(String, String)>>,
}

impl InMemoryAlarmSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<(String, String)> {
        self.inner.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

impl AlarmSink for InMemoryAlarmSink {
    fn alarm(&self, event_name: &str, message: &str) {
        if let Ok(mut alarms) = self.inner.lock() {
            alarms.push((event_name.to_string(), message.to_string()));
        }
    }
}
