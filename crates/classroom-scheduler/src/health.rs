use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex,
};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Most recent scheduling failure, kept for the admin stats endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingFailure {
    pub at: DateTime<Utc>,
    /// What was being scheduled, e.g. `"class_created:<id>"`.
    pub context: String,
    pub error: String,
}

/// Counters for scheduling calls that failed at class-mutation time.
///
/// Those failures are swallowed so the class write still succeeds; this is
/// the only place they remain visible.
#[derive(Debug, Default)]
pub struct SchedulingHealth {
    failures: AtomicU64,
    last_failure: Mutex<Option<SchedulingFailure>>,
}

impl SchedulingHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_failure(&self, context: &str, error: &dyn std::fmt::Display) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        let failure = SchedulingFailure {
            at: Utc::now(),
            context: context.to_string(),
            error: error.to_string(),
        };
        *self
            .last_failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(failure);
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn last_failure(&self) -> Option<SchedulingFailure> {
        self.last_failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}
