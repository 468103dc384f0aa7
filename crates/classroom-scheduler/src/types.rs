use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Payload key every class lifecycle job carries.
pub const CLASS_ID_KEY: &str = "classId";

/// Ordering hint among jobs that are due at the same poll tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    /// Stored rank; the poll query sorts by it descending.
    pub fn rank(self) -> i64 {
        match self {
            Priority::Low => -10,
            Priority::Normal => 0,
            Priority::High => 10,
        }
    }

    pub fn from_rank(rank: i64) -> Self {
        match rank {
            r if r < 0 => Priority::Low,
            0 => Priority::Normal,
            _ => Priority::High,
        }
    }
}

/// Operator-facing state of a job, derived from its lock and bookkeeping
/// columns at a given instant. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for `next_run_at` (or past due and not yet claimed).
    Scheduled,
    /// Claimed by a worker whose lock has not expired.
    Running,
    /// One-shot job that failed and has no retries left.
    Failed,
    /// Switched off by an operator.
    Disabled,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Scheduled => "scheduled",
            JobStatus::Running => "running",
            JobStatus::Failed => "failed",
            JobStatus::Disabled => "disabled",
        };
        write!(f, "{s}")
    }
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// UUID v4 string, primary key.
    pub id: String,
    /// Name of the registered handler that processes this job.
    pub name: String,
    /// Arbitrary JSON object forwarded to the handler.
    pub payload: Value,
    /// Earliest instant the job may run.
    pub next_run_at: DateTime<Utc>,
    /// Cron expression for recurring jobs; `None` for one-shot jobs.
    pub repeat_cron: Option<String>,
    pub priority: Priority,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    /// How long a claim stays valid before another worker may take it over.
    pub lock_lifetime_ms: i64,
    pub max_retries: u32,
    pub fail_count: u32,
    pub fail_reason: Option<String>,
    pub failed_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub disabled: bool,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn is_recurring(&self) -> bool {
        self.repeat_cron.is_some()
    }

    pub fn lock_expires_at(&self) -> Option<DateTime<Utc>> {
        self.locked_at
            .map(|at| at + Duration::milliseconds(self.lock_lifetime_ms))
    }

    /// True while a claim is held and has not yet expired at `now`.
    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        self.lock_expires_at().is_some_and(|exp| exp >= now)
    }

    /// A one-shot job that has used up its retries. It stays in the store for
    /// inspection but is never claimed again until rescheduled.
    pub fn is_settled_failure(&self) -> bool {
        !self.is_recurring() && self.fail_count > self.max_retries
    }

    pub fn status_at(&self, now: DateTime<Utc>) -> JobStatus {
        if self.disabled {
            JobStatus::Disabled
        } else if self.is_locked_at(now) {
            JobStatus::Running
        } else if self.is_settled_failure() {
            JobStatus::Failed
        } else {
            JobStatus::Scheduled
        }
    }

    /// String value of a top-level payload key, if present.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Per-name options supplied to [`crate::Scheduler::define`].
#[derive(Debug, Clone)]
pub struct JobOptions {
    pub priority: Priority,
    /// Maximum simultaneous in-flight jobs of this name in one scheduler.
    pub concurrency: usize,
    /// Claim validity. Falls back to the scheduler default when `None`.
    pub lock_lifetime: Option<std::time::Duration>,
    /// Automatic retries after a failure. Zero means a failed job stays put
    /// until an operator reschedules it.
    pub max_retries: u32,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: Priority::Normal,
            concurrency: 5,
            lock_lifetime: None,
            max_retries: 0,
        }
    }
}

impl JobOptions {
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn lock_lifetime(mut self, lifetime: std::time::Duration) -> Self {
        self.lock_lifetime = Some(lifetime);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// A one-shot job to insert: handler name, due time and payload.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub name: String,
    pub at: DateTime<Utc>,
    pub payload: Value,
}

impl JobRequest {
    pub fn new(name: &str, at: DateTime<Utc>, payload: Value) -> Self {
        Self {
            name: name.to_string(),
            at,
            payload,
        }
    }
}

/// Fully resolved row handed to the store on insert.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub payload: Value,
    pub next_run_at: DateTime<Utc>,
    pub repeat_cron: Option<String>,
    pub priority: Priority,
    pub lock_lifetime_ms: i64,
    pub max_retries: u32,
}

/// Conjunctive predicate over jobs. An empty filter matches every job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    pub id: Option<String>,
    pub name: Option<String>,
    /// `(key, value)` pairs matched against top-level string payload fields.
    pub payload: Vec<(String, String)>,
}

impl JobFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_id(id: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            ..Self::default()
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn payload_eq(mut self, key: &str, value: &str) -> Self {
        self.payload.push((key.to_string(), value.to_string()));
        self
    }

    /// Every job whose payload carries `classId == class_id`.
    pub fn for_class(class_id: &str) -> Self {
        Self::all().payload_eq(CLASS_ID_KEY, class_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job() -> Job {
        let now = Utc::now();
        Job {
            id: "j1".into(),
            name: "class_go_live".into(),
            payload: json!({ "classId": "c1" }),
            next_run_at: now,
            repeat_cron: None,
            priority: Priority::Normal,
            locked_at: None,
            locked_by: None,
            lock_lifetime_ms: 60_000,
            max_retries: 0,
            fail_count: 0,
            fail_reason: None,
            failed_at: None,
            last_run_at: None,
            last_finished_at: None,
            disabled: false,
            created_at: now,
        }
    }

    #[test]
    fn status_derivation() {
        let now = Utc::now();
        let mut j = job();
        assert_eq!(j.status_at(now), JobStatus::Scheduled);

        j.locked_at = Some(now - Duration::seconds(30));
        assert_eq!(j.status_at(now), JobStatus::Running);

        // lock older than lifetime reads as scheduled again
        j.locked_at = Some(now - Duration::seconds(61));
        assert_eq!(j.status_at(now), JobStatus::Scheduled);

        j.locked_at = None;
        j.fail_count = 1;
        j.fail_reason = Some("boom".into());
        assert_eq!(j.status_at(now), JobStatus::Failed);

        j.disabled = true;
        assert_eq!(j.status_at(now), JobStatus::Disabled);
    }

    #[test]
    fn recurring_failure_is_not_settled() {
        let mut j = job();
        j.repeat_cron = Some("0 0 3 * * *".into());
        j.fail_count = 4;
        assert!(!j.is_settled_failure());
    }

    #[test]
    fn retries_delay_settlement() {
        let mut j = job();
        j.max_retries = 2;
        j.fail_count = 2;
        assert!(!j.is_settled_failure());
        j.fail_count = 3;
        assert!(j.is_settled_failure());
    }

    #[test]
    fn priority_rank_roundtrip() {
        for p in [Priority::Low, Priority::Normal, Priority::High] {
            assert_eq!(Priority::from_rank(p.rank()), p);
        }
        assert!(Priority::High.rank() > Priority::Low.rank());
    }

    #[test]
    fn payload_lookup() {
        let j = job();
        assert_eq!(j.payload_str(CLASS_ID_KEY), Some("c1"));
        assert_eq!(j.payload_str("missing"), None);
    }
}
