//! `classroom-scheduler`: durable, multi-worker job scheduler over SQLite.
//!
//! # Overview
//!
//! Jobs are persisted to a SQLite `jobs` table through the [`store::JobStore`]
//! trait. A [`engine::Scheduler`] polls the store on a fixed interval, claims
//! due jobs with a compare-and-swap `UPDATE` (time-bounded lock), and runs the
//! handler registered for the job's name on a bounded in-process pool.
//!
//! Any number of schedulers, in one process or many, may share a store: a job
//! whose lock is unexpired is never claimed twice, and a lock left behind by a
//! crashed worker expires after the job's `lock_lifetime`.
//!
//! # Job kinds
//!
//! | Kind      | Created by             | After success                    |
//! |-----------|------------------------|----------------------------------|
//! | one-shot  | [`Scheduler::schedule`]| row deleted                      |
//! | recurring | [`Scheduler::every`]   | `next_run_at` advanced from cron |
//!
//! Failures are recorded on the row (`fail_reason`) and are not retried unless
//! the job definition opts in with [`JobOptions::max_retries`].

pub mod admin;
pub mod db;
pub mod engine;
pub mod error;
pub mod health;
pub mod schedule;
pub mod store;
pub mod types;

pub use admin::{JobAdmin, JobStats, JobView};
pub use engine::Scheduler;
pub use error::{Result, SchedulerError};
pub use health::{SchedulingFailure, SchedulingHealth};
pub use store::{JobStore, SqliteJobStore};
pub use types::{
    Job, JobFilter, JobOptions, JobRequest, JobStatus, NewJob, Priority, CLASS_ID_KEY,
};
