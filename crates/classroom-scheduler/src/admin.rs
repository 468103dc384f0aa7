use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::{
    engine::Scheduler,
    error::{Result, SchedulerError},
    health::{SchedulingFailure, SchedulingHealth},
    types::{Job, JobFilter, JobStatus},
};

/// A job together with its status as seen at query time.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    #[serde(flatten)]
    pub job: Job,
    pub status: JobStatus,
}

impl JobView {
    fn at(job: Job, now: DateTime<Utc>) -> Self {
        let status = job.status_at(now);
        Self { job, status }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStats {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_name: BTreeMap<String, usize>,
    /// Scheduling calls that failed while a class was being written.
    pub scheduling_failures: u64,
    pub last_scheduling_error: Option<SchedulingFailure>,
}

/// Operator surface over a [`Scheduler`]: listing, stats and single-job
/// writes. Holds no state of its own.
#[derive(Clone)]
pub struct JobAdmin {
    scheduler: Scheduler,
    health: Arc<SchedulingHealth>,
}

impl JobAdmin {
    pub fn new(scheduler: Scheduler, health: Arc<SchedulingHealth>) -> Self {
        Self { scheduler, health }
    }

    pub fn list_all(&self) -> Result<Vec<JobView>> {
        self.list(&JobFilter::all())
    }

    pub fn list_for_class(&self, class_id: &str) -> Result<Vec<JobView>> {
        self.list(&JobFilter::for_class(class_id))
    }

    /// Move a job to `at`, clearing any recorded failure.
    pub fn reschedule(&self, id: &str, at: DateTime<Utc>) -> Result<JobView> {
        let now = Utc::now();
        self.idle_job(id, now)?;
        if !self.scheduler.store().reschedule(id, at)? {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        info!(job_id = id, next_run_at = %at, "job rescheduled by operator");
        let job = self
            .scheduler
            .store()
            .get(id)?
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })?;
        Ok(JobView::at(job, now))
    }

    /// Delete a single job. A job whose lock is still held is refused.
    pub fn cancel(&self, id: &str) -> Result<()> {
        self.idle_job(id, Utc::now())?;
        match self.scheduler.cancel(&JobFilter::by_id(id))? {
            0 => Err(SchedulerError::JobRunning { id: id.to_string() }),
            _ => {
                info!(job_id = id, "job cancelled by operator");
                Ok(())
            }
        }
    }

    pub fn disable(&self, id: &str) -> Result<JobView> {
        self.set_disabled(id, true)
    }

    pub fn enable(&self, id: &str) -> Result<JobView> {
        self.set_disabled(id, false)
    }

    pub fn stats(&self) -> Result<JobStats> {
        let views = self.list_all()?;
        let mut by_status = BTreeMap::new();
        let mut by_name = BTreeMap::new();
        for view in &views {
            *by_status.entry(view.status.to_string()).or_insert(0) += 1;
            *by_name.entry(view.job.name.clone()).or_insert(0) += 1;
        }
        Ok(JobStats {
            total: views.len(),
            by_status,
            by_name,
            scheduling_failures: self.health.failures(),
            last_scheduling_error: self.health.last_failure(),
        })
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<JobView>> {
        let now = Utc::now();
        Ok(self
            .scheduler
            .jobs(filter)?
            .into_iter()
            .map(|job| JobView::at(job, now))
            .collect())
    }

    fn set_disabled(&self, id: &str, disabled: bool) -> Result<JobView> {
        if !self.scheduler.store().set_disabled(id, disabled)? {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        info!(job_id = id, disabled, "job toggled by operator");
        let job = self
            .scheduler
            .store()
            .get(id)?
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })?;
        Ok(JobView::at(job, Utc::now()))
    }

    /// The job `id`, provided it exists and no worker holds its lock.
    fn idle_job(&self, id: &str, now: DateTime<Utc>) -> Result<Job> {
        let job = self
            .scheduler
            .store()
            .get(id)?
            .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })?;
        if job.is_locked_at(now) {
            return Err(SchedulerError::JobRunning { id: id.to_string() });
        }
        Ok(job)
    }
}
