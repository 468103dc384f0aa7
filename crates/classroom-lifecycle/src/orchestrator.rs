use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use classroom_core::{config::LifecycleConfig, Class, ClassField, ClassStatus};
use classroom_scheduler::{
    Job, JobFilter, JobRequest, Scheduler, SchedulingHealth, CLASS_ID_KEY,
};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::{error::Result, handlers::LifecycleJob};

/// Turns class mutations into scheduler calls.
///
/// Hooks never return an error: a class write must succeed even when its
/// jobs cannot be scheduled. Failures are logged and counted in
/// [`SchedulingHealth`], which the job admin stats expose.
#[derive(Clone)]
pub struct LifecycleOrchestrator {
    scheduler: Scheduler,
    health: Arc<SchedulingHealth>,
    config: LifecycleConfig,
}

impl LifecycleOrchestrator {
    pub fn new(
        scheduler: Scheduler,
        health: Arc<SchedulingHealth>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            scheduler,
            health,
            config,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Jobs a scheduled class needs, as seen at `now`. The reminder is left
    /// out once its trigger time has passed.
    pub fn plan(&self, class: &Class, now: DateTime<Utc>) -> Vec<JobRequest> {
        let start = class.starts_at();
        let payload = json!({ CLASS_ID_KEY: class.id });
        let reminder_at = start - Duration::minutes(self.config.reminder_lead_mins);

        let mut jobs = vec![JobRequest::new(
            LifecycleJob::GoLive.name(),
            start,
            payload.clone(),
        )];
        if reminder_at > now {
            jobs.push(JobRequest::new(
                LifecycleJob::SendReminder.name(),
                reminder_at,
                payload.clone(),
            ));
        }
        jobs.push(JobRequest::new(
            LifecycleJob::CheckNoShow.name(),
            start + Duration::minutes(self.config.no_show_grace_mins),
            payload.clone(),
        ));
        jobs.push(JobRequest::new(
            LifecycleJob::EndSession.name(),
            class.ends_at(),
            payload,
        ));
        jobs
    }

    pub fn on_class_created(&self, class: &Class) {
        let context = format!("class_created:{}", class.id);
        if class.status != ClassStatus::Scheduled {
            debug!(class_id = %class.id, status = %class.status, "new class not scheduled; no jobs");
            return;
        }
        // replace rather than insert so a retried create never doubles up
        let result = self
            .scheduler
            .replace(&JobFilter::for_class(&class.id), self.plan(class, Utc::now()));
        match result {
            Ok(jobs) => info!(class_id = %class.id, jobs = jobs.len(), "class lifecycle scheduled"),
            Err(e) => self.record_failure(&context, &e),
        }
    }

    /// Re-plan the class when its start or end moved. Classes that already
    /// left `scheduled` keep whatever jobs they have.
    pub fn on_class_updated(&self, class: &Class, changed: &[ClassField]) {
        if !changed.iter().any(|f| f.affects_schedule()) {
            debug!(class_id = %class.id, ?changed, "update does not move the schedule");
            return;
        }
        if class.status != ClassStatus::Scheduled {
            info!(
                class_id = %class.id,
                status = %class.status,
                "schedule changed on a class that is no longer scheduled; jobs left alone"
            );
            return;
        }
        let result = self
            .scheduler
            .replace(&JobFilter::for_class(&class.id), self.plan(class, Utc::now()));
        match result {
            Ok(jobs) => info!(class_id = %class.id, jobs = jobs.len(), "class lifecycle rescheduled"),
            Err(e) => self.record_failure(&format!("class_updated:{}", class.id), &e),
        }
    }

    /// Cancel every pending job of a deleted class on a blocking worker. The
    /// caller may drop the handle; the cancel still runs.
    pub fn on_class_deleted(&self, class_id: &str) -> JoinHandle<()> {
        let this = self.clone();
        let class_id = class_id.to_string();
        tokio::task::spawn_blocking(move || {
            match this.scheduler.cancel(&JobFilter::for_class(&class_id)) {
                Ok(removed) => info!(class_id = %class_id, removed, "class jobs cancelled"),
                Err(e) => this.record_failure(&format!("class_deleted:{class_id}"), &e),
            }
        })
    }

    /// The instructor ended the session: nudge attendees for reviews after
    /// the configured delay.
    pub fn on_class_manually_ended(&self, class_id: &str) {
        let at = Utc::now() + Duration::minutes(self.config.review_delay_mins);
        if let Err(e) = self.schedule_review_reminder(class_id, at) {
            self.record_failure(&format!("class_ended:{class_id}"), &e);
        }
    }

    pub(crate) fn schedule_review_reminder(
        &self,
        class_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Job> {
        let job = self.scheduler.schedule(
            at,
            LifecycleJob::SendReviewReminder.name(),
            json!({ CLASS_ID_KEY: class_id }),
        )?;
        info!(class_id, run_at = %at, "review reminder scheduled");
        Ok(job)
    }

    pub(crate) fn record_failure(&self, context: &str, error: &dyn std::fmt::Display) {
        error!(context, "lifecycle scheduling failed: {error}");
        self.health.record_failure(context, error);
    }
}
