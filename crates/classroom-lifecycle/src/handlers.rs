use std::{sync::Arc, time::Duration as StdDuration};

use anyhow::{anyhow, Context};
use chrono::{DateTime, Duration, Utc};
use classroom_core::{
    config::LifecycleConfig, Class, ClassStatus, Notification, NotificationKind, NO_SHOW_REASON,
};
use classroom_scheduler::{Job, JobOptions, Priority, Scheduler, CLASS_ID_KEY};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::{
    error::{LifecycleError, Result},
    orchestrator::LifecycleOrchestrator,
    store::{ClassStore, NotificationSink, ReviewStore},
};

/// Name of the recurring notification cleanup job.
pub const CLEANUP_JOB: &str = "cleanup_old_class_notifications";

/// The one-shot jobs tied to a single class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleJob {
    GoLive,
    SendReminder,
    CheckNoShow,
    EndSession,
    SendReviewReminder,
}

impl LifecycleJob {
    pub const ALL: [LifecycleJob; 5] = [
        LifecycleJob::GoLive,
        LifecycleJob::SendReminder,
        LifecycleJob::CheckNoShow,
        LifecycleJob::EndSession,
        LifecycleJob::SendReviewReminder,
    ];

    pub fn name(self) -> &'static str {
        match self {
            LifecycleJob::GoLive => "class_go_live",
            LifecycleJob::SendReminder => "class_send_reminder",
            LifecycleJob::CheckNoShow => "class_check_no_show",
            LifecycleJob::EndSession => "class_end_session",
            LifecycleJob::SendReviewReminder => "class_send_review_reminder",
        }
    }

    fn options(self) -> JobOptions {
        let options = JobOptions::default().lock_lifetime(StdDuration::from_secs(120));
        match self {
            // state transitions go ahead of pure notices due in the same tick
            LifecycleJob::CheckNoShow | LifecycleJob::EndSession => {
                options.priority(Priority::High).concurrency(10)
            }
            _ => options,
        }
    }
}

fn handlers_gone() -> anyhow::Error {
    anyhow!("lifecycle handlers were dropped")
}

/// Everything the lifecycle handlers touch. Handlers re-read the class on
/// every run and act only when its status still matches, so a repeated or
/// late run is a no-op.
pub struct LifecycleHandlers {
    classes: Arc<dyn ClassStore>,
    notifications: Arc<dyn NotificationSink>,
    reviews: Arc<dyn ReviewStore>,
    orchestrator: LifecycleOrchestrator,
}

impl LifecycleHandlers {
    pub fn new(
        classes: Arc<dyn ClassStore>,
        notifications: Arc<dyn NotificationSink>,
        reviews: Arc<dyn ReviewStore>,
        orchestrator: LifecycleOrchestrator,
    ) -> Self {
        Self {
            classes,
            notifications,
            reviews,
            orchestrator,
        }
    }

    fn config(&self) -> &LifecycleConfig {
        self.orchestrator.config()
    }

    /// Define every lifecycle job on `scheduler` and register the recurring
    /// cleanup on `cleanup_cron`.
    ///
    /// The scheduler only holds weak references: the handlers own the
    /// orchestrator, which owns the scheduler. The caller keeps the `Arc`
    /// alive for as long as jobs should run.
    pub fn register(self: &Arc<Self>, scheduler: &Scheduler, cleanup_cron: &str) -> Result<()> {
        for kind in LifecycleJob::ALL {
            let handlers = Arc::downgrade(self);
            scheduler.define(
                kind.name(),
                move |job: Job| {
                    let handlers = handlers.upgrade();
                    async move {
                        let handlers = handlers.ok_or_else(handlers_gone)?;
                        let class_id = job.payload_str(CLASS_ID_KEY).ok_or_else(|| {
                            LifecycleError::Payload(format!("{} has no {CLASS_ID_KEY}", job.id))
                        })?;
                        handlers.run(kind, class_id).await
                    }
                },
                kind.options(),
            );
        }

        let handlers = Arc::downgrade(self);
        scheduler.define(
            CLEANUP_JOB,
            move |_job: Job| {
                let handlers = handlers.upgrade();
                async move {
                    let handlers = handlers.ok_or_else(handlers_gone)?;
                    handlers.cleanup(Utc::now()).await?;
                    Ok::<_, anyhow::Error>(())
                }
            },
            JobOptions::default().priority(Priority::Low).concurrency(1),
        );
        scheduler.every(cleanup_cron, CLEANUP_JOB, json!({}))?;
        info!(jobs = LifecycleJob::ALL.len() + 1, "lifecycle handlers registered");
        Ok(())
    }

    pub async fn run(&self, kind: LifecycleJob, class_id: &str) -> anyhow::Result<()> {
        let outcome = match kind {
            LifecycleJob::GoLive => self.go_live(class_id).await,
            LifecycleJob::SendReminder => self.send_reminder(class_id).await,
            LifecycleJob::CheckNoShow => self.check_no_show(class_id).await,
            LifecycleJob::EndSession => self.end_session(class_id).await,
            LifecycleJob::SendReviewReminder => self.send_review_reminder(class_id).await,
        };
        outcome.with_context(|| format!("{} for class {class_id}", kind.name()))
    }

    /// Start time arrived: tell attendees. Status stays `scheduled` until the
    /// instructor starts the session.
    pub async fn go_live(&self, class_id: &str) -> Result<()> {
        let Some(class) = self.load(class_id, ClassStatus::Scheduled).await? else {
            return Ok(());
        };
        let message = format!("\"{}\" is starting now", class.title);
        self.notify(&class, &class.attendees, NotificationKind::ClassLive, message)
            .await;
        Ok(())
    }

    pub async fn send_reminder(&self, class_id: &str) -> Result<()> {
        let Some(class) = self.load(class_id, ClassStatus::Scheduled).await? else {
            return Ok(());
        };
        let message = format!(
            "\"{}\" starts at {} UTC",
            class.title,
            class.starts_at().format("%H:%M")
        );
        self.notify(&class, &class.attendees, NotificationKind::ClassReminder, message)
            .await;
        Ok(())
    }

    /// Cancel a class the instructor never started.
    pub async fn check_no_show(&self, class_id: &str) -> Result<()> {
        let Some(mut class) = self.load(class_id, ClassStatus::Scheduled).await? else {
            return Ok(());
        };
        class.transition(ClassStatus::Cancelled)?;
        class.cancellation_reason = Some(NO_SHOW_REASON.to_string());
        class.updated_at = Utc::now();
        if !self.classes.save_transition(&class, ClassStatus::Scheduled).await? {
            debug!(class_id, "class started before the no-show cancel landed; skipping");
            return Ok(());
        }
        info!(class_id, "class cancelled: instructor did not show");

        let message = format!(
            "\"{}\" was cancelled because the instructor did not start it",
            class.title
        );
        self.notify(
            &class,
            &class.participants(),
            NotificationKind::ClassCancelled,
            message,
        )
        .await;
        Ok(())
    }

    /// Close a session still live at its scheduled end and queue the review
    /// nudge.
    pub async fn end_session(&self, class_id: &str) -> Result<()> {
        let Some(mut class) = self.load(class_id, ClassStatus::Live).await? else {
            return Ok(());
        };
        let now = Utc::now();
        class.transition(ClassStatus::Completed)?;
        class.actual_end_time = Some(now);
        class.updated_at = now;
        if !self.classes.save_transition(&class, ClassStatus::Live).await? {
            debug!(class_id, "session already closed by another writer; skipping");
            return Ok(());
        }
        info!(class_id, "session closed at scheduled end");
        // joins may have landed after the first read; notify the final roster
        let class = self
            .classes
            .find_by_id(class_id)
            .await?
            .unwrap_or(class);

        let message = format!("\"{}\" has ended", class.title);
        self.notify(
            &class,
            &class.participants(),
            NotificationKind::ClassCompleted,
            message,
        )
        .await;

        let at = now + Duration::minutes(self.config().review_delay_mins);
        if let Err(e) = self.orchestrator.schedule_review_reminder(class_id, at) {
            self.orchestrator
                .record_failure(&format!("class_ended:{class_id}"), &e);
        }
        Ok(())
    }

    /// Nudge students who joined but have not reviewed yet.
    pub async fn send_review_reminder(&self, class_id: &str) -> Result<()> {
        let Some(class) = self.load(class_id, ClassStatus::Completed).await? else {
            return Ok(());
        };
        let reviewed = self.reviews.find_by_class_id(class_id).await?;
        let pending: Vec<String> = class
            .students_joined
            .iter()
            .filter(|s| !reviewed.contains(s))
            .cloned()
            .collect();
        debug!(class_id, pending = pending.len(), reviewed = reviewed.len(), "review reminder targets");

        let message = format!("How was \"{}\"? Leave a review", class.title);
        self.notify(&class, &pending, NotificationKind::ReviewReminder, message)
            .await;
        Ok(())
    }

    /// Remove lifecycle notifications older than the retention window.
    pub async fn cleanup(&self, now: DateTime<Utc>) -> Result<usize> {
        let retention = Duration::hours(self.config().notification_retention_hours);
        cleanup_notifications(self.notifications.as_ref(), now, retention).await
    }

    // --- private helpers ---------------------------------------------------

    /// The class, if it still exists and is in `expected` status.
    async fn load(&self, class_id: &str, expected: ClassStatus) -> Result<Option<Class>> {
        let Some(class) = self.classes.find_by_id(class_id).await? else {
            warn!(class_id, "class no longer exists; nothing to do");
            return Ok(None);
        };
        if class.status != expected {
            debug!(class_id, status = %class.status, %expected, "class moved on; skipping");
            return Ok(None);
        }
        Ok(Some(class))
    }

    async fn notify(
        &self,
        class: &Class,
        recipients: &[String],
        kind: NotificationKind,
        message: String,
    ) {
        if recipients.is_empty() {
            return;
        }
        let batch = recipients
            .iter()
            .map(|r| Notification::new(r, kind, &class.id, message.clone()))
            .collect();
        match self.notifications.insert_many(batch).await {
            Ok(()) => debug!(class_id = %class.id, %kind, count = recipients.len(), "notified"),
            Err(e) => warn!(class_id = %class.id, %kind, "notification delivery failed: {e}"),
        }
    }
}

/// Delete lifecycle notifications created strictly before `now - retention`.
/// A notification exactly at the boundary is kept.
pub async fn cleanup_notifications(
    sink: &dyn NotificationSink,
    now: DateTime<Utc>,
    retention: Duration,
) -> Result<usize> {
    let cutoff = now - retention;
    let removed = sink.delete_lifecycle_before(cutoff).await?;
    info!(removed, cutoff = %cutoff, "old lifecycle notifications removed");
    Ok(removed)
}
