//! `classroom-lifecycle`: the class lifecycle jobs and the glue that
//! schedules them.
//!
//! | Job                               | Due at                | Runs when   |
//! |-----------------------------------|-----------------------|-------------|
//! | `class_send_reminder`             | start - reminder lead | `scheduled` |
//! | `class_go_live`                   | start                 | `scheduled` |
//! | `class_check_no_show`             | start + grace         | `scheduled` |
//! | `class_end_session`               | start + duration      | `live`      |
//! | `class_send_review_reminder`      | end + review delay    | `completed` |
//! | `cleanup_old_class_notifications` | daily cron            | always      |
//!
//! [`LifecycleOrchestrator`] creates and cancels the per-class jobs as
//! classes are written; [`LifecycleHandlers`] runs them.

pub mod db;
pub mod error;
pub mod handlers;
pub mod orchestrator;
pub mod store;

pub use error::{LifecycleError, Result};
pub use handlers::{cleanup_notifications, LifecycleHandlers, LifecycleJob, CLEANUP_JOB};
pub use orchestrator::LifecycleOrchestrator;
pub use store::{
    ClassStore, Db, NotificationSink, ReviewStore, SqliteClassStore, SqliteNotificationSink,
    SqliteReviewStore,
};
