//! Collaborator interfaces the lifecycle handlers consume, plus SQLite
//! implementations sharing one connection.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use classroom_core::{Class, ClassStatus, Notification, NotificationKind, Review};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::{
    db::{
        row_to_class, row_to_notification, row_to_review, CLASS_COLUMNS, NOTIFICATION_COLUMNS,
        REVIEW_COLUMNS,
    },
    error::{LifecycleError, Result},
};

#[async_trait]
pub trait ClassStore: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<Class>>;

    /// Insert or overwrite the whole record.
    async fn save(&self, class: &Class) -> Result<()>;

    /// Persist the status and lifecycle timestamps of `class` only if the
    /// stored status is still `from`. `false` means another writer moved it
    /// first and nothing was written.
    async fn save_transition(&self, class: &Class, from: ClassStatus) -> Result<bool>;
}

/// Best-effort outbound notifications. Callers log and swallow errors.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn insert_many(&self, notifications: Vec<Notification>) -> Result<()>;

    /// Delete lifecycle notifications created strictly before `cutoff`.
    /// Returns how many were removed.
    async fn delete_lifecycle_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

#[async_trait]
pub trait ReviewStore: Send + Sync {
    /// Ids of the students who reviewed `class_id`.
    async fn find_by_class_id(&self, class_id: &str) -> Result<Vec<String>>;
}

pub type Db = Arc<Mutex<Connection>>;

fn lock(db: &Db) -> MutexGuard<'_, Connection> {
    db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// --- classes -------------------------------------------------------------

pub struct SqliteClassStore {
    db: Db,
}

impl SqliteClassStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Remove a class record. `ClassNotFound` if it did not exist.
    pub fn delete(&self, id: &str) -> Result<()> {
        let conn = lock(&self.db);
        match conn.execute("DELETE FROM classes WHERE id = ?1", [id])? {
            0 => Err(LifecycleError::ClassNotFound { id: id.to_string() }),
            _ => Ok(()),
        }
    }

    /// Compare-and-set on `status`. Leaves joins and details untouched.
    pub fn transition_if(&self, class: &Class, from: ClassStatus) -> Result<bool> {
        let conn = lock(&self.db);
        let updated = conn.execute(
            "UPDATE classes SET
                status = ?2,
                actual_start_time = ?3,
                actual_end_time = ?4,
                cancellation_reason = ?5,
                updated_at = ?6
             WHERE id = ?1 AND status = ?7",
            params![
                class.id,
                class.status.to_string(),
                class.actual_start_time.map(|t| t.timestamp_millis()),
                class.actual_end_time.map(|t| t.timestamp_millis()),
                class.cancellation_reason,
                class.updated_at.timestamp_millis(),
                from.to_string(),
            ],
        )?;
        debug!(class_id = %class.id, %from, to = %class.status, applied = updated > 0, "class transition");
        Ok(updated > 0)
    }

    /// Append `student_id` to `students_joined` in place while the class is
    /// live. Returns `false` if the class is missing or not live.
    pub fn record_join(&self, id: &str, student_id: &str) -> Result<bool> {
        let conn = lock(&self.db);
        let updated = conn.execute(
            "UPDATE classes SET
                students_joined = CASE
                    WHEN EXISTS (SELECT 1 FROM json_each(students_joined) WHERE value = ?2)
                    THEN students_joined
                    ELSE json_insert(students_joined, '$[#]', ?2)
                END,
                updated_at = ?3
             WHERE id = ?1 AND status = 'live'",
            params![id, student_id, Utc::now().timestamp_millis()],
        )?;
        Ok(updated > 0)
    }

    /// Write the editable schedule fields only. Returns `false` if the class
    /// no longer exists.
    pub fn update_details(&self, class: &Class) -> Result<bool> {
        let conn = lock(&self.db);
        let updated = conn.execute(
            "UPDATE classes SET
                title = ?2,
                date = ?3,
                start_time = ?4,
                duration = ?5,
                attendees = ?6,
                updated_at = ?7
             WHERE id = ?1",
            params![
                class.id,
                class.title,
                class.date.format("%Y-%m-%d").to_string(),
                class.start_time.format("%H:%M:%S").to_string(),
                class.duration,
                serde_json::to_string(&class.attendees)?,
                class.updated_at.timestamp_millis(),
            ],
        )?;
        Ok(updated > 0)
    }

    fn get(&self, id: &str) -> Result<Option<Class>> {
        let conn = lock(&self.db);
        Ok(conn
            .query_row(
                &format!("SELECT {CLASS_COLUMNS} FROM classes WHERE id = ?1"),
                [id],
                row_to_class,
            )
            .optional()?)
    }

    fn upsert(&self, class: &Class) -> Result<()> {
        let conn = lock(&self.db);
        conn.execute(
            "INSERT INTO classes
                (id, title, instructor_id, date, start_time, duration, status, attendees,
                 students_joined, actual_start_time, actual_end_time, cancellation_reason,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                instructor_id = excluded.instructor_id,
                date = excluded.date,
                start_time = excluded.start_time,
                duration = excluded.duration,
                status = excluded.status,
                attendees = excluded.attendees,
                students_joined = excluded.students_joined,
                actual_start_time = excluded.actual_start_time,
                actual_end_time = excluded.actual_end_time,
                cancellation_reason = excluded.cancellation_reason,
                updated_at = excluded.updated_at",
            params![
                class.id,
                class.title,
                class.instructor_id,
                class.date.format("%Y-%m-%d").to_string(),
                class.start_time.format("%H:%M:%S").to_string(),
                class.duration,
                class.status.to_string(),
                serde_json::to_string(&class.attendees)?,
                serde_json::to_string(&class.students_joined)?,
                class.actual_start_time.map(|t| t.timestamp_millis()),
                class.actual_end_time.map(|t| t.timestamp_millis()),
                class.cancellation_reason,
                class.created_at.timestamp_millis(),
                class.updated_at.timestamp_millis(),
            ],
        )?;
        debug!(class_id = %class.id, status = %class.status, "class saved");
        Ok(())
    }
}

#[async_trait]
impl ClassStore for SqliteClassStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<Class>> {
        self.get(id)
    }

    async fn save(&self, class: &Class) -> Result<()> {
        self.upsert(class)
    }

    async fn save_transition(&self, class: &Class, from: ClassStatus) -> Result<bool> {
        self.transition_if(class, from)
    }
}

// --- notifications -------------------------------------------------------

pub struct SqliteNotificationSink {
    db: Db,
}

impl SqliteNotificationSink {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Newest first.
    pub fn for_class(&self, class_id: &str) -> Result<Vec<Notification>> {
        let conn = lock(&self.db);
        let mut stmt = conn.prepare(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications
             WHERE class_id = ?1 ORDER BY created_at, recipient_id"
        ))?;
        let rows = stmt
            .query_map([class_id], row_to_notification)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

#[async_trait]
impl NotificationSink for SqliteNotificationSink {
    async fn insert_many(&self, notifications: Vec<Notification>) -> Result<()> {
        let mut conn = lock(&self.db);
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO notifications ({NOTIFICATION_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
            ))?;
            for n in &notifications {
                stmt.execute(params![
                    n.id,
                    n.recipient_id,
                    n.kind.as_str(),
                    n.class_id,
                    n.message,
                    n.read,
                    n.created_at.timestamp_millis(),
                ])?;
            }
        }
        tx.commit()?;
        debug!(count = notifications.len(), "notifications inserted");
        Ok(())
    }

    async fn delete_lifecycle_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let kinds = serde_json::to_string(
            &NotificationKind::LIFECYCLE.map(NotificationKind::as_str),
        )?;
        let conn = lock(&self.db);
        let n = conn.execute(
            "DELETE FROM notifications
             WHERE created_at < ?1 AND kind IN (SELECT value FROM json_each(?2))",
            params![cutoff.timestamp_millis(), kinds],
        )?;
        Ok(n)
    }
}

// --- reviews -------------------------------------------------------------

pub struct SqliteReviewStore {
    db: Db,
}

impl SqliteReviewStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Insert a review; a second review by the same student replaces the first.
    pub fn insert(&self, review: &Review) -> Result<()> {
        let conn = lock(&self.db);
        conn.execute(
            &format!(
                "INSERT INTO reviews ({REVIEW_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(class_id, student_id) DO UPDATE SET
                    rating = excluded.rating, comment = excluded.comment"
            ),
            params![
                review.id,
                review.class_id,
                review.student_id,
                review.rating,
                review.comment,
                review.created_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    pub fn list_for_class(&self, class_id: &str) -> Result<Vec<Review>> {
        let conn = lock(&self.db);
        let mut stmt = conn.prepare(&format!(
            "SELECT {REVIEW_COLUMNS} FROM reviews WHERE class_id = ?1 ORDER BY created_at"
        ))?;
        let rows = stmt
            .query_map([class_id], row_to_review)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

#[async_trait]
impl ReviewStore for SqliteReviewStore {
    async fn find_by_class_id(&self, class_id: &str) -> Result<Vec<String>> {
        Ok(self
            .list_for_class(class_id)?
            .into_iter()
            .map(|r| r.student_id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate, NaiveTime};

    fn db() -> Db {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::init_db(&conn).unwrap();
        Arc::new(Mutex::new(conn))
    }

    fn class() -> Class {
        let mut c = Class::new(
            "Rust ownership",
            "inst-1",
            NaiveDate::from_ymd_opt(2026, 11, 2).unwrap(),
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            60,
        );
        c.attendees = vec!["s1".into(), "s2".into()];
        c
    }

    #[tokio::test]
    async fn class_save_and_reload() {
        let store = SqliteClassStore::new(db());
        let mut c = class();
        store.save(&c).await.unwrap();

        c.transition(ClassStatus::Live).unwrap();
        c.actual_start_time = Some(Utc::now());
        c.record_join("s1");
        store.save(&c).await.unwrap();

        let read = store.find_by_id(&c.id).await.unwrap().unwrap();
        assert_eq!(read.status, ClassStatus::Live);
        assert_eq!(read.attendees, c.attendees);
        assert_eq!(read.students_joined, vec!["s1".to_string()]);
        assert_eq!(read.start_time, c.start_time);
        assert!(read.actual_start_time.is_some());

        store.delete(&c.id).unwrap();
        assert!(store.find_by_id(&c.id).await.unwrap().is_none());
        assert!(matches!(
            store.delete(&c.id),
            Err(LifecycleError::ClassNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn stale_transition_is_not_applied() {
        let store = SqliteClassStore::new(db());
        let c = class();
        store.save(&c).await.unwrap();

        // another writer starts the class
        let mut started = c.clone();
        started.transition(ClassStatus::Live).unwrap();
        started.actual_start_time = Some(Utc::now());
        assert!(store
            .save_transition(&started, ClassStatus::Scheduled)
            .await
            .unwrap());
        assert!(store.record_join(&c.id, "s1").unwrap());

        // a cancel computed from the old scheduled snapshot loses
        let mut cancelled = c.clone();
        cancelled.transition(ClassStatus::Cancelled).unwrap();
        cancelled.cancellation_reason = Some("late".into());
        assert!(!store
            .save_transition(&cancelled, ClassStatus::Scheduled)
            .await
            .unwrap());

        let read = store.find_by_id(&c.id).await.unwrap().unwrap();
        assert_eq!(read.status, ClassStatus::Live);
        assert!(read.actual_start_time.is_some());
        assert!(read.cancellation_reason.is_none());
        assert_eq!(read.students_joined, vec!["s1".to_string()]);
    }

    #[tokio::test]
    async fn joins_append_in_place_only_while_live() {
        let store = SqliteClassStore::new(db());
        let mut c = class();
        store.save(&c).await.unwrap();
        assert!(!store.record_join(&c.id, "s1").unwrap());
        assert!(!store.record_join("missing", "s1").unwrap());

        c.transition(ClassStatus::Live).unwrap();
        store.save(&c).await.unwrap();
        assert!(store.record_join(&c.id, "s1").unwrap());
        assert!(store.record_join(&c.id, "s2").unwrap());
        assert!(store.record_join(&c.id, "s1").unwrap());

        let read = store.find_by_id(&c.id).await.unwrap().unwrap();
        assert_eq!(read.students_joined, vec!["s1".to_string(), "s2".to_string()]);
    }

    #[tokio::test]
    async fn detail_update_keeps_status_and_joins() {
        let store = SqliteClassStore::new(db());
        let mut c = class();
        c.transition(ClassStatus::Live).unwrap();
        store.save(&c).await.unwrap();
        assert!(store.record_join(&c.id, "s1").unwrap());

        // edit computed from a snapshot taken before the join
        c.title = "Borrowing".into();
        c.duration = 90;
        assert!(store.update_details(&c).unwrap());

        let read = store.find_by_id(&c.id).await.unwrap().unwrap();
        assert_eq!(read.title, "Borrowing");
        assert_eq!(read.duration, 90);
        assert_eq!(read.status, ClassStatus::Live);
        assert_eq!(read.students_joined, vec!["s1".to_string()]);

        store.delete(&c.id).unwrap();
        assert!(!store.update_details(&c).unwrap());
    }

    #[tokio::test]
    async fn cleanup_keeps_other_kinds_and_recent_rows() {
        let sink = SqliteNotificationSink::new(db());
        let now = Utc::now();
        let mut old = Notification::new("s1", NotificationKind::ClassLive, "c1", "live".into());
        old.created_at = now - Duration::hours(5);
        let mut recent =
            Notification::new("s1", NotificationKind::ClassReminder, "c1", "soon".into());
        recent.created_at = now - Duration::hours(1);
        sink.insert_many(vec![old, recent]).await.unwrap();

        // a non-lifecycle row written by some other part of the marketplace
        {
            let conn = lock(&sink.db);
            conn.execute(
                "INSERT INTO notifications (id, recipient_id, kind, message, created_at)
                 VALUES ('x', 's1', 'new_follower', 'hi', ?1)",
                [(now - Duration::days(3)).timestamp_millis()],
            )
            .unwrap();
        }

        let removed = sink
            .delete_lifecycle_before(now - Duration::hours(4))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        let conn = lock(&sink.db);
        let left: i64 = conn
            .query_row("SELECT COUNT(*) FROM notifications", [], |r| r.get(0))
            .unwrap();
        assert_eq!(left, 2);
    }

    #[tokio::test]
    async fn reviews_are_unique_per_student() {
        let store = SqliteReviewStore::new(db());
        let review = |student: &str, rating: u8| Review {
            id: format!("r-{student}-{rating}"),
            class_id: "c1".into(),
            student_id: student.into(),
            rating,
            comment: None,
            created_at: Utc::now(),
        };
        store.insert(&review("s1", 4)).unwrap();
        store.insert(&review("s1", 5)).unwrap();
        store.insert(&review("s2", 3)).unwrap();

        let mut students = store.find_by_class_id("c1").await.unwrap();
        students.sort();
        assert_eq!(students, vec!["s1".to_string(), "s2".to_string()]);
        let s1 = store
            .list_for_class("c1")
            .unwrap()
            .into_iter()
            .find(|r| r.student_id == "s1")
            .unwrap();
        assert_eq!(s1.rating, 5);
    }
}
