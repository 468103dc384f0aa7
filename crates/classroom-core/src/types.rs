use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{ClassroomError, Result};

/// `cancellation_reason` written when the instructor never started the class.
pub const NO_SHOW_REASON: &str = "instructor_no_show";

/// Lifecycle state of a class.
///
/// Legal moves:
///
/// | From        | To          | Performed by                      |
/// |-------------|-------------|-----------------------------------|
/// | `scheduled` | `live`      | instructor start                  |
/// | `scheduled` | `cancelled` | no-show check, instructor cancel  |
/// | `live`      | `completed` | end-session job, instructor end   |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClassStatus {
    #[default]
    Scheduled,
    Live,
    Completed,
    Cancelled,
}

impl ClassStatus {
    pub fn can_transition_to(self, next: ClassStatus) -> bool {
        matches!(
            (self, next),
            (ClassStatus::Scheduled, ClassStatus::Live)
                | (ClassStatus::Scheduled, ClassStatus::Cancelled)
                | (ClassStatus::Live, ClassStatus::Completed)
        )
    }

    /// Completed and cancelled classes never move again.
    pub fn is_terminal(self) -> bool {
        matches!(self, ClassStatus::Completed | ClassStatus::Cancelled)
    }
}

impl fmt::Display for ClassStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClassStatus::Scheduled => "scheduled",
            ClassStatus::Live => "live",
            ClassStatus::Completed => "completed",
            ClassStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ClassStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(ClassStatus::Scheduled),
            "live" => Ok(ClassStatus::Live),
            "completed" => Ok(ClassStatus::Completed),
            "cancelled" => Ok(ClassStatus::Cancelled),
            other => Err(format!("unknown class status: {other}")),
        }
    }
}

/// A class record. Owned by the marketplace; the scheduler only reads it and
/// performs the transitions listed on [`ClassStatus`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Class {
    pub id: String,
    pub title: String,
    pub instructor_id: String,
    /// Calendar day of the session (UTC).
    pub date: NaiveDate,
    /// Wall-clock start on `date` (UTC).
    pub start_time: NaiveTime,
    /// Planned length in minutes.
    pub duration: u32,
    pub status: ClassStatus,
    /// Students enrolled in the class.
    pub attendees: Vec<String>,
    /// Students that actually joined the live session.
    pub students_joined: Vec<String>,
    pub actual_start_time: Option<DateTime<Utc>>,
    pub actual_end_time: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Class {
    pub fn new(
        title: &str,
        instructor_id: &str,
        date: NaiveDate,
        start_time: NaiveTime,
        duration: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            // UUIDv7 sorts by creation time, which keeps job listings readable
            id: Uuid::now_v7().to_string(),
            title: title.to_string(),
            instructor_id: instructor_id.to_string(),
            date,
            start_time,
            duration,
            status: ClassStatus::Scheduled,
            attendees: Vec::new(),
            students_joined: Vec::new(),
            actual_start_time: None,
            actual_end_time: None,
            cancellation_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Scheduled start instant.
    pub fn starts_at(&self) -> DateTime<Utc> {
        self.date.and_time(self.start_time).and_utc()
    }

    /// Scheduled end instant (`starts_at + duration`).
    pub fn ends_at(&self) -> DateTime<Utc> {
        self.starts_at() + Duration::minutes(i64::from(self.duration))
    }

    /// Move to `next`, rejecting anything outside the transition table.
    pub fn transition(&mut self, next: ClassStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(ClassroomError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Attendees plus the instructor, without duplicates, in a stable order.
    pub fn participants(&self) -> Vec<String> {
        let mut out = self.attendees.clone();
        if !out.iter().any(|a| a == &self.instructor_id) {
            out.push(self.instructor_id.clone());
        }
        out
    }

    /// Record that a student joined. No-op if already recorded.
    pub fn record_join(&mut self, student_id: &str) {
        if !self.students_joined.iter().any(|s| s == student_id) {
            self.students_joined.push(student_id.to_string());
            self.updated_at = Utc::now();
        }
    }
}

/// Class fields an update can touch. Passed to the lifecycle orchestrator so
/// it can tell a timing change from a cosmetic one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClassField {
    Title,
    Date,
    StartTime,
    Duration,
    Attendees,
}

impl ClassField {
    /// Fields that move a lifecycle job: the start and the scheduled end.
    pub fn affects_schedule(self) -> bool {
        matches!(
            self,
            ClassField::Date | ClassField::StartTime | ClassField::Duration
        )
    }
}

/// Kinds of notification the lifecycle jobs emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ClassLive,
    ClassReminder,
    ClassCancelled,
    ClassCompleted,
    ReviewReminder,
}

impl NotificationKind {
    /// Every kind produced by the class lifecycle; the cleanup job only
    /// deletes these.
    pub const LIFECYCLE: [NotificationKind; 5] = [
        NotificationKind::ClassLive,
        NotificationKind::ClassReminder,
        NotificationKind::ClassCancelled,
        NotificationKind::ClassCompleted,
        NotificationKind::ReviewReminder,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::ClassLive => "class_live",
            NotificationKind::ClassReminder => "class_reminder",
            NotificationKind::ClassCancelled => "class_cancelled",
            NotificationKind::ClassCompleted => "class_completed",
            NotificationKind::ReviewReminder => "review_reminder",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NotificationKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        NotificationKind::LIFECYCLE
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown notification kind: {s}"))
    }
}

/// Fire-and-forget notification record. Written by lifecycle jobs, never
/// read back by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub recipient_id: String,
    pub kind: NotificationKind,
    pub class_id: Option<String>,
    pub message: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(recipient_id: &str, kind: NotificationKind, class_id: &str, message: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            recipient_id: recipient_id.to_string(),
            kind,
            class_id: Some(class_id.to_string()),
            message,
            read: false,
            created_at: Utc::now(),
        }
    }
}

/// A student's review of a class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Review {
    pub id: String,
    pub class_id: String,
    pub student_id: String,
    /// 1..=5
    pub rating: u8,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}
