use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use classroom_core::{Class, ClassStatus, Notification, NotificationKind, Review};
use rusqlite::{types::Type, Connection, Result};

pub(crate) const CLASS_COLUMNS: &str = "id, title, instructor_id, date, start_time, duration,
     status, attendees, students_joined, actual_start_time, actual_end_time,
     cancellation_reason, created_at, updated_at";

pub(crate) const NOTIFICATION_COLUMNS: &str =
    "id, recipient_id, kind, class_id, message, read, created_at";

pub(crate) const REVIEW_COLUMNS: &str = "id, class_id, student_id, rating, comment, created_at";

/// Initialise the class, notification and review tables. Safe to call on
/// every startup.
pub fn init_db(conn: &Connection) -> Result<()> {
    create_classes_table(conn)?;
    create_notifications_table(conn)?;
    create_reviews_table(conn)?;
    Ok(())
}

fn create_classes_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS classes (
            id                  TEXT PRIMARY KEY NOT NULL,
            title               TEXT NOT NULL,
            instructor_id       TEXT NOT NULL,
            date                TEXT NOT NULL,           -- YYYY-MM-DD
            start_time          TEXT NOT NULL,           -- HH:MM:SS
            duration            INTEGER NOT NULL,        -- minutes
            status              TEXT NOT NULL DEFAULT 'scheduled',
            attendees           TEXT NOT NULL DEFAULT '[]',  -- JSON array
            students_joined     TEXT NOT NULL DEFAULT '[]',  -- JSON array
            actual_start_time   INTEGER,
            actual_end_time     INTEGER,
            cancellation_reason TEXT,
            created_at          INTEGER NOT NULL,
            updated_at          INTEGER NOT NULL
        );",
    )
}

fn create_notifications_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS notifications (
            id            TEXT PRIMARY KEY NOT NULL,
            recipient_id  TEXT NOT NULL,
            kind          TEXT NOT NULL,
            class_id      TEXT,
            message       TEXT NOT NULL,
            read          INTEGER NOT NULL DEFAULT 0,
            created_at    INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_notifications_kind_created
            ON notifications (kind, created_at);
        CREATE INDEX IF NOT EXISTS idx_notifications_recipient
            ON notifications (recipient_id);",
    )
}

fn create_reviews_table(conn: &Connection) -> Result<()> {
    // One review per student per class.
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS reviews (
            id          TEXT PRIMARY KEY NOT NULL,
            class_id    TEXT NOT NULL,
            student_id  TEXT NOT NULL,
            rating      INTEGER NOT NULL,
            comment     TEXT,
            created_at  INTEGER NOT NULL,
            UNIQUE(class_id, student_id)
        );",
    )
}

/// Map a SELECT row (column order from CLASS_COLUMNS) to a Class.
pub(crate) fn row_to_class(row: &rusqlite::Row<'_>) -> Result<Class> {
    let date = parse_text::<NaiveDate>(row, 3)?;
    let start_time = parse_text::<NaiveTime>(row, 4)?;
    let status = parse_text::<ClassStatus>(row, 6)?;
    Ok(Class {
        id: row.get(0)?,
        title: row.get(1)?,
        instructor_id: row.get(2)?,
        date,
        start_time,
        duration: row.get(5)?,
        status,
        attendees: json_list(row, 7)?,
        students_joined: json_list(row, 8)?,
        actual_start_time: opt_from_ms(row.get(9)?, 9)?,
        actual_end_time: opt_from_ms(row.get(10)?, 10)?,
        cancellation_reason: row.get(11)?,
        created_at: from_ms(row.get(12)?, 12)?,
        updated_at: from_ms(row.get(13)?, 13)?,
    })
}

pub(crate) fn row_to_notification(row: &rusqlite::Row<'_>) -> Result<Notification> {
    Ok(Notification {
        id: row.get(0)?,
        recipient_id: row.get(1)?,
        kind: parse_text::<NotificationKind>(row, 2)?,
        class_id: row.get(3)?,
        message: row.get(4)?,
        read: row.get(5)?,
        created_at: from_ms(row.get(6)?, 6)?,
    })
}

pub(crate) fn row_to_review(row: &rusqlite::Row<'_>) -> Result<Review> {
    Ok(Review {
        id: row.get(0)?,
        class_id: row.get(1)?,
        student_id: row.get(2)?,
        rating: row.get(3)?,
        comment: row.get(4)?,
        created_at: from_ms(row.get(5)?, 5)?,
    })
}

fn parse_text<T>(row: &rusqlite::Row<'_>, idx: usize) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.to_string().into())
    })
}

fn json_list(row: &rusqlite::Row<'_>, idx: usize) -> Result<Vec<String>> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn from_ms(ms: i64, idx: usize) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn opt_from_ms(ms: Option<i64>, idx: usize) -> Result<Option<DateTime<Utc>>> {
    ms.map(|ms| from_ms(ms, idx)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_all_tables() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master
                 WHERE type = 'table' AND name IN ('classes', 'notifications', 'reviews')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(n, 3);
    }

    #[test]
    fn bad_status_text_is_a_conversion_error() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        conn.execute(
            "INSERT INTO classes (id, title, instructor_id, date, start_time, duration,
                 status, created_at, updated_at)
             VALUES ('c1', 't', 'i', '2026-03-01', '18:30:00', 60, 'paused', 0, 0)",
            [],
        )
        .unwrap();
        let err = conn
            .query_row(
                &format!("SELECT {CLASS_COLUMNS} FROM classes WHERE id = 'c1'"),
                [],
                row_to_class,
            )
            .unwrap_err();
        assert!(matches!(err, rusqlite::Error::FromSqlConversionFailure(6, _, _)));
    }
}
