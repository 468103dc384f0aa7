use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{
    params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension,
    TransactionBehavior,
};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::{
    db::init_db,
    error::Result,
    types::{Job, JobFilter, NewJob, Priority},
};

/// Durable collection of [`Job`] records shared by every scheduler instance.
///
/// Every write that depends on ownership (`claim`, `complete`, `fail`) is a
/// single conditional statement, so implementations must make each call
/// atomic with respect to other callers on the same store.
pub trait JobStore: Send + Sync {
    fn insert(&self, job: NewJob, now: DateTime<Utc>) -> Result<Job>;

    /// Insert a recurring job, or refresh the existing recurring job with the
    /// same name (cron, payload, options, next run).
    fn upsert_recurring(&self, job: NewJob, now: DateTime<Utc>) -> Result<Job>;

    fn get(&self, id: &str) -> Result<Option<Job>>;

    /// Jobs matching `filter`, earliest `next_run_at` first.
    fn find(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    /// Delete matching jobs that are not currently claimed. Returns the count.
    fn delete(&self, filter: &JobFilter, now: DateTime<Utc>) -> Result<usize>;

    /// `delete(filter)` followed by inserting `jobs`, as one atomic unit.
    fn replace(
        &self,
        filter: &JobFilter,
        jobs: Vec<NewJob>,
        now: DateTime<Utc>,
    ) -> Result<(usize, Vec<Job>)>;

    /// Claimable jobs among `names` at `now`: due, enabled, not holding an
    /// unexpired lock and not a settled failure. Highest priority first.
    fn due(&self, names: &[String], now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>>;

    /// Compare-and-swap claim. `true` only for the single caller that took
    /// the lock; every concurrent caller gets `false`.
    fn claim(&self, id: &str, worker_id: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Record success. `next_run_at == None` deletes the job, otherwise the
    /// lock is cleared and the job is pushed to `next_run_at`. A no-op
    /// returning `false` if `worker_id` no longer holds the lock.
    fn complete(
        &self,
        id: &str,
        worker_id: &str,
        finished_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<bool>;

    /// Record failure and clear the lock. `next_run_at == None` leaves the
    /// due time unchanged. Same ownership rule as `complete`.
    fn fail(
        &self,
        id: &str,
        worker_id: &str,
        finished_at: DateTime<Utc>,
        reason: &str,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<bool>;

    /// Move a job to `at` and clear its failure bookkeeping.
    fn reschedule(&self, id: &str, at: DateTime<Utc>) -> Result<bool>;

    fn set_disabled(&self, id: &str, disabled: bool) -> Result<bool>;
}

const JOB_COLUMNS: &str = "id, name, payload, next_run_at, repeat_cron, priority, locked_at,
     locked_by, lock_lifetime_ms, max_retries, fail_count, fail_reason, failed_at,
     last_run_at, last_finished_at, disabled, created_at";

/// Predicate shared by `due` and `claim`: `:now` must be bound by the caller.
const CLAIMABLE: &str = "disabled = 0
     AND next_run_at <= :now
     AND (locked_at IS NULL OR locked_at + lock_lifetime_ms < :now)
     AND (repeat_cron IS NOT NULL OR fail_count <= max_retries)";

/// SQLite-backed job store. Several instances may open the same database
/// file; the conditional updates keep claims exclusive across them.
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

impl SqliteJobStore {
    /// Wrap an open connection, creating the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // a panic while holding the guard cannot leave a half-applied
        // statement behind, so the connection is still usable
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl JobStore for SqliteJobStore {
    #[instrument(skip(self, job, now), fields(name = %job.name))]
    fn insert(&self, job: NewJob, now: DateTime<Utc>) -> Result<Job> {
        let conn = self.conn();
        insert_row(&conn, job, now)
    }

    fn upsert_recurring(&self, job: NewJob, now: DateTime<Utc>) -> Result<Job> {
        let mut conn = self.conn();
        // take the write lock up front: a deferred read-then-write transaction
        // fails with SQLITE_BUSY when another worker registers concurrently
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM jobs WHERE name = ?1 AND repeat_cron IS NOT NULL
                 ORDER BY created_at LIMIT 1",
                [&job.name],
                |row| row.get(0),
            )
            .optional()?;

        let stored = match existing {
            Some(id) => {
                tx.execute(
                    "UPDATE jobs SET payload = ?2, repeat_cron = ?3, priority = ?4,
                         lock_lifetime_ms = ?5, max_retries = ?6, next_run_at = ?7
                     WHERE id = ?1",
                    params![
                        id,
                        serde_json::to_string(&job.payload)?,
                        job.repeat_cron,
                        job.priority.rank(),
                        job.lock_lifetime_ms,
                        job.max_retries,
                        job.next_run_at.timestamp_millis(),
                    ],
                )?;
                debug!(job_id = %id, name = %job.name, "recurring job refreshed");
                select_one(&tx, &id)?
            }
            None => insert_row(&tx, job, now)?,
        };

        tx.commit()?;
        Ok(stored)
    }

    fn get(&self, id: &str) -> Result<Option<Job>> {
        let conn = self.conn();
        Ok(conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                [id],
                row_to_job,
            )
            .optional()?)
    }

    fn find(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let (clause, args) = filter_clause(filter);
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE {clause}
             ORDER BY next_run_at, created_at"
        ))?;
        let jobs = stmt
            .query_map(params_from_iter(args), row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    fn delete(&self, filter: &JobFilter, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn();
        delete_unclaimed(&conn, filter, now)
    }

    fn replace(
        &self,
        filter: &JobFilter,
        jobs: Vec<NewJob>,
        now: DateTime<Utc>,
    ) -> Result<(usize, Vec<Job>)> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let removed = delete_unclaimed(&tx, filter, now)?;
        let inserted = jobs
            .into_iter()
            .map(|job| insert_row(&tx, job, now))
            .collect::<Result<Vec<_>>>()?;
        tx.commit()?;
        Ok((removed, inserted))
    }

    fn due(&self, names: &[String], now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE name IN (SELECT value FROM json_each(:names)) AND {CLAIMABLE}
             ORDER BY priority DESC, next_run_at ASC
             LIMIT :limit"
        ))?;
        let names_json = serde_json::to_string(names)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let jobs = stmt
            .query_map(
                rusqlite::named_params! {
                    ":names": names_json,
                    ":now": now.timestamp_millis(),
                    ":limit": limit,
                },
                row_to_job,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    fn claim(&self, id: &str, worker_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn();
        let n = conn.execute(
            &format!(
                "UPDATE jobs SET locked_at = :now, locked_by = :worker, last_run_at = :now
                 WHERE id = :id AND {CLAIMABLE}"
            ),
            rusqlite::named_params! {
                ":now": now.timestamp_millis(),
                ":worker": worker_id,
                ":id": id,
            },
        )?;
        Ok(n == 1)
    }

    fn complete(
        &self,
        id: &str,
        worker_id: &str,
        finished_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let conn = self.conn();
        let n = match next_run_at {
            None => conn.execute(
                "DELETE FROM jobs WHERE id = ?1 AND locked_by = ?2",
                params![id, worker_id],
            )?,
            Some(next) => conn.execute(
                "UPDATE jobs SET next_run_at = ?3, locked_at = NULL, locked_by = NULL,
                     last_finished_at = ?4, fail_count = 0, fail_reason = NULL,
                     failed_at = NULL
                 WHERE id = ?1 AND locked_by = ?2",
                params![
                    id,
                    worker_id,
                    next.timestamp_millis(),
                    finished_at.timestamp_millis()
                ],
            )?,
        };
        Ok(n == 1)
    }

    fn fail(
        &self,
        id: &str,
        worker_id: &str,
        finished_at: DateTime<Utc>,
        reason: &str,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE jobs SET fail_count = fail_count + 1, fail_reason = ?3,
                 failed_at = ?4, last_finished_at = ?4,
                 locked_at = NULL, locked_by = NULL,
                 next_run_at = COALESCE(?5, next_run_at)
             WHERE id = ?1 AND locked_by = ?2",
            params![
                id,
                worker_id,
                reason,
                finished_at.timestamp_millis(),
                next_run_at.map(|t| t.timestamp_millis()),
            ],
        )?;
        Ok(n == 1)
    }

    fn reschedule(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE jobs SET next_run_at = ?2, fail_count = 0, fail_reason = NULL,
                 failed_at = NULL
             WHERE id = ?1",
            params![id, at.timestamp_millis()],
        )?;
        Ok(n == 1)
    }

    fn set_disabled(&self, id: &str, disabled: bool) -> Result<bool> {
        let conn = self.conn();
        let n = conn.execute(
            "UPDATE jobs SET disabled = ?2 WHERE id = ?1",
            params![id, disabled],
        )?;
        Ok(n == 1)
    }
}

// --- private helpers -------------------------------------------------------

fn insert_row(conn: &Connection, job: NewJob, now: DateTime<Utc>) -> Result<Job> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO jobs
         (id, name, payload, next_run_at, repeat_cron, priority, lock_lifetime_ms,
          max_retries, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            id,
            job.name,
            serde_json::to_string(&job.payload)?,
            job.next_run_at.timestamp_millis(),
            job.repeat_cron,
            job.priority.rank(),
            job.lock_lifetime_ms,
            job.max_retries,
            now.timestamp_millis(),
        ],
    )?;
    debug!(job_id = %id, name = %job.name, next_run_at = %job.next_run_at, "job inserted");

    // Millisecond storage truncates sub-ms precision; hand back what a later
    // read would return.
    let next_run_at = from_ms(job.next_run_at.timestamp_millis(), 3)?;
    let created_at = from_ms(now.timestamp_millis(), 16)?;
    Ok(Job {
        id,
        name: job.name,
        payload: job.payload,
        next_run_at,
        repeat_cron: job.repeat_cron,
        priority: job.priority,
        locked_at: None,
        locked_by: None,
        lock_lifetime_ms: job.lock_lifetime_ms,
        max_retries: job.max_retries,
        fail_count: 0,
        fail_reason: None,
        failed_at: None,
        last_run_at: None,
        last_finished_at: None,
        disabled: false,
        created_at,
    })
}

fn select_one(conn: &Connection, id: &str) -> Result<Job> {
    Ok(conn.query_row(
        &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
        [id],
        row_to_job,
    )?)
}

fn delete_unclaimed(conn: &Connection, filter: &JobFilter, now: DateTime<Utc>) -> Result<usize> {
    let (clause, mut args) = filter_clause(filter);
    args.push(SqlValue::Integer(now.timestamp_millis()));
    let now_idx = args.len();
    let n = conn.execute(
        &format!(
            "DELETE FROM jobs WHERE {clause}
             AND (locked_at IS NULL OR locked_at + lock_lifetime_ms < ?{now_idx})"
        ),
        params_from_iter(args),
    )?;
    Ok(n)
}

/// Render a [`JobFilter`] as a WHERE clause with numbered placeholders.
fn filter_clause(filter: &JobFilter) -> (String, Vec<SqlValue>) {
    let mut clauses = vec!["1 = 1".to_string()];
    let mut args: Vec<SqlValue> = Vec::new();

    if let Some(ref id) = filter.id {
        args.push(SqlValue::Text(id.clone()));
        clauses.push(format!("id = ?{}", args.len()));
    }
    if let Some(ref name) = filter.name {
        args.push(SqlValue::Text(name.clone()));
        clauses.push(format!("name = ?{}", args.len()));
    }
    for (key, value) in &filter.payload {
        args.push(SqlValue::Text(format!("$.\"{key}\"")));
        let path_idx = args.len();
        args.push(SqlValue::Text(value.clone()));
        clauses.push(format!(
            "json_extract(payload, ?{path_idx}) = ?{}",
            args.len()
        ));
    }

    (clauses.join(" AND "), args)
}

fn from_ms(ms: i64, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(column, ms))
}

fn opt_from_ms(ms: Option<i64>, column: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    ms.map(|ms| from_ms(ms, column)).transpose()
}

/// Map a SELECT row (column order from JOB_COLUMNS) to a Job.
fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let payload_json: String = row.get(2)?;
    let payload = serde_json::from_str(&payload_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(Job {
        id: row.get(0)?,
        name: row.get(1)?,
        payload,
        next_run_at: from_ms(row.get(3)?, 3)?,
        repeat_cron: row.get(4)?,
        priority: Priority::from_rank(row.get(5)?),
        locked_at: opt_from_ms(row.get(6)?, 6)?,
        locked_by: row.get(7)?,
        lock_lifetime_ms: row.get(8)?,
        max_retries: row.get(9)?,
        fail_count: row.get(10)?,
        fail_reason: row.get(11)?,
        failed_at: opt_from_ms(row.get(12)?, 12)?,
        last_run_at: opt_from_ms(row.get(13)?, 13)?,
        last_finished_at: opt_from_ms(row.get(14)?, 14)?,
        disabled: row.get(15)?,
        created_at: from_ms(row.get(16)?, 16)?,
    })
}
