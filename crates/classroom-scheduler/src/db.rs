use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `jobs` table (idempotent) and the indexes the poll query and
/// the per-class cancel use. All instants are Unix milliseconds so lock
/// expiry is plain integer arithmetic inside the claim predicate.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id                TEXT    NOT NULL PRIMARY KEY,
            name              TEXT    NOT NULL,
            payload           TEXT    NOT NULL DEFAULT '{}',  -- JSON object
            next_run_at       INTEGER NOT NULL,
            repeat_cron       TEXT,               -- NULL for one-shot jobs
            priority          INTEGER NOT NULL DEFAULT 0,
            locked_at         INTEGER,
            locked_by         TEXT,
            lock_lifetime_ms  INTEGER NOT NULL,
            max_retries       INTEGER NOT NULL DEFAULT 0,
            fail_count        INTEGER NOT NULL DEFAULT 0,
            fail_reason       TEXT,
            failed_at         INTEGER,
            last_run_at       INTEGER,
            last_finished_at  INTEGER,
            disabled          INTEGER NOT NULL DEFAULT 0,
            created_at        INTEGER NOT NULL
        ) STRICT;

        -- Poll query: WHERE next_run_at <= ? ORDER BY priority DESC, next_run_at
        CREATE INDEX IF NOT EXISTS idx_jobs_due ON jobs (next_run_at, priority);
        CREATE INDEX IF NOT EXISTS idx_jobs_name ON jobs (name);
        -- at most one recurring job per name
        CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_recurring_name
            ON jobs (name) WHERE repeat_cron IS NOT NULL;
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM jobs", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 0);
    }
}
