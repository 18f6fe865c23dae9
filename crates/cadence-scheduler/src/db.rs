use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates `scheduled_jobs` and `job_runs` (idempotent). Safe to call on
/// every startup and from every process sharing the database file.
pub fn init_db(conn: &Connection) -> Result<()> {
    create_scheduled_jobs_table(conn)?;
    create_job_runs_table(conn)?;
    Ok(())
}

fn create_scheduled_jobs_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS scheduled_jobs (
            id                TEXT    NOT NULL PRIMARY KEY,
            name              TEXT    NOT NULL,
            slug              TEXT    NOT NULL UNIQUE,
            description       TEXT,
            category          TEXT    NOT NULL DEFAULT 'general',
            job_target        TEXT    NOT NULL,
            job_params        TEXT    NOT NULL DEFAULT '{}',   -- JSON
            cron_expression   TEXT,
            repeat_every_ms   INTEGER,
            timezone          TEXT    NOT NULL DEFAULT 'UTC',
            enabled           INTEGER NOT NULL DEFAULT 1,
            timeout_ms        INTEGER NOT NULL,
            retry_attempts    INTEGER NOT NULL,
            retry_delay_ms    INTEGER NOT NULL,
            next_run_at       TEXT,               -- NULL: disabled or manual-only
            running_run_id    TEXT,               -- claim marker, NULL when idle
            claimed_at        TEXT,
            last_run_id       TEXT,
            last_run_at       TEXT,
            last_status       TEXT,
            last_duration_ms  INTEGER,
            last_error        TEXT,
            run_count         INTEGER NOT NULL DEFAULT 0,
            success_count     INTEGER NOT NULL DEFAULT 0,
            fail_count        INTEGER NOT NULL DEFAULT 0,
            created_at        TEXT    NOT NULL,
            updated_at        TEXT    NOT NULL,
            created_by        TEXT,
            CHECK (cron_expression IS NULL OR repeat_every_ms IS NULL)
        ) STRICT;

        -- Dispatcher scan: WHERE enabled = 1 AND next_run_at <= ? AND running_run_id IS NULL
        CREATE INDEX IF NOT EXISTS idx_scheduled_jobs_due
            ON scheduled_jobs (enabled, next_run_at);
        CREATE INDEX IF NOT EXISTS idx_scheduled_jobs_category
            ON scheduled_jobs (category);
        ",
    )?;
    Ok(())
}

fn create_job_runs_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS job_runs (
            id             TEXT    NOT NULL PRIMARY KEY,
            job_id         TEXT    NOT NULL REFERENCES scheduled_jobs (id) ON DELETE CASCADE,
            queue_job_id   TEXT,
            status         TEXT    NOT NULL DEFAULT 'pending',
            started_at     TEXT,
            completed_at   TEXT,
            duration_ms    INTEGER,
            trigger_type   TEXT    NOT NULL,
            triggered_by   TEXT,
            output         TEXT,               -- JSON
            error_message  TEXT,
            attempt        INTEGER NOT NULL DEFAULT 1,
            created_at     TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_job_runs_job
            ON job_runs (job_id, created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_job_runs_status
            ON job_runs (status);
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

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master
                 WHERE type = 'table' AND name IN ('scheduled_jobs', 'job_runs')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 2);
    }

    #[test]
    fn both_trigger_columns_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        let res = conn.execute(
            "INSERT INTO scheduled_jobs
             (id, name, slug, job_target, cron_expression, repeat_every_ms,
              timeout_ms, retry_attempts, retry_delay_ms, created_at, updated_at)
             VALUES ('j', 'n', 's', 't', '* * * * *', 1000, 1, 1, 1, 'x', 'x')",
            [],
        );
        assert!(res.is_err());
    }
}
