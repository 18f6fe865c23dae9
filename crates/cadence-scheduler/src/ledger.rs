//! Durable store of job definitions and run history.
//!
//! Every multi-row change (claim, completion + rollup + release) runs in a
//! single `BEGIN IMMEDIATE` transaction, so several dispatchers can share one
//! database file without double-firing a job.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::db::init_db;
use crate::error::{Result, SchedulerError};
use crate::time::{self, opt_to_sql, to_sql};
use crate::trigger::TriggerCalculator;
use crate::types::{
    JobFilter, JobPatch, JobRun, LastRun, NewJob, RunCompletion, RunFilter, RunStatus, RunUpdate,
    ScheduledJob, Trigger, TriggerType,
};

const JOB_COLUMNS: &str = "id, name, slug, description, category, job_target, job_params,
    cron_expression, repeat_every_ms, timezone, enabled, timeout_ms, retry_attempts,
    retry_delay_ms, next_run_at, running_run_id, claimed_at, last_run_id, last_run_at,
    last_status, last_duration_ms, last_error, run_count, success_count, fail_count,
    created_at, updated_at, created_by";

const RUN_COLUMNS: &str = "id, job_id, queue_job_id, status, started_at, completed_at,
    duration_ms, trigger_type, triggered_by, output, error_message, attempt, created_at";

/// Thread-safe handle on the scheduler tables.
///
/// Wraps one SQLite connection in a `Mutex`. Separate processes (or separate
/// `JobLedger`s on the same file) coordinate through SQLite locking.
pub struct JobLedger {
    db: Mutex<Connection>,
    triggers: TriggerCalculator,
}

impl JobLedger {
    /// Wrap an open connection, creating the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
            triggers: TriggerCalculator::new(),
        })
    }

    /// Open (or create) a database file in WAL mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::new(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- job definitions ---------------------------------------------------

    /// Validate and insert a new job. `next_run_at` is computed from now.
    #[instrument(skip(self, new), fields(slug = %new.slug))]
    pub fn create_job(&self, new: NewJob) -> Result<ScheduledJob> {
        validate_definition(&new.name, &new.slug, &new.job_target, new.timeout_ms)?;
        self.triggers.validate(new.trigger.as_ref(), &new.timezone)?;

        let now = time::now();
        let next = if new.enabled {
            self.triggers
                .next_trigger(new.trigger.as_ref(), &new.timezone, now)?
        } else {
            None
        };
        let id = Uuid::now_v7().to_string();
        let params_json = serde_json::to_string(&new.job_params)?;
        let (cron, every) = trigger_columns(new.trigger.as_ref());

        let db = self.lock();
        let inserted = db.execute(
            "INSERT INTO scheduled_jobs
             (id, name, slug, description, category, job_target, job_params,
              cron_expression, repeat_every_ms, timezone, enabled, timeout_ms,
              retry_attempts, retry_delay_ms, next_run_at, created_at, updated_at, created_by)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?16,?17)",
            params![
                id,
                new.name,
                new.slug,
                new.description,
                new.category,
                new.job_target,
                params_json,
                cron,
                every,
                new.timezone,
                new.enabled,
                new.timeout_ms as i64,
                new.retry_attempts as i64,
                new.retry_delay_ms as i64,
                opt_to_sql(next),
                to_sql(now),
                new.created_by,
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(SchedulerError::DuplicateSlug { slug: new.slug });
            }
            Err(e) => return Err(e.into()),
        }

        info!(job_id = %id, next_run_at = ?next, "job created");
        fetch_job(&db, &id)?.ok_or(SchedulerError::JobNotFound { id })
    }

    pub fn get_job(&self, id: &str) -> Result<Option<ScheduledJob>> {
        fetch_job(&self.lock(), id)
    }

    pub fn get_job_by_slug(&self, slug: &str) -> Result<Option<ScheduledJob>> {
        let db = self.lock();
        let job = db
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM scheduled_jobs WHERE slug = ?1"),
                params![slug],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    /// Resolve an operator-supplied reference: id first, then slug.
    pub fn find_job(&self, reference: &str) -> Result<ScheduledJob> {
        if let Some(job) = self.get_job(reference)? {
            return Ok(job);
        }
        self.get_job_by_slug(reference)?
            .ok_or_else(|| SchedulerError::JobNotFound {
                id: reference.to_string(),
            })
    }

    /// Jobs ordered by category, then name.
    pub fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<ScheduledJob>> {
        let db = self.lock();
        let mut stmt = db.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM scheduled_jobs
             WHERE (?1 IS NULL OR category = ?1) AND (?2 IS NULL OR enabled = ?2)
             ORDER BY category, name"
        ))?;
        let jobs = stmt
            .query_map(params![filter.category, filter.enabled], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    /// Apply `patch`. `next_run_at` is recomputed from now only when the
    /// trigger, timezone or enabled flag actually changed.
    #[instrument(skip(self, patch))]
    pub fn update_job(&self, id: &str, patch: JobPatch) -> Result<ScheduledJob> {
        let mut db = self.lock();
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = fetch_job(&tx, id)?.ok_or_else(|| SchedulerError::JobNotFound {
            id: id.to_string(),
        })?;

        let mut job = current.clone();
        if let Some(name) = patch.name {
            job.name = name;
        }
        if let Some(description) = patch.description {
            job.description = description;
        }
        if let Some(category) = patch.category {
            job.category = category;
        }
        if let Some(target) = patch.job_target {
            job.job_target = target;
        }
        if let Some(params) = patch.job_params {
            job.job_params = params;
        }
        if let Some(trigger) = patch.trigger {
            job.trigger = trigger;
        }
        if let Some(timezone) = patch.timezone {
            job.timezone = timezone;
        }
        if let Some(enabled) = patch.enabled {
            job.enabled = enabled;
        }
        if let Some(timeout_ms) = patch.timeout_ms {
            job.timeout_ms = timeout_ms;
        }
        if let Some(attempts) = patch.retry_attempts {
            job.retry_attempts = attempts;
        }
        if let Some(delay) = patch.retry_delay_ms {
            job.retry_delay_ms = delay;
        }

        validate_definition(&job.name, &job.slug, &job.job_target, job.timeout_ms)?;
        self.triggers.validate(job.trigger.as_ref(), &job.timezone)?;

        let now = time::now();
        let schedule_changed = job.trigger != current.trigger
            || job.timezone != current.timezone
            || job.enabled != current.enabled;
        let next = if !schedule_changed {
            current.next_run_at
        } else if job.enabled {
            self.triggers
                .next_trigger(job.trigger.as_ref(), &job.timezone, now)?
        } else {
            None
        };

        let (cron, every) = trigger_columns(job.trigger.as_ref());
        tx.execute(
            "UPDATE scheduled_jobs SET
               name = ?1, description = ?2, category = ?3, job_target = ?4, job_params = ?5,
               cron_expression = ?6, repeat_every_ms = ?7, timezone = ?8, enabled = ?9,
               timeout_ms = ?10, retry_attempts = ?11, retry_delay_ms = ?12,
               next_run_at = ?13, updated_at = ?14
             WHERE id = ?15",
            params![
                job.name,
                job.description,
                job.category,
                job.job_target,
                serde_json::to_string(&job.job_params)?,
                cron,
                every,
                job.timezone,
                job.enabled,
                job.timeout_ms as i64,
                job.retry_attempts as i64,
                job.retry_delay_ms as i64,
                opt_to_sql(next),
                to_sql(now),
                id,
            ],
        )?;
        let updated = fetch_job(&tx, id)?.ok_or_else(|| SchedulerError::JobNotFound {
            id: id.to_string(),
        })?;
        tx.commit()?;

        info!(job_id = %id, schedule_changed, "job updated");
        Ok(updated)
    }

    /// Delete a job and, by cascade, its run history.
    #[instrument(skip(self))]
    pub fn delete_job(&self, id: &str) -> Result<()> {
        let n = self
            .lock()
            .execute("DELETE FROM scheduled_jobs WHERE id = ?1", params![id])?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        info!(job_id = %id, "job deleted");
        Ok(())
    }

    /// Enable or disable a job. Enabling recomputes `next_run_at` from now,
    /// disabling clears it. A no-op when the flag already has that value.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<ScheduledJob> {
        self.update_job(
            id,
            JobPatch {
                enabled: Some(enabled),
                ..JobPatch::default()
            },
        )
    }

    /// Overwrite `next_run_at` directly.
    pub fn update_job_next_run(&self, id: &str, next: Option<DateTime<Utc>>) -> Result<()> {
        let n = self.lock().execute(
            "UPDATE scheduled_jobs SET next_run_at = ?1, updated_at = ?2 WHERE id = ?3",
            params![opt_to_sql(next), to_sql(time::now()), id],
        )?;
        if n == 0 {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        Ok(())
    }

    /// Record a finished run on the job's rollup fields and bump its counters.
    pub fn update_job_last_run(&self, id: &str, last: &LastRun) -> Result<()> {
        apply_last_run(&self.lock(), id, last)
    }

    // --- run history -------------------------------------------------------

    /// Insert a pending run without claiming the job.
    ///
    /// The dispatcher never uses this; it goes through [`JobLedger::claim`].
    pub fn create_run(
        &self,
        job_id: &str,
        trigger_type: TriggerType,
        triggered_by: Option<&str>,
    ) -> Result<JobRun> {
        let db = self.lock();
        if fetch_job(&db, job_id)?.is_none() {
            return Err(SchedulerError::JobNotFound {
                id: job_id.to_string(),
            });
        }
        let run_id = Uuid::now_v7().to_string();
        insert_run(&db, &run_id, job_id, trigger_type, triggered_by, time::now())
    }

    pub fn get_run(&self, id: &str) -> Result<Option<JobRun>> {
        fetch_run(&self.lock(), id)
    }

    /// Runs newest first, paged by `filter.limit` / `filter.offset`.
    pub fn list_runs(&self, filter: &RunFilter) -> Result<Vec<JobRun>> {
        let db = self.lock();
        let mut stmt = db.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM job_runs
             WHERE (?1 IS NULL OR job_id = ?1) AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at DESC, id DESC
             LIMIT ?3 OFFSET ?4"
        ))?;
        let runs = stmt
            .query_map(
                params![
                    filter.job_id,
                    filter.status.map(RunStatus::as_str),
                    filter.limit as i64,
                    filter.offset as i64,
                ],
                row_to_run,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    pub fn count_runs(&self, filter: &RunFilter) -> Result<u64> {
        let n: i64 = self.lock().query_row(
            "SELECT COUNT(*) FROM job_runs
             WHERE (?1 IS NULL OR job_id = ?1) AND (?2 IS NULL OR status = ?2)",
            params![filter.job_id, filter.status.map(RunStatus::as_str)],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    /// Change the in-flight fields of a run. Terminal runs are read-only.
    pub fn update_run(&self, id: &str, update: &RunUpdate) -> Result<()> {
        if let Some(status) = update.status {
            if status.is_terminal() {
                return Err(SchedulerError::InvalidTransition(format!(
                    "use update_run_complete to move a run to {status}"
                )));
            }
        }
        let db = self.lock();
        let n = db.execute(
            "UPDATE job_runs SET
               status        = COALESCE(?1, status),
               queue_job_id  = COALESCE(?2, queue_job_id),
               started_at    = COALESCE(?3, started_at),
               attempt       = COALESCE(?4, attempt),
               error_message = COALESCE(?5, error_message)
             WHERE id = ?6 AND status IN ('pending', 'running')",
            params![
                update.status.map(RunStatus::as_str),
                update.queue_job_id,
                opt_to_sql(update.started_at),
                update.attempt.map(i64::from),
                update.error_message,
                id,
            ],
        )?;
        if n == 0 {
            return Err(run_state_error(&db, id)?);
        }
        Ok(())
    }

    /// Move a pending run to `running` once a worker picks it up.
    pub fn mark_run_started(
        &self,
        id: &str,
        queue_job_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<()> {
        self.update_run(
            id,
            &RunUpdate {
                status: Some(RunStatus::Running),
                queue_job_id: Some(queue_job_id.to_string()),
                started_at: Some(started_at),
                ..RunUpdate::default()
            },
        )
    }

    /// Note a failed attempt that will be retried: bump `attempt` and keep the
    /// latest error visible while the run waits.
    pub fn record_failed_attempt(&self, id: &str, failed_attempt: u32, error: &str) -> Result<()> {
        self.update_run(
            id,
            &RunUpdate {
                attempt: Some(failed_attempt + 1),
                error_message: Some(error.to_string()),
                ..RunUpdate::default()
            },
        )
    }

    /// The single terminal transition of a run. Does not touch the job.
    pub fn update_run_complete(&self, id: &str, completion: &RunCompletion) -> Result<()> {
        complete_run(&self.lock(), id, completion)
    }

    /// Keep the newest `keep` runs of a job and delete the older finished ones.
    /// Pending and running runs are never deleted.
    pub fn delete_old_runs(&self, job_id: &str, keep: usize) -> Result<usize> {
        delete_old_runs(&self.lock(), job_id, keep)
    }

    /// Apply [`JobLedger::delete_old_runs`] to every job.
    #[instrument(skip(self))]
    pub fn prune_runs(&self, keep: usize) -> Result<usize> {
        let mut db = self.lock();
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let job_ids: Vec<String> = {
            let mut stmt = tx.prepare("SELECT id FROM scheduled_jobs")?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            ids
        };
        let mut deleted = 0;
        for job_id in &job_ids {
            deleted += delete_old_runs(&tx, job_id, keep)?;
        }
        tx.commit()?;
        if deleted > 0 {
            info!(deleted, keep, "old runs pruned");
        }
        Ok(deleted)
    }

    // --- dispatcher protocol -----------------------------------------------

    /// Enabled, unclaimed jobs whose `next_run_at` is at or before `now`,
    /// oldest first. Rows that fail to decode are skipped with a warning.
    pub fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ScheduledJob>> {
        let db = self.lock();
        let mut stmt = db.prepare_cached(&format!(
            "SELECT {JOB_COLUMNS} FROM scheduled_jobs
             WHERE enabled = 1 AND running_run_id IS NULL
               AND next_run_at IS NOT NULL AND next_run_at <= ?1
             ORDER BY next_run_at
             LIMIT ?2"
        ))?;
        let jobs = stmt
            .query_map(params![to_sql(now), limit as i64], row_to_job)?
            .filter_map(|r| match r {
                Ok(job) => Some(job),
                Err(e) => {
                    warn!("skipping undecodable job row: {e}");
                    None
                }
            })
            .collect();
        Ok(jobs)
    }

    /// Atomically claim a job and create its pending run.
    ///
    /// Returns `Ok(None)` when someone else holds the claim, or (for scheduled
    /// claims) when the job is no longer due or enabled. Manual claims ignore
    /// `enabled` and `next_run_at`.
    #[instrument(skip(self, now))]
    pub fn claim(
        &self,
        job_id: &str,
        trigger_type: TriggerType,
        triggered_by: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRun>> {
        let mut db = self.lock();
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let run_id = Uuid::now_v7().to_string();
        let now_str = to_sql(now);

        let claimed = match trigger_type {
            TriggerType::Scheduled => tx.execute(
                "UPDATE scheduled_jobs SET running_run_id = ?1, claimed_at = ?2
                 WHERE id = ?3 AND running_run_id IS NULL AND enabled = 1
                   AND next_run_at IS NOT NULL AND next_run_at <= ?2",
                params![run_id, now_str, job_id],
            )?,
            TriggerType::Manual => tx.execute(
                "UPDATE scheduled_jobs SET running_run_id = ?1, claimed_at = ?2
                 WHERE id = ?3 AND running_run_id IS NULL",
                params![run_id, now_str, job_id],
            )?,
        };

        if claimed == 0 {
            if fetch_job(&tx, job_id)?.is_none() {
                return Err(SchedulerError::JobNotFound {
                    id: job_id.to_string(),
                });
            }
            debug!("claim lost");
            return Ok(None);
        }

        let run = insert_run(&tx, &run_id, job_id, trigger_type, triggered_by, now)?;
        tx.commit()?;
        debug!(run_id = %run.id, "job claimed");
        Ok(Some(run))
    }

    /// Finish a claimed run in one transaction: write the terminal status,
    /// update the job rollup, optionally reschedule from `completed_at`, and
    /// release the claim.
    ///
    /// Rescheduling reads the job's current trigger and enabled flag, so
    /// edits made while the run was in flight take effect here.
    #[instrument(skip(self, completion), fields(status = %completion.status))]
    pub fn finish_run(
        &self,
        job_id: &str,
        run_id: &str,
        completion: &RunCompletion,
        reschedule: bool,
    ) -> Result<ScheduledJob> {
        let mut db = self.lock();
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;

        complete_run(&tx, run_id, completion)?;
        let run = fetch_run(&tx, run_id)?.ok_or_else(|| SchedulerError::RunNotFound {
            id: run_id.to_string(),
        })?;
        apply_last_run(
            &tx,
            job_id,
            &LastRun {
                run_id: run_id.to_string(),
                run_at: run.started_at.unwrap_or(run.created_at),
                status: completion.status,
                duration_ms: completion.duration_ms,
                error: completion.error_message.clone(),
            },
        )?;

        if reschedule {
            let job = fetch_job(&tx, job_id)?.ok_or_else(|| SchedulerError::JobNotFound {
                id: job_id.to_string(),
            })?;
            let next = if job.enabled {
                self.triggers
                    .next_trigger(job.trigger.as_ref(), &job.timezone, completion.completed_at)
                    .unwrap_or_else(|e| {
                        warn!(job_id, "cannot compute next run, job parked: {e}");
                        None
                    })
            } else {
                None
            };
            tx.execute(
                "UPDATE scheduled_jobs SET next_run_at = ?1 WHERE id = ?2",
                params![opt_to_sql(next), job_id],
            )?;
        }

        release_claim(&tx, job_id, run_id)?;
        let job = fetch_job(&tx, job_id)?.ok_or_else(|| SchedulerError::JobNotFound {
            id: job_id.to_string(),
        })?;
        tx.commit()?;
        Ok(job)
    }

    /// Fail runs whose claim outlived its lease and release their jobs.
    ///
    /// The lease covers every attempt plus the retry delays between them,
    /// plus `grace`. A job left unclaimed keeps its `next_run_at`, so an
    /// overdue scheduled job fires on the next tick.
    #[instrument(skip(self, now))]
    pub fn recover_stale_claims(&self, now: DateTime<Utc>, grace: Duration) -> Result<usize> {
        let candidates: Vec<ScheduledJob> = {
            let db = self.lock();
            let mut stmt = db.prepare_cached(&format!(
                "SELECT {JOB_COLUMNS} FROM scheduled_jobs WHERE running_run_id IS NOT NULL"
            ))?;
            let jobs = stmt
                .query_map([], row_to_job)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            jobs
        };
        let stale: Vec<ScheduledJob> = candidates
            .into_iter()
            .filter(|job| claim_expired(job, now, grace))
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }

        let mut db = self.lock();
        let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut recovered = 0;
        for job in stale {
            // Re-read under the write lock: the run may have finished meanwhile.
            let Some(current) = fetch_job(&tx, &job.id)? else {
                continue;
            };
            if current.running_run_id != job.running_run_id || !claim_expired(&current, now, grace)
            {
                continue;
            }
            let (Some(run_id), Some(claimed_at)) = (current.running_run_id.clone(), current.claimed_at)
            else {
                continue;
            };

            if let Some(run) = fetch_run(&tx, &run_id)? {
                if !run.status.is_terminal() {
                    let message = format!(
                        "run abandoned: claim held since {} without completing",
                        to_sql(claimed_at)
                    );
                    let completion = RunCompletion {
                        status: RunStatus::Failed,
                        completed_at: now,
                        duration_ms: (now - claimed_at).num_milliseconds().max(0) as u64,
                        output: None,
                        error_message: Some(message.clone()),
                        attempt: run.attempt,
                    };
                    complete_run(&tx, &run_id, &completion)?;
                    apply_last_run(
                        &tx,
                        &current.id,
                        &LastRun {
                            run_id: run_id.clone(),
                            run_at: run.started_at.unwrap_or(run.created_at),
                            status: RunStatus::Failed,
                            duration_ms: completion.duration_ms,
                            error: Some(message),
                        },
                    )?;
                }
            }
            release_claim(&tx, &current.id, &run_id)?;
            warn!(job_id = %current.id, %run_id, "stale claim released");
            recovered += 1;
        }
        tx.commit()?;
        Ok(recovered)
    }
}

impl std::fmt::Debug for JobLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobLedger").finish_non_exhaustive()
    }
}

// --- helpers -----------------------------------------------------------------

/// How long a claim may be held before it is considered abandoned.
pub fn claim_lease(job: &ScheduledJob, grace: Duration) -> TimeDelta {
    let attempts = u64::from(job.max_attempts());
    let ms = job
        .timeout_ms
        .saturating_mul(attempts)
        .saturating_add(job.retry_delay_ms.saturating_mul(attempts - 1))
        .saturating_add(u64::try_from(grace.as_millis()).unwrap_or(u64::MAX));
    i64::try_from(ms)
        .ok()
        .and_then(TimeDelta::try_milliseconds)
        .unwrap_or(TimeDelta::MAX)
}

fn claim_expired(job: &ScheduledJob, now: DateTime<Utc>, grace: Duration) -> bool {
    match job.claimed_at {
        Some(claimed_at) => claimed_at
            .checked_add_signed(claim_lease(job, grace))
            .is_some_and(|expires| expires <= now),
        None => false,
    }
}

fn validate_definition(name: &str, slug: &str, target: &str, timeout_ms: u64) -> Result<()> {
    if name.trim().is_empty() {
        return Err(SchedulerError::InvalidJob("name must not be empty".into()));
    }
    if slug.is_empty() || slug.chars().any(char::is_whitespace) {
        return Err(SchedulerError::InvalidJob(format!(
            "slug must be non-empty and contain no whitespace: {slug:?}"
        )));
    }
    if target.trim().is_empty() {
        return Err(SchedulerError::InvalidJob(
            "job_target must not be empty".into(),
        ));
    }
    if timeout_ms == 0 || i64::try_from(timeout_ms).is_err() {
        return Err(SchedulerError::InvalidJob(format!(
            "timeout_ms out of range: {timeout_ms}"
        )));
    }
    Ok(())
}

fn trigger_columns(trigger: Option<&Trigger>) -> (Option<&str>, Option<i64>) {
    match trigger {
        Some(Trigger::Cron { expression }) => (Some(expression.as_str()), None),
        Some(Trigger::Interval { every_ms }) => (None, Some(*every_ms as i64)),
        None => (None, None),
    }
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn fetch_job(conn: &Connection, id: &str) -> Result<Option<ScheduledJob>> {
    let job = conn
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM scheduled_jobs WHERE id = ?1"),
            params![id],
            row_to_job,
        )
        .optional()?;
    Ok(job)
}

fn fetch_run(conn: &Connection, id: &str) -> Result<Option<JobRun>> {
    let run = conn
        .query_row(
            &format!("SELECT {RUN_COLUMNS} FROM job_runs WHERE id = ?1"),
            params![id],
            row_to_run,
        )
        .optional()?;
    Ok(run)
}

fn insert_run(
    conn: &Connection,
    run_id: &str,
    job_id: &str,
    trigger_type: TriggerType,
    triggered_by: Option<&str>,
    now: DateTime<Utc>,
) -> Result<JobRun> {
    conn.execute(
        "INSERT INTO job_runs (id, job_id, status, trigger_type, triggered_by, attempt, created_at)
         VALUES (?1, ?2, 'pending', ?3, ?4, 1, ?5)",
        params![run_id, job_id, trigger_type.as_str(), triggered_by, to_sql(now)],
    )?;
    Ok(JobRun {
        id: run_id.to_string(),
        job_id: job_id.to_string(),
        queue_job_id: None,
        status: RunStatus::Pending,
        started_at: None,
        completed_at: None,
        duration_ms: None,
        trigger_type,
        triggered_by: triggered_by.map(str::to_string),
        output: None,
        error_message: None,
        attempt: 1,
        created_at: now,
    })
}

fn complete_run(conn: &Connection, id: &str, completion: &RunCompletion) -> Result<()> {
    if !completion.status.is_terminal() {
        return Err(SchedulerError::InvalidTransition(format!(
            "{} is not a terminal status",
            completion.status
        )));
    }
    let output = completion
        .output
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let n = conn.execute(
        "UPDATE job_runs SET status = ?1, completed_at = ?2, duration_ms = ?3,
                output = ?4, error_message = ?5, attempt = ?6
         WHERE id = ?7 AND status IN ('pending', 'running')",
        params![
            completion.status.as_str(),
            to_sql(completion.completed_at),
            completion.duration_ms as i64,
            output,
            completion.error_message,
            i64::from(completion.attempt),
            id,
        ],
    )?;
    if n == 0 {
        return Err(run_state_error(conn, id)?);
    }
    Ok(())
}

/// Why a guarded run update matched no row.
fn run_state_error(conn: &Connection, id: &str) -> Result<SchedulerError> {
    Ok(match fetch_run(conn, id)? {
        Some(_) => SchedulerError::RunFinished { id: id.to_string() },
        None => SchedulerError::RunNotFound { id: id.to_string() },
    })
}

fn apply_last_run(conn: &Connection, job_id: &str, last: &LastRun) -> Result<()> {
    if !last.status.is_terminal() {
        return Err(SchedulerError::InvalidTransition(format!(
            "last run status must be terminal, got {}",
            last.status
        )));
    }
    let succeeded = last.status == RunStatus::Completed;
    let n = conn.execute(
        "UPDATE scheduled_jobs SET
           last_run_id = ?1, last_run_at = ?2, last_status = ?3,
           last_duration_ms = ?4, last_error = ?5,
           run_count = run_count + 1,
           success_count = success_count + ?6,
           fail_count = fail_count + ?7,
           updated_at = ?8
         WHERE id = ?9",
        params![
            last.run_id,
            to_sql(last.run_at),
            last.status.as_str(),
            last.duration_ms as i64,
            last.error,
            i64::from(succeeded),
            i64::from(!succeeded),
            to_sql(time::now()),
            job_id,
        ],
    )?;
    if n == 0 {
        return Err(SchedulerError::JobNotFound {
            id: job_id.to_string(),
        });
    }
    Ok(())
}

fn release_claim(conn: &Connection, job_id: &str, run_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE scheduled_jobs SET running_run_id = NULL, claimed_at = NULL
         WHERE id = ?1 AND running_run_id = ?2",
        params![job_id, run_id],
    )?;
    Ok(())
}

fn delete_old_runs(conn: &Connection, job_id: &str, keep: usize) -> Result<usize> {
    let n = conn.execute(
        "DELETE FROM job_runs
         WHERE job_id = ?1
           AND status NOT IN ('pending', 'running')
           AND id NOT IN (
               SELECT id FROM job_runs WHERE job_id = ?1
               ORDER BY created_at DESC, id DESC LIMIT ?2
           )",
        params![job_id, keep as i64],
    )?;
    if n > 0 {
        debug!(job_id, deleted = n, "old runs deleted");
    }
    Ok(n)
}

fn corrupt(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(SchedulerError::CorruptRow(message)),
    )
}

fn ts(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    time::from_sql(&raw).map_err(|e| corrupt(idx, format!("{raw}: {e}")))
}

fn opt_ts(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| time::from_sql(&s).map_err(|e| corrupt(idx, format!("{s}: {e}"))))
        .transpose()
}

fn opt_u64(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<u64>> {
    Ok(row.get::<_, Option<i64>>(idx)?.map(|v| v as u64))
}

fn json(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<serde_json::Value>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| serde_json::from_str(&s).map_err(|e| corrupt(idx, e.to_string())))
        .transpose()
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduledJob> {
    let trigger = Trigger::from_columns(row.get(7)?, opt_u64(row, 8)?)
        .map_err(|e| corrupt(7, e.to_string()))?;
    let last_status = row
        .get::<_, Option<String>>(19)?
        .map(|s| s.parse::<RunStatus>().map_err(|e| corrupt(19, e)))
        .transpose()?;
    Ok(ScheduledJob {
        id: row.get(0)?,
        name: row.get(1)?,
        slug: row.get(2)?,
        description: row.get(3)?,
        category: row.get(4)?,
        job_target: row.get(5)?,
        job_params: json(row, 6)?.unwrap_or(serde_json::Value::Null),
        trigger,
        timezone: row.get(9)?,
        enabled: row.get(10)?,
        timeout_ms: row.get::<_, i64>(11)? as u64,
        retry_attempts: row.get::<_, i64>(12)? as u32,
        retry_delay_ms: row.get::<_, i64>(13)? as u64,
        next_run_at: opt_ts(row, 14)?,
        running_run_id: row.get(15)?,
        claimed_at: opt_ts(row, 16)?,
        last_run_id: row.get(17)?,
        last_run_at: opt_ts(row, 18)?,
        last_status,
        last_duration_ms: opt_u64(row, 20)?,
        last_error: row.get(21)?,
        run_count: row.get::<_, i64>(22)? as u64,
        success_count: row.get::<_, i64>(23)? as u64,
        fail_count: row.get::<_, i64>(24)? as u64,
        created_at: ts(row, 25)?,
        updated_at: ts(row, 26)?,
        created_by: row.get(27)?,
    })
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRun> {
    let status: String = row.get(3)?;
    let trigger_type: String = row.get(7)?;
    Ok(JobRun {
        id: row.get(0)?,
        job_id: row.get(1)?,
        queue_job_id: row.get(2)?,
        status: status.parse().map_err(|e| corrupt(3, e))?,
        started_at: opt_ts(row, 4)?,
        completed_at: opt_ts(row, 5)?,
        duration_ms: opt_u64(row, 6)?,
        trigger_type: trigger_type.parse().map_err(|e| corrupt(7, e))?,
        triggered_by: row.get(8)?,
        output: json(row, 9)?,
        error_message: row.get(10)?,
        attempt: row.get::<_, i64>(11)? as u32,
        created_at: ts(row, 12)?,
    })
}
