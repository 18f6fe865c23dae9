use std::sync::Arc;
use std::time::Duration;

use cadence_core::config::SchedulerConfig;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::{
    error::{Result, SchedulerError},
    ledger::JobLedger,
    registry::HandlerRegistry,
    retry::{RetryDecision, RetryPolicy},
    runner::{ExecutionRunner, Outcome},
    time,
    types::{
        JobFilter, JobPatch, JobRun, NewJob, RunCompletion, RunFilter, ScheduledJob, TriggerType,
    },
};

/// Attempts at persisting a run's terminal transition before the claim is
/// left for lease recovery.
const FINISH_ATTEMPTS: u32 = 3;
const FINISH_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Requests delivered to the dispatcher loop.
#[derive(Debug)]
pub enum SchedulerCommand {
    /// Run a job now, regardless of its schedule or enabled flag.
    TriggerJob {
        /// Job id or slug.
        job_ref: String,
        triggered_by: Option<String>,
        response: oneshot::Sender<Result<JobRun>>,
    },
}

/// Cloneable handle for collaborators while the engine loop runs.
///
/// Definition changes go straight to the ledger; "run now" is routed through
/// the loop so it shares the worker pool with scheduled runs.
#[derive(Clone)]
pub struct SchedulerHandle {
    ledger: Arc<JobLedger>,
    commands: mpsc::Sender<SchedulerCommand>,
}

impl SchedulerHandle {
    pub fn create_job(&self, new: NewJob) -> Result<ScheduledJob> {
        self.ledger.create_job(new)
    }

    pub fn remove_job(&self, job_ref: &str) -> Result<()> {
        let job = self.ledger.find_job(job_ref)?;
        self.ledger.delete_job(&job.id)
    }

    pub fn set_enabled(&self, job_ref: &str, enabled: bool) -> Result<ScheduledJob> {
        let job = self.ledger.find_job(job_ref)?;
        self.ledger.set_enabled(&job.id, enabled)
    }

    pub fn update_job(&self, job_ref: &str, patch: JobPatch) -> Result<ScheduledJob> {
        let job = self.ledger.find_job(job_ref)?;
        self.ledger.update_job(&job.id, patch)
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<ScheduledJob>> {
        self.ledger.list_jobs(filter)
    }

    pub fn list_runs(&self, filter: &RunFilter) -> Result<Vec<JobRun>> {
        self.ledger.list_runs(filter)
    }

    /// Keep the newest `keep` finished runs of every job.
    pub fn prune_runs(&self, keep: usize) -> Result<usize> {
        self.ledger.prune_runs(keep)
    }

    /// Start a manual run and return its pending `JobRun` without waiting
    /// for it to execute.
    ///
    /// Fails with `AlreadyRunning` if the job has a run in flight.
    pub async fn trigger_job(&self, job_ref: &str, triggered_by: Option<&str>) -> Result<JobRun> {
        let (response, reply) = oneshot::channel();
        self.commands
            .send(SchedulerCommand::TriggerJob {
                job_ref: job_ref.to_string(),
                triggered_by: triggered_by.map(str::to_string),
                response,
            })
            .await
            .map_err(|_| SchedulerError::EngineStopped)?;
        reply.await.map_err(|_| SchedulerError::EngineStopped)?
    }
}

impl std::fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerHandle").finish_non_exhaustive()
    }
}

/// Everything a spawned run task needs, detached from the engine.
#[derive(Clone)]
struct Worker {
    ledger: Arc<JobLedger>,
    runner: ExecutionRunner,
    permits: Arc<Semaphore>,
}

/// Dispatcher: scans for due jobs, claims them and hands each run to its
/// own Tokio task, bounded by a semaphore of `max_concurrent_runs` permits.
pub struct SchedulerEngine {
    worker: Worker,
    config: SchedulerConfig,
    instance_id: String,
    next_seq: u64,
    in_flight: JoinSet<()>,
    commands_tx: mpsc::Sender<SchedulerCommand>,
    commands_rx: mpsc::Receiver<SchedulerCommand>,
}

impl SchedulerEngine {
    pub fn new(
        ledger: Arc<JobLedger>,
        registry: Arc<HandlerRegistry>,
        config: SchedulerConfig,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(config.command_buffer.max(1));
        let permits = Arc::new(Semaphore::new(config.max_concurrent_runs.max(1)));
        let runner = ExecutionRunner::new(registry, config.max_error_chars);
        Self {
            worker: Worker {
                ledger,
                runner,
                permits,
            },
            instance_id: config.instance_id(),
            config,
            next_seq: 0,
            in_flight: JoinSet::new(),
            commands_tx,
            commands_rx,
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            ledger: Arc::clone(&self.worker.ledger),
            commands: self.commands_tx.clone(),
        }
    }

    /// Runs spawned by this engine that have not been reaped yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Main event loop. Ticks every `tick_interval_ms` until `shutdown`
    /// broadcasts `true`, then drains in-flight runs.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            instance_id = %self.instance_id,
            tick_interval_ms = self.config.tick_interval_ms,
            max_concurrent_runs = self.config.max_concurrent_runs,
            "scheduler engine started"
        );

        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.tick_interval_ms.max(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick(time::now()) {
                        error!("scheduler tick error: {e}");
                    }
                }
                Some(cmd) = self.commands_rx.recv() => self.handle_command(cmd),
                Some(joined) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    log_join(joined);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler engine shutting down");
                        break;
                    }
                }
            }
        }

        self.stop_gracefully().await;
    }

    /// One dispatcher pass at `now`: recover stale claims, then claim and
    /// spawn due jobs while worker permits last. Returns the number of runs
    /// dispatched.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Result<usize> {
        while let Some(joined) = self.in_flight.try_join_next() {
            log_join(joined);
        }

        let grace = Duration::from_millis(self.config.stale_run_grace_ms);
        match self.worker.ledger.recover_stale_claims(now, grace) {
            Ok(0) => {}
            Ok(n) => warn!(count = n, "recovered stale claims"),
            Err(e) => error!("stale claim recovery failed: {e}"),
        }

        let available = self.worker.permits.available_permits();
        if available == 0 {
            debug!("worker pool saturated, skipping scan");
            return Ok(0);
        }

        let due = self.worker.ledger.due_jobs(now, available)?;
        let mut dispatched = 0;
        for job in due {
            let Ok(permit) = Arc::clone(&self.worker.permits).try_acquire_owned() else {
                debug!("worker pool saturated");
                break;
            };
            match self
                .worker
                .ledger
                .claim(&job.id, TriggerType::Scheduled, None, now)
            {
                Ok(Some(run)) => {
                    info!(job_id = %job.id, slug = %job.slug, run_id = %run.id, "dispatching scheduled run");
                    self.spawn_run(job, run, Some(permit));
                    dispatched += 1;
                }
                Ok(None) => debug!(job_id = %job.id, "job claimed elsewhere"),
                Err(e) => error!(job_id = %job.id, "claim failed: {e}"),
            }
        }
        Ok(dispatched)
    }

    /// Claim `job_ref` for a manual run and spawn it. The run waits for a
    /// worker permit inside its own task.
    pub fn trigger_now(&mut self, job_ref: &str, triggered_by: Option<&str>) -> Result<JobRun> {
        let job = self.worker.ledger.find_job(job_ref)?;
        let run = self
            .worker
            .ledger
            .claim(&job.id, TriggerType::Manual, triggered_by, time::now())?
            .ok_or_else(|| SchedulerError::AlreadyRunning { id: job.id.clone() })?;
        info!(
            job_id = %job.id,
            slug = %job.slug,
            run_id = %run.id,
            triggered_by = ?triggered_by,
            "dispatching manual run"
        );
        let permit = Arc::clone(&self.worker.permits).try_acquire_owned().ok();
        self.spawn_run(job, run.clone(), permit);
        Ok(run)
    }

    /// Wait for every in-flight run spawned by this engine.
    pub async fn drain(&mut self) {
        while let Some(joined) = self.in_flight.join_next().await {
            log_join(joined);
        }
    }

    // --- private helpers ---------------------------------------------------

    fn handle_command(&mut self, cmd: SchedulerCommand) {
        match cmd {
            SchedulerCommand::TriggerJob {
                job_ref,
                triggered_by,
                response,
            } => {
                let result = self.trigger_now(&job_ref, triggered_by.as_deref());
                if response.send(result).is_err() {
                    debug!(%job_ref, "trigger requester went away");
                }
            }
        }
    }

    fn spawn_run(&mut self, job: ScheduledJob, run: JobRun, permit: Option<OwnedSemaphorePermit>) {
        self.next_seq += 1;
        let queue_job_id = format!("{}#{}", self.instance_id, self.next_seq);
        let worker = self.worker.clone();
        self.in_flight
            .spawn(async move { worker.execute_run(job, run, queue_job_id, permit).await });
    }

    async fn stop_gracefully(&mut self) {
        self.commands_rx.close();
        while let Ok(cmd) = self.commands_rx.try_recv() {
            let SchedulerCommand::TriggerJob { response, .. } = cmd;
            let _ = response.send(Err(SchedulerError::EngineStopped));
        }

        let grace = Duration::from_millis(self.config.shutdown_grace_ms);
        if tokio::time::timeout(grace, self.drain()).await.is_err() {
            warn!(
                remaining = self.in_flight.len(),
                "shutdown grace expired, aborting in-flight runs"
            );
            self.in_flight.shutdown().await;
        }
        info!("scheduler engine stopped");
    }
}

impl Worker {
    /// Drive one logical run through its attempts and persist the result.
    async fn execute_run(
        self,
        job: ScheduledJob,
        run: JobRun,
        queue_job_id: String,
        permit: Option<OwnedSemaphorePermit>,
    ) {
        let _permit = match permit {
            Some(permit) => permit,
            None => match Arc::clone(&self.permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        let started_at = time::now();
        match self.ledger.mark_run_started(&run.id, &queue_job_id, started_at) {
            Ok(()) => {}
            Err(e @ (SchedulerError::RunFinished { .. } | SchedulerError::RunNotFound { .. })) => {
                warn!(job_id = %job.id, run_id = %run.id, "run no longer pending: {e}");
                return;
            }
            Err(e) => warn!(job_id = %job.id, run_id = %run.id, "could not mark run started: {e}"),
        }

        let policy = RetryPolicy::for_job(&job);
        let mut attempt = 1;
        let outcome = loop {
            let outcome = self.runner.execute(&job, &run, attempt).await;
            match policy.decide(attempt, &outcome) {
                RetryDecision::RetryAfter(delay) => {
                    let message = outcome.error_message.as_deref().unwrap_or_default();
                    warn!(
                        job_id = %job.id,
                        run_id = %run.id,
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "attempt failed, retrying: {message}"
                    );
                    if let Err(e) = self.ledger.record_failed_attempt(&run.id, attempt, message) {
                        warn!(run_id = %run.id, "could not record failed attempt: {e}");
                    }
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                RetryDecision::GiveUp => break outcome,
            }
        };

        let completed_at = time::now();
        let completion = completion_for(outcome, started_at, completed_at, attempt);
        self.finish(&job, &run, &completion).await;
    }

    async fn finish(&self, job: &ScheduledJob, run: &JobRun, completion: &RunCompletion) {
        let reschedule = run.trigger_type == TriggerType::Scheduled;
        for n in 1..=FINISH_ATTEMPTS {
            match self
                .ledger
                .finish_run(&job.id, &run.id, completion, reschedule)
            {
                Ok(updated) => {
                    info!(
                        job_id = %job.id,
                        run_id = %run.id,
                        status = %completion.status,
                        attempt = completion.attempt,
                        duration_ms = completion.duration_ms,
                        next_run_at = ?updated.next_run_at,
                        "run finished"
                    );
                    return;
                }
                Err(
                    e @ (SchedulerError::RunFinished { .. }
                    | SchedulerError::RunNotFound { .. }
                    | SchedulerError::JobNotFound { .. }),
                ) => {
                    warn!(job_id = %job.id, run_id = %run.id, "run outcome discarded: {e}");
                    return;
                }
                Err(e) if n < FINISH_ATTEMPTS => {
                    warn!(run_id = %run.id, attempt = n, "persisting run outcome failed: {e}");
                    tokio::time::sleep(FINISH_RETRY_DELAY).await;
                }
                Err(e) => {
                    error!(
                        job_id = %job.id,
                        run_id = %run.id,
                        "giving up on persisting run outcome, claim left for lease recovery: {e}"
                    );
                }
            }
        }
    }
}

fn completion_for(
    outcome: Outcome,
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
    attempt: u32,
) -> RunCompletion {
    RunCompletion {
        status: outcome.status,
        completed_at,
        duration_ms: (completed_at - started_at).num_milliseconds().max(0) as u64,
        output: outcome.output,
        error_message: outcome.error_message,
        attempt,
    }
}

fn log_join(joined: std::result::Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!("run task panicked: {e}");
        } else {
            debug!("run task cancelled: {e}");
        }
    }
}
