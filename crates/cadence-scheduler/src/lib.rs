//! `cadence-scheduler`: durable job scheduler with SQLite persistence.
//!
//! # Overview
//!
//! Job definitions and their run history live in two SQLite tables
//! (`scheduled_jobs`, `job_runs`). The [`engine::SchedulerEngine`] ticks on a
//! fixed interval, claims every enabled job whose `next_run_at` has passed and
//! runs it on its own Tokio task through the [`registry::HandlerRegistry`].
//! When a run finishes, its outcome is rolled up onto the job and the next
//! fire time is computed from the completion instant.
//!
//! # Modules
//!
//! | Module     | Responsibility                                            |
//! |------------|-----------------------------------------------------------|
//! | `trigger`  | Cron / interval next-fire computation, timezone aware     |
//! | `ledger`   | Jobs, runs, claims and rollups (`BEGIN IMMEDIATE` writes) |
//! | `retry`    | Constant-delay retry decisions                            |
//! | `runner`   | One attempt under a deadline, panics captured             |
//! | `engine`   | Tick loop, worker pool, manual triggers, shutdown         |
//!
//! Several processes may share one database file: the claim is a
//! compare-and-set on `scheduled_jobs.running_run_id`, so a due job is
//! dispatched once no matter how many engines are polling.

pub mod db;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod registry;
pub mod retry;
pub mod runner;
pub mod time;
pub mod trigger;
pub mod truncate;
pub mod types;

pub use engine::{SchedulerCommand, SchedulerEngine, SchedulerHandle};
pub use error::{Result, SchedulerError};
pub use ledger::JobLedger;
pub use registry::{HandlerRegistry, JobContext, JobHandler};
pub use trigger::TriggerCalculator;
pub use types::{
    JobFilter, JobPatch, JobRun, NewJob, RunFilter, RunStatus, ScheduledJob, Trigger, TriggerType,
};
