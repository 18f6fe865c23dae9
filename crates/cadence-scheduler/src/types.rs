use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};

pub const DEFAULT_TIMEZONE: &str = "UTC";
pub const DEFAULT_CATEGORY: &str = "general";
pub const DEFAULT_TIMEOUT_MS: u64 = 300_000;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 5_000;

/// Defines when a job should run. A job without a trigger only runs manually.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// Cron expression evaluated in the job's timezone.
    Cron { expression: String },

    /// Fixed period measured from the previous completion.
    Interval { every_ms: u64 },
}

impl Trigger {
    pub fn cron(expression: impl Into<String>) -> Self {
        Trigger::Cron {
            expression: expression.into(),
        }
    }

    pub fn every_ms(every_ms: u64) -> Self {
        Trigger::Interval { every_ms }
    }

    pub fn cron_expression(&self) -> Option<&str> {
        match self {
            Trigger::Cron { expression } => Some(expression),
            Trigger::Interval { .. } => None,
        }
    }

    pub fn repeat_every_ms(&self) -> Option<u64> {
        match self {
            Trigger::Interval { every_ms } => Some(*every_ms),
            Trigger::Cron { .. } => None,
        }
    }

    /// Rebuild a trigger from the two nullable storage columns.
    pub fn from_columns(cron: Option<String>, every_ms: Option<u64>) -> Result<Option<Self>> {
        match (cron, every_ms) {
            (None, None) => Ok(None),
            (Some(expression), None) => Ok(Some(Trigger::Cron { expression })),
            (None, Some(every_ms)) => Ok(Some(Trigger::Interval { every_ms })),
            (Some(_), Some(_)) => Err(SchedulerError::InvalidSchedule(
                "cron_expression and repeat_every_ms are mutually exclusive".to_string(),
            )),
        }
    }
}

/// Lifecycle state of a single `JobRun`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Claimed, waiting for a worker.
    Pending,
    /// An attempt is executing (or waiting out a retry delay).
    Running,
    Completed,
    Failed,
    /// The last attempt exceeded the job's deadline.
    Timeout,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Timeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "timeout" => Ok(RunStatus::Timeout),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// Who started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// Picked up by the dispatcher because `next_run_at` passed.
    Scheduled,
    /// Requested by an operator ("run now").
    Manual,
}

impl TriggerType {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerType::Scheduled => "scheduled",
            TriggerType::Manual => "manual",
        }
    }
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TriggerType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(TriggerType::Scheduled),
            "manual" => Ok(TriggerType::Manual),
            other => Err(format!("unknown trigger type: {other}")),
        }
    }
}

/// A persisted job definition plus its engine-maintained rollup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    /// UUIDv7 string, primary key.
    pub id: String,
    pub name: String,
    /// Human-readable unique key.
    pub slug: String,
    pub description: Option<String>,
    pub category: String,
    /// Handler identifier looked up in the `HandlerRegistry`.
    pub job_target: String,
    /// Opaque parameters forwarded to the handler.
    pub job_params: serde_json::Value,
    pub trigger: Option<Trigger>,
    /// IANA zone used to evaluate cron expressions.
    pub timezone: String,
    pub enabled: bool,
    pub timeout_ms: u64,
    /// Total attempts per logical run (a value of 0 still runs once).
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,

    pub next_run_at: Option<DateTime<Utc>>,
    /// Claim marker: the run currently in flight, if any.
    pub running_run_id: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub last_run_id: Option<String>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_status: Option<RunStatus>,
    pub last_duration_ms: Option<u64>,
    pub last_error: Option<String>,
    pub run_count: u64,
    pub success_count: u64,
    pub fail_count: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: Option<String>,
}

impl ScheduledJob {
    /// Attempts a single logical run may consume before giving up.
    pub fn max_attempts(&self) -> u32 {
        self.retry_attempts.max(1)
    }

    pub fn is_running(&self) -> bool {
        self.running_run_id.is_some()
    }
}

/// One logical execution of a job. Retries bump `attempt` on the same row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub id: String,
    pub job_id: String,
    /// Identifier assigned by the dispatching worker; `None` until dispatched.
    pub queue_job_id: Option<String>,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub trigger_type: TriggerType,
    pub triggered_by: Option<String>,
    pub output: Option<serde_json::Value>,
    pub error_message: Option<String>,
    /// 1-based attempt counter.
    pub attempt: u32,
    /// When the run was claimed.
    pub created_at: DateTime<Utc>,
}

/// Input for `JobLedger::create_job`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub category: String,
    pub job_target: String,
    pub job_params: serde_json::Value,
    pub trigger: Option<Trigger>,
    pub timezone: String,
    pub enabled: bool,
    pub timeout_ms: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub created_by: Option<String>,
}

impl NewJob {
    pub fn new(
        name: impl Into<String>,
        slug: impl Into<String>,
        job_target: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            slug: slug.into(),
            description: None,
            category: DEFAULT_CATEGORY.to_string(),
            job_target: job_target.into(),
            job_params: serde_json::Value::Object(Default::default()),
            trigger: None,
            timezone: DEFAULT_TIMEZONE.to_string(),
            enabled: true,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            created_by: None,
        }
    }

    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn with_cron(self, expression: impl Into<String>) -> Self {
        self.with_trigger(Trigger::cron(expression))
    }

    pub fn with_interval_ms(self, every_ms: u64) -> Self {
        self.with_trigger(Trigger::every_ms(every_ms))
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.job_params = params;
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_retry(mut self, attempts: u32, delay_ms: u64) -> Self {
        self.retry_attempts = attempts;
        self.retry_delay_ms = delay_ms;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Partial update of a job's definition. `None` leaves a field untouched;
/// `trigger: Some(None)` removes the trigger (manual-only job).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobPatch {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub category: Option<String>,
    pub job_target: Option<String>,
    pub job_params: Option<serde_json::Value>,
    pub trigger: Option<Option<Trigger>>,
    pub timezone: Option<String>,
    pub enabled: Option<bool>,
    pub timeout_ms: Option<u64>,
    pub retry_attempts: Option<u32>,
    pub retry_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    pub category: Option<String>,
    pub enabled: Option<bool>,
}

/// Filter and page for run history, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFilter {
    pub job_id: Option<String>,
    pub status: Option<RunStatus>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for RunFilter {
    fn default() -> Self {
        Self {
            job_id: None,
            status: None,
            limit: 50,
            offset: 0,
        }
    }
}

/// The single terminal transition of a `JobRun`.
#[derive(Debug, Clone)]
pub struct RunCompletion {
    pub status: RunStatus,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub output: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub attempt: u32,
}

/// Non-terminal fields of a run that may change while it is in flight.
#[derive(Debug, Clone, Default)]
pub struct RunUpdate {
    pub status: Option<RunStatus>,
    pub queue_job_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub attempt: Option<u32>,
    pub error_message: Option<String>,
}

/// Rollup written onto the owning job when a run completes.
#[derive(Debug, Clone)]
pub struct LastRun {
    pub run_id: String,
    pub run_at: DateTime<Utc>,
    pub status: RunStatus,
    pub duration_ms: u64,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_round_trips_through_text() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Timeout,
        ] {
            assert_eq!(status.to_string().parse::<RunStatus>().unwrap(), status);
        }
        assert!("missed".parse::<RunStatus>().is_err());
    }

    #[test]
    fn only_finished_statuses_are_terminal() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Timeout.is_terminal());
    }

    #[test]
    fn trigger_columns_are_mutually_exclusive() {
        assert_eq!(Trigger::from_columns(None, None).unwrap(), None);
        assert_eq!(
            Trigger::from_columns(None, Some(60_000)).unwrap(),
            Some(Trigger::every_ms(60_000))
        );
        let err = Trigger::from_columns(Some("* * * * *".into()), Some(1)).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn trigger_serializes_tagged() {
        let json = serde_json::to_string(&Trigger::cron("0 9 * * *")).unwrap();
        assert_eq!(json, r#"{"kind":"cron","expression":"0 9 * * *"}"#);
    }
}
