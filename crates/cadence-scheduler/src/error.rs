use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
///
/// Failures of a job's own handler are never surfaced through this type:
/// they are captured on the `JobRun` row instead.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A JSON column (job params, run output) could not be encoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The cron expression or interval is malformed.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// The timezone is not a known IANA zone name.
    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    /// Some other job field is unusable (empty slug, zero timeout, ...).
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// No job with the given id or slug exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    #[error("Run not found: {id}")]
    RunNotFound { id: String },

    #[error("Job slug already in use: {slug}")]
    DuplicateSlug { slug: String },

    /// The job already has a run in flight, so it cannot be claimed again.
    #[error("Job already running: {id}")]
    AlreadyRunning { id: String },

    /// The run already reached a terminal status and is read-only.
    #[error("Run already finished: {id}")]
    RunFinished { id: String },

    /// The requested status change is not allowed (e.g. finishing with `running`).
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// A stored row could not be decoded.
    #[error("Corrupt row: {0}")]
    CorruptRow(String),

    /// The dispatcher loop is gone; commands can no longer be delivered.
    #[error("Scheduler engine stopped")]
    EngineStopped,
}

impl SchedulerError {
    /// Configuration errors are operator mistakes: never retried, reported as-is.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            SchedulerError::InvalidSchedule(_)
                | SchedulerError::InvalidTimezone(_)
                | SchedulerError::InvalidJob(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
