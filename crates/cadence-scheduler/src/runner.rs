//! Execution runner: one attempt of one job, under a deadline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::registry::{HandlerRegistry, JobContext};
use crate::truncate::truncate_error;
use crate::types::{JobRun, RunStatus, ScheduledJob};

/// Result of a single attempt. Never an `Err`: every failure mode is data.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub status: RunStatus,
    pub output: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub duration_ms: u64,
    /// False for configuration errors, which must not be retried.
    pub retryable: bool,
}

impl Outcome {
    pub fn completed(output: serde_json::Value, duration_ms: u64) -> Self {
        Self {
            status: RunStatus::Completed,
            output: (!output.is_null()).then_some(output),
            error_message: None,
            duration_ms,
            retryable: false,
        }
    }

    pub fn failed(message: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            status: RunStatus::Failed,
            output: None,
            error_message: Some(message.into()),
            duration_ms,
            retryable: true,
        }
    }

    pub fn timed_out(timeout_ms: u64, duration_ms: u64) -> Self {
        Self {
            status: RunStatus::Timeout,
            output: None,
            error_message: Some(format!("timed out after {timeout_ms}ms")),
            duration_ms,
            retryable: true,
        }
    }

    /// A failure caused by job configuration rather than by the handler.
    pub fn misconfigured(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            ..Self::failed(message, 0)
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

/// Invokes handlers from the registry. Holds no per-run state.
#[derive(Debug, Clone)]
pub struct ExecutionRunner {
    registry: Arc<HandlerRegistry>,
    max_error_chars: usize,
}

impl ExecutionRunner {
    pub fn new(registry: Arc<HandlerRegistry>, max_error_chars: usize) -> Self {
        Self {
            registry,
            max_error_chars,
        }
    }

    /// Run attempt number `attempt` of `run`.
    ///
    /// The handler executes on its own task so a timeout can abort it and a
    /// panic surfaces as a failed outcome instead of unwinding the caller.
    pub async fn execute(&self, job: &ScheduledJob, run: &JobRun, attempt: u32) -> Outcome {
        let Some(handler) = self.registry.get(&job.job_target) else {
            warn!(job_id = %job.id, target = %job.job_target, "job target not registered");
            return Outcome::misconfigured(format!("job target not found: {}", job.job_target));
        };

        let cancel = CancellationToken::new();
        let ctx = JobContext {
            job_id: job.id.clone(),
            slug: job.slug.clone(),
            run_id: run.id.clone(),
            attempt,
            trigger_type: run.trigger_type,
            params: job.job_params.clone(),
            cancel: cancel.clone(),
        };

        let started = Instant::now();
        let mut task = tokio::spawn(async move { handler.run(ctx).await });
        let deadline = Duration::from_millis(job.timeout_ms);

        let outcome = match tokio::time::timeout(deadline, &mut task).await {
            Ok(Ok(Ok(output))) => Outcome::completed(output, elapsed_ms(started)),
            Ok(Ok(Err(e))) => Outcome::failed(
                truncate_error(&format!("{e:#}"), self.max_error_chars),
                elapsed_ms(started),
            ),
            Ok(Err(join_err)) => Outcome::failed(
                truncate_error(
                    &format!("handler panicked: {join_err}"),
                    self.max_error_chars,
                ),
                elapsed_ms(started),
            ),
            Err(_) => {
                cancel.cancel();
                task.abort();
                Outcome::timed_out(job.timeout_ms, elapsed_ms(started))
            }
        };

        debug!(
            job_id = %job.id,
            run_id = %run.id,
            attempt,
            status = %outcome.status,
            duration_ms = outcome.duration_ms,
            "attempt finished"
        );
        outcome
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TriggerType;
    use chrono::Utc;
    use serde_json::json;

    fn job(target: &str, timeout_ms: u64) -> ScheduledJob {
        let now = Utc::now();
        ScheduledJob {
            id: "job-1".into(),
            name: "Test".into(),
            slug: "test".into(),
            description: None,
            category: "general".into(),
            job_target: target.into(),
            job_params: json!({"greeting": "hi"}),
            trigger: None,
            timezone: "UTC".into(),
            enabled: true,
            timeout_ms,
            retry_attempts: 1,
            retry_delay_ms: 0,
            next_run_at: None,
            running_run_id: None,
            claimed_at: None,
            last_run_id: None,
            last_run_at: None,
            last_status: None,
            last_duration_ms: None,
            last_error: None,
            run_count: 0,
            success_count: 0,
            fail_count: 0,
            created_at: now,
            updated_at: now,
            created_by: None,
        }
    }

    fn run() -> JobRun {
        JobRun {
            id: "run-1".into(),
            job_id: "job-1".into(),
            queue_job_id: None,
            status: RunStatus::Running,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            trigger_type: TriggerType::Scheduled,
            triggered_by: None,
            output: None,
            error_message: None,
            attempt: 1,
            created_at: Utc::now(),
        }
    }

    fn runner(registry: HandlerRegistry) -> ExecutionRunner {
        ExecutionRunner::new(Arc::new(registry), 64)
    }

    #[tokio::test]
    async fn missing_target_is_not_retryable() {
        let outcome = runner(HandlerRegistry::new())
            .execute(&job("ghost", 1_000), &run(), 1)
            .await;
        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(!outcome.retryable);
        assert_eq!(
            outcome.error_message.as_deref(),
            Some("job target not found: ghost")
        );
    }

    #[tokio::test]
    async fn params_reach_handler_and_output_is_kept() {
        let registry = HandlerRegistry::new();
        registry.register_fn("echo", |ctx: JobContext| async move {
            Ok::<_, anyhow::Error>(json!({"got": ctx.params, "attempt": ctx.attempt}))
        });
        let outcome = runner(registry).execute(&job("echo", 1_000), &run(), 2).await;
        assert!(outcome.is_success());
        assert_eq!(
            outcome.output,
            Some(json!({"got": {"greeting": "hi"}, "attempt": 2}))
        );
    }

    #[tokio::test]
    async fn null_output_is_not_stored() {
        let registry = HandlerRegistry::new();
        registry.register_fn("noop", |_| async { Ok::<_, anyhow::Error>(serde_json::Value::Null) });
        let outcome = runner(registry).execute(&job("noop", 1_000), &run(), 1).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.output, None);
    }

    #[tokio::test]
    async fn handler_error_is_truncated() {
        let registry = HandlerRegistry::new();
        registry.register_fn("boom", |_| async {
            Err::<serde_json::Value, _>(anyhow::anyhow!("{}", "x".repeat(1_000)))
        });
        let outcome = runner(registry).execute(&job("boom", 1_000), &run(), 1).await;
        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(outcome.retryable);
        let msg = outcome.error_message.unwrap();
        assert!(msg.chars().count() <= 64);
        assert!(msg.contains("chars omitted"));
    }

    #[tokio::test]
    async fn deadline_cancels_handler() {
        let registry = HandlerRegistry::new();
        registry.register_fn("slow", |ctx: JobContext| async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(30)) => {}
                _ = ctx.cancel.cancelled() => {}
            }
            Ok::<_, anyhow::Error>(serde_json::Value::Null)
        });
        let outcome = runner(registry).execute(&job("slow", 50), &run(), 1).await;
        assert_eq!(outcome.status, RunStatus::Timeout);
        assert!(outcome.retryable);
        assert_eq!(outcome.error_message.as_deref(), Some("timed out after 50ms"));
        assert!(outcome.duration_ms < 5_000);
    }

    #[tokio::test]
    async fn panic_becomes_failure() {
        let registry = HandlerRegistry::new();
        registry.register_fn("panics", |_| async {
            if true {
                panic!("handler bug");
            }
            Ok::<_, anyhow::Error>(serde_json::Value::Null)
        });
        let outcome = runner(registry).execute(&job("panics", 1_000), &run(), 1).await;
        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(outcome.error_message.unwrap().starts_with("handler panicked"));
    }
}
