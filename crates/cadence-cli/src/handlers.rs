//! Generic handlers every `cadence` process registers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use cadence_scheduler::{HandlerRegistry, JobContext, JobHandler};
use serde_json::{json, Value};
use tracing::info;

pub fn register_builtins(registry: &HandlerRegistry) {
    registry.register_fn("noop", |_| async { Ok::<_, anyhow::Error>(Value::Null) });
    registry.register("log", Arc::new(LogHandler));
    registry.register("sleep", Arc::new(SleepHandler));
}

/// Logs the job's params at info level.
struct LogHandler;

#[async_trait]
impl JobHandler for LogHandler {
    async fn run(&self, ctx: JobContext) -> anyhow::Result<Value> {
        info!(
            job_id = %ctx.job_id,
            slug = %ctx.slug,
            run_id = %ctx.run_id,
            attempt = ctx.attempt,
            trigger = %ctx.trigger_type,
            params = %ctx.params,
            "job fired"
        );
        Ok(Value::Null)
    }
}

/// Sleeps for `params.ms` milliseconds, stopping early on cancellation.
struct SleepHandler;

#[async_trait]
impl JobHandler for SleepHandler {
    async fn run(&self, ctx: JobContext) -> anyhow::Result<Value> {
        let ms = ctx
            .params
            .get("ms")
            .and_then(Value::as_u64)
            .context("sleep requires an integer params.ms")?;
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(json!({ "slept_ms": ms })),
            _ = ctx.cancel.cancelled() => anyhow::bail!("sleep cancelled after deadline"),
        }
    }
}
