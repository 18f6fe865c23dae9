use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cadence_core::CadenceConfig;
use cadence_scheduler::{
    HandlerRegistry, JobFilter, JobLedger, JobRun, NewJob, RunFilter, ScheduledJob,
    SchedulerEngine, Trigger,
};
use tokio::sync::watch;
use tracing::{error, info};

use crate::cli::{AddJob, Command, JobsCommand, RunsCommand};
use crate::handlers::register_builtins;

pub async fn dispatch(
    command: Command,
    config: &CadenceConfig,
    ledger: Arc<JobLedger>,
) -> anyhow::Result<()> {
    match command {
        Command::Serve => serve(config, ledger).await,
        Command::Jobs(cmd) => jobs(cmd, config, ledger).await,
        Command::Runs(RunsCommand::List {
            job,
            status,
            limit,
            offset,
        }) => {
            let job_id = match job {
                Some(reference) => Some(ledger.find_job(&reference)?.id),
                None => None,
            };
            let filter = RunFilter {
                job_id,
                status,
                limit,
                offset,
            };
            let total = ledger.count_runs(&filter)?;
            for run in ledger.list_runs(&filter)? {
                print_run_line(&run);
            }
            println!("({total} total)");
            Ok(())
        }
        Command::Prune { keep } => {
            let deleted = ledger.prune_runs(keep)?;
            println!("deleted {deleted} runs");
            Ok(())
        }
    }
}

fn registry() -> Arc<HandlerRegistry> {
    let registry = HandlerRegistry::new();
    register_builtins(&registry);
    Arc::new(registry)
}

async fn serve(config: &CadenceConfig, ledger: Arc<JobLedger>) -> anyhow::Result<()> {
    let engine = SchedulerEngine::new(Arc::clone(&ledger), registry(), config.scheduler.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if let Some(keep) = config.retention.keep_runs_per_job {
        let every = Duration::from_secs(config.retention.sweep_interval_secs.max(1));
        tokio::spawn(retention_sweep(
            Arc::clone(&ledger),
            keep,
            every,
            shutdown_rx.clone(),
        ));
        info!(keep, every_secs = every.as_secs(), "retention sweep enabled");
    }

    let engine_task = tokio::spawn(engine.run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("shutdown signal received");

    let _ = shutdown_tx.send(true);
    engine_task.await?;
    Ok(())
}

async fn retention_sweep(
    ledger: Arc<JobLedger>,
    keep: usize,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = ledger.prune_runs(keep) {
                    error!("retention sweep failed: {e}");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn jobs(
    command: JobsCommand,
    config: &CadenceConfig,
    ledger: Arc<JobLedger>,
) -> anyhow::Result<()> {
    match command {
        JobsCommand::List { category, enabled } => {
            for job in ledger.list_jobs(&JobFilter { category, enabled })? {
                print_job_line(&job);
            }
        }
        JobsCommand::Show { job } => {
            let job = ledger.find_job(&job)?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        JobsCommand::Add(add) => {
            let job = ledger.create_job(new_job(add)?)?;
            println!("created {} ({})", job.slug, job.id);
            print_job_line(&job);
        }
        JobsCommand::Enable { job } => {
            let job = ledger.find_job(&job)?;
            print_job_line(&ledger.set_enabled(&job.id, true)?);
        }
        JobsCommand::Disable { job } => {
            let job = ledger.find_job(&job)?;
            print_job_line(&ledger.set_enabled(&job.id, false)?);
        }
        JobsCommand::Remove { job } => {
            let job = ledger.find_job(&job)?;
            ledger.delete_job(&job.id)?;
            println!("removed {}", job.slug);
        }
        JobsCommand::Run { job, by } => {
            let mut engine =
                SchedulerEngine::new(Arc::clone(&ledger), registry(), config.scheduler.clone());
            let run = engine.trigger_now(&job, by.as_deref())?;
            engine.drain().await;
            let finished = ledger
                .get_run(&run.id)?
                .with_context(|| format!("run {} disappeared", run.id))?;
            println!("{}", serde_json::to_string_pretty(&finished)?);
        }
    }
    Ok(())
}

fn new_job(add: AddJob) -> anyhow::Result<NewJob> {
    let mut job = NewJob::new(add.name, add.slug, add.target);
    job.trigger = match (add.cron, add.every_ms) {
        (Some(expression), _) => Some(Trigger::cron(expression)),
        (None, Some(ms)) => Some(Trigger::every_ms(ms)),
        (None, None) => None,
    };
    if let Some(params) = add.params {
        job.job_params = serde_json::from_str(&params).context("--params is not valid JSON")?;
    }
    if let Some(timezone) = add.timezone {
        job.timezone = timezone;
    }
    if let Some(category) = add.category {
        job.category = category;
    }
    if let Some(timeout_ms) = add.timeout_ms {
        job.timeout_ms = timeout_ms;
    }
    if let Some(attempts) = add.retry_attempts {
        job.retry_attempts = attempts;
    }
    if let Some(delay) = add.retry_delay_ms {
        job.retry_delay_ms = delay;
    }
    job.description = add.description;
    job.enabled = !add.disabled;
    job.created_by = std::env::var("USER").ok();
    Ok(job)
}

fn print_job_line(job: &ScheduledJob) {
    let schedule = match &job.trigger {
        Some(Trigger::Cron { expression }) => format!("cron '{expression}' {}", job.timezone),
        Some(Trigger::Interval { every_ms }) => format!("every {every_ms}ms"),
        None => "manual".to_string(),
    };
    println!(
        "{:<24} {:<8} {:<32} next={:<26} last={:<9} runs={} ok={} failed={}",
        job.slug,
        match (job.enabled, job.is_running()) {
            (_, true) => "running",
            (true, false) => "enabled",
            (false, false) => "disabled",
        },
        schedule,
        fmt_time(job.next_run_at),
        job.last_status.map(|s| s.as_str()).unwrap_or("-"),
        job.run_count,
        job.success_count,
        job.fail_count,
    );
}

fn print_run_line(run: &JobRun) {
    println!(
        "{} {:<9} {:<9} attempt={} started={} duration={} {}",
        run.id,
        run.status.as_str(),
        run.trigger_type.as_str(),
        run.attempt,
        fmt_time(run.started_at),
        run.duration_ms
            .map(|ms| format!("{ms}ms"))
            .unwrap_or_else(|| "-".to_string()),
        run.error_message.as_deref().unwrap_or(""),
    );
}

fn fmt_time(ts: Option<chrono::DateTime<chrono::Utc>>) -> String {
    ts.map(|t| t.format("%Y-%m-%d %H:%M:%S%.3fZ").to_string())
        .unwrap_or_else(|| "-".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use serde_json::json;

    use crate::cli::Cli;

    fn parse_add(args: &[&str]) -> AddJob {
        let mut argv = vec!["cadence", "jobs", "add", "--name", "N", "--slug", "n", "--target", "log"];
        argv.extend_from_slice(args);
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Jobs(JobsCommand::Add(add)) => add,
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn add_flags_map_onto_new_job() {
        let job = new_job(parse_add(&[
            "--cron",
            "0 9 * * MON-FRI",
            "--timezone",
            "America/Sao_Paulo",
            "--params",
            r#"{"channel":"ops"}"#,
            "--disabled",
        ]))
        .unwrap();
        assert_eq!(job.trigger, Some(Trigger::cron("0 9 * * MON-FRI")));
        assert_eq!(job.timezone, "America/Sao_Paulo");
        assert_eq!(job.job_params, json!({"channel": "ops"}));
        assert!(!job.enabled);
    }

    #[test]
    fn bad_params_json_is_rejected() {
        assert!(new_job(parse_add(&["--params", "{not json"])).is_err());
    }

    #[tokio::test]
    async fn jobs_run_executes_in_process() {
        let ledger = Arc::new(JobLedger::open_in_memory().unwrap());
        ledger
            .create_job(NewJob::new("Nap", "nap", "sleep").with_params(json!({"ms": 5})))
            .unwrap();
        jobs(
            JobsCommand::Run {
                job: "nap".into(),
                by: Some("test".into()),
            },
            &CadenceConfig::default(),
            Arc::clone(&ledger),
        )
        .await
        .unwrap();

        let job = ledger.find_job("nap").unwrap();
        assert_eq!(job.run_count, 1);
        assert_eq!(job.success_count, 1);
    }
}
