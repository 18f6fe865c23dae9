use clap::{Args, Parser, Subcommand};

use cadence_scheduler::RunStatus;

/// Durable cron / interval job scheduler backed by SQLite.
#[derive(Parser, Debug)]
#[command(
    name = "cadence",
    version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CADENCE_GIT_SHA"), ")")
)]
pub struct Cli {
    /// Path to cadence.toml (defaults to ~/.cadence/cadence.toml).
    #[arg(long, global = true, env = "CADENCE_CONFIG")]
    pub config: Option<String>,

    /// Override `[database] path` from the config file.
    #[arg(long, global = true)]
    pub database: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the dispatcher until Ctrl-C.
    Serve,

    /// Manage job definitions.
    #[command(subcommand)]
    Jobs(JobsCommand),

    /// Inspect run history.
    #[command(subcommand)]
    Runs(RunsCommand),

    /// Delete old finished runs, keeping the newest N per job.
    Prune {
        #[arg(long)]
        keep: usize,
    },
}

#[derive(Subcommand, Debug)]
pub enum JobsCommand {
    List {
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        enabled: Option<bool>,
    },

    /// Print one job as JSON.
    Show { job: String },

    Add(AddJob),

    Enable { job: String },

    Disable { job: String },

    /// Delete a job together with its run history.
    Remove { job: String },

    /// Run a job now and wait for it to finish.
    Run {
        job: String,
        /// Recorded as `triggered_by` on the run.
        #[arg(long = "by")]
        by: Option<String>,
    },
}

#[derive(Args, Debug)]
pub struct AddJob {
    #[arg(long)]
    pub name: String,

    #[arg(long)]
    pub slug: String,

    /// Registered handler to invoke (`noop`, `log`, `sleep`, ...).
    #[arg(long)]
    pub target: String,

    /// Five-field crontab expression, e.g. "0 9 * * MON-FRI".
    #[arg(long, conflicts_with = "every_ms")]
    pub cron: Option<String>,

    /// Fixed period between the end of one run and the start of the next.
    #[arg(long)]
    pub every_ms: Option<u64>,

    #[arg(long)]
    pub timezone: Option<String>,

    /// JSON object passed to the handler.
    #[arg(long)]
    pub params: Option<String>,

    #[arg(long)]
    pub description: Option<String>,

    #[arg(long)]
    pub category: Option<String>,

    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Total attempts per run (0 behaves like 1).
    #[arg(long)]
    pub retry_attempts: Option<u32>,

    #[arg(long)]
    pub retry_delay_ms: Option<u64>,

    /// Create the job disabled.
    #[arg(long)]
    pub disabled: bool,
}

#[derive(Subcommand, Debug)]
pub enum RunsCommand {
    List {
        /// Job id or slug.
        #[arg(long)]
        job: Option<String>,
        #[arg(long)]
        status: Option<RunStatus>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_job_parses_interval_and_retry() {
        let cli = Cli::try_parse_from([
            "cadence",
            "jobs",
            "add",
            "--name",
            "Sync",
            "--slug",
            "sync",
            "--target",
            "noop",
            "--every-ms",
            "60000",
            "--retry-attempts",
            "2",
        ])
        .unwrap();
        let Command::Jobs(JobsCommand::Add(add)) = cli.command else {
            panic!("expected jobs add");
        };
        assert_eq!(add.every_ms, Some(60_000));
        assert_eq!(add.retry_attempts, Some(2));
        assert!(add.cron.is_none());
        assert!(!add.disabled);
    }

    #[test]
    fn cron_and_interval_conflict() {
        let res = Cli::try_parse_from([
            "cadence", "jobs", "add", "--name", "x", "--slug", "x", "--target", "noop", "--cron",
            "* * * * *", "--every-ms", "1000",
        ]);
        assert!(res.is_err());
    }

    #[test]
    fn runs_list_parses_status() {
        let cli = Cli::try_parse_from(["cadence", "runs", "list", "--status", "timeout"]).unwrap();
        let Command::Runs(RunsCommand::List { status, limit, .. }) = cli.command else {
            panic!("expected runs list");
        };
        assert_eq!(status, Some(RunStatus::Timeout));
        assert_eq!(limit, 50);
    }
}
