use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_TICK_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_MAX_CONCURRENT_RUNS: usize = 16;
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 30_000;
pub const DEFAULT_STALE_RUN_GRACE_MS: u64 = 60_000;
pub const DEFAULT_MAX_ERROR_CHARS: usize = 4_000;
pub const DEFAULT_COMMAND_BUFFER: usize = 64;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 3_600;

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Dispatcher tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How often the dispatcher scans for due jobs.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Upper bound on runs executing at the same time in this process.
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
    /// How long shutdown waits for in-flight runs before aborting them.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Slack added to a run's worst-case duration before its claim is
    /// considered abandoned (crashed process, lost task).
    #[serde(default = "default_stale_run_grace_ms")]
    pub stale_run_grace_ms: u64,
    /// Error messages longer than this are truncated before persistence.
    #[serde(default = "default_max_error_chars")]
    pub max_error_chars: usize,
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,
    /// Written into `job_runs.queue_job_id`. Defaults to `cadence-<pid>`.
    #[serde(default)]
    pub instance_id: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            max_concurrent_runs: DEFAULT_MAX_CONCURRENT_RUNS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
            stale_run_grace_ms: DEFAULT_STALE_RUN_GRACE_MS,
            max_error_chars: DEFAULT_MAX_ERROR_CHARS,
            command_buffer: DEFAULT_COMMAND_BUFFER,
            instance_id: None,
        }
    }
}

impl SchedulerConfig {
    pub fn instance_id(&self) -> String {
        self.instance_id
            .clone()
            .unwrap_or_else(|| format!("cadence-{}", std::process::id()))
    }
}

/// Run-history retention. The sweep is independent of the dispatcher loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Keep this many most-recent finished runs per job. `None` disables the sweep.
    #[serde(default)]
    pub keep_runs_per_job: Option<usize>,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            keep_runs_per_job: None,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
        }
    }
}

fn default_tick_interval_ms() -> u64 {
    DEFAULT_TICK_INTERVAL_MS
}
fn default_max_concurrent_runs() -> usize {
    DEFAULT_MAX_CONCURRENT_RUNS
}
fn default_shutdown_grace_ms() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_MS
}
fn default_stale_run_grace_ms() -> u64 {
    DEFAULT_STALE_RUN_GRACE_MS
}
fn default_max_error_chars() -> usize {
    DEFAULT_MAX_ERROR_CHARS
}
fn default_command_buffer() -> usize {
    DEFAULT_COMMAND_BUFFER
}
fn default_sweep_interval_secs() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.db", home)
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `CADENCE_SCHEDULER__TICK_INTERVAL_MS=500`.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.cadence/cadence.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);
        debug!(%path, "loading configuration");

        Self::figment(&path)
            .extract()
            .map_err(|e| crate::error::CadenceError::Config(e.to_string()))
    }

    fn figment(path: &str) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("CADENCE_").split("__"))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn missing_file_yields_defaults() {
        Jail::expect_with(|_jail| {
            let cfg = CadenceConfig::load(Some("does-not-exist.toml")).expect("load");
            assert_eq!(cfg.scheduler.tick_interval_ms, DEFAULT_TICK_INTERVAL_MS);
            assert_eq!(cfg.scheduler.max_concurrent_runs, DEFAULT_MAX_CONCURRENT_RUNS);
            assert!(cfg.retention.keep_runs_per_job.is_none());
            Ok(())
        });
    }

    #[test]
    fn toml_then_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "cadence.toml",
                r#"
                [database]
                path = "/tmp/jobs.db"

                [scheduler]
                tick_interval_ms = 500
                instance_id = "worker-a"

                [retention]
                keep_runs_per_job = 25
                "#,
            )?;
            jail.set_env("CADENCE_SCHEDULER__MAX_CONCURRENT_RUNS", "3");

            let cfg = CadenceConfig::load(Some("cadence.toml")).expect("load");
            assert_eq!(cfg.database.path, "/tmp/jobs.db");
            assert_eq!(cfg.scheduler.tick_interval_ms, 500);
            assert_eq!(cfg.scheduler.max_concurrent_runs, 3);
            assert_eq!(cfg.scheduler.instance_id(), "worker-a");
            assert_eq!(cfg.retention.keep_runs_per_job, Some(25));
            Ok(())
        });
    }

    #[test]
    fn malformed_value_is_config_error() {
        Jail::expect_with(|jail| {
            jail.create_file("cadence.toml", "[scheduler]\ntick_interval_ms = \"soon\"\n")?;
            let err = CadenceConfig::load(Some("cadence.toml")).unwrap_err();
            assert_eq!(err.code(), "CONFIG_ERROR");
            Ok(())
        });
    }
}
