use std::env;
use std::time::Duration;

use fanout_application::{LockOptions, TokenBatchOptions};
use fanout_core::{AppError, AppResult};
use tracing_subscriber::EnvFilter;

/// What the process was started to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerCommand {
    /// Poll announced token batch jobs and deliver their assignments.
    Consume,
    /// Publish one campaign message as a token batch job, then exit.
    Enqueue {
        campaign: String,
        title: String,
        body: String,
    },
}

impl WorkerCommand {
    pub fn from_args(args: &[String]) -> AppResult<Self> {
        match args.first().map(String::as_str) {
            None | Some("consume") => Ok(Self::Consume),
            Some("enqueue") => {
                let [campaign, title, body] = &args[1..] else {
                    return Err(AppError::Validation(
                        "usage: fanout-worker enqueue <campaign> <title> <body>".to_owned(),
                    ));
                };
                Ok(Self::Enqueue {
                    campaign: campaign.clone(),
                    title: title.clone(),
                    body: body.clone(),
                })
            }
            Some(other) => Err(AppError::Validation(format!(
                "unknown command '{other}', expected 'consume' or 'enqueue'"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub command: WorkerCommand,
    pub redis_url: String,
    pub work_distributor_key_prefix: String,
    pub distributed_lock_key_prefix: String,
    pub distribution_size: u64,
    pub lock_ttl_ms: u64,
    pub lock_max_wait_ms: u64,
    pub lock_retry_min_ms: u64,
    pub lock_retry_max_ms: u64,
    pub assignment_poll_interval_ms: u64,
    pub assignment_reclaim_after_seconds: u64,
    pub worker_id: String,
    pub worker_concurrency: usize,
    pub token_batch_job_registry_key: String,
    pub job_poll_interval_ms: u64,
    pub user_service_base_url: String,
}

impl WorkerConfig {
    pub fn load() -> AppResult<Self> {
        let args: Vec<String> = env::args().skip(1).collect();
        let command = WorkerCommand::from_args(&args)?;

        let config = Self {
            command,
            redis_url: required_env("REDIS_URL")?,
            work_distributor_key_prefix: env_or("WORK_DISTRIBUTOR_KEY_PREFIX", "work_distributor"),
            distributed_lock_key_prefix: env_or("DISTRIBUTED_LOCK_KEY_PREFIX", "distributed_lock"),
            distribution_size: parse_env_u64("DISTRIBUTION_SIZE", 100)?,
            lock_ttl_ms: parse_env_u64("LOCK_TTL_MS", 10_000)?,
            lock_max_wait_ms: parse_env_u64("LOCK_MAX_WAIT_MS", 3_000)?,
            lock_retry_min_ms: parse_env_u64("LOCK_RETRY_MIN_MS", 2)?,
            lock_retry_max_ms: parse_env_u64("LOCK_RETRY_MAX_MS", 20)?,
            assignment_poll_interval_ms: parse_env_u64("ASSIGNMENT_POLL_INTERVAL_MS", 10)?,
            assignment_reclaim_after_seconds: parse_env_u64(
                "ASSIGNMENT_RECLAIM_AFTER_SECONDS",
                300,
            )?,
            worker_id: env::var("WORKER_ID")
                .ok()
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| format!("worker-{}", std::process::id())),
            worker_concurrency: parse_env_usize("WORKER_CONCURRENCY", 4)?,
            token_batch_job_registry_key: env_or(
                "TOKEN_BATCH_JOB_REGISTRY_KEY",
                "noti_builder:token_batch_jobs",
            ),
            job_poll_interval_ms: parse_env_u64("JOB_POLL_INTERVAL_MS", 1_000)?,
            user_service_base_url: required_env("USER_SERVICE_BASE_URL")?,
        };
        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> AppResult<()> {
        for (name, value) in [
            ("DISTRIBUTION_SIZE", self.distribution_size),
            ("LOCK_TTL_MS", self.lock_ttl_ms),
            ("LOCK_MAX_WAIT_MS", self.lock_max_wait_ms),
            ("ASSIGNMENT_POLL_INTERVAL_MS", self.assignment_poll_interval_ms),
            ("JOB_POLL_INTERVAL_MS", self.job_poll_interval_ms),
            (
                "ASSIGNMENT_RECLAIM_AFTER_SECONDS",
                self.assignment_reclaim_after_seconds,
            ),
        ] {
            if value == 0 {
                return Err(AppError::Validation(format!(
                    "{name} must be greater than zero"
                )));
            }
        }

        if self.worker_concurrency == 0 {
            return Err(AppError::Validation(
                "WORKER_CONCURRENCY must be greater than zero".to_owned(),
            ));
        }

        self.lock_options().validate()
    }

    pub fn lock_options(&self) -> LockOptions {
        LockOptions {
            ttl: Duration::from_millis(self.lock_ttl_ms),
            max_wait: Duration::from_millis(self.lock_max_wait_ms),
            retry_wait_min: Duration::from_millis(self.lock_retry_min_ms),
            retry_wait_max: Duration::from_millis(self.lock_retry_max_ms),
        }
    }

    pub fn token_batch_options(&self) -> TokenBatchOptions {
        TokenBatchOptions {
            poll_interval: Duration::from_millis(self.assignment_poll_interval_ms),
            ..TokenBatchOptions::default()
        }
    }

    pub fn reclaim_after(&self) -> Duration {
        Duration::from_secs(self.assignment_reclaim_after_seconds)
    }

    pub fn job_poll_interval(&self) -> Duration {
        Duration::from_millis(self.job_poll_interval_ms)
    }
}

pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

fn required_env(name: &str) -> AppResult<String> {
    env::var(name).map_err(|_| AppError::Validation(format!("{name} is required")))
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_owned())
}

fn parse_env_usize(name: &str, default: usize) -> AppResult<usize> {
    match env::var(name) {
        Ok(value) => value.parse::<usize>().map_err(|error| {
            AppError::Validation(format!("invalid {name} value '{value}': {error}"))
        }),
        Err(_) => Ok(default),
    }
}

fn parse_env_u64(name: &str, default: u64) -> AppResult<u64> {
    match env::var(name) {
        Ok(value) => value.parse::<u64>().map_err(|error| {
            AppError::Validation(format!("invalid {name} value '{value}': {error}"))
        }),
        Err(_) => Ok(default),
    }
}
