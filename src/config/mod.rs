//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. The database URL is wrapped in `secrecy::SecretString` so it
//! never ends up in logs.

use std::time::Duration;

use secrecy::SecretString;

use crate::engine::{EngineConfig, ExecutorConfig, WorkerConfig};
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::telemetry::TelemetryConfig;

pub const DEFAULT_QUEUE: &str = "projects";

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    /// pgmq queue name.
    pub queue: String,
    pub workers: usize,
    pub visibility_timeout: Duration,
    pub receive_timeout: Duration,
    pub heartbeat: bool,
    /// Hard limit on one handler run; `None` when set to 0.
    pub task_time_limit: Option<Duration>,
    /// Attempts for broker operations before giving up.
    pub broker_max_retries: u32,
    /// Ping the broker before accepting a submission.
    pub preflight: bool,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup` instead of the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let database_url = var("DATABASE_URL").ok_or_else(|| {
            Error::Config("required environment variable DATABASE_URL is not set".to_string())
        })?;

        let workers: usize = parse_or(&var, "PROJECTQ_WORKERS", 4)?;
        if workers == 0 {
            return Err(Error::Config("PROJECTQ_WORKERS must be at least 1".to_string()));
        }
        let visibility_secs: u64 = parse_or(&var, "PROJECTQ_VISIBILITY_TIMEOUT_SECS", 900)?;
        if visibility_secs == 0 {
            return Err(Error::Config(
                "PROJECTQ_VISIBILITY_TIMEOUT_SECS must be at least 1".to_string(),
            ));
        }
        let broker_max_retries: u32 = parse_or(&var, "PROJECTQ_BROKER_MAX_RETRIES", 10)?;
        let time_limit_secs: u64 = parse_or(&var, "PROJECTQ_TASK_TIME_LIMIT_SECS", 900)?;

        Ok(Self {
            database_url: SecretString::from(database_url),
            queue: var("PROJECTQ_QUEUE").unwrap_or_else(|| DEFAULT_QUEUE.to_string()),
            workers,
            visibility_timeout: Duration::from_secs(visibility_secs),
            receive_timeout: Duration::from_secs(parse_or(
                &var,
                "PROJECTQ_RECEIVE_TIMEOUT_SECS",
                5,
            )?),
            heartbeat: parse_bool_or(&var, "PROJECTQ_HEARTBEAT", true)?,
            task_time_limit: (time_limit_secs > 0).then(|| Duration::from_secs(time_limit_secs)),
            broker_max_retries: broker_max_retries.max(1),
            preflight: parse_bool_or(&var, "PROJECTQ_PREFLIGHT", true)?,
            otel_endpoint: var("OTEL_ENDPOINT"),
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }

    pub fn broker_retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.broker_max_retries,
            ..RetryPolicy::default()
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            visibility_timeout: self.visibility_timeout,
            heartbeat: self.heartbeat,
            time_limit: self.task_time_limit,
            ..ExecutorConfig::default()
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            workers: self.workers,
            receive_timeout: self.receive_timeout,
            ..WorkerConfig::default()
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            preflight: self.preflight,
            ..EngineConfig::default()
        }
    }

    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            endpoint: self.otel_endpoint.clone(),
            default_level: self.log_level.clone(),
            ..TelemetryConfig::default()
        }
    }
}

fn parse_or<T>(var: impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match var(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{name}={raw:?} is invalid: {e}"))),
    }
}

fn parse_bool_or(var: impl Fn(&str) -> Option<String>, name: &str, default: bool) -> Result<bool> {
    match var(name) {
        None => Ok(default),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(Error::Config(format!("{name}={raw:?} is not a boolean"))),
        },
    }
}
