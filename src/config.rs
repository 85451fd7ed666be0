use crate::retry::RetryPolicy;
use crate::runner::RunnerConfig;
use crate::scheduler::SchedulerConfig;
use std::{env, str::FromStr, time::Duration};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("SOURCE_ADAPTER must be `demo` or `jsonld`, got `{0}`")]
    UnknownSource(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Demo,
    JsonLd,
}

impl FromStr for SourceKind {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "demo" => Ok(SourceKind::Demo),
            "jsonld" | "json-ld" => Ok(SourceKind::JsonLd),
            other => Err(ConfigError::UnknownSource(other.to_string())),
        }
    }
}

/// Engine settings resolved from the process environment (after `.env`).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub port: u16,
    pub redis_url: Option<String>,
    pub store_namespace: String,
    pub instance_id: String,
    pub max_concurrency: usize,
    pub stage_max_attempts: u32,
    pub stage_backoff_base: Duration,
    pub stage_backoff_max: Duration,
    pub stage_timeout: Duration,
    pub max_variations: usize,
    pub checkpoint_retention: Duration,
    pub purge_interval: Duration,
    pub store_retry_attempts: u32,
    pub source: SourceKind,
    pub jsonld_assumed_stock: u32,
    pub event_buffer: usize,
    pub request_max_bytes: usize,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self::from_lookup(|key| env::var(key).ok())?;
        info!(
            target = "crosslist.config",
            instance_id = %config.instance_id,
            redis = config.redis_url.is_some(),
            source = ?config.source,
            max_concurrency = config.max_concurrency,
            "engine configuration loaded"
        );
        Ok(config)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let number = |key: &str, default: u64| {
            text(key)
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(default)
        };
        let positive = |key: &str, default: u64| {
            text(key)
                .and_then(|value| value.parse::<u64>().ok())
                .filter(|value| *value > 0)
                .unwrap_or(default)
        };

        let source = match text("SOURCE_ADAPTER") {
            Some(raw) => raw.parse()?,
            None => SourceKind::Demo,
        };

        Ok(Self {
            port: text("PORT")
                .and_then(|value| value.parse().ok())
                .unwrap_or(8000),
            redis_url: text("REDIS_URL"),
            store_namespace: text("STORE_NAMESPACE").unwrap_or_else(|| "crosslist:".to_string()),
            instance_id: text("ENGINE_INSTANCE_ID")
                .unwrap_or_else(|| format!("engine-{}", Uuid::new_v4().simple())),
            max_concurrency: positive("MAX_CONCURRENCY", 8) as usize,
            stage_max_attempts: positive("STAGE_MAX_ATTEMPTS", 3).min(u32::MAX as u64) as u32,
            stage_backoff_base: Duration::from_millis(number("STAGE_BACKOFF_BASE_MS", 500)),
            stage_backoff_max: Duration::from_millis(number("STAGE_BACKOFF_MAX_MS", 30_000)),
            stage_timeout: Duration::from_secs(positive("STAGE_TIMEOUT_SECS", 120)),
            max_variations: positive("MAX_VARIATIONS", 250) as usize,
            checkpoint_retention: Duration::from_secs(positive(
                "CHECKPOINT_RETENTION_SECS",
                7 * 24 * 3600,
            )),
            purge_interval: Duration::from_secs(positive("PURGE_INTERVAL_SECS", 3600)),
            store_retry_attempts: positive("STORE_RETRY_ATTEMPTS", 5).min(u32::MAX as u64) as u32,
            source,
            jsonld_assumed_stock: number("JSONLD_ASSUMED_STOCK", 1).min(u32::MAX as u64) as u32,
            event_buffer: positive("EVENT_BUFFER", 256) as usize,
            request_max_bytes: positive("REQUEST_MAX_BYTES", 256 * 1024) as usize,
        })
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            retry: RetryPolicy::new(
                self.stage_max_attempts,
                self.stage_backoff_base,
                self.stage_backoff_max,
            ),
            stage_timeout: self.stage_timeout,
            max_variations: self.max_variations,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            instance_id: self.instance_id.clone(),
            max_concurrency: self.max_concurrency,
            checkpoint_retention: chrono::Duration::from_std(self.checkpoint_retention)
                .unwrap_or_else(|_| chrono::Duration::days(7)),
            purge_interval: self.purge_interval,
            store_retry: RetryPolicy::new(
                self.store_retry_attempts,
                Duration::from_millis(250),
                self.stage_backoff_max,
            ),
        }
    }
}
