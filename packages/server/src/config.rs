use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub redis: RedisConfig,
    pub defaults: DefaultsConfig,
    pub migration: MigrationConfig,
    pub auto_stop: AutoStopConfig,
    pub instance_listing: InstanceListingConfig,
    pub novita: NovitaConfig,
    pub webhook: WebhookConfig,
}

/// Redis connection settings. `REDIS_URL` wins over host/port parts.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub connection_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    /// Process-wide prefix applied to every key.
    pub key_prefix: String,
}

/// Cross-cutting defaults for job handling.
#[derive(Debug, Clone)]
pub struct DefaultsConfig {
    /// Delay between MonitorInstance polls, in milliseconds.
    pub poll_interval_ms: u64,
    pub max_retry_attempts: u32,
}

/// Spot-migration sweep settings.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub enabled: bool,
    pub schedule_interval_ms: u64,
    pub job_timeout_ms: u64,
    pub max_concurrent_migrations: usize,
    pub dry_run_mode: bool,
    pub retry_failed_migrations: bool,
}

/// Idle-instance auto-stop settings.
#[derive(Debug, Clone)]
pub struct AutoStopConfig {
    pub inactivity_threshold_minutes: i64,
    pub startup_grace_minutes: i64,
    pub creation_grace_minutes: i64,
    pub dry_run_mode: bool,
}

#[derive(Debug, Clone)]
pub struct InstanceListingConfig {
    /// Fall back to the local instance cache when the provider listing fails.
    pub enable_fallback_to_local: bool,
}

#[derive(Debug, Clone)]
pub struct NovitaConfig {
    pub api_key: String,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub timeout_ms: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            redis: RedisConfig {
                url: env::var("REDIS_URL").unwrap_or_else(|_| redis_url_from_parts()),
                connection_timeout_ms: env_u64("REDIS_CONNECTION_TIMEOUT_MS", 5_000)?,
                command_timeout_ms: env_u64("REDIS_COMMAND_TIMEOUT_MS", 3_000)?,
                retry_attempts: env_u64("REDIS_RETRY_ATTEMPTS", 3)? as u32,
                retry_delay_ms: env_u64("REDIS_RETRY_DELAY_MS", 500)?,
                key_prefix: env::var("REDIS_KEY_PREFIX")
                    .unwrap_or_else(|_| "novita:".to_string()),
            },
            defaults: DefaultsConfig {
                poll_interval_ms: env_u64("POLL_INTERVAL_MS", 5_000)?,
                max_retry_attempts: env_u64("MAX_RETRY_ATTEMPTS", 3)? as u32,
            },
            migration: MigrationConfig {
                enabled: env_bool("MIGRATION_ENABLED", true)?,
                schedule_interval_ms: env_u64("MIGRATION_INTERVAL_MS", 300_000)?,
                job_timeout_ms: env_u64("MIGRATION_JOB_TIMEOUT_MS", 600_000)?,
                max_concurrent_migrations: env_u64("MAX_CONCURRENT_MIGRATIONS", 5)? as usize,
                dry_run_mode: env_bool("MIGRATION_DRY_RUN", false)?,
                retry_failed_migrations: env_bool("RETRY_FAILED_MIGRATIONS", true)?,
            },
            auto_stop: AutoStopConfig {
                inactivity_threshold_minutes: env_u64("AUTO_STOP_INACTIVITY_MINUTES", 10)? as i64,
                startup_grace_minutes: env_u64("AUTO_STOP_STARTUP_GRACE_MINUTES", 45)? as i64,
                creation_grace_minutes: env_u64("AUTO_STOP_CREATION_GRACE_MINUTES", 60)? as i64,
                dry_run_mode: env_bool("AUTO_STOP_DRY_RUN", false)?,
            },
            instance_listing: InstanceListingConfig {
                enable_fallback_to_local: env_bool("INSTANCE_LISTING_FALLBACK_TO_LOCAL", true)?,
            },
            novita: NovitaConfig {
                api_key: env::var("NOVITA_API_KEY").context("NOVITA_API_KEY must be set")?,
                base_url: env::var("NOVITA_BASE_URL").ok(),
            },
            webhook: WebhookConfig {
                timeout_ms: env_u64("WEBHOOK_TIMEOUT_MS", 10_000)?,
            },
        })
    }
}

/// Assemble a Redis URL from individual parts when `REDIS_URL` is not set.
fn redis_url_from_parts() -> String {
    let host = env::var("REDIS_HOST").unwrap_or_else(|_| "localhost".to_string());
    let port = env::var("REDIS_PORT").unwrap_or_else(|_| "6379".to_string());
    let username = env::var("REDIS_USERNAME").unwrap_or_default();
    let password = env::var("REDIS_PASSWORD").ok();

    match password {
        Some(password) => format!("redis://{}:{}@{}:{}", username, password, host, port),
        None => format!("redis://{}:{}", host, port),
    }
}

fn env_u64(name: &str, default: u64) -> Result<u64> {
    match env::var(name) {
        Ok(v) => v
            .parse()
            .with_context(|| format!("{} must be a valid number", name)),
        Err(_) => Ok(default),
    }
}

fn env_bool(name: &str, default: bool) -> Result<bool> {
    match env::var(name) {
        Ok(v) => v
            .parse()
            .with_context(|| format!("{} must be true or false", name)),
        Err(_) => Ok(default),
    }
}
