use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueDriverKind {
    Memory,
    Redis,
    Postgres,
}

impl QueueDriverKind {
    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "memory" => Ok(QueueDriverKind::Memory),
            "redis" => Ok(QueueDriverKind::Redis),
            "postgres" => Ok(QueueDriverKind::Postgres),
            other => bail!("unknown QUEUE_DRIVER: {other}"),
        }
    }
}

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub queue_driver: QueueDriverKind,
    pub redis_url: Option<String>,
    pub database_url: Option<String>,
    pub port: u16,
    pub step_timeout_ms: u64,
    pub worker_concurrency: usize,
    pub outbox_relay_interval_ms: u64,
    pub outbox_relay_batch: usize,
    pub health_check_enabled: bool,
    pub queue_soft_limit: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_driver: QueueDriverKind::Memory,
            redis_url: None,
            database_url: None,
            port: 3000,
            step_timeout_ms: 30_000,
            worker_concurrency: 8,
            outbox_relay_interval_ms: 1_000,
            outbox_relay_batch: 25,
            health_check_enabled: true,
            queue_soft_limit: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let defaults = Config::default();
        let config = Self {
            queue_driver: match env::var("QUEUE_DRIVER") {
                Ok(raw) => QueueDriverKind::parse(&raw)?,
                Err(_) => defaults.queue_driver,
            },
            redis_url: env::var("REDIS_URL").ok(),
            database_url: env::var("DATABASE_URL").ok(),
            port: parse_or("PORT", defaults.port)?,
            step_timeout_ms: parse_or("STEP_TIMEOUT_MS", defaults.step_timeout_ms)?,
            worker_concurrency: parse_or("WORKER_CONCURRENCY", defaults.worker_concurrency)?,
            outbox_relay_interval_ms: parse_or(
                "OUTBOX_RELAY_INTERVAL_MS",
                defaults.outbox_relay_interval_ms,
            )?,
            outbox_relay_batch: parse_or("OUTBOX_RELAY_BATCH", defaults.outbox_relay_batch)?,
            health_check_enabled: parse_or("HEALTH_CHECK_ENABLED", defaults.health_check_enabled)?,
            queue_soft_limit: match env::var("QUEUE_SOFT_LIMIT") {
                Ok(raw) => Some(
                    raw.parse()
                        .context("QUEUE_SOFT_LIMIT must be a valid number")?,
                ),
                Err(_) => None,
            },
        };

        if config.queue_driver == QueueDriverKind::Redis && config.redis_url.is_none() {
            bail!("QUEUE_DRIVER=redis requires REDIS_URL");
        }
        if config.queue_driver == QueueDriverKind::Postgres && config.database_url.is_none() {
            bail!("QUEUE_DRIVER=postgres requires DATABASE_URL");
        }

        Ok(config)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn outbox_relay_interval(&self) -> Duration {
        Duration::from_millis(self.outbox_relay_interval_ms)
    }
}

fn parse_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .ok()
            .with_context(|| format!("{name} must be a valid value, got {raw:?}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = Config::default();
        assert_eq!(config.queue_driver, QueueDriverKind::Memory);
        assert_eq!(config.step_timeout_ms, 30_000);
        assert_eq!(config.worker_concurrency, 8);
        assert_eq!(config.outbox_relay_interval_ms, 1_000);
        assert_eq!(config.outbox_relay_batch, 25);
        assert!(config.health_check_enabled);
    }

    #[test]
    fn driver_kind_parsing() {
        assert_eq!(
            QueueDriverKind::parse("memory").unwrap(),
            QueueDriverKind::Memory
        );
        assert_eq!(
            QueueDriverKind::parse("redis").unwrap(),
            QueueDriverKind::Redis
        );
        assert_eq!(
            QueueDriverKind::parse("postgres").unwrap(),
            QueueDriverKind::Postgres
        );
        assert!(QueueDriverKind::parse("kafka").is_err());
    }
}
