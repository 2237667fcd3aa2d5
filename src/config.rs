use std::time::Duration;

use anyhow::{Context, Result};

/// Runtime settings, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_path: String,
    pub bind_addr: String,
    pub admin_token: String,
    pub limits: LimitSettings,
    pub sweep_interval: Duration,
    pub notify_queue_depth: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct LimitSettings {
    /// Burst window on/off switch; the daily cap always applies.
    pub enable_burst: bool,
    pub max_files: u32,
    pub burst_timeout: Duration,
    pub daily_cap: u32,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let admin_token = dotenvy::var("ADMIN_TOKEN").context("ADMIN_TOKEN must be set")?;

        Ok(Self {
            database_path: dotenvy::var("DATABASE_PATH").unwrap_or_else(|_| "linkgate-db".into()),
            bind_addr: dotenvy::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into()),
            admin_token,
            limits: LimitSettings {
                enable_burst: env_parse("ENABLE_LIMIT", true)?,
                max_files: env_parse("MAX_FILES", 5)?,
                burst_timeout: Duration::from_secs(env_parse("RATE_LIMIT_TIMEOUT", 60)?),
                daily_cap: env_parse("DAILY_LIMIT", 10)?,
            },
            sweep_interval: Duration::from_secs(env_parse("SWEEP_INTERVAL_SECS", 6 * 60 * 60)?),
            notify_queue_depth: env_parse("NOTIFY_QUEUE_DEPTH", 256)?,
        })
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match dotenvy::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        Err(_) => Ok(default),
    }
}
