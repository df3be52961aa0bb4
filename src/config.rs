//! Configuration for commons-billing.

use crate::error::AppError;
use config::{Config as Cfg, File};
use serde::Deserialize;
use std::env;

/// Common configuration shared with the ops HTTP surface.
#[derive(Debug, Clone, Deserialize)]
pub struct CommonConfig {
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    8080
}

impl CommonConfig {
    pub fn load() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        let config = Cfg::builder()
            .add_source(File::with_name("configuration").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BillingConfig {
    pub common: CommonConfig,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub database: DatabaseConfig,
    pub jobs: JobsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Settings for the background billing jobs.
#[derive(Debug, Clone, Deserialize)]
pub struct JobsConfig {
    /// Day of month the monthly invoice generation runs (1-28).
    pub generation_day_of_month: u32,
    /// Days after the billing period end before a sent invoice is due.
    pub invoice_due_days: u64,
    /// Scheduler tick interval in seconds.
    pub tick_seconds: u64,
    /// Disable to run the service without background jobs (tests, one-off tools).
    pub scheduler_enabled: bool,
}

impl BillingConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = CommonConfig::load()?;

        let config = BillingConfig {
            common,
            service_name: get_env("SERVICE_NAME", Some("commons-billing"))?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")))?,
            log_level: get_env("LOG_LEVEL", Some("info"))?,
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", None)?,
                max_connections: parse_env("DB_MAX_CONNECTIONS", "10")?,
                min_connections: parse_env("DB_MIN_CONNECTIONS", "2")?,
            },
            jobs: JobsConfig {
                generation_day_of_month: parse_env("BILLING_GENERATION_DAY", "1")?,
                invoice_due_days: parse_env("INVOICE_DUE_DAYS", "30")?,
                tick_seconds: parse_env("SCHEDULER_TICK_SECONDS", "300")?,
                scheduler_enabled: parse_env("SCHEDULER_ENABLED", "true")?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        // Day 29-31 does not exist in every month, so the job would silently
        // skip those months.
        if !(1..=28).contains(&self.jobs.generation_day_of_month) {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "BILLING_GENERATION_DAY must be between 1 and 28"
            )));
        }

        if self.jobs.invoice_due_days == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "INVOICE_DUE_DAYS must be at least 1"
            )));
        }

        if self.jobs.tick_seconds == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "SCHEDULER_TICK_SECONDS must be at least 1"
            )));
        }

        if self.database.max_connections < self.database.min_connections {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "DB_MAX_CONNECTIONS must be >= DB_MIN_CONNECTIONS"
            )));
        }

        Ok(())
    }
}

fn get_env(key: &str, default: Option<&str>) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn parse_env<T>(key: &str, default: &str) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    get_env(key, Some(default))?
        .parse()
        .map_err(|e: T::Err| AppError::ConfigError(anyhow::anyhow!("Invalid {}: {}", key, e)))
}
