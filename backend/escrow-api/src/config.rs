//! Application configuration loaded from environment variables.

use std::str::FromStr;

use rust_decimal::Decimal;

use crate::errors::{AppError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// Upper bound on pooled database connections
    pub db_max_connections: u32,
    /// How long a writer waits for the SQLite write lock
    pub db_busy_timeout_ms: u64,
    /// Largest ledger/provider difference that is not reported as drift
    pub reconcile_tolerance: Decimal,
    /// Seconds between reconciliation sweeps; `0` disables the sweeper
    pub reconcile_interval_secs: u64,
    /// Base URL of the payment provider's balance API, if balances are pulled
    pub provider_balance_url: Option<String>,
    /// Attempts per provider request before giving up for this sweep
    pub provider_max_attempts: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup (the environment in
    /// production, a map in tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Config {
            database_url: lookup("DATABASE_URL")
                .unwrap_or_else(|| "sqlite:./escrow.db".to_string()),
            api_port: parse_or(&lookup, "API_PORT", 3001)?,
            db_max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", 5)?,
            db_busy_timeout_ms: parse_or(&lookup, "DB_BUSY_TIMEOUT_MS", 5_000)?,
            reconcile_tolerance: parse_or(&lookup, "RECONCILE_TOLERANCE", Decimal::new(1, 2))?,
            reconcile_interval_secs: parse_or(&lookup, "RECONCILE_INTERVAL_SECS", 300)?,
            provider_balance_url: lookup("PROVIDER_BALANCE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .filter(|url| !url.is_empty()),
            provider_max_attempts: parse_or(&lookup, "PROVIDER_MAX_ATTEMPTS", 5)?,
        })
        .and_then(Config::validated)
    }

    fn validated(self) -> Result<Self> {
        if self.db_max_connections == 0 {
            return Err(AppError::Config(
                "DB_MAX_CONNECTIONS must be at least 1".to_string(),
            ));
        }
        if self.reconcile_tolerance < Decimal::ZERO {
            return Err(AppError::Config(
                "RECONCILE_TOLERANCE must not be negative".to_string(),
            ));
        }
        if self.provider_max_attempts == 0 {
            return Err(AppError::Config(
                "PROVIDER_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        Ok(self)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("Invalid {key}"))),
    }
}
