use std::time::Duration;

use clap::Parser;
use config::ConfigError;

use crate::error::AppResult;

const MIN_PASSWORD_ITERATIONS: u32 = 1_000;

/// Runtime configuration. Every flag falls back to its environment variable.
#[derive(Debug, Clone, Parser)]
#[command(name = "server", about = "Loyalty points ledger with accrual reconciliation")]
pub struct Config {
    /// Address the HTTP server binds to
    #[arg(short = 'a', long, env = "RUN_ADDRESS", default_value = "0.0.0.0:8080")]
    pub bind_address: String,

    /// PostgreSQL connection string
    #[arg(short = 'd', long, env = "DATABASE_URI", default_value = "")]
    pub database_url: String,

    /// Base address of the accrual system
    #[arg(short = 'r', long, env = "ACCRUAL_SYSTEM_ADDRESS", default_value = "http://localhost:8010")]
    pub accrual_address: String,

    /// Delay between two oracle polls of a non-terminal order
    #[arg(long, env = "POLL_INTERVAL_MS", default_value_t = 1_000)]
    pub poll_interval_ms: u64,

    /// Delay after a transient oracle failure
    #[arg(long, env = "RETRY_BACKOFF_MS", default_value_t = 5_000)]
    pub retry_backoff_ms: u64,

    #[arg(long, env = "ORACLE_TIMEOUT_MS", default_value_t = 5_000)]
    pub oracle_timeout_ms: u64,

    #[arg(long, env = "DB_MAX_CONNECTIONS", default_value_t = 20)]
    pub db_max_connections: u32,

    /// HMAC-SHA256 key used to sign session tokens
    #[arg(long, env = "TOKEN_SECRET", default_value = "", hide_env_values = true)]
    pub token_secret: String,

    #[arg(long, env = "TOKEN_TTL_SECS", default_value_t = 3 * 60 * 60)]
    pub token_ttl_secs: u64,

    /// PBKDF2 rounds applied to stored passwords
    #[arg(long, env = "PASSWORD_ITERATIONS", default_value_t = 100_000)]
    pub password_iterations: u32,
}

impl Config {
    /// Load `.env`, parse flags and environment, then validate.
    pub fn load() -> AppResult<Self> {
        dotenv::dotenv().ok();
        let config = Self::parse();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.trim().is_empty() {
            return Err(ConfigError::Message(
                "database address must be set with -d or DATABASE_URI".to_string(),
            ));
        }

        if !self.accrual_address.starts_with("http://") && !self.accrual_address.starts_with("https://") {
            return Err(ConfigError::Message(format!(
                "accrual system address must include a scheme: {}",
                self.accrual_address
            )));
        }

        if self.poll_interval_ms == 0 || self.poll_interval_ms >= self.retry_backoff_ms {
            return Err(ConfigError::Message(format!(
                "poll interval ({}ms) must be positive and shorter than retry backoff ({}ms)",
                self.poll_interval_ms, self.retry_backoff_ms
            )));
        }

        if self.token_secret.trim().is_empty() {
            return Err(ConfigError::Message(
                "token signing key must be set with --token-secret or TOKEN_SECRET".to_string(),
            ));
        }

        if self.password_iterations < MIN_PASSWORD_ITERATIONS {
            return Err(ConfigError::Message(format!(
                "password iterations must be at least {}: {}",
                MIN_PASSWORD_ITERATIONS, self.password_iterations
            )));
        }

        Ok(())
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_millis(self.oracle_timeout_ms)
    }
}
