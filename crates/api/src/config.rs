//! Configuration management

use std::env;

use anyhow::{anyhow, Context};
use stowage_billing::dispatcher::DEFAULT_SPACING;

/// Minimum accepted length of `JWT_SECRET`
const MIN_JWT_SECRET_LEN: usize = 32;

/// API server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address
    pub bind_address: String,
    /// Postgres connection string
    pub database_url: String,
    /// HS256 signing secret for access tokens
    pub jwt_secret: String,
    /// Access token lifetime
    pub jwt_expiry_hours: i64,
    /// Browser origins allowed by CORS
    pub allowed_origins: Vec<String>,
    /// Delay between two outbound notifications
    pub side_effect_spacing_ms: u64,
    /// Apply embedded migrations at startup
    pub run_migrations: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = required("DATABASE_URL")?;
        // Billing reads it again when connecting; checked here so startup fails early
        required("REDIS_URL")?;

        let jwt_secret = required("JWT_SECRET")?;
        if jwt_secret.len() < MIN_JWT_SECRET_LEN {
            return Err(anyhow!(
                "JWT_SECRET must be at least {} characters",
                MIN_JWT_SECRET_LEN
            ));
        }

        let jwt_expiry_hours = parse_or("JWT_EXPIRY_HOURS", 24)?;
        let side_effect_spacing_ms =
            parse_or("SIDE_EFFECT_SPACING_MS", DEFAULT_SPACING.as_millis() as u64)?;
        let run_migrations = parse_or("RUN_MIGRATIONS", true)?;

        let allowed_origins = env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            database_url,
            jwt_secret,
            jwt_expiry_hours,
            allowed_origins,
            side_effect_spacing_ms,
            run_migrations,
        })
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            bind_address: "127.0.0.1:0".to_string(),
            database_url: "postgres://localhost/stowage_test".to_string(),
            jwt_secret: "test-secret-that-is-at-least-32-characters".to_string(),
            jwt_expiry_hours: 24,
            allowed_origins: vec!["http://localhost:3000".to_string()],
            side_effect_spacing_ms: 0,
            run_migrations: false,
        }
    }
}

fn required(key: &str) -> anyhow::Result<String> {
    env::var(key).with_context(|| format!("{} must be set", key))
}

fn parse_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("{} is invalid: {}", key, e)),
        Err(_) => Ok(default),
    }
}
