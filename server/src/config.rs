//! Environment-driven server configuration.
//!
//! Every knob has a default so a bare `DATABASE_URL` is enough to boot.
//! Unparseable values fall back to the default rather than failing startup.

use std::time::Duration;

use crate::rate_limit::RateLimitConfig;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
const DEFAULT_TICKET_TTL_SECS: u64 = 30;
const DEFAULT_CLIENT_CHANNEL_CAPACITY: usize = 256;
const DEFAULT_PING_INTERVAL_SECS: u64 = 25;
const DEFAULT_TICKET_SWEEP_SECS: u64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub db_max_connections: u32,
    /// Lifetime of a room grant ticket.
    pub ticket_ttl: Duration,
    /// Bound of each connection's outbound frame queue.
    pub client_channel_capacity: usize,
    pub ping_interval: Duration,
    /// A socket with no inbound traffic (pongs included) for this long is
    /// dropped and its presence released.
    pub idle_timeout: Duration,
    pub ticket_sweep_interval: Duration,
    pub rate_limit: RateLimitConfig,
}

impl Config {
    /// Load from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] when `DATABASE_URL` is unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;
        Ok(Self { database_url, ..Self::defaults_from_env() })
    }

    /// Everything except the database URL. Used by tests and in-memory setups.
    #[must_use]
    pub fn defaults_from_env() -> Self {
        let ping_secs = env_parse("WS_PING_INTERVAL_SECS", DEFAULT_PING_INTERVAL_SECS).max(1);
        let idle_secs = env_parse("WS_IDLE_TIMEOUT_SECS", ping_secs.saturating_mul(2)).max(ping_secs);
        Self {
            database_url: String::new(),
            port: env_parse("PORT", DEFAULT_PORT),
            db_max_connections: env_parse("DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS),
            ticket_ttl: Duration::from_secs(env_parse("ROOM_TICKET_TTL_SECS", DEFAULT_TICKET_TTL_SECS)),
            client_channel_capacity: env_parse("WS_CLIENT_CHANNEL_CAPACITY", DEFAULT_CLIENT_CHANNEL_CAPACITY).max(1),
            ping_interval: Duration::from_secs(ping_secs),
            idle_timeout: Duration::from_secs(idle_secs),
            ticket_sweep_interval: Duration::from_secs(
                env_parse("ROOM_TICKET_SWEEP_SECS", DEFAULT_TICKET_SWEEP_SECS).max(1),
            ),
            rate_limit: RateLimitConfig::from_env(),
        }
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
