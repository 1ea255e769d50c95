//! Client configuration.

use std::time::Duration;

use crate::error::ClientError;

/// Minimum spacing between presence pushes.
pub const PRESENCE_THROTTLE: Duration = Duration::from_millis(16);

/// Backoff schedule for re-establishing a lost connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_millis(10_000),
            max_attempts: Some(10),
        }
    }
}

impl ReconnectPolicy {
    /// Never reconnect.
    #[must_use]
    pub fn disabled() -> Self {
        Self { max_attempts: Some(0), ..Self::default() }
    }

    /// Delay before the given 1-based attempt.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    #[must_use]
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempt <= max)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `http://` or `https://` origin of the room server.
    pub base_url: String,
    pub presence_throttle: Duration,
    /// How long to wait for `session:connected` after the upgrade.
    pub connect_timeout: Duration,
    /// Buffer of the `SessionEvent` broadcast channel.
    pub event_capacity: usize,
    pub reconnect: ReconnectPolicy,
}

impl ClientConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            presence_throttle: PRESENCE_THROTTLE,
            connect_timeout: Duration::from_secs(5),
            event_capacity: 256,
            reconnect: ReconnectPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Build the websocket URL for a ticket.
    ///
    /// # Errors
    ///
    /// [`ClientError::InvalidBaseUrl`] unless the base URL is `http(s)://`.
    pub fn ws_url(&self, ticket: &str) -> Result<String, ClientError> {
        let base = self.base_url.trim_end_matches('/');
        if let Some(rest) = base.strip_prefix("http://") {
            return Ok(format!("ws://{rest}/api/ws?ticket={ticket}"));
        }
        if let Some(rest) = base.strip_prefix("https://") {
            return Ok(format!("wss://{rest}/api/ws?ticket={ticket}"));
        }
        Err(ClientError::InvalidBaseUrl(self.base_url.clone()))
    }

    #[must_use]
    pub fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
