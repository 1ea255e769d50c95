//! Room access grants.
//!
//! A grant is a one-time ticket scoped to a single board. The client never
//! sends its session token over the socket; it trades it for a ticket here
//! and presents the ticket on the upgrade.

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{COOKIE, HeaderValue};
use serde::Deserialize;
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::ClientError;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RoomGrant {
    pub ticket: String,
    pub room_id: String,
    pub expires_in_secs: u64,
}

/// Exchanges the caller's session for a room grant.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// # Errors
    ///
    /// [`ClientError::Unauthorized`] when the caller has no session or is not
    /// a member of the board's workspace.
    async fn grant(&self, room_id: &str) -> Result<RoomGrant, ClientError>;
}

/// Grants from the room server's `POST /api/rooms/{board_id}/grant`.
pub struct HttpAuthProvider {
    http: reqwest::Client,
    config: ClientConfig,
    session_token: String,
}

impl HttpAuthProvider {
    #[must_use]
    pub fn new(config: ClientConfig, session_token: impl Into<String>) -> Self {
        Self { http: reqwest::Client::new(), config, session_token: session_token.into() }
    }
}

#[async_trait]
impl AuthProvider for HttpAuthProvider {
    async fn grant(&self, room_id: &str) -> Result<RoomGrant, ClientError> {
        let url = self.config.api_url(&format!("/api/rooms/{room_id}/grant"));
        let cookie = HeaderValue::from_str(&format!("session_token={}", self.session_token))
            .map_err(|_| ClientError::Unauthorized("session token is not a valid header value".to_owned()))?;

        let response = self.http.post(url).header(COOKIE, cookie).send().await?;
        let status = response.status();
        debug!(room_id, status = status.as_u16(), "room grant response");

        match status {
            StatusCode::UNAUTHORIZED => Err(ClientError::Unauthorized("no valid session".to_owned())),
            StatusCode::FORBIDDEN => Err(ClientError::Unauthorized(format!("not a member of board {room_id}"))),
            s if s.is_success() => Ok(response.json::<RoomGrant>().await?),
            s => Err(ClientError::GrantFailed(s.as_u16())),
        }
    }
}

/// Hands out a fixed ticket. For callers that already hold one.
pub struct StaticTicket(pub String);

#[async_trait]
impl AuthProvider for StaticTicket {
    async fn grant(&self, room_id: &str) -> Result<RoomGrant, ClientError> {
        Ok(RoomGrant { ticket: self.0.clone(), room_id: room_id.to_owned(), expires_in_secs: 0 })
    }
}
