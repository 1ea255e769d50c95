//! Room access: sessions, board membership, and one-time room tickets.
//!
//! ARCHITECTURE
//! ============
//! HTTP callers authenticate with the host application's long-lived session
//! token. A member of the workspace that owns a board exchanges that session
//! for a room ticket scoped to exactly one board; the websocket upgrade
//! consumes the ticket. Session tokens never travel in WS query strings.
//!
//! `AccessDirectory` is the seam between this service and the host's
//! identity and authorization tables. `PgDirectory` reads them from
//! Postgres; `MemoryDirectory` backs tests and local development.
//!
//! TRADE-OFFS
//! ==========
//! Ticket consumption is destructive (`DELETE ... RETURNING`) to guarantee
//! single use; a reconnecting client must request a fresh grant. Only the
//! SHA-256 digest of a ticket is stored, so a leaked table dump cannot be
//! replayed.

use std::fmt::Write;
use std::time::Duration;

use frames::ErrorCode;
use frames::presence::ParticipantUser;
use rand::Rng;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use uuid::Uuid;

// =============================================================================
// TYPES
// =============================================================================

/// User behind a validated session.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SessionUser {
    pub id: Uuid,
    pub name: String,
    pub avatar_url: Option<String>,
}

impl SessionUser {
    /// Display attributes shown to room peers.
    #[must_use]
    pub fn participant_user(&self) -> ParticipantUser {
        ParticipantUser::new(self.id, self.name.clone(), self.avatar_url.clone())
    }
}

/// What a consumed ticket grants: one user in one room.
#[derive(Debug, Clone, PartialEq)]
pub struct TicketClaims {
    pub user: SessionUser,
    pub room_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ErrorCode for AccessError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Database(_) => "E_DATABASE",
        }
    }

    fn retryable(&self) -> bool {
        true
    }
}

// =============================================================================
// DIRECTORY TRAIT
// =============================================================================

#[async_trait::async_trait]
pub trait AccessDirectory: Send + Sync {
    /// Resolve a session token to its user. `None` for unknown or expired sessions.
    async fn authenticate(&self, token: &str) -> Result<Option<SessionUser>, AccessError>;

    /// True if `user_id` belongs to the workspace that owns `board_id`.
    async fn is_board_member(&self, user_id: Uuid, board_id: &str) -> Result<bool, AccessError>;

    /// Mint a single-use ticket for `user` to join `board_id`'s room.
    async fn issue_ticket(&self, user: &SessionUser, board_id: &str, ttl: Duration) -> Result<String, AccessError>;

    /// Consume a ticket. `None` if unknown, expired, or already used.
    async fn consume_ticket(&self, ticket: &str) -> Result<Option<TicketClaims>, AccessError>;

    /// Delete expired tickets, returning how many were removed.
    async fn purge_expired_tickets(&self) -> Result<u64, AccessError>;
}

// =============================================================================
// TICKETS
// =============================================================================

pub(crate) fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// Generate a random 32-byte hex room ticket.
#[must_use]
pub fn generate_ticket() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    bytes_to_hex(&bytes)
}

/// Storage key for a ticket.
#[must_use]
pub fn hash_ticket(ticket: &str) -> String {
    bytes_to_hex(&Sha256::digest(ticket.as_bytes()))
}

// =============================================================================
// POSTGRES
// =============================================================================

/// Directory backed by the host application's tables plus `room_tickets`.
#[derive(Clone)]
pub struct PgDirectory {
    pool: PgPool,
}

impl PgDirectory {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl AccessDirectory for PgDirectory {
    async fn authenticate(&self, token: &str) -> Result<Option<SessionUser>, AccessError> {
        let row = sqlx::query(
            r"SELECT u.id, u.name, u.avatar_url
              FROM sessions s
              JOIN users u ON u.id = s.user_id
              WHERE s.token = $1 AND s.expires_at > now()",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| SessionUser { id: r.get("id"), name: r.get("name"), avatar_url: r.get("avatar_url") }))
    }

    async fn is_board_member(&self, user_id: Uuid, board_id: &str) -> Result<bool, AccessError> {
        let member: bool = sqlx::query_scalar(
            r"SELECT EXISTS(
                  SELECT 1
                  FROM boards b
                  JOIN workspace_members m ON m.workspace_id = b.workspace_id
                  WHERE b.id::text = $1 AND m.user_id = $2
              )",
        )
        .bind(board_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(member)
    }

    async fn issue_ticket(&self, user: &SessionUser, board_id: &str, ttl: Duration) -> Result<String, AccessError> {
        let ticket = generate_ticket();
        sqlx::query(
            r"INSERT INTO room_tickets (ticket_hash, user_id, user_name, avatar_url, room_id, expires_at)
              VALUES ($1, $2, $3, $4, $5, now() + make_interval(secs => $6))",
        )
        .bind(hash_ticket(&ticket))
        .bind(user.id)
        .bind(&user.name)
        .bind(&user.avatar_url)
        .bind(board_id)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(ticket)
    }

    async fn consume_ticket(&self, ticket: &str) -> Result<Option<TicketClaims>, AccessError> {
        let row = sqlx::query(
            r"DELETE FROM room_tickets
              WHERE ticket_hash = $1 AND expires_at > now()
              RETURNING user_id, user_name, avatar_url, room_id",
        )
        .bind(hash_ticket(ticket))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| TicketClaims {
            user: SessionUser { id: r.get("user_id"), name: r.get("user_name"), avatar_url: r.get("avatar_url") },
            room_id: r.get("room_id"),
        }))
    }

    async fn purge_expired_tickets(&self) -> Result<u64, AccessError> {
        let result = sqlx::query("DELETE FROM room_tickets WHERE expires_at <= now()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
#[path = "access_test.rs"]
mod tests;
