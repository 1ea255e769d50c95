//! In-memory `AccessDirectory` for tests and local development.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use uuid::Uuid;

use super::access::{AccessDirectory, AccessError, SessionUser, TicketClaims, generate_ticket, hash_ticket};

#[derive(Default)]
pub struct MemoryDirectory {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, SessionUser>,
    members: HashSet<(Uuid, String)>,
    /// Keyed by ticket digest, like the `room_tickets` table.
    tickets: HashMap<String, (TicketClaims, Instant)>,
}

impl MemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Register a session token for `user`.
    pub fn add_session(&self, token: impl Into<String>, user: SessionUser) {
        self.lock().sessions.insert(token.into(), user);
    }

    /// Make `user_id` a member of the workspace owning `board_id`.
    pub fn add_member(&self, user_id: Uuid, board_id: impl Into<String>) {
        self.lock().members.insert((user_id, board_id.into()));
    }

    /// Outstanding tickets, expired ones included.
    #[must_use]
    pub fn ticket_count(&self) -> usize {
        self.lock().tickets.len()
    }
}

#[async_trait::async_trait]
impl AccessDirectory for MemoryDirectory {
    async fn authenticate(&self, token: &str) -> Result<Option<SessionUser>, AccessError> {
        Ok(self.lock().sessions.get(token).cloned())
    }

    async fn is_board_member(&self, user_id: Uuid, board_id: &str) -> Result<bool, AccessError> {
        Ok(self.lock().members.contains(&(user_id, board_id.to_owned())))
    }

    async fn issue_ticket(&self, user: &SessionUser, board_id: &str, ttl: Duration) -> Result<String, AccessError> {
        let ticket = generate_ticket();
        let claims = TicketClaims { user: user.clone(), room_id: board_id.to_owned() };
        self.lock()
            .tickets
            .insert(hash_ticket(&ticket), (claims, Instant::now() + ttl));
        Ok(ticket)
    }

    async fn consume_ticket(&self, ticket: &str) -> Result<Option<TicketClaims>, AccessError> {
        let Some((claims, expires_at)) = self.lock().tickets.remove(&hash_ticket(ticket)) else {
            return Ok(None);
        };
        if expires_at <= Instant::now() {
            return Ok(None);
        }
        Ok(Some(claims))
    }

    async fn purge_expired_tickets(&self) -> Result<u64, AccessError> {
        let now = Instant::now();
        let mut inner = self.lock();
        let before = inner.tickets.len();
        inner.tickets.retain(|_, (_, expires_at)| *expires_at > now);
        Ok(u64::try_from(before - inner.tickets.len()).unwrap_or(u64::MAX))
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;
