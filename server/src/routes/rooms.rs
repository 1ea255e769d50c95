//! Room routes: grant exchange and participant listing.
//!
//! Both require a session. The session token is read from the
//! `session_token` cookie, or from `Authorization: Bearer` for non-browser
//! clients such as the CLI.

use axum::Json;
use axum::extract::{FromRef, Path, State};
use axum::http::StatusCode;
use axum::http::header::AUTHORIZATION;
use axum_extra::extract::cookie::{Cookie, CookieJar};
use frames::presence::Participant;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::services::access::SessionUser;
use crate::state::AppState;

const COOKIE_NAME: &str = "session_token";

// =============================================================================
// AUTH EXTRACTOR
// =============================================================================

/// Authenticated user extracted from the session cookie or bearer header.
/// Use as a handler parameter to require authentication.
pub struct AuthUser {
    pub user: SessionUser,
}

fn session_token(parts: &axum::http::request::Parts) -> Option<String> {
    let jar = CookieJar::from_headers(&parts.headers);
    if let Some(token) = jar.get(COOKIE_NAME).map(Cookie::value) {
        if !token.is_empty() {
            return Some(token.to_owned());
        }
    }

    parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(ToOwned::to_owned)
}

impl<S> axum::extract::FromRequestParts<S> for AuthUser
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut axum::http::request::Parts, state: &S) -> Result<Self, Self::Rejection> {
        let token = session_token(parts).ok_or(StatusCode::UNAUTHORIZED)?;

        let app_state = AppState::from_ref(state);
        let user = app_state
            .directory
            .authenticate(&token)
            .await
            .map_err(|e| {
                error!(error = %e, "session validation failed");
                StatusCode::INTERNAL_SERVER_ERROR
            })?
            .ok_or(StatusCode::UNAUTHORIZED)?;

        Ok(Self { user })
    }
}

async fn require_member(state: &AppState, user: &SessionUser, board_id: &str) -> Result<(), StatusCode> {
    let member = state
        .directory
        .is_board_member(user.id, board_id)
        .await
        .map_err(|e| {
            error!(error = %e, board_id, "membership check failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    if member { Ok(()) } else { Err(StatusCode::FORBIDDEN) }
}

// =============================================================================
// HANDLERS
// =============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct GrantResponse {
    pub ticket: String,
    pub room_id: String,
    pub expires_in_secs: u64,
}

/// `POST /api/rooms/{board_id}/grant`: exchange a session for a room ticket.
pub async fn grant(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(board_id): Path<String>,
) -> Result<Json<GrantResponse>, StatusCode> {
    require_member(&state, &auth.user, &board_id).await?;

    let ttl = state.config.ticket_ttl;
    let ticket = state
        .directory
        .issue_ticket(&auth.user, &board_id, ttl)
        .await
        .map_err(|e| {
            error!(error = %e, board_id, "room ticket issue failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    info!(user_id = %auth.user.id, board_id, "room grant issued");
    Ok(Json(GrantResponse { ticket, room_id: board_id, expires_in_secs: ttl.as_secs() }))
}

/// `GET /api/rooms/{board_id}/participants`: who is in the room right now.
pub async fn participants(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(board_id): Path<String>,
) -> Result<Json<Vec<Participant>>, StatusCode> {
    require_member(&state, &auth.user, &board_id).await?;
    Ok(Json(state.rooms.participants(&board_id).await))
}

#[cfg(test)]
#[path = "rooms_test.rs"]
mod tests;
