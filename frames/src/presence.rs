//! Presence payloads: per-connection ephemeral state replicated to peers.
//!
//! DESIGN
//! ======
//! A participant's presence is owned by exactly one connection. Clients send
//! `PresencePatch` values; each field is tri-state on the wire (absent keeps
//! the current value, `null` clears it, a value replaces it). Peers always
//! receive the full merged `Presence` so a receiver replaces its copy
//! wholesale and never merges partial state.

use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::ErrorCode;

/// Longest entity id or field name accepted in a presence patch.
pub const MAX_PRESENCE_ID_LEN: usize = 128;

/// Display colors assigned to participants. Indexed by a digest of the user id.
pub const PRESENCE_PALETTE: [&str; 12] = [
    "#e5484d", "#f76b15", "#ffc53d", "#46a758", "#12a594", "#00a2c7", "#0090ff", "#3e63dd", "#6e56cf", "#ab4aba",
    "#d6409f", "#8d8d86",
];

/// Deterministic display color for a user. Stable across processes and hosts.
#[must_use]
pub fn presence_color(user_id: Uuid) -> &'static str {
    let digest = Sha256::digest(user_id.as_bytes());
    let seed = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    let index = usize::try_from(seed).unwrap_or(0) % PRESENCE_PALETTE.len();
    PRESENCE_PALETTE[index]
}

// =============================================================================
// TYPES
// =============================================================================

/// A 2D point in board coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    #[must_use]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// What is being dragged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DragKind {
    Card,
    List,
}

/// An in-progress drag. Present only while the pointer is down.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DragState {
    pub kind: DragKind,
    /// Card or list being dragged.
    pub entity_id: String,
    /// Pointer offset from the dragged element's origin.
    pub offset: Point,
    /// List the entity was picked up from (cards only).
    #[serde(default)]
    pub source_list_id: Option<String>,
    /// Position the entity occupied before the drag started.
    #[serde(default)]
    pub source_position: Option<f64>,
}

/// Full presence record for one connection.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    #[serde(default)]
    pub cursor: Option<Point>,
    #[serde(default)]
    pub selected_card_id: Option<String>,
    #[serde(default)]
    pub editing_card_id: Option<String>,
    #[serde(default)]
    pub editing_field: Option<String>,
    #[serde(default)]
    pub drag: Option<DragState>,
}

impl Presence {
    #[must_use]
    pub fn is_dragging(&self) -> bool {
        self.drag.is_some()
    }

    /// True if this presence is dragging `entity_id`, optionally of a given kind.
    #[must_use]
    pub fn is_dragging_entity(&self, kind: Option<DragKind>, entity_id: &str) -> bool {
        self.drag
            .as_ref()
            .is_some_and(|drag| drag.entity_id == entity_id && kind.is_none_or(|k| k == drag.kind))
    }

    #[must_use]
    pub fn is_editing(&self, card_id: &str) -> bool {
        self.editing_card_id.as_deref() == Some(card_id)
    }

    /// Apply a patch field by field. Later writes win.
    pub fn apply(&mut self, patch: PresencePatch) {
        if let Some(cursor) = patch.cursor {
            self.cursor = cursor;
        }
        if let Some(selected) = patch.selected_card_id {
            self.selected_card_id = selected;
        }
        if let Some(editing) = patch.editing_card_id {
            self.editing_card_id = editing;
        }
        if let Some(field) = patch.editing_field {
            self.editing_field = field;
        }
        if let Some(drag) = patch.drag {
            self.drag = drag;
        }
    }
}

/// Partial presence update. Outer `None` = unchanged, `Some(None)` = clear.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePatch {
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "present")]
    pub cursor: Option<Option<Point>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "present")]
    pub selected_card_id: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "present")]
    pub editing_card_id: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "present")]
    pub editing_field: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "present")]
    pub drag: Option<Option<DragState>>,
}

/// A key that is present on the wire is `Some`, even when its value is `null`.
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Reason a presence patch was refused.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PresenceError {
    #[error("{field} exceeds {max} characters", max = MAX_PRESENCE_ID_LEN)]
    TooLong { field: &'static str },
    #[error("{field} must be finite")]
    NotFinite { field: &'static str },
}

impl ErrorCode for PresenceError {
    fn error_code(&self) -> &'static str {
        "E_INVALID_PRESENCE"
    }
}

impl PresencePatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cursor.is_none()
            && self.selected_card_id.is_none()
            && self.editing_card_id.is_none()
            && self.editing_field.is_none()
            && self.drag.is_none()
    }

    /// Fold a later patch into this one. Fields set in `later` win.
    pub fn merge(&mut self, later: PresencePatch) {
        if later.cursor.is_some() {
            self.cursor = later.cursor;
        }
        if later.selected_card_id.is_some() {
            self.selected_card_id = later.selected_card_id;
        }
        if later.editing_card_id.is_some() {
            self.editing_card_id = later.editing_card_id;
        }
        if later.editing_field.is_some() {
            self.editing_field = later.editing_field;
        }
        if later.drag.is_some() {
            self.drag = later.drag;
        }
    }

    /// Patch that replaces every field with the values of `presence`.
    #[must_use]
    pub fn replace_with(presence: &Presence) -> Self {
        Self {
            cursor: Some(presence.cursor),
            selected_card_id: Some(presence.selected_card_id.clone()),
            editing_card_id: Some(presence.editing_card_id.clone()),
            editing_field: Some(presence.editing_field.clone()),
            drag: Some(presence.drag.clone()),
        }
    }

    /// Reject oversized identifiers and non-finite coordinates.
    ///
    /// # Errors
    ///
    /// Returns the first offending field.
    pub fn validate(&self) -> Result<(), PresenceError> {
        if let Some(Some(cursor)) = self.cursor {
            if !cursor.is_finite() {
                return Err(PresenceError::NotFinite { field: "cursor" });
            }
        }
        check_len("selectedCardId", self.selected_card_id.as_ref())?;
        check_len("editingCardId", self.editing_card_id.as_ref())?;
        check_len("editingField", self.editing_field.as_ref())?;
        if let Some(Some(drag)) = &self.drag {
            if drag.entity_id.len() > MAX_PRESENCE_ID_LEN {
                return Err(PresenceError::TooLong { field: "drag.entityId" });
            }
            if drag
                .source_list_id
                .as_ref()
                .is_some_and(|id| id.len() > MAX_PRESENCE_ID_LEN)
            {
                return Err(PresenceError::TooLong { field: "drag.sourceListId" });
            }
            if !drag.offset.is_finite() || drag.source_position.is_some_and(|p| !p.is_finite()) {
                return Err(PresenceError::NotFinite { field: "drag" });
            }
        }
        Ok(())
    }
}

fn check_len(field: &'static str, value: Option<&Option<String>>) -> Result<(), PresenceError> {
    match value {
        Some(Some(s)) if s.len() > MAX_PRESENCE_ID_LEN => Err(PresenceError::TooLong { field }),
        _ => Ok(()),
    }
}

/// Display attributes of the user behind a connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantUser {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    pub color: String,
}

impl ParticipantUser {
    /// Build display attributes with the deterministic palette color.
    #[must_use]
    pub fn new(id: Uuid, name: impl Into<String>, avatar_url: Option<String>) -> Self {
        Self { id, name: name.into(), avatar_url, color: presence_color(id).to_owned() }
    }
}

/// One connection in a room: who it is and what it is doing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub client_id: Uuid,
    pub user: ParticipantUser,
    #[serde(default)]
    pub presence: Presence,
}

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;
