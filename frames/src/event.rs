//! Room events: one-shot, non-persisted notifications fanned out to peers.
//!
//! DESIGN
//! ======
//! The catalogue is closed. Each variant carries only the ids a receiver
//! needs to decide what to refetch; the payload is a hint and never the data
//! itself. On the wire an event is a flat object tagged by `type`:
//!
//! ```json
//! {"type": "CARD_MOVED", "cardId": "c1", "toListId": "l2", "userId": "...", "timestamp": 1700000000000}
//! ```
//!
//! Receivers that see a `type` they do not know fail to decode it and drop it.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Every event kind a room can carry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum RoomEvent {
    BoardUpdated {
        board_id: String,
    },
    BoardDeleted {
        board_id: String,
    },
    ListCreated {
        list_id: String,
    },
    ListUpdated {
        list_id: String,
    },
    ListMoved {
        list_id: String,
        #[serde(default)]
        position: Option<f64>,
    },
    ListDeleted {
        list_id: String,
    },
    CardCreated {
        card_id: String,
        list_id: String,
    },
    CardUpdated {
        card_id: String,
    },
    CardMoved {
        card_id: String,
        #[serde(default)]
        from_list_id: Option<String>,
        #[serde(default)]
        to_list_id: Option<String>,
        #[serde(default)]
        position: Option<f64>,
    },
    CardDeleted {
        card_id: String,
    },
    AttachmentAdded {
        card_id: String,
        attachment_id: String,
    },
    AttachmentDeleted {
        card_id: String,
        attachment_id: String,
    },
    MemberAdded {
        member_id: String,
    },
    MemberRemoved {
        member_id: String,
    },
    MemberRoleChanged {
        member_id: String,
        role: String,
    },
    LabelCreated {
        label_id: String,
    },
    LabelUpdated {
        label_id: String,
    },
    LabelDeleted {
        label_id: String,
    },
    CardLabelToggled {
        card_id: String,
        label_id: String,
    },
    ChecklistCreated {
        card_id: String,
        checklist_id: String,
    },
    ChecklistUpdated {
        card_id: String,
        checklist_id: String,
    },
    ChecklistDeleted {
        card_id: String,
        checklist_id: String,
    },
    ChecklistItemToggled {
        card_id: String,
        checklist_id: String,
        item_id: String,
    },
    CommentAdded {
        card_id: String,
        comment_id: String,
    },
    CommentUpdated {
        card_id: String,
        comment_id: String,
    },
    CommentDeleted {
        card_id: String,
        comment_id: String,
    },
    ReactionAdded {
        card_id: String,
        comment_id: String,
        emoji: String,
    },
    ReactionRemoved {
        card_id: String,
        comment_id: String,
        emoji: String,
    },
}

/// Locally cached server data a client may need to refetch.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RefreshTarget {
    /// Everything; used after reconnect since missed events are never replayed.
    All,
    Board,
    Lists,
    List(String),
    Card(String),
    Members,
    Labels,
    Activity,
}

impl RoomEvent {
    /// Wire name of the variant, e.g. `"CARD_MOVED"`.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BoardUpdated { .. } => "BOARD_UPDATED",
            Self::BoardDeleted { .. } => "BOARD_DELETED",
            Self::ListCreated { .. } => "LIST_CREATED",
            Self::ListUpdated { .. } => "LIST_UPDATED",
            Self::ListMoved { .. } => "LIST_MOVED",
            Self::ListDeleted { .. } => "LIST_DELETED",
            Self::CardCreated { .. } => "CARD_CREATED",
            Self::CardUpdated { .. } => "CARD_UPDATED",
            Self::CardMoved { .. } => "CARD_MOVED",
            Self::CardDeleted { .. } => "CARD_DELETED",
            Self::AttachmentAdded { .. } => "ATTACHMENT_ADDED",
            Self::AttachmentDeleted { .. } => "ATTACHMENT_DELETED",
            Self::MemberAdded { .. } => "MEMBER_ADDED",
            Self::MemberRemoved { .. } => "MEMBER_REMOVED",
            Self::MemberRoleChanged { .. } => "MEMBER_ROLE_CHANGED",
            Self::LabelCreated { .. } => "LABEL_CREATED",
            Self::LabelUpdated { .. } => "LABEL_UPDATED",
            Self::LabelDeleted { .. } => "LABEL_DELETED",
            Self::CardLabelToggled { .. } => "CARD_LABEL_TOGGLED",
            Self::ChecklistCreated { .. } => "CHECKLIST_CREATED",
            Self::ChecklistUpdated { .. } => "CHECKLIST_UPDATED",
            Self::ChecklistDeleted { .. } => "CHECKLIST_DELETED",
            Self::ChecklistItemToggled { .. } => "CHECKLIST_ITEM_TOGGLED",
            Self::CommentAdded { .. } => "COMMENT_ADDED",
            Self::CommentUpdated { .. } => "COMMENT_UPDATED",
            Self::CommentDeleted { .. } => "COMMENT_DELETED",
            Self::ReactionAdded { .. } => "REACTION_ADDED",
            Self::ReactionRemoved { .. } => "REACTION_REMOVED",
        }
    }

    /// Cached scopes a receiver should invalidate for this event.
    #[must_use]
    pub fn refresh_targets(&self) -> Vec<RefreshTarget> {
        match self {
            Self::BoardUpdated { .. } | Self::BoardDeleted { .. } => vec![RefreshTarget::Board],
            Self::ListCreated { .. } | Self::ListMoved { .. } | Self::ListDeleted { .. } => {
                vec![RefreshTarget::Lists]
            }
            Self::ListUpdated { list_id } => vec![RefreshTarget::List(list_id.clone())],
            Self::CardCreated { list_id, .. } => vec![RefreshTarget::List(list_id.clone())],
            Self::CardMoved { card_id, from_list_id, to_list_id, .. } => {
                let mut targets = vec![RefreshTarget::Card(card_id.clone())];
                match (from_list_id, to_list_id) {
                    (Some(from), Some(to)) => {
                        targets.push(RefreshTarget::List(from.clone()));
                        if from != to {
                            targets.push(RefreshTarget::List(to.clone()));
                        }
                    }
                    _ => targets.push(RefreshTarget::Lists),
                }
                targets
            }
            Self::CardDeleted { card_id } => vec![RefreshTarget::Card(card_id.clone()), RefreshTarget::Lists],
            Self::CardUpdated { card_id }
            | Self::AttachmentAdded { card_id, .. }
            | Self::AttachmentDeleted { card_id, .. }
            | Self::CardLabelToggled { card_id, .. }
            | Self::ChecklistCreated { card_id, .. }
            | Self::ChecklistUpdated { card_id, .. }
            | Self::ChecklistDeleted { card_id, .. }
            | Self::ChecklistItemToggled { card_id, .. }
            | Self::ReactionAdded { card_id, .. }
            | Self::ReactionRemoved { card_id, .. } => vec![RefreshTarget::Card(card_id.clone())],
            Self::CommentAdded { card_id, .. }
            | Self::CommentUpdated { card_id, .. }
            | Self::CommentDeleted { card_id, .. } => {
                vec![RefreshTarget::Card(card_id.clone()), RefreshTarget::Activity]
            }
            Self::MemberAdded { .. } | Self::MemberRemoved { .. } | Self::MemberRoleChanged { .. } => {
                vec![RefreshTarget::Members]
            }
            Self::LabelCreated { .. } | Self::LabelUpdated { .. } | Self::LabelDeleted { .. } => {
                vec![RefreshTarget::Labels]
            }
        }
    }
}

/// An event as delivered to peers: the variant plus who sent it and when.
///
/// `user_id` and `timestamp` are stamped by the server; values supplied by the
/// publishing client are discarded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    #[serde(flatten)]
    pub event: RoomEvent,
    pub user_id: Uuid,
    pub timestamp: i64,
}

impl EventEnvelope {
    #[must_use]
    pub fn new(event: RoomEvent, user_id: Uuid, timestamp: i64) -> Self {
        Self { event, user_id, timestamp }
    }
}

#[cfg(test)]
#[path = "event_test.rs"]
mod tests;
