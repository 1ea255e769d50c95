//! "Who is doing what" over a presence snapshot.
//!
//! Every function takes the peers of the local connection (the output of
//! `RoomSession::others`), so the local user never shows up as the owner of
//! an indicator. Owner lookups return the first match in join order.

use frames::presence::{DragKind, Participant, ParticipantUser};

#[must_use]
pub fn is_dragging_by_others(others: &[Participant], entity_id: &str) -> bool {
    user_dragging(others, entity_id).is_some()
}

/// Who is dragging `entity_id`, card or list.
#[must_use]
pub fn user_dragging<'a>(others: &'a [Participant], entity_id: &str) -> Option<&'a ParticipantUser> {
    dragging_of_kind(others, None, entity_id)
}

#[must_use]
pub fn user_dragging_card<'a>(others: &'a [Participant], card_id: &str) -> Option<&'a ParticipantUser> {
    dragging_of_kind(others, Some(DragKind::Card), card_id)
}

#[must_use]
pub fn user_dragging_list<'a>(others: &'a [Participant], list_id: &str) -> Option<&'a ParticipantUser> {
    dragging_of_kind(others, Some(DragKind::List), list_id)
}

fn dragging_of_kind<'a>(
    others: &'a [Participant],
    kind: Option<DragKind>,
    entity_id: &str,
) -> Option<&'a ParticipantUser> {
    others
        .iter()
        .find(|p| p.presence.is_dragging_entity(kind, entity_id))
        .map(|p| &p.user)
}

#[must_use]
pub fn is_editing_by_others(others: &[Participant], card_id: &str) -> bool {
    user_editing(others, card_id).is_some()
}

#[must_use]
pub fn user_editing<'a>(others: &'a [Participant], card_id: &str) -> Option<&'a ParticipantUser> {
    others
        .iter()
        .find(|p| p.presence.is_editing(card_id))
        .map(|p| &p.user)
}

/// Field another participant is editing on `card_id`, if any.
#[must_use]
pub fn editing_field_by_others<'a>(others: &'a [Participant], card_id: &str) -> Option<&'a str> {
    others
        .iter()
        .find(|p| p.presence.is_editing(card_id))
        .and_then(|p| p.presence.editing_field.as_deref())
}

/// Everything a card renderer needs in one pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CardIndicators {
    pub dragged_by: Option<ParticipantUser>,
    pub edited_by: Option<ParticipantUser>,
    pub editing_field: Option<String>,
    /// Everyone who has the card selected, in join order.
    pub selected_by: Vec<ParticipantUser>,
}

impl CardIndicators {
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.dragged_by.is_some() || self.edited_by.is_some()
    }
}

#[must_use]
pub fn card_indicators(others: &[Participant], card_id: &str) -> CardIndicators {
    CardIndicators {
        dragged_by: user_dragging_card(others, card_id).cloned(),
        edited_by: user_editing(others, card_id).cloned(),
        editing_field: editing_field_by_others(others, card_id).map(ToOwned::to_owned),
        selected_by: others
            .iter()
            .filter(|p| p.presence.selected_card_id.as_deref() == Some(card_id))
            .map(|p| p.user.clone())
            .collect(),
    }
}

#[cfg(test)]
#[path = "indicators_test.rs"]
mod tests;
