//! Shared document: the room's replicated cache of lists and cards.
//!
//! DESIGN
//! ======
//! The document only shortens perceived latency for moves and renames. The
//! relational store stays the system of record; clients still confirm every
//! change through ordinary server mutations.
//!
//! Merge rule is per-entity last-writer-wins guarded by a version counter,
//! the same rule the server applies to board objects: an op carrying
//! `version < current` is stale and rejected, an accepted op bumps the
//! entity version by one and the document revision by one. The room actor
//! applies ops in arrival order, so every peer sees the same sequence of
//! `DocChange` values and converges on the same state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ErrorCode;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListEntry {
    pub id: String,
    pub title: String,
    pub position: f64,
    #[serde(default)]
    pub version: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardEntry {
    pub id: String,
    pub list_id: String,
    pub title: String,
    pub position: f64,
    #[serde(default)]
    pub version: u64,
}

/// Lists and cards keyed by id, plus a revision bumped on every accepted op.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedDocument {
    #[serde(default)]
    pub lists: BTreeMap<String, ListEntry>,
    #[serde(default)]
    pub cards: BTreeMap<String, CardEntry>,
    #[serde(default)]
    pub revision: u64,
}

/// A mutation of the shared document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum DocOp {
    UpsertList { list: ListEntry },
    UpsertCard { card: CardEntry },
    MoveList { list_id: String, position: f64, version: u64 },
    MoveCard { card_id: String, list_id: String, position: f64, version: u64 },
    RemoveList { list_id: String, version: u64 },
    RemoveCard { card_id: String, version: u64 },
}

/// An accepted op as broadcast to peers. Versions inside `op` are the
/// post-apply values, so peers can apply it without re-checking.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocChange {
    pub op: DocOp,
    pub revision: u64,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DocError {
    #[error("stale {entity} {id}: incoming version {incoming} < current {current}")]
    Stale { entity: &'static str, id: String, incoming: u64, current: u64 },
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("unknown list: {0}")]
    UnknownList(String),
    #[error("position must be finite")]
    InvalidPosition,
    #[error("{entity} {id} has exhausted its version counter")]
    VersionExhausted { entity: &'static str, id: String },
}

impl ErrorCode for DocError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Stale { .. } => "E_DOC_STALE",
            Self::NotFound { .. } => "E_DOC_NOT_FOUND",
            Self::UnknownList(_) => "E_DOC_UNKNOWN_LIST",
            Self::InvalidPosition => "E_DOC_INVALID",
            Self::VersionExhausted { .. } => "E_DOC_VERSION_EXHAUSTED",
        }
    }
}

// =============================================================================
// MERGE
// =============================================================================

fn check_version(entity: &'static str, id: &str, incoming: u64, current: u64) -> Result<(), DocError> {
    if incoming < current {
        return Err(DocError::Stale { entity, id: id.to_owned(), incoming, current });
    }
    Ok(())
}

fn next_version(entity: &'static str, id: &str, current: u64) -> Result<u64, DocError> {
    current.checked_add(1).ok_or_else(|| DocError::VersionExhausted { entity, id: id.to_owned() })
}

fn check_position(position: f64) -> Result<(), DocError> {
    if position.is_finite() { Ok(()) } else { Err(DocError::InvalidPosition) }
}

impl SharedDocument {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lists.is_empty() && self.cards.is_empty()
    }

    /// Apply an op authoritatively.
    ///
    /// # Errors
    ///
    /// Returns `Stale` for out-of-date versions, `NotFound` for moves and
    /// removals of unknown entities, `UnknownList` when a card would land in
    /// a list the document does not hold, and `InvalidPosition` for
    /// non-finite positions.
    pub fn apply(&mut self, op: DocOp) -> Result<DocChange, DocError> {
        let applied = match op {
            DocOp::UpsertList { mut list } => {
                check_position(list.position)?;
                list.version = match self.lists.get(&list.id) {
                    Some(current) => {
                        check_version("list", &list.id, list.version, current.version)?;
                        next_version("list", &list.id, current.version)?
                    }
                    None => 1,
                };
                self.lists.insert(list.id.clone(), list.clone());
                DocOp::UpsertList { list }
            }
            DocOp::UpsertCard { mut card } => {
                check_position(card.position)?;
                if !self.lists.contains_key(&card.list_id) {
                    return Err(DocError::UnknownList(card.list_id));
                }
                card.version = match self.cards.get(&card.id) {
                    Some(current) => {
                        check_version("card", &card.id, card.version, current.version)?;
                        next_version("card", &card.id, current.version)?
                    }
                    None => 1,
                };
                self.cards.insert(card.id.clone(), card.clone());
                DocOp::UpsertCard { card }
            }
            DocOp::MoveList { list_id, position, version } => {
                check_position(position)?;
                let list = self
                    .lists
                    .get_mut(&list_id)
                    .ok_or_else(|| DocError::NotFound { entity: "list", id: list_id.clone() })?;
                check_version("list", &list_id, version, list.version)?;
                list.version = next_version("list", &list_id, list.version)?;
                list.position = position;
                DocOp::MoveList { version: list.version, list_id, position }
            }
            DocOp::MoveCard { card_id, list_id, position, version } => {
                check_position(position)?;
                if !self.lists.contains_key(&list_id) {
                    return Err(DocError::UnknownList(list_id));
                }
                let card = self
                    .cards
                    .get_mut(&card_id)
                    .ok_or_else(|| DocError::NotFound { entity: "card", id: card_id.clone() })?;
                check_version("card", &card_id, version, card.version)?;
                card.version = next_version("card", &card_id, card.version)?;
                card.list_id.clone_from(&list_id);
                card.position = position;
                DocOp::MoveCard { version: card.version, card_id, list_id, position }
            }
            DocOp::RemoveList { list_id, version } => {
                let current = self
                    .lists
                    .get(&list_id)
                    .ok_or_else(|| DocError::NotFound { entity: "list", id: list_id.clone() })?
                    .version;
                check_version("list", &list_id, version, current)?;
                self.lists.remove(&list_id);
                self.cards.retain(|_, card| card.list_id != list_id);
                DocOp::RemoveList { list_id, version: current }
            }
            DocOp::RemoveCard { card_id, version } => {
                let current = self
                    .cards
                    .get(&card_id)
                    .ok_or_else(|| DocError::NotFound { entity: "card", id: card_id.clone() })?
                    .version;
                check_version("card", &card_id, version, current)?;
                self.cards.remove(&card_id);
                DocOp::RemoveCard { card_id, version: current }
            }
        };

        self.revision += 1;
        Ok(DocChange { op: applied, revision: self.revision })
    }

    /// Apply a change accepted elsewhere (by the room). No version checks.
    pub fn apply_remote(&mut self, change: &DocChange) {
        match &change.op {
            DocOp::UpsertList { list } => {
                self.lists.insert(list.id.clone(), list.clone());
            }
            DocOp::UpsertCard { card } => {
                self.cards.insert(card.id.clone(), card.clone());
            }
            DocOp::MoveList { list_id, position, version } => {
                if let Some(list) = self.lists.get_mut(list_id) {
                    list.position = *position;
                    list.version = *version;
                }
            }
            DocOp::MoveCard { card_id, list_id, position, version } => {
                if let Some(card) = self.cards.get_mut(card_id) {
                    card.list_id.clone_from(list_id);
                    card.position = *position;
                    card.version = *version;
                }
            }
            DocOp::RemoveList { list_id, .. } => {
                self.lists.remove(list_id);
                self.cards.retain(|_, card| &card.list_id != list_id);
            }
            DocOp::RemoveCard { card_id, .. } => {
                self.cards.remove(card_id);
            }
        }
        self.revision = self.revision.max(change.revision);
    }

    /// Replace contents with a seed snapshot. Every entity restarts at
    /// version 1; versions supplied by the seeder are ignored.
    pub fn seed(&mut self, mut seed: SharedDocument) {
        for list in seed.lists.values_mut() {
            list.version = 1;
        }
        seed.cards.retain(|_, card| seed.lists.contains_key(&card.list_id));
        for card in seed.cards.values_mut() {
            card.version = 1;
        }
        self.lists = seed.lists;
        self.cards = seed.cards;
        self.revision += 1;
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    /// Lists ordered by position, ties broken by id.
    #[must_use]
    pub fn ordered_lists(&self) -> Vec<&ListEntry> {
        let mut lists: Vec<&ListEntry> = self.lists.values().collect();
        lists.sort_by(|a, b| a.position.total_cmp(&b.position).then_with(|| a.id.cmp(&b.id)));
        lists
    }

    /// Cards of one list ordered by position, ties broken by id.
    #[must_use]
    pub fn cards_in_list(&self, list_id: &str) -> Vec<&CardEntry> {
        let mut cards: Vec<&CardEntry> = self
            .cards
            .values()
            .filter(|card| card.list_id == list_id)
            .collect();
        cards.sort_by(|a, b| a.position.total_cmp(&b.position).then_with(|| a.id.cmp(&b.id)));
        cards
    }
}

#[cfg(test)]
#[path = "document_test.rs"]
mod tests;
