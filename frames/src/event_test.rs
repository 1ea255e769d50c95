use super::*;
use serde_json::json;

#[test]
fn card_moved_uses_screaming_tag_and_camel_case_fields() {
    let event = RoomEvent::CardMoved {
        card_id: "c1".into(),
        from_list_id: Some("l1".into()),
        to_list_id: Some("l2".into()),
        position: Some(3.5),
    };
    let value = serde_json::to_value(&event).expect("serialize");

    assert_eq!(value["type"], "CARD_MOVED");
    assert_eq!(value["cardId"], "c1");
    assert_eq!(value["fromListId"], "l1");
    assert_eq!(value["toListId"], "l2");
}

#[test]
fn minimal_card_moved_decodes_with_optional_fields_missing() {
    let event: RoomEvent = serde_json::from_value(json!({"type": "CARD_MOVED", "cardId": "c1"})).expect("decode");
    assert_eq!(
        event,
        RoomEvent::CardMoved { card_id: "c1".into(), from_list_id: None, to_list_id: None, position: None }
    );
}

#[test]
fn unknown_type_fails_to_decode() {
    let result = serde_json::from_value::<RoomEvent>(json!({"type": "CARD_TELEPORTED", "cardId": "c1"}));
    assert!(result.is_err());
}

#[test]
fn missing_required_field_fails_to_decode() {
    let result = serde_json::from_value::<RoomEvent>(json!({"type": "ATTACHMENT_ADDED", "cardId": "c1"}));
    assert!(result.is_err());
}

#[test]
fn kind_matches_wire_tag() {
    let events = [
        RoomEvent::BoardUpdated { board_id: "b".into() },
        RoomEvent::ChecklistItemToggled { card_id: "c".into(), checklist_id: "k".into(), item_id: "i".into() },
        RoomEvent::ReactionRemoved { card_id: "c".into(), comment_id: "m".into(), emoji: "+1".into() },
        RoomEvent::MemberRoleChanged { member_id: "u".into(), role: "admin".into() },
    ];
    for event in events {
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["type"], event.kind());
    }
}

#[test]
fn envelope_flattens_event_next_to_sender_fields() {
    let user_id = Uuid::new_v4();
    let envelope = EventEnvelope::new(RoomEvent::CardUpdated { card_id: "c1".into() }, user_id, 1_700_000_000_000);
    let value = serde_json::to_value(&envelope).expect("serialize");

    assert_eq!(
        value,
        json!({
            "type": "CARD_UPDATED",
            "cardId": "c1",
            "userId": user_id.to_string(),
            "timestamp": 1_700_000_000_000_i64,
        })
    );

    let restored: EventEnvelope = serde_json::from_value(value).expect("decode");
    assert_eq!(restored, envelope);
}

#[test]
fn card_moved_between_lists_refreshes_both_lists_and_card() {
    let event = RoomEvent::CardMoved {
        card_id: "c1".into(),
        from_list_id: Some("l1".into()),
        to_list_id: Some("l2".into()),
        position: None,
    };
    assert_eq!(
        event.refresh_targets(),
        vec![
            RefreshTarget::Card("c1".into()),
            RefreshTarget::List("l1".into()),
            RefreshTarget::List("l2".into())
        ]
    );
}

#[test]
fn card_moved_within_one_list_refreshes_it_once() {
    let event = RoomEvent::CardMoved {
        card_id: "c1".into(),
        from_list_id: Some("l1".into()),
        to_list_id: Some("l1".into()),
        position: Some(1.0),
    };
    assert_eq!(event.refresh_targets(), vec![RefreshTarget::Card("c1".into()), RefreshTarget::List("l1".into())]);
}

#[test]
fn card_moved_without_lists_falls_back_to_all_lists() {
    let event = RoomEvent::CardMoved { card_id: "c1".into(), from_list_id: None, to_list_id: None, position: None };
    assert_eq!(event.refresh_targets(), vec![RefreshTarget::Card("c1".into()), RefreshTarget::Lists]);
}

#[test]
fn comment_events_also_refresh_activity() {
    let event = RoomEvent::CommentAdded { card_id: "c1".into(), comment_id: "m1".into() };
    assert_eq!(event.refresh_targets(), vec![RefreshTarget::Card("c1".into()), RefreshTarget::Activity]);
}

#[test]
fn member_and_label_events_refresh_collections() {
    assert_eq!(RoomEvent::MemberAdded { member_id: "u".into() }.refresh_targets(), vec![RefreshTarget::Members]);
    assert_eq!(RoomEvent::LabelDeleted { label_id: "l".into() }.refresh_targets(), vec![RefreshTarget::Labels]);
}
