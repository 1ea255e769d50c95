use super::*;
use crate::services::access::AccessDirectory;

#[tokio::test]
async fn test_app_state_starts_with_no_rooms() {
    let (state, _directory) = test_helpers::test_app_state();
    assert_eq!(state.rooms.room_count().await, 0);
}

#[tokio::test]
async fn seed_member_registers_session_and_membership() {
    let (state, directory) = test_helpers::test_app_state();
    let user = test_helpers::seed_member(&directory, "tok", "Ada", "b1");

    let found = state.directory.authenticate("tok").await.expect("auth");
    assert_eq!(found, Some(user.clone()));
    assert!(state.directory.is_board_member(user.id, "b1").await.expect("member"));
}

#[test]
fn clones_share_config() {
    let (state, _directory) = test_helpers::test_app_state();
    let cloned = state.clone();
    assert!(Arc::ptr_eq(&state.config, &cloned.config));
}
