#![forbid(unsafe_code)]

use confab_domain::{RoomId, UserId};
use confab_protocol::UserSnapshot;

use crate::server::presence;
use crate::server::store::{StateStore, TtlSettings};

fn snapshot(id: i64) -> UserSnapshot {
	UserSnapshot {
		id: UserId(id),
		name: format!("user-{id}"),
		avatar: None,
	}
}

#[tokio::test]
async fn roster_payload_truncates_above_cap() {
	let store = StateStore::in_memory();
	let ttls = TtlSettings::default();
	let room = RoomId(42);

	for id in 0..60 {
		presence::refresh_room_presence(&store, &ttls, room, &snapshot(id)).await.unwrap();
	}

	let payload = presence::roster_payload(&store, room, 50).await.unwrap();
	assert_eq!(payload.count, 60);
	assert_eq!(payload.users.len(), 50);
	assert!(payload.truncated);

	let small = presence::roster_payload(&store, room, 100).await.unwrap();
	assert_eq!(small.count, 60);
	assert_eq!(small.users.len(), 60);
	assert!(!small.truncated);
}

#[tokio::test]
async fn remove_presence_reports_prior_entry_exactly_once() {
	let store = StateStore::in_memory();
	let ttls = TtlSettings::default();
	let room = RoomId(42);

	presence::refresh_room_presence(&store, &ttls, room, &snapshot(7)).await.unwrap();

	let removed = presence::remove_presence(&store, room, UserId(7)).await.unwrap();
	assert_eq!(removed.expect("entry was present").id, UserId(7));

	let removed_again = presence::remove_presence(&store, room, UserId(7)).await.unwrap();
	assert!(removed_again.is_none());
}

#[tokio::test]
async fn typing_state_follows_flag() {
	let store = StateStore::in_memory();
	let ttls = TtlSettings::default();
	let room = RoomId(42);

	presence::set_typing(&store, &ttls, room, UserId(7), true).await.unwrap();
	assert!(store.hash_exists("chat:typing:42", "7").await.unwrap());

	presence::set_typing(&store, &ttls, room, UserId(7), false).await.unwrap();
	assert!(!store.hash_exists("chat:typing:42", "7").await.unwrap());
}

#[tokio::test]
async fn online_set_roundtrip() {
	let store = StateStore::in_memory();
	let ttls = TtlSettings::default();

	let online = presence::add_online(&store, &ttls, UserId(7)).await.unwrap();
	assert_eq!(online, vec![UserId(7)]);
	assert!(presence::is_online(&store, UserId(7)).await.unwrap());

	presence::remove_online(&store, UserId(7)).await.unwrap();
	assert!(!presence::is_online(&store, UserId(7)).await.unwrap());
}

#[tokio::test]
async fn cursor_state_maps_user_ids_to_payloads() {
	let store = StateStore::in_memory();
	let ttls = TtlSettings::default();
	let room = RoomId(42);

	let cursor = serde_json::json!({"line": 3, "col": 14});
	presence::set_cursor(&store, &ttls, room, UserId(7), &cursor).await.unwrap();

	let cursors = presence::cursor_state(&store, room).await.unwrap();
	assert_eq!(cursors.get("7"), Some(&cursor));
}
