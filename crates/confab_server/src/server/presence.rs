#![forbid(unsafe_code)]

use chrono::Utc;
use confab_domain::{RoomId, UserId};
use confab_protocol::{HuddleParticipant, PresenceEntry, PresencePayload, UserSnapshot};
use serde_json::Value;
use tracing::warn;

use crate::server::store::{StateStore, StoreResult, TtlSettings, keys};

/// Mark the user online in the global set and return the current snapshot.
pub async fn add_online(store: &StateStore, ttls: &TtlSettings, user_id: UserId) -> StoreResult<Vec<UserId>> {
	store
		.set_add(keys::GLOBAL_ONLINE_USERS, user_id.as_i64(), ttls.online_secs)
		.await?;
	online_users(store).await
}

/// TTL-refreshing re-add, used by heartbeats and the presence refresher.
pub async fn refresh_online(store: &StateStore, ttls: &TtlSettings, user_id: UserId) -> StoreResult<()> {
	store
		.set_add(keys::GLOBAL_ONLINE_USERS, user_id.as_i64(), ttls.online_secs)
		.await
}

pub async fn remove_online(store: &StateStore, user_id: UserId) -> StoreResult<()> {
	store.set_remove(keys::GLOBAL_ONLINE_USERS, user_id.as_i64()).await
}

pub async fn online_users(store: &StateStore) -> StoreResult<Vec<UserId>> {
	let members = store.set_members(keys::GLOBAL_ONLINE_USERS).await?;
	Ok(members.into_iter().map(UserId).collect())
}

pub async fn is_online(store: &StateStore, user_id: UserId) -> StoreResult<bool> {
	store.set_is_member(keys::GLOBAL_ONLINE_USERS, user_id.as_i64()).await
}

/// Write the caller's presence entry for a room and return the roster
/// payload for the subscribe reply.
pub async fn mark_presence(
	store: &StateStore,
	ttls: &TtlSettings,
	room_id: RoomId,
	user: &UserSnapshot,
	roster_cap: usize,
) -> StoreResult<PresencePayload> {
	write_presence_entry(store, ttls, room_id, user).await?;
	roster_payload(store, room_id, roster_cap).await
}

/// TTL-refreshing rewrite of the caller's presence entry.
pub async fn refresh_room_presence(
	store: &StateStore,
	ttls: &TtlSettings,
	room_id: RoomId,
	user: &UserSnapshot,
) -> StoreResult<()> {
	write_presence_entry(store, ttls, room_id, user).await
}

async fn write_presence_entry(
	store: &StateStore,
	ttls: &TtlSettings,
	room_id: RoomId,
	user: &UserSnapshot,
) -> StoreResult<()> {
	let entry = PresenceEntry {
		id: user.id,
		name: user.name.clone(),
		avatar: user.avatar.clone(),
		last_seen: Utc::now().to_rfc3339(),
	};
	let raw = serde_json::to_string(&entry).expect("presence entry is always serializable");

	store
		.hash_put(&keys::presence(room_id), &user.id.to_string(), &raw, ttls.presence_secs)
		.await
}

/// Current roster for a room. Rosters above `roster_cap` are truncated in
/// the payload; `count` stays accurate.
pub async fn roster_payload(store: &StateStore, room_id: RoomId, roster_cap: usize) -> StoreResult<PresencePayload> {
	let values = store.hash_values(&keys::presence(room_id)).await?;

	let mut users = Vec::with_capacity(values.len().min(roster_cap));
	let mut count = 0usize;
	for raw in &values {
		match serde_json::from_str::<PresenceEntry>(raw) {
			Ok(entry) => {
				count += 1;
				if users.len() < roster_cap {
					users.push(entry);
				}
			}
			Err(e) => warn!(room_id = room_id.as_i64(), error = %e, "skipping unreadable presence entry"),
		}
	}

	Ok(PresencePayload {
		count,
		users,
		truncated: count > roster_cap,
	})
}

/// Remove the user's presence entry, returning it when one was present.
/// The caller broadcasts a leave only for an actual removal.
pub async fn remove_presence(store: &StateStore, room_id: RoomId, user_id: UserId) -> StoreResult<Option<PresenceEntry>> {
	let key = keys::presence(room_id);
	let field = user_id.to_string();

	let Some(raw) = store.hash_get(&key, &field).await? else {
		return Ok(None);
	};
	store.hash_del(&key, &field).await?;

	Ok(serde_json::from_str(&raw).ok())
}

pub async fn is_user_in_room(store: &StateStore, room_id: RoomId, user_id: UserId) -> StoreResult<bool> {
	store.hash_exists(&keys::presence(room_id), &user_id.to_string()).await
}

pub async fn set_typing(
	store: &StateStore,
	ttls: &TtlSettings,
	room_id: RoomId,
	user_id: UserId,
	is_typing: bool,
) -> StoreResult<()> {
	let key = keys::typing(room_id);
	let field = user_id.to_string();

	if is_typing {
		let now = Utc::now().timestamp().to_string();
		store.hash_put(&key, &field, &now, ttls.typing_secs).await
	} else {
		store.hash_del(&key, &field).await
	}
}

pub async fn clear_typing(store: &StateStore, room_id: RoomId, user_id: UserId) -> StoreResult<()> {
	store.hash_del(&keys::typing(room_id), &user_id.to_string()).await
}

pub async fn note_state(store: &StateStore, room_id: RoomId) -> StoreResult<Option<String>> {
	store.kv_get(&keys::note(room_id)).await
}

pub async fn set_note(store: &StateStore, ttls: &TtlSettings, room_id: RoomId, content: &str) -> StoreResult<()> {
	store.kv_set_ex(&keys::note(room_id), content, ttls.note_secs).await
}

/// All live cursors for a room, keyed by user id.
pub async fn cursor_state(store: &StateStore, room_id: RoomId) -> StoreResult<serde_json::Map<String, Value>> {
	let entries = store.hash_all(&keys::cursors(room_id)).await?;

	let mut cursors = serde_json::Map::with_capacity(entries.len());
	for (field, raw) in entries {
		match serde_json::from_str::<Value>(&raw) {
			Ok(value) => {
				cursors.insert(field, value);
			}
			Err(e) => warn!(room_id = room_id.as_i64(), error = %e, "skipping unreadable cursor entry"),
		}
	}

	Ok(cursors)
}

pub async fn set_cursor(
	store: &StateStore,
	ttls: &TtlSettings,
	room_id: RoomId,
	user_id: UserId,
	cursor: &Value,
) -> StoreResult<()> {
	let raw = serde_json::to_string(cursor).expect("cursor value is always serializable");
	store
		.hash_put(&keys::cursors(room_id), &user_id.to_string(), &raw, ttls.cursor_secs)
		.await
}

/// Current huddle roster for a room.
pub async fn huddle_roster(store: &StateStore, room_id: RoomId) -> StoreResult<Vec<HuddleParticipant>> {
	let values = store.hash_values(&keys::huddle(room_id)).await?;

	let mut participants = Vec::with_capacity(values.len());
	for raw in &values {
		match serde_json::from_str::<HuddleParticipant>(raw) {
			Ok(entry) => participants.push(entry),
			Err(e) => warn!(room_id = room_id.as_i64(), error = %e, "skipping unreadable huddle entry"),
		}
	}

	Ok(participants)
}
