#![forbid(unsafe_code)]

use std::time::Duration;

use crate::server::store::{StateStore, StoreOp};

#[tokio::test(start_paused = true)]
async fn hash_entries_expire_without_refresh() {
	let store = StateStore::in_memory();

	store.hash_put("chat:presence:1", "7", "{}", 300).await.unwrap();
	assert!(store.hash_exists("chat:presence:1", "7").await.unwrap());

	tokio::time::advance(Duration::from_secs(301)).await;
	assert!(!store.hash_exists("chat:presence:1", "7").await.unwrap());
	assert!(store.hash_values("chat:presence:1").await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn refresh_extends_ttl() {
	let store = StateStore::in_memory();

	store.hash_put("chat:presence:1", "7", "{}", 300).await.unwrap();
	tokio::time::advance(Duration::from_secs(200)).await;

	store.hash_put("chat:presence:1", "7", "{}", 300).await.unwrap();
	tokio::time::advance(Duration::from_secs(200)).await;

	assert!(store.hash_exists("chat:presence:1", "7").await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn set_members_and_expiry() {
	let store = StateStore::in_memory();

	store.set_add("global:online_users", 7, 300).await.unwrap();
	store.set_add("global:online_users", 9, 300).await.unwrap();
	assert_eq!(store.set_members("global:online_users").await.unwrap(), vec![7, 9]);
	assert!(store.set_is_member("global:online_users", 9).await.unwrap());

	store.set_remove("global:online_users", 9).await.unwrap();
	assert!(!store.set_is_member("global:online_users", 9).await.unwrap());

	tokio::time::advance(Duration::from_secs(301)).await;
	assert!(store.set_members("global:online_users").await.unwrap().is_empty());
}

#[tokio::test]
async fn kv_roundtrip_and_delete() {
	let store = StateStore::in_memory();

	store.kv_set_ex("chat:note:1", "shared text", 7200).await.unwrap();
	assert_eq!(store.kv_get("chat:note:1").await.unwrap().as_deref(), Some("shared text"));
	assert!(store.exists("chat:note:1").await.unwrap());

	store.delete("chat:note:1").await.unwrap();
	assert_eq!(store.kv_get("chat:note:1").await.unwrap(), None);
}

#[tokio::test]
async fn pipeline_deletes_multiple_keys() {
	let store = StateStore::in_memory();

	store.kv_set_ex("chat:huddle:1:sfu_active", "1", 3600).await.unwrap();
	store.hash_put("chat:huddle:1:sfu_sessions", "7", "sid", 3600).await.unwrap();
	store.hash_put("chat:huddle:1:sfu_tracks", "7_audio_0", "{}", 3600).await.unwrap();

	store
		.pipeline(&[
			StoreOp::Delete("chat:huddle:1:sfu_active".to_string()),
			StoreOp::Delete("chat:huddle:1:sfu_sessions".to_string()),
			StoreOp::Delete("chat:huddle:1:sfu_tracks".to_string()),
		])
		.await
		.unwrap();

	assert!(!store.exists("chat:huddle:1:sfu_active").await.unwrap());
	assert!(!store.exists("chat:huddle:1:sfu_sessions").await.unwrap());
	assert!(!store.exists("chat:huddle:1:sfu_tracks").await.unwrap());
}
