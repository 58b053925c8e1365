#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use confab_domain::{RoomId, UserId};
use confab_sfu::SecretString;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::server::auth::{AuthClaims, AuthVerifier, mint_hmac_token};
use crate::server::connection::{CLOSE_BAD_TOKEN, Flow, OutboundFrame, Session};
use crate::server::group_hub::{GroupHub, GroupHubConfig, GroupMember};
use crate::server::repo::ChatRepo;
use crate::server::store::StateStore;
use crate::server::{GatewaySettings, ServerContext};

const SECRET: &str = "test-secret";

async fn test_ctx() -> Arc<ServerContext> {
	Arc::new(ServerContext {
		store: StateStore::in_memory(),
		repo: ChatRepo::connect("sqlite::memory:").await.expect("connect sqlite"),
		hub: GroupHub::local(GroupHubConfig::default()),
		verifier: AuthVerifier::new(SecretString::new(SECRET)),
		sfu: None,
		settings: GatewaySettings::default(),
	})
}

fn token_for(user_id: UserId, name: &str) -> String {
	let exp = std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.unwrap()
		.as_secs() + 3600;
	mint_hmac_token(
		&AuthClaims {
			sub: user_id.as_i64(),
			name: name.to_string(),
			avatar: None,
			exp,
		},
		SECRET,
	)
}

async fn next_frame(rx: &mut mpsc::Receiver<OutboundFrame>) -> Value {
	let frame = timeout(Duration::from_millis(250), rx.recv())
		.await
		.expect("expected a frame within timeout")
		.expect("channel open");
	match frame {
		OutboundFrame::Text(text) => serde_json::from_str(&text).expect("valid frame json"),
		other => panic!("expected Text frame, got: {other:?}"),
	}
}

async fn assert_quiet(rx: &mut mpsc::Receiver<OutboundFrame>) {
	assert!(
		timeout(Duration::from_millis(50), rx.recv()).await.is_err(),
		"expected no further frames"
	);
}

/// Authenticated session plus its outbound frame receiver; the
/// `auth.success` frame is already drained.
async fn authed_session(
	ctx: &Arc<ServerContext>,
	conn_id: u64,
	user_id: UserId,
	name: &str,
) -> (Session, mpsc::Receiver<OutboundFrame>) {
	let (tx, mut rx) = mpsc::channel(64);
	let mut session = Session::for_tests(conn_id, Arc::clone(ctx), tx);

	let flow = session
		.on_text(&format!(r#"{{"type":"auth","token":"{}"}}"#, token_for(user_id, name)))
		.await;
	assert!(matches!(flow, Flow::Continue), "auth should keep the connection open");

	let frame = next_frame(&mut rx).await;
	assert_eq!(frame["type"], "auth.success");
	assert_eq!(frame["user"]["id"], user_id.as_i64());

	(session, rx)
}

async fn subscribe(session: &mut Session, rx: &mut mpsc::Receiver<OutboundFrame>, room_id: RoomId) -> Value {
	let flow = session
		.on_text(&format!(r#"{{"type":"chat.subscribe","room_id":{room_id}}}"#))
		.await;
	assert!(matches!(flow, Flow::Continue));

	let subscribed = next_frame(rx).await;
	assert_eq!(subscribed["type"], "chat.subscribed");

	// Own join broadcast arrives through the room group.
	let join = next_frame(rx).await;
	assert_eq!(join["type"], "chat.presence_update");
	assert_eq!(join["action"], "join");

	subscribed
}

#[tokio::test]
async fn events_before_auth_get_auth_required_and_no_handler_runs() {
	let ctx = test_ctx().await;
	let (tx, mut rx) = mpsc::channel(64);
	let mut session = Session::for_tests(1, Arc::clone(&ctx), tx);

	for frame in [
		r#"{"type":"chat.subscribe","room_id":42}"#,
		r#"{"type":"ping"}"#,
		r#"{"type":"huddle.join","room_id":42}"#,
	] {
		let flow = session.on_text(frame).await;
		assert!(matches!(flow, Flow::Continue));

		let reply = next_frame(&mut rx).await;
		assert_eq!(reply["type"], "error");
		assert_eq!(reply["code"], "AUTH_REQUIRED");
	}

	assert_eq!(ctx.hub.member_count("chat_42").await, 0);
}

#[tokio::test]
async fn malformed_json_keeps_connection_open() {
	let ctx = test_ctx().await;
	let (tx, mut rx) = mpsc::channel(64);
	let mut session = Session::for_tests(1, ctx, tx);

	let flow = session.on_text("{not json").await;
	assert!(matches!(flow, Flow::Continue));

	let reply = next_frame(&mut rx).await;
	assert_eq!(reply["type"], "error");
	assert_eq!(reply["code"], "INVALID_EVENT");
}

#[tokio::test]
async fn invalid_token_closes_with_4001() {
	let ctx = test_ctx().await;
	let (tx, mut rx) = mpsc::channel(64);
	let mut session = Session::for_tests(1, ctx, tx);

	let flow = session.on_text(r#"{"type":"auth","token":"v1.bogus.bogus"}"#).await;
	match flow {
		Flow::Close { code, .. } => assert_eq!(code, CLOSE_BAD_TOKEN),
		other => panic!("expected close, got: {other:?}"),
	}

	let reply = next_frame(&mut rx).await;
	assert_eq!(reply["type"], "auth.error");
}

#[tokio::test]
async fn subscribe_is_gated_on_room_and_participation() {
	let ctx = test_ctx().await;
	let ada = ctx.repo.create_user("ada", None).await.unwrap();
	let brin = ctx.repo.create_user("brin", None).await.unwrap();
	let outsider = ctx.repo.create_user("outsider", None).await.unwrap();
	let room = ctx.repo.create_room(None, false, ada, &[brin]).await.unwrap();
	let room_id = RoomId(room.id);

	// Unknown room.
	let (mut session, mut rx) = authed_session(&ctx, 1, ada, "ada").await;
	session.on_text(r#"{"type":"chat.subscribe","room_id":999}"#).await;
	let reply = next_frame(&mut rx).await;
	assert_eq!(reply["code"], "ROOM_NOT_FOUND");

	// Non-participant: exactly one error, no group membership.
	let (mut outsider_session, mut outsider_rx) = authed_session(&ctx, 2, outsider, "outsider").await;
	outsider_session
		.on_text(&format!(r#"{{"type":"chat.subscribe","room_id":{room_id}}}"#))
		.await;
	let reply = next_frame(&mut outsider_rx).await;
	assert_eq!(reply["code"], "NOT_PARTICIPANT");
	assert_quiet(&mut outsider_rx).await;
	assert_eq!(ctx.hub.member_count(&format!("chat_{room_id}")).await, 0);

	// ada observed the outsider coming online in the meantime.
	let online = next_frame(&mut rx).await;
	assert_eq!(online["type"], "global.user_online");

	// Participant: subscribed with a presence payload of one.
	let subscribed = subscribe(&mut session, &mut rx, room_id).await;
	assert_eq!(subscribed["room_id"], room_id.as_i64());
	assert_eq!(subscribed["presence"]["count"], 1);
	assert_eq!(subscribed["presence"]["truncated"], false);
	assert_eq!(ctx.hub.member_count(&format!("chat_{room_id}")).await, 1);
}

#[tokio::test]
async fn send_message_fans_out_to_subscribers() {
	let ctx = test_ctx().await;
	let ada = ctx.repo.create_user("ada", None).await.unwrap();
	let brin = ctx.repo.create_user("brin", None).await.unwrap();
	let room = ctx.repo.create_room(None, false, ada, &[brin]).await.unwrap();
	let room_id = RoomId(room.id);

	let (mut s1, mut rx1) = authed_session(&ctx, 1, ada, "ada").await;
	subscribe(&mut s1, &mut rx1, room_id).await;

	let (mut s2, mut rx2) = authed_session(&ctx, 2, brin, "brin").await;
	subscribe(&mut s2, &mut rx2, room_id).await;
	// s1 sees brin come online, then join the room.
	let online = next_frame(&mut rx1).await;
	assert_eq!(online["type"], "global.user_online");
	let join = next_frame(&mut rx1).await;
	assert_eq!(join["type"], "chat.presence_update");

	s1.on_text(&format!(
		r#"{{"type":"chat.send_message","room_id":{room_id},"content":"hi","client_id":"opt-9"}}"#
	))
	.await;

	for rx in [&mut rx1, &mut rx2] {
		let message = next_frame(rx).await;
		assert_eq!(message["type"], "chat.message");
		assert_eq!(message["room_id"], room_id.as_i64());
		assert_eq!(message["message"]["content"], "hi");
		assert_eq!(message["message"]["sender"]["id"], ada.as_i64());
	}

	// The optimistic id only goes back out with the broadcast payload.
	let stored = ctx.repo.unread_notifications(brin).await.unwrap();
	assert!(stored.is_empty(), "present subscribers get no durable notification");
}

#[tokio::test]
async fn absent_participants_get_coalesced_or_ephemeral_notifications() {
	let ctx = test_ctx().await;
	let ada = ctx.repo.create_user("ada", None).await.unwrap();
	let brin = ctx.repo.create_user("brin", None).await.unwrap();
	let cleo = ctx.repo.create_user("cleo", None).await.unwrap();
	let room = ctx.repo.create_room(Some("trio"), true, ada, &[brin, cleo]).await.unwrap();
	let room_id = RoomId(room.id);

	let (mut s1, mut rx1) = authed_session(&ctx, 1, ada, "ada").await;
	subscribe(&mut s1, &mut rx1, room_id).await;

	// brin is online (in the global set and reachable via their inbox
	// group) but not watching the room.
	crate::server::presence::add_online(&ctx.store, &ctx.settings.ttls, brin).await.unwrap();
	let (inbox_tx, mut inbox_rx) = mpsc::channel(16);
	ctx.hub
		.group_add(
			&format!("user_{}", brin.as_i64()),
			GroupMember {
				conn_id: 99,
				user_id: brin,
				tx: inbox_tx,
				overflow: Arc::new(tokio::sync::Notify::new()),
			},
		)
		.await;

	// cleo is fully offline.
	for _ in 0..2 {
		s1.on_text(&format!(r#"{{"type":"chat.send_message","room_id":{room_id},"content":"hello there"}}"#))
			.await;
		let _own_copy = next_frame(&mut rx1).await;
	}

	// Online-but-absent: transient inbox event with a preview.
	let notify = next_frame(&mut inbox_rx).await;
	assert_eq!(notify["type"], "global.new_message_notification");
	assert_eq!(notify["chat_room_id"], room_id.as_i64());
	assert_eq!(notify["sender_name"], "ada");
	assert_eq!(notify["message_content"], "hello there");
	assert_eq!(notify["has_attachment"], false);
	assert!(ctx.repo.unread_notifications(brin).await.unwrap().is_empty());

	// Offline: exactly one coalesced unread row despite two sends.
	let unread = ctx.repo.unread_notifications(cleo).await.unwrap();
	assert_eq!(unread.len(), 1);
	assert_eq!(unread[0].content, "New message from ada");
}

#[tokio::test]
async fn edits_by_non_senders_change_nothing_and_stay_silent() {
	let ctx = test_ctx().await;
	let ada = ctx.repo.create_user("ada", None).await.unwrap();
	let brin = ctx.repo.create_user("brin", None).await.unwrap();
	let room = ctx.repo.create_room(None, false, ada, &[brin]).await.unwrap();
	let room_id = RoomId(room.id);

	let (mut s1, mut rx1) = authed_session(&ctx, 1, ada, "ada").await;
	subscribe(&mut s1, &mut rx1, room_id).await;
	let (mut s2, mut rx2) = authed_session(&ctx, 2, brin, "brin").await;
	subscribe(&mut s2, &mut rx2, room_id).await;
	let _s2_online = next_frame(&mut rx1).await;
	let _s2_join = next_frame(&mut rx1).await;

	s1.on_text(&format!(r#"{{"type":"chat.send_message","room_id":{room_id},"content":"original"}}"#))
		.await;
	let sent = next_frame(&mut rx1).await;
	let message_id = sent["message"]["id"].as_i64().expect("message id");
	let _s2_copy = next_frame(&mut rx2).await;

	s2.on_text(&format!(
		r#"{{"type":"chat.edit_message","room_id":{room_id},"message_id":{message_id},"content":"hijacked"}}"#
	))
	.await;

	assert_quiet(&mut rx1).await;
	assert_quiet(&mut rx2).await;

	let row = ctx
		.repo
		.get_message(confab_domain::MessageId(message_id))
		.await
		.unwrap()
		.expect("row still present");
	assert_eq!(row.content, "original");

	s2.on_text(&format!(
		r#"{{"type":"chat.delete_message","room_id":{room_id},"message_id":{message_id}}}"#
	))
	.await;
	assert_quiet(&mut rx1).await;
	assert!(ctx.repo.get_message(confab_domain::MessageId(message_id)).await.unwrap().is_some());
}

#[tokio::test]
async fn teardown_is_idempotent_and_broadcasts_leave_once() {
	let ctx = test_ctx().await;
	let ada = ctx.repo.create_user("ada", None).await.unwrap();
	let brin = ctx.repo.create_user("brin", None).await.unwrap();
	let room = ctx.repo.create_room(None, false, ada, &[brin]).await.unwrap();
	let room_id = RoomId(room.id);

	let (mut s1, mut rx1) = authed_session(&ctx, 1, ada, "ada").await;
	subscribe(&mut s1, &mut rx1, room_id).await;

	let (mut s2, mut rx2) = authed_session(&ctx, 2, brin, "brin").await;
	subscribe(&mut s2, &mut rx2, room_id).await;

	s1.teardown().await;
	s1.teardown().await;

	let mut leaves = 0;
	let mut offlines = 0;
	while let Ok(Some(frame)) = timeout(Duration::from_millis(100), rx2.recv()).await {
		if let OutboundFrame::Text(text) = frame {
			let value: Value = serde_json::from_str(&text).unwrap();
			match value["type"].as_str() {
				Some("chat.presence_update") if value["action"] == "leave" => leaves += 1,
				Some("global.user_offline") if value["user_id"] == ada.as_i64() => offlines += 1,
				_ => {}
			}
		}
	}

	assert_eq!(leaves, 1, "exactly one leave broadcast for a double teardown");
	assert_eq!(offlines, 1, "exactly one offline broadcast for a double teardown");

	assert!(!crate::server::presence::is_online(&ctx.store, ada).await.unwrap());
	assert_eq!(ctx.hub.member_count(&format!("chat_{room_id}")).await, 1);

	s2.teardown().await;
}

#[tokio::test]
async fn huddle_roster_broadcasts_and_cleanup() {
	let ctx = test_ctx().await;
	let ada = ctx.repo.create_user("ada", None).await.unwrap();
	let brin = ctx.repo.create_user("brin", None).await.unwrap();
	let room = ctx.repo.create_room(None, false, ada, &[brin]).await.unwrap();
	let room_id = RoomId(room.id);

	let (mut s1, mut rx1) = authed_session(&ctx, 1, ada, "ada").await;
	subscribe(&mut s1, &mut rx1, room_id).await;

	s1.on_text(&format!(r#"{{"type":"huddle.join","room_id":{room_id}}}"#)).await;
	let roster = next_frame(&mut rx1).await;
	assert_eq!(roster["type"], "chat.huddle_participants");
	assert_eq!(roster["participants"].as_array().unwrap().len(), 1);

	// SFU not configured: no upgrade frame regardless of roster size.
	assert_quiet(&mut rx1).await;

	s1.on_text(r#"{"type":"huddle.leave"}"#).await;
	let roster = next_frame(&mut rx1).await;
	assert_eq!(roster["type"], "chat.huddle_participants");
	assert!(roster["participants"].as_array().unwrap().is_empty());

	// Last leaver clears all SFU keys for the room.
	assert!(!ctx.store.exists(&format!("chat:huddle:{room_id}:sfu_active")).await.unwrap());
	assert!(!ctx.store.exists(&format!("chat:huddle:{room_id}:sfu_sessions")).await.unwrap());
	assert!(!ctx.store.exists(&format!("chat:huddle:{room_id}:sfu_tracks")).await.unwrap());
}

#[tokio::test]
async fn signal_relays_to_target_inbox_only_while_in_huddle() {
	let ctx = test_ctx().await;
	let ada = ctx.repo.create_user("ada", None).await.unwrap();
	let brin = ctx.repo.create_user("brin", None).await.unwrap();
	let room = ctx.repo.create_room(None, false, ada, &[brin]).await.unwrap();
	let room_id = RoomId(room.id);

	let (mut s1, mut rx1) = authed_session(&ctx, 1, ada, "ada").await;
	subscribe(&mut s1, &mut rx1, room_id).await;
	let (mut s2, mut rx2) = authed_session(&ctx, 2, brin, "brin").await;
	subscribe(&mut s2, &mut rx2, room_id).await;
	let _s2_online = next_frame(&mut rx1).await;
	let _s2_join = next_frame(&mut rx1).await;

	// Not in a huddle yet: silently dropped.
	s1.on_text(&format!(
		r#"{{"type":"huddle.signal","target_id":{},"payload":{{"sdp":"x"}}}}"#,
		brin.as_i64()
	))
	.await;
	assert_quiet(&mut rx2).await;

	s1.on_text(&format!(r#"{{"type":"huddle.join","room_id":{room_id}}}"#)).await;
	let _roster_s1 = next_frame(&mut rx1).await;
	let _roster_s2 = next_frame(&mut rx2).await;

	s1.on_text(&format!(
		r#"{{"type":"huddle.signal","target_id":{},"payload":{{"sdp":"offer-sdp"}}}}"#,
		brin.as_i64()
	))
	.await;

	let signal = next_frame(&mut rx2).await;
	assert_eq!(signal["type"], "huddle.signal");
	assert_eq!(signal["room_id"], room_id.as_i64());
	assert_eq!(signal["from"]["id"], ada.as_i64());
	assert_eq!(signal["payload"]["sdp"], "offer-sdp");

	assert_quiet(&mut rx1).await;
}

#[tokio::test]
async fn ping_heartbeat_and_global_refresh() {
	let ctx = test_ctx().await;
	let ada = ctx.repo.create_user("ada", None).await.unwrap();
	let (mut session, mut rx) = authed_session(&ctx, 1, ada, "ada").await;

	session.on_text(r#"{"type":"ping"}"#).await;
	let pong = next_frame(&mut rx).await;
	assert_eq!(pong["type"], "pong");
	assert!(pong["timestamp"].as_i64().is_some());

	session.on_text(r#"{"type":"presence.heartbeat"}"#).await;
	let ack = next_frame(&mut rx).await;
	assert_eq!(ack["type"], "presence.ack");

	session.on_text(r#"{"type":"global.refresh"}"#).await;
	let online = next_frame(&mut rx).await;
	assert_eq!(online["type"], "global.online_users");
	assert_eq!(online["online_users"], serde_json::json!([ada.as_i64()]));
}

#[tokio::test]
async fn unsubscribe_leaves_room_and_replies() {
	let ctx = test_ctx().await;
	let ada = ctx.repo.create_user("ada", None).await.unwrap();
	let brin = ctx.repo.create_user("brin", None).await.unwrap();
	let room = ctx.repo.create_room(None, false, ada, &[brin]).await.unwrap();
	let room_id = RoomId(room.id);

	let (mut session, mut rx) = authed_session(&ctx, 1, ada, "ada").await;
	subscribe(&mut session, &mut rx, room_id).await;

	session
		.on_text(&format!(r#"{{"type":"chat.unsubscribe","room_id":{room_id}}}"#))
		.await;

	let reply = next_frame(&mut rx).await;
	assert_eq!(reply["type"], "chat.unsubscribed");
	assert_eq!(ctx.hub.member_count(&format!("chat_{room_id}")).await, 0);
	assert!(
		!crate::server::presence::is_user_in_room(&ctx.store, room_id, ada).await.unwrap(),
		"presence entry removed on unsubscribe"
	);
}
